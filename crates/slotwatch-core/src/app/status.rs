//! Status - worker_status() の結果
//!
//! オペレータ向けのスナップショット。JSON にしてそのまま出せる。

use serde::Serialize;

use crate::domain::{CycleReport, TaskId};
use crate::ports::RateSaturation;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStatus {
    /// Tasks with a live worker, sorted.
    pub running: Vec<TaskId>,
    pub tasks: Vec<TaskWorkerStatus>,
    pub rate_limits: Vec<RateSaturation>,
    pub notification_channels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskWorkerStatus {
    pub task_id: TaskId,
    pub running: bool,
    pub interval_secs: u64,
    pub last_cycle: Option<CycleReport>,
}

impl WorkerStatus {
    pub fn task(&self, id: TaskId) -> Option<&TaskWorkerStatus> {
        self.tasks.iter().find(|t| t.task_id == id)
    }
}
