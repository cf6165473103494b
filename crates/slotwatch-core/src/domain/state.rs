//! State - タスクのライフサイクル（純粋な状態遷移）
//!
//! `transition(status, trigger)` は副作用を持たない。
//! 返ってきた `Effect` を実行するのはスケジューラ側。
//!
//! ```text
//! pending ──start──▶ active ──pause──▶ paused ──start──▶ active
//!                      │
//!                      ├──complete──▶ completed
//!                      └──fault─────▶ error ──start(restart)──▶ active
//! any ──delete──▶ deleted
//! ```

use chrono::{DateTime, Utc};

use super::errors::ErrorKind;
use super::events::{Event, EventKind, Severity};
use super::ids::TaskId;
use super::task::TaskStatus;

/// Why the scheduler wants to move a task.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Operator start (also the explicit restart out of `error`).
    Start,
    Pause,
    /// Detach the worker without touching the persisted status.
    Stop,
    Delete,
    Complete { reason: String },
    Fault { kind: ErrorKind, reason: String },
}

impl Trigger {
    pub fn name(&self) -> &'static str {
        match self {
            Trigger::Start => "start",
            Trigger::Pause => "pause",
            Trigger::Stop => "stop",
            Trigger::Delete => "delete",
            Trigger::Complete { .. } => "complete",
            Trigger::Fault { .. } => "fault",
        }
    }
}

/// Where a task ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Status(TaskStatus),
    Deleted,
}

/// Side effects the scheduler must carry out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    SpawnWorker,
    RetireWorker,
    PersistStatus(TaskStatus),
    RecordEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: TaskStatus,
    pub to: Lifecycle,
    pub effects: Vec<Effect>,
    pub reason: String,
}

impl Transition {
    fn new(from: TaskStatus, to: Lifecycle, effects: Vec<Effect>, reason: impl Into<String>) -> Self {
        Self {
            from,
            to,
            effects,
            reason: reason.into(),
        }
    }

    fn noop(from: TaskStatus) -> Self {
        Self::new(from, Lifecycle::Status(from), Vec::new(), "no-op")
    }

    pub fn is_noop(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn has(&self, effect: Effect) -> bool {
        self.effects.contains(&effect)
    }

    pub fn target_status(&self) -> Option<TaskStatus> {
        match self.to {
            Lifecycle::Status(status) => Some(status),
            Lifecycle::Deleted => None,
        }
    }

    /// Event describing this transition, if it is one worth recording.
    pub fn event(&self, task_id: TaskId, task_name: &str, now: DateTime<Utc>) -> Option<Event> {
        if !self.has(Effect::RecordEvent) {
            return None;
        }
        let to = self.target_status();
        let severity = match to {
            Some(TaskStatus::Error) => Severity::Error,
            Some(TaskStatus::Completed) => Severity::Success,
            _ => Severity::Info,
        };
        let to_label = to.map(|s| s.as_str()).unwrap_or("deleted");
        let message = format!(
            "task \"{task_name}\": {} -> {to_label} ({})",
            self.from, self.reason
        );
        Some(
            Event::new(
                severity,
                EventKind::StatusChanged {
                    from: self.from,
                    to,
                },
                message,
                now,
            )
            .for_task(task_id),
        )
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransitionError {
    #[error("cannot {trigger} a task in state {from}")]
    NotAllowed { from: TaskStatus, trigger: &'static str },
}

/// Pure transition function: (state, trigger) -> (state, effects).
pub fn transition(from: TaskStatus, trigger: &Trigger) -> Result<Transition, TransitionError> {
    use Effect::*;
    use TaskStatus::*;

    let not_allowed = || TransitionError::NotAllowed {
        from,
        trigger: trigger.name(),
    };

    let t = match (from, trigger) {
        (Pending, Trigger::Start) => Transition::new(
            from,
            Lifecycle::Status(Active),
            vec![PersistStatus(Active), RecordEvent, SpawnWorker],
            "started",
        ),
        (Paused, Trigger::Start) => Transition::new(
            from,
            Lifecycle::Status(Active),
            vec![PersistStatus(Active), RecordEvent, SpawnWorker],
            "resumed",
        ),
        (Error, Trigger::Start) => Transition::new(
            from,
            Lifecycle::Status(Active),
            vec![PersistStatus(Active), RecordEvent, SpawnWorker],
            "restarted by operator",
        ),
        // 永続化上は active だがワーカーがいない（プロセス再起動後など）
        (Active, Trigger::Start) => Transition::new(
            from,
            Lifecycle::Status(Active),
            vec![SpawnWorker],
            "worker attached",
        ),
        (Completed, Trigger::Start) => return Err(not_allowed()),

        (Active, Trigger::Pause) => Transition::new(
            from,
            Lifecycle::Status(Paused),
            vec![RetireWorker, PersistStatus(Paused), RecordEvent],
            "paused by operator",
        ),
        (_, Trigger::Pause) => Transition::noop(from),

        (_, Trigger::Stop) => Transition::new(
            from,
            Lifecycle::Status(from),
            vec![RetireWorker],
            "worker stopped",
        ),

        (_, Trigger::Delete) => Transition::new(
            from,
            Lifecycle::Deleted,
            vec![RetireWorker, RecordEvent],
            "deleted",
        ),

        (Active, Trigger::Complete { reason }) => Transition::new(
            from,
            Lifecycle::Status(Completed),
            vec![RetireWorker, PersistStatus(Completed), RecordEvent],
            reason.clone(),
        ),
        (_, Trigger::Complete { .. }) => return Err(not_allowed()),

        (Active, Trigger::Fault { reason, .. }) => Transition::new(
            from,
            Lifecycle::Status(Error),
            vec![RetireWorker, PersistStatus(Error), RecordEvent],
            reason.clone(),
        ),
        (_, Trigger::Fault { .. }) => return Err(not_allowed()),
    };
    Ok(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn fault() -> Trigger {
        Trigger::Fault {
            kind: ErrorKind::MarketplaceRejected,
            reason: "blocked".into(),
        }
    }

    #[rstest]
    #[case::start_pending(TaskStatus::Pending, Trigger::Start, TaskStatus::Active)]
    #[case::resume(TaskStatus::Paused, Trigger::Start, TaskStatus::Active)]
    #[case::restart(TaskStatus::Error, Trigger::Start, TaskStatus::Active)]
    #[case::pause(TaskStatus::Active, Trigger::Pause, TaskStatus::Paused)]
    #[case::fault(TaskStatus::Active, fault(), TaskStatus::Error)]
    #[case::complete(TaskStatus::Active, Trigger::Complete { reason: "window passed".into() }, TaskStatus::Completed)]
    fn allowed_transitions(#[case] from: TaskStatus, #[case] trigger: Trigger, #[case] to: TaskStatus) {
        let t = transition(from, &trigger).unwrap();
        assert_eq!(t.to, Lifecycle::Status(to));
        assert!(t.has(Effect::PersistStatus(to)));
        assert!(t.has(Effect::RecordEvent));
    }

    #[rstest]
    #[case::start_completed(TaskStatus::Completed, Trigger::Start)]
    #[case::fault_paused(TaskStatus::Paused, fault())]
    #[case::complete_pending(TaskStatus::Pending, Trigger::Complete { reason: "x".into() })]
    fn rejected_transitions(#[case] from: TaskStatus, #[case] trigger: Trigger) {
        assert!(transition(from, &trigger).is_err());
    }

    #[rstest]
    #[case::paused(TaskStatus::Paused)]
    #[case::pending(TaskStatus::Pending)]
    #[case::completed(TaskStatus::Completed)]
    #[case::error(TaskStatus::Error)]
    fn pausing_a_non_running_task_is_a_noop(#[case] from: TaskStatus) {
        let t = transition(from, &Trigger::Pause).unwrap();
        assert!(t.is_noop());
        assert_eq!(t.to, Lifecycle::Status(from));
    }

    #[test]
    fn start_on_active_only_attaches_a_worker() {
        let t = transition(TaskStatus::Active, &Trigger::Start).unwrap();
        assert_eq!(t.effects, vec![Effect::SpawnWorker]);
        assert!(t.event(TaskId::generate(), "t", Utc::now()).is_none());
    }

    #[test]
    fn stop_keeps_status() {
        let t = transition(TaskStatus::Active, &Trigger::Stop).unwrap();
        assert_eq!(t.to, Lifecycle::Status(TaskStatus::Active));
        assert_eq!(t.effects, vec![Effect::RetireWorker]);
    }

    #[test]
    fn delete_is_allowed_from_anywhere() {
        for from in [
            TaskStatus::Pending,
            TaskStatus::Active,
            TaskStatus::Paused,
            TaskStatus::Completed,
            TaskStatus::Error,
        ] {
            let t = transition(from, &Trigger::Delete).unwrap();
            assert_eq!(t.to, Lifecycle::Deleted);
            assert!(t.has(Effect::RetireWorker));
        }
    }

    #[test]
    fn error_transition_event_carries_reason() {
        let id = TaskId::generate();
        let t = transition(TaskStatus::Active, &fault()).unwrap();
        let event = t.event(id, "koledino boxes", Utc::now()).unwrap();
        assert_eq!(event.severity, Severity::Error);
        assert_eq!(event.task_id, Some(id));
        assert!(event.message.contains("blocked"));
        assert!(event.message.contains("active -> error"));
    }
}
