//! Domain model (IDs, records, state machine, errors, events).
//!
//! - ids: TaskId / AccountId / OwnerId
//! - task / account / slot: 外部コラボレータから受け取るスナップショットと一時データ
//! - state: 純粋な状態遷移関数
//! - errors / events / outcome: 失敗の分類、追記専用イベント、サイクル結果

pub mod account;
pub mod errors;
pub mod events;
pub mod ids;
pub mod outcome;
pub mod slot;
pub mod state;
pub mod task;

pub use account::{Account, SessionCredentials};
pub use errors::{ChannelError, ErrorKind, MarketplaceError, StoreError};
pub use events::{Event, EventKind, Severity};
pub use ids::{AccountId, OwnerId, TaskId};
pub use outcome::{CycleOutcome, CycleReport, SkipCause};
pub use slot::{BookingReceipt, Slot, SlotKey, SlotProvenance};
pub use state::{Effect, Lifecycle, Transition, TransitionError, Trigger, transition};
pub use task::{CriteriaError, Packaging, SearchCriteria, Task, TaskStatus};
