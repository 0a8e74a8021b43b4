//! Sync - PollSession と PollingSynchronizer
//!
//! データフロー: activate → 即時 fetch → interval ごとに fetch → sequence 付与 →
//! apply（ViewModel が state machine に流す）→ deactivate で停止。

pub mod session;
pub mod synchronizer;

pub use self::session::PollSession;
pub use self::synchronizer::{ApplyFn, FailureFn, Fetch, FnFetch, Observation, PollingSynchronizer};
