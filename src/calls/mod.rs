//! Call reconciliation: normalization, record lifecycle, conversations.

pub mod backfill;
pub mod freeze;
pub mod ledger;
pub mod lifecycle;
pub mod model;
pub mod normalizer;
pub mod resolver;

pub use backfill::{BackfillReconciler, BackfillReport};
pub use freeze::{FreezeReport, FreezeScheduler, spawn_freeze_task};
pub use ledger::CallLedger;
pub use lifecycle::SyncState;
pub use model::{CallRecord, Conversation, RawCallEvent, UpsertOutcome};
pub use normalizer::BusinessLineRoster;
pub use resolver::{ConversationResolver, MergeReport};
