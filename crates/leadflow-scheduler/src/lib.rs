//! # LeadFlow Scheduler
//!
//! Rule-driven auto-transfer of idle leads between sales owners.
//! State lives in SQLite; the only timer is an hourly tokio sleep.
//!
//! ## Architecture
//! ```text
//! spawn_scheduler (top of every local hour)
//!   └── Scheduler::run_cycle → per enabled rule, serialised per rule
//!         ├── gate: disabled / outside execution window → skip
//!         ├── CandidateSelector → idle leads owned by source users (≤ 100)
//!         ├── allocate → balanced-random or weighted plan, no self-transfer
//!         ├── TransferExecutor → owner write, audit rows, quota ledger, hooks
//!         └── AuditNotifier → one notice per affected user
//!
//! PredictionService — same plan, never writes
//! RuleService       — validated admin surface over RuleStore / RecordStore
//! ```

pub mod allocation;
pub mod clock;
pub mod dispatch;
pub mod engine;
pub mod executor;
pub mod notify;
pub mod persistence;
pub mod predict;
pub mod rule;
pub mod rules;
pub mod selector;
pub mod store;
pub mod window;

#[cfg(test)]
mod testkit;

pub use engine::{CycleResult, Scheduler, SchedulerSettings, spawn_scheduler};
pub use notify::NotifyRouter;
pub use persistence::TransferDb;
pub use predict::{Prediction, PredictionService};
pub use rule::TransferRule;
pub use rules::{RuleDraft, RulePatch, RuleService};
