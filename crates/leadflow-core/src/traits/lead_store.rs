//! Lead store trait: the CRM collaborator the engine reads and writes.

use async_trait::async_trait;

use crate::error::Result;
use crate::lead::{AssignmentLog, Lead, LeadFilter, OwnerChange};

/// Logical operations the engine needs from the customer record store.
#[async_trait]
pub trait LeadStore: Send + Sync {
    /// Leads matching every clause of `filter`, at most `filter.limit`.
    async fn find(&self, filter: &LeadFilter) -> Result<Vec<Lead>>;

    /// Fetch one lead by id.
    async fn get(&self, lead_id: &str) -> Result<Option<Lead>>;

    /// Reassign ownership: set owner and assignment metadata, reset last
    /// activity to `change.at`, bump the transfer counter.
    ///
    /// Compare-and-set on `expected_owner_id`: returns `Ok(false)` and
    /// writes nothing when the lead is gone or owned by someone else.
    async fn update_owner(&self, change: &OwnerChange) -> Result<bool>;

    /// Append an ownership audit row.
    async fn append_assignment_log(&self, log: &AssignmentLog) -> Result<()>;

    /// Append a note to the lead's follow-up timeline.
    async fn append_timeline_note(&self, lead_id: &str, note: &str, author_id: &str) -> Result<()>;
}
