//! Audit notifier trait: receives one notice per affected user per cycle.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Aggregated transfer counts for one user after one rule cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferNotice {
    pub user_id: String,
    pub user_name: String,
    pub transferred_out_count: u32,
    pub transferred_in_count: u32,
    pub rule_name: String,
    pub cycle_timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait AuditNotifier: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver a notice. Failures are reported, never retried by the engine.
    async fn notify(&self, notice: &TransferNotice) -> Result<()>;
}
