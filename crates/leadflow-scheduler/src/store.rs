//! Storage traits for rules, quota ledgers and transfer records.
//!
//! Quota counters and statistics are only ever changed through the
//! increment operations here, never by saving a mutated in-memory rule.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadflow_core::error::Result;
use serde::{Deserialize, Serialize};

use crate::rule::{DateRange, RecordStatus, TransferRecord, TransferRule};

#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn insert_rule(&self, rule: &TransferRule) -> Result<()>;

    /// Persist definition fields. Quota rows are rewritten only when
    /// `replace_quotas` is set; otherwise live counters are left untouched.
    async fn update_rule(&self, rule: &TransferRule, replace_quotas: bool) -> Result<()>;

    /// Returns false if the rule does not exist.
    async fn set_enabled(&self, rule_id: &str, enabled: bool, at: DateTime<Utc>) -> Result<bool>;

    /// Returns false if the rule does not exist.
    async fn delete_rule(&self, rule_id: &str) -> Result<bool>;

    async fn get_rule(&self, rule_id: &str) -> Result<Option<TransferRule>>;

    /// All rules, newest first.
    async fn list_rules(&self) -> Result<Vec<TransferRule>>;

    async fn enabled_rules(&self) -> Result<Vec<TransferRule>>;

    /// Atomically bump `from`'s transferred_out and `to`'s transferred_in,
    /// recompute both balances, and stamp `to`'s last_compensated_at.
    async fn increment_quota(
        &self,
        rule_id: &str,
        from_user_id: &str,
        to_user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Atomically fold one cycle into the rule statistics.
    async fn record_execution(&self, rule_id: &str, transferred: u32, at: DateTime<Utc>) -> Result<()>;
}

/// Transfer record query filter. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordFilter {
    pub rule_id: Option<String>,
    pub lead_id: Option<String>,
    pub from_user_id: Option<String>,
    pub to_user_id: Option<String>,
    pub status: Option<RecordStatus>,
    #[serde(default)]
    pub transferred: DateRange,
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 1, limit: 20 }
    }
}

impl PageRequest {
    pub fn offset(&self) -> u64 {
        (self.page.max(1) as u64 - 1) * self.limit as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPage {
    pub records: Vec<TransferRecord>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: u64,
}

impl RecordPage {
    pub fn new(records: Vec<TransferRecord>, total: u64, req: PageRequest) -> Self {
        let total_pages = if req.limit == 0 { 0 } else { total.div_ceil(req.limit as u64) };
        Self { records, total, page: req.page.max(1), limit: req.limit, total_pages }
    }
}

/// Aggregate outcome counts over a date range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordStats {
    pub total_count: u64,
    pub success_count: u64,
    pub failed_count: u64,
    /// Percentage with two decimals, "0.00" when empty.
    pub success_rate: String,
}

impl RecordStats {
    pub fn from_counts(success_count: u64, failed_count: u64) -> Self {
        let total_count = success_count + failed_count;
        let success_rate = if total_count > 0 {
            format!("{:.2}", success_count as f64 * 100.0 / total_count as f64)
        } else {
            "0.00".to_string()
        };
        Self { total_count, success_count, failed_count, success_rate }
    }
}

/// Per-user movement counted from transfer records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserTransferStats {
    pub user_id: String,
    pub transferred_out: u64,
    pub transferred_in: u64,
    pub balance: i64,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Append an immutable audit row.
    async fn append_record(&self, record: &TransferRecord) -> Result<()>;

    /// Matching records, newest first.
    async fn list_records(&self, filter: &RecordFilter, page: PageRequest) -> Result<RecordPage>;

    async fn record_stats(&self, range: &DateRange) -> Result<RecordStats>;

    async fn user_stats(&self, user_id: &str, range: &DateRange) -> Result<UserTransferStats>;
}
