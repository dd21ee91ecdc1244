//! Transfer rule definitions: the core data model for auto-transfer policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A named auto-transfer policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRule {
    /// Unique rule ID.
    pub id: String,
    pub rule_name: String,
    #[serde(default)]
    pub description: String,
    pub enabled: bool,
    /// Which leads qualify.
    pub trigger_conditions: TriggerConditions,
    /// Daily wall-clock interval for scheduled runs.
    pub execution_window: ExecutionWindow,
    /// One ledger entry per participant, in creation order.
    pub user_quotas: Vec<UserQuota>,
    pub distribution_config: DistributionConfig,
    #[serde(default)]
    pub statistics: RuleStatistics,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Participant role within one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaRole {
    /// Gives leads away.
    Source,
    /// Receives leads.
    Target,
    /// Both gives and receives.
    Both,
}

impl QuotaRole {
    pub fn gives(&self) -> bool {
        matches!(self, QuotaRole::Source | QuotaRole::Both)
    }

    pub fn receives(&self) -> bool {
        matches!(self, QuotaRole::Target | QuotaRole::Both)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaRole::Source => "source",
            QuotaRole::Target => "target",
            QuotaRole::Both => "both",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "source" => Some(QuotaRole::Source),
            "target" => Some(QuotaRole::Target),
            "both" => Some(QuotaRole::Both),
            _ => None,
        }
    }
}

impl std::fmt::Display for QuotaRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-user running ledger for one rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserQuota {
    pub user_id: String,
    /// Denormalized for display.
    pub user_name: String,
    pub role: QuotaRole,
    pub transferred_out: u32,
    pub transferred_in: u32,
    /// Always `transferred_out - transferred_in`; maintained by the store.
    pub balance: i64,
    #[serde(default)]
    pub pending_compensation: i64,
    #[serde(default)]
    pub last_compensated_at: Option<DateTime<Utc>>,
}

impl UserQuota {
    /// Fresh ledger with zeroed counters.
    pub fn new(user_id: &str, user_name: &str, role: QuotaRole) -> Self {
        Self {
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
            role,
            transferred_out: 0,
            transferred_in: 0,
            balance: 0,
            pending_compensation: 0,
            last_compensated_at: None,
        }
    }

    /// Status word used in balance reports.
    pub fn balance_status(&self) -> &'static str {
        match self.balance {
            b if b > 0 => "owed",
            b if b < 0 => "surplus",
            _ => "even",
        }
    }
}

/// Inclusive optional date bounds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}

/// Which leads a rule picks up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerConditions {
    /// Hours without activity before a lead is eligible.
    pub inactive_hours: u32,
    pub contract_statuses: BTreeSet<String>,
    /// Empty = any source.
    #[serde(default)]
    pub lead_sources: BTreeSet<String>,
    #[serde(default)]
    pub created_date_range: DateRange,
}

/// Daily wall-clock window ("HH:MM" in the deployment time zone).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionWindow {
    pub enabled: bool,
    pub start_time: String,
    pub end_time: String,
}

/// Allocation strategy selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Shuffled round-robin with self-exclusion.
    #[default]
    BalancedRandom,
    /// Legacy balance-weighted random draw per candidate.
    WeightedRandom,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DistributionConfig {
    #[serde(default)]
    pub strategy: Strategy,
    pub enable_compensation: bool,
    /// 1..=10
    pub compensation_priority: u8,
}

/// Execution counters maintained by the scheduler.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleStatistics {
    pub total_transferred: u64,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub last_transferred_count: u32,
}

impl TransferRule {
    /// Users whose leads may be taken (role source or both).
    pub fn source_user_ids(&self) -> Vec<String> {
        self.user_quotas
            .iter()
            .filter(|q| q.role.gives())
            .map(|q| q.user_id.clone())
            .collect()
    }

    /// Users who may receive leads (role target or both), quota order.
    pub fn recipients(&self) -> Vec<&UserQuota> {
        self.user_quotas.iter().filter(|q| q.role.receives()).collect()
    }

    pub fn quota(&self, user_id: &str) -> Option<&UserQuota> {
        self.user_quotas.iter().find(|q| q.user_id == user_id)
    }

    /// Display name of a participant, falling back to the id.
    pub fn user_name<'a>(&'a self, user_id: &'a str) -> &'a str {
        self.quota(user_id)
            .map(|q| q.user_name.as_str())
            .unwrap_or(user_id)
    }

    /// Assignment reason written onto transferred leads.
    pub fn assignment_reason(&self) -> String {
        format!("auto-transfer: {}", self.rule_name)
    }
}

// ─── Audit records ──────────────────────────────────────────

/// Outcome of one executed move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Success,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Success => "success",
            RecordStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "failed" {
            RecordStatus::Failed
        } else {
            RecordStatus::Success
        }
    }
}

/// Lead state captured at the moment of transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferSnapshot {
    pub lead_number: String,
    pub lead_name: String,
    pub status: String,
    pub inactive_hours: i64,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Immutable audit row for one executed move.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub id: String,
    pub rule_id: String,
    pub lead_id: String,
    pub from_user_id: String,
    pub to_user_id: String,
    pub snapshot: TransferSnapshot,
    pub status: RecordStatus,
    pub error_message: Option<String>,
    pub transferred_at: DateTime<Utc>,
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_split_sources_and_recipients() {
        let rule = fixtures::rule("r1", &["a", "b"], &["b", "c"]);
        assert_eq!(rule.source_user_ids(), vec!["a", "b"]);
        let recipients: Vec<&str> = rule.recipients().iter().map(|q| q.user_id.as_str()).collect();
        assert_eq!(recipients, vec!["b", "c"]);
        assert_eq!(rule.quota("b").unwrap().role, QuotaRole::Both);
        assert_eq!(rule.user_name("c"), "C");
        assert_eq!(rule.user_name("zz"), "zz");
    }

    #[test]
    fn test_strategy_serde_names() {
        assert_eq!(
            serde_json::to_string(&Strategy::BalancedRandom).unwrap(),
            "\"balanced-random\""
        );
        let s: Strategy = serde_json::from_str("\"weighted-random\"").unwrap();
        assert_eq!(s, Strategy::WeightedRandom);
    }

    #[test]
    fn test_rule_json_uses_camel_case() {
        let rule = fixtures::rule("r1", &["a"], &["b"]);
        let v = serde_json::to_value(&rule).unwrap();
        assert_eq!(v["ruleName"], "rule r1");
        assert_eq!(v["triggerConditions"]["inactiveHours"], 48);
        assert!(v["executionWindow"]["startTime"].is_string());
        assert_eq!(v["distributionConfig"]["enableCompensation"], false);
        assert_eq!(v["userQuotas"][0]["transferredOut"], 0);
        assert!(v.get("rule_name").is_none());

        let back: TransferRule = serde_json::from_value(v).unwrap();
        assert_eq!(back.user_quotas, rule.user_quotas);
    }

    #[test]
    fn test_balance_status() {
        let mut q = UserQuota::new("a", "A", QuotaRole::Both);
        assert_eq!(q.balance_status(), "even");
        q.balance = 3;
        assert_eq!(q.balance_status(), "owed");
        q.balance = -1;
        assert_eq!(q.balance_status(), "surplus");
    }
}
