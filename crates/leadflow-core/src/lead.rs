//! Lead (customer) and user model as seen by the transfer engine.
//!
//! Leads are owned by the CRM store; the engine reads ownership, status,
//! source and activity timestamps, and writes ownership metadata back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A sales lead, owned by one staff user at a time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lead {
    pub id: String,
    /// Human-facing lead number (e.g. "CUS-000123").
    pub lead_number: String,
    pub name: String,
    /// Current owner. `None` while the lead sits in the public pool.
    pub owner_id: Option<String>,
    /// Lifecycle status (e.g. "pending", "matching").
    pub status: String,
    pub lead_source: Option<String>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub in_public_pool: bool,
    /// Per-lead opt-out. Only an explicit `false` blocks auto-transfer.
    pub auto_transfer_enabled: Option<bool>,
    pub transfer_count: u32,
    pub assignment_reason: Option<String>,
    pub assigned_by: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub last_transferred_at: Option<DateTime<Utc>>,
}

impl Lead {
    /// Last activity, falling back to the last-modified timestamp.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity_at.unwrap_or(self.updated_at)
    }

    /// Whole hours since last activity (never negative).
    pub fn inactive_hours(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_activity()).num_hours().max(0)
    }
}

/// Compound filter the candidate selector hands to the lead store.
///
/// Every populated clause must hold. `lead_sources` empty means any source;
/// the created-at bounds are inclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadFilter {
    pub owner_ids: Vec<String>,
    pub statuses: Vec<String>,
    /// Last activity (or last-modified) must be strictly earlier.
    pub inactive_before: DateTime<Utc>,
    pub lead_sources: Vec<String>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl LeadFilter {
    /// Reference evaluation of the filter against a single lead.
    pub fn matches(&self, lead: &Lead) -> bool {
        let owned_by_source = lead
            .owner_id
            .as_ref()
            .is_some_and(|o| self.owner_ids.contains(o));
        if !owned_by_source || !self.statuses.contains(&lead.status) {
            return false;
        }
        if lead.last_activity() >= self.inactive_before {
            return false;
        }
        if lead.in_public_pool || lead.auto_transfer_enabled == Some(false) {
            return false;
        }
        if !self.lead_sources.is_empty() {
            match &lead.lead_source {
                Some(src) if self.lead_sources.contains(src) => {}
                _ => return false,
            }
        }
        if self.created_from.is_some_and(|from| lead.created_at < from) {
            return false;
        }
        if self.created_to.is_some_and(|to| lead.created_at > to) {
            return false;
        }
        true
    }
}

/// A lead eligible for transfer this cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    pub lead_id: String,
    pub current_owner_id: String,
}

/// Ownership write applied by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerChange {
    pub lead_id: String,
    /// The write only lands while the lead still has this owner.
    pub expected_owner_id: Option<String>,
    pub new_owner_id: String,
    pub assigned_by: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Append-only audit row for any ownership change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentLog {
    pub id: String,
    pub lead_id: String,
    pub old_owner_id: Option<String>,
    pub new_owner_id: String,
    pub assigned_by: String,
    pub reason: String,
    pub assigned_at: DateTime<Utc>,
}

/// Staff role as reported by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Manager,
    Sales,
    Other(String),
}

impl UserRole {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "admin" => UserRole::Admin,
            "manager" => UserRole::Manager,
            "sales" => UserRole::Sales,
            other => UserRole::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            UserRole::Admin => "admin",
            UserRole::Manager => "manager",
            UserRole::Sales => "sales",
            UserRole::Other(s) => s,
        }
    }

    /// Only admins and managers may create or change transfer rules.
    pub fn can_manage_rules(&self) -> bool {
        matches!(self, UserRole::Admin | UserRole::Manager)
    }
}
