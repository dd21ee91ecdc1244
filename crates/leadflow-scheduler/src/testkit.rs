//! Shared fixtures for pipeline tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use leadflow_core::error::{LeadFlowError, Result};
use leadflow_core::lead::{AssignmentLog, Lead, LeadFilter, OwnerChange};
use leadflow_core::traits::lead_store::LeadStore;
use leadflow_core::traits::notifier::{AuditNotifier, TransferNotice};
use leadflow_crm::SqliteCrm;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::allocation::PlanEntry;
use crate::executor::PostTransferHook;
use crate::rule::{TransferRecord, TransferRule};

/// A pending lead owned by `owner`, idle for `idle_hours`.
pub fn lead(id: &str, owner: &str, idle_hours: i64, now: DateTime<Utc>) -> Lead {
    Lead {
        id: id.into(),
        lead_number: format!("CUS-{id}"),
        name: format!("Lead {id}"),
        owner_id: Some(owner.into()),
        status: "pending".into(),
        lead_source: Some("douyin".into()),
        last_activity_at: Some(now - Duration::hours(idle_hours)),
        updated_at: now - Duration::hours(idle_hours),
        created_at: now - Duration::days(10),
        in_public_pool: false,
        auto_transfer_enabled: None,
        transfer_count: 0,
        assignment_reason: None,
        assigned_by: None,
        assigned_at: None,
        last_transferred_at: None,
    }
}

/// Seed `n` stale leads for `owner` with ids `{owner}-{i}`.
pub fn seed(crm: &SqliteCrm, owner: &str, n: usize, now: DateTime<Utc>) {
    for i in 0..n {
        crm.insert_lead(&lead(&format!("{owner}-{i}"), owner, 72, now)).unwrap();
    }
}

/// Lead store wrapper for fault and race injection.
pub struct FlakyLeads {
    pub inner: Arc<SqliteCrm>,
    pub fail_updates: Mutex<HashSet<String>>,
    /// `find` fails when the filter names any of these owners.
    pub fail_find_owners: Mutex<HashSet<String>>,
    /// lead id -> owner that grabs the lead just before our write lands.
    pub steal_before_write: Mutex<HashMap<String, String>>,
    /// Yield to the runtime on every read, so concurrent runs interleave.
    pub yield_on_read: bool,
}

impl FlakyLeads {
    pub fn new(inner: Arc<SqliteCrm>) -> Self {
        Self {
            inner,
            fail_updates: Mutex::new(HashSet::new()),
            fail_find_owners: Mutex::new(HashSet::new()),
            steal_before_write: Mutex::new(HashMap::new()),
            yield_on_read: false,
        }
    }

    pub fn fail_update(&self, lead_id: &str) {
        self.fail_updates.lock().unwrap().insert(lead_id.to_string());
    }

    pub fn fail_find_for(&self, owner_id: &str) {
        self.fail_find_owners.lock().unwrap().insert(owner_id.to_string());
    }

    pub fn steal(&self, lead_id: &str, thief: &str) {
        self.steal_before_write
            .lock()
            .unwrap()
            .insert(lead_id.to_string(), thief.to_string());
    }
}

#[async_trait]
impl LeadStore for FlakyLeads {
    async fn find(&self, filter: &LeadFilter) -> Result<Vec<Lead>> {
        if self.yield_on_read {
            tokio::task::yield_now().await;
        }
        let offline = {
            let failing = self.fail_find_owners.lock().unwrap();
            filter.owner_ids.iter().any(|o| failing.contains(o))
        };
        if offline {
            return Err(LeadFlowError::Storage("lead store offline".into()));
        }
        self.inner.find(filter).await
    }

    async fn get(&self, lead_id: &str) -> Result<Option<Lead>> {
        if self.yield_on_read {
            tokio::task::yield_now().await;
        }
        self.inner.get(lead_id).await
    }

    async fn update_owner(&self, change: &OwnerChange) -> Result<bool> {
        if self.fail_updates.lock().unwrap().contains(&change.lead_id) {
            return Err(LeadFlowError::Storage(format!("write rejected for {}", change.lead_id)));
        }
        let thief = self.steal_before_write.lock().unwrap().remove(&change.lead_id);
        if let Some(thief) = thief {
            let grab = OwnerChange {
                new_owner_id: thief,
                assigned_by: "manual".into(),
                ..change.clone()
            };
            self.inner.update_owner(&grab).await?;
        }
        self.inner.update_owner(change).await
    }

    async fn append_assignment_log(&self, log: &AssignmentLog) -> Result<()> {
        self.inner.append_assignment_log(log).await
    }

    async fn append_timeline_note(&self, lead_id: &str, note: &str, author_id: &str) -> Result<()> {
        self.inner.append_timeline_note(lead_id, note, author_id).await
    }
}

/// Notifier that keeps every notice and optionally fails.
#[derive(Default)]
pub struct RecordingNotifier {
    pub notices: Mutex<Vec<TransferNotice>>,
    pub fail: bool,
}

#[async_trait]
impl AuditNotifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn notify(&self, notice: &TransferNotice) -> Result<()> {
        self.notices.lock().unwrap().push(notice.clone());
        if self.fail {
            return Err(LeadFlowError::Notify("inbox unreachable".into()));
        }
        Ok(())
    }
}

/// Hook that counts calls and always fails.
#[derive(Default)]
pub struct FailingHook {
    pub calls: Mutex<u32>,
}

#[async_trait]
impl PostTransferHook for FailingHook {
    fn name(&self) -> &str {
        "failing"
    }

    async fn after_transfer(
        &self,
        _rule: &TransferRule,
        _entry: &PlanEntry,
        _record: &TransferRecord,
    ) -> Result<()> {
        *self.calls.lock().unwrap() += 1;
        Err(LeadFlowError::Notify("third-party webhook down".into()))
    }
}
