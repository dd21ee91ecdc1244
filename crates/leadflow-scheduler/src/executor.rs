//! Transfer executor: applies plan entries one at a time.
//!
//! The ownership write is authoritative. Everything after it (assignment
//! log, transfer record, timeline note, quota increment, hooks) is best
//! effort: failures are logged and never undo the move.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadflow_core::error::Result;
use leadflow_core::lead::{AssignmentLog, Lead, OwnerChange};
use leadflow_core::traits::lead_store::LeadStore;
use std::collections::HashSet;
use std::sync::Arc;

use crate::allocation::PlanEntry;
use crate::rule::{RecordStatus, TransferRecord, TransferRule, TransferSnapshot};
use crate::store::{RecordStore, RuleStore};

/// Author id stamped on automated writes.
pub const SYSTEM_ACTOR: &str = "system";

/// Side effect run after a successful ownership write.
#[async_trait]
pub trait PostTransferHook: Send + Sync {
    fn name(&self) -> &str;

    async fn after_transfer(
        &self,
        rule: &TransferRule,
        entry: &PlanEntry,
        record: &TransferRecord,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Same lead already moved this cycle.
    AlreadyTransferred,
    LeadMissing,
    /// Someone reassigned the lead after selection, or won the write.
    OwnerChanged,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Transferred(TransferRecord),
    Skipped(SkipReason),
}

/// Per-cycle executor. Build a fresh one for every cycle.
pub struct TransferExecutor {
    leads: Arc<dyn LeadStore>,
    rules: Arc<dyn RuleStore>,
    records: Arc<dyn RecordStore>,
    hooks: Vec<Arc<dyn PostTransferHook>>,
    transferred: HashSet<String>,
}

fn snapshot(lead: &Lead, now: DateTime<Utc>) -> TransferSnapshot {
    TransferSnapshot {
        lead_number: lead.lead_number.clone(),
        lead_name: lead.name.clone(),
        status: lead.status.clone(),
        inactive_hours: lead.inactive_hours(now),
        last_activity_at: lead.last_activity(),
        created_at: lead.created_at,
    }
}

impl TransferExecutor {
    pub fn new(
        leads: Arc<dyn LeadStore>,
        rules: Arc<dyn RuleStore>,
        records: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            leads,
            rules,
            records,
            hooks: Vec::new(),
            transferred: HashSet::new(),
        }
    }

    pub fn with_hooks(mut self, hooks: Vec<Arc<dyn PostTransferHook>>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Lead ids moved so far in this cycle.
    pub fn transferred_count(&self) -> usize {
        self.transferred.len()
    }

    /// Apply one plan entry. `Err` means the ownership write did not happen.
    pub async fn apply(
        &mut self,
        entry: &PlanEntry,
        rule: &TransferRule,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome> {
        if self.transferred.contains(&entry.lead_id) {
            tracing::warn!("⚠️ Lead {} already transferred this cycle, skipping", entry.lead_id);
            return Ok(ApplyOutcome::Skipped(SkipReason::AlreadyTransferred));
        }

        let Some(lead) = self.leads.get(&entry.lead_id).await? else {
            tracing::warn!("⚠️ Lead {} vanished before transfer", entry.lead_id);
            return Ok(ApplyOutcome::Skipped(SkipReason::LeadMissing));
        };
        if lead.owner_id.as_deref() != Some(entry.from_user_id.as_str()) {
            tracing::warn!(
                "⚠️ Lead {} changed owner since selection ({:?} != {}), skipping",
                entry.lead_id,
                lead.owner_id,
                entry.from_user_id
            );
            return Ok(ApplyOutcome::Skipped(SkipReason::OwnerChanged));
        }

        let snap = snapshot(&lead, now);
        let reason = rule.assignment_reason();
        let change = OwnerChange {
            lead_id: entry.lead_id.clone(),
            expected_owner_id: Some(entry.from_user_id.clone()),
            new_owner_id: entry.to_user_id.clone(),
            assigned_by: SYSTEM_ACTOR.to_string(),
            reason: reason.clone(),
            at: now,
        };

        match self.leads.update_owner(&change).await {
            Ok(true) => {}
            Ok(false) => {
                // another run (possibly another process) got there first
                tracing::warn!(
                    "⚠️ Lead {} left {} before the write, skipping",
                    entry.lead_id,
                    entry.from_user_id
                );
                return Ok(ApplyOutcome::Skipped(SkipReason::OwnerChanged));
            }
            Err(e) => {
                tracing::error!("❌ Transfer of lead {} failed: {e}", entry.lead_id);
                let failed = self.record(entry, rule, snap, RecordStatus::Failed, Some(e.to_string()), now);
                if let Err(log_err) = self.records.append_record(&failed).await {
                    tracing::warn!("⚠️ Could not record failed transfer of {}: {log_err}", entry.lead_id);
                }
                return Err(e);
            }
        }
        self.transferred.insert(entry.lead_id.clone());

        let log = AssignmentLog {
            id: uuid::Uuid::new_v4().to_string(),
            lead_id: entry.lead_id.clone(),
            old_owner_id: Some(entry.from_user_id.clone()),
            new_owner_id: entry.to_user_id.clone(),
            assigned_by: SYSTEM_ACTOR.to_string(),
            reason,
            assigned_at: now,
        };
        if let Err(e) = self.leads.append_assignment_log(&log).await {
            tracing::warn!("⚠️ Assignment log for {} not written: {e}", entry.lead_id);
        }

        let hours = snap.inactive_hours;
        let record = self.record(entry, rule, snap, RecordStatus::Success, None, now);
        if let Err(e) = self.records.append_record(&record).await {
            tracing::warn!("⚠️ Transfer record for {} not written: {e}", entry.lead_id);
        }

        let note = format!(
            "System auto-transfer: no follow-up for {} hours, moved from {} to {} (rule '{}')",
            hours,
            rule.user_name(&entry.from_user_id),
            rule.user_name(&entry.to_user_id),
            rule.rule_name
        );
        if let Err(e) = self
            .leads
            .append_timeline_note(&entry.lead_id, &note, SYSTEM_ACTOR)
            .await
        {
            tracing::warn!("⚠️ Timeline note for {} not written: {e}", entry.lead_id);
        }

        if let Err(e) = self
            .rules
            .increment_quota(&rule.id, &entry.from_user_id, &entry.to_user_id, now)
            .await
        {
            tracing::warn!("⚠️ Quota update for rule '{}' failed: {e}", rule.rule_name);
        }

        for hook in &self.hooks {
            if let Err(e) = hook.after_transfer(rule, entry, &record).await {
                tracing::warn!("⚠️ Hook '{}' failed for lead {}: {e}", hook.name(), entry.lead_id);
            }
        }

        tracing::debug!(
            "✅ Lead {} moved {} -> {}",
            entry.lead_id,
            entry.from_user_id,
            entry.to_user_id
        );
        Ok(ApplyOutcome::Transferred(record))
    }

    fn record(
        &self,
        entry: &PlanEntry,
        rule: &TransferRule,
        snapshot: TransferSnapshot,
        status: RecordStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> TransferRecord {
        TransferRecord {
            id: uuid::Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            lead_id: entry.lead_id.clone(),
            from_user_id: entry.from_user_id.clone(),
            to_user_id: entry.to_user_id.clone(),
            snapshot,
            status,
            error_message,
            transferred_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::TransferDb;
    use crate::rule::fixtures;
    use crate::store::{PageRequest, RecordFilter};
    use crate::testkit::{self, FailingHook, FlakyLeads};
    use leadflow_crm::SqliteCrm;

    struct Rig {
        crm: Arc<SqliteCrm>,
        leads: Arc<FlakyLeads>,
        db: Arc<TransferDb>,
        rule: TransferRule,
    }

    async fn rig() -> Rig {
        let crm = Arc::new(SqliteCrm::open_in_memory().unwrap());
        let leads = Arc::new(FlakyLeads::new(crm.clone()));
        let db = Arc::new(TransferDb::open_in_memory().unwrap());
        let rule = fixtures::rule("r1", &["a"], &["b", "c"]);
        db.insert_rule(&rule).await.unwrap();
        Rig { crm, leads, db, rule }
    }

    fn executor(rig: &Rig) -> TransferExecutor {
        TransferExecutor::new(rig.leads.clone(), rig.db.clone(), rig.db.clone())
    }

    fn entry(lead: &str, from: &str, to: &str) -> PlanEntry {
        PlanEntry { lead_id: lead.into(), from_user_id: from.into(), to_user_id: to.into() }
    }

    #[tokio::test]
    async fn test_apply_writes_owner_audit_and_quota() {
        let rig = rig().await;
        let now = Utc::now();
        rig.crm.insert_lead(&testkit::lead("l1", "a", 60, now)).unwrap();

        let mut exec = executor(&rig);
        let outcome = exec.apply(&entry("l1", "a", "b"), &rig.rule, now).await.unwrap();
        let ApplyOutcome::Transferred(record) = outcome else {
            panic!("expected transfer, got {outcome:?}");
        };
        // snapshot predates the write
        assert_eq!(record.snapshot.inactive_hours, 60);
        assert_eq!(record.status, RecordStatus::Success);

        let lead = rig.crm.get("l1").await.unwrap().unwrap();
        assert_eq!(lead.owner_id.as_deref(), Some("b"));
        assert_eq!(lead.transfer_count, 1);
        assert_eq!(lead.assignment_reason.as_deref(), Some("auto-transfer: rule r1"));

        let logs = rig.crm.assignment_logs("l1").unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].assigned_by, "system");
        assert_eq!(logs[0].old_owner_id.as_deref(), Some("a"));

        let notes = rig.crm.timeline("l1").unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].0, "system");
        assert!(notes[0].1.contains("60 hours"));

        let rule = rig.db.get_rule("r1").await.unwrap().unwrap();
        assert_eq!(rule.quota("a").unwrap().balance, 1);
        assert_eq!(rule.quota("b").unwrap().balance, -1);

        let page = rig.db.list_records(&RecordFilter::default(), PageRequest::default()).await.unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn test_second_apply_of_same_lead_is_skipped() {
        let rig = rig().await;
        let now = Utc::now();
        rig.crm.insert_lead(&testkit::lead("l1", "a", 60, now)).unwrap();

        let mut exec = executor(&rig);
        exec.apply(&entry("l1", "a", "b"), &rig.rule, now).await.unwrap();
        let again = exec.apply(&entry("l1", "a", "c"), &rig.rule, now).await.unwrap();
        assert_eq!(again, ApplyOutcome::Skipped(SkipReason::AlreadyTransferred));
        assert_eq!(exec.transferred_count(), 1);
        assert_eq!(rig.crm.get("l1").await.unwrap().unwrap().owner_id.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_stale_owner_and_missing_lead_are_skips() {
        let rig = rig().await;
        let now = Utc::now();
        rig.crm.insert_lead(&testkit::lead("l1", "c", 60, now)).unwrap();

        let mut exec = executor(&rig);
        let out = exec.apply(&entry("l1", "a", "b"), &rig.rule, now).await.unwrap();
        assert_eq!(out, ApplyOutcome::Skipped(SkipReason::OwnerChanged));
        let out = exec.apply(&entry("ghost", "a", "b"), &rig.rule, now).await.unwrap();
        assert_eq!(out, ApplyOutcome::Skipped(SkipReason::LeadMissing));
    }

    #[tokio::test]
    async fn test_lost_owner_write_is_a_skip_without_side_effects() {
        let rig = rig().await;
        let now = Utc::now();
        rig.crm.insert_lead(&testkit::lead("l1", "a", 60, now)).unwrap();
        // reassigned between our read and our write
        rig.leads.steal("l1", "d");

        let mut exec = executor(&rig);
        let out = exec.apply(&entry("l1", "a", "b"), &rig.rule, now).await.unwrap();
        assert_eq!(out, ApplyOutcome::Skipped(SkipReason::OwnerChanged));
        assert_eq!(exec.transferred_count(), 0);

        let lead = rig.crm.get("l1").await.unwrap().unwrap();
        assert_eq!(lead.owner_id.as_deref(), Some("d"));
        assert_eq!(lead.transfer_count, 1);
        assert!(rig.crm.assignment_logs("l1").unwrap().is_empty());
        assert!(rig.crm.timeline("l1").unwrap().is_empty());

        let rule = rig.db.get_rule("r1").await.unwrap().unwrap();
        assert_eq!(rule.quota("a").unwrap().transferred_out, 0);
        let page = rig.db.list_records(&RecordFilter::default(), PageRequest::default()).await.unwrap();
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn test_failed_owner_write_records_failure() {
        let rig = rig().await;
        let now = Utc::now();
        rig.crm.insert_lead(&testkit::lead("l1", "a", 60, now)).unwrap();
        rig.leads.fail_update("l1");

        let mut exec = executor(&rig);
        assert!(exec.apply(&entry("l1", "a", "b"), &rig.rule, now).await.is_err());

        let filter = RecordFilter { status: Some(RecordStatus::Failed), ..Default::default() };
        let page = rig.db.list_records(&filter, PageRequest::default()).await.unwrap();
        assert_eq!(page.total, 1);
        assert!(page.records[0].error_message.as_deref().unwrap().contains("write rejected"));

        // counters untouched
        let rule = rig.db.get_rule("r1").await.unwrap().unwrap();
        assert_eq!(rule.quota("a").unwrap().transferred_out, 0);
    }

    #[tokio::test]
    async fn test_hook_failure_does_not_change_outcome() {
        let rig = rig().await;
        let now = Utc::now();
        rig.crm.insert_lead(&testkit::lead("l1", "a", 60, now)).unwrap();
        let hook = Arc::new(FailingHook::default());

        let mut exec = executor(&rig).with_hooks(vec![hook.clone() as Arc<dyn PostTransferHook>]);
        let out = exec.apply(&entry("l1", "a", "b"), &rig.rule, now).await.unwrap();
        assert!(matches!(out, ApplyOutcome::Transferred(_)));
        assert_eq!(*hook.calls.lock().unwrap(), 1);
    }
}
