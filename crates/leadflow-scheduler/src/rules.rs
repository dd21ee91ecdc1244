//! Rule administration: validated create/update/toggle/delete plus the
//! read side (rule listing, transfer records, statistics).
//!
//! Every mutation requires an admin or manager actor. Rules handed to the
//! engine after this point are assumed valid.

use leadflow_core::config::RuleDefaults;
use leadflow_core::error::{LeadFlowError, Result};
use leadflow_core::traits::user_directory::UserDirectory;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::rule::{
    DateRange, DistributionConfig, ExecutionWindow, QuotaRole, RuleStatistics, Strategy,
    TransferRule, TriggerConditions, UserQuota,
};
use crate::store::{
    PageRequest, RecordFilter, RecordPage, RecordStats, RecordStore, RuleStore, UserTransferStats,
};
use crate::window;

/// Trigger section of a new rule; `inactive_hours` falls back to the configured default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerDraft {
    #[serde(default)]
    pub inactive_hours: Option<u32>,
    #[serde(default)]
    pub contract_statuses: BTreeSet<String>,
    #[serde(default)]
    pub lead_sources: BTreeSet<String>,
    #[serde(default)]
    pub created_date_range: DateRange,
}

/// Input for rule creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDraft {
    pub rule_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub trigger_conditions: TriggerDraft,
    #[serde(default)]
    pub execution_window: Option<ExecutionWindow>,
    #[serde(default)]
    pub distribution_config: Option<DistributionConfig>,
    pub source_user_ids: Vec<String>,
    pub target_user_ids: Vec<String>,
}

/// Partial update. Supplying either user list re-initialises the quotas.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulePatch {
    #[serde(default)]
    pub rule_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub trigger_conditions: Option<TriggerConditions>,
    #[serde(default)]
    pub execution_window: Option<ExecutionWindow>,
    #[serde(default)]
    pub distribution_config: Option<DistributionConfig>,
    #[serde(default)]
    pub source_user_ids: Option<Vec<String>>,
    #[serde(default)]
    pub target_user_ids: Option<Vec<String>>,
}

/// Check a fully-built rule before it is persisted.
pub fn validate_rule(rule: &TransferRule, defaults: &RuleDefaults) -> Result<()> {
    if rule.rule_name.trim().is_empty() {
        return Err(LeadFlowError::Validation("rule name is required".into()));
    }
    let trigger = &rule.trigger_conditions;
    if trigger.inactive_hours < 1 {
        return Err(LeadFlowError::Validation("inactive hours must be at least 1".into()));
    }
    if trigger.contract_statuses.is_empty() {
        return Err(LeadFlowError::Validation("at least one lead status is required".into()));
    }
    if !defaults.allowed_statuses.is_empty() {
        if let Some(bad) = trigger
            .contract_statuses
            .iter()
            .find(|s| !defaults.allowed_statuses.contains(s))
        {
            return Err(LeadFlowError::Validation(format!("unsupported lead status '{bad}'")));
        }
    }
    if let (Some(start), Some(end)) = (trigger.created_date_range.start, trigger.created_date_range.end) {
        if start > end {
            return Err(LeadFlowError::Validation("created date range is reversed".into()));
        }
    }
    validate_window(&rule.execution_window)?;
    let priority = rule.distribution_config.compensation_priority;
    if !(1..=10).contains(&priority) {
        return Err(LeadFlowError::Validation(format!(
            "compensation priority must be 1-10, got {priority}"
        )));
    }
    if rule.recipients().is_empty() {
        return Err(LeadFlowError::Validation("at least one target user is required".into()));
    }
    Ok(())
}

fn validate_window(w: &ExecutionWindow) -> Result<()> {
    let Some((start, end)) = window::window_bounds(w) else {
        return Err(LeadFlowError::Validation(format!(
            "execution window must be HH:MM, got '{}'-'{}'",
            w.start_time, w.end_time
        )));
    };
    if start > end {
        return Err(LeadFlowError::Validation(format!(
            "execution window start {} is after end {}",
            w.start_time, w.end_time
        )));
    }
    Ok(())
}

fn dedup(ids: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    ids.iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect()
}

pub struct RuleService {
    rules: Arc<dyn RuleStore>,
    records: Arc<dyn RecordStore>,
    users: Arc<dyn UserDirectory>,
    defaults: RuleDefaults,
    clock: Arc<dyn Clock>,
}

impl RuleService {
    pub fn new(
        rules: Arc<dyn RuleStore>,
        records: Arc<dyn RecordStore>,
        users: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            rules,
            records,
            users,
            defaults: RuleDefaults::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_defaults(mut self, defaults: RuleDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn authorize(&self, actor: &str) -> Result<()> {
        match self.users.role_of(actor).await? {
            Some(role) if role.can_manage_rules() => Ok(()),
            Some(role) => Err(LeadFlowError::Forbidden(format!(
                "{actor} ({}) may not manage transfer rules",
                role.as_str()
            ))),
            None => Err(LeadFlowError::Forbidden(format!("unknown user {actor}"))),
        }
    }

    /// One quota per distinct user: sources first, then target-only users.
    async fn build_quotas(&self, sources: &[String], targets: &[String]) -> Result<Vec<UserQuota>> {
        let sources = dedup(sources);
        let targets = dedup(targets);
        let mut all = sources.clone();
        all.extend(targets.iter().filter(|t| !sources.contains(t)).cloned());

        let names = self.users.resolve_names(&all).await?;
        if let Some(missing) = all.iter().find(|id| !names.contains_key(*id)) {
            return Err(LeadFlowError::UserNotFound(missing.clone()));
        }

        Ok(all
            .iter()
            .map(|id| {
                let role = match (sources.contains(id), targets.contains(id)) {
                    (true, true) => QuotaRole::Both,
                    (true, false) => QuotaRole::Source,
                    _ => QuotaRole::Target,
                };
                let name = names.get(id).map(String::as_str).unwrap_or(id.as_str());
                UserQuota::new(id, name, role)
            })
            .collect())
    }

    fn default_window(&self) -> ExecutionWindow {
        ExecutionWindow {
            enabled: true,
            start_time: self.defaults.window_start.clone(),
            end_time: self.defaults.window_end.clone(),
        }
    }

    fn default_distribution(&self) -> DistributionConfig {
        DistributionConfig {
            strategy: Strategy::BalancedRandom,
            enable_compensation: true,
            compensation_priority: self.defaults.compensation_priority,
        }
    }

    /// Create a rule with zeroed counters.
    pub async fn create(&self, actor: &str, draft: RuleDraft) -> Result<TransferRule> {
        self.authorize(actor).await?;
        let now = self.clock.now();
        let user_quotas = self
            .build_quotas(&draft.source_user_ids, &draft.target_user_ids)
            .await?;
        let trigger = draft.trigger_conditions;
        let rule = TransferRule {
            id: uuid::Uuid::new_v4().to_string(),
            rule_name: draft.rule_name.trim().to_string(),
            description: draft.description,
            enabled: draft.enabled.unwrap_or(true),
            trigger_conditions: TriggerConditions {
                inactive_hours: trigger.inactive_hours.unwrap_or(self.defaults.inactive_hours),
                contract_statuses: trigger.contract_statuses,
                lead_sources: trigger.lead_sources,
                created_date_range: trigger.created_date_range,
            },
            execution_window: draft.execution_window.unwrap_or_else(|| self.default_window()),
            user_quotas,
            distribution_config: draft
                .distribution_config
                .unwrap_or_else(|| self.default_distribution()),
            statistics: RuleStatistics::default(),
            created_by: actor.to_string(),
            created_at: now,
            updated_at: now,
        };
        validate_rule(&rule, &self.defaults)?;
        self.rules.insert_rule(&rule).await?;
        tracing::info!(
            "📝 Rule created: '{}' ({}) by {}, {} participant(s)",
            rule.rule_name,
            rule.id,
            actor,
            rule.user_quotas.len()
        );
        Ok(rule)
    }

    /// Apply a partial update.
    pub async fn update(&self, actor: &str, rule_id: &str, patch: RulePatch) -> Result<TransferRule> {
        self.authorize(actor).await?;
        let mut rule = self.get(rule_id).await?;

        if let Some(name) = patch.rule_name {
            rule.rule_name = name.trim().to_string();
        }
        if let Some(description) = patch.description {
            rule.description = description;
        }
        if let Some(enabled) = patch.enabled {
            rule.enabled = enabled;
        }
        if let Some(trigger) = patch.trigger_conditions {
            rule.trigger_conditions = trigger;
        }
        if let Some(window) = patch.execution_window {
            rule.execution_window = window;
        }
        if let Some(distribution) = patch.distribution_config {
            rule.distribution_config = distribution;
        }

        let replace_quotas = patch.source_user_ids.is_some() || patch.target_user_ids.is_some();
        if replace_quotas {
            let sources = patch.source_user_ids.unwrap_or_else(|| rule.source_user_ids());
            let targets = patch.target_user_ids.unwrap_or_else(|| {
                rule.recipients().iter().map(|q| q.user_id.clone()).collect()
            });
            rule.user_quotas = self.build_quotas(&sources, &targets).await?;
        }

        rule.updated_at = self.clock.now();
        validate_rule(&rule, &self.defaults)?;
        self.rules.update_rule(&rule, replace_quotas).await?;
        tracing::info!(
            "📝 Rule updated: '{}' ({}) by {}{}",
            rule.rule_name,
            rule.id,
            actor,
            if replace_quotas { ", quotas reset" } else { "" }
        );
        self.get(rule_id).await
    }

    pub async fn toggle(&self, actor: &str, rule_id: &str, enabled: bool) -> Result<TransferRule> {
        self.authorize(actor).await?;
        if !self.rules.set_enabled(rule_id, enabled, self.clock.now()).await? {
            return Err(LeadFlowError::RuleNotFound(rule_id.to_string()));
        }
        tracing::info!(
            "🔀 Rule {} {} by {}",
            rule_id,
            if enabled { "enabled" } else { "disabled" },
            actor
        );
        self.get(rule_id).await
    }

    pub async fn delete(&self, actor: &str, rule_id: &str) -> Result<()> {
        self.authorize(actor).await?;
        if !self.rules.delete_rule(rule_id).await? {
            return Err(LeadFlowError::RuleNotFound(rule_id.to_string()));
        }
        tracing::info!("🗑️ Rule {} deleted by {}", rule_id, actor);
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<TransferRule>> {
        self.rules.list_rules().await
    }

    pub async fn get(&self, rule_id: &str) -> Result<TransferRule> {
        self.rules
            .get_rule(rule_id)
            .await?
            .ok_or_else(|| LeadFlowError::RuleNotFound(rule_id.to_string()))
    }

    pub async fn records(&self, filter: &RecordFilter, page: PageRequest) -> Result<RecordPage> {
        self.records.list_records(filter, page).await
    }

    pub async fn statistics(&self, range: &DateRange) -> Result<RecordStats> {
        self.records.record_stats(range).await
    }

    pub async fn user_statistics(&self, user_id: &str, range: &DateRange) -> Result<UserTransferStats> {
        self.records.user_stats(user_id, range).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::TransferDb;
    use leadflow_core::lead::UserRole;
    use chrono::Utc;
    use leadflow_crm::SqliteCrm;

    fn service() -> (RuleService, Arc<TransferDb>) {
        let crm = Arc::new(SqliteCrm::open_in_memory().unwrap());
        crm.upsert_user("boss", "Boss", &UserRole::Admin).unwrap();
        crm.upsert_user("mgr", "Manager", &UserRole::Manager).unwrap();
        crm.upsert_user("a", "Alice", &UserRole::Sales).unwrap();
        crm.upsert_user("b", "Bob", &UserRole::Sales).unwrap();
        crm.upsert_user("c", "Carol", &UserRole::Sales).unwrap();
        let db = Arc::new(TransferDb::open_in_memory().unwrap());
        let svc = RuleService::new(db.clone(), db.clone(), crm);
        (svc, db)
    }

    fn draft(sources: &[&str], targets: &[&str]) -> RuleDraft {
        RuleDraft {
            rule_name: "Idle leads".into(),
            trigger_conditions: TriggerDraft {
                contract_statuses: ["pending".to_string()].into_iter().collect(),
                ..Default::default()
            },
            source_user_ids: sources.iter().map(|s| s.to_string()).collect(),
            target_user_ids: targets.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_applies_defaults_and_roles() {
        let (svc, _) = service();
        let rule = svc.create("boss", draft(&["a", "b"], &["b", "c"])).await.unwrap();

        assert!(rule.enabled);
        assert_eq!(rule.trigger_conditions.inactive_hours, 48);
        assert_eq!(rule.execution_window.start_time, "09:30");
        assert!(rule.execution_window.enabled);
        assert!(rule.distribution_config.enable_compensation);
        assert_eq!(rule.distribution_config.compensation_priority, 5);
        assert_eq!(rule.statistics, RuleStatistics::default());

        let roles: Vec<(&str, QuotaRole, &str)> = rule
            .user_quotas
            .iter()
            .map(|q| (q.user_id.as_str(), q.role, q.user_name.as_str()))
            .collect();
        assert_eq!(
            roles,
            vec![
                ("a", QuotaRole::Source, "Alice"),
                ("b", QuotaRole::Both, "Bob"),
                ("c", QuotaRole::Target, "Carol"),
            ]
        );
        assert_eq!(svc.get(&rule.id).await.unwrap().user_quotas.len(), 3);
    }

    #[tokio::test]
    async fn test_only_admins_and_managers_mutate() {
        let (svc, _) = service();
        assert!(matches!(
            svc.create("a", draft(&["a"], &["b"])).await,
            Err(LeadFlowError::Forbidden(_))
        ));
        assert!(matches!(
            svc.create("nobody", draft(&["a"], &["b"])).await,
            Err(LeadFlowError::Forbidden(_))
        ));
        let rule = svc.create("mgr", draft(&["a"], &["b"])).await.unwrap();
        assert!(matches!(
            svc.delete("b", &rule.id).await,
            Err(LeadFlowError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_rules() {
        let (svc, _) = service();

        let mut d = draft(&["a"], &["b"]);
        d.execution_window = Some(ExecutionWindow {
            enabled: true,
            start_time: "18:00".into(),
            end_time: "09:00".into(),
        });
        assert!(matches!(svc.create("boss", d).await, Err(LeadFlowError::Validation(_))));

        let mut d = draft(&["a"], &["b"]);
        d.execution_window = Some(ExecutionWindow {
            enabled: false,
            start_time: "9am".into(),
            end_time: "18:00".into(),
        });
        assert!(matches!(svc.create("boss", d).await, Err(LeadFlowError::Validation(_))));

        let mut d = draft(&["a"], &["b"]);
        d.distribution_config = Some(DistributionConfig {
            strategy: Strategy::BalancedRandom,
            enable_compensation: true,
            compensation_priority: 0,
        });
        assert!(matches!(svc.create("boss", d).await, Err(LeadFlowError::Validation(_))));

        let mut d = draft(&["a"], &["b"]);
        d.trigger_conditions.inactive_hours = Some(0);
        assert!(matches!(svc.create("boss", d).await, Err(LeadFlowError::Validation(_))));

        let mut d = draft(&["a"], &["b"]);
        d.trigger_conditions.contract_statuses.clear();
        assert!(matches!(svc.create("boss", d).await, Err(LeadFlowError::Validation(_))));

        assert!(matches!(
            svc.create("boss", draft(&["a"], &[])).await,
            Err(LeadFlowError::Validation(_))
        ));
        assert!(matches!(
            svc.create("boss", draft(&["a"], &["ghost"])).await,
            Err(LeadFlowError::UserNotFound(id)) if id == "ghost"
        ));
        assert!(svc.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_allowed_statuses_enforced() {
        let (svc, _) = service();
        let svc = svc.with_defaults(RuleDefaults {
            allowed_statuses: vec!["pending".into(), "matching".into()],
            ..Default::default()
        });
        let mut d = draft(&["a"], &["b"]);
        d.trigger_conditions.contract_statuses.insert("signed".into());
        assert!(matches!(svc.create("boss", d).await, Err(LeadFlowError::Validation(_))));
        assert!(svc.create("boss", draft(&["a"], &["b"])).await.is_ok());
    }

    #[tokio::test]
    async fn test_partial_update_keeps_counters_unless_users_change() {
        let (svc, db) = service();
        let rule = svc.create("boss", draft(&["a"], &["b", "c"])).await.unwrap();
        db.increment_quota(&rule.id, "a", "b", Utc::now()).await.unwrap();

        let renamed = svc
            .update("boss", &rule.id, RulePatch { rule_name: Some("Renamed".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(renamed.rule_name, "Renamed");
        assert_eq!(renamed.quota("b").unwrap().transferred_in, 1);

        // targets only: sources derived from current roles
        let retargeted = svc
            .update(
                "boss",
                &rule.id,
                RulePatch { target_user_ids: Some(vec!["c".into()]), ..Default::default() },
            )
            .await
            .unwrap();
        let ids: Vec<&str> = retargeted.user_quotas.iter().map(|q| q.user_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert!(retargeted.user_quotas.iter().all(|q| q.transferred_out == 0 && q.transferred_in == 0));

        assert!(matches!(
            svc.update("boss", "missing", RulePatch::default()).await,
            Err(LeadFlowError::RuleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_toggle_and_delete() {
        let (svc, _) = service();
        let rule = svc.create("boss", draft(&["a"], &["b"])).await.unwrap();

        let off = svc.toggle("boss", &rule.id, false).await.unwrap();
        assert!(!off.enabled);
        assert!(matches!(
            svc.toggle("boss", "missing", true).await,
            Err(LeadFlowError::RuleNotFound(_))
        ));

        svc.delete("boss", &rule.id).await.unwrap();
        assert!(matches!(svc.get(&rule.id).await, Err(LeadFlowError::RuleNotFound(_))));
        assert!(matches!(
            svc.delete("boss", &rule.id).await,
            Err(LeadFlowError::RuleNotFound(_))
        ));
    }

    #[test]
    fn test_dedup_trims_and_keeps_order() {
        let ids = vec![" b".to_string(), "a".into(), "b".into(), "".into()];
        assert_eq!(dedup(&ids), vec!["b", "a"]);
    }
}
