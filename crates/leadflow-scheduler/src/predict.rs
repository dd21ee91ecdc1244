//! Read-only preview of the next cycle for a rule.

use chrono::{DateTime, Utc};
use leadflow_core::error::{LeadFlowError, Result};
use leadflow_core::traits::lead_store::LeadStore;
use leadflow_core::traits::user_directory::UserDirectory;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::engine::{SchedulerSettings, build_plan};
use crate::rule::{QuotaRole, TransferRule};
use crate::store::RuleStore;
use crate::window;

const UNKNOWN_USER: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProjection {
    pub user_id: String,
    pub user_name: String,
    pub role: QuotaRole,
    pub current_balance: i64,
    pub projected_out: u32,
    pub projected_in: u32,
    /// current + out - in
    pub projected_balance: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedMove {
    pub lead_id: String,
    pub source_user_id: String,
    pub source_user_name: String,
    pub target_user_id: String,
    pub target_user_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub rule_id: String,
    pub rule_name: String,
    pub next_execution_time: DateTime<Utc>,
    pub pending_count: usize,
    pub per_user_projection: Vec<UserProjection>,
    pub plan_preview: Vec<PlannedMove>,
}

pub struct PredictionService {
    rules: Arc<dyn RuleStore>,
    leads: Arc<dyn LeadStore>,
    users: Option<Arc<dyn UserDirectory>>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
}

impl PredictionService {
    pub fn new(rules: Arc<dyn RuleStore>, leads: Arc<dyn LeadStore>) -> Self {
        Self {
            rules,
            leads,
            users: None,
            clock: Arc::new(SystemClock),
            settings: SchedulerSettings::default(),
        }
    }

    pub fn with_directory(mut self, users: Arc<dyn UserDirectory>) -> Self {
        self.users = Some(users);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// What the next cycle of `rule_id` would do. Never writes.
    pub async fn predict(&self, rule_id: &str) -> Result<Prediction> {
        let rule = self
            .rules
            .get_rule(rule_id)
            .await?
            .ok_or_else(|| LeadFlowError::RuleNotFound(rule_id.to_string()))?;
        let now = self.clock.now();
        let next_execution_time =
            window::next_execution_time(&rule.execution_window, now, self.settings.offset);

        let plan = build_plan(self.leads.clone(), &self.settings, &rule, now).await?;

        let mut moves: BTreeMap<&str, (u32, u32)> = BTreeMap::new();
        for e in &plan.entries {
            moves.entry(e.from_user_id.as_str()).or_default().0 += 1;
            moves.entry(e.to_user_id.as_str()).or_default().1 += 1;
        }
        let per_user_projection = rule
            .user_quotas
            .iter()
            .map(|q| {
                let (out, inn) = moves.get(q.user_id.as_str()).copied().unwrap_or((0, 0));
                UserProjection {
                    user_id: q.user_id.clone(),
                    user_name: q.user_name.clone(),
                    role: q.role,
                    current_balance: q.balance,
                    projected_out: out,
                    projected_in: inn,
                    projected_balance: q.balance + out as i64 - inn as i64,
                }
            })
            .collect();

        let ids: Vec<String> = plan
            .entries
            .iter()
            .flat_map(|e| [e.from_user_id.clone(), e.to_user_id.clone()])
            .collect();
        let names = self.names_for(&rule, &ids).await;
        let name = |id: &str| names.get(id).cloned().unwrap_or_else(|| UNKNOWN_USER.to_string());
        let plan_preview = plan
            .entries
            .iter()
            .map(|e| PlannedMove {
                lead_id: e.lead_id.clone(),
                source_user_id: e.from_user_id.clone(),
                source_user_name: name(&e.from_user_id),
                target_user_id: e.to_user_id.clone(),
                target_user_name: name(&e.to_user_id),
            })
            .collect();

        tracing::info!(
            "🔮 Prediction for '{}': {} pending, next run {}",
            rule.rule_name,
            plan.entries.len(),
            next_execution_time
        );
        Ok(Prediction {
            rule_id: rule.id.clone(),
            rule_name: rule.rule_name.clone(),
            next_execution_time,
            pending_count: plan.entries.len(),
            per_user_projection,
            plan_preview,
        })
    }

    /// Quota names first, then the directory. Missing ids stay absent.
    async fn names_for(&self, rule: &TransferRule, ids: &[String]) -> HashMap<String, String> {
        let mut names: HashMap<String, String> = rule
            .user_quotas
            .iter()
            .filter(|q| !q.user_name.is_empty())
            .map(|q| (q.user_id.clone(), q.user_name.clone()))
            .collect();
        let missing: Vec<String> = ids
            .iter()
            .filter(|id| !names.contains_key(*id))
            .cloned()
            .collect();
        if missing.is_empty() {
            return names;
        }
        if let Some(users) = &self.users {
            match users.resolve_names(&missing).await {
                Ok(found) => names.extend(found),
                Err(e) => tracing::warn!("⚠️ Name lookup failed: {e}"),
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::RngSource;
    use crate::clock::FixedClock;
    use crate::engine::Scheduler;
    use crate::persistence::TransferDb;
    use crate::rule::fixtures;
    use crate::testkit;
    use chrono::{Duration, TimeZone};
    use leadflow_crm::SqliteCrm;

    fn at_local(h: u32) -> DateTime<Utc> {
        window::offset_from_minutes(480)
            .with_ymd_and_hms(2026, 3, 10, h, 15, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn settings() -> SchedulerSettings {
        SchedulerSettings { rng: RngSource::Seeded(2024), ..Default::default() }
    }

    #[tokio::test]
    async fn test_prediction_matches_execution() {
        let crm = Arc::new(SqliteCrm::open_in_memory().unwrap());
        let db = Arc::new(TransferDb::open_in_memory().unwrap());
        let clock = Arc::new(FixedClock::new(at_local(11)));
        testkit::seed(&crm, "a", 7, clock.now());
        testkit::seed(&crm, "b", 3, clock.now());
        let mut rule = fixtures::rule("r1", &["a", "b"], &["b", "c", "d"]);
        rule.distribution_config.enable_compensation = true;
        db.insert_rule(&rule).await.unwrap();

        let predictor = PredictionService::new(db.clone(), crm.clone())
            .with_clock(clock.clone())
            .with_settings(settings());
        let prediction = predictor.predict("r1").await.unwrap();

        let sched = Scheduler::new(db.clone(), db.clone(), crm.clone())
            .with_clock(clock.clone())
            .with_settings(settings());
        let result = sched.execute_rule_now("r1").await.unwrap();

        assert_eq!(prediction.pending_count, result.transferred_count as usize);
        for p in &prediction.per_user_projection {
            let actual = result.user_stats.iter().find(|s| s.user_id == p.user_id);
            let (out, inn) = actual.map_or((0, 0), |s| (s.transferred_out, s.transferred_in));
            assert_eq!((p.projected_out, p.projected_in), (out, inn), "{}", p.user_id);
        }

        // projected balances are what the store now holds
        let after = db.get_rule("r1").await.unwrap().unwrap();
        for p in &prediction.per_user_projection {
            assert_eq!(after.quota(&p.user_id).unwrap().balance, p.projected_balance);
        }

        // preview names the same moves the executor made
        for m in &prediction.plan_preview {
            let lead = crm.get(&m.lead_id).await.unwrap().unwrap();
            assert_eq!(lead.owner_id.as_deref(), Some(m.target_user_id.as_str()));
        }
    }

    #[tokio::test]
    async fn test_prediction_never_writes() {
        let crm = Arc::new(SqliteCrm::open_in_memory().unwrap());
        let db = Arc::new(TransferDb::open_in_memory().unwrap());
        let clock = Arc::new(FixedClock::new(at_local(11)));
        testkit::seed(&crm, "a", 3, clock.now());
        db.insert_rule(&fixtures::rule("r1", &["a"], &["b"])).await.unwrap();

        let predictor = PredictionService::new(db.clone(), crm.clone()).with_clock(clock.clone());
        let prediction = predictor.predict("r1").await.unwrap();
        assert_eq!(prediction.pending_count, 3);
        assert_eq!(prediction.plan_preview[0].source_user_name, "A");

        let rule = db.get_rule("r1").await.unwrap().unwrap();
        assert!(rule.user_quotas.iter().all(|q| q.transferred_out == 0 && q.transferred_in == 0));
        assert!(rule.statistics.last_executed_at.is_none());
        assert!(crm.list_leads().unwrap().iter().all(|l| l.owner_id.as_deref() == Some("a")));
        assert!(matches!(predictor.predict("nope").await, Err(LeadFlowError::RuleNotFound(_))));
    }

    #[tokio::test]
    async fn test_empty_prediction_projects_zero_for_everyone() {
        let crm = Arc::new(SqliteCrm::open_in_memory().unwrap());
        let db = Arc::new(TransferDb::open_in_memory().unwrap());
        let mut rule = fixtures::rule("r1", &["a"], &["b", "c"]);
        rule.execution_window.enabled = true;
        db.insert_rule(&rule).await.unwrap();

        let clock = Arc::new(FixedClock::new(at_local(7)));
        let predictor = PredictionService::new(db.clone(), crm).with_clock(clock.clone());
        let prediction = predictor.predict("r1").await.unwrap();
        assert_eq!(prediction.pending_count, 0);
        assert_eq!(prediction.per_user_projection.len(), 3);
        assert!(prediction.per_user_projection.iter().all(|p| p.projected_balance == 0));

        // before the window: today's start
        let start = at_local(9) + Duration::minutes(15);
        assert_eq!(prediction.next_execution_time, start);

        // after the window: tomorrow's start
        clock.set(at_local(20));
        let prediction = predictor.predict("r1").await.unwrap();
        assert_eq!(prediction.next_execution_time, start + Duration::days(1));
    }

    #[tokio::test]
    async fn test_unknown_names_fall_back() {
        let crm = Arc::new(SqliteCrm::open_in_memory().unwrap());
        let db = Arc::new(TransferDb::open_in_memory().unwrap());
        let clock = Arc::new(FixedClock::new(at_local(11)));
        testkit::seed(&crm, "a", 1, clock.now());
        let mut rule = fixtures::rule("r1", &["a"], &["b"]);
        for q in rule.user_quotas.iter_mut() {
            q.user_name.clear();
        }
        db.insert_rule(&rule).await.unwrap();
        crm.upsert_user("a", "Alice", &leadflow_core::lead::UserRole::Sales).unwrap();

        let predictor = PredictionService::new(db, crm.clone())
            .with_directory(crm)
            .with_clock(clock);
        let prediction = predictor.predict("r1").await.unwrap();
        assert_eq!(prediction.plan_preview[0].source_user_name, "Alice");
        assert_eq!(prediction.plan_preview[0].target_user_name, "unknown");
    }
}
