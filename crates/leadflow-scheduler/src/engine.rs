//! Scheduler engine: gates rules, runs select → allocate → execute cycles,
//! and fans out per-user notices afterwards.
//! Cycles of the same rule never overlap: scheduled and manual runs share
//! one async lock per rule id.

use chrono::{DateTime, FixedOffset, Utc};
use leadflow_core::config::SchedulerConfig;
use leadflow_core::error::{LeadFlowError, Result};
use leadflow_core::traits::lead_store::LeadStore;
use leadflow_core::traits::notifier::{AuditNotifier, TransferNotice};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::allocation::{AllocationPlan, RngSource, allocate};
use crate::clock::{Clock, SystemClock};
use crate::executor::{ApplyOutcome, PostTransferHook, TransferExecutor};
use crate::rule::TransferRule;
use crate::selector::{BATCH_LIMIT, CandidateSelector, group_by_source};
use crate::store::{RecordStore, RuleStore};
use crate::window;

/// Runtime knobs shared by the scheduler and the prediction service.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub offset: FixedOffset,
    pub batch_limit: usize,
    pub rng: RngSource,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            offset: window::offset_from_minutes(480),
            batch_limit: BATCH_LIMIT,
            rng: RngSource::Entropy,
        }
    }
}

impl SchedulerSettings {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            offset: window::offset_from_minutes(config.utc_offset_minutes),
            batch_limit: config.batch_limit,
            rng: RngSource::from_seed(config.rng_seed),
        }
    }
}

/// What a cycle may do with a rule right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Run,
    Disabled,
    WindowClosed,
}

/// Evaluate the per-rule state machine. `manual` forces the window open.
pub fn gate(rule: &TransferRule, now: DateTime<Utc>, offset: FixedOffset, manual: bool) -> Gate {
    if !rule.enabled {
        Gate::Disabled
    } else if !manual && !window::is_open(&rule.execution_window, now, offset) {
        Gate::WindowClosed
    } else {
        Gate::Run
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleStatus {
    Completed,
    Skipped,
    Failed,
}

/// Movement of one user within one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCycleStats {
    pub user_id: String,
    pub user_name: String,
    pub transferred_out: u32,
    pub transferred_in: u32,
}

/// Outcome of one rule's cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleResult {
    pub rule_id: String,
    pub rule_name: String,
    pub status: CycleStatus,
    pub transferred_count: u32,
    pub failed_count: u32,
    pub skipped_count: u32,
    pub user_stats: Vec<UserCycleStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CycleResult {
    fn empty(rule: &TransferRule, status: CycleStatus, message: Option<String>) -> Self {
        Self {
            rule_id: rule.id.clone(),
            rule_name: rule.rule_name.clone(),
            status,
            transferred_count: 0,
            failed_count: 0,
            skipped_count: 0,
            user_stats: Vec::new(),
            message,
        }
    }
}

/// Select and allocate for `rule` exactly as a cycle would, without writing.
pub(crate) async fn build_plan(
    leads: Arc<dyn LeadStore>,
    settings: &SchedulerSettings,
    rule: &TransferRule,
    now: DateTime<Utc>,
) -> Result<AllocationPlan> {
    let selector = CandidateSelector::new(leads).with_batch_limit(settings.batch_limit);
    let candidates = selector.select(rule, now).await?;
    let groups = group_by_source(candidates);
    let mut rng = settings.rng.make();
    Ok(allocate(rule, &groups, &mut rng))
}

/// Log out/in/balance per quota user with an owed/surplus/even word.
pub fn log_balance_report(rule: &TransferRule) {
    tracing::info!("⚖️ Balance report for '{}':", rule.rule_name);
    for q in &rule.user_quotas {
        tracing::info!(
            "  {} ({}): out={} in={} balance={} [{}]",
            q.user_name,
            q.role,
            q.transferred_out,
            q.transferred_in,
            q.balance,
            q.balance_status()
        );
    }
}

/// The auto-transfer scheduler.
pub struct Scheduler {
    rules: Arc<dyn RuleStore>,
    records: Arc<dyn RecordStore>,
    leads: Arc<dyn LeadStore>,
    notifier: Option<Arc<dyn AuditNotifier>>,
    hooks: Vec<Arc<dyn PostTransferHook>>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Scheduler {
    pub fn new(
        rules: Arc<dyn RuleStore>,
        records: Arc<dyn RecordStore>,
        leads: Arc<dyn LeadStore>,
    ) -> Self {
        Self {
            rules,
            records,
            leads,
            notifier: None,
            hooks: Vec::new(),
            clock: Arc::new(SystemClock),
            settings: SchedulerSettings::default(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn AuditNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn PostTransferHook>) -> Self {
        self.hooks.push(hook);
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

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    async fn rule_lock(&self, rule_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(rule_id.to_string())
            .or_default()
            .clone()
    }

    /// One scheduled pass over every enabled rule.
    /// Failures of one rule never stop the others.
    pub async fn run_cycle(&self) -> Vec<CycleResult> {
        self.run_all(Trigger::Scheduled).await
    }

    /// Manual trigger for every enabled rule, window gate forced open.
    pub async fn execute_all_now(&self) -> Vec<CycleResult> {
        self.run_all(Trigger::Manual).await
    }

    /// Manual trigger for one rule. Rejects unknown or disabled rules.
    pub async fn execute_rule_now(&self, rule_id: &str) -> Result<CycleResult> {
        self.run_rule(rule_id, Trigger::Manual).await
    }

    async fn run_all(&self, trigger: Trigger) -> Vec<CycleResult> {
        let rules = match self.rules.enabled_rules().await {
            Ok(rules) => rules,
            Err(e) => {
                tracing::error!("❌ Could not load enabled rules: {e}");
                return Vec::new();
            }
        };
        tracing::info!("⏰ Cycle over {} enabled rule(s) ({:?})", rules.len(), trigger);

        let mut results = Vec::with_capacity(rules.len());
        for rule in &rules {
            match self.run_rule(&rule.id, trigger).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!("❌ Rule '{}' aborted: {e}", rule.rule_name);
                    results.push(CycleResult::empty(rule, CycleStatus::Failed, Some(e.to_string())));
                }
            }
        }
        results
    }

    async fn run_rule(&self, rule_id: &str, trigger: Trigger) -> Result<CycleResult> {
        let lock = self.rule_lock(rule_id).await;
        let _guard = lock.lock().await;

        // reload under the lock so counters reflect any run that just finished
        let Some(rule) = self.rules.get_rule(rule_id).await? else {
            self.locks.lock().await.remove(rule_id);
            return Err(LeadFlowError::RuleNotFound(rule_id.to_string()));
        };
        let now = self.clock.now();

        match gate(&rule, now, self.settings.offset, trigger == Trigger::Manual) {
            Gate::Disabled if trigger == Trigger::Manual => {
                Err(LeadFlowError::RuleDisabled(rule.rule_name.clone()))
            }
            Gate::Disabled => Ok(CycleResult::empty(&rule, CycleStatus::Skipped, Some("disabled".into()))),
            Gate::WindowClosed => {
                tracing::debug!("⏸️ Rule '{}' outside its execution window", rule.rule_name);
                Ok(CycleResult::empty(&rule, CycleStatus::Skipped, Some("outside execution window".into())))
            }
            Gate::Run => self.execute(&rule, now).await,
        }
    }

    async fn execute(&self, rule: &TransferRule, now: DateTime<Utc>) -> Result<CycleResult> {
        tracing::info!("🚚 Running rule '{}' ({})", rule.rule_name, rule.id);
        let plan = build_plan(self.leads.clone(), &self.settings, rule, now).await?;

        let mut executor = TransferExecutor::new(self.leads.clone(), self.rules.clone(), self.records.clone())
            .with_hooks(self.hooks.clone());
        let mut result = CycleResult::empty(rule, CycleStatus::Completed, None);
        result.skipped_count = plan.skipped.len() as u32;
        let mut moves: BTreeMap<&str, (u32, u32)> = BTreeMap::new();

        for entry in &plan.entries {
            match executor.apply(entry, rule, now).await {
                Ok(ApplyOutcome::Transferred(_)) => {
                    result.transferred_count += 1;
                    moves.entry(entry.from_user_id.as_str()).or_default().0 += 1;
                    moves.entry(entry.to_user_id.as_str()).or_default().1 += 1;
                }
                Ok(ApplyOutcome::Skipped(_)) => result.skipped_count += 1,
                Err(_) => result.failed_count += 1,
            }
        }

        // quota order first, then anyone the rule no longer lists
        for q in &rule.user_quotas {
            if let Some((out, inn)) = moves.remove(q.user_id.as_str()) {
                result.user_stats.push(UserCycleStats {
                    user_id: q.user_id.clone(),
                    user_name: q.user_name.clone(),
                    transferred_out: out,
                    transferred_in: inn,
                });
            }
        }
        for (user_id, (out, inn)) in moves {
            result.user_stats.push(UserCycleStats {
                user_id: user_id.to_string(),
                user_name: user_id.to_string(),
                transferred_out: out,
                transferred_in: inn,
            });
        }

        if let Err(e) = self
            .rules
            .record_execution(&rule.id, result.transferred_count, now)
            .await
        {
            tracing::warn!("⚠️ Statistics for rule '{}' not updated: {e}", rule.rule_name);
        }

        tracing::info!(
            "✅ Rule '{}': transferred={} failed={} skipped={}",
            rule.rule_name,
            result.transferred_count,
            result.failed_count,
            result.skipped_count
        );

        self.notify(rule, &result, now).await;

        match self.rules.get_rule(&rule.id).await {
            Ok(Some(fresh)) => log_balance_report(&fresh),
            Ok(None) => {}
            Err(e) => tracing::warn!("⚠️ Balance report unavailable: {e}"),
        }
        Ok(result)
    }

    async fn notify(&self, rule: &TransferRule, result: &CycleResult, now: DateTime<Utc>) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        for stats in &result.user_stats {
            if stats.transferred_out == 0 && stats.transferred_in == 0 {
                continue;
            }
            let notice = TransferNotice {
                user_id: stats.user_id.clone(),
                user_name: stats.user_name.clone(),
                transferred_out_count: stats.transferred_out,
                transferred_in_count: stats.transferred_in,
                rule_name: rule.rule_name.clone(),
                cycle_timestamp: now,
            };
            if let Err(e) = notifier.notify(&notice).await {
                tracing::warn!(
                    "⚠️ Notifier '{}' failed for {}: {e}",
                    notifier.name(),
                    stats.user_id
                );
            }
        }
    }
}

/// Spawn the scheduler loop: one cycle at every local top of the hour.
pub async fn spawn_scheduler(scheduler: Arc<Scheduler>) {
    let clock = scheduler.clock();
    let offset = scheduler.settings().offset;
    tracing::info!("⏰ Auto-transfer scheduler started (hourly, UTC{})", offset);

    loop {
        let now = clock.now();
        let next = window::next_hour_boundary(now, offset);
        let wait = (next - now)
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(1));
        tracing::debug!("💤 Next cycle at {}", next);
        tokio::time::sleep(wait).await;

        let results = scheduler.run_cycle().await;
        let moved: u32 = results.iter().map(|r| r.transferred_count).sum();
        tracing::info!("📣 Cycle finished: {} rule(s), {} lead(s) moved", results.len(), moved);
    }
}
