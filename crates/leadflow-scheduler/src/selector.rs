//! Candidate selection: which leads a rule may move this cycle.

use chrono::{DateTime, Duration, Utc};
use leadflow_core::error::Result;
use leadflow_core::lead::{Candidate, LeadFilter};
use leadflow_core::traits::lead_store::LeadStore;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::rule::TransferRule;

/// Per-invocation candidate ceiling.
pub const BATCH_LIMIT: usize = 100;

pub struct CandidateSelector {
    leads: Arc<dyn LeadStore>,
    batch_limit: usize,
}

impl CandidateSelector {
    pub fn new(leads: Arc<dyn LeadStore>) -> Self {
        Self { leads, batch_limit: BATCH_LIMIT }
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit.max(1);
        self
    }

    /// The compound lead filter for `rule` evaluated at `now`.
    pub fn filter_for(&self, rule: &TransferRule, now: DateTime<Utc>) -> LeadFilter {
        let trigger = &rule.trigger_conditions;
        LeadFilter {
            owner_ids: rule.source_user_ids(),
            statuses: trigger.contract_statuses.iter().cloned().collect(),
            inactive_before: now - Duration::hours(trigger.inactive_hours as i64),
            lead_sources: trigger.lead_sources.iter().cloned().collect(),
            created_from: trigger.created_date_range.start,
            created_to: trigger.created_date_range.end,
            limit: self.batch_limit,
        }
    }

    /// Eligible leads for `rule`, capped at the batch limit.
    pub async fn select(&self, rule: &TransferRule, now: DateTime<Utc>) -> Result<Vec<Candidate>> {
        let filter = self.filter_for(rule, now);
        let leads = self.leads.find(&filter).await?;
        let candidates: Vec<Candidate> = leads
            .into_iter()
            .take(self.batch_limit)
            .filter_map(|lead| {
                lead.owner_id.map(|owner| Candidate {
                    lead_id: lead.id,
                    current_owner_id: owner,
                })
            })
            .collect();
        tracing::debug!(
            "🔎 Rule '{}': {} candidate(s) (limit {})",
            rule.rule_name,
            candidates.len(),
            self.batch_limit
        );
        Ok(candidates)
    }
}

/// Group candidates by their current owner, keeping query order within each group.
pub fn group_by_source(candidates: Vec<Candidate>) -> BTreeMap<String, Vec<Candidate>> {
    let mut groups: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
    for c in candidates {
        groups.entry(c.current_owner_id.clone()).or_default().push(c);
    }
    groups
}
