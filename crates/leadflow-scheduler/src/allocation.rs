//! Allocation engine: turns a rule's candidates into a transfer plan.
//!
//! The default strategy flattens every source's candidates, shuffles them,
//! and deals them out over the recipient list with one rotating cursor,
//! skipping a recipient who already owns the lead. Every tally built here is
//! local to one call and returned with the plan.

use leadflow_core::lead::Candidate;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeMap;

use crate::rule::{Strategy, TransferRule, UserQuota};

/// One proposed ownership move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub lead_id: String,
    pub from_user_id: String,
    pub to_user_id: String,
}

/// Result of one allocation call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub entries: Vec<PlanEntry>,
    /// Received count per recipient, including recipients that got nothing.
    pub received: BTreeMap<String, u32>,
    /// Candidates that could not be placed this cycle.
    pub skipped: Vec<Candidate>,
}

impl AllocationPlan {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Where a cycle's RNG comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RngSource {
    Entropy,
    Seeded(u64),
}

impl RngSource {
    pub fn from_seed(seed: Option<u64>) -> Self {
        seed.map_or(RngSource::Entropy, RngSource::Seeded)
    }

    pub fn make(&self) -> StdRng {
        match self {
            RngSource::Entropy => StdRng::from_entropy(),
            RngSource::Seeded(seed) => StdRng::seed_from_u64(*seed),
        }
    }
}

/// Recipients in cursor order. With compensation on, the most-owed
/// recipients come first; ties keep quota order.
pub fn recipient_order(rule: &TransferRule) -> Vec<&UserQuota> {
    let mut recipients = rule.recipients();
    if rule.distribution_config.enable_compensation {
        recipients.sort_by_key(|q| Reverse(q.balance + q.pending_compensation));
    }
    recipients
}

/// Build the plan for `rule` from candidates grouped by source owner.
pub fn allocate<R: Rng + ?Sized>(
    rule: &TransferRule,
    candidates_by_source: &BTreeMap<String, Vec<Candidate>>,
    rng: &mut R,
) -> AllocationPlan {
    let mut flat: Vec<Candidate> = candidates_by_source.values().flatten().cloned().collect();
    if flat.is_empty() {
        return AllocationPlan::default();
    }

    let recipients = recipient_order(rule);
    if recipients.is_empty() {
        tracing::error!(
            "❌ Rule '{}' has no recipients; {} candidate(s) left in place",
            rule.rule_name,
            flat.len()
        );
        return AllocationPlan { skipped: flat, ..Default::default() };
    }

    flat.shuffle(rng);

    let plan = match rule.distribution_config.strategy {
        Strategy::BalancedRandom => round_robin(rule, &recipients, flat),
        Strategy::WeightedRandom => weighted(rule, &recipients, flat, rng),
    };
    log_plan(rule, &plan);
    plan
}

fn empty_tally(recipients: &[&UserQuota]) -> BTreeMap<String, u32> {
    recipients.iter().map(|q| (q.user_id.clone(), 0)).collect()
}

fn round_robin(rule: &TransferRule, recipients: &[&UserQuota], flat: Vec<Candidate>) -> AllocationPlan {
    let count = recipients.len();
    let mut plan = AllocationPlan { received: empty_tally(recipients), ..Default::default() };
    let mut cursor = 0usize;

    for candidate in flat {
        let mut chosen = None;
        for _ in 0..count {
            let q = recipients[cursor];
            if q.user_id != candidate.current_owner_id {
                chosen = Some(q);
                break;
            }
            cursor = (cursor + 1) % count;
        }
        match chosen {
            Some(q) => {
                *plan.received.entry(q.user_id.clone()).or_default() += 1;
                plan.entries.push(PlanEntry {
                    lead_id: candidate.lead_id,
                    from_user_id: candidate.current_owner_id,
                    to_user_id: q.user_id.clone(),
                });
                cursor = (cursor + 1) % count;
            }
            None => {
                tracing::warn!(
                    "⚠️ Rule '{}': no recipient other than owner {} for lead {}, retry next cycle",
                    rule.rule_name,
                    candidate.current_owner_id,
                    candidate.lead_id
                );
                plan.skipped.push(candidate);
            }
        }
    }
    plan
}

/// Legacy balance-weighted draw, one candidate at a time.
fn weighted<R: Rng + ?Sized>(
    rule: &TransferRule,
    recipients: &[&UserQuota],
    flat: Vec<Candidate>,
    rng: &mut R,
) -> AllocationPlan {
    let config = &rule.distribution_config;
    let mut plan = AllocationPlan { received: empty_tally(recipients), ..Default::default() };
    let mut balances: BTreeMap<String, i64> = rule
        .user_quotas
        .iter()
        .map(|q| (q.user_id.clone(), q.balance))
        .collect();

    for candidate in flat {
        let eligible: Vec<(&UserQuota, u64)> = recipients
            .iter()
            .filter(|q| q.user_id != candidate.current_owner_id)
            .map(|q| {
                let weight = if config.enable_compensation {
                    let balance = balances.get(&q.user_id).copied().unwrap_or(0);
                    (1 + balance * config.compensation_priority as i64).max(1) as u64
                } else {
                    1
                };
                (*q, weight)
            })
            .collect();

        let total: u64 = eligible.iter().map(|(_, w)| w).sum();
        if total == 0 {
            tracing::warn!(
                "⚠️ Rule '{}': no recipient other than owner {} for lead {}, retry next cycle",
                rule.rule_name,
                candidate.current_owner_id,
                candidate.lead_id
            );
            plan.skipped.push(candidate);
            continue;
        }

        let mut draw = rng.gen_range(0..total);
        let mut chosen = eligible[eligible.len() - 1].0;
        for (q, w) in &eligible {
            if draw < *w {
                chosen = *q;
                break;
            }
            draw -= w;
        }

        *balances.entry(chosen.user_id.clone()).or_default() -= 1;
        *balances.entry(candidate.current_owner_id.clone()).or_default() += 1;
        *plan.received.entry(chosen.user_id.clone()).or_default() += 1;
        plan.entries.push(PlanEntry {
            lead_id: candidate.lead_id,
            from_user_id: candidate.current_owner_id,
            to_user_id: chosen.user_id.clone(),
        });
    }
    plan
}

fn log_plan(rule: &TransferRule, plan: &AllocationPlan) {
    let n = plan.entries.len();
    let describe = |e: &PlanEntry| {
        format!(
            "{}: {} -> {}",
            e.lead_id,
            rule.user_name(&e.from_user_id),
            rule.user_name(&e.to_user_id)
        )
    };
    if n <= 10 {
        for (i, e) in plan.entries.iter().enumerate() {
            tracing::debug!("  [{}] {}", i + 1, describe(e));
        }
    } else {
        for (i, e) in plan.entries.iter().take(5).enumerate() {
            tracing::debug!("  [{}] {}", i + 1, describe(e));
        }
        tracing::debug!("  ... {} more ...", n - 10);
        for (i, e) in plan.entries.iter().enumerate().skip(n - 5) {
            tracing::debug!("  [{}] {}", i + 1, describe(e));
        }
    }
    let tally: Vec<String> = plan
        .received
        .iter()
        .map(|(id, c)| format!("{}={}", rule.user_name(id), c))
        .collect();
    tracing::info!(
        "📋 Rule '{}': planned {} move(s), skipped {} [{}]",
        rule.rule_name,
        n,
        plan.skipped.len(),
        tally.join(", ")
    );
}
