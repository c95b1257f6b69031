// 📊 Profitability Aggregator - per-project / per-client income, expenses, margin
//
// Consumes resolved shares for a period and produces totals, trailing monthly
// series, client rollups, rankings, and the pending-review summary.
//
// Income vs expense is decided by the sign of the ORIGINAL transaction.
// Everything stays in integer minor units; only margin is a float.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::allocation::{resolve, IntegrityIssue};
use crate::entities::{ClientId, CostObjectRegistry, EntityRef, ProjectId, Transaction, TransactionId};
use crate::month::{Month, Period};
use crate::overhead::DistributionTable;
use crate::review::{classify, ReviewState};

pub const DEFAULT_TRAILING_MONTHS: usize = 6;
pub const DEFAULT_TOP_N: usize = 5;

// ============================================================================
// OPTIONS & OUTPUT TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateOptions {
    /// Months in each series, ending with the period's last month
    pub trailing_months: usize,

    /// Length of each ranking
    pub top_n: usize,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        AggregateOptions {
            trailing_months: DEFAULT_TRAILING_MONTHS,
            top_n: DEFAULT_TOP_N,
        }
    }
}

/// `net / income * 100`, and exactly 0 when there is no income
pub fn margin(income: i64, net: i64) -> f64 {
    if income > 0 {
        net as f64 / income as f64 * 100.0
    } else {
        0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyPoint {
    pub month: Month,
    pub income: i64,
    pub expenses: i64,
    pub net: i64,
    pub margin: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profitability {
    pub name: String,

    /// Non-negative
    pub income: i64,

    /// Non-negative
    pub expenses: i64,

    pub net: i64,
    pub margin: f64,
    pub series: Vec<MonthlyPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedEntity {
    pub entity: EntityRef,
    pub name: String,
    pub income: i64,
    pub net: i64,
    pub margin: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rankings {
    pub top_clients: Vec<RankedEntity>,
    pub top_projects: Vec<RankedEntity>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSummary {
    pub count: usize,
    pub ids: Vec<TransactionId>,
}

/// Period-wide figures across every attributed share
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub income: i64,
    pub expenses: i64,
    pub net: i64,
    pub margin: f64,

    /// Signed amount of in-period transactions attributed to nobody
    pub unallocated_minor: i64,

    pub transaction_count: usize,
    pub excluded_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityWarning {
    pub transaction_id: TransactionId,
    pub issue: IntegrityIssue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfitabilityReport {
    pub period: Period,
    pub by_project: BTreeMap<ProjectId, Profitability>,
    pub by_client: BTreeMap<ClientId, Profitability>,
    pub pending: PendingSummary,
    pub rankings: Rankings,
    pub totals: Totals,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub integrity: Vec<IntegrityWarning>,
}

// ============================================================================
// ACCUMULATION
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct Tally {
    income: i64,
    expenses: i64,
}

impl Tally {
    /// `parent_amount` decides the side; the share only supplies the magnitude
    fn add(&mut self, parent_amount: i64, share_amount: i64) {
        // i64::MIN has no positive counterpart; saturate instead of overflowing
        let magnitude = i64::try_from(share_amount.unsigned_abs()).unwrap_or(i64::MAX);
        if parent_amount > 0 {
            self.income = self.income.saturating_add(magnitude);
        } else if parent_amount < 0 {
            self.expenses = self.expenses.saturating_add(magnitude);
        }
    }

    fn net(&self) -> i64 {
        self.income.saturating_sub(self.expenses)
    }

    fn margin(&self) -> f64 {
        margin(self.income, self.net())
    }
}

#[derive(Debug, Default)]
struct EntityTally {
    period: Tally,
    months: BTreeMap<Month, Tally>,
}

impl EntityTally {
    fn add(&mut self, parent_amount: i64, share_amount: i64, month: Month, in_period: bool, in_series: bool) {
        if in_period {
            self.period.add(parent_amount, share_amount);
        }
        if in_series {
            self.months
                .entry(month)
                .or_default()
                .add(parent_amount, share_amount);
        }
    }

    fn finish(&self, name: String, series_months: &[Month]) -> Profitability {
        let series = series_months
            .iter()
            .map(|month| {
                let tally = self.months.get(month).copied().unwrap_or_default();
                MonthlyPoint {
                    month: *month,
                    income: tally.income,
                    expenses: tally.expenses,
                    net: tally.net(),
                    margin: tally.margin(),
                }
            })
            .collect();

        Profitability {
            name,
            income: self.period.income,
            expenses: self.period.expenses,
            net: self.period.net(),
            margin: self.period.margin(),
            series,
        }
    }
}

// ============================================================================
// AGGREGATE
// ============================================================================

/// Aggregate a snapshot into per-entity profitability for `period`.
///
/// Pure: never mutates its inputs, identical inputs give identical output.
/// Transactions outside the period still feed the trailing series.
pub fn aggregate(
    transactions: &[Transaction],
    registry: &CostObjectRegistry,
    distributions: &DistributionTable,
    period: &Period,
    options: &AggregateOptions,
) -> ProfitabilityReport {
    let series_months = period.last_month().trailing(options.trailing_months);
    let series_set: BTreeSet<Month> = series_months.iter().copied().collect();

    let mut projects: BTreeMap<ProjectId, EntityTally> = BTreeMap::new();
    let mut clients: BTreeMap<ClientId, EntityTally> = BTreeMap::new();
    let mut overall = Tally::default();
    let mut totals = Totals::default();
    let mut pending: Vec<&Transaction> = Vec::new();
    let mut integrity = Vec::new();

    for transaction in transactions {
        let month = transaction.month();
        let in_period = period.contains(transaction.occurred_at);
        let in_series = series_set.contains(&month);
        if !in_period && !in_series {
            continue;
        }

        let state = classify(transaction);
        if state == ReviewState::Excluded {
            if in_period {
                totals.excluded_count += 1;
            }
            continue;
        }

        let resolution = resolve(transaction, registry, distributions);

        if in_period {
            totals.transaction_count += 1;
            totals.unallocated_minor = totals.unallocated_minor.saturating_add(resolution.unallocated_amount_minor);
            if state == ReviewState::Unassigned {
                pending.push(transaction);
            }
            integrity.extend(resolution.issues.iter().cloned().map(|issue| IntegrityWarning {
                transaction_id: transaction.id.clone(),
                issue,
            }));
        }

        let parent = transaction.amount_minor;
        for share in &resolution.shares {
            if in_period {
                overall.add(parent, share.amount_minor);
            }
            if let EntityRef::Project(project_id) = &share.entity {
                projects
                    .entry(project_id.clone())
                    .or_default()
                    .add(parent, share.amount_minor, month, in_period, in_series);
            }
            // Client shares carry their own id as rollup client
            if let Some(client_id) = &share.client_id {
                clients
                    .entry(client_id.clone())
                    .or_default()
                    .add(parent, share.amount_minor, month, in_period, in_series);
            }
        }
    }

    pending.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at).then_with(|| a.id.cmp(&b.id)));
    let pending = PendingSummary {
        count: pending.len(),
        ids: pending.into_iter().map(|tx| tx.id.clone()).collect(),
    };

    totals.income = overall.income;
    totals.expenses = overall.expenses;
    totals.net = overall.net();
    totals.margin = overall.margin();

    let by_project: BTreeMap<ProjectId, Profitability> = projects
        .into_iter()
        .map(|(id, tally)| {
            let name = registry
                .project(&id)
                .map(|p| p.name.clone())
                .unwrap_or_else(|| id.to_string());
            let profitability = tally.finish(name, &series_months);
            (id, profitability)
        })
        .collect();

    let by_client: BTreeMap<ClientId, Profitability> = clients
        .into_iter()
        .map(|(id, tally)| {
            let name = registry
                .client(&id)
                .map(|c| c.name.clone())
                .unwrap_or_else(|| id.to_string());
            let profitability = tally.finish(name, &series_months);
            (id, profitability)
        })
        .collect();

    let rankings = Rankings {
        top_clients: rank(
            by_client
                .iter()
                .map(|(id, p)| (EntityRef::Client(id.clone()), p)),
            options.top_n,
        ),
        top_projects: rank(
            by_project
                .iter()
                .map(|(id, p)| (EntityRef::Project(id.clone()), p)),
            options.top_n,
        ),
    };

    debug!(
        projects = by_project.len(),
        clients = by_client.len(),
        pending = pending.count,
        "aggregated period {} .. {}",
        period.start,
        period.end
    );

    ProfitabilityReport {
        period: *period,
        by_project,
        by_client,
        pending,
        rankings,
        totals,
        integrity,
    }
}

/// Descending by income, ties broken by entity id
fn rank<'a>(
    entities: impl Iterator<Item = (EntityRef, &'a Profitability)>,
    top_n: usize,
) -> Vec<RankedEntity> {
    let mut ranked: Vec<RankedEntity> = entities
        .map(|(entity, p)| RankedEntity {
            entity,
            name: p.name.clone(),
            income: p.income,
            net: p.net,
            margin: p.margin,
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.income
            .cmp(&a.income)
            .then_with(|| a.entity.id().cmp(b.entity.id()))
    });
    ranked.truncate(top_n);
    ranked
}

// ============================================================================
// TESTS
// ============================================================================
