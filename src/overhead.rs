// 🏢 Overhead Redistributor - spreads "General" costs over active projects
//
// For a share on the overhead project in month M, each (project, pct) of M's
// distribution receives amount * pct / 100, provided the project is active in M.
// Anything not handed out stays on the overhead project. Money is never dropped
// and never sent to an inactive project.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::allocation::{proportion, settle_residue, IntegrityIssue, ResolvedShare};
use crate::entities::{CostObjectRegistry, EntityRef, ProjectId};
use crate::error::DistributionError;
use crate::month::Month;

// ============================================================================
// MONTHLY DISTRIBUTION
// ============================================================================

/// Percentage table governing one month's overhead redistribution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyDistribution {
    pub month: Month,
    pub percentages: BTreeMap<ProjectId, u32>,
}

impl MonthlyDistribution {
    pub fn new(month: Month) -> Self {
        MonthlyDistribution {
            month,
            percentages: BTreeMap::new(),
        }
    }

    pub fn with(mut self, project_id: impl Into<String>, percentage: u32) -> Self {
        self.percentages.insert(ProjectId::new(project_id), percentage);
        self
    }

    pub fn percentage_sum(&self) -> u32 {
        self.percentages.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.percentages.is_empty()
    }

    /// Write-time validation; the redistributor tolerates violations
    pub fn validate(&self, overhead_project: Option<&ProjectId>) -> Result<(), DistributionError> {
        for (project, &percentage) in &self.percentages {
            if percentage > 100 {
                return Err(DistributionError::PercentageOutOfRange {
                    month: self.month,
                    project: project.to_string(),
                    percentage,
                });
            }
            if overhead_project == Some(project) {
                return Err(DistributionError::TargetsOverhead { month: self.month });
            }
        }

        let sum = self.percentage_sum();
        if sum > 100 {
            return Err(DistributionError::OverSubscribed {
                month: self.month,
                sum,
            });
        }
        Ok(())
    }
}

/// All configured months. Unconfigured months redistribute nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DistributionTable {
    months: BTreeMap<Month, MonthlyDistribution>,
}

impl DistributionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, distribution: MonthlyDistribution) {
        if distribution.is_empty() {
            self.months.remove(&distribution.month);
        } else {
            self.months.insert(distribution.month, distribution);
        }
    }

    pub fn with(mut self, distribution: MonthlyDistribution) -> Self {
        self.insert(distribution);
        self
    }

    pub fn get(&self, month: Month) -> Option<&MonthlyDistribution> {
        self.months.get(&month)
    }

    pub fn months(&self) -> impl Iterator<Item = &MonthlyDistribution> {
        self.months.values()
    }

    pub fn len(&self) -> usize {
        self.months.len()
    }

    pub fn is_empty(&self) -> bool {
        self.months.is_empty()
    }
}

impl FromIterator<MonthlyDistribution> for DistributionTable {
    fn from_iter<I: IntoIterator<Item = MonthlyDistribution>>(iter: I) -> Self {
        let mut table = DistributionTable::new();
        for distribution in iter {
            table.insert(distribution);
        }
        table
    }
}

// ============================================================================
// REDISTRIBUTION
// ============================================================================

/// Whether `project_id` may receive overhead in `month`
pub fn is_eligible_target(project_id: &ProjectId, month: Month, registry: &CostObjectRegistry) -> bool {
    !registry.is_overhead(project_id)
        && registry
            .project(project_id)
            .map_or(false, |project| project.is_active_in(month))
}

/// Split an overhead share across the month's active distribution targets.
///
/// The returned shares always sum to `share.amount_minor`; whatever is not
/// redistributed comes back as a share on the overhead project.
pub fn redistribute(
    share: ResolvedShare,
    month: Month,
    registry: &CostObjectRegistry,
    distributions: &DistributionTable,
    issues: &mut Vec<IntegrityIssue>,
) -> Vec<ResolvedShare> {
    let Some(distribution) = distributions.get(month) else {
        return vec![share];
    };

    let configured = distribution.percentage_sum();
    if configured == 0 {
        return vec![share];
    }

    // A sum above 100 cannot come from a validated write; scale it down
    // instead of handing out more than the share holds
    let denominator = if configured > 100 {
        issues.push(IntegrityIssue::DistributionOverSubscribed {
            month,
            percentage_sum: configured,
        });
        configured
    } else {
        100
    };

    let mut targets: Vec<(&ProjectId, u32)> = Vec::new();
    for (project_id, &percentage) in &distribution.percentages {
        if percentage == 0 {
            continue;
        }
        if is_eligible_target(project_id, month, registry) {
            targets.push((project_id, percentage));
        } else {
            debug!(%month, project = %project_id, "overhead target not active, kept on overhead");
        }
    }

    if targets.is_empty() {
        return vec![share];
    }

    let weights: Vec<u32> = targets.iter().map(|(_, pct)| *pct).collect();
    let mut amounts: Vec<i64> = weights
        .iter()
        .map(|&pct| proportion(share.amount_minor, pct, denominator))
        .collect();

    if weights.iter().sum::<u32>() == denominator {
        settle_residue(&mut amounts, &weights, share.amount_minor);
    }

    let remainder = share.amount_minor - amounts.iter().sum::<i64>();

    let mut out: Vec<ResolvedShare> = targets
        .into_iter()
        .zip(amounts)
        .map(|((project_id, _), amount_minor)| ResolvedShare {
            entity: EntityRef::Project(project_id.clone()),
            client_id: registry.owning_client(project_id).cloned(),
            amount_minor,
            redistributed: true,
        })
        .collect();

    if remainder != 0 {
        out.push(ResolvedShare {
            amount_minor: remainder,
            ..share
        });
    }

    out
}

// ============================================================================
// TESTS
// ============================================================================
