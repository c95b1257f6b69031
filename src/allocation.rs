// 🧮 Allocation Resolver - who owns each transaction, and how much
//
// Resolution order (first match wins):
//   1. explicit Allocation splits
//   2. direct project / client fields
//   3. nothing (unassigned)
// Shares landing on the overhead project are then redistributed per month.
//
// All arithmetic is integer minor units with round-half-to-even.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::entities::{ClientId, CostObjectRegistry, EntityRef, ProjectId, Transaction, TransactionId};
use crate::month::Month;
use crate::overhead::{self, DistributionTable};

// ============================================================================
// ALLOCATION
// ============================================================================

/// One row of a fractional split
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Split {
    #[serde(default)]
    pub project_id: Option<ProjectId>,

    #[serde(default)]
    pub client_id: Option<ClientId>,

    /// Whole percent, 0..=100
    pub percentage: u32,
}

impl Split {
    pub fn project(project_id: impl Into<String>, percentage: u32) -> Self {
        Split {
            project_id: Some(ProjectId::new(project_id)),
            client_id: None,
            percentage,
        }
    }

    pub fn client(client_id: impl Into<String>, percentage: u32) -> Self {
        Split {
            project_id: None,
            client_id: Some(ClientId::new(client_id)),
            percentage,
        }
    }

    pub fn project_for_client(
        project_id: impl Into<String>,
        client_id: impl Into<String>,
        percentage: u32,
    ) -> Self {
        Split {
            project_id: Some(ProjectId::new(project_id)),
            client_id: Some(ClientId::new(client_id)),
            percentage,
        }
    }

    pub fn target(&self) -> Option<EntityRef> {
        EntityRef::from_pair(self.project_id.as_ref(), self.client_id.as_ref())
    }

    pub fn has_target(&self) -> bool {
        self.project_id.is_some() || self.client_id.is_some()
    }
}

/// Ordered fractional split of one transaction.
/// Supersedes the transaction's direct fields when present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub transaction_id: TransactionId,
    pub splits: Vec<Split>,
}

impl Allocation {
    pub fn new(transaction_id: TransactionId, splits: Vec<Split>) -> Self {
        Allocation {
            transaction_id,
            splits,
        }
    }

    pub fn percentage_sum(&self) -> u32 {
        self.splits.iter().map(|s| s.percentage).sum()
    }
}

// ============================================================================
// RESOLUTION
// ============================================================================

/// A concrete attribution of part of a transaction to one cost object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedShare {
    pub entity: EntityRef,

    /// Client this share rolls up into (the target itself for client shares)
    pub client_id: Option<ClientId>,

    /// Signed, same sign as the parent transaction
    pub amount_minor: i64,

    /// Set when the share was moved off the overhead project
    #[serde(default)]
    pub redistributed: bool,
}

/// Stored data that violates an invariant; reported, never fatal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum IntegrityIssue {
    /// Splits beyond 100% were ignored
    AllocationOverSubscribed { percentage_sum: u32 },
    SplitWithoutTarget { index: usize },
    UnknownTarget { entity: EntityRef },
    /// Month's distribution was renormalized against its sum
    DistributionOverSubscribed { month: Month, percentage_sum: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub transaction_id: TransactionId,
    pub shares: Vec<ResolvedShare>,

    /// Part of the signed amount attributed to nobody
    pub unallocated_amount_minor: i64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<IntegrityIssue>,
}

impl Resolution {
    pub fn attributed_minor(&self) -> i64 {
        self.shares.iter().map(|s| s.amount_minor).sum()
    }

    pub fn is_fully_allocated(&self) -> bool {
        self.unallocated_amount_minor == 0
    }
}

// ============================================================================
// ROUNDING
// ============================================================================

/// `numerator / denominator` rounded half-to-even. `denominator` must be positive.
pub fn div_round_half_even(numerator: i128, denominator: i128) -> i128 {
    debug_assert!(denominator > 0);
    let quotient = numerator.div_euclid(denominator);
    let remainder = numerator.rem_euclid(denominator);
    let twice = remainder * 2;

    if twice > denominator || (twice == denominator && quotient % 2 != 0) {
        quotient + 1
    } else {
        quotient
    }
}

/// `amount * weight / total`, rounded half-to-even
pub fn proportion(amount_minor: i64, weight: u32, total: u32) -> i64 {
    if total == 0 {
        return 0;
    }
    let scaled = div_round_half_even(amount_minor as i128 * weight as i128, total as i128);
    // |scaled| <= |amount| whenever weight <= total
    scaled.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Push the rounding residue onto the heaviest share (first on ties) so the
/// amounts add up to `target_total` exactly
pub(crate) fn settle_residue(amounts: &mut [i64], weights: &[u32], target_total: i64) {
    let residue = target_total - amounts.iter().sum::<i64>();
    if residue == 0 {
        return;
    }
    let heaviest = weights
        .iter()
        .enumerate()
        .fold(None::<(usize, u32)>, |best, (i, &w)| match best {
            Some((_, bw)) if bw >= w => best,
            _ => Some((i, w)),
        });
    if let Some((index, _)) = heaviest {
        amounts[index] += residue;
    }
}

// ============================================================================
// RESOLVER
// ============================================================================

/// Resolve a transaction into per-entity shares.
///
/// Total over well-typed input: malformed stored allocations are clamped and
/// reported through `issues` and `unallocated_amount_minor`.
pub fn resolve(
    transaction: &Transaction,
    registry: &CostObjectRegistry,
    distributions: &DistributionTable,
) -> Resolution {
    let mut issues = Vec::new();

    let direct_shares = match &transaction.allocation {
        Some(allocation) => resolve_splits(transaction, allocation, registry, &mut issues),
        None => resolve_direct(transaction, registry, &mut issues),
    };

    let month = transaction.month();
    let mut shares = Vec::with_capacity(direct_shares.len());
    for share in direct_shares {
        match &share.entity {
            EntityRef::Project(id) if registry.is_overhead(id) => {
                shares.extend(overhead::redistribute(
                    share,
                    month,
                    registry,
                    distributions,
                    &mut issues,
                ));
            }
            _ => shares.push(share),
        }
    }

    let attributed: i64 = shares.iter().map(|s| s.amount_minor).sum();

    for issue in &issues {
        warn!(transaction = %transaction.id, ?issue, "allocation integrity issue");
    }

    Resolution {
        transaction_id: transaction.id.clone(),
        shares,
        unallocated_amount_minor: transaction.amount_minor - attributed,
        issues,
    }
}

fn rollup_client(
    entity: &EntityRef,
    named_client: Option<&ClientId>,
    registry: &CostObjectRegistry,
) -> Option<ClientId> {
    match entity {
        EntityRef::Client(id) => Some(id.clone()),
        EntityRef::Project(id) => registry
            .owning_client(id)
            .or_else(|| named_client.filter(|c| registry.client(c).is_some()))
            .cloned(),
    }
}

fn resolve_direct(
    transaction: &Transaction,
    registry: &CostObjectRegistry,
    issues: &mut Vec<IntegrityIssue>,
) -> Vec<ResolvedShare> {
    let Some(entity) = transaction.direct_target() else {
        return Vec::new();
    };

    if !registry.contains(&entity) {
        issues.push(IntegrityIssue::UnknownTarget { entity });
        return Vec::new();
    }

    let client_id = rollup_client(&entity, transaction.direct_client_id.as_ref(), registry);
    vec![ResolvedShare {
        entity,
        client_id,
        amount_minor: transaction.amount_minor,
        redistributed: false,
    }]
}

fn resolve_splits(
    transaction: &Transaction,
    allocation: &Allocation,
    registry: &CostObjectRegistry,
    issues: &mut Vec<IntegrityIssue>,
) -> Vec<ResolvedShare> {
    let mut consumed: u32 = 0;
    let mut accepted: Vec<(EntityRef, Option<ClientId>, u32)> = Vec::new();

    for (index, split) in allocation.splits.iter().enumerate() {
        let Some(entity) = split.target() else {
            issues.push(IntegrityIssue::SplitWithoutTarget { index });
            continue;
        };

        if consumed.saturating_add(split.percentage) > 100 {
            issues.push(IntegrityIssue::AllocationOverSubscribed {
                percentage_sum: allocation.percentage_sum(),
            });
            continue;
        }
        consumed += split.percentage;

        if !registry.contains(&entity) {
            issues.push(IntegrityIssue::UnknownTarget { entity });
            continue;
        }

        let client_id = rollup_client(&entity, split.client_id.as_ref(), registry);
        accepted.push((entity, client_id, split.percentage));
    }

    let weights: Vec<u32> = accepted.iter().map(|(_, _, pct)| *pct).collect();
    let mut amounts: Vec<i64> = weights
        .iter()
        .map(|&pct| proportion(transaction.amount_minor, pct, 100))
        .collect();

    if weights.iter().sum::<u32>() == 100 {
        settle_residue(&mut amounts, &weights, transaction.amount_minor);
    }

    accepted
        .into_iter()
        .zip(amounts)
        .map(|((entity, client_id, _), amount_minor)| ResolvedShare {
            entity,
            client_id,
            amount_minor,
            redistributed: false,
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
