// 🔎 Review State Tracker - pending queue and allocation save rules
//
// States:
//   unassigned -> assigned   (allocation saved)
//   unassigned -> excluded   (explicit user action)
// Excluded transactions leave the queue and every aggregate, but stay in the ledger.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::allocation::{Allocation, Split};
use crate::entities::{ClientId, ProjectId, Transaction, TransactionId};
use crate::error::AllocationError;
use crate::month::Period;

// ============================================================================
// CLASSIFICATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewState {
    Unassigned,
    Assigned,
    Excluded,
}

impl ReviewState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewState::Unassigned => "unassigned",
            ReviewState::Assigned => "assigned",
            ReviewState::Excluded => "excluded",
        }
    }
}

impl fmt::Display for ReviewState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pure classification of a transaction's review state
pub fn classify(transaction: &Transaction) -> ReviewState {
    if transaction.excluded {
        ReviewState::Excluded
    } else if transaction.has_assignment() {
        ReviewState::Assigned
    } else {
        ReviewState::Unassigned
    }
}

// ============================================================================
// SAVE RULES
// ============================================================================

/// What the record store must write for an accepted split list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SavePlan {
    /// Single 100% target: write direct fields, delete any allocation
    Direct {
        project_id: Option<ProjectId>,
        client_id: Option<ClientId>,
    },
    /// Persist the full allocation, replacing any previous one
    Split { allocation: Allocation },
}

/// Validate a candidate split list and decide how it is stored.
///
/// Rows with neither a target nor a percentage are blank draft rows and are
/// ignored. Nothing is written by this function.
pub fn plan_save(transaction_id: &TransactionId, splits: &[Split]) -> Result<SavePlan, AllocationError> {
    let mut kept: Vec<Split> = Vec::with_capacity(splits.len());

    for (index, split) in splits.iter().enumerate() {
        if split.percentage > 100 {
            return Err(AllocationError::PercentageOutOfRange {
                index,
                percentage: split.percentage,
            });
        }
        if !split.has_target() {
            if split.percentage > 0 {
                return Err(AllocationError::SplitWithoutTarget { index });
            }
            continue;
        }
        if split.percentage > 0 {
            kept.push(split.clone());
        }
    }

    if kept.is_empty() {
        return Err(AllocationError::NoTarget);
    }
    let current_sum: u32 = kept.iter().map(|s| s.percentage).sum();
    if current_sum != 100 {
        return Err(AllocationError::PercentageSum { current_sum });
    }

    if kept.len() == 1 {
        let only = kept.remove(0);
        return Ok(SavePlan::Direct {
            project_id: only.project_id,
            client_id: only.client_id,
        });
    }

    Ok(SavePlan::Split {
        allocation: Allocation::new(transaction_id.clone(), kept),
    })
}

/// Apply an accepted plan to an in-memory snapshot
pub fn apply_plan(transaction: &mut Transaction, plan: SavePlan) {
    match plan {
        SavePlan::Direct {
            project_id,
            client_id,
        } => {
            transaction.direct_project_id = project_id;
            transaction.direct_client_id = client_id;
            transaction.allocation = None;
        }
        SavePlan::Split { allocation } => {
            transaction.allocation = Some(allocation);
        }
    }
}

/// Pending queue: unassigned transactions inside the period, oldest first
pub fn pending<'a>(transactions: &'a [Transaction], period: &Period) -> Vec<&'a Transaction> {
    let mut queue: Vec<&Transaction> = transactions
        .iter()
        .filter(|tx| period.contains(tx.occurred_at))
        .filter(|tx| classify(tx) == ReviewState::Unassigned)
        .collect();
    queue.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at).then_with(|| a.id.cmp(&b.id)));
    queue
}

// ============================================================================
// REVIEW SESSION
// ============================================================================

/// Owned review state: filters, current selection, and the allocation draft.
/// Passed explicitly to the workflow; nothing here is global.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewSession {
    pub period: Option<Period>,

    /// None shows unassigned only
    pub state_filter: Option<ReviewState>,

    /// Case-insensitive match on counterparty or note
    pub search: Option<String>,

    selected: Option<TransactionId>,
    draft: Vec<Split>,
}

impl ReviewSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_period(period: Period) -> Self {
        ReviewSession {
            period: Some(period),
            ..Self::default()
        }
    }

    fn matches(&self, transaction: &Transaction) -> bool {
        let wanted = self.state_filter.unwrap_or(ReviewState::Unassigned);
        if classify(transaction) != wanted {
            return false;
        }
        if let Some(period) = &self.period {
            if !period.contains(transaction.occurred_at) {
                return false;
            }
        }
        match self.search.as_deref().map(str::trim) {
            Some(needle) if !needle.is_empty() => {
                let needle = needle.to_lowercase();
                transaction.counterparty.to_lowercase().contains(&needle)
                    || transaction.note.to_lowercase().contains(&needle)
            }
            _ => true,
        }
    }

    /// Transactions visible under the session's filters, oldest first
    pub fn queue<'a>(&self, transactions: &'a [Transaction]) -> Vec<&'a Transaction> {
        let mut queue: Vec<&Transaction> =
            transactions.iter().filter(|tx| self.matches(tx)).collect();
        queue.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at).then_with(|| a.id.cmp(&b.id)));
        queue
    }

    /// Select a transaction and seed the draft from its current assignment
    pub fn select(&mut self, transaction: &Transaction) {
        self.selected = Some(transaction.id.clone());
        self.draft = match &transaction.allocation {
            Some(allocation) => allocation.splits.clone(),
            None if transaction.direct_target().is_some() => vec![Split {
                project_id: transaction.direct_project_id.clone(),
                client_id: transaction.direct_client_id.clone(),
                percentage: 100,
            }],
            None => Vec::new(),
        };
    }

    pub fn selected(&self) -> Option<&TransactionId> {
        self.selected.as_ref()
    }

    pub fn draft(&self) -> &[Split] {
        &self.draft
    }

    pub fn add_split(&mut self, split: Split) {
        self.draft.push(split);
    }

    pub fn remove_split(&mut self, index: usize) -> Option<Split> {
        if index < self.draft.len() {
            Some(self.draft.remove(index))
        } else {
            None
        }
    }

    pub fn set_percentage(&mut self, index: usize, percentage: u32) -> bool {
        match self.draft.get_mut(index) {
            Some(split) => {
                split.percentage = percentage;
                true
            }
            None => false,
        }
    }

    /// Percentage still to assign; negative when over-assigned
    pub fn remaining_percentage(&self) -> i64 {
        100 - self.draft.iter().map(|s| s.percentage as i64).sum::<i64>()
    }

    /// Validate the draft. On success the selection is released and the plan
    /// returned for the store to apply; on failure the draft is left intact.
    pub fn commit(&mut self) -> Result<(TransactionId, SavePlan), AllocationError> {
        let transaction_id = self.selected.clone().ok_or(AllocationError::NoSelection)?;
        let plan = plan_save(&transaction_id, &self.draft)?;
        self.clear_selection();
        Ok((transaction_id, plan))
    }

    /// Release the selection and hand back the id to exclude
    pub fn exclude_selected(&mut self) -> Option<TransactionId> {
        let selected = self.selected.take();
        self.draft.clear();
        selected
    }

    pub fn clear_selection(&mut self) {
        self.selected = None;
        self.draft.clear();
    }
}

// ============================================================================
// TESTS
// ============================================================================
