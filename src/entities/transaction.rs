// 💸 Ledger Record - a normalized transaction from the banking provider
//
// Immutable once ingested, except the assignment fields (direct project/client,
// allocation) and the `excluded` flag, which only the review workflow touches.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{CategoryId, ClientId, EntityRef, ProjectId, TransactionId};
use crate::allocation::Allocation;
use crate::month::Month;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,

    /// Signed amount in minor currency units (negative = expense)
    pub amount_minor: i64,

    pub currency: String,

    /// Settlement date, falling back to emission date at ingestion
    pub occurred_at: NaiveDate,

    #[serde(default)]
    pub category_id: Option<CategoryId>,

    #[serde(default)]
    pub direct_project_id: Option<ProjectId>,

    #[serde(default)]
    pub direct_client_id: Option<ClientId>,

    #[serde(default)]
    pub excluded: bool,

    /// Fractional split; supersedes the direct fields when present
    #[serde(default)]
    pub allocation: Option<Allocation>,

    // Free text, irrelevant to aggregation
    #[serde(default)]
    pub counterparty: String,

    #[serde(default)]
    pub note: String,
}

impl Transaction {
    pub fn new(
        id: impl Into<String>,
        amount_minor: i64,
        currency: impl Into<String>,
        occurred_at: NaiveDate,
    ) -> Self {
        Transaction {
            id: TransactionId::new(id),
            amount_minor,
            currency: currency.into(),
            occurred_at,
            category_id: None,
            direct_project_id: None,
            direct_client_id: None,
            excluded: false,
            allocation: None,
            counterparty: String::new(),
            note: String::new(),
        }
    }

    pub fn for_project(mut self, project_id: impl Into<String>) -> Self {
        self.direct_project_id = Some(ProjectId::new(project_id));
        self
    }

    pub fn for_client(mut self, client_id: impl Into<String>) -> Self {
        self.direct_client_id = Some(ClientId::new(client_id));
        self
    }

    pub fn with_allocation(mut self, allocation: Allocation) -> Self {
        self.allocation = Some(allocation);
        self
    }

    pub fn excluded(mut self) -> Self {
        self.excluded = true;
        self
    }

    pub fn is_income(&self) -> bool {
        self.amount_minor > 0
    }

    pub fn is_expense(&self) -> bool {
        self.amount_minor < 0
    }

    pub fn month(&self) -> Month {
        Month::of(self.occurred_at)
    }

    /// Direct single-target assignment, ignoring any allocation
    pub fn direct_target(&self) -> Option<EntityRef> {
        EntityRef::from_pair(self.direct_project_id.as_ref(), self.direct_client_id.as_ref())
    }

    pub fn has_assignment(&self) -> bool {
        self.allocation.is_some()
            || self.direct_project_id.is_some()
            || self.direct_client_id.is_some()
    }

    /// Hash of the fields that must never change after ingestion.
    /// Used to detect upstream records that were silently rewritten.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}|{}|{}|{}",
            self.id, self.amount_minor, self.currency, self.occurred_at
        ));
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::Split;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_sign_decides_income_or_expense() {
        let income = Transaction::new("t1", 1500, "EUR", date(2025, 1, 3));
        let expense = Transaction::new("t2", -1500, "EUR", date(2025, 1, 3));
        assert!(income.is_income() && !income.is_expense());
        assert!(expense.is_expense() && !expense.is_income());
    }

    #[test]
    fn test_content_hash_ignores_assignment_fields() {
        let base = Transaction::new("t1", -990, "EUR", date(2025, 1, 3));
        let assigned = base.clone().for_project("P1").excluded();
        assert_eq!(base.content_hash(), assigned.content_hash());

        let rewritten = Transaction::new("t1", -991, "EUR", date(2025, 1, 3));
        assert_ne!(base.content_hash(), rewritten.content_hash());
    }

    #[test]
    fn test_has_assignment() {
        let tx = Transaction::new("t1", -990, "EUR", date(2025, 1, 3));
        assert!(!tx.has_assignment());
        assert!(tx.clone().for_client("C1").has_assignment());

        let split = tx.clone().with_allocation(Allocation::new(
            tx.id.clone(),
            vec![Split::project("P1", 50), Split::project("P2", 50)],
        ));
        assert!(split.has_assignment());
    }
}
