// 🏷️ Category Entity - advisory income/expense classification
//
// The kind is advisory only: income vs expense is always decided by the
// sign of the transaction amount, never by its category.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::CategoryId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategoryKind {
    /// Money coming in
    Income,

    /// Money going out
    Expense,
}

impl CategoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CategoryKind::Income => "income",
            CategoryKind::Expense => "expense",
        }
    }
}

impl FromStr for CategoryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "income" => Ok(CategoryKind::Income),
            "expense" => Ok(CategoryKind::Expense),
            other => Err(format!("unknown category kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
    pub kind: CategoryKind,
}

impl Category {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: CategoryKind) -> Self {
        Category {
            id: CategoryId::new(id),
            name: name.into(),
            kind,
        }
    }

    /// Whether the category's advisory kind agrees with a signed amount.
    /// Used only to flag suspicious records, never to decide income/expense.
    pub fn agrees_with(&self, amount_minor: i64) -> bool {
        match self.kind {
            CategoryKind::Income => amount_minor >= 0,
            CategoryKind::Expense => amount_minor <= 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_agreement_is_advisory() {
        let rent = Category::new("cat-rent", "Rent", CategoryKind::Expense);
        assert!(rent.agrees_with(-50_00));
        // a refund booked under an expense category still counts as income
        assert!(!rent.agrees_with(20_00));
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("Income".parse::<CategoryKind>(), Ok(CategoryKind::Income));
        assert!("transfer".parse::<CategoryKind>().is_err());
    }
}
