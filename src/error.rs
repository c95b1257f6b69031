// Typed errors for the allocation engine and the record store.
// Core computations (resolve, classify, aggregate) never return these.

use thiserror::Error;

use crate::entities::TransactionId;
use crate::month::Month;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid month '{0}': expected YYYY-MM")]
pub struct MonthParseError(pub String);

/// Rejection of a candidate split list during save.
/// Carries enough detail for the caller to correct the draft.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("split percentages must sum to 100 (current sum: {current_sum})")]
    PercentageSum { current_sum: u32 },

    #[error("at least one split must reference a project or a client")]
    NoTarget,

    #[error("split {index} has no project or client")]
    SplitWithoutTarget { index: usize },

    #[error("split {index} has percentage {percentage} outside 0..=100")]
    PercentageOutOfRange { index: usize, percentage: u32 },

    #[error("no transaction selected for review")]
    NoSelection,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DistributionError {
    #[error("distribution for {month} sums to {sum}, above 100")]
    OverSubscribed { month: Month, sum: u32 },

    #[error("distribution for {month} targets the overhead project itself")]
    TargetsOverhead { month: Month },

    #[error("distribution for {month} gives project {project} percentage {percentage} outside 0..=100")]
    PercentageOutOfRange {
        month: Month,
        project: String,
        percentage: u32,
    },
}

/// Failures raised by the SQLite record store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transaction {0} not found")]
    TransactionNotFound(TransactionId),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Distribution(#[from] DistributionError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
