// Margin Ledger - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod aggregate;  // Profitability Aggregator
pub mod allocation; // Allocation Resolver
pub mod config;
pub mod db;         // Record store (SQLite)
pub mod entities;
pub mod error;
pub mod month;
pub mod overhead;   // Overhead Redistributor
pub mod refresh;    // Polling refresh task
pub mod review;     // Review State Tracker

// Re-export commonly used types
pub use aggregate::{
    aggregate, margin, AggregateOptions, IntegrityWarning, MonthlyPoint, PendingSummary,
    Profitability, ProfitabilityReport, RankedEntity, Rankings, Totals,
};
pub use allocation::{resolve, Allocation, IntegrityIssue, Resolution, ResolvedShare, Split};
pub use config::AppConfig;
pub use db::{
    build_report, exclude_transaction, get_events_for_entity, get_monthly_distribution, get_transaction,
    insert_event, insert_transactions, list_active_distributions, list_cost_objects,
    list_transactions, load_csv, load_snapshot, resolve_transaction, save_allocation, seed_cost_objects,
    set_monthly_distribution, setup_database, verify_count, Event, ImportStats,
};
pub use entities::{
    Category, CategoryId, CategoryKind, Client, ClientId, CostObjectRegistry, CostObjectSnapshot,
    EntityKind, EntityRef, Project, ProjectId, ProjectStatus, Transaction, TransactionId,
};
pub use error::{AllocationError, DistributionError, MonthParseError, StoreError};
pub use month::{Month, Period};
pub use overhead::{redistribute, DistributionTable, MonthlyDistribution};
pub use refresh::{Published, Refresher};
pub use review::{classify, pending, plan_save, ReviewSession, ReviewState, SavePlan};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
