// 🗄️ Record Store - SQLite persistence for ledger records and cost objects
//
// Provides the snapshot the engine reads (transactions, cost objects,
// distributions) and applies the review mutations (save allocation, exclude,
// set distribution). Every mutation is appended to the events audit trail.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

use crate::aggregate::{aggregate, AggregateOptions, ProfitabilityReport};
use crate::allocation::{resolve, Allocation, Resolution, Split};
use crate::entities::{
    Category, CategoryId, CategoryKind, Client, ClientId, CostObjectRegistry, CostObjectSnapshot, Project,
    ProjectId, Transaction, TransactionId,
};
use crate::error::StoreError;
use crate::month::{Month, Period};
use crate::overhead::{DistributionTable, MonthlyDistribution};
use crate::review::{plan_save, SavePlan};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

const DATE_FORMAT: &str = "%Y-%m-%d";

// ============================================================================
// LEDGER RECORD (CSV ingestion format)
// ============================================================================

/// Normalized record as delivered by the ledger sync
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LedgerRecord {
    #[serde(rename = "Id")]
    pub id: String,

    #[serde(rename = "Amount_Minor")]
    pub amount_minor: i64,

    #[serde(rename = "Currency")]
    pub currency: String,

    #[serde(rename = "Settled_On", default)]
    pub settled_on: Option<NaiveDate>,

    #[serde(rename = "Emitted_On")]
    pub emitted_on: NaiveDate,

    #[serde(rename = "Category_Id", default)]
    pub category_id: Option<String>,

    #[serde(rename = "Project_Id", default)]
    pub project_id: Option<String>,

    #[serde(rename = "Client_Id", default)]
    pub client_id: Option<String>,

    #[serde(rename = "Counterparty", default)]
    pub counterparty: String,

    #[serde(rename = "Note", default)]
    pub note: String,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl From<LedgerRecord> for Transaction {
    fn from(record: LedgerRecord) -> Self {
        Transaction {
            id: TransactionId::new(record.id.trim()),
            amount_minor: record.amount_minor,
            currency: record.currency.trim().to_uppercase(),
            occurred_at: record.settled_on.unwrap_or(record.emitted_on),
            category_id: non_empty(record.category_id).map(CategoryId::new),
            direct_project_id: non_empty(record.project_id).map(ProjectId::new),
            direct_client_id: non_empty(record.client_id).map(ClientId::new),
            excluded: false,
            allocation: None,
            counterparty: record.counterparty,
            note: record.note,
        }
    }
}

pub fn load_csv(csv_path: &Path) -> Result<Vec<Transaction>> {
    let mut rdr = csv::Reader::from_path(csv_path).context("Failed to open CSV file")?;

    let mut transactions = Vec::new();
    for result in rdr.deserialize() {
        let record: LedgerRecord = result.context("Failed to deserialize ledger record")?;
        transactions.push(Transaction::from(record));
    }

    Ok(transactions)
}

/// Load a cost object seed file (clients, projects, categories)
pub fn load_snapshot(json_path: &Path) -> Result<CostObjectSnapshot> {
    let content = std::fs::read_to_string(json_path)
        .with_context(|| format!("Failed to read seed file: {:?}", json_path))?;
    serde_json::from_str(&content).context("Failed to parse seed JSON")
}

// ============================================================================
// AUDIT EVENTS
// ============================================================================

/// Event for audit trail
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn open(path: &Path) -> StoreResult<Connection> {
    let conn = Connection::open(path)?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> StoreResult<()> {
    // WAL for crash recovery; in-memory databases report "memory" and that's fine
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS transactions (
            id TEXT PRIMARY KEY,
            content_hash TEXT NOT NULL,
            amount_minor INTEGER NOT NULL,
            currency TEXT NOT NULL,
            occurred_at TEXT NOT NULL,
            category_id TEXT,
            direct_project_id TEXT,
            direct_client_id TEXT,
            excluded INTEGER NOT NULL DEFAULT 0,
            counterparty TEXT NOT NULL DEFAULT '',
            note TEXT NOT NULL DEFAULT '',
            ingested_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS allocation_splits (
            transaction_id TEXT NOT NULL REFERENCES transactions(id),
            position INTEGER NOT NULL,
            project_id TEXT,
            client_id TEXT,
            percentage INTEGER NOT NULL,
            PRIMARY KEY (transaction_id, position)
        );

        CREATE TABLE IF NOT EXISTS clients (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            client_id TEXT,
            status TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT
        );

        CREATE TABLE IF NOT EXISTS categories (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            kind TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS monthly_distributions (
            month TEXT NOT NULL,
            project_id TEXT NOT NULL,
            percentage INTEGER NOT NULL,
            PRIMARY KEY (month, project_id)
        );

        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_transactions_occurred ON transactions(occurred_at);
        CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id);
        CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);",
    )?;

    Ok(())
}

// ============================================================================
// ROW HELPERS
// ============================================================================

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn date_column(row: &Row, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, DATE_FORMAT).map_err(|e| conversion_error(idx, e))
}

fn optional_date_column(row: &Row, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| NaiveDate::parse_from_str(&s, DATE_FORMAT).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn percentage_column(row: &Row, idx: usize) -> rusqlite::Result<u32> {
    let raw: i64 = row.get(idx)?;
    u32::try_from(raw).map_err(|e| conversion_error(idx, e))
}

fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

// ============================================================================
// EVENTS
// ============================================================================

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> StoreResult<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> StoreResult<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                    .map_err(|e| conversion_error(1, e))?
                    .with_timezone(&Utc),
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json).map_err(|e| conversion_error(5, e))?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

// ============================================================================
// TRANSACTIONS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportStats {
    pub inserted: usize,
    pub duplicates: usize,
    /// Same id re-delivered with different immutable fields; first ingest kept
    pub rewritten: usize,

    /// Inserted records whose sign contradicts their category's kind
    pub category_mismatches: usize,
}

fn category_disagrees(conn: &Connection, tx: &Transaction) -> StoreResult<bool> {
    let Some(category_id) = &tx.category_id else {
        return Ok(false);
    };
    let kind: Option<String> = conn
        .query_row(
            "SELECT kind FROM categories WHERE id = ?1",
            params![category_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;

    let Some(kind) = kind.and_then(|k| k.parse::<CategoryKind>().ok()) else {
        return Ok(false);
    };
    let category = Category {
        id: category_id.clone(),
        name: String::new(),
        kind,
    };
    Ok(!category.agrees_with(tx.amount_minor))
}

/// Idempotent on the external id
pub fn insert_transactions(conn: &Connection, transactions: &[Transaction]) -> StoreResult<ImportStats> {
    let mut stats = ImportStats::default();
    let db_tx = conn.unchecked_transaction()?;

    for tx in transactions {
        let hash = tx.content_hash();

        let existing: Option<String> = db_tx
            .query_row(
                "SELECT content_hash FROM transactions WHERE id = ?1",
                params![tx.id.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(stored) if stored == hash => {
                stats.duplicates += 1;
                continue;
            }
            Some(_) => {
                warn!(transaction = %tx.id, "upstream record changed immutable fields, keeping first ingest");
                stats.rewritten += 1;
                continue;
            }
            None => {}
        }

        db_tx.execute(
            "INSERT INTO transactions (
                id, content_hash, amount_minor, currency, occurred_at, category_id,
                direct_project_id, direct_client_id, excluded, counterparty, note, ingested_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                tx.id.as_str(),
                hash,
                tx.amount_minor,
                tx.currency,
                format_date(tx.occurred_at),
                tx.category_id.as_ref().map(|c| c.as_str()),
                tx.direct_project_id.as_ref().map(|p| p.as_str()),
                tx.direct_client_id.as_ref().map(|c| c.as_str()),
                tx.excluded,
                tx.counterparty,
                tx.note,
                Utc::now().to_rfc3339(),
            ],
        )?;

        if let Some(allocation) = &tx.allocation {
            write_splits(&db_tx, &tx.id, &allocation.splits)?;
        }

        insert_event(
            &db_tx,
            &Event::new(
                "transaction_ingested",
                "transaction",
                tx.id.as_str(),
                serde_json::json!({
                    "amount_minor": tx.amount_minor,
                    "currency": tx.currency,
                    "occurred_at": format_date(tx.occurred_at),
                }),
                "ledger_sync",
            ),
        )?;
        stats.inserted += 1;

        // Advisory only: the amount's sign still decides income vs expense
        if category_disagrees(&db_tx, tx)? {
            warn!(transaction = %tx.id, amount_minor = tx.amount_minor, "amount sign contradicts category kind");
            stats.category_mismatches += 1;
        }
    }

    db_tx.commit()?;
    info!(
        inserted = stats.inserted,
        duplicates = stats.duplicates,
        rewritten = stats.rewritten,
        category_mismatches = stats.category_mismatches,
        "ledger import finished"
    );
    Ok(stats)
}

fn write_splits(conn: &Connection, id: &TransactionId, splits: &[Split]) -> StoreResult<()> {
    conn.execute(
        "DELETE FROM allocation_splits WHERE transaction_id = ?1",
        params![id.as_str()],
    )?;
    for (position, split) in splits.iter().enumerate() {
        conn.execute(
            "INSERT INTO allocation_splits (transaction_id, position, project_id, client_id, percentage)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.as_str(),
                position as i64,
                split.project_id.as_ref().map(|p| p.as_str()),
                split.client_id.as_ref().map(|c| c.as_str()),
                split.percentage,
            ],
        )?;
    }
    Ok(())
}

fn load_splits(conn: &Connection, period: Option<&Period>) -> StoreResult<HashMap<TransactionId, Vec<Split>>> {
    let (sql, bounds) = match period {
        Some(period) => (
            "SELECT s.transaction_id, s.project_id, s.client_id, s.percentage
             FROM allocation_splits s
             JOIN transactions t ON t.id = s.transaction_id
             WHERE t.occurred_at >= ?1 AND t.occurred_at < ?2
             ORDER BY s.transaction_id, s.position",
            vec![format_date(period.start), format_date(period.end)],
        ),
        None => (
            "SELECT transaction_id, project_id, client_id, percentage
             FROM allocation_splits
             ORDER BY transaction_id, position",
            Vec::new(),
        ),
    };

    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(bounds.iter()), |row| {
            let transaction_id: String = row.get(0)?;
            let project_id: Option<String> = row.get(1)?;
            let client_id: Option<String> = row.get(2)?;
            Ok((
                TransactionId::new(transaction_id),
                Split {
                    project_id: project_id.map(ProjectId::new),
                    client_id: client_id.map(ClientId::new),
                    percentage: percentage_column(row, 3)?,
                },
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut splits: HashMap<TransactionId, Vec<Split>> = HashMap::new();
    for (id, split) in rows {
        splits.entry(id).or_default().push(split);
    }
    Ok(splits)
}

fn transaction_from_row(row: &Row) -> rusqlite::Result<Transaction> {
    let id: String = row.get(0)?;
    let category_id: Option<String> = row.get(4)?;
    let project_id: Option<String> = row.get(5)?;
    let client_id: Option<String> = row.get(6)?;

    Ok(Transaction {
        id: TransactionId::new(id),
        amount_minor: row.get(1)?,
        currency: row.get(2)?,
        occurred_at: date_column(row, 3)?,
        category_id: category_id.map(CategoryId::new),
        direct_project_id: project_id.map(ProjectId::new),
        direct_client_id: client_id.map(ClientId::new),
        excluded: row.get(7)?,
        allocation: None,
        counterparty: row.get(8)?,
        note: row.get(9)?,
    })
}

const TRANSACTION_COLUMNS: &str = "id, amount_minor, currency, occurred_at, category_id,
    direct_project_id, direct_client_id, excluded, counterparty, note";

/// Snapshot of transactions, optionally limited to a period, with allocations joined
pub fn list_transactions(conn: &Connection, period: Option<&Period>) -> StoreResult<Vec<Transaction>> {
    let (sql, bounds) = match period {
        Some(period) => (
            format!(
                "SELECT {} FROM transactions WHERE occurred_at >= ?1 AND occurred_at < ?2
                 ORDER BY occurred_at, id",
                TRANSACTION_COLUMNS
            ),
            vec![format_date(period.start), format_date(period.end)],
        ),
        None => (
            format!("SELECT {} FROM transactions ORDER BY occurred_at, id", TRANSACTION_COLUMNS),
            Vec::new(),
        ),
    };

    let mut stmt = conn.prepare(&sql)?;
    let mut transactions = stmt
        .query_map(rusqlite::params_from_iter(bounds.iter()), transaction_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut splits = load_splits(conn, period)?;
    for tx in &mut transactions {
        if let Some(rows) = splits.remove(&tx.id) {
            tx.allocation = Some(Allocation::new(tx.id.clone(), rows));
        }
    }

    Ok(transactions)
}

pub fn get_transaction(conn: &Connection, id: &TransactionId) -> StoreResult<Option<Transaction>> {
    let sql = format!("SELECT {} FROM transactions WHERE id = ?1", TRANSACTION_COLUMNS);
    let Some(mut tx) = conn
        .query_row(&sql, params![id.as_str()], transaction_from_row)
        .optional()?
    else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT project_id, client_id, percentage FROM allocation_splits
         WHERE transaction_id = ?1 ORDER BY position",
    )?;
    let splits = stmt
        .query_map(params![id.as_str()], |row| {
            let project_id: Option<String> = row.get(0)?;
            let client_id: Option<String> = row.get(1)?;
            Ok(Split {
                project_id: project_id.map(ProjectId::new),
                client_id: client_id.map(ClientId::new),
                percentage: percentage_column(row, 2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    if !splits.is_empty() {
        tx.allocation = Some(Allocation::new(id.clone(), splits));
    }
    Ok(Some(tx))
}

pub fn verify_count(conn: &Connection) -> StoreResult<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?;
    Ok(count)
}

fn require_transaction(conn: &Connection, id: &TransactionId) -> StoreResult<()> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM transactions WHERE id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    match exists {
        Some(_) => Ok(()),
        None => Err(StoreError::TransactionNotFound(id.clone())),
    }
}

// ============================================================================
// REVIEW MUTATIONS
// ============================================================================

/// Validate and persist an allocation. Rejections write nothing.
pub fn save_allocation(
    conn: &Connection,
    id: &TransactionId,
    splits: &[Split],
    actor: &str,
) -> StoreResult<SavePlan> {
    require_transaction(conn, id)?;
    let plan = plan_save(id, splits)?;

    let db_tx = conn.unchecked_transaction()?;
    match &plan {
        SavePlan::Direct {
            project_id,
            client_id,
        } => {
            db_tx.execute(
                "DELETE FROM allocation_splits WHERE transaction_id = ?1",
                params![id.as_str()],
            )?;
            db_tx.execute(
                "UPDATE transactions SET direct_project_id = ?1, direct_client_id = ?2 WHERE id = ?3",
                params![
                    project_id.as_ref().map(|p| p.as_str()),
                    client_id.as_ref().map(|c| c.as_str()),
                    id.as_str()
                ],
            )?;
        }
        SavePlan::Split { allocation } => {
            write_splits(&db_tx, id, &allocation.splits)?;
        }
    }

    insert_event(
        &db_tx,
        &Event::new(
            "allocation_saved",
            "transaction",
            id.as_str(),
            serde_json::to_value(&plan)?,
            actor,
        ),
    )?;
    db_tx.commit()?;

    info!(transaction = %id, "allocation saved");
    Ok(plan)
}

/// Mark a transaction excluded. The record is kept; its allocation is dropped.
pub fn exclude_transaction(conn: &Connection, id: &TransactionId, actor: &str) -> StoreResult<()> {
    require_transaction(conn, id)?;

    let db_tx = conn.unchecked_transaction()?;
    db_tx.execute(
        "DELETE FROM allocation_splits WHERE transaction_id = ?1",
        params![id.as_str()],
    )?;
    db_tx.execute(
        "UPDATE transactions SET excluded = 1 WHERE id = ?1",
        params![id.as_str()],
    )?;
    insert_event(
        &db_tx,
        &Event::new("transaction_excluded", "transaction", id.as_str(), serde_json::json!({}), actor),
    )?;
    db_tx.commit()?;

    info!(transaction = %id, "transaction excluded");
    Ok(())
}

// ============================================================================
// MONTHLY DISTRIBUTIONS
// ============================================================================

/// Replace a month's distribution; an empty one removes the month
pub fn set_monthly_distribution(
    conn: &Connection,
    distribution: &MonthlyDistribution,
    overhead_project: Option<&ProjectId>,
    actor: &str,
) -> StoreResult<()> {
    distribution.validate(overhead_project)?;
    let month = distribution.month.to_string();

    let db_tx = conn.unchecked_transaction()?;
    db_tx.execute(
        "DELETE FROM monthly_distributions WHERE month = ?1",
        params![month],
    )?;
    for (project_id, percentage) in &distribution.percentages {
        db_tx.execute(
            "INSERT INTO monthly_distributions (month, project_id, percentage) VALUES (?1, ?2, ?3)",
            params![month, project_id.as_str(), percentage],
        )?;
    }
    insert_event(
        &db_tx,
        &Event::new(
            "distribution_set",
            "monthly_distribution",
            &month,
            serde_json::to_value(&distribution.percentages)?,
            actor,
        ),
    )?;
    db_tx.commit()?;

    Ok(())
}

pub fn get_monthly_distribution(conn: &Connection, month: Month) -> StoreResult<Option<MonthlyDistribution>> {
    let mut stmt = conn.prepare(
        "SELECT project_id, percentage FROM monthly_distributions WHERE month = ?1 ORDER BY project_id",
    )?;
    let rows = stmt
        .query_map(params![month.to_string()], |row| {
            let project_id: String = row.get(0)?;
            Ok((ProjectId::new(project_id), percentage_column(row, 1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    if rows.is_empty() {
        return Ok(None);
    }
    Ok(Some(MonthlyDistribution {
        month,
        percentages: rows.into_iter().collect(),
    }))
}

pub fn list_active_distributions(conn: &Connection) -> StoreResult<DistributionTable> {
    let mut stmt = conn.prepare(
        "SELECT month, project_id, percentage FROM monthly_distributions ORDER BY month, project_id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            let month: String = row.get(0)?;
            let month: Month = month.parse().map_err(|e| conversion_error(0, e))?;
            let project_id: String = row.get(1)?;
            Ok((month, ProjectId::new(project_id), percentage_column(row, 2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut months: HashMap<Month, MonthlyDistribution> = HashMap::new();
    for (month, project_id, percentage) in rows {
        months
            .entry(month)
            .or_insert_with(|| MonthlyDistribution::new(month))
            .percentages
            .insert(project_id, percentage);
    }
    Ok(months.into_values().collect())
}

// ============================================================================
// COST OBJECTS
// ============================================================================

pub fn upsert_client(conn: &Connection, client: &Client) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO clients (id, name) VALUES (?1, ?2)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        params![client.id.as_str(), client.name],
    )?;
    Ok(())
}

pub fn upsert_project(conn: &Connection, project: &Project) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO projects (id, name, client_id, status, start_date, end_date)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            client_id = excluded.client_id,
            status = excluded.status,
            start_date = excluded.start_date,
            end_date = excluded.end_date",
        params![
            project.id.as_str(),
            project.name,
            project.client_id.as_ref().map(|c| c.as_str()),
            project.status.as_str(),
            format_date(project.start_date),
            project.end_date.map(format_date),
        ],
    )?;
    Ok(())
}

pub fn upsert_category(conn: &Connection, category: &Category) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO categories (id, name, kind) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, kind = excluded.kind",
        params![category.id.as_str(), category.name, category.kind.as_str()],
    )?;
    Ok(())
}

pub fn seed_cost_objects(conn: &Connection, snapshot: &CostObjectSnapshot) -> StoreResult<()> {
    let db_tx = conn.unchecked_transaction()?;
    for client in &snapshot.clients {
        upsert_client(&db_tx, client)?;
    }
    for project in &snapshot.projects {
        upsert_project(&db_tx, project)?;
    }
    for category in &snapshot.categories {
        upsert_category(&db_tx, category)?;
    }
    db_tx.commit()?;

    info!(
        clients = snapshot.clients.len(),
        projects = snapshot.projects.len(),
        categories = snapshot.categories.len(),
        "cost objects seeded"
    );
    Ok(())
}

pub fn list_cost_objects(conn: &Connection, overhead_project: Option<ProjectId>) -> StoreResult<CostObjectRegistry> {
    let mut snapshot = CostObjectSnapshot::default();

    let mut stmt = conn.prepare("SELECT id, name FROM clients ORDER BY id")?;
    snapshot.clients = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            Ok(Client {
                id: ClientId::new(id),
                name: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT id, name, client_id, status, start_date, end_date FROM projects ORDER BY id",
    )?;
    snapshot.projects = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let client_id: Option<String> = row.get(2)?;
            let status: String = row.get(3)?;
            Ok(Project {
                id: ProjectId::new(id),
                name: row.get(1)?,
                client_id: client_id.map(ClientId::new),
                status: status.parse().map_err(|e: String| conversion_error(3, e))?,
                start_date: date_column(row, 4)?,
                end_date: optional_date_column(row, 5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare("SELECT id, name, kind FROM categories ORDER BY id")?;
    snapshot.categories = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let kind: String = row.get(2)?;
            Ok(Category {
                id: CategoryId::new(id),
                name: row.get(1)?,
                kind: kind.parse().map_err(|e: String| conversion_error(2, e))?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut registry = CostObjectRegistry::from_snapshot(snapshot);
    registry.set_overhead_project(overhead_project);
    Ok(registry)
}

// ============================================================================
// REPORT SNAPSHOT
// ============================================================================

/// Dates needed to aggregate `period`: the period itself plus the series window
pub fn report_window(period: &Period, options: &AggregateOptions) -> Period {
    let series_start = period
        .last_month()
        .trailing(options.trailing_months)
        .first()
        .map(|m| m.first_day())
        .unwrap_or(period.start);

    Period::new(series_start.min(period.start), period.end.max(period.start))
}

/// Read one consistent snapshot and aggregate it
pub fn build_report(
    conn: &Connection,
    overhead_project: Option<ProjectId>,
    period: &Period,
    options: &AggregateOptions,
) -> StoreResult<ProfitabilityReport> {
    let db_tx = conn.unchecked_transaction()?;
    let transactions = list_transactions(&db_tx, Some(&report_window(period, options)))?;
    let registry = list_cost_objects(&db_tx, overhead_project)?;
    let distributions = list_active_distributions(&db_tx)?;
    db_tx.commit()?;

    Ok(aggregate(&transactions, &registry, &distributions, period, options))
}

/// Resolution of a single stored transaction against current cost objects
pub fn resolve_transaction(
    conn: &Connection,
    id: &TransactionId,
    overhead_project: Option<ProjectId>,
) -> StoreResult<Resolution> {
    let tx = get_transaction(conn, id)?.ok_or_else(|| StoreError::TransactionNotFound(id.clone()))?;
    let registry = list_cost_objects(conn, overhead_project)?;
    let distributions = list_active_distributions(conn)?;
    Ok(resolve(&tx, &registry, &distributions))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AllocationError, DistributionError};
    use crate::review::{classify, ReviewState};
    use std::io::Write;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn memory_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn seeded_db() -> Connection {
        let conn = memory_db();
        let snapshot = CostObjectSnapshot {
            clients: vec![Client::new("C1", "Acme")],
            projects: vec![
                Project::new("GEN", "General", date(2020, 1, 1)),
                Project::new("P1", "Acme site", date(2024, 1, 1)).with_client("C1"),
                Project::new("P2", "Acme app", date(2024, 1, 1))
                    .with_client("C1")
                    .ending(date(2025, 6, 30)),
            ],
            categories: vec![Category::new("rent", "Rent", crate::entities::CategoryKind::Expense)],
        };
        seed_cost_objects(&conn, &snapshot).unwrap();
        insert_transactions(
            &conn,
            &[
                Transaction::new("t1", -10_000, "EUR", date(2025, 2, 3)),
                Transaction::new("t2", 45_000, "EUR", date(2025, 2, 9)).for_project("P1"),
                Transaction::new("t3", -500, "EUR", date(2025, 3, 1)),
            ],
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_insert_is_idempotent_and_detects_rewrites() {
        let conn = seeded_db();
        assert_eq!(verify_count(&conn).unwrap(), 3);

        let stats = insert_transactions(
            &conn,
            &[
                Transaction::new("t1", -10_000, "EUR", date(2025, 2, 3)),
                Transaction::new("t2", 99_999, "EUR", date(2025, 2, 9)),
                Transaction::new("t4", -1, "EUR", date(2025, 2, 10)),
            ],
        )
        .unwrap();

        assert_eq!(
            stats,
            ImportStats {
                inserted: 1,
                duplicates: 1,
                rewritten: 1,
                category_mismatches: 0,
            }
        );
        let t2 = get_transaction(&conn, &TransactionId::new("t2")).unwrap().unwrap();
        assert_eq!(t2.amount_minor, 45_000);
    }

    #[test]
    fn test_import_flags_category_sign_mismatch() {
        let conn = seeded_db();

        let mut refund = Transaction::new("refund-1", 2_500, "EUR", date(2025, 2, 14));
        refund.category_id = Some(CategoryId::new("rent"));
        let mut rent = Transaction::new("rent-1", -90_000, "EUR", date(2025, 2, 1));
        rent.category_id = Some(CategoryId::new("rent"));
        let mut uncategorized = Transaction::new("misc-1", 700, "EUR", date(2025, 2, 2));
        uncategorized.category_id = Some(CategoryId::new("unknown"));

        let stats = insert_transactions(&conn, &[refund, rent, uncategorized]).unwrap();
        assert_eq!(stats.inserted, 3);
        assert_eq!(stats.category_mismatches, 1);

        // the refund still counts as income
        let stored = get_transaction(&conn, &TransactionId::new("refund-1")).unwrap().unwrap();
        assert!(stored.is_income());
    }

    #[test]
    fn test_period_listing_loads_only_matching_splits() {
        let conn = seeded_db();
        save_allocation(&conn, &TransactionId::new("t1"), &[Split::project("P1", 50), Split::project("P2", 50)], "tester").unwrap();
        save_allocation(&conn, &TransactionId::new("t3"), &[Split::project("P1", 30), Split::client("C1", 70)], "tester").unwrap();

        let feb = Period::new(date(2025, 2, 1), date(2025, 3, 1));
        let splits = load_splits(&conn, Some(&feb)).unwrap();
        assert_eq!(splits.len(), 1);
        assert_eq!(splits[&TransactionId::new("t1")].len(), 2);
        assert_eq!(load_splits(&conn, None).unwrap().len(), 2);

        let listed = list_transactions(&conn, Some(&feb)).unwrap();
        let t1 = listed.iter().find(|t| t.id.as_str() == "t1").unwrap();
        assert_eq!(t1.allocation.as_ref().unwrap().percentage_sum(), 100);
    }

    #[test]
    fn test_list_transactions_by_period() {
        let conn = seeded_db();
        let feb = Period::new(date(2025, 2, 1), date(2025, 3, 1));

        let ids: Vec<String> = list_transactions(&conn, Some(&feb))
            .unwrap()
            .into_iter()
            .map(|t| t.id.to_string())
            .collect();
        assert_eq!(ids, vec!["t1", "t2"]);
        assert_eq!(list_transactions(&conn, None).unwrap().len(), 3);
    }

    #[test]
    fn test_save_split_allocation_round_trip() {
        let conn = seeded_db();
        let id = TransactionId::new("t1");

        let plan = save_allocation(
            &conn,
            &id,
            &[Split::project("P1", 60), Split::client("C1", 40)],
            "tester",
        )
        .unwrap();
        assert!(matches!(plan, SavePlan::Split { .. }));

        let tx = get_transaction(&conn, &id).unwrap().unwrap();
        let allocation = tx.allocation.as_ref().unwrap();
        assert_eq!(allocation.splits, vec![Split::project("P1", 60), Split::client("C1", 40)]);
        assert_eq!(classify(&tx), ReviewState::Assigned);

        let listed = list_transactions(&conn, None).unwrap();
        assert!(listed.iter().find(|t| t.id == id).unwrap().allocation.is_some());

        let events = get_events_for_entity(&conn, "transaction", "t1").unwrap();
        assert_eq!(events[0].event_type, "allocation_saved");
        assert_eq!(events[0].actor, "tester");
    }

    #[test]
    fn test_single_split_collapses_and_clears_allocation() {
        let conn = seeded_db();
        let id = TransactionId::new("t1");
        save_allocation(&conn, &id, &[Split::project("P1", 50), Split::project("P2", 50)], "tester").unwrap();
        save_allocation(&conn, &id, &[Split::project("P2", 100)], "tester").unwrap();

        let tx = get_transaction(&conn, &id).unwrap().unwrap();
        assert!(tx.allocation.is_none());
        assert_eq!(tx.direct_project_id, Some(ProjectId::new("P2")));
    }

    #[test]
    fn test_rejected_save_writes_nothing() {
        let conn = seeded_db();
        let id = TransactionId::new("t1");

        let err = save_allocation(&conn, &id, &[Split::project("P1", 70)], "tester").unwrap_err();
        assert!(matches!(
            err,
            StoreError::Allocation(AllocationError::PercentageSum { current_sum: 70 })
        ));

        let tx = get_transaction(&conn, &id).unwrap().unwrap();
        assert!(tx.allocation.is_none());
        assert_eq!(classify(&tx), ReviewState::Unassigned);
        assert!(get_events_for_entity(&conn, "transaction", "t1")
            .unwrap()
            .iter()
            .all(|e| e.event_type != "allocation_saved"));
    }

    #[test]
    fn test_save_unknown_transaction() {
        let conn = seeded_db();
        let err = save_allocation(&conn, &TransactionId::new("nope"), &[Split::project("P1", 100)], "tester")
            .unwrap_err();
        assert!(matches!(err, StoreError::TransactionNotFound(_)));
    }

    #[test]
    fn test_exclude_keeps_record_and_drops_allocation() {
        let conn = seeded_db();
        let id = TransactionId::new("t1");
        save_allocation(&conn, &id, &[Split::project("P1", 50), Split::client("C1", 50)], "tester").unwrap();
        exclude_transaction(&conn, &id, "tester").unwrap();

        let tx = get_transaction(&conn, &id).unwrap().unwrap();
        assert!(tx.excluded);
        assert!(tx.allocation.is_none());
        assert_eq!(classify(&tx), ReviewState::Excluded);
        assert_eq!(verify_count(&conn).unwrap(), 3);
    }

    #[test]
    fn test_distribution_storage() {
        let conn = seeded_db();
        let feb = Month::new(2025, 2).unwrap();
        let overhead = ProjectId::new("GEN");

        set_monthly_distribution(
            &conn,
            &MonthlyDistribution::new(feb).with("P1", 40).with("P2", 60),
            Some(&overhead),
            "tester",
        )
        .unwrap();

        let stored = get_monthly_distribution(&conn, feb).unwrap().unwrap();
        assert_eq!(stored.percentage_sum(), 100);
        assert!(get_monthly_distribution(&conn, feb.next()).unwrap().is_none());

        let err = set_monthly_distribution(
            &conn,
            &MonthlyDistribution::new(feb).with("P1", 80).with("P2", 60),
            Some(&overhead),
            "tester",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Distribution(DistributionError::OverSubscribed { sum: 140, .. })
        ));

        // rejected write left the previous table in place
        let table = list_active_distributions(&conn).unwrap();
        assert_eq!(table.get(feb), Some(&stored));

        set_monthly_distribution(&conn, &MonthlyDistribution::new(feb), Some(&overhead), "tester").unwrap();
        assert!(list_active_distributions(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_cost_objects_round_trip() {
        let conn = seeded_db();
        let registry = list_cost_objects(&conn, Some(ProjectId::new("GEN"))).unwrap();

        assert_eq!(registry.project_count(), 3);
        assert_eq!(registry.client_count(), 1);
        assert!(registry.is_overhead(&ProjectId::new("GEN")));
        let p2 = registry.project(&ProjectId::new("P2")).unwrap();
        assert_eq!(p2.end_date, Some(date(2025, 6, 30)));
        assert_eq!(registry.owning_client(&ProjectId::new("P1")), Some(&ClientId::new("C1")));
        assert_eq!(registry.categories().count(), 1);
    }

    #[test]
    fn test_report_window_covers_series() {
        let feb = Month::new(2025, 2).unwrap();
        let period = Period::months(feb, feb);
        let window = report_window(&period, &AggregateOptions::default());

        assert_eq!(window.start, date(2024, 9, 1));
        assert_eq!(window.end, date(2025, 3, 1));
    }

    #[test]
    fn test_build_report_with_overhead() {
        let conn = seeded_db();
        let feb = Month::new(2025, 2).unwrap();
        let overhead = ProjectId::new("GEN");

        save_allocation(&conn, &TransactionId::new("t1"), &[Split::project("GEN", 100)], "tester").unwrap();
        set_monthly_distribution(
            &conn,
            &MonthlyDistribution::new(feb).with("P1", 40).with("P2", 60),
            Some(&overhead),
            "tester",
        )
        .unwrap();

        let resolution = resolve_transaction(&conn, &TransactionId::new("t1"), Some(overhead.clone())).unwrap();
        assert_eq!(resolution.shares.len(), 2);
        assert!(resolution.shares.iter().all(|s| s.redistributed));

        let report = build_report(
            &conn,
            Some(overhead),
            &Period::months(feb, feb),
            &AggregateOptions::default(),
        )
        .unwrap();

        let p1 = &report.by_project[&ProjectId::new("P1")];
        assert_eq!(p1.income, 45_000);
        assert_eq!(p1.expenses, 4_000);
        assert_eq!(report.by_project[&ProjectId::new("P2")].net, -6_000);
        assert_eq!(report.by_client[&ClientId::new("C1")].net, 35_000);
        assert!(!report.by_project.contains_key(&ProjectId::new("GEN")));
        // t3 falls in March, outside the period
        assert_eq!(report.totals.transaction_count, 2);
        assert_eq!(report.pending.count, 0);
    }

    #[test]
    fn test_resolve_unknown_transaction() {
        let conn = seeded_db();
        let err = resolve_transaction(&conn, &TransactionId::new("missing"), None).unwrap_err();
        assert!(matches!(err, StoreError::TransactionNotFound(_)));
    }

    #[test]
    fn test_load_csv_settlement_fallback() {
        let path = std::env::temp_dir().join(format!("margin-ledger-{}.csv", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "Id,Amount_Minor,Currency,Settled_On,Emitted_On,Category_Id,Project_Id,Client_Id,Counterparty,Note"
        )
        .unwrap();
        writeln!(file, "bank-1,-4200,eur,2025-02-03,2025-01-30,rent,,,Landlord,February rent").unwrap();
        writeln!(file, "bank-2,150000,EUR,,2025-02-11,,P1,,Acme,Invoice 7").unwrap();
        drop(file);

        let transactions = load_csv(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(transactions.len(), 2);
        assert_eq!(transactions[0].occurred_at, date(2025, 2, 3));
        assert_eq!(transactions[0].currency, "EUR");
        assert_eq!(transactions[0].category_id, Some(CategoryId::new("rent")));
        assert_eq!(transactions[0].direct_project_id, None);
        assert_eq!(transactions[1].occurred_at, date(2025, 2, 11));
        assert_eq!(transactions[1].direct_project_id, Some(ProjectId::new("P1")));
    }
}
