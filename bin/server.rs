// Margin Ledger - Web Server
// REST API with Axum over the SQLite record store

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use margin_ledger::{
    build_report, db, exclude_transaction, list_transactions, pending, save_allocation,
    set_monthly_distribution, AppConfig, Month, MonthlyDistribution, Period, ProfitabilityReport,
    ProjectId, Refresher, Resolution, SavePlan, Split, StoreError, TransactionId,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
    config: Arc<AppConfig>,
    dashboard: Arc<Refresher<ProfitabilityReport>>,
}

impl AppState {
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Recompute the dashboard in the background; supersedes any running refresh.
    /// Aborting the task does not stop a blocking section already running, so
    /// the blocking work checks its generation once it holds the connection.
    fn refresh_dashboard(&self) -> u64 {
        let db = Arc::clone(&self.db);
        let dashboard = Arc::clone(&self.dashboard);
        let overhead = self.config.overhead_project();
        let options = self.config.aggregate_options();

        self.dashboard.submit_with(move |generation| async move {
            let work = tokio::task::spawn_blocking(move || -> anyhow::Result<ProfitabilityReport> {
                let conn = db.lock().unwrap_or_else(|e| e.into_inner());
                if !dashboard.is_current(generation) {
                    anyhow::bail!("refresh {} superseded before it started", generation);
                }
                let current = Month::of(Utc::now().date_naive());
                let report = build_report(&conn, overhead, &Period::months(current, current), &options)?;
                Ok(report)
            });
            match work.await {
                Ok(result) => result,
                Err(join_error) => Err(join_error.into()),
            }
        })
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

enum ApiError {
    NotFound(String),
    /// Rejected input; nothing was written
    Unprocessable(String),
    NotReady,
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TransactionNotFound(_) => ApiError::NotFound(err.to_string()),
            StoreError::Allocation(_) | StoreError::Distribution(_) => {
                ApiError::Unprocessable(err.to_string())
            }
            other => {
                error!(error = %other, "record store failure");
                ApiError::Internal(other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::NotReady => (
                StatusCode::SERVICE_UNAVAILABLE,
                "dashboard not computed yet".to_string(),
            ),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = ApiResponse {
            success: false,
            data: serde_json::Value::Null,
            error: Some(message),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

// ============================================================================
// Request / Response types
// ============================================================================

#[derive(Deserialize)]
struct ReportQuery {
    from: Month,
    to: Month,
    months: Option<usize>,
}

#[derive(Deserialize)]
struct PendingQuery {
    from: Month,
    to: Month,
}

#[derive(Serialize)]
struct PendingItem {
    id: TransactionId,
    occurred_at: chrono::NaiveDate,
    amount_minor: i64,
    currency: String,
    counterparty: String,
}

#[derive(Deserialize)]
struct AllocationRequest {
    splits: Vec<Split>,
    #[serde(default)]
    actor: Option<String>,
}

#[derive(Deserialize, Default)]
struct ActorRequest {
    #[serde(default)]
    actor: Option<String>,
}

#[derive(Deserialize)]
struct DistributionRequest {
    #[serde(default)]
    percentages: BTreeMap<ProjectId, u32>,
    #[serde(default)]
    actor: Option<String>,
}

#[derive(Serialize)]
struct DashboardResponse {
    generation: u64,
    completed_at: DateTime<Utc>,
    report: ProfitabilityReport,
}

fn month_range(from: Month, to: Month) -> Result<Period, ApiError> {
    if to < from {
        return Err(ApiError::Unprocessable(format!(
            "'to' ({}) is before 'from' ({})",
            to, from
        )));
    }
    Ok(Period::months(from, to))
}

fn actor_or_default(actor: Option<String>) -> String {
    actor
        .filter(|a| !a.trim().is_empty())
        .unwrap_or_else(|| "api".to_string())
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/report?from=YYYY-MM&to=YYYY-MM&months=N
async fn get_report(
    State(state): State<AppState>,
    Query(query): Query<ReportQuery>,
) -> ApiResult<ProfitabilityReport> {
    let period = month_range(query.from, query.to)?;
    let mut options = state.config.aggregate_options();
    if let Some(months) = query.months {
        options.trailing_months = months;
    }

    let conn = state.conn();
    let report = build_report(&conn, state.config.overhead_project(), &period, &options)?;
    Ok(Json(ApiResponse::ok(report)))
}

/// GET /api/pending?from=YYYY-MM&to=YYYY-MM - Review queue
async fn get_pending(
    State(state): State<AppState>,
    Query(query): Query<PendingQuery>,
) -> ApiResult<Vec<PendingItem>> {
    let period = month_range(query.from, query.to)?;

    let conn = state.conn();
    let transactions = list_transactions(&conn, Some(&period))?;
    let items = pending(&transactions, &period)
        .into_iter()
        .map(|tx| PendingItem {
            id: tx.id.clone(),
            occurred_at: tx.occurred_at,
            amount_minor: tx.amount_minor,
            currency: tx.currency.clone(),
            counterparty: tx.counterparty.clone(),
        })
        .collect();

    Ok(Json(ApiResponse::ok(items)))
}

/// GET /api/transactions/:id/resolution
async fn get_resolution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Resolution> {
    let conn = state.conn();
    let resolution = db::resolve_transaction(
        &conn,
        &TransactionId::new(id),
        state.config.overhead_project(),
    )?;
    Ok(Json(ApiResponse::ok(resolution)))
}

/// POST /api/transactions/:id/allocation
async fn post_allocation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<AllocationRequest>,
) -> ApiResult<SavePlan> {
    let plan = {
        let conn = state.conn();
        save_allocation(
            &conn,
            &TransactionId::new(id),
            &request.splits,
            &actor_or_default(request.actor),
        )?
    };

    state.refresh_dashboard();
    Ok(Json(ApiResponse::ok(plan)))
}

/// POST /api/transactions/:id/exclude
async fn post_exclude(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Option<Json<ActorRequest>>,
) -> ApiResult<TransactionId> {
    let id = TransactionId::new(id);
    let actor = request.map(|Json(r)| r).unwrap_or_default().actor;
    {
        let conn = state.conn();
        exclude_transaction(&conn, &id, &actor_or_default(actor))?;
    }

    state.refresh_dashboard();
    Ok(Json(ApiResponse::ok(id)))
}

/// PUT /api/distributions/:month - Replace a month's overhead distribution
async fn put_distribution(
    State(state): State<AppState>,
    Path(month): Path<Month>,
    Json(request): Json<DistributionRequest>,
) -> ApiResult<MonthlyDistribution> {
    let distribution = MonthlyDistribution {
        month,
        percentages: request.percentages,
    };
    {
        let conn = state.conn();
        let overhead = state.config.overhead_project();
        set_monthly_distribution(
            &conn,
            &distribution,
            overhead.as_ref(),
            &actor_or_default(request.actor),
        )?;
    }

    state.refresh_dashboard();
    Ok(Json(ApiResponse::ok(distribution)))
}

/// GET /api/dashboard - Latest result of the polling refresh
async fn get_dashboard(State(state): State<AppState>) -> ApiResult<DashboardResponse> {
    let published = state.dashboard.latest().ok_or(ApiError::NotReady)?;
    Ok(Json(ApiResponse::ok(DashboardResponse {
        generation: published.generation,
        completed_at: published.completed_at,
        report: (*published.value).clone(),
    })))
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::load(None)?;
    let conn = db::open(&config.database_path)?;
    info!(database = ?config.database_path, "database opened");

    if config.overhead_project_id.is_none() {
        warn!("no overhead project configured, overhead redistribution disabled");
    }

    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
        config: Arc::new(config),
        dashboard: Arc::new(Refresher::new()),
    };

    // Polling loop: every tick supersedes whatever refresh is still running
    let poller = state.clone();
    let interval_secs = state.config.server.refresh_interval_secs.max(1);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            ticker.tick().await;
            poller.refresh_dashboard();
        }
    });

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/report", get(get_report))
        .route("/pending", get(get_pending))
        .route("/dashboard", get(get_dashboard))
        .route("/transactions/:id/resolution", get(get_resolution))
        .route("/transactions/:id/allocation", post(post_allocation))
        .route("/transactions/:id/exclude", post(post_exclude))
        .route("/distributions/:month", put(put_distribution))
        .with_state(state.clone());

    let app = Router::new().nest("/api", api_routes).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    );

    let addr = state.config.server.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(%addr, "🚀 margin-server listening");

    axum::serve(listener, app).await?;
    Ok(())
}
