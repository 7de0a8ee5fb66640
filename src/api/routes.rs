//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::state::AppState;
use super::ApiError;
use crate::analysis::TimeWindow;
use crate::error::CoreError;
use crate::report::{ReportStatus, TestStatus};
use crate::scheduler::ScheduleDefinition;
use crate::storage::ReportFilter;

const DEFAULT_DAYS: u32 = 7;
const DEFAULT_TOP_LIMIT: usize = 10;
const DEFAULT_PREVIEW_HOURS: u64 = 24;

type ApiResult = Result<Json<Value>, ApiError>;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/reports", get(list_reports))
        .route("/reports/running", get(running_reports))
        .route("/reports/{id}", get(get_report))
        .route("/reports/{id}/details", get(report_details))
        .route("/reports/{id}/stop", post(stop_report))
        .route("/schedules", get(list_schedules).post(put_schedule))
        .route("/schedules/dry-run", get(schedule_dry_run))
        .route("/schedules/{name}", delete(remove_schedule))
        .route("/schedules/{name}/enable", post(enable_schedule))
        .route("/schedules/{name}/disable", post(disable_schedule))
        .route("/analytics/summary", get(analytics_summary))
        .route("/analytics/trend", get(analytics_trend))
        .route("/analytics/matrix", get(analytics_matrix))
        .route("/analytics/heatmap", get(analytics_heatmap))
        .route("/analytics/top-failures", get(analytics_top_failures))
        .route("/analytics/snapshot", get(analytics_snapshot))
        .route("/analytics/export.csv", get(analytics_export))
}

fn meta() -> Value {
    json!({
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

fn envelope<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({ "data": data, "meta": meta() }))
}

fn list_envelope<T: Serialize>(items: Vec<T>) -> Json<Value> {
    let total = items.len();
    let mut meta = meta();
    meta["total"] = json!(total);
    Json(json!({ "data": items, "meta": meta }))
}

async fn health() -> Json<Value> {
    envelope(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct ReportsQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    status: Option<String>,
    suite: Option<String>,
    limit: Option<usize>,
}

async fn list_reports(State(state): State<AppState>, Query(q): Query<ReportsQuery>) -> ApiResult {
    let status = match q.status.as_deref() {
        Some(raw) => Some(raw.parse::<ReportStatus>().map_err(CoreError::Validation)?),
        None => None,
    };
    let filter = ReportFilter {
        from: q.from,
        to: q.to,
        status,
        suite: q.suite,
        limit: Some(q.limit.unwrap_or(50)),
    };
    Ok(list_envelope(state.lifecycle.list(filter).await?))
}

async fn running_reports(State(state): State<AppState>) -> Json<Value> {
    list_envelope(state.lifecycle.running().await)
}

async fn get_report(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    Ok(envelope(state.lifecycle.get(&id).await?))
}

async fn report_details(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    Ok(list_envelope(state.lifecycle.details(&id).await?))
}

#[derive(Debug, Default, Deserialize)]
struct StopQuery {
    reason: Option<String>,
}

async fn stop_report(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<StopQuery>,
) -> ApiResult {
    let reason = q.reason.unwrap_or_else(|| "stopped via API".to_string());
    Ok(envelope(state.lifecycle.stop(&id, &reason).await?))
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

async fn list_schedules(State(state): State<AppState>) -> Json<Value> {
    list_envelope(state.orchestrator.schedules().await)
}

/// Create or replace a schedule and register it with the live trigger engine.
async fn put_schedule(
    State(state): State<AppState>,
    Json(def): Json<ScheduleDefinition>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let live = state.orchestrator.reschedule(def).await?;
    Ok((StatusCode::CREATED, envelope(live)))
}

async fn enable_schedule(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    Ok(envelope(state.orchestrator.activate(&name).await?))
}

async fn disable_schedule(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    state.orchestrator.deactivate(&name).await?;
    Ok(envelope(json!({ "schedule_name": name, "is_active": false })))
}

async fn remove_schedule(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    state.orchestrator.remove(&name).await?;
    Ok(envelope(json!({ "schedule_name": name, "removed": true })))
}

#[derive(Debug, Default, Deserialize)]
struct PreviewQuery {
    hours: Option<u64>,
}

async fn schedule_dry_run(State(state): State<AppState>, Query(q): Query<PreviewQuery>) -> Json<Value> {
    let hours = q.hours.unwrap_or(DEFAULT_PREVIEW_HOURS);
    let upcoming = state.orchestrator.preview(hours);
    envelope(json!({ "hours": hours, "upcoming": upcoming }))
}

// ---------------------------------------------------------------------------
// Analytics
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct WindowQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    limit: Option<usize>,
    kind: Option<String>,
}

impl WindowQuery {
    /// Missing bounds default to the last seven days ending now.
    fn window(&self) -> Result<TimeWindow, CoreError> {
        let now = Utc::now();
        let to = self.to.unwrap_or(now);
        let from = self.from.unwrap_or_else(|| TimeWindow::default_at(to).from);
        if from > to {
            return Err(CoreError::Validation(format!("window starts after it ends ({} > {})", from, to)));
        }
        Ok(TimeWindow::new(from, to))
    }
}

#[derive(Debug, Default, Deserialize)]
struct DaysQuery {
    days: Option<u32>,
    suite: Option<String>,
    status: Option<String>,
}

async fn analytics_summary(State(state): State<AppState>, Query(q): Query<WindowQuery>) -> ApiResult {
    Ok(envelope(state.analytics.summary(q.window()?).await))
}

async fn analytics_trend(State(state): State<AppState>, Query(q): Query<WindowQuery>) -> ApiResult {
    Ok(list_envelope(state.analytics.daily_trend(q.window()?).await))
}

async fn analytics_matrix(State(state): State<AppState>, Query(q): Query<DaysQuery>) -> ApiResult {
    let status = match q.status.as_deref() {
        Some(raw) => Some(raw.parse::<TestStatus>().map_err(CoreError::Validation)?),
        None => None,
    };
    let days = q.days.unwrap_or(DEFAULT_DAYS);
    Ok(list_envelope(state.analytics.test_matrix(days, q.suite, status).await))
}

async fn analytics_heatmap(State(state): State<AppState>, Query(q): Query<DaysQuery>) -> Json<Value> {
    list_envelope(state.analytics.failure_heatmap(q.days.unwrap_or(DEFAULT_DAYS)).await)
}

async fn analytics_top_failures(State(state): State<AppState>, Query(q): Query<WindowQuery>) -> ApiResult {
    let limit = q.limit.unwrap_or(DEFAULT_TOP_LIMIT);
    Ok(list_envelope(state.analytics.top_failures_in(q.window()?, limit).await))
}

async fn analytics_snapshot(State(state): State<AppState>, Query(q): Query<WindowQuery>) -> ApiResult {
    let limit = q.limit.unwrap_or(DEFAULT_TOP_LIMIT);
    Ok(envelope(state.analytics.snapshot(q.window()?, limit).await))
}

/// `?kind=summary` exports the aggregate line; anything else the raw rows.
async fn analytics_export(
    State(state): State<AppState>,
    Query(q): Query<WindowQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let window = q.window()?;
    let body = match q.kind.as_deref() {
        Some("summary") => state.analytics.export_summary(window).await,
        _ => state.analytics.export_executions(window).await,
    };
    Ok(([(header::CONTENT_TYPE, "text/csv; charset=utf-8")], body))
}
