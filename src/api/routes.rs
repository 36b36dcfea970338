//! API route definitions and handlers.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::analysis;
use crate::runner::{FormConfig, RunRecord};
use crate::schedule::{NewSchedule, ScheduleUpdate};

use super::error::ApiError;
use super::state::AppState;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/tests", post(create_test))
        .route("/run-test", post(create_test))
        .route("/tests/{id}", get(get_test))
        .route("/test-results", get(list_test_results))
        .route("/test-results/{id}", get(get_test))
        .route("/schedules", post(create_schedule).get(list_schedules))
        .route("/schedule-test", post(create_schedule))
        .route(
            "/schedules/{id}",
            get(get_schedule).patch(patch_schedule).delete(delete_schedule),
        )
        .route("/schedules/{id}/active", patch(toggle_schedule))
        .route("/schedules/{id}/runs", get(schedule_runs))
        .route("/analytics/overview", get(analytics_overview))
        .route("/analytics/url", get(analytics_url))
        .route("/screenshots/{test_id}/{file}", get(screenshot))
}

fn meta(extra: Value) -> Value {
    let mut meta = json!({
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    });
    if let (Some(base), Some(add)) = (meta.as_object_mut(), extra.as_object()) {
        for (k, v) in add {
            base.insert(k.clone(), v.clone());
        }
    }
    meta
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::Validation(format!("malformed id '{}'", raw)))
}

fn decode_body<T: serde::de::DeserializeOwned>(body: Value) -> Result<T, ApiError> {
    serde_json::from_value(body).map_err(|e| ApiError::Validation(format!("invalid request body: {}", e)))
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta(json!({}))
    }))
}

// ---------------------------------------------------------------------------
// Ad hoc test runs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdHocRunRequest {
    url: String,
    form_config: FormConfig,
    #[serde(default)]
    user_data: HashMap<String, Value>,
    /// Accepted for parity with the schedule payload; not persisted on runs.
    #[serde(default)]
    #[allow(dead_code)]
    name: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    description: Option<String>,
}

/// Accepted-and-running semantics: the record is persisted in `running`
/// state and the browser work continues in the background.
async fn create_test(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let req: AdHocRunRequest = decode_body(body)?;
    if req.url.trim().is_empty() {
        return Err(ApiError::Validation("url must not be empty".into()));
    }

    let rec = RunRecord::start(None, req.url, req.form_config, req.user_data);
    state.runs.save(&rec).map_err(ApiError::Internal)?;

    let runner = state.runner.clone();
    let spawned = rec.clone();
    tokio::spawn(async move {
        runner.execute(spawned).await;
    });

    Ok(Json(json!({
        "data": {
            "testId": rec.id,
            "status": rec.status,
            "url": rec.url,
            "screenshots": rec.screenshots,
            "errorCount": rec.errors.len(),
        },
        "meta": meta(json!({}))
    })))
}

/// Full run record with signed screenshot URLs and, when schedule-linked, an
/// embedded schedule summary.
async fn get_test(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id)?;
    let rec = state
        .runs
        .get(id)
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::NotFound(format!("test {} not found", id)))?;

    let mut data = serde_json::to_value(&rec).map_err(|e| ApiError::Internal(e.into()))?;

    let urls: HashMap<&String, String> = rec
        .screenshots
        .iter()
        .map(|(stage, reference)| (stage, state.shots.signed_url(reference)))
        .collect();
    data["screenshotUrls"] = serde_json::to_value(urls).map_err(|e| ApiError::Internal(e.into()))?;

    if let Some(schedule_id) = rec.schedule_id {
        if let Ok(s) = state.schedules.get(schedule_id) {
            data["schedule"] = json!({
                "id": s.id,
                "name": s.name,
                "frequency": s.frequency,
                "active": s.active,
                "stats": s.stats,
            });
        }
    }

    Ok(Json(json!({ "data": data, "meta": meta(json!({})) })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    #[serde(default)]
    limit: Option<u64>,
    #[serde(default)]
    next_token: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

async fn list_test_results(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = q.limit.unwrap_or(20).clamp(1, 100);
    let (records, next) = state
        .runs
        .list(limit, q.next_token.as_deref(), q.url.as_deref())
        .map_err(ApiError::Internal)?;

    // Summary covers the returned page only, not the full filtered set.
    let summary = analysis::page_summary(&records);

    Ok(Json(json!({
        "data": records,
        "meta": meta(json!({
            "summary": summary,
            "nextToken": next,
        }))
    })))
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

async fn create_schedule(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let input: NewSchedule = decode_body(body)?;
    let schedule = state.schedules.create(input).await?;
    Ok(Json(json!({ "data": schedule, "meta": meta(json!({})) })))
}

async fn list_schedules(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = q.limit.unwrap_or(20).clamp(1, 100);
    let (schedules, next) = state.schedules.list(limit, q.next_token.as_deref())?;
    Ok(Json(json!({
        "data": schedules,
        "meta": meta(json!({ "nextToken": next }))
    })))
}

async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id)?;
    let schedule = state.schedules.get(id)?;
    Ok(Json(json!({ "data": schedule, "meta": meta(json!({})) })))
}

async fn patch_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id)?;
    let upd: ScheduleUpdate = decode_body(body)?;
    let schedule = state.schedules.update(id, upd).await?;
    Ok(Json(json!({ "data": schedule, "meta": meta(json!({})) })))
}

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    active: bool,
}

async fn toggle_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id)?;
    let req: ToggleRequest = decode_body(body)?;
    let schedule = state.schedules.set_active(id, req.active).await?;
    Ok(Json(json!({ "data": schedule, "meta": meta(json!({})) })))
}

async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id)?;
    state.schedules.delete(id).await?;
    Ok(Json(json!({ "data": { "deleted": id }, "meta": meta(json!({})) })))
}

async fn schedule_runs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id)?;
    // 404 before listing so an unknown id is not an empty page
    state.schedules.get(id)?;

    let limit = q.limit.unwrap_or(20).clamp(1, 100);
    let (records, next) = state
        .runs
        .list_for_schedule(id, limit, q.next_token.as_deref())
        .map_err(ApiError::Internal)?;
    let summary = analysis::page_summary(&records);

    Ok(Json(json!({
        "data": records,
        "meta": meta(json!({ "summary": summary, "nextToken": next }))
    })))
}

// ---------------------------------------------------------------------------
// Analytics
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RangeQuery {
    #[serde(default)]
    from: Option<DateTime<Utc>>,
    #[serde(default)]
    to: Option<DateTime<Utc>>,
    #[serde(default)]
    url: Option<String>,
}

impl RangeQuery {
    fn resolve(&self) -> Result<(DateTime<Utc>, DateTime<Utc>), ApiError> {
        let to = self.to.unwrap_or_else(Utc::now);
        let from = self.from.unwrap_or(to - Duration::days(30));
        if from > to {
            return Err(ApiError::Validation("'from' must not be after 'to'".into()));
        }
        Ok((from, to))
    }
}

async fn analytics_overview(
    State(state): State<AppState>,
    Query(q): Query<RangeQuery>,
) -> Result<Json<Value>, ApiError> {
    let (from, to) = q.resolve()?;
    let runs = state
        .runs
        .in_range(from, to, None)
        .map_err(ApiError::Internal)?;
    let report = analysis::analyze(&runs, from, to);
    Ok(Json(json!({ "data": report, "meta": meta(json!({})) })))
}

async fn analytics_url(
    State(state): State<AppState>,
    Query(q): Query<RangeQuery>,
) -> Result<Json<Value>, ApiError> {
    let url = q
        .url
        .clone()
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ApiError::Validation("missing required query parameter 'url'".into()))?;
    let (from, to) = q.resolve()?;
    let runs = state
        .runs
        .in_range(from, to, Some(&url))
        .map_err(ApiError::Internal)?;
    let report = analysis::analyze(&runs, from, to);
    Ok(Json(json!({ "data": report, "meta": meta(json!({ "url": url })) })))
}

// ---------------------------------------------------------------------------
// Screenshots
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SignedQuery {
    expires: i64,
    sig: String,
}

/// Serve a stored screenshot. Requires a valid, unexpired signature; anything
/// else is reported as not found rather than leaking existence.
async fn screenshot(
    State(state): State<AppState>,
    Path((test_id, file)): Path<(String, String)>,
    Query(q): Query<SignedQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let reference = format!("{}/{}", test_id, file);
    if !state.shots.verify(&reference, q.expires, &q.sig) {
        return Err(ApiError::NotFound("screenshot not found".into()));
    }

    let path = state
        .shots
        .path_for(&reference)
        .map_err(|_| ApiError::NotFound("screenshot not found".into()))?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::NotFound("screenshot not found".into()))?;

    Ok(([(CONTENT_TYPE, "image/png")], bytes))
}
