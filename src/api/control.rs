use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::AppState;
use crate::{
    error::Result,
    metrics,
    models::{Group, Outcome, PeakReport, PeakResult, ReportKind},
    period,
};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MonthQuery {
    pub month: Option<u32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PrefixQuery {
    #[serde(default)]
    pub prefix: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeakStatus {
    Ok,
    NoData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeakResponse {
    pub label: String,
    pub kind: ReportKind,
    pub status: PeakStatus,
    pub window_start: i64,
    pub window_end: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_value: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub achieved_at: Option<String>,
}

impl From<PeakReport> for PeakResponse {
    fn from(report: PeakReport) -> Self {
        let (status, peak_value, peak_timestamp) = match report.result {
            PeakResult::Peak { timestamp, value } => (PeakStatus::Ok, Some(value), Some(timestamp)),
            PeakResult::NoData => (PeakStatus::NoData, None, None),
        };

        Self {
            label: report.label,
            kind: report.kind,
            status,
            window_start: report.window.start,
            window_end: report.window.end,
            peak_value,
            peak_timestamp,
            achieved_at: peak_timestamp.map(period::format_timestamp),
        }
    }
}

pub fn control_router() -> Router<AppState> {
    Router::new()
        .route("/peaks", get(list_peaks))
        .route("/peaks/:identifier", get(get_peak))
        .route("/groups", get(list_groups).post(create_group))
        .route("/groups/:name", get(group_info).delete(delete_group))
        .route("/groups/:name/members/:server", put(add_member).delete(remove_member))
        .route("/suggest", get(suggest))
        .route("/suggest/groups", get(suggest_groups))
        .route("/metrics", get(render_metrics))
}

async fn get_peak(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
    Query(query): Query<MonthQuery>,
) -> Result<Json<PeakResponse>> {
    info!("Getting peak: {} (month {:?})", identifier, query.month);

    let report = state
        .service
        .compute_group_or_series_peak(&identifier, query.month)
        .await?;

    Ok(Json(report.into()))
}

async fn list_peaks(
    State(state): State<AppState>,
    Query(query): Query<MonthQuery>,
) -> Result<Json<Vec<PeakResponse>>> {
    info!("Listing peaks (month {:?})", query.month);

    let reports = state.service.list_peaks(query.month).await?;

    Ok(Json(reports.into_iter().map(PeakResponse::from).collect()))
}

async fn list_groups(State(state): State<AppState>) -> Result<Json<Vec<String>>> {
    Ok(Json(state.service.list_groups().await?))
}

async fn create_group(
    State(state): State<AppState>,
    Json(request): Json<CreateGroupRequest>,
) -> Result<Response> {
    let outcome = state.service.create_group(&request.name).await?;

    Ok(match outcome {
        Outcome::Applied(()) => (
            StatusCode::CREATED,
            Json(Group {
                id: request.name,
                members: vec![],
            }),
        )
            .into_response(),
        Outcome::AlreadyExists => conflict(format!("Group {} already exists", request.name)),
        Outcome::NotFound => not_found(format!("Group {} not found", request.name)),
    })
}

async fn delete_group(State(state): State<AppState>, Path(name): Path<String>) -> Result<Response> {
    let outcome = state.service.delete_group(&name).await?;
    Ok(no_content_or(outcome, format!("Group {} not found", name)))
}

async fn group_info(State(state): State<AppState>, Path(name): Path<String>) -> Result<Response> {
    Ok(match state.service.group_info(&name).await? {
        Outcome::Applied(group) => Json(group).into_response(),
        _ => not_found(format!("Group {} not found", name)),
    })
}

async fn add_member(
    State(state): State<AppState>,
    Path((name, server)): Path<(String, String)>,
) -> Result<Response> {
    let outcome = state.service.add_member(&name, &server).await?;
    Ok(no_content_or(outcome, format!("Group {} not found", name)))
}

async fn remove_member(
    State(state): State<AppState>,
    Path((name, server)): Path<(String, String)>,
) -> Result<Response> {
    let outcome = state.service.remove_member(&name, &server).await?;
    Ok(no_content_or(
        outcome,
        format!("Server {} is not a member of group {}", server, name),
    ))
}

async fn suggest(State(state): State<AppState>, Query(query): Query<PrefixQuery>) -> Json<Vec<String>> {
    Json(state.service.suggest(&query.prefix))
}

async fn suggest_groups(
    State(state): State<AppState>,
    Query(query): Query<PrefixQuery>,
) -> Json<Vec<String>> {
    Json(state.service.suggest_groups(&query.prefix))
}

async fn render_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_text(),
    )
}

fn no_content_or(outcome: Outcome<()>, missing: String) -> Response {
    match outcome {
        Outcome::Applied(()) => StatusCode::NO_CONTENT.into_response(),
        Outcome::AlreadyExists => conflict(missing),
        Outcome::NotFound => not_found(missing),
    }
}

fn not_found(message: String) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
}

fn conflict(message: String) -> Response {
    (StatusCode::CONFLICT, Json(json!({ "error": message }))).into_response()
}
