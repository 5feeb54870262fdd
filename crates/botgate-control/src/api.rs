use std::{path::PathBuf, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    routing::{get, post},
};
use botgate_model::{ApiMessage, BotInfo, BotInstance, BotSummary, HealthStatus, LogFileInfo};
use serde::Deserialize;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    error::{ApiError, RunnerError},
    logs,
    registry::InstanceRegistry,
    runner::BotRunner,
};

/// Pause between stopping a bot and resetting its connection.
const REBOOT_SETTLE: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct AppState {
    pub registry: InstanceRegistry,
    pub runner: Arc<dyn BotRunner>,
    pub log_path: PathBuf,
    pub probe_timeout: Duration,
}

/// Routes:
/// - GET  /api/healthcheck
/// - GET  /api/instances, /api/instances/check
/// - POST /api/instances/add, /api/instances/remove
/// - GET  /api/bots, /api/botinfo
/// - POST /api/bots/{id}/start|stop|idle|resume|rebootAndStop
/// - POST /api/bots/startAll, /api/bots/stopAll
/// - GET  /api/logs?lines=N, /api/logs/latest?count=N
/// - GET  /api/log/files, /api/log/file/{name}?lines=N
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index))
        .route("/api/healthcheck", get(healthcheck))
        .route("/api/instances", get(list_instances))
        .route("/api/instances/check", get(check_instances))
        .route("/api/instances/add", post(add_instance))
        .route("/api/instances/remove", post(remove_instance))
        .route("/api/botinfo", get(bot_info))
        .route("/api/bots", get(list_bots))
        .route("/api/bots/startAll", post(start_all))
        .route("/api/bots/stopAll", post(stop_all))
        .route("/api/bots/:id/start", post(start_bot))
        .route("/api/bots/:id/stop", post(stop_bot))
        .route("/api/bots/:id/idle", post(pause_bot))
        .route("/api/bots/:id/resume", post(resume_bot))
        .route("/api/bots/:id/rebootAndStop", post(reboot_and_stop))
        .route("/api/logs", get(tail_logs))
        .route("/api/logs/latest", get(latest_logs))
        .route("/api/log/files", get(list_log_files))
        .route("/api/log/file/:name", get(log_file))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn index() -> &'static str {
    "botgate control API. Use a separate dashboard to manage this instance."
}

async fn healthcheck() -> Json<HealthStatus> {
    Json(HealthStatus::ok())
}

#[derive(Debug, Deserialize)]
struct AddInstanceRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    host: Option<String>,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct RemoveInstanceRequest {
    #[serde(default)]
    host: Option<String>,
    port: u16,
}

fn host_or_default(host: Option<String>) -> String {
    host.map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

async fn list_instances(State(state): State<AppState>) -> Json<Vec<BotInstance>> {
    Json(state.registry.list_all())
}

async fn check_instances(State(state): State<AppState>) -> Json<Vec<BotInstance>> {
    Json(state.registry.probe_all(state.probe_timeout).await)
}

async fn add_instance(
    State(state): State<AppState>,
    body: Result<Json<AddInstanceRequest>, JsonRejection>,
) -> Result<Json<ApiMessage>, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    let name = req
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| "New instance".to_string());
    let host = host_or_default(req.host);

    state.registry.register(&name, &host, req.port);
    Ok(Json(ApiMessage::ok("Instance added")))
}

async fn remove_instance(
    State(state): State<AppState>,
    body: Result<Json<RemoveInstanceRequest>, JsonRejection>,
) -> Result<Json<ApiMessage>, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    let host = host_or_default(req.host);

    state.registry.remove(&host, req.port);
    Ok(Json(ApiMessage::ok("Instance removed")))
}

async fn bot_info(State(state): State<AppState>) -> Json<BotInfo> {
    Json(BotInfo {
        count: state.runner.bot_count(),
        is_running: state.runner.is_running(),
    })
}

async fn list_bots(State(state): State<AppState>) -> Json<Vec<BotSummary>> {
    Json(state.runner.bots())
}

fn require_bot(runner: &dyn BotRunner, id: &str) -> Result<(), ApiError> {
    if runner.contains(id) {
        Ok(())
    } else {
        Err(RunnerError::NotFound(id.to_string()).into())
    }
}

fn require_console_creation(runner: &dyn BotRunner) -> Result<(), ApiError> {
    if runner.console_bot_creation_disabled() {
        return Err(RunnerError::ConsoleBotCreationDisabled.into());
    }
    Ok(())
}

async fn start_bot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiMessage>, ApiError> {
    let runner = state.runner.as_ref();
    require_bot(runner, &id)?;
    require_console_creation(runner)?;
    runner.initialize_start()?;
    runner.start_bot(&id)?;
    Ok(Json(ApiMessage::ok("Bot started")))
}

async fn stop_bot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiMessage>, ApiError> {
    state.runner.stop_bot(&id)?;
    Ok(Json(ApiMessage::ok("Bot stopped")))
}

async fn pause_bot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiMessage>, ApiError> {
    state.runner.pause_bot(&id)?;
    Ok(Json(ApiMessage::ok("Bot paused")))
}

async fn resume_bot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiMessage>, ApiError> {
    state.runner.resume_bot(&id)?;
    Ok(Json(ApiMessage::ok("Bot resumed")))
}

async fn reboot_and_stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiMessage>, ApiError> {
    require_bot(state.runner.as_ref(), &id)?;
    require_console_creation(state.runner.as_ref())?;
    state.runner.stop_bot(&id)?;
    tokio::time::sleep(REBOOT_SETTLE).await;
    state.runner.reset_connection(&id)?;
    tracing::info!(bot = %id, "bot rebooted and stopped");
    Ok(Json(ApiMessage::ok("Bot rebooted and stopped")))
}

async fn start_all(State(state): State<AppState>) -> Result<Json<ApiMessage>, ApiError> {
    let runner = state.runner.as_ref();
    require_console_creation(runner)?;
    runner.initialize_start()?;
    runner.start_all()?;
    Ok(Json(ApiMessage::ok("All bots started")))
}

async fn stop_all(State(state): State<AppState>) -> Result<Json<ApiMessage>, ApiError> {
    state.runner.stop_all()?;
    Ok(Json(ApiMessage::ok("All bots stopped")))
}

#[derive(Debug, Default, Deserialize)]
struct LogsQuery {
    lines: Option<String>,
    count: Option<String>,
}

fn parse_count(raw: Option<&str>) -> Option<usize> {
    raw.and_then(|v| v.trim().parse::<usize>().ok())
}

async fn tail_logs(
    State(state): State<AppState>,
    Query(q): Query<LogsQuery>,
) -> Json<Vec<String>> {
    let lines = logs::clamp_lines(parse_count(q.lines.as_deref()), logs::DEFAULT_MAX_LINES);
    Json(logs::tail(&state.log_path, lines).await)
}

async fn latest_logs(
    State(state): State<AppState>,
    Query(q): Query<LogsQuery>,
) -> Json<Vec<String>> {
    let count = logs::clamp_lines(parse_count(q.count.as_deref()), logs::DEFAULT_LATEST_LINES);
    Json(logs::tail(&state.log_path, count).await)
}

async fn list_log_files(State(state): State<AppState>) -> Result<Json<Vec<LogFileInfo>>, ApiError> {
    Ok(Json(logs::list_files(logs::log_dir(&state.log_path)).await?))
}

async fn log_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(q): Query<LogsQuery>,
) -> Result<Json<Vec<String>>, ApiError> {
    let lines = logs::clamp_lines(parse_count(q.lines.as_deref()), logs::DEFAULT_MAX_LINES);
    Ok(Json(logs::read_file(logs::log_dir(&state.log_path), &name, lines).await?))
}
