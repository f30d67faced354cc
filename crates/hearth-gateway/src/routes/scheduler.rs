//! Task-scheduler administrative API.
//!
//! REST-style operations over the task store, mounted under
//! `/api/v1/scheduler`. The paths are protected: the transport layer
//! rejects them without a valid session.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::adapters::RestState;

/// Keys managed by the scheduler itself; rejected inside task config.
const RESERVED_CONFIG_KEYS: [&str; 6] = [
    "task_id",
    "task_class",
    "schedule",
    "enabled",
    "created_at",
    "updated_at",
];

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn reject(status: StatusCode, error: &str, detail: impl Into<String>) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({"error": error, "detail": detail.into()})),
    )
}

fn storage_error(err: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    reject(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        err.to_string(),
    )
}

fn validate_task_id(task_id: &str) -> Result<(), (StatusCode, Json<Value>)> {
    let valid_chars = task_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if task_id.is_empty() || task_id.len() > 100 || !valid_chars {
        return Err(reject(
            StatusCode::BAD_REQUEST,
            "invalid_task_id",
            "task_id must be 1-100 characters of [A-Za-z0-9._-]",
        ));
    }
    Ok(())
}

fn validate_task_class(task_class: &str) -> Result<(), (StatusCode, Json<Value>)> {
    let mut chars = task_class.chars();
    let starts_upper = chars.next().is_some_and(|c| c.is_ascii_uppercase());
    let rest_valid = task_class
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !starts_upper || !rest_valid {
        return Err(reject(
            StatusCode::BAD_REQUEST,
            "invalid_task_class",
            "task_class must be alphanumeric/underscore and start with an uppercase letter",
        ));
    }
    Ok(())
}

fn validate_schedule(
    state: &RestState,
    schedule: &str,
) -> Result<(), (StatusCode, Json<Value>)> {
    if !state.scheduler.parser().validate(schedule) {
        return Err(reject(
            StatusCode::BAD_REQUEST,
            "invalid_cron",
            "schedule must be a valid 5-field cron expression",
        ));
    }
    Ok(())
}

fn validate_config(config: &Value) -> Result<(), (StatusCode, Json<Value>)> {
    let Some(map) = config.as_object() else {
        return Err(reject(
            StatusCode::BAD_REQUEST,
            "invalid_config",
            "config must be a JSON object",
        ));
    };
    for key in RESERVED_CONFIG_KEYS {
        if map.contains_key(key) {
            return Err(reject(
                StatusCode::BAD_REQUEST,
                "invalid_config",
                format!("config key '{key}' is reserved"),
            ));
        }
    }
    Ok(())
}

/// Build the scheduler admin router.
pub fn router() -> Router<RestState> {
    Router::new()
        .route("/status", get(scheduler_status))
        .route("/tasks", get(list_tasks).post(create_task))
        .route(
            "/tasks/{task_id}",
            get(get_task).put(update_task).delete(delete_task),
        )
        .route("/tasks/{task_id}/enable", post(enable_task))
        .route("/tasks/{task_id}/disable", post(disable_task))
        .route("/tasks/{task_id}/trigger", post(trigger_task))
        .route("/tasks/{task_id}/status", get(task_status))
        .route("/tasks/{task_id}/history", get(task_history))
}

async fn scheduler_status(State(state): State<RestState>) -> ApiResult {
    let status = state.scheduler.status().await;
    serde_json::to_value(status)
        .map(Json)
        .map_err(storage_error)
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    enabled_only: bool,
}

async fn list_tasks(State(state): State<RestState>, Query(query): Query<ListQuery>) -> ApiResult {
    let tasks = state
        .scheduler
        .store()
        .list_tasks(query.enabled_only)
        .await
        .map_err(storage_error)?;

    let total_count = tasks.len();
    Ok(Json(json!({
        "tasks": tasks,
        "total_count": total_count,
    })))
}

#[derive(Debug, Deserialize)]
struct TaskConfigRequest {
    task_id: String,
    task_class: String,
    schedule: String,
    #[serde(default)]
    config: Option<Value>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

async fn create_task(
    State(state): State<RestState>,
    Json(request): Json<TaskConfigRequest>,
) -> ApiResult {
    validate_task_id(&request.task_id)?;
    validate_task_class(&request.task_class)?;
    validate_schedule(&state, &request.schedule)?;
    if let Some(config) = &request.config {
        validate_config(config)?;
    }

    state
        .scheduler
        .store()
        .upsert_task(
            &request.task_id,
            &request.task_class,
            &request.schedule,
            request.config.as_ref(),
            request.enabled,
        )
        .await
        .map_err(storage_error)?;
    state
        .scheduler
        .reschedule(&request.task_id)
        .await
        .map_err(storage_error)?;

    info!(task_id = %request.task_id, "Task upserted via API");
    Ok(Json(json!({
        "success": true,
        "message": format!("task '{}' saved", request.task_id),
    })))
}

async fn get_task(State(state): State<RestState>, Path(task_id): Path<String>) -> ApiResult {
    validate_task_id(&task_id)?;
    let record = state
        .scheduler
        .store()
        .get_task(&task_id)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| reject(StatusCode::NOT_FOUND, "task_not_found", task_id.clone()))?;

    serde_json::to_value(record)
        .map(Json)
        .map_err(storage_error)
}

#[derive(Debug, Deserialize)]
struct TaskUpdateRequest {
    #[serde(default)]
    schedule: Option<String>,
    #[serde(default)]
    config: Option<Value>,
    #[serde(default)]
    enabled: Option<bool>,
}

async fn update_task(
    State(state): State<RestState>,
    Path(task_id): Path<String>,
    Json(request): Json<TaskUpdateRequest>,
) -> ApiResult {
    validate_task_id(&task_id)?;

    let existing = state
        .scheduler
        .store()
        .get_task(&task_id)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| reject(StatusCode::NOT_FOUND, "task_not_found", task_id.clone()))?;

    let schedule = request.schedule.unwrap_or(existing.schedule);
    validate_schedule(&state, &schedule)?;

    let config = match request.config {
        Some(config) => {
            validate_config(&config)?;
            config
        }
        None => existing.config,
    };
    let enabled = request.enabled.unwrap_or(existing.enabled);

    state
        .scheduler
        .store()
        .upsert_task(
            &task_id,
            &existing.task_class,
            &schedule,
            Some(&config),
            enabled,
        )
        .await
        .map_err(storage_error)?;
    state
        .scheduler
        .reschedule(&task_id)
        .await
        .map_err(storage_error)?;

    Ok(Json(json!({
        "success": true,
        "message": format!("task '{task_id}' updated"),
    })))
}

async fn delete_task(State(state): State<RestState>, Path(task_id): Path<String>) -> ApiResult {
    validate_task_id(&task_id)?;

    if state.scheduler.is_task_running(&task_id) {
        return Err(reject(
            StatusCode::CONFLICT,
            "task_already_running",
            format!("task '{task_id}' has a running execution"),
        ));
    }

    let deleted = state
        .scheduler
        .store()
        .delete_task(&task_id)
        .await
        .map_err(storage_error)?;
    if !deleted {
        return Err(reject(StatusCode::NOT_FOUND, "task_not_found", task_id));
    }

    state
        .scheduler
        .reschedule(&task_id)
        .await
        .map_err(storage_error)?;

    Ok(Json(json!({"success": true, "message": "task deleted"})))
}

async fn set_enabled(state: &RestState, task_id: &str, enabled: bool) -> ApiResult {
    validate_task_id(task_id)?;

    let updated = state
        .scheduler
        .store()
        .set_task_enabled(task_id, enabled)
        .await
        .map_err(storage_error)?;
    if !updated {
        return Err(reject(
            StatusCode::NOT_FOUND,
            "task_not_found",
            task_id.to_string(),
        ));
    }

    state
        .scheduler
        .reschedule(task_id)
        .await
        .map_err(storage_error)?;

    Ok(Json(json!({
        "success": true,
        "message": format!(
            "task '{task_id}' {}",
            if enabled { "enabled" } else { "disabled" }
        ),
    })))
}

async fn enable_task(State(state): State<RestState>, Path(task_id): Path<String>) -> ApiResult {
    set_enabled(&state, &task_id, true).await
}

async fn disable_task(State(state): State<RestState>, Path(task_id): Path<String>) -> ApiResult {
    set_enabled(&state, &task_id, false).await
}

async fn trigger_task(State(state): State<RestState>, Path(task_id): Path<String>) -> ApiResult {
    validate_task_id(&task_id)?;

    match state.scheduler.trigger_task(&task_id).await {
        Ok(result) => Ok(Json(json!({
            "success": result.success,
            "message": result.message,
            "skipped": result.skipped,
            "error": result.error,
            "data": result.data,
        }))),
        Err(hearth_scheduler::SchedulerError::TaskNotFound(task_id)) => {
            Err(reject(StatusCode::NOT_FOUND, "task_not_found", task_id))
        }
        Err(hearth_scheduler::SchedulerError::TaskClassNotFound(task_id)) => Err(reject(
            StatusCode::NOT_FOUND,
            "task_class_not_found",
            task_id,
        )),
        Err(err) => Err(storage_error(err)),
    }
}

async fn task_status(State(state): State<RestState>, Path(task_id): Path<String>) -> ApiResult {
    validate_task_id(&task_id)?;

    let record = state
        .scheduler
        .store()
        .get_task(&task_id)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| reject(StatusCode::NOT_FOUND, "task_not_found", task_id.clone()))?;

    let last_execution = state
        .scheduler
        .store()
        .get_last_execution(&task_id)
        .await
        .map_err(storage_error)?;
    let next_run = state.scheduler.next_run_for(&task_id).await;

    Ok(Json(json!({
        "task_id": task_id,
        "enabled": record.enabled,
        "last_execution": last_execution,
        "next_run_time": next_run.map(|at| at.to_rfc3339()),
        "is_running": state.scheduler.is_task_running(&task_id),
    })))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    limit: u32,
}

fn default_history_limit() -> u32 {
    50
}

async fn task_history(
    State(state): State<RestState>,
    Path(task_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult {
    validate_task_id(&task_id)?;
    let limit = query.limit.clamp(1, 1000);

    let executions = state
        .scheduler
        .store()
        .get_execution_history(&task_id, limit)
        .await
        .map_err(storage_error)?;

    let total_count = executions.len();
    Ok(Json(json!({
        "task_id": task_id,
        "executions": executions,
        "total_count": total_count,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_rules() {
        assert!(validate_task_id("maintenance.log_cleanup").is_ok());
        assert!(validate_task_id("user.my-task_2").is_ok());
        assert!(validate_task_id("").is_err());
        assert!(validate_task_id(&"x".repeat(101)).is_err());
        assert!(validate_task_id("bad/task").is_err());
        assert!(validate_task_id("bad task").is_err());
    }

    #[test]
    fn test_task_class_rules() {
        assert!(validate_task_class("LogCleanupTask").is_ok());
        assert!(validate_task_class("X").is_ok());
        assert!(validate_task_class("lowercase").is_err());
        assert!(validate_task_class("").is_err());
        assert!(validate_task_class("Bad-Class").is_err());
    }

    #[test]
    fn test_config_reserved_keys() {
        assert!(validate_config(&json!({"retention_days": 7})).is_ok());
        assert!(validate_config(&json!({"schedule": "* * * * *"})).is_err());
        assert!(validate_config(&json!({"task_id": "x"})).is_err());
        assert!(validate_config(&json!(["not", "an", "object"])).is_err());
    }
}
