//! Axum route handlers for the evaluation engine.
//!
//! # Routes
//!
//! - `GET  /health`                       — liveness probe
//! - `POST /runs`                         — start an evaluation run
//! - `GET  /runs`                         — list run ids
//! - `GET  /runs/:id`                     — run status and result
//! - `POST /runs/:id/cancel`              — cooperative cancellation
//! - `GET  /prosthetics`                  — list prosthetics
//! - `GET  /prosthetics/:model_id`        — one model's prosthetic
//! - `PUT  /prosthetics/:model_id`        — create or edit (new version)
//! - `DELETE /prosthetics/:model_id`      — delete entry and history
//! - `POST /prosthetics/:model_id/revert` — point current at a prior version
//! - `POST /prosthetics/:model_id/verify` — battery re-run over probes_fixed
//! - `POST /distill`                      — run teacher→student distillation
//! - `GET  /alerts`                       — recent failure alerts
//! - `GET  /failures`                     — failure log entries

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::battery::{BatteryExecutor, RunRequest};
use crate::errors::EngineError;
use crate::failure::observer::FailureObserver;
use crate::interfaces::store::EvalStore;
use crate::prosthetic::distillation::{DistillationEngine, DistillationRequest};
use crate::prosthetic::{ProstheticEdit, ProstheticManager};
use crate::server::RunTable;

/// Shared application state for the HTTP server.
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<BatteryExecutor>,
    pub runs: Arc<RunTable>,
    pub prosthetics: Arc<ProstheticManager>,
    pub distillation: Arc<DistillationEngine>,
    pub observer: Arc<FailureObserver>,
    pub store: Arc<dyn EvalStore>,
}

/// Build the axum router with all routes.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/runs", post(start_run_handler).get(list_runs_handler))
        .route("/runs/:id", get(get_run_handler))
        .route("/runs/:id/cancel", post(cancel_run_handler))
        .route("/prosthetics", get(list_prosthetics_handler))
        .route(
            "/prosthetics/:model_id",
            put(edit_prosthetic_handler)
                .get(get_prosthetic_handler)
                .delete(delete_prosthetic_handler),
        )
        .route("/prosthetics/:model_id/revert", post(revert_prosthetic_handler))
        .route("/prosthetics/:model_id/verify", post(verify_prosthetic_handler))
        .route("/distill", post(distill_handler))
        .route("/alerts", get(alerts_handler))
        .route("/failures", get(failures_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

type ApiError = (StatusCode, Json<Value>);

/// Map engine errors onto HTTP statuses.
fn error_response(e: EngineError) -> ApiError {
    let status = match e {
        EngineError::Configuration { .. } => StatusCode::BAD_REQUEST,
        EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
        EngineError::Transport { .. } => StatusCode::BAD_GATEWAY,
        EngineError::Persistence { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": e.to_string() })))
}

fn not_found(what: &str) -> ApiError {
    error_response(EngineError::not_found(what))
}

/// GET /health — liveness probe.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "service": "gauntlet",
    }))
}

/// POST /runs — start an evaluation run in its own task.
async fn start_run_handler(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Result<Json<Value>, ApiError> {
    let run_id = Uuid::new_v4().to_string();
    let record = state.runs.insert(run_id.clone(), request.clone());

    let executor = Arc::clone(&state.executor);
    let task_record = Arc::clone(&record);
    tokio::spawn(async move {
        match executor.run(&task_record.request, &task_record.cancel).await {
            Ok(result) => task_record.finish(result),
            Err(e) => {
                // Only pre-run validation errors surface here; the result
                // stays empty and the error is recorded in the status log.
                log::error!("run {} rejected: {}", task_record.id, e);
                let mut result = crate::battery::ComboTestResult::started(&task_record.request);
                result.status = crate::battery::RunStatus::Failed;
                result.error = Some(e.to_string());
                task_record.finish(result);
            }
        }
    });

    Ok(Json(json!({
        "run_id": run_id,
        "status": record.status(),
        "estimated_minutes": request.mode.estimated_minutes(),
    })))
}

/// GET /runs — ids of all tracked runs.
async fn list_runs_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "runs": state.runs.ids() }))
}

/// GET /runs/:id — status plus the result once the run finished.
async fn get_run_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .runs
        .get(&id)
        .ok_or_else(|| not_found(&format!("run '{}'", id)))?;
    Ok(Json(json!({
        "run_id": record.id,
        "status": record.status(),
        "result": record.result(),
    })))
}

/// POST /runs/:id/cancel — cooperative, takes effect between tests.
async fn cancel_run_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .runs
        .get(&id)
        .ok_or_else(|| not_found(&format!("run '{}'", id)))?;
    record.cancel.cancel();
    Ok(Json(json!({ "run_id": id, "cancelled": true })))
}

async fn list_prosthetics_handler(
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let entries = state.prosthetics.list().await.map_err(error_response)?;
    Ok(Json(json!({ "prosthetics": entries })))
}

async fn get_prosthetic_handler(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let entry = state
        .prosthetics
        .get(&model_id)
        .await
        .map_err(error_response)?
        .ok_or_else(|| not_found(&format!("prosthetic for '{}'", model_id)))?;
    Ok(Json(serde_json::to_value(entry).unwrap_or(Value::Null)))
}

#[derive(Debug, Deserialize)]
struct EditProstheticBody {
    prompt: String,
    level: u8,
    #[serde(default)]
    probes_fixed: Vec<String>,
}

/// PUT /prosthetics/:model_id — every edit appends a version.
async fn edit_prosthetic_handler(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
    Json(body): Json<EditProstheticBody>,
) -> Result<Json<Value>, ApiError> {
    let entry = state
        .prosthetics
        .create_or_edit(ProstheticEdit {
            model_id,
            prompt: body.prompt,
            level: body.level,
            probes_fixed: body.probes_fixed,
            learned_from_model: None,
        })
        .await
        .map_err(error_response)?;
    Ok(Json(serde_json::to_value(entry).unwrap_or(Value::Null)))
}

async fn delete_prosthetic_handler(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let deleted = state
        .prosthetics
        .delete(&model_id)
        .await
        .map_err(error_response)?;
    if !deleted {
        return Err(not_found(&format!("prosthetic for '{}'", model_id)));
    }
    Ok(Json(json!({ "deleted": true })))
}

#[derive(Debug, Deserialize)]
struct RevertBody {
    version_id: String,
}

async fn revert_prosthetic_handler(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
    Json(body): Json<RevertBody>,
) -> Result<Json<Value>, ApiError> {
    let entry = state
        .prosthetics
        .revert(&model_id, &body.version_id)
        .await
        .map_err(error_response)?;
    Ok(Json(serde_json::to_value(entry).unwrap_or(Value::Null)))
}

async fn verify_prosthetic_handler(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let entry = state
        .prosthetics
        .verify(&model_id, &state.executor)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({
        "model_id": entry.model_id,
        "verified": entry.verified,
        "current_version": entry.current_version,
    })))
}

/// POST /distill — synchronous: responds when the workflow finishes.
async fn distill_handler(
    State(state): State<AppState>,
    Json(request): Json<DistillationRequest>,
) -> Result<Json<Value>, ApiError> {
    let result = state
        .distillation
        .run(&request)
        .await
        .map_err(error_response)?;
    Ok(Json(serde_json::to_value(result).unwrap_or(Value::Null)))
}

/// GET /alerts — the observer's rolling buffer, newest last.
async fn alerts_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "alerts": state.observer.recent_alerts() }))
}

#[derive(Debug, Deserialize)]
struct FailureFilter {
    model_id: Option<String>,
}

/// GET /failures?model_id= — persisted failure entries.
async fn failures_handler(
    State(state): State<AppState>,
    Query(filter): Query<FailureFilter>,
) -> Result<Json<Value>, ApiError> {
    let failures = state
        .store
        .list_failures(filter.model_id.as_deref())
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "failures": failures })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battery::tests::competent_invoker;
    use crate::battery::RunStatus;
    use crate::catalog::CapabilityCatalog;
    use crate::config::EngineConfig;
    use crate::failure::{DefaultClassifier, FailureLog};
    use crate::interfaces::broadcast::EventChannel;
    use crate::interfaces::manager::{ModelResourceManager, NoopLoader};
    use crate::interfaces::store::MemoryStore;
    use crate::prosthetic::distillation::DefaultExtractor;
    use crate::registry::evaluators::EvaluatorRegistry;
    use crate::registry::TestRegistry;
    use crate::resolver::Resolver;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let config = EngineConfig::default();
        let store: Arc<dyn EvalStore> = Arc::new(MemoryStore::new());
        let events = EventChannel::new();
        let failures = Arc::new(FailureLog::new(
            Arc::clone(&store),
            Arc::new(DefaultClassifier),
        ));
        let catalog = Arc::new(CapabilityCatalog::default_catalog());
        let executor = Arc::new(BatteryExecutor::new(
            Arc::new(TestRegistry::builtin()),
            Arc::new(EvaluatorRegistry::builtin()),
            Arc::new(Resolver::new(catalog, config.resolver_min_confidence)),
            Arc::new(competent_invoker()),
            Arc::new(ModelResourceManager::new(Arc::new(NoopLoader))),
            Arc::clone(&store),
            Arc::clone(&failures),
            events.clone(),
            config.clone(),
        ));
        let prosthetics = Arc::new(ProstheticManager::new(Arc::clone(&store)));
        let distillation = Arc::new(DistillationEngine::new(
            Arc::clone(&executor),
            Arc::clone(&prosthetics),
            Arc::new(DefaultExtractor),
            config.clone(),
        ));
        let observer = FailureObserver::new(config, events);
        observer.attach(&failures);
        AppState {
            executor,
            runs: Arc::new(RunTable::new()),
            prosthetics,
            distillation,
            observer,
            store,
        }
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = app_router(test_state());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "gauntlet");
    }

    #[tokio::test]
    async fn test_start_and_poll_run() {
        let state = test_state();
        let app = app_router(state.clone());

        let request = Request::post("/runs")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({ "main_model_id": "m1", "mode": "quick" }).to_string(),
            ))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let run_id = body["run_id"].as_str().unwrap().to_string();

        // The scripted invoker is instant; poll until the task finishes.
        for _ in 0..100 {
            if state.runs.get(&run_id).unwrap().result().is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let response = app
            .oneshot(
                Request::get(format!("/runs/{}", run_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["status"], "complete");
        assert_eq!(body["result"]["qualifying_gate_passed"], true);
    }

    #[tokio::test]
    async fn test_get_unknown_run_is_404() {
        let app = app_router(test_state());
        let response = app
            .oneshot(Request::get("/runs/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_marks_token() {
        let state = test_state();
        let record = state.runs.insert(
            "run-x".to_string(),
            RunRequest::single("m1", crate::registry::TestMode::Quick),
        );
        let app = app_router(state);
        let response = app
            .oneshot(
                Request::post("/runs/run-x/cancel")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(record.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_prosthetic_crud_routes() {
        let app = app_router(test_state());

        let response = app
            .clone()
            .oneshot(
                Request::put("/prosthetics/m1")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({ "prompt": "Read before writing.", "level": 1 }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["level"], 1);
        assert_eq!(body["versions"].as_array().unwrap().len(), 1);

        let response = app
            .clone()
            .oneshot(Request::get("/prosthetics/m1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(
                Request::delete("/prosthetics/m1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/prosthetics/m1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_prosthetic_level_is_400() {
        let app = app_router(test_state());
        let response = app
            .oneshot(
                Request::put("/prosthetics/m1")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "prompt": "x", "level": 9 }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_alerts_route_empty_buffer() {
        let app = app_router(test_state());
        let response = app
            .oneshot(Request::get("/alerts").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["alerts"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_distill_rejects_same_model() {
        let app = app_router(test_state());
        let response = app
            .oneshot(
                Request::post("/distill")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({
                            "teacher_model_id": "same",
                            "student_model_id": "same",
                            "capability": "single_tool",
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_run_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(RunStatus::FullBattery).unwrap(),
            json!("full_battery")
        );
    }
}
