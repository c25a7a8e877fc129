//! gauntlet HTTP server binary.
//!
//! Starts an axum HTTP server exposing the evaluation engine: battery
//! runs, prosthetic management, distillation, and failure alerts.
//!
//! # Environment Variables
//!
//! - `PORT` — HTTP port (default: 8080)
//! - `GAUNTLET_DB` — SQLite database path (default: `gauntlet.db`)
//! - `GAUNTLET_ENDPOINT` — OpenAI-compatible chat-completions base URL
//!   (default: `http://localhost:8000/v1`)
//! - `GAUNTLET_API_KEY` — bearer token for the completions endpoint
//! - `RUST_LOG` — tracing filter (default: "info")
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin server
//! ```

use std::sync::Arc;

use gauntlet::battery::BatteryExecutor;
use gauntlet::catalog::CapabilityCatalog;
use gauntlet::config::EngineConfig;
use gauntlet::failure::observer::FailureObserver;
use gauntlet::failure::{DefaultClassifier, FailureLog};
use gauntlet::interfaces::broadcast::EventChannel;
use gauntlet::interfaces::invocation::HttpInvoker;
use gauntlet::interfaces::manager::{ModelResourceManager, NoopLoader};
use gauntlet::interfaces::store::{EvalStore, SqliteStore};
use gauntlet::prosthetic::distillation::{DefaultExtractor, DistillationEngine};
use gauntlet::prosthetic::ProstheticManager;
use gauntlet::registry::evaluators::EvaluatorRegistry;
use gauntlet::registry::TestRegistry;
use gauntlet::resolver::Resolver;
use gauntlet::server::{app_router, AppState, RunTable};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gauntlet=debug".into()),
        )
        .init();

    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let bind_addr = format!("0.0.0.0:{}", port);
    let db_path = std::env::var("GAUNTLET_DB").unwrap_or_else(|_| "gauntlet.db".to_string());
    let endpoint = std::env::var("GAUNTLET_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:8000/v1".to_string());
    let api_key = std::env::var("GAUNTLET_API_KEY").ok();

    let config = EngineConfig::default();
    let store: Arc<dyn EvalStore> = match SqliteStore::new(&db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!("cannot open store at {}: {}", db_path, e);
            std::process::exit(1);
        }
    };

    let events = EventChannel::new();
    let failures = Arc::new(FailureLog::new(
        Arc::clone(&store),
        Arc::new(DefaultClassifier),
    ));
    let observer = FailureObserver::new(config.clone(), events.clone());
    observer.attach(&failures);
    tokio::spawn(Arc::clone(&observer).run_periodic(Arc::clone(&failures)));

    let catalog = Arc::new(CapabilityCatalog::default_catalog());
    let executor = Arc::new(BatteryExecutor::new(
        Arc::new(TestRegistry::builtin()),
        Arc::new(EvaluatorRegistry::builtin()),
        Arc::new(Resolver::new(catalog, config.resolver_min_confidence)),
        Arc::new(HttpInvoker::new(endpoint.clone(), api_key)),
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
        config,
    ));

    let state = AppState {
        executor,
        runs: Arc::new(RunTable::new()),
        prosthetics,
        distillation,
        observer,
        store,
    };
    let app = app_router(state);

    tracing::info!("gauntlet server starting on {}", bind_addr);
    tracing::info!("model endpoint: {}", endpoint);
    tracing::info!("store: {}", db_path);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app).await.expect("Server failed");
}
