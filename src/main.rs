use axum::extract::State;
use axum::{http::Method, response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

mod config;
mod database;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;

use config::AppConfig;
use database::connection::get_db_client;
use database::transactions::MongoTransactionStore;
use errors::{AppError, Result};
use services::ledger_service::Ledger;
use services::mpesa_service::MpesaService;
use state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let app_state = match initialize_app_state().await {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("Startup failed: {}", e);
            std::process::exit(1);
        }
    };

    let config = app_state.config.clone();
    let app = build_router(app_state);
    start_server(app, &config).await;
}

async fn initialize_app_state() -> Result<AppState> {
    // Missing provider credentials abort here, not at first request.
    let config = AppConfig::from_env()?;
    tracing::info!(
        "M-Pesa environment: {} (short code {})",
        config.mpesa_environment,
        config.mpesa_short_code
    );

    let db = get_db_client(&config.database_url).await?;

    let store = MongoTransactionStore::new(db.clone());
    store.ensure_indexes().await?;
    let ledger = Ledger::new(Arc::new(store));

    let mpesa = Arc::new(MpesaService::new(config.clone()));

    // Verify the credentials against the provider; a failure here means
    // misconfiguration or a provider outage, but callbacks must still flow.
    match mpesa.access_token().await {
        Ok(_) => tracing::info!("M-Pesa access token obtained"),
        Err(e) => tracing::error!("M-Pesa credential check failed: {}", e),
    }

    Ok(AppState::new(config, db, mpesa, ledger))
}

fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_check))
        .route("/api/health", get(api_health_check))
        .nest("/api", routes::payment::payment_routes())
        .layer(cors)
        .with_state(app_state)
}

async fn bind_listener(config: &AppConfig) -> Result<tokio::net::TcpListener> {
    tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .map_err(|e| {
            AppError::configuration(format!(
                "failed to bind {}:{}: {}",
                config.host, config.port, e
            ))
        })
}

async fn start_server(app: Router, config: &AppConfig) {
    match bind_listener(config).await {
        Ok(listener) => {
            if let Ok(addr) = listener.local_addr() {
                tracing::info!("Server starting on {}", addr);
            }
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    }
}

async fn root_handler() -> &'static str {
    "M-Pesa STK Backend Running"
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn api_health_check(State(state): State<AppState>) -> Json<Value> {
    use mongodb::bson::doc;

    let db_status = match state.db.run_command(doc! {"ping": 1}).await {
        Ok(_) => "connected",
        Err(_) => "disconnected",
    };

    Json(json!({
        "status": "healthy",
        "database": db_status,
        "environment": state.config.mpesa_environment,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
