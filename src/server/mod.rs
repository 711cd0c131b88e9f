pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::gemini::GeminiClient;
use crate::storage::{Database, ObjectStore};
use crate::tasks::{spawn_worker, JobContext, TaskQueue};
use crate::utils::AppError;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub gemini: Arc<GeminiClient>,
    pub store: Arc<ObjectStore>,
    pub queue: TaskQueue,
    pub config: Arc<AppConfig>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Validation(_) | AppError::InvalidState(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn create_router(state: AppState) -> Router {
    let timeout = Duration::from_secs(state.config.server.request_timeout_secs);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/generate-response", post(handlers::generate_response))
        .route("/api/generate-post-response", post(handlers::generate_post_response))
        .route("/api/analyze-user", post(handlers::analyze_user))
        .route("/api/upload", post(handlers::upload))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(timeout))
}

/// サーバ本体。依存を構築し、ワーカーを起動してから待ち受けに入る
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    if !config.is_gemini_configured() {
        warn!("GOOGLE_API_KEY が未設定です。モデル呼び出しは失敗します");
    }

    let db = Arc::new(Database::new(&config.storage.database_url).await?);
    db.init_schema().await?;

    let gemini = Arc::new(GeminiClient::new(config.gemini.clone()));
    let store = Arc::new(ObjectStore::new(config.storage.clone()));
    let config = Arc::new(config);

    let (queue, rx) = TaskQueue::new();
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()?;
    spawn_worker(
        rx,
        JobContext {
            db: Arc::clone(&db),
            gemini: Arc::clone(&gemini),
            http,
            config: Arc::clone(&config),
        },
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState { db, gemini, store, queue, config };
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("サーバ起動: {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        warn!("シャットダウン信号の待機に失敗しました");
        return;
    }
    info!("シャットダウン信号を受信しました");
}
