//! Hopper Worker - queue consumer process
//!
//! Serves every queue the demo modules declare for the configured worker kind,
//! exposes a small HTTP surface for health, status and publishing, and stops
//! gracefully on Ctrl-C.

mod demo;
mod settings;

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use hopper_broker::{BrokerConnector, MemoryBroker, Publisher};
use hopper_core::QueueWorker;
use hopper_types::{mask_password_url, Error, Message, QueueStats, WorkerState};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use crate::settings::Settings;

// ==================== App State ====================

/// Shared application state
#[derive(Clone)]
struct AppState {
    broker: Arc<MemoryBroker>,
    worker: Arc<QueueWorker>,
}

// ==================== Request/Response Types ====================

/// Publish message request
#[derive(Debug, Deserialize, ToSchema)]
struct PublishRequest {
    /// Message body content
    body: String,
    /// Producer or exchange name
    #[serde(default)]
    origin: Option<String>,
    /// Custom message headers
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    headers: Option<HashMap<String, serde_json::Value>>,
}

/// Publish response
#[derive(Debug, Serialize, ToSchema)]
struct PublishResponse {
    /// ID of the published message
    message_id: String,
}

/// Worker status response
#[derive(Debug, Serialize, ToSchema)]
struct WorkerStatus {
    /// Worker kind label
    name: String,
    /// Lifecycle state
    state: WorkerState,
    /// Tasks spawned and not yet finished
    in_flight: usize,
    /// Number of queues consumed
    queues: usize,
    /// Whether the broker acknowledges on delivery
    auto_ack: bool,
}

/// API Error response
#[derive(Debug, Serialize, ToSchema)]
struct ApiErrorBody {
    /// Error message
    error: String,
    /// Error code
    code: String,
}

/// Health check response
#[derive(Debug, Serialize, ToSchema)]
struct HealthResponse {
    /// Health status
    status: String,
    /// Server version
    version: String,
    /// Broker connection status
    broker: String,
}

// ==================== Error Handling ====================

/// Wrapper for Hopper errors to implement IntoResponse
struct AppError(Error);

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, code) = match &self.0 {
            Error::QueueNotFound(_) => (StatusCode::NOT_FOUND, "QUEUE_NOT_FOUND"),
            Error::MessageNotFound(_) => (StatusCode::NOT_FOUND, "MESSAGE_NOT_FOUND"),
            Error::ConnectionClosed => (StatusCode::SERVICE_UNAVAILABLE, "CONNECTION_CLOSED"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let body = Json(ApiErrorBody {
            error: self.0.to_string(),
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}

// ==================== OpenAPI Documentation ====================

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Hopper Worker API",
        version = "0.1.0",
        description = "Hopper - concurrent queue consumer",
        license(name = "MIT OR Apache-2.0")
    ),
    paths(health, worker_status, publish_message, get_queue_stats),
    components(schemas(
        PublishRequest,
        PublishResponse,
        WorkerStatus,
        WorkerState,
        QueueStats,
        ApiErrorBody,
        HealthResponse
    )),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "worker", description = "Worker status"),
        (name = "queues", description = "Queue publishing and statistics")
    )
)]
struct ApiDoc;

// ==================== Handlers ====================

#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Worker and broker are healthy", body = HealthResponse),
        (status = 503, description = "Broker connection unavailable", body = HealthResponse)
    )
)]
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let (status, broker) = match state.broker.health().await {
        Ok(()) => (StatusCode::OK, "ok".to_string()),
        Err(err) => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
    };

    let body = HealthResponse {
        status: if status.is_success() { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        broker,
    };
    (status, Json(body))
}

#[utoipa::path(
    get,
    path = "/api/v1/worker",
    tag = "worker",
    responses(
        (status = 200, description = "Worker status", body = WorkerStatus)
    )
)]
async fn worker_status(State(state): State<AppState>) -> Json<WorkerStatus> {
    let worker = &state.worker;
    Json(WorkerStatus {
        name: worker.name().to_string(),
        state: worker.state(),
        in_flight: worker.in_flight(),
        queues: worker.queue_count(),
        auto_ack: worker.config().auto_ack,
    })
}

#[utoipa::path(
    post,
    path = "/api/v1/queues/{name}/messages",
    tag = "queues",
    params(
        ("name" = String, Path, description = "Queue name (routing key)")
    ),
    request_body = PublishRequest,
    responses(
        (status = 201, description = "Message published", body = PublishResponse),
        (status = 503, description = "Broker connection closed", body = ApiErrorBody)
    )
)]
async fn publish_message(
    State(state): State<AppState>,
    Path(queue_name): Path<String>,
    Json(req): Json<PublishRequest>,
) -> Result<(StatusCode, Json<PublishResponse>), AppError> {
    let mut message = Message::new(queue_name, req.body);
    if let Some(origin) = req.origin {
        message = message.with_origin(origin);
    }
    if let Some(headers) = req.headers {
        message.headers.extend(headers);
    }

    let message_id = state.broker.publish(message).await?;

    Ok((
        StatusCode::CREATED,
        Json(PublishResponse {
            message_id: message_id.to_string(),
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/api/v1/queues/{name}/stats",
    tag = "queues",
    params(
        ("name" = String, Path, description = "Queue name (routing key)")
    ),
    responses(
        (status = 200, description = "Queue statistics", body = QueueStats),
        (status = 404, description = "Queue not found", body = ApiErrorBody)
    )
)]
async fn get_queue_stats(
    State(state): State<AppState>,
    Path(queue_name): Path<String>,
) -> Result<Json<QueueStats>, AppError> {
    let stats = state.broker.stats(&queue_name)?;
    Ok(Json(stats))
}

// ==================== Router ====================

fn create_router(state: AppState) -> Router {
    Router::new()
        // Swagger UI
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // Health
        .route("/health", get(health))
        // Worker
        .route("/api/v1/worker", get(worker_status))
        // Queues
        .route("/api/v1/queues/:name/messages", post(publish_message))
        .route("/api/v1/queues/:name/stats", get(get_queue_stats))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ==================== Main ====================

fn init_tracing(json: bool) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hopper=debug,hopper_core=debug,tower_http=info".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let settings = Settings::from_env()?;

    // Initialize logging
    init_tracing(settings.log_json);

    info!(
        worker = %settings.kind,
        broker = %mask_password_url(&settings.broker_url),
        "Hopper worker starting"
    );

    // Create broker and worker; missing configuration stops here
    let broker =
        Arc::new(MemoryBroker::new(settings.broker_url.clone()).with_worker(settings.kind));
    let worker = Arc::new(
        QueueWorker::new(
            settings.kind,
            broker.clone(),
            &demo::modules(),
            settings.worker.clone(),
        )
        .await?,
    );

    let serving = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.serve().await })
    };

    // Create router
    let app = create_router(AppState {
        broker,
        worker: worker.clone(),
    });

    // Start server
    let listener = tokio::net::TcpListener::bind(&settings.http_addr).await?;

    info!("Hopper HTTP surface listening on {}", settings.http_addr);
    info!("Swagger UI: http://{}/swagger-ui/", settings.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    match worker.shutdown(settings.worker.shutdown_timeout()).await {
        Ok(()) => info!("Hopper worker stopped"),
        Err(err) => error!(error = %err, "Hopper worker stopped uncleanly"),
    }
    serving.await??;

    Ok(())
}
