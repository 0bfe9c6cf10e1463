//! HTTP API gateway for Reflector.
//!
//! Exposes the reflection agent over two JSON endpoints:
//!
//! - `POST /api/query`: run the loop for `{"query": "..."}`
//! - `GET /api/health`: liveness plus the effective loop settings
//!
//! Built on Axum. Every query runs in its own task with its own log.

use axum::extract::DefaultBodyLimit;
use axum::{
    Router,
    extract::State,
    http::{HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use reflector_agent::{ReflectionAgent, RunOutcome};
use reflector_config::AppConfig;
use reflector_core::message::Role;
use reflector_telemetry::RunTracer;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info, warn};

/// Shared application state for the gateway.
pub struct GatewayState {
    pub config: AppConfig,
    pub agent: Arc<ReflectionAgent>,
}

type SharedState = Arc<GatewayState>;

/// Build the agent described by `config`, with run tracing attached when
/// `[tracing]` is enabled.
pub fn build_agent(config: &AppConfig) -> Result<ReflectionAgent, Box<dyn std::error::Error>> {
    let handles = reflector_providers::build_from_config(config);
    let mut agent = ReflectionAgent::from_config(config, &handles);
    if let Some(tracer) = RunTracer::from_config(&config.tracing)? {
        info!(project = %config.tracing.project, "Run tracing enabled");
        agent = agent.with_observer(Arc::new(tracer));
    }
    Ok(agent)
}

/// Build the Axum router with all gateway routes.
pub fn build_router(state: SharedState) -> Router {
    let cors = cors_layer(&state.config.gateway.allowed_origins);
    Router::new()
        .route("/api/query", post(query_handler))
        .route("/api/health", get(health_handler))
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB body limit
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// CORS for the configured origins. `"*"` allows any origin.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

/// Start the gateway HTTP server.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    if !config.has_api_key() {
        warn!("No API key configured; model calls will fail and fall back");
    }

    let agent = Arc::new(build_agent(&config)?);
    let app = build_router(Arc::new(GatewayState { config, agent }));

    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// --- Handlers ---

#[derive(Deserialize)]
struct QueryRequest {
    #[serde(default)]
    query: String,
}

#[derive(Serialize)]
struct MessageView {
    role: Role,
    content: String,
}

#[derive(Serialize)]
struct QueryResponse {
    response: String,
    iterations: u32,
    messages: Vec<MessageView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<RunOutcome> for QueryResponse {
    fn from(outcome: RunOutcome) -> Self {
        Self {
            response: outcome.response,
            iterations: outcome.iterations,
            messages: outcome
                .messages
                .into_iter()
                .map(|m| MessageView {
                    role: m.role,
                    content: m.content,
                })
                .collect(),
            error: outcome.error,
        }
    }
}

#[derive(Serialize)]
struct ErrorDetail {
    detail: String,
}

fn error_response(status: StatusCode, detail: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorDetail {
            detail: detail.into(),
        }),
    )
        .into_response()
}

async fn query_handler(
    State(state): State<SharedState>,
    Json(payload): Json<QueryRequest>,
) -> Response {
    let query = payload.query.trim().to_string();
    if query.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "No query provided");
    }

    info!(query_len = query.len(), "Query received");

    let agent = state.agent.clone();
    match tokio::spawn(async move { agent.run(&query).await }).await {
        Ok(outcome) => Json(QueryResponse::from(outcome)).into_response(),
        Err(e) => {
            error!(error = %e, "Query task failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error processing query: {e}"),
            )
        }
    }
}

#[derive(Serialize)]
struct HealthConfig {
    use_tracing: bool,
    max_iterations: u32,
    verbose: bool,
    main_model: String,
    reflection_model: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    config: HealthConfig,
}

async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "Server is running",
        config: HealthConfig {
            use_tracing: state.config.tracing.enabled,
            max_iterations: state.agent.max_iterations(),
            verbose: state.config.reflection.verbose,
            main_model: state.agent.primary_model().to_string(),
            reflection_model: state.agent.critic_model().to_string(),
        },
    })
}
