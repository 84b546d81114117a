//! HTTP surface: liveness, diagnostics, and the dev-convenience
//! `/converse` route.
//!
//! Permissive CORS for GET/POST/OPTIONS; bare `OPTIONS` requests are
//! answered 204 and unknown paths 404 by the fallback. The gRPC surface
//! is authoritative -- `/converse` here exists for local poking and can
//! be disabled in configuration.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use uuid::Uuid;

use super::{run_converse, ConverseUpdate, ServiceState};

/// Build the router over the shared state.
pub fn router(state: Arc<ServiceState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let mut router = Router::new()
        .route("/", get(ok_handler))
        .route("/ready", get(ok_handler))
        .route("/health", get(health_handler))
        .route("/attestation", get(attestation_handler));

    if state.config.server.http_converse_enabled {
        router = router.route("/converse", post(converse_handler));
    }

    router
        .fallback(fallback_handler)
        .layer(cors)
        .with_state(state)
}

/// Serve the HTTP surface until the shutdown signal flips.
pub async fn serve(
    state: Arc<ServiceState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let port = state.config.server.http_port;
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http surface listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

async fn ok_handler() -> &'static str {
    "OK"
}

async fn health_handler(State(state): State<Arc<ServiceState>>) -> Json<serde_json::Value> {
    let metrics = state.metrics.snapshot();
    Json(json!({
        "status": "ok",
        "service": "brain",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "rpc_port": state.config.server.grpc_port,
        "llm": {
            "enabled": state.llm.enabled(),
            "model": state.llm.model(),
            "base_url": state.llm.base_url(),
        },
        "metrics": metrics,
    }))
}

async fn attestation_handler(State(state): State<Arc<ServiceState>>) -> Json<serde_json::Value> {
    let chain = state.verifier.get_for_chain().await;
    let (mr_enclave, mr_signer) = chain
        .as_ref()
        .map(|c| (c.mr_enclave.clone(), c.mr_signer.clone()))
        .unwrap_or_default();
    Json(json!({
        "service": "brain",
        "timestamp": chrono::Utc::now(),
        "mr_enclave": mr_enclave,
        "mr_signer": mr_signer,
        "tee_type": "tdx",
    }))
}

/// Dev-convenience converse body.
#[derive(Debug, Deserialize)]
struct ConverseBody {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    message: String,
}

async fn converse_handler(
    State(state): State<Arc<ServiceState>>,
    Json(body): Json<ConverseBody>,
) -> Response {
    let session_id = body
        .session_id
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let user_id = body
        .user_id
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "anonymous".to_owned());

    let (tx, mut rx) = mpsc::channel::<ConverseUpdate>(64);
    let pipeline = run_converse(
        Arc::clone(&state),
        session_id,
        user_id,
        body.message,
        tx,
    );

    // Drive the pipeline to completion while draining its updates; the
    // dev route replies once with the collected outcome.
    let (result, updates) = tokio::join!(pipeline, async move {
        let mut updates = Vec::new();
        while let Some(update) = rx.recv().await {
            updates.push(update);
        }
        updates
    });

    if result.is_err() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "error": "invalid_input",
                "message": "message must not be empty",
            })),
        )
            .into_response();
    }

    let mut response_text = String::new();
    let mut intent = None;
    let mut confidence = 0.0;
    let mut parse_time_ms = 0_u64;
    let mut llm_latency_ms = None;
    let mut clarification_question = None;
    let mut clarification_options = None;
    let mut needs_clarification = false;

    for update in updates {
        match update {
            ConverseUpdate::Clarification(clarification) => {
                needs_clarification = true;
                response_text = clarification.question.clone();
                clarification_question = Some(clarification.question);
                clarification_options = Some(clarification.options);
            }
            ConverseUpdate::Reply(reply) => {
                response_text = reply.text;
                confidence = reply.confidence;
                parse_time_ms = reply.parse_time_ms;
                llm_latency_ms = reply.llm_latency_ms;
                intent = Some(reply.intent);
            }
            ConverseUpdate::Event(_) | ConverseUpdate::Done { .. } => {}
        }
    }

    Json(json!({
        "success": true,
        "response_text": response_text,
        "intent": intent,
        "needs_clarification": needs_clarification,
        "clarification_question": clarification_question,
        "clarification_options": clarification_options,
        "confidence": confidence,
        "parse_time_ms": parse_time_ms,
        "llm_latency_ms": llm_latency_ms,
        "llm_enabled": state.llm.enabled(),
    }))
    .into_response()
}

/// Bare `OPTIONS` gets 204; anything else unknown gets the 404 body.
async fn fallback_handler(method: Method) -> Response {
    if method == Method::OPTIONS {
        return StatusCode::NO_CONTENT.into_response();
    }
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "Not found" })),
    )
        .into_response()
}
