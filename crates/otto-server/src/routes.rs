// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tracing::info;

use otto_core::{CoreError, Engine, ListSource, RunOptions, SessionSpec, TurnEvent, UpdateSpec};

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
}

/// Build the full API router.
pub fn router(engine: Arc<Engine>) -> Router {
    let state = AppState { engine };
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/chat/health", get(health))
        .route("/api/v1/sessions/", post(create_session).get(list_sessions))
        .route(
            "/api/v1/sessions/:id",
            get(get_session).put(update_session).delete(delete_session),
        )
        .route("/api/v1/chat/completions", post(chat_completions))
        // CORS policy is deployment-specific; the permissive default is
        // meant to sit behind a reverse proxy that narrows it.
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the API on an already-bound listener until the process stops.
pub async fn serve(listener: tokio::net::TcpListener, engine: Arc<Engine>) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "otto API listening");
    axum::serve(listener, router(engine)).await?;
    Ok(())
}

/// Like [`serve`], but stops accepting connections once `shutdown`
/// resolves (in-flight requests are drained first).
pub async fn serve_until(
    listener: tokio::net::TcpListener,
    engine: Arc<Engine>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "otto API listening");
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

// ─── Error mapping ────────────────────────────────────────────────────────────

struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::AlreadyExists(_) | CoreError::Busy(_) => StatusCode::CONFLICT,
            CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CoreError::ServerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Provider(_) => StatusCode::BAD_GATEWAY,
            CoreError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            CoreError::Tool(_) | CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

// ─── Handlers ─────────────────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn create_session(
    State(state): State<AppState>,
    Json(spec): Json<SessionSpec>,
) -> Result<Response, ApiError> {
    let summary = state.engine.manager().create(spec).await?;
    Ok((StatusCode::CREATED, Json(summary)).into_response())
}

#[derive(Deserialize)]
struct ListParams {
    #[serde(default)]
    source: Option<String>,
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Response, ApiError> {
    let source = match params.source.as_deref() {
        None => ListSource::All,
        Some(s) => s.parse()?,
    };
    let sessions = state.engine.manager().list(source).await?;
    Ok(Json(json!({ "sessions": sessions })).into_response())
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let summary = state.engine.manager().get(&id).await?;
    Ok(Json(summary).into_response())
}

async fn update_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<UpdateSpec>,
) -> Result<Response, ApiError> {
    let summary = state.engine.manager().update(&id, update).await?;
    Ok(Json(summary).into_response())
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    state.engine.manager().delete(&id).await?;
    Ok(Json(json!({ "deleted": id })).into_response())
}

#[derive(Deserialize)]
struct ChatParams {
    session_id: String,
    message: String,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    max_iterations: Option<u32>,
}

async fn chat_completions(
    State(state): State<AppState>,
    Json(params): Json<ChatParams>,
) -> Result<Response, ApiError> {
    let rx = state
        .engine
        .run(
            &params.session_id,
            &params.message,
            RunOptions {
                max_iterations: params.max_iterations,
                ..Default::default()
            },
        )
        .await?;

    if params.stream {
        // One SSE record per event, then the terminal [DONE] marker.
        let events = ReceiverStream::new(rx)
            .map(|ev| {
                let data = serde_json::to_string(&ev)
                    .unwrap_or_else(|_| r#"{"type":"error","error":"serialization"}"#.into());
                Ok::<Event, Infallible>(Event::default().data(data))
            })
            .chain(futures::stream::once(async {
                Ok(Event::default().data("[DONE]"))
            }));
        return Ok(Sse::new(events).keep_alive(KeepAlive::default()).into_response());
    }

    // Buffered mode: drain the stream and answer with the terminal event.
    let mut rx = rx;
    let mut last_error: Option<String> = None;
    let mut completion: Option<(String, u32)> = None;
    while let Some(ev) = rx.recv().await {
        match ev {
            TurnEvent::Complete {
                final_response,
                iterations,
            } => {
                completion = Some((final_response, iterations));
                break;
            }
            TurnEvent::Error { error } => {
                last_error = Some(error);
                break;
            }
            _ => {}
        }
    }
    match completion {
        Some((response, iterations)) => Ok(Json(json!({
            "session_id": params.session_id,
            "response": response,
            "iterations": iterations,
        }))
        .into_response()),
        None => {
            let error = last_error.unwrap_or_else(|| "turn ended without a terminal event".into());
            Err(ApiError(classify_turn_error(error)))
        }
    }
}

/// The turn stream flattens failures to text; recover the taxonomy so the
/// status mapping stays honest.  Through this channel the engine only ever
/// reports cancellation, internal faults (whose rendering carries the
/// `internal error:` prefix), or provider failures.
fn classify_turn_error(error: String) -> CoreError {
    if error == "cancelled" {
        CoreError::Cancelled
    } else if let Some(detail) = error.strip_prefix("internal error: ") {
        CoreError::Internal(detail.to_string())
    } else {
        CoreError::Provider(error)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_error_classification_recovers_the_taxonomy() {
        assert!(matches!(
            classify_turn_error("cancelled".into()),
            CoreError::Cancelled
        ));
        assert!(matches!(
            classify_turn_error("internal error: session adapter not initialized".into()),
            CoreError::Internal(detail) if detail == "session adapter not initialized"
        ));
        assert!(matches!(
            classify_turn_error("Anthropic error 529: overloaded".into()),
            CoreError::Provider(_)
        ));
    }
}
