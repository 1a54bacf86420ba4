use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::{routing::{get, post}, Json, Router};
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::{convert::Infallible, net::SocketAddr, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::TurnError;
use crate::orchestrator::{FirstTurnRequest, FollowUpRequest};
use crate::service::{EventStream, TurnService};
use crate::session::Session;

#[derive(Clone)]
pub struct AppState {
    pub turns: TurnService,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

struct ApiError(TurnError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TurnError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            TurnError::SessionExpired(_) => StatusCode::GONE,
            TurnError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        let body = ErrorBody { error: self.0.kind(), message: self.0.to_string() };
        (status, Json(body)).into_response()
    }
}

/// Relay turn events as SSE. Dropping the response (client gone) cancels the turn.
fn relay(events: EventStream, cancel: CancellationToken) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let guard = cancel.drop_guard();
    let stream = async_stream::stream! {
        let _guard = guard;
        let mut events = events;
        while let Some(event) = events.next().await {
            match SseEvent::default().event(event.event_type.as_str()).id(event.id.clone()).json_data(&event) {
                Ok(sse) => yield Ok(sse),
                Err(e) => warn!(error = %e, event_id = %event.id, "could not encode event"),
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keep-alive"))
}

async fn stream_recommendations(
    State(state): State<AppState>,
    Json(body): Json<FirstTurnRequest>,
) -> impl IntoResponse {
    let cancel = CancellationToken::new();
    let (session_id, events) = state.turns.run_first_turn(body, cancel.clone());
    info!(%session_id, "first turn started");
    ([("x-session-id", session_id.to_string())], relay(events, cancel))
}

async fn post_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<FollowUpRequest>,
) -> impl IntoResponse {
    let cancel = CancellationToken::new();
    let events = state.turns.continue_turn(id, body, cancel.clone());
    relay(events, cancel)
}

async fn get_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Session>, ApiError> {
    state.turns.session(id).await.map(Json).map_err(ApiError)
}

async fn end_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Session>, ApiError> {
    state.turns.end_session(id).await.map(Json).map_err(ApiError)
}

async fn healthz() -> &'static str {
    "ok"
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/recommendations/stream", post(stream_recommendations))
        .route("/v1/sessions/:id", get(get_session))
        .route("/v1/sessions/:id/messages", post(post_message))
        .route("/v1/sessions/:id/end", post(end_session))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}
