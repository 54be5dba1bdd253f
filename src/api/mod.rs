//! HTTP API handlers

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::get,
    Json, Router,
};
use futures::stream::Stream;
use serde::Serialize;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::adapters::lms_discovery::{self, DiscoveredServer};
use crate::bridge::{Bridge, BridgeStatus};
use crate::bus::SharedBus;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<Bridge>,
    pub bus: SharedBus,
    pub discovery_timeout: Duration,
}

impl AppState {
    pub fn new(bridge: Arc<Bridge>, discovery_timeout: Duration) -> Self {
        let bus = bridge.bus().clone();
        Self {
            bridge,
            bus,
            discovery_timeout,
        }
    }
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// GET /status - bridge, remote and local state
pub async fn status_handler(State(state): State<AppState>) -> Json<BridgeStatus> {
    Json(state.bridge.status().await)
}

#[derive(Serialize)]
pub struct DiscoverResponse {
    pub servers: Vec<DiscoveredServer>,
}

/// GET /discover - run one discovery scan
pub async fn discover_handler(State(state): State<AppState>) -> impl IntoResponse {
    match lms_discovery::scan(state.discovery_timeout).await {
        Ok(servers) => (StatusCode::OK, Json(DiscoverResponse { servers })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: format!("{:#}", e),
            }),
        )
            .into_response(),
    }
}

/// GET /events - Server-Sent Events stream of bus events
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.bus.subscribe();

    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => match serde_json::to_string(&event) {
            Ok(json) => Some(Ok(Event::default().event(event.event_type()).data(json))),
            Err(_) => None,
        },
        // Skip lagged messages
        Err(_) => None,
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/discover", get(discover_handler))
        .route("/events", get(events_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
