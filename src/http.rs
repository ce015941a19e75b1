//! ==============================================================================
//! http.rs - the node's HTTP API
//! ==============================================================================
//!
//! routes:
//!     GET /         -> 200 text/plain "API is online. Use /weather"
//!     GET /weather  -> 200 {"temp":..,"humidity":..,"pressure":..}
//!                      500 text/plain "Failed to read from sensor" when any
//!                      field is invalid, including before the first sample
//!
//! handlers only read `SharedReadingState`; they never touch a sensor.
//!
//! ==============================================================================

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

use crate::domain::Reading;
use crate::state::SharedReadingState;

pub const STATUS_BODY: &str = "API is online. Use /weather";
pub const SENSOR_FAILURE_BODY: &str = "Failed to read from sensor";

/// JSON body of `GET /weather`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WeatherPayload {
    pub temp: f64,
    pub humidity: f64,
    pub pressure: f64,
}

impl WeatherPayload {
    /// `None` unless every field of the reading is valid.
    pub fn from_reading(reading: &Reading) -> Option<Self> {
        let (temp, humidity, pressure) = reading.complete()?;
        Some(Self {
            temp: round2(temp),
            humidity: round2(humidity),
            pressure: round2(pressure),
        })
    }
}

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Routes with state attached, without transport middleware.
pub fn router(state: SharedReadingState) -> Router {
    Router::new()
        .route("/", get(status_handler))
        .route("/weather", get(weather_handler))
        .with_state(state)
}

/// Serve the API on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: SharedReadingState,
    request_timeout: Duration,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(state)
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http());

    info!("HTTP server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("HTTP server stopped");
    Ok(())
}

async fn status_handler() -> &'static str {
    STATUS_BODY
}

async fn weather_handler(State(state): State<SharedReadingState>) -> impl IntoResponse {
    match WeatherPayload::from_reading(&state.current()) {
        Some(payload) => Json(payload).into_response(),
        None => (StatusCode::INTERNAL_SERVER_ERROR, SENSOR_FAILURE_BODY).into_response(),
    }
}
