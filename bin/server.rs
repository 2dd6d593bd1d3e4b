// Crime / Weather / Transit Accumulator - Read-only API
// Serves table counts and every analysis result set as JSON

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use env_logger::Env;
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;

use crime_weather::analysis::{
    category_distribution, crimes_by_weather, crimes_near_transit, precipitation_bands, temperature_series,
    transit_hotspots, wind_buckets, DEFAULT_HOTSPOT_LIMIT,
};
use crime_weather::{run_analysis, Config, TableCounts};

const DEFAULT_ADDR: &str = "0.0.0.0:3000";

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

/// Run a read against the shared connection and wrap the outcome
fn with_db<T, F>(state: &AppState, what: &str, read: F) -> Response
where
    T: Serialize,
    F: FnOnce(&Connection) -> anyhow::Result<T>,
{
    let result = match state.db.lock() {
        Ok(conn) => read(&*conn),
        Err(_) => Err(anyhow::anyhow!("database lock poisoned")),
    };

    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::ok(data))).into_response(),
        Err(e) => {
            log::error!("Error getting {}: {:#}", what, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::<T>::err(format!("failed to read {}", what))),
            )
                .into_response()
        }
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/counts - Row counts of every data table
async fn get_counts(State(state): State<AppState>) -> Response {
    with_db(&state, "counts", TableCounts::read)
}

/// GET /api/analysis - Every result set in one document
async fn get_analysis(State(state): State<AppState>) -> Response {
    with_db(&state, "analysis", run_analysis)
}

/// GET /api/analysis/weather
async fn get_crimes_by_weather(State(state): State<AppState>) -> Response {
    with_db(&state, "crimes by weather", crimes_by_weather)
}

/// GET /api/analysis/categories
async fn get_category_distribution(State(state): State<AppState>) -> Response {
    with_db(&state, "category distribution", category_distribution)
}

/// GET /api/analysis/wind
async fn get_wind(State(state): State<AppState>) -> Response {
    with_db(&state, "wind buckets", wind_buckets)
}

/// GET /api/analysis/precipitation
async fn get_precipitation(State(state): State<AppState>) -> Response {
    with_db(&state, "precipitation bands", precipitation_bands)
}

/// GET /api/analysis/temperature
async fn get_temperature(State(state): State<AppState>) -> Response {
    with_db(&state, "temperature series", temperature_series)
}

/// GET /api/analysis/transit
async fn get_transit_modes(State(state): State<AppState>) -> Response {
    with_db(&state, "crimes near transit", crimes_near_transit)
}

/// GET /api/analysis/hotspots
async fn get_hotspots(State(state): State<AppState>) -> Response {
    with_db(&state, "transit hotspots", |conn| transit_hotspots(conn, DEFAULT_HOTSPOT_LIMIT))
}

/// GET /api/analysis/hotspots/:limit
async fn get_hotspots_limited(State(state): State<AppState>, Path(limit): Path<usize>) -> Response {
    with_db(&state, "transit hotspots", |conn| transit_hotspots(conn, limit))
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = Config::from_env().context("Invalid configuration")?;

    if !config.db_path.exists() {
        anyhow::bail!(
            "Database not found at {} (run crime-weather first)",
            config.db_path.display()
        );
    }

    let conn = Connection::open_with_flags(&config.db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("Failed to open {}", config.db_path.display()))?;
    log::info!("✓ Database opened read-only: {}", config.db_path.display());

    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
    };

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/counts", get(get_counts))
        .route("/analysis", get(get_analysis))
        .route("/analysis/weather", get(get_crimes_by_weather))
        .route("/analysis/categories", get(get_category_distribution))
        .route("/analysis/wind", get(get_wind))
        .route("/analysis/precipitation", get(get_precipitation))
        .route("/analysis/temperature", get(get_temperature))
        .route("/analysis/transit", get(get_transit_modes))
        .route("/analysis/hotspots", get(get_hotspots))
        .route("/analysis/hotspots/:limit", get(get_hotspots_limited))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    let addr = std::env::var("SERVER_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    log::info!("🚀 Server running on http://{}", addr);
    log::info!("   API: http://{}/api/analysis", addr);

    axum::serve(listener, app).await.context("Server stopped")?;
    Ok(())
}
