// BART live arrivals board API server
// Polls the BART GTFS-realtime feeds in the background and joins them with
// the static GTFS schedule to serve per-stop arrival predictions.
//
// BART developer resources:
// - GTFS-RT Trip Updates: https://api.bart.gov/gtfsrt/tripupdate.aspx
// - GTFS-RT Service Alerts: https://api.bart.gov/gtfsrt/alerts.aspx
// - GTFS Static Schedule: https://www.bart.gov/dev/schedules/google_transit.zip

use actix_cors::Cors;
use actix_web::{App, HttpResponse, HttpServer, middleware, web};
use chrono::{TimeZone, Utc};
use chrono_tz::US::Pacific;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

mod arrivals;
mod config;
mod errors;
mod gtfs_static;
mod realtime;
mod updater;

use arrivals::StopInfo;
use config::Config;
use errors::BoardError;
use gtfs_static::StaticIndex;
use realtime::{FeedKind, FeedPoller};
use updater::DatasetUpdater;

const DEFAULT_BOARD_LIMIT: usize = 3;

#[derive(Clone)]
struct AppState {
    config: Config,
    index: Arc<StaticIndex>,
    poller: Arc<FeedPoller>,
    updater: Arc<DatasetUpdater>,
}

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
    timestamp: i64,
    sources: Vec<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now().timestamp(),
            sources: vec!["BART".to_string()],
        }
    }

    fn error(message: String) -> Self {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message),
            timestamp: Utc::now().timestamp(),
            sources: vec![],
        }
    }
}

fn format_timestamp_full(timestamp: i64) -> String {
    match Utc.timestamp_opt(timestamp, 0).single() {
        Some(dt) => {
            let pacific_time = dt.with_timezone(&Pacific);
            pacific_time.format("%Y-%m-%d %H:%M:%S").to_string()
        }
        None => format!("Invalid timestamp: {}", timestamp),
    }
}

// ============================================================================
// API Endpoints
// ============================================================================

#[derive(Deserialize)]
struct StopQuery {
    direction: Option<String>,
}

#[derive(Deserialize)]
struct BoardQuery {
    direction: Option<String>,
    limit: Option<usize>,
}

async fn get_stop(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<StopQuery>,
) -> HttpResponse {
    let stop_id = path.into_inner();
    let direction = query.direction.clone()
        .or_else(|| state.config.default_direction.clone());

    match arrivals::get_stop_info(&state.index, &state.poller, &stop_id, direction.as_deref()).await {
        Ok(info) => {
            println!("📍 Stop info: {} - {} arrivals, {} alerts, {} warnings",
                     info.stop.stop_name,
                     info.upcoming_trips.len(),
                     info.alerts.len(),
                     info.warnings.len());
            HttpResponse::Ok().json(ApiResponse::success(info))
        }
        Err(BoardError::NotFound(msg)) => {
            println!("⚠️  Stop not found: {}", stop_id);
            HttpResponse::NotFound().json(ApiResponse::<StopInfo>::error(msg))
        }
        Err(e) => {
            eprintln!("❌ Failed to build stop info: {}", e);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<StopInfo>::error("Failed to build stop info".to_string()))
        }
    }
}

async fn get_board_for(state: &AppState, stop_id: &str, direction: Option<String>, limit: usize) -> HttpResponse {
    let direction = direction.or_else(|| state.config.default_direction.clone());

    match arrivals::get_stop_info(&state.index, &state.poller, stop_id, direction.as_deref()).await {
        Ok(info) => {
            let board = arrivals::departure_board(&info, limit);
            println!("🚉 Board: {} - next {} of {} arrivals",
                     info.stop.stop_name, board.len(), info.upcoming_trips.len());
            HttpResponse::Ok().json(ApiResponse::success(board))
        }
        Err(BoardError::NotFound(msg)) => {
            println!("⚠️  Stop not found: {}", stop_id);
            HttpResponse::NotFound().json(ApiResponse::<StopInfo>::error(msg))
        }
        Err(e) => {
            eprintln!("❌ Failed to build board: {}", e);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<StopInfo>::error("Failed to build board".to_string()))
        }
    }
}

async fn get_stop_board(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<BoardQuery>,
) -> HttpResponse {
    let stop_id = path.into_inner();
    let limit = query.limit.unwrap_or(DEFAULT_BOARD_LIMIT);
    get_board_for(&state, &stop_id, query.direction.clone(), limit).await
}

async fn get_default_board(
    state: web::Data<AppState>,
    query: web::Query<BoardQuery>,
) -> HttpResponse {
    let stop_id = state.config.default_stop_id.clone();
    let limit = query.limit.unwrap_or(DEFAULT_BOARD_LIMIT);
    get_board_for(&state, &stop_id, query.direction.clone(), limit).await
}

async fn get_stops(state: web::Data<AppState>) -> HttpResponse {
    let stops = state.index.all_stops().await;
    println!("📍 Stops requested: {} total", stops.len());
    HttpResponse::Ok().json(ApiResponse::success(stops))
}

async fn get_status(state: web::Data<AppState>) -> HttpResponse {
    let tables = state.index.tables().await;
    let trip_updates = state.poller.status(FeedKind::TripUpdates).await;
    let alerts = state.poller.status(FeedKind::Alerts).await;

    let status = serde_json::json!({
        "static": {
            "stops": tables.stops.len(),
            "routes": tables.routes.len(),
            "trips": tables.trips.len(),
            "trips_with_stop_times": tables.stop_times.len(),
            "data_dir": state.config.static_data_dir,
        },
        "last_trip_update": trip_updates.last_update.map(format_timestamp_full),
        "trip_updates": trip_updates,
        "alerts": alerts,
    });

    HttpResponse::Ok().json(ApiResponse::success(status))
}

async fn force_refresh(state: web::Data<AppState>) -> HttpResponse {
    println!("🔄 Manual dataset refresh requested...");

    match state.updater.check_for_updates().await {
        Ok(()) => {
            println!("✓ Manual dataset refresh completed successfully");
            HttpResponse::Ok().json(ApiResponse::success("Schedule dataset refreshed".to_string()))
        }
        Err(e) => {
            eprintln!("⚠️  Manual dataset refresh failed: {}", e);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<String>::error(format!("Refresh failed: {}", e)))
        }
    }
}

async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "BART Live Arrivals Board",
        "version": "0.1.0",
        "sources": ["BART"],
        "timestamp": Utc::now().timestamp(),
    }))
}

// ============================================================================
// Server Setup
// ============================================================================

async fn run_server(config: Config, index: Arc<StaticIndex>) -> std::io::Result<()> {
    let poller = Arc::new(FeedPoller::new(
        config.trip_updates_url.clone(),
        config.alerts_url.clone(),
        Duration::from_secs(config.refresh_interval_secs),
    ));
    poller.start();

    let updater = Arc::new(DatasetUpdater::new(
        config.schedule_url.clone(),
        config.static_data_dir.clone(),
        index.clone(),
    ));
    updater.start();

    let bind_addr = config.bind_addr.clone();
    let app_state = AppState { config, index, poller, updater };

    println!("\n🌐 Server running on: http://{}", bind_addr);
    println!("📍 Available Routes:");
    println!("┌─────────────────────────────────────────────────────────────┐");
    println!("│   GET  /api/stop/:id               - Arrivals for a stop   │");
    println!("│   GET  /api/stop/:id/board         - Next N departures     │");
    println!("│   GET  /api/board                  - Default stop board    │");
    println!("│   GET  /api/stops                  - All stops             │");
    println!("│   GET  /api/status                 - Feed & index status   │");
    println!("│   POST /api/refresh                - Refresh schedule data │");
    println!("│   GET  /health                     - Health check          │");
    println!("└─────────────────────────────────────────────────────────────┘\n");

    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .route("/health", web::get().to(health_check))
            .service(
                web::scope("/api")
                    .route("/stop/{id}", web::get().to(get_stop))
                    .route("/stop/{id}/board", web::get().to(get_stop_board))
                    .route("/board", web::get().to(get_default_board))
                    .route("/stops", web::get().to(get_stops))
                    .route("/status", web::get().to(get_status))
                    .route("/refresh", web::post().to(force_refresh))
            )
    })
        .bind(&bind_addr)?
        .run()
        .await
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> std::io::Result<()> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║                                                            ║");
    println!("║    🚆 BART Live Arrivals Board                             ║");
    println!("║                                                            ║");
    println!("║    Version: 0.1.0                                          ║");
    println!("║                                                            ║");
    println!("╚════════════════════════════════════════════════════════════╝\n");

    let config = Config::from_env();
    println!("📡 Trip updates feed: {}", config.trip_updates_url);
    println!("⚠️  Alerts feed: {}", config.alerts_url);
    println!("📂 Static schedule: {:?}", config.static_data_dir);
    println!("🔄 Refresh interval: {}s (alerts {}s)\n",
             config.refresh_interval_secs, config.refresh_interval_secs * 2);

    let index = match StaticIndex::load(&config.static_data_dir) {
        Ok(index) => Arc::new(index),
        Err(e) => {
            eprintln!("\n❌ Failed to load static schedule: {}", e);
            eprintln!("Server cannot start without the schedule tables.");
            eprintln!("\n💡 Troubleshooting:");
            eprintln!("   1. Check that {:?} exists", config.static_data_dir);
            eprintln!("   2. It must contain stops.txt, routes.txt, trips.txt and stop_times.txt");
            eprintln!("   3. Download the schedule archive from {}", config.schedule_url);
            eprintln!("      and unzip it there, or set BART_GTFS_DATA_DIR\n");
            std::process::exit(1);
        }
    };

    println!("🕐 Started at {}", format_timestamp_full(Utc::now().timestamp()));

    actix_web::rt::System::new().block_on(run_server(config, index))
}
