// Aggregation engine: joins live trip-update entities against the static
// schedule index to answer "what is arriving at this stop, and when?".
//
// Stateless per request. Data-availability problems never fail a request;
// they degrade to warnings on the response. Only an unknown stop id is an
// error.

use gtfs_rt::FeedMessage;
use serde::Serialize;

use crate::errors::{BoardError, Result};
use crate::gtfs_static::{StaticIndex, StaticTables, Stop};
use crate::realtime::{FeedKind, FeedPoller, FeedSnapshot, FeedStatus};

/// Trip-update snapshots older than this get a staleness warning.
pub const STALE_AFTER_SECS: i64 = 120;

const EASTBOUND_DESTINATIONS: [&str; 4] = ["antioch", "berryessa", "dublin", "pittsburg"];
const WESTBOUND_DESTINATIONS: [&str; 4] = ["millbrae", "sfo", "daly city", "richmond"];

// ============================================================================
// Response Shapes
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ArrivalPrediction {
    pub trip_id: String,
    pub route_id: String,
    pub route_short_name: String,
    pub route_long_name: String,
    pub route_color: String,
    pub route_text_color: String,
    pub headsign: String,
    pub direction: String,
    /// Epoch seconds; estimated arrival minus the reported delay.
    pub scheduled_arrival: i64,
    /// Epoch seconds as reported by the feed.
    pub estimated_arrival: i64,
    pub minutes_until_arrival: i64,
    pub delay_seconds: i32,
    pub vehicle_label: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivePeriod {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopAlert {
    pub header: String,
    pub description: String,
    pub url: Option<String>,
    pub active_periods: Vec<ActivePeriod>,
}

#[derive(Debug, Serialize)]
pub struct StopInfo {
    pub stop: Stop,
    /// Capture time of the trip-update snapshot, when fresh enough to trust.
    pub last_updated: Option<i64>,
    pub upcoming_trips: Vec<ArrivalPrediction>,
    pub alerts: Vec<StopAlert>,
    pub warnings: Vec<String>,
}

/// One line of the simplified "next N" departure board.
#[derive(Debug, Serialize)]
pub struct BoardEntry {
    pub destination: String,
    pub route_color: String,
    pub minutes_until_arrival: i64,
    pub status: String,
}

// ============================================================================
// Direction Heuristic
// ============================================================================

/// Agency-specific direction matcher, kept exactly as deployed: "eastbound"
/// and "westbound" are recognized (case-insensitive) via route short name
/// letters and well-known destination names; any other value matches
/// everything.
pub fn matches_direction(direction: &str, route_short_name: &str, headsign: &str) -> bool {
    let headsign = headsign.to_lowercase();
    let short_name = route_short_name.to_lowercase();

    match direction.to_lowercase().as_str() {
        "eastbound" => {
            short_name.contains('n')
                || EASTBOUND_DESTINATIONS.iter().any(|dest| headsign.contains(dest))
        }
        "westbound" => {
            short_name.contains('s')
                || WESTBOUND_DESTINATIONS.iter().any(|dest| headsign.contains(dest))
        }
        _ => true,
    }
}

fn direction_label(direction_id: Option<u8>) -> &'static str {
    match direction_id {
        Some(0) => "Northbound",
        Some(1) => "Southbound",
        _ => "Unknown",
    }
}

// ============================================================================
// Projection
// ============================================================================

/// Projects a trip-updates feed onto the static schedule for one stop.
/// Entities whose trip or route id does not resolve are skipped - the live
/// and static datasets can be momentarily out of sync. Only strictly-future
/// arrivals are kept; the result is sorted by estimated arrival.
pub fn project_arrivals(
    tables: &StaticTables,
    feed: &FeedMessage,
    stop_id: &str,
    now: i64,
) -> Vec<ArrivalPrediction> {
    let mut predictions = Vec::new();

    for entity in &feed.entity {
        let update = match &entity.trip_update {
            Some(update) => update,
            None => continue,
        };
        let trip = match update.trip.trip_id.as_deref().and_then(|id| tables.trips.get(id)) {
            Some(trip) => trip,
            None => continue,
        };
        let route = match tables.routes.get(&trip.route_id) {
            Some(route) => route,
            None => continue,
        };

        for stu in &update.stop_time_update {
            if stu.stop_id.as_deref() != Some(stop_id) {
                continue;
            }

            let estimated = stu.arrival.as_ref().and_then(|a| a.time)
                .or_else(|| stu.departure.as_ref().and_then(|d| d.time));
            let estimated = match estimated {
                Some(t) if t > now => t,
                _ => continue,
            };

            let delay = stu.arrival.as_ref().and_then(|a| a.delay)
                .or_else(|| stu.departure.as_ref().and_then(|d| d.delay))
                .unwrap_or(0);

            predictions.push(ArrivalPrediction {
                trip_id: trip.trip_id.clone(),
                route_id: route.route_id.clone(),
                route_short_name: route.short_name.clone(),
                route_long_name: route.long_name.clone(),
                route_color: route.color.clone(),
                route_text_color: route.text_color.clone(),
                headsign: trip.headsign.clone(),
                direction: direction_label(trip.direction_id).to_string(),
                scheduled_arrival: estimated - delay as i64,
                estimated_arrival: estimated,
                minutes_until_arrival: ((estimated - now) as f64 / 60.0).round() as i64,
                delay_seconds: delay,
                vehicle_label: update.vehicle.as_ref().and_then(|v| v.label.clone()),
            });
        }
    }

    predictions.sort_by_key(|p| p.estimated_arrival);
    predictions
}

/// Filters an alerts feed down to the alerts whose informed entities
/// reference the given stop, flattened into the public shape.
pub fn collect_alerts(feed: &FeedMessage, stop_id: &str) -> Vec<StopAlert> {
    feed.entity
        .iter()
        .filter_map(|entity| {
            let alert = entity.alert.as_ref()?;

            if !alert.informed_entity.iter().any(|ie| ie.stop_id.as_deref() == Some(stop_id)) {
                return None;
            }

            let header = alert.header_text.as_ref()
                .and_then(|h| h.translation.first().map(|t| t.text.clone()))
                .unwrap_or_else(|| "No title".to_string());

            let description = alert.description_text.as_ref()
                .and_then(|d| d.translation.first().map(|t| t.text.clone()))
                .unwrap_or_else(|| "No description available".to_string());

            let url = alert.url.as_ref()
                .and_then(|u| u.translation.first().map(|t| t.text.clone()));

            let active_periods = alert.active_period.iter()
                .map(|period| ActivePeriod {
                    start: period.start.map(|s| s as i64),
                    end: period.end.map(|e| e as i64),
                })
                .collect();

            Some(StopAlert { header, description, url, active_periods })
        })
        .collect()
}

// ============================================================================
// Stop Info
// ============================================================================

/// Builds the full per-stop response from already-captured inputs. Pure:
/// `now` is the evaluation instant, and the snapshots/statuses are whatever
/// the poller held when the request arrived.
pub fn build_stop_info(
    tables: &StaticTables,
    trip_snapshot: Option<&FeedSnapshot>,
    trip_status: &FeedStatus,
    alert_snapshot: Option<&FeedSnapshot>,
    alert_status: &FeedStatus,
    stop_id: &str,
    direction: Option<&str>,
    now: i64,
) -> Result<StopInfo> {
    let stop = tables.stops.get(stop_id)
        .cloned()
        .ok_or_else(|| BoardError::NotFound(format!("Stop '{}' not found", stop_id)))?;

    let mut warnings = Vec::new();
    let mut last_updated = None;

    match trip_snapshot {
        None => match &trip_status.error {
            Some(err) => warnings.push(format!("Real-time trip data unavailable: {}", err)),
            None => warnings.push("Real-time trip data is still initializing".to_string()),
        },
        Some(snapshot) => {
            let age = now - snapshot.fetched_at;
            if age > STALE_AFTER_SECS {
                warnings.push(format!("Real-time data is {}s old and may be stale", age));
            } else {
                last_updated = Some(snapshot.fetched_at);
            }
        }
    }

    let mut upcoming_trips = trip_snapshot
        .map(|snapshot| project_arrivals(tables, &snapshot.feed, stop_id, now))
        .unwrap_or_default();

    if let Some(direction) = direction {
        upcoming_trips.retain(|p| matches_direction(direction, &p.route_short_name, &p.headsign));
    }

    let alerts = match alert_snapshot {
        Some(snapshot) => collect_alerts(&snapshot.feed, stop_id),
        None => {
            if alert_status.error.is_some() {
                warnings.push("Service alerts are currently unavailable".to_string());
            }
            Vec::new()
        }
    };

    Ok(StopInfo { stop, last_updated, upcoming_trips, alerts, warnings })
}

/// Request-facing entry point: checks the stop before touching any
/// real-time state, then captures the poller's current snapshots and
/// evaluates against the wall clock.
pub async fn get_stop_info(
    index: &StaticIndex,
    poller: &FeedPoller,
    stop_id: &str,
    direction: Option<&str>,
) -> Result<StopInfo> {
    if index.lookup_stop(stop_id).await.is_none() {
        return Err(BoardError::NotFound(format!("Stop '{}' not found", stop_id)));
    }

    let tables = index.tables().await;
    let trip_snapshot = poller.snapshot(FeedKind::TripUpdates).await;
    let trip_status = poller.status(FeedKind::TripUpdates).await;
    let alert_snapshot = poller.snapshot(FeedKind::Alerts).await;
    let alert_status = poller.status(FeedKind::Alerts).await;

    build_stop_info(
        &tables,
        trip_snapshot.as_deref(),
        &trip_status,
        alert_snapshot.as_deref(),
        &alert_status,
        stop_id,
        direction,
        chrono::Utc::now().timestamp(),
    )
}

/// The simplified "next N" projection: truncates the sorted predictions,
/// keeps a terse destination (the final "/"-delimited headsign segment) and
/// labels each entry arriving/scheduled.
pub fn departure_board(info: &StopInfo, limit: usize) -> Vec<BoardEntry> {
    info.upcoming_trips
        .iter()
        .take(limit)
        .map(|p| BoardEntry {
            destination: terse_destination(&p.headsign),
            route_color: p.route_color.clone(),
            minutes_until_arrival: p.minutes_until_arrival,
            status: if p.minutes_until_arrival <= 1 { "arriving" } else { "scheduled" }.to_string(),
        })
        .collect()
}

fn terse_destination(headsign: &str) -> String {
    headsign.rsplit('/').next().unwrap_or(headsign).trim().to_string()
}
