// Static GTFS schedule index: stops, routes, trips and per-trip stop-time
// sequences, parsed from the tabular files in the data directory.
//
// The four tables are rebuilt wholesale and swapped in as one Arc, so a
// request that grabbed the tables before a reload keeps reading a consistent
// dataset until it finishes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::errors::{BoardError, Result};

pub const DEFAULT_ROUTE_COLOR: &str = "808080";
pub const DEFAULT_ROUTE_TEXT_COLOR: &str = "FFFFFF";

// ============================================================================
// Data Structures
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stop {
    pub stop_id: String,
    pub stop_name: String,
    pub stop_code: String,
    pub platform_code: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub route_id: String,
    pub short_name: String,
    pub long_name: String,
    pub color: String,
    pub text_color: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trip {
    pub trip_id: String,
    pub route_id: String,
    pub headsign: String,
    pub direction_id: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopTime {
    pub trip_id: String,
    pub stop_id: String,
    pub arrival_time: String,
    pub departure_time: String,
    pub stop_sequence: u32,
}

#[derive(Debug, Default)]
pub struct StaticTables {
    pub stops: HashMap<String, Stop>,
    pub routes: HashMap<String, Route>,
    pub trips: HashMap<String, Trip>,
    /// key: trip_id, ordered by stop_sequence
    pub stop_times: HashMap<String, Vec<StopTime>>,
}

// ============================================================================
// Loading
// ============================================================================

fn open_table(dir: &Path, name: &str) -> Result<csv::Reader<std::fs::File>> {
    let path = dir.join(name);
    csv::Reader::from_path(&path)
        .map_err(|e| BoardError::FileError(format!("{} not found or unreadable: {}", name, e)))
}

fn parse_stops(dir: &Path) -> Result<HashMap<String, Stop>> {
    let mut rdr = open_table(dir, "stops.txt")?;
    let mut stops = HashMap::new();

    for result in rdr.records() {
        if let Ok(record) = result {
            // stop_id,stop_code,stop_name,stop_desc,stop_lat,stop_lon,zone_id,stop_url,location_type,parent_station,platform_code
            if let (Some(stop_id), Some(stop_code), Some(stop_name), Some(lat_str), Some(lon_str)) =
                (record.get(0), record.get(1), record.get(2), record.get(4), record.get(5)) {
                if let (Ok(lat), Ok(lon)) = (lat_str.parse::<f64>(), lon_str.parse::<f64>()) {
                    stops.insert(stop_id.to_string(), Stop {
                        stop_id: stop_id.to_string(),
                        stop_name: stop_name.to_string(),
                        stop_code: stop_code.to_string(),
                        platform_code: record.get(10).map(|s| s.to_string()).filter(|s| !s.is_empty()),
                        latitude: lat,
                        longitude: lon,
                    });
                }
            }
        }
    }

    Ok(stops)
}

fn parse_routes(dir: &Path) -> Result<HashMap<String, Route>> {
    let mut rdr = open_table(dir, "routes.txt")?;
    let mut routes = HashMap::new();

    for result in rdr.records() {
        if let Ok(record) = result {
            // route_id,route_short_name,route_long_name,route_desc,route_type,route_url,route_color,route_text_color
            if let (Some(route_id), Some(short_name), Some(long_name)) =
                (record.get(0), record.get(1), record.get(2)) {
                let color = record.get(6)
                    .filter(|c| c.len() == 6)
                    .unwrap_or(DEFAULT_ROUTE_COLOR);
                let text_color = record.get(7)
                    .filter(|c| c.len() == 6)
                    .unwrap_or(DEFAULT_ROUTE_TEXT_COLOR);

                routes.insert(route_id.to_string(), Route {
                    route_id: route_id.to_string(),
                    short_name: short_name.to_string(),
                    long_name: long_name.to_string(),
                    color: color.to_string(),
                    text_color: text_color.to_string(),
                });
            }
        }
    }

    Ok(routes)
}

fn parse_trips(dir: &Path) -> Result<HashMap<String, Trip>> {
    let mut rdr = open_table(dir, "trips.txt")?;
    let mut trips = HashMap::new();

    for result in rdr.records() {
        if let Ok(record) = result {
            // route_id,service_id,trip_id,trip_headsign,direction_id,block_id,shape_id
            if let (Some(route_id), Some(trip_id)) = (record.get(0), record.get(2)) {
                trips.insert(trip_id.to_string(), Trip {
                    trip_id: trip_id.to_string(),
                    route_id: route_id.to_string(),
                    headsign: record.get(3).unwrap_or("").to_string(),
                    direction_id: record.get(4).and_then(|s| s.parse::<u8>().ok()),
                });
            }
        }
    }

    Ok(trips)
}

fn parse_stop_times(dir: &Path) -> Result<HashMap<String, Vec<StopTime>>> {
    let mut rdr = open_table(dir, "stop_times.txt")?;
    let mut stop_times: HashMap<String, Vec<StopTime>> = HashMap::new();

    for result in rdr.records() {
        if let Ok(record) = result {
            // trip_id,arrival_time,departure_time,stop_id,stop_sequence,stop_headsign
            if let (Some(trip_id), Some(arrival), Some(departure), Some(stop_id), Some(seq_str)) =
                (record.get(0), record.get(1), record.get(2), record.get(3), record.get(4)) {
                if let Ok(sequence) = seq_str.parse::<u32>() {
                    stop_times.entry(trip_id.to_string())
                        .or_insert_with(Vec::new)
                        .push(StopTime {
                            trip_id: trip_id.to_string(),
                            stop_id: stop_id.to_string(),
                            arrival_time: arrival.to_string(),
                            departure_time: departure.to_string(),
                            stop_sequence: sequence,
                        });
                }
            }
        }
    }

    for times in stop_times.values_mut() {
        times.sort_by_key(|st| st.stop_sequence);
    }

    Ok(stop_times)
}

pub fn load_tables(dir: &Path) -> Result<StaticTables> {
    let stops = parse_stops(dir)?;
    let routes = parse_routes(dir)?;
    let trips = parse_trips(dir)?;
    let stop_times = parse_stop_times(dir)?;

    Ok(StaticTables { stops, routes, trips, stop_times })
}

// ============================================================================
// Static Index
// ============================================================================

pub struct StaticIndex {
    data_dir: PathBuf,
    tables: RwLock<Arc<StaticTables>>,
}

impl StaticIndex {
    /// Loads the index from the data directory. A missing or unreadable
    /// table file is an error; startup treats it as fatal.
    pub fn load(data_dir: &Path) -> Result<StaticIndex> {
        let tables = load_tables(data_dir)?;
        println!("✓ Static schedule loaded: {} stops, {} routes, {} trips",
                 tables.stops.len(), tables.routes.len(), tables.trips.len());

        Ok(StaticIndex {
            data_dir: data_dir.to_path_buf(),
            tables: RwLock::new(Arc::new(tables)),
        })
    }

    /// Rebuilds all four tables from the current files and swaps them in as
    /// one unit. On failure the previous tables stay in place.
    pub async fn reload(&self) -> Result<()> {
        let tables = load_tables(&self.data_dir)?;
        println!("✓ Static schedule reloaded: {} stops, {} routes, {} trips",
                 tables.stops.len(), tables.routes.len(), tables.trips.len());

        *self.tables.write().await = Arc::new(tables);
        Ok(())
    }

    /// A consistent view of the current tables; holders keep reading the
    /// same dataset across any concurrent reload.
    pub async fn tables(&self) -> Arc<StaticTables> {
        self.tables.read().await.clone()
    }

    pub async fn lookup_stop(&self, stop_id: &str) -> Option<Stop> {
        self.tables.read().await.stops.get(stop_id).cloned()
    }

    pub async fn lookup_route(&self, route_id: &str) -> Option<Route> {
        self.tables.read().await.routes.get(route_id).cloned()
    }

    pub async fn lookup_trip(&self, trip_id: &str) -> Option<Trip> {
        self.tables.read().await.trips.get(trip_id).cloned()
    }

    pub async fn all_stops(&self) -> Vec<Stop> {
        let mut stops: Vec<Stop> = self.tables.read().await.stops.values().cloned().collect();
        stops.sort_by(|a, b| a.stop_id.cmp(&b.stop_id));
        stops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const STOPS_HEADER: &str = "stop_id,stop_code,stop_name,stop_desc,stop_lat,stop_lon,zone_id,stop_url,location_type,parent_station,platform_code";
    const ROUTES_HEADER: &str = "route_id,route_short_name,route_long_name,route_desc,route_type,route_url,route_color,route_text_color";
    const TRIPS_HEADER: &str = "route_id,service_id,trip_id,trip_headsign,direction_id,block_id,shape_id";
    const STOP_TIMES_HEADER: &str = "trip_id,arrival_time,departure_time,stop_id,stop_sequence,stop_headsign";

    fn fixture_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("blb_static_{}_{}", std::process::id(), name));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_fixture(dir: &Path) {
        fs::write(dir.join("stops.txt"), format!(
            "{}\nM20-2,MONT,Montgomery St.,,37.789,-122.401,,,0,,2\nEMBR,EMBR,Embarcadero,,37.792,-122.397,,,0,,\n",
            STOPS_HEADER,
        )).unwrap();
        fs::write(dir.join("routes.txt"), format!(
            "{}\nROUTE-N,Yellow-N,Antioch Line,,1,,FFFF33,000000\nROUTE-S,Yellow-S,Millbrae Line,,1,,FFFF33,000000\n",
            ROUTES_HEADER,
        )).unwrap();
        fs::write(dir.join("trips.txt"), format!(
            "{}\nROUTE-N,WKDY,TRIP-1,Pittsburg / Antioch,0,,\nROUTE-S,WKDY,TRIP-2,SFO/Millbrae,1,,\n",
            TRIPS_HEADER,
        )).unwrap();
        fs::write(dir.join("stop_times.txt"), format!(
            "{}\nTRIP-1,08:02:00,08:02:30,EMBR,2,\nTRIP-1,08:00:00,08:00:30,M20-2,1,\nTRIP-2,09:00:00,09:00:30,M20-2,1,\n",
            STOP_TIMES_HEADER,
        )).unwrap();
    }

    #[test]
    fn test_load_tables_parses_all_four() {
        let dir = fixture_dir("load");
        write_fixture(&dir);

        let tables = load_tables(&dir).unwrap();
        assert_eq!(tables.stops.len(), 2);
        assert_eq!(tables.routes.len(), 2);
        assert_eq!(tables.trips.len(), 2);

        let stop = &tables.stops["M20-2"];
        assert_eq!(stop.stop_name, "Montgomery St.");
        assert_eq!(stop.stop_code, "MONT");
        assert_eq!(stop.platform_code.as_deref(), Some("2"));

        let trip = &tables.trips["TRIP-1"];
        assert_eq!(trip.route_id, "ROUTE-N");
        assert_eq!(trip.direction_id, Some(0));

        // stop_times come back ordered by sequence even when the file is not
        let times = &tables.stop_times["TRIP-1"];
        assert_eq!(times.len(), 2);
        assert_eq!(times[0].stop_id, "M20-2");
        assert_eq!(times[1].stop_id, "EMBR");
    }

    #[test]
    fn test_load_tables_missing_file_is_file_error() {
        let dir = fixture_dir("missing");
        write_fixture(&dir);
        fs::remove_file(dir.join("trips.txt")).unwrap();

        match load_tables(&dir) {
            Err(BoardError::FileError(msg)) => assert!(msg.contains("trips.txt")),
            other => panic!("expected FileError, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_reload_replaces_all_tables() {
        let dir = fixture_dir("reload");
        write_fixture(&dir);

        let index = StaticIndex::load(&dir).unwrap();
        assert!(index.lookup_stop("EMBR").await.is_some());

        // New dataset drops EMBR and adds a new stop
        fs::write(dir.join("stops.txt"), format!(
            "{}\nM20-2,MONT,Montgomery St.,,37.789,-122.401,,,0,,2\nPOWL,POWL,Powell St.,,37.784,-122.408,,,0,,\n",
            STOPS_HEADER,
        )).unwrap();

        index.reload().await.unwrap();
        assert!(index.lookup_stop("EMBR").await.is_none());
        assert!(index.lookup_stop("POWL").await.is_some());
    }

    #[tokio::test]
    async fn test_failed_reload_preserves_existing_tables() {
        let dir = fixture_dir("reload_fail");
        write_fixture(&dir);

        let index = StaticIndex::load(&dir).unwrap();
        fs::remove_file(dir.join("stop_times.txt")).unwrap();

        assert!(index.reload().await.is_err());

        // Prior dataset is still fully resolvable
        assert!(index.lookup_stop("M20-2").await.is_some());
        assert!(index.lookup_route("ROUTE-N").await.is_some());
        assert!(index.lookup_trip("TRIP-2").await.is_some());
        assert_eq!(index.tables().await.stop_times.len(), 2);
    }

    #[tokio::test]
    async fn test_readers_keep_consistent_view_across_reload() {
        let dir = fixture_dir("consistent");
        write_fixture(&dir);

        let index = StaticIndex::load(&dir).unwrap();
        let before = index.tables().await;

        fs::write(dir.join("stops.txt"), format!("{}\n", STOPS_HEADER)).unwrap();
        index.reload().await.unwrap();

        assert!(before.stops.contains_key("EMBR"));
        assert!(index.tables().await.stops.is_empty());
    }
}
