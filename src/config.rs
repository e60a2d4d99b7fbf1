// Runtime configuration. Every option has a fixed default and can be
// overridden through the environment (a .env file is honored if present).

use std::path::PathBuf;

const DEFAULT_TRIP_UPDATES_URL: &str = "https://api.bart.gov/gtfsrt/tripupdate.aspx";
const DEFAULT_ALERTS_URL: &str = "https://api.bart.gov/gtfsrt/alerts.aspx";
const DEFAULT_SCHEDULE_URL: &str = "https://www.bart.gov/dev/schedules/google_transit.zip";
const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 60;
const DEFAULT_STOP_ID: &str = "MONT";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Clone)]
pub struct Config {
    pub trip_updates_url: String,
    pub alerts_url: String,
    pub schedule_url: String,
    /// Trip-updates poll interval T; alerts poll at 2T.
    pub refresh_interval_secs: u64,
    pub default_stop_id: String,
    pub default_direction: Option<String>,
    pub static_data_dir: PathBuf,
    pub bind_addr: String,
}

impl Config {
    pub fn from_env() -> Config {
        dotenvy::dotenv().ok();

        Config {
            trip_updates_url: env_or("BART_TRIP_UPDATES_URL", DEFAULT_TRIP_UPDATES_URL),
            alerts_url: env_or("BART_ALERTS_URL", DEFAULT_ALERTS_URL),
            schedule_url: env_or("BART_SCHEDULE_URL", DEFAULT_SCHEDULE_URL),
            refresh_interval_secs: parse_interval(std::env::var("BART_REFRESH_INTERVAL_SECS").ok()),
            default_stop_id: env_or("BART_DEFAULT_STOP_ID", DEFAULT_STOP_ID),
            default_direction: std::env::var("BART_DEFAULT_DIRECTION")
                .ok()
                .filter(|d| !d.is_empty()),
            static_data_dir: std::env::var("BART_GTFS_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_data_dir()),
            bind_addr: env_or("BART_BIND_ADDR", DEFAULT_BIND_ADDR),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_interval(raw: Option<String>) -> u64 {
    match raw.and_then(|v| v.parse::<u64>().ok()) {
        Some(secs) if secs > 0 => secs,
        _ => DEFAULT_REFRESH_INTERVAL_SECS,
    }
}

fn default_data_dir() -> PathBuf {
    let mut path = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("bart_live_board");
    path.push("gtfs");
    path
}
