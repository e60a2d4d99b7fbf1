// Background polling of the GTFS-realtime feeds.
//
// Two independent slots (trip updates, service alerts), each refreshed by
// its own timer loop. A refresh is a bounded-retry fetch-and-decode; on
// success the slot's snapshot and capture timestamp are replaced together,
// on exhaustion the prior snapshot stays in place and the terminal error
// becomes the slot's visible status. Nothing here is fatal to the process:
// a feed that never succeeds leaves the board serving schedule-only data.

use gtfs_rt::FeedMessage;
use prost::Message;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time;

use crate::errors::{BoardError, Result};

const MAX_FETCH_ATTEMPTS: u32 = 3;
const REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    TripUpdates,
    Alerts,
}

impl FeedKind {
    fn label(&self) -> &'static str {
        match self {
            FeedKind::TripUpdates => "trip updates",
            FeedKind::Alerts => "alerts",
        }
    }
}

#[derive(Debug)]
pub struct FeedSnapshot {
    pub feed: FeedMessage,
    /// Capture time, epoch seconds.
    pub fetched_at: i64,
}

#[derive(Debug, Default)]
struct FeedSlot {
    snapshot: Option<Arc<FeedSnapshot>>,
    last_error: Option<String>,
    success_count: u64,
    error_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedStatus {
    pub last_update: Option<i64>,
    pub has_data: bool,
    pub error: Option<String>,
    pub success_count: u64,
    pub error_count: u64,
}

// ============================================================================
// Fetch & Decode
// ============================================================================

/// Decodes raw feed bytes into the GTFS-realtime object model.
pub fn decode_feed(body: &[u8]) -> Result<FeedMessage> {
    FeedMessage::decode(body)
        .map_err(|e| BoardError::ParseError(format!("Failed to decode feed: {}", e)))
}

fn create_http_client() -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .build()
        .map_err(|e| BoardError::NetworkError(format!("Failed to create HTTP client: {}", e)))
}

/// One fetch attempt: transport failure, non-2xx status and decode failure
/// are all the same retryable error to the caller.
fn fetch_feed(url: &str) -> Result<FeedMessage> {
    let client = create_http_client()?;

    let response = client.get(url)
        .send()
        .map_err(|e| BoardError::NetworkError(format!("Failed to fetch feed: {}", e)))?;

    if !response.status().is_success() {
        return Err(BoardError::NetworkError(format!("API returned error: {}", response.status())));
    }

    let body = response.bytes()
        .map_err(|e| BoardError::NetworkError(format!("Failed to read feed response: {}", e)))?;

    decode_feed(&body)
}

fn backoff_delay(attempt: u32) -> Duration {
    // 1s, 2s, 4s for attempts 1, 2, 3
    Duration::from_secs(1 << (attempt - 1))
}

// ============================================================================
// Feed Poller
// ============================================================================

pub struct FeedPoller {
    trip_updates_url: String,
    alerts_url: String,
    refresh_interval: Duration,
    trip_updates: RwLock<FeedSlot>,
    alerts: RwLock<FeedSlot>,
    started: AtomicBool,
}

impl FeedPoller {
    pub fn new(trip_updates_url: String, alerts_url: String, refresh_interval: Duration) -> FeedPoller {
        FeedPoller {
            trip_updates_url,
            alerts_url,
            refresh_interval,
            trip_updates: RwLock::new(FeedSlot::default()),
            alerts: RwLock::new(FeedSlot::default()),
            started: AtomicBool::new(false),
        }
    }

    /// Spawns the two refresh loops: trip updates every T, alerts every 2T.
    /// The first interval tick fires immediately, so both feeds refresh once
    /// right away. Calling start() again is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        println!("📡 Feed poller started: trip updates every {}s, alerts every {}s",
                 self.refresh_interval.as_secs(),
                 self.refresh_interval.as_secs() * 2);

        let poller = self.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(poller.refresh_interval);
            loop {
                interval.tick().await;
                poller.refresh(FeedKind::TripUpdates).await;
            }
        });

        let poller = self.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(poller.refresh_interval * 2);
            loop {
                interval.tick().await;
                poller.refresh(FeedKind::Alerts).await;
            }
        });
    }

    /// One bounded-retry refresh of a feed. Each attempt runs the blocking
    /// fetch on the blocking pool with the client's 10s timeout; failed
    /// attempts back off 1s then 2s before retrying.
    pub async fn refresh(&self, kind: FeedKind) {
        let url = match kind {
            FeedKind::TripUpdates => self.trip_updates_url.clone(),
            FeedKind::Alerts => self.alerts_url.clone(),
        };

        let mut last_error = BoardError::NetworkError("no fetch attempted".to_string());

        for attempt in 1..=MAX_FETCH_ATTEMPTS {
            let attempt_url = url.clone();
            let result = tokio::task::spawn_blocking(move || fetch_feed(&attempt_url)).await;

            match result {
                Ok(Ok(feed)) => {
                    self.record_success(kind, feed).await;
                    return;
                }
                Ok(Err(e)) => {
                    eprintln!("⚠️  {} fetch attempt {}/{} failed: {}",
                              kind.label(), attempt, MAX_FETCH_ATTEMPTS, e);
                    last_error = e;
                }
                Err(e) => {
                    eprintln!("❌ {} fetch task panicked: {}", kind.label(), e);
                    last_error = BoardError::NetworkError(format!("Fetch task panicked: {}", e));
                }
            }

            if attempt < MAX_FETCH_ATTEMPTS {
                time::sleep(backoff_delay(attempt)).await;
            }
        }

        self.record_failure(kind, last_error).await;
    }

    async fn record_success(&self, kind: FeedKind, feed: FeedMessage) {
        let entity_count = feed.entity.len();
        let snapshot = Arc::new(FeedSnapshot {
            feed,
            fetched_at: chrono::Utc::now().timestamp(),
        });

        let mut slot = self.slot(kind).write().await;
        slot.snapshot = Some(snapshot);
        slot.last_error = None;
        slot.success_count += 1;
        drop(slot);

        println!("✓ Refreshed {}: {} entities", kind.label(), entity_count);
    }

    async fn record_failure(&self, kind: FeedKind, error: BoardError) {
        let mut slot = self.slot(kind).write().await;
        slot.last_error = Some(error.to_string());
        slot.error_count += 1;
        let serving_stale = slot.snapshot.is_some();
        drop(slot);

        eprintln!("❌ Giving up on {} refresh: {}{}",
                  kind.label(), error,
                  if serving_stale { " (still serving previous snapshot)" } else { "" });
    }

    fn slot(&self, kind: FeedKind) -> &RwLock<FeedSlot> {
        match kind {
            FeedKind::TripUpdates => &self.trip_updates,
            FeedKind::Alerts => &self.alerts,
        }
    }

    /// Non-blocking read of the current snapshot; never triggers a fetch.
    pub async fn snapshot(&self, kind: FeedKind) -> Option<Arc<FeedSnapshot>> {
        self.slot(kind).read().await.snapshot.clone()
    }

    /// Non-blocking read of the slot's bookkeeping; never triggers a fetch.
    pub async fn status(&self, kind: FeedKind) -> FeedStatus {
        let slot = self.slot(kind).read().await;
        FeedStatus {
            last_update: slot.snapshot.as_ref().map(|s| s.fetched_at),
            has_data: slot.snapshot.is_some(),
            error: slot.last_error.clone(),
            success_count: slot.success_count,
            error_count: slot.error_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn empty_feed() -> FeedMessage {
        FeedMessage {
            header: gtfs_rt::FeedHeader {
                gtfs_realtime_version: "2.0".to_string(),
                ..Default::default()
            },
            entity: Vec::new(),
        }
    }

    fn poller(trip_url: &str) -> Arc<FeedPoller> {
        Arc::new(FeedPoller::new(
            trip_url.to_string(),
            "http://127.0.0.1:1/alerts".to_string(),
            Duration::from_secs(60),
        ))
    }

    /// Serves `responses` HTTP 503s, then stops accepting.
    fn spawn_unavailable_server(responses: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        std::thread::spawn(move || {
            for stream in listener.incoming().take(responses) {
                if let Ok(mut stream) = stream {
                    let mut buf = [0u8; 2048];
                    let _ = stream.read(&mut buf);
                    let _ = stream.write_all(
                        b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                    );
                }
            }
        });

        format!("http://{}/tripupdates", addr)
    }

    #[test]
    fn test_decode_feed_rejects_garbage() {
        match decode_feed(b"this is not a protobuf feed") {
            Err(BoardError::ParseError(_)) => {}
            other => panic!("expected ParseError, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_decode_feed_roundtrip() {
        let bytes = empty_feed().encode_to_vec();
        let decoded = decode_feed(&bytes).unwrap();
        assert_eq!(decoded.header.gtfs_realtime_version, "2.0");
        assert!(decoded.entity.is_empty());
    }

    #[test]
    fn test_backoff_delays() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_refresh_records_one_error() {
        let url = spawn_unavailable_server(MAX_FETCH_ATTEMPTS as usize);
        let poller = poller(&url);

        poller.refresh(FeedKind::TripUpdates).await;

        let status = poller.status(FeedKind::TripUpdates).await;
        assert!(!status.has_data);
        assert!(status.last_update.is_none());
        assert_eq!(status.error_count, 1);
        assert_eq!(status.success_count, 0);
        assert!(status.error.unwrap().contains("503"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_keeps_prior_snapshot() {
        let url = spawn_unavailable_server(MAX_FETCH_ATTEMPTS as usize);
        let poller = poller(&url);

        poller.record_success(FeedKind::TripUpdates, empty_feed()).await;
        let before = poller.snapshot(FeedKind::TripUpdates).await.unwrap();

        poller.refresh(FeedKind::TripUpdates).await;

        let after = poller.snapshot(FeedKind::TripUpdates).await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));

        let status = poller.status(FeedKind::TripUpdates).await;
        assert!(status.has_data);
        assert_eq!(status.last_update, Some(before.fetched_at));
        assert_eq!(status.success_count, 1);
        assert_eq!(status.error_count, 1);
        assert!(status.error.is_some());
    }

    #[tokio::test]
    async fn test_success_clears_previous_error() {
        let poller = poller("http://127.0.0.1:1/tripupdates");

        poller.record_failure(FeedKind::TripUpdates, BoardError::NetworkError("down".to_string())).await;
        assert!(poller.status(FeedKind::TripUpdates).await.error.is_some());

        poller.record_success(FeedKind::TripUpdates, empty_feed()).await;

        let status = poller.status(FeedKind::TripUpdates).await;
        assert!(status.has_data);
        assert!(status.error.is_none());
        assert_eq!(status.success_count, 1);
        assert_eq!(status.error_count, 1);
    }

    #[tokio::test]
    async fn test_feeds_are_independent() {
        let poller = poller("http://127.0.0.1:1/tripupdates");

        poller.record_success(FeedKind::Alerts, empty_feed()).await;

        assert!(poller.snapshot(FeedKind::TripUpdates).await.is_none());
        assert!(poller.snapshot(FeedKind::Alerts).await.is_some());
    }
}
