// Daily replacement of the static schedule dataset.
//
// The published schedule URL sometimes answers with a small HTML page whose
// meta refresh points at the current versioned archive; one level of that
// indirection is followed. A downloaded archive is only accepted if it
// carries at least trips.txt and stops.txt; its .txt tables are written into
// the data directory and the static index is told to reload.

use bytes::Bytes;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use std::fs;
use tokio::time;
use zip::ZipArchive;

use crate::errors::{BoardError, Result};
use crate::gtfs_static::StaticIndex;

const UPDATE_INTERVAL_SECS: u64 = 24 * 60 * 60;
const DOWNLOAD_TIMEOUT_SECS: u64 = 60;

pub struct DatasetUpdater {
    schedule_url: String,
    data_dir: PathBuf,
    index: Arc<StaticIndex>,
    started: AtomicBool,
}

impl DatasetUpdater {
    pub fn new(schedule_url: String, data_dir: PathBuf, index: Arc<StaticIndex>) -> DatasetUpdater {
        DatasetUpdater {
            schedule_url,
            data_dir,
            index,
            started: AtomicBool::new(false),
        }
    }

    /// Spawns the daily update loop. The interval's immediate first tick is
    /// swallowed so a restart does not re-download the archive it booted
    /// from. Calling start() again is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        println!("📅 Dataset updater started: checking every {}h", UPDATE_INTERVAL_SECS / 3600);

        let updater = self.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(Duration::from_secs(UPDATE_INTERVAL_SECS));
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = updater.check_for_updates().await {
                    eprintln!("⚠️  Scheduled dataset update failed: {}", e);
                }
            }
        });
    }

    /// Downloads the current archive, replaces the schedule files on disk
    /// and reloads the static index. Manually triggerable; every failure is
    /// a plain error, never fatal.
    pub async fn check_for_updates(&self) -> Result<()> {
        println!("🔄 Checking for a new schedule dataset...");

        let url = self.schedule_url.clone();
        let dir = self.data_dir.clone();
        tokio::task::spawn_blocking(move || download_dataset(&url, &dir))
            .await
            .map_err(|e| BoardError::NetworkError(format!("Download task panicked: {}", e)))??;

        self.index.reload().await
    }
}

// ============================================================================
// Download & Extraction
// ============================================================================

fn download_dataset(url: &str, data_dir: &Path) -> Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
        .build()
        .map_err(|e| BoardError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

    let mut body = fetch_bytes(&client, url)?;

    if !looks_like_zip(&body) {
        let html = String::from_utf8_lossy(&body);
        let target = extract_meta_refresh_url(&html).ok_or_else(|| {
            BoardError::ParseError("Schedule page is not an archive and has no meta refresh".to_string())
        })?;
        let target = resolve_url(url, &target);

        println!("📥 Following schedule redirect to {}", target);
        body = fetch_bytes(&client, &target)?;

        if !looks_like_zip(&body) {
            return Err(BoardError::ParseError(
                "Resolved schedule URL did not return a zip archive".to_string(),
            ));
        }
    }

    println!("✓ Downloaded {} KB, extracting...", body.len() / 1024);
    extract_archive(body, data_dir)
}

fn fetch_bytes(client: &reqwest::blocking::Client, url: &str) -> Result<Bytes> {
    let response = client.get(url)
        .send()
        .map_err(|e| BoardError::NetworkError(format!("Failed to download schedule: {}", e)))?;

    if !response.status().is_success() {
        return Err(BoardError::NetworkError(format!("Download failed with status: {}", response.status())));
    }

    response.bytes()
        .map_err(|e| BoardError::NetworkError(format!("Failed to read schedule response: {}", e)))
}

fn looks_like_zip(body: &[u8]) -> bool {
    body.starts_with(b"PK")
}

fn find_ignore_ascii_case(haystack: &str, needle: &str) -> Option<usize> {
    haystack.as_bytes()
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle.as_bytes()))
}

/// Pulls the target out of `<meta http-equiv="refresh" content="0; url=...">`.
fn extract_meta_refresh_url(html: &str) -> Option<String> {
    let refresh = find_ignore_ascii_case(html, "http-equiv")?;
    let url_start = refresh + find_ignore_ascii_case(&html[refresh..], "url=")? + 4;

    let rest = html[url_start..].trim_start_matches(|c| c == '"' || c == '\'' || c == ' ');
    let end = rest.find(|c| c == '"' || c == '\'' || c == '>' || c == ';').unwrap_or(rest.len());
    let url = rest[..end].trim();

    if url.is_empty() { None } else { Some(url.to_string()) }
}

fn resolve_url(base: &str, target: &str) -> String {
    if target.starts_with("http://") || target.starts_with("https://") {
        return target.to_string();
    }

    let host_start = base.find("://").map(|i| i + 3).unwrap_or(0);

    if target.starts_with('/') {
        // keep scheme://host from the page we fetched
        match base[host_start..].find('/') {
            Some(host_end) => format!("{}{}", &base[..host_start + host_end], target),
            None => format!("{}{}", base, target),
        }
    } else {
        // relative to the page's directory
        match base.rfind('/') {
            Some(idx) if idx >= host_start => format!("{}/{}", &base[..idx], target),
            _ => format!("{}/{}", base, target),
        }
    }
}

fn extract_archive(body: Bytes, data_dir: &Path) -> Result<()> {
    let cursor = Cursor::new(body);
    let mut archive = ZipArchive::new(cursor)
        .map_err(|e| BoardError::ParseError(format!("Failed to open schedule archive: {}", e)))?;

    // A dataset without these two tables is not worth installing
    for required in ["trips.txt", "stops.txt"] {
        if archive.by_name(required).is_err() {
            return Err(BoardError::ParseError(format!("Schedule archive is missing {}", required)));
        }
    }

    fs::create_dir_all(data_dir)
        .map_err(|e| BoardError::FileError(format!("Failed to create data directory: {}", e)))?;

    let names: Vec<String> = archive.file_names()
        .filter(|name| name.ends_with(".txt") && !name.contains('/'))
        .map(String::from)
        .collect();

    let mut extracted = 0;
    for name in &names {
        let mut entry = archive.by_name(name)
            .map_err(|e| BoardError::ParseError(format!("Failed to read {} from archive: {}", name, e)))?;

        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)
            .map_err(|e| BoardError::ParseError(format!("Failed to read {} from archive: {}", name, e)))?;

        fs::write(data_dir.join(name), contents)
            .map_err(|e| BoardError::FileError(format!("Failed to write {}: {}", name, e)))?;
        extracted += 1;
    }

    println!("✓ Extracted {} schedule files to {:?}", extracted, data_dir);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_with(files: &[(&str, &str)]) -> Bytes {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = zip::write::FileOptions::default();
            for (name, contents) in files {
                writer.start_file(*name, options).unwrap();
                writer.write_all(contents.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        Bytes::from(buf.into_inner())
    }

    fn fixture_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("blb_updater_{}_{}", std::process::id(), name));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_extract_meta_refresh_url() {
        let html = r#"<html><head>
            <meta http-equiv="refresh" content="0; url=/dev/schedules/google_transit_20250801_v1.zip">
        </head></html>"#;
        assert_eq!(
            extract_meta_refresh_url(html).as_deref(),
            Some("/dev/schedules/google_transit_20250801_v1.zip"),
        );
    }

    #[test]
    fn test_extract_meta_refresh_url_single_quotes() {
        let html = "<meta http-equiv='refresh' content='5; URL=https://example.com/gtfs.zip'>";
        assert_eq!(
            extract_meta_refresh_url(html).as_deref(),
            Some("https://example.com/gtfs.zip"),
        );
    }

    #[test]
    fn test_extract_meta_refresh_url_absent() {
        assert_eq!(extract_meta_refresh_url("<html><body>hi</body></html>"), None);
    }

    #[test]
    fn test_resolve_url() {
        let base = "https://www.bart.gov/dev/schedules/google_transit.zip";
        assert_eq!(
            resolve_url(base, "https://cdn.example.com/gtfs.zip"),
            "https://cdn.example.com/gtfs.zip",
        );
        assert_eq!(
            resolve_url(base, "/dev/schedules/google_transit_v2.zip"),
            "https://www.bart.gov/dev/schedules/google_transit_v2.zip",
        );
        assert_eq!(
            resolve_url(base, "google_transit_v2.zip"),
            "https://www.bart.gov/dev/schedules/google_transit_v2.zip",
        );
    }

    #[test]
    fn test_looks_like_zip() {
        assert!(looks_like_zip(&zip_with(&[("trips.txt", "a")])));
        assert!(!looks_like_zip(b"<html></html>"));
    }

    #[test]
    fn test_extract_archive_writes_tables() {
        let dir = fixture_dir("extract");
        let body = zip_with(&[
            ("trips.txt", "route_id,service_id,trip_id\nR,S,T\n"),
            ("stops.txt", "stop_id,stop_code,stop_name\nMONT,MONT,Montgomery St.\n"),
            ("routes.txt", "route_id\nR\n"),
            ("shapes/ignored.txt", "nested entries are skipped"),
            ("readme.md", "not a table"),
        ]);

        extract_archive(body, &dir).unwrap();

        assert!(dir.join("trips.txt").exists());
        assert!(dir.join("stops.txt").exists());
        assert!(dir.join("routes.txt").exists());
        assert!(!dir.join("readme.md").exists());
        assert!(!dir.join("ignored.txt").exists());

        let trips = fs::read_to_string(dir.join("trips.txt")).unwrap();
        assert!(trips.contains("R,S,T"));
    }

    #[test]
    fn test_extract_archive_requires_core_tables() {
        let dir = fixture_dir("invalid");
        let body = zip_with(&[("stops.txt", "stop_id\nMONT\n")]);

        match extract_archive(body, &dir) {
            Err(BoardError::ParseError(msg)) => assert!(msg.contains("trips.txt")),
            other => panic!("expected ParseError, got {:?}", other),
        }
    }
}
