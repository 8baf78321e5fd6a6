//! HTTP fetch utilities and persisted stores for Dira.
//!
//! Holds the pieces every adapter shares: a rate-limit-aware HTTP fetcher
//! with retry/backoff, the randomized inter-request delay, the persisted
//! listing catalog, and a snapshot store capturing error documents.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use dira_core::Listing;
use rand::Rng;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dira-storage";

// ---------------------------------------------------------------------------
// Errors and retry classification
// ---------------------------------------------------------------------------

/// Transport-level fetch failure taxonomy.
///
/// `AccessDenied` and `RateLimited` are fatal: they abort the enclosing
/// adapter run and are never retried. Timeouts are retryable at the caller's
/// discretion (the enrichment orchestrator owns that retry budget).
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out for {url}")]
    Timeout { url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("access denied (status {status}) for {url}")]
    AccessDenied { status: u16, url: String },
    #[error("rate limited for {url}")]
    RateLimited { url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    /// Fatal errors abort the whole adapter run rather than one listing.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FetchError::AccessDenied { .. } | FetchError::RateLimited { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            FetchError::Timeout { .. } => true,
            FetchError::Request(err) => err.is_timeout(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
    Fatal,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        RetryDisposition::Fatal
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Fatal
    } else if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

fn status_error(status: StatusCode, url: String) -> FetchError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchError::AccessDenied {
            status: status.as_u16(),
            url,
        },
        StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited { url },
        _ => FetchError::HttpStatus {
            status: status.as_u16(),
            url,
        },
    }
}

// ---------------------------------------------------------------------------
// Backoff and jittered delay
// ---------------------------------------------------------------------------

/// Exponential backoff with uniform jitter: `base * 2^attempt + U(0, 1)s`,
/// capped at `max_delay` before the jitter is added.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn jittered_delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let jitter = Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..1.0));
        self.delay_for_attempt(attempt_index) + jitter
    }
}

/// Uniform random pause drawn from `[min, max]` before a request, the
/// anti-rate-limit jitter applied between page and detail fetches.
#[derive(Debug, Clone, Copy)]
pub struct DelayRange {
    pub min: Duration,
    pub max: Duration,
}

impl Default for DelayRange {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(2),
            max: Duration::from_secs(8),
        }
    }
}

impl DelayRange {
    pub fn none() -> Self {
        Self {
            min: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let span = (self.max - self.min).as_secs_f64();
        let offset = rand::thread_rng().gen_range(0.0..=span);
        self.min + Duration::from_secs_f64(offset)
    }

    pub async fn pause(&self) {
        let delay = self.sample();
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "inter-request delay");
            tokio::time::sleep(delay).await;
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP fetcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
    snapshots: Option<Arc<SnapshotStore>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
            snapshots: None,
        })
    }

    /// Capture error-response bodies to `store` for offline diagnosis.
    pub fn with_snapshots(mut self, store: Arc<SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    async fn capture_error_body(&self, source_id: &str, status: StatusCode, body: &str) {
        let Some(store) = &self.snapshots else {
            return;
        };
        let label = format!("error_page_{}", status.as_u16());
        if let Err(err) = store
            .store_document(Utc::now(), source_id, &label, "html", body.as_bytes())
            .await
        {
            warn!(%err, source_id, "failed to capture error-page snapshot");
        }
    }

    /// Single-attempt fetch. Timeouts surface as [`FetchError::Timeout`] so
    /// the caller can run its own retry budget (used by detail enrichment).
    pub async fn fetch_document_once(
        &self,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedDocument, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", source_id, url);
        let _guard = span.enter();

        let resp = match self.client.get(url).send().await {
            Ok(resp) => resp,
            Err(err) if err.is_timeout() => {
                return Err(FetchError::Timeout {
                    url: url.to_string(),
                })
            }
            Err(err) => return Err(FetchError::Request(err)),
        };

        let status = resp.status();
        let final_url = resp.url().to_string();
        let body = resp.text().await?;

        if status.is_success() {
            return Ok(FetchedDocument {
                status,
                final_url,
                body,
            });
        }

        self.capture_error_body(source_id, status, &body).await;
        Err(status_error(status, final_url))
    }

    /// Fetch with the configured retry budget. Server errors and transport
    /// failures are retried with jittered exponential backoff; access-denied
    /// and rate-limited responses fail immediately.
    pub async fn fetch_document(
        &self,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedDocument, FetchError> {
        let mut last_error: Option<FetchError> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.fetch_document_once(source_id, url).await {
                Ok(doc) => return Ok(doc),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err @ FetchError::HttpStatus { status, .. }) => {
                    let retryable = StatusCode::from_u16(status)
                        .map(|s| classify_status(s) == RetryDisposition::Retryable)
                        .unwrap_or(false);
                    if retryable && attempt < self.backoff.max_retries {
                        let delay = self.backoff.jittered_delay_for_attempt(attempt);
                        warn!(url, status, attempt, "retrying after server error");
                        tokio::time::sleep(delay).await;
                        last_error = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(err) => {
                    // Timeouts and connect failures.
                    if attempt < self.backoff.max_retries {
                        let delay = self.backoff.jittered_delay_for_attempt(attempt);
                        warn!(url, attempt, %err, "retrying after transport error");
                        tokio::time::sleep(delay).await;
                        last_error = Some(err);
                        continue;
                    }
                    return Err(err);
                }
            }
        }

        Err(last_error.expect("retry loop captures an error before exhausting"))
    }
}

/// Build a URL with percent-encoded query parameters appended. Non-ASCII
/// parameter values (Hebrew neighborhood names, serialized JSON) are encoded
/// by the URL parser, not by hand.
pub fn url_with_params<I, K, V>(base: &str, params: I) -> anyhow::Result<String>
where
    I: IntoIterator,
    I::Item: std::borrow::Borrow<(K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let url = reqwest::Url::parse_with_params(base, params)
        .with_context(|| format!("building url from {base}"))?;
    Ok(url.into())
}

// ---------------------------------------------------------------------------
// Catalog store
// ---------------------------------------------------------------------------

/// Persisted reconciliation catalog: `fingerprint -> Listing`, one JSON
/// document read wholesale at the start of a cycle and written wholesale at
/// the end via atomic temp-file rename. Single-writer access is assumed.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    path: PathBuf,
}

impl CatalogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the full catalog. A missing file is an empty catalog, not an
    /// error (first run).
    pub async fn load(&self) -> anyhow::Result<BTreeMap<String, Listing>> {
        match fs::read_to_string(&self.path).await {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("parsing catalog {}", self.path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => {
                Err(err).with_context(|| format!("reading catalog {}", self.path.display()))
            }
        }
    }

    pub async fn save(&self, catalog: &BTreeMap<String, Listing>) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(catalog).context("serializing catalog")?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating catalog directory {}", parent.display()))?;
        }
        let temp_path = self
            .path
            .with_extension(format!("{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp catalog file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp catalog file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp catalog file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming catalog {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Snapshot store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable capture of fetched documents that needed preserving: error
/// pages on access-denied/unexpected statuses and debug payload fragments.
/// Hash-suffixed paths make repeat captures of identical bodies no-ops.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn snapshot_relative_path(
        captured_at: DateTime<Utc>,
        source_id: &str,
        label: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = captured_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        let short_hash = &content_hash[..12.min(content_hash.len())];
        PathBuf::from(source_id)
            .join(stamp)
            .join(format!("{label}_{short_hash}.{ext}"))
    }

    pub async fn store_document(
        &self,
        captured_at: DateTime<Utc>,
        source_id: &str,
        label: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredSnapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            Self::snapshot_relative_path(captured_at, source_id, label, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating snapshot directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?
        {
            return Ok(StoredSnapshot {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_name = format!(".{}.tmp", Uuid::new_v4());
        let temp_path = absolute_path
            .parent()
            .expect("snapshot path always has parent")
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredSnapshot {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredSnapshot {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp snapshot {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use dira_core::SourceType;
    use tempfile::tempdir;

    fn mk_listing(id: &str) -> Listing {
        Listing {
            id: id.to_string(),
            source_type: SourceType::Groups,
            price: Some(6100),
            location: "Ben Yehuda 8, Tel Aviv".to_string(),
            resource_url: format!("https://example.test/item/{id}"),
            detail_resource: None,
            detail_fields: BTreeMap::new(),
            fetched_at: Utc.with_ymd_and_hms(2026, 8, 30, 7, 0, 0).single().unwrap(),
        }
    }

    #[tokio::test]
    async fn missing_catalog_file_loads_as_empty() {
        let dir = tempdir().expect("tempdir");
        let store = CatalogStore::new(dir.path().join("catalog.json"));
        let catalog = store.load().await.expect("load");
        assert!(catalog.is_empty());
    }

    #[tokio::test]
    async fn catalog_round_trips_through_atomic_writer() {
        let dir = tempdir().expect("tempdir");
        let store = CatalogStore::new(dir.path().join("nested/catalog.json"));

        let mut catalog = BTreeMap::new();
        catalog.insert("fp-one".to_string(), mk_listing("a"));
        catalog.insert("fp-two".to_string(), mk_listing("b"));

        store.save(&catalog).await.expect("save");
        let reloaded = store.load().await.expect("reload");
        assert_eq!(reloaded, catalog);

        // No stray temp files left behind.
        let mut entries = fs::read_dir(dir.path().join("nested")).await.expect("dir");
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.expect("entry") {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["catalog.json".to_string()]);
    }

    #[tokio::test]
    async fn snapshot_store_deduplicates_identical_bodies() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let at = Utc.with_ymd_and_hms(2026, 8, 30, 7, 0, 0).single().unwrap();

        let first = store
            .store_document(at, "marketplace", "error_page_403", "html", b"<html>denied</html>")
            .await
            .expect("first");
        let second = store
            .store_document(at, "marketplace", "error_page_403", "html", b"<html>denied</html>")
            .await
            .expect("second");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(4));
    }

    #[test]
    fn jittered_backoff_adds_less_than_one_second() {
        let policy = BackoffPolicy::default();
        for attempt in 0..3 {
            let bare = policy.delay_for_attempt(attempt);
            let jittered = policy.jittered_delay_for_attempt(attempt);
            assert!(jittered >= bare);
            assert!(jittered < bare + Duration::from_secs(1));
        }
    }

    #[test]
    fn delay_range_samples_stay_in_bounds() {
        let range = DelayRange {
            min: Duration::from_millis(100),
            max: Duration::from_millis(300),
        };
        for _ in 0..50 {
            let sample = range.sample();
            assert!(sample >= range.min && sample <= range.max);
        }
        assert_eq!(DelayRange::none().sample(), Duration::ZERO);
    }

    #[test]
    fn status_classification_flags_fatal_statuses() {
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            RetryDisposition::Fatal
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::Fatal
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Fatal
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn url_params_are_percent_encoded() {
        let url = url_with_params(
            "https://example.test/api/listings",
            [("minPrice", "3000"), ("hood", "לב העיר")],
        )
        .expect("url builds");
        assert!(url.starts_with("https://example.test/api/listings?minPrice=3000&hood="));
        assert!(!url.contains("לב"));
    }

    #[test]
    fn fatal_errors_are_distinguishable() {
        let denied = FetchError::AccessDenied {
            status: 403,
            url: "https://example.test".into(),
        };
        let limited = FetchError::RateLimited {
            url: "https://example.test".into(),
        };
        let timeout = FetchError::Timeout {
            url: "https://example.test".into(),
        };
        assert!(denied.is_fatal());
        assert!(limited.is_fatal());
        assert!(!timeout.is_fatal());
        assert!(timeout.is_timeout());
    }
}
