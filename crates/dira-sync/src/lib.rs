//! Sync pipeline: fetch every enabled source, reconcile against the
//! persisted catalog, and report what changed.
//!
//! Reconciliation is keyed by content fingerprint, not source identifier,
//! so a source rotating its tokens does not re-announce known listings.
//! The catalog is append-only: listings that disappear from a source stay
//! recorded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use dira_adapters::{
    adapter_for_source, AdapterContext, EnrichmentConfig, SourceAdapter, SourceConfig,
};
use dira_core::{fingerprint, Listing, SourceType};
use dira_storage::{
    CatalogStore, DelayRange, HttpClientConfig, HttpFetcher, SnapshotStore,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dira-sync";

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// Result of reconciling one run's fetched listings against the catalog.
#[derive(Debug)]
pub struct ReconcileOutcome {
    pub new: Vec<Listing>,
    pub updated: Vec<Listing>,
    pub unchanged: usize,
    pub catalog: BTreeMap<String, Listing>,
}

/// Merge freshly fetched listings into the catalog.
///
/// A fingerprint absent from the catalog is a new listing. A present
/// fingerprint whose stored identifier differs is the same listing under a
/// rotated token: the stored entry keeps its attributes and only its
/// identifier and resource URL are refreshed. Identical identifiers are
/// unchanged. Nothing is ever removed. Duplicate fingerprints within one
/// run collapse deterministically to the last occurrence.
pub fn reconcile(
    fresh: Vec<Listing>,
    mut catalog: BTreeMap<String, Listing>,
) -> ReconcileOutcome {
    let mut keyed: BTreeMap<String, Listing> = BTreeMap::new();
    for listing in fresh {
        keyed.insert(fingerprint(&listing).into_inner(), listing);
    }

    let mut new = Vec::new();
    let mut updated = Vec::new();
    let mut unchanged = 0usize;
    for (key, listing) in keyed {
        if let Some(stored) = catalog.get_mut(&key) {
            if stored.id == listing.id {
                unchanged += 1;
            } else {
                stored.id = listing.id.clone();
                stored.resource_url = listing.resource_url.clone();
                updated.push(listing);
            }
        } else {
            catalog.insert(key, listing.clone());
            new.push(listing);
        }
    }

    ReconcileOutcome {
        new,
        updated,
        unchanged,
        catalog,
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub catalog_path: PathBuf,
    pub snapshots_dir: PathBuf,
    pub sources_path: PathBuf,
    pub user_agent: Option<String>,
    pub http_timeout: Duration,
    pub delay: DelayRange,
    pub batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from("data/catalog.json"),
            snapshots_dir: PathBuf::from("data/snapshots"),
            sources_path: PathBuf::from("sources.yaml"),
            user_agent: None,
            http_timeout: Duration::from_secs(30),
            delay: DelayRange::default(),
            batch_size: dira_adapters::enrich::DEFAULT_BATCH_SIZE,
        }
    }
}

impl SyncConfig {
    /// Read configuration from `DIRA_*` environment variables, falling back
    /// to the defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            catalog_path: env_path("DIRA_CATALOG_PATH", defaults.catalog_path),
            snapshots_dir: env_path("DIRA_SNAPSHOTS_DIR", defaults.snapshots_dir),
            sources_path: env_path("DIRA_SOURCES_PATH", defaults.sources_path),
            user_agent: std::env::var("DIRA_USER_AGENT").ok(),
            http_timeout: env_secs("DIRA_HTTP_TIMEOUT_SECS", defaults.http_timeout),
            delay: DelayRange {
                min: env_secs("DIRA_DELAY_MIN_SECS", defaults.delay.min),
                max: env_secs("DIRA_DELAY_MAX_SECS", defaults.delay.max),
            },
            batch_size: std::env::var("DIRA_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.batch_size),
        }
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[derive(Debug, Deserialize)]
struct SourcesFile {
    sources: Vec<SourceConfig>,
}

/// Load the source registry. Disabled entries are kept here; the pipeline
/// filters them so a report can still name them.
pub async fn load_sources(path: &Path) -> anyhow::Result<Vec<SourceConfig>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading source registry {}", path.display()))?;
    let file: SourcesFile = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing source registry {}", path.display()))?;
    Ok(file.sources)
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct SourceRunStats {
    pub source_type: SourceType,
    pub fetched: usize,
    pub error: Option<String>,
}

/// Summary of one full sync cycle, consumed by the CLI and by notification
/// collaborators (new and updated listings carry their full payloads).
#[derive(Debug, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceRunStats>,
    pub new_items: Vec<Listing>,
    pub updated_items: Vec<Listing>,
    pub unchanged: usize,
    pub catalog_size: usize,
}

impl SyncReport {
    pub fn new_count(&self) -> usize {
        self.new_items.len()
    }

    pub fn updated_count(&self) -> usize {
        self.updated_items.len()
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: Arc<HttpFetcher>,
    catalog_store: CatalogStore,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> anyhow::Result<Self> {
        let snapshots = Arc::new(SnapshotStore::new(&config.snapshots_dir));
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: config.user_agent.clone(),
            ..HttpClientConfig::default()
        })?
        .with_snapshots(snapshots);
        let catalog_store = CatalogStore::new(&config.catalog_path);
        Ok(Self {
            config,
            http: Arc::new(http),
            catalog_store,
        })
    }

    /// Run one full cycle against the configured source registry.
    pub async fn run(&self) -> anyhow::Result<SyncReport> {
        let sources = load_sources(&self.config.sources_path).await?;
        let adapters: Vec<Box<dyn SourceAdapter>> = sources
            .iter()
            .filter(|source| source.enabled)
            .map(adapter_for_source)
            .collect();
        self.run_with_adapters(adapters).await
    }

    /// Fetch through the given adapters, reconcile and persist.
    ///
    /// One adapter failing (including its fatal aborts) is contained: the
    /// cycle proceeds with the remaining sources and the failure lands in
    /// the report.
    pub async fn run_with_adapters(
        &self,
        adapters: Vec<Box<dyn SourceAdapter>>,
    ) -> anyhow::Result<SyncReport> {
        let started_at = Utc::now();
        let ctx = AdapterContext::new(
            self.config.delay,
            EnrichmentConfig {
                batch_size: self.config.batch_size,
                delay: self.config.delay,
                ..EnrichmentConfig::default()
            },
        );
        info!(run_id = %ctx.run_id, sources = adapters.len(), "starting sync cycle");

        let catalog = self.catalog_store.load().await?;

        let mut tasks = JoinSet::new();
        for (index, adapter) in adapters.into_iter().enumerate() {
            let http = Arc::clone(&self.http);
            let ctx = ctx.clone();
            tasks.spawn(async move {
                let source_type = adapter.source_type();
                let result = adapter.fetch_listings(http, &ctx).await;
                (index, source_type, result)
            });
        }

        // Keyed by spawn index so the concatenation order matches the
        // registry order regardless of completion order.
        let mut per_source = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (index, source_type, result) = joined.context("adapter task panicked")?;
            per_source.insert(index, (source_type, result));
        }

        let mut fresh = Vec::new();
        let mut stats = Vec::new();
        for (_, (source_type, result)) in per_source {
            match result {
                Ok(mut listings) => {
                    info!(source = %source_type, fetched = listings.len(), "source complete");
                    stats.push(SourceRunStats {
                        source_type,
                        fetched: listings.len(),
                        error: None,
                    });
                    fresh.append(&mut listings);
                }
                Err(err) => {
                    error!(source = %source_type, %err, "source failed, continuing without it");
                    stats.push(SourceRunStats {
                        source_type,
                        fetched: 0,
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        let outcome = reconcile(fresh, catalog);
        self.catalog_store.save(&outcome.catalog).await?;

        let report = SyncReport {
            run_id: ctx.run_id,
            started_at,
            finished_at: Utc::now(),
            sources: stats,
            unchanged: outcome.unchanged,
            catalog_size: outcome.catalog.len(),
            new_items: outcome.new,
            updated_items: outcome.updated,
        };
        info!(
            run_id = %report.run_id,
            new = report.new_count(),
            updated = report.updated_count(),
            unchanged = report.unchanged,
            catalog = report.catalog_size,
            "sync cycle complete"
        );
        Ok(report)
    }
}
