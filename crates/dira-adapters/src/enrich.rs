//! Enrichment Orchestrator: batched, delayed, retried detail fetches.
//!
//! Listings that carry a detail resource are enriched in fixed-size batches.
//! Batches run strictly sequentially; within a batch one task per listing
//! runs concurrently, each owning a disjoint listing and merging back by
//! index. A single listing's failure never cancels its siblings — failures
//! are recorded per listing and only fatal transport errors (access denied,
//! rate limited) abort the whole run.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use dira_core::{Listing, SourceType, UNAVAILABLE};
use dira_storage::{BackoffPolicy, DelayRange, FetchError, HttpFetcher};
use serde_json::Value as JsonValue;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::AdapterError;

pub const DEFAULT_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone, Copy)]
pub struct EnrichmentConfig {
    pub batch_size: usize,
    pub backoff: BackoffPolicy,
    pub delay: DelayRange,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            backoff: BackoffPolicy::default(),
            delay: DelayRange::default(),
        }
    }
}

/// Fetches the detail document for one listing's detail resource.
#[async_trait]
pub trait DetailFetcher: Send + Sync {
    async fn fetch_detail(&self, source: SourceType, url: &str) -> Result<String, FetchError>;
}

/// One attempt per call; the orchestrator owns the timeout retry budget.
#[async_trait]
impl DetailFetcher for HttpFetcher {
    async fn fetch_detail(&self, source: SourceType, url: &str) -> Result<String, FetchError> {
        let doc = self.fetch_document_once(source.as_str(), url).await?;
        Ok(doc.body)
    }
}

/// Locates and extracts the secondary attribute set from a fetched detail
/// document. Missing attributes default to the `"N/A"` sentinel inside the
/// returned map; only shape drift is an error.
pub trait DetailExtractor: Send + Sync {
    fn extract(
        &self,
        document: &str,
        listing_id: &str,
    ) -> Result<BTreeMap<String, JsonValue>, AdapterError>;
}

/// Per-listing enrichment result, observable by the caller alongside the
/// augmented listings.
#[derive(Debug)]
pub enum EnrichmentOutcome {
    Enriched,
    Skipped,
    Failed(AdapterError),
}

impl EnrichmentOutcome {
    pub fn is_enriched(&self) -> bool {
        matches!(self, EnrichmentOutcome::Enriched)
    }
}

/// Enrich `listings` in place. Returns one outcome per listing, in order.
///
/// Fails only on a fatal error class; everything else is contained to the
/// affected listing, which keeps its original fields.
pub async fn enrich_listings(
    fetcher: Arc<dyn DetailFetcher>,
    extractor: Arc<dyn DetailExtractor>,
    source: SourceType,
    listings: &mut [Listing],
    config: &EnrichmentConfig,
) -> Result<Vec<EnrichmentOutcome>, AdapterError> {
    let mut outcomes: Vec<EnrichmentOutcome> = Vec::with_capacity(listings.len());
    for _ in 0..listings.len() {
        outcomes.push(EnrichmentOutcome::Skipped);
    }

    let total_batches = listings.len().div_ceil(config.batch_size.max(1));
    for (batch_no, batch_start) in (0..listings.len())
        .step_by(config.batch_size.max(1))
        .enumerate()
    {
        let batch_end = (batch_start + config.batch_size.max(1)).min(listings.len());
        debug!(
            source = %source,
            batch = batch_no + 1,
            total_batches,
            "processing enrichment batch"
        );

        let mut tasks = JoinSet::new();
        for index in batch_start..batch_end {
            let Some(url) = listings[index].detail_resource.clone() else {
                warn!(
                    source = %source,
                    listing_id = %listings[index].id,
                    "no detail resource, skipping enrichment"
                );
                continue;
            };
            let fetcher = Arc::clone(&fetcher);
            let extractor = Arc::clone(&extractor);
            let listing_id = listings[index].id.clone();
            let config = *config;
            tasks.spawn(async move {
                let result =
                    enrich_one(fetcher, extractor, source, &listing_id, &url, &config).await;
                (index, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (index, result) = joined
                .map_err(|err| AdapterError::Other(anyhow!("enrichment task panicked: {err}")))?;
            match result {
                Ok(fields) => {
                    merge_detail_fields(&mut listings[index], fields);
                    outcomes[index] = EnrichmentOutcome::Enriched;
                }
                Err(err) if err.is_fatal() => {
                    tasks.abort_all();
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        source = %source,
                        listing_id = %listings[index].id,
                        %err,
                        "enrichment failed for listing, keeping original fields"
                    );
                    outcomes[index] = EnrichmentOutcome::Failed(err);
                }
            }
        }
    }

    Ok(outcomes)
}

async fn enrich_one(
    fetcher: Arc<dyn DetailFetcher>,
    extractor: Arc<dyn DetailExtractor>,
    source: SourceType,
    listing_id: &str,
    url: &str,
    config: &EnrichmentConfig,
) -> Result<BTreeMap<String, JsonValue>, AdapterError> {
    config.delay.pause().await;
    let document = fetch_with_timeout_retries(&*fetcher, source, url, &config.backoff).await?;
    extractor.extract(&document, listing_id)
}

/// Retry timeouts up to the backoff policy's budget with
/// `2^attempt + uniform(0, 1)` seconds between attempts. Every other error
/// class propagates immediately.
async fn fetch_with_timeout_retries(
    fetcher: &dyn DetailFetcher,
    source: SourceType,
    url: &str,
    backoff: &BackoffPolicy,
) -> Result<String, FetchError> {
    for attempt in 0..=backoff.max_retries {
        match fetcher.fetch_detail(source, url).await {
            Ok(document) => return Ok(document),
            Err(err) if err.is_timeout() && attempt < backoff.max_retries => {
                let delay = backoff.jittered_delay_for_attempt(attempt);
                warn!(
                    url,
                    attempt = attempt + 1,
                    max_retries = backoff.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "timeout fetching detail resource, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
    unreachable!("retry loop returns on final attempt")
}

/// Merge extracted attributes into the listing. The detail page's composed
/// address is authoritative for `location` when present.
fn merge_detail_fields(listing: &mut Listing, fields: BTreeMap<String, JsonValue>) {
    if let Some(JsonValue::String(location)) = fields.get("location") {
        if location != UNAVAILABLE && !location.is_empty() {
            listing.location = location.clone();
        }
    }
    for (key, value) in fields {
        listing.set_detail(key, value);
    }
}
