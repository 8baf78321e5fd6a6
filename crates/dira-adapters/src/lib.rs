//! Source adapter contracts and concrete site adapters.
//!
//! Each adapter owns one origin site: query construction, paging, payload
//! location and normalization into [`dira_core::Listing`] values. Rate-limit
//! and access-denied conditions surface as distinguishable errors so the
//! pipeline can abort a run instead of silently dropping data.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dira_core::{Listing, SourceType};
use dira_storage::{DelayRange, FetchError, HttpFetcher};
use scraper::{Html, Selector};
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

pub mod enrich;
pub mod groups;
pub mod marketplace;
pub mod payload;
pub mod portal;

pub use enrich::{DetailExtractor, DetailFetcher, EnrichmentConfig, EnrichmentOutcome};
pub use payload::{LocateError, PayloadQuery};

pub const CRATE_NAME: &str = "dira-adapters";

/// Attribute marking the script tags that embed serialized payload blobs.
const EMBEDDED_BLOB_SELECTOR: &str = "script[data-sjs]";
const NEXT_DATA_SELECTOR: &str = "script#__NEXT_DATA__";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Locate(#[from] LocateError),
    #[error("no embedded payload blobs found in document from {url}")]
    NoCandidates { url: String },
    #[error("unexpected {source} response shape: {reason}")]
    Shape {
        source: SourceType,
        reason: String,
    },
    #[error("api error from {url}: {message}")]
    Api { url: String, message: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AdapterError {
    /// Fatal errors (access denied, rate limited) abort the enclosing run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AdapterError::Fetch(err) if err.is_fatal())
    }
}

/// Run-scoped values shared by every adapter in one cycle.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    pub delay: DelayRange,
    pub enrichment: EnrichmentConfig,
}

impl AdapterContext {
    pub fn new(delay: DelayRange, enrichment: EnrichmentConfig) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
            delay,
            enrichment,
        }
    }
}

/// One origin site. Internally responsible for paging, query construction
/// and HTTP-status handling; returns fully normalized (and, where the source
/// supports it, enriched) listings.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_type(&self) -> SourceType;

    async fn fetch_listings(
        &self,
        http: Arc<HttpFetcher>,
        ctx: &AdapterContext,
    ) -> Result<Vec<Listing>, AdapterError>;
}

/// Extract the ordered candidate payload blobs (`script[data-sjs]` bodies)
/// from a fetched page. An empty result is an error: a page without any
/// embedded blobs means the source changed shape.
pub fn extract_embedded_blobs(html: &str, url: &str) -> Result<Vec<String>, AdapterError> {
    let document = Html::parse_document(html);
    let selector =
        Selector::parse(EMBEDDED_BLOB_SELECTOR).expect("embedded blob selector is valid");
    let blobs: Vec<String> = document
        .select(&selector)
        .map(|tag| tag.text().collect::<String>().trim().to_string())
        .filter(|text| !text.is_empty())
        .collect();
    if blobs.is_empty() {
        return Err(AdapterError::NoCandidates {
            url: url.to_string(),
        });
    }
    Ok(blobs)
}

/// Extract the `__NEXT_DATA__` bootstrap script content, if present.
pub fn extract_next_data(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse(NEXT_DATA_SELECTOR).expect("next-data selector is valid");
    document
        .select(&selector)
        .next()
        .map(|tag| tag.text().collect::<String>().trim().to_string())
        .filter(|text| !text.is_empty())
}

/// One entry of the source registry (`sources.yaml`).
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_type: SourceType,
    pub enabled: bool,
    #[serde(default)]
    pub filters: FilterConfig,
}

/// Filter knobs shared across adapters; each adapter reads the subset it
/// understands and falls back to its own defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterConfig {
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
    pub min_rooms: Option<f64>,
    pub max_rooms: Option<f64>,
    pub min_bedrooms: Option<u32>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub radius_m: Option<u32>,
    pub limit: Option<u32>,
    pub is_shared_apartment: Option<bool>,
    pub is_sublet: Option<bool>,
    pub cities: Option<Vec<u32>>,
    pub structured_locations: Option<Vec<groups::StructuredLocation>>,
}

/// Build the adapter for one registry entry.
pub fn adapter_for_source(config: &SourceConfig) -> Box<dyn SourceAdapter> {
    match config.source_type {
        SourceType::Portal => Box::new(portal::PortalAdapter::new(&config.filters)),
        SourceType::Marketplace => Box::new(marketplace::MarketplaceAdapter::new(&config.filters)),
        SourceType::Groups => Box::new(groups::GroupsAdapter::new(&config.filters)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_blobs_are_extracted_in_document_order() {
        let html = r#"
            <html><body>
            <script data-sjs>{"require": [1]}</script>
            <script>ignored()</script>
            <script data-sjs>{"require": [2]}</script>
            </body></html>
        "#;
        let blobs = extract_embedded_blobs(html, "https://example.test").expect("blobs");
        assert_eq!(blobs, vec!["{\"require\": [1]}", "{\"require\": [2]}"]);
    }

    #[test]
    fn page_without_blobs_is_an_error() {
        let err =
            extract_embedded_blobs("<html><body>nope</body></html>", "https://example.test")
                .unwrap_err();
        assert!(matches!(err, AdapterError::NoCandidates { .. }));
    }

    #[test]
    fn next_data_script_is_found_by_id() {
        let html = r#"<script id="__NEXT_DATA__" type="application/json">{"buildId":"b123"}</script>"#;
        assert_eq!(
            extract_next_data(html).as_deref(),
            Some(r#"{"buildId":"b123"}"#)
        );
        assert_eq!(extract_next_data("<html></html>"), None);
    }

    #[test]
    fn registry_builds_an_adapter_per_source_type() {
        for source_type in [SourceType::Portal, SourceType::Marketplace, SourceType::Groups] {
            let config = SourceConfig {
                source_type,
                enabled: true,
                filters: FilterConfig::default(),
            };
            assert_eq!(adapter_for_source(&config).source_type(), source_type);
        }
    }
}
