//! Portal adapter: JSON feed behind a build-versioned data endpoint.
//!
//! The portal renders listings from a versioned data route whose path embeds
//! a build identifier that rotates on every site deploy. Each run discovers
//! the current identifier from the rent page's bootstrap script, then walks
//! the paged feed.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dira_core::{compose_location, Listing, SourceType};
use dira_storage::HttpFetcher;
use serde_json::{json, Value as JsonValue};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::payload::{get_array, get_i64, get_path, get_str};
use crate::{extract_next_data, AdapterContext, AdapterError, SourceAdapter};

const PORTAL_BASE_URL: &str = "https://www.yad2.co.il/realestate";

#[derive(Debug, Clone)]
pub struct PortalFilters {
    pub min_price: i64,
    pub max_price: i64,
    pub min_rooms: f64,
    pub max_rooms: f64,
    pub cities: Vec<u32>,
}

impl Default for PortalFilters {
    fn default() -> Self {
        Self {
            min_price: 3,
            max_price: 10000,
            min_rooms: 2.5,
            max_rooms: 4.0,
            // 5000 is the portal's Tel Aviv city code.
            cities: vec![5000],
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortalAdapter {
    filters: PortalFilters,
}

impl PortalAdapter {
    pub fn new(config: &crate::FilterConfig) -> Self {
        let defaults = PortalFilters::default();
        Self {
            filters: PortalFilters {
                min_price: config.min_price.unwrap_or(defaults.min_price),
                max_price: config.max_price.unwrap_or(defaults.max_price),
                min_rooms: config.min_rooms.unwrap_or(defaults.min_rooms),
                max_rooms: config.max_rooms.unwrap_or(defaults.max_rooms),
                cities: config.cities.clone().unwrap_or(defaults.cities),
            },
        }
    }

    fn rent_page_url(&self, city: u32) -> String {
        format!(
            "{PORTAL_BASE_URL}/rent?minPrice={}&maxPrice={}&minRooms={}&maxRooms={}&topArea=2&area=1&city={city}",
            self.filters.min_price, self.filters.max_price, self.filters.min_rooms, self.filters.max_rooms,
        )
    }

    fn feed_url(&self, build_id: &str, city: u32, page: u64) -> String {
        format!(
            "{PORTAL_BASE_URL}/_next/data/{build_id}/rent.json?minPrice={}&maxPrice={}&minRooms={}&maxRooms={}&topArea=2&area=1&city={city}&page={page}",
            self.filters.min_price, self.filters.max_price, self.filters.min_rooms, self.filters.max_rooms,
        )
    }
}

#[async_trait]
impl SourceAdapter for PortalAdapter {
    fn source_type(&self) -> SourceType {
        SourceType::Portal
    }

    async fn fetch_listings(
        &self,
        http: Arc<HttpFetcher>,
        ctx: &AdapterContext,
    ) -> Result<Vec<Listing>, AdapterError> {
        let mut listings = Vec::new();
        for &city in &self.filters.cities {
            let mut city_listings = self.fetch_city(Arc::clone(&http), ctx, city).await?;
            listings.append(&mut city_listings);
        }
        Ok(listings)
    }
}

impl PortalAdapter {
    async fn fetch_city(
        &self,
        http: Arc<HttpFetcher>,
        ctx: &AdapterContext,
        city: u32,
    ) -> Result<Vec<Listing>, AdapterError> {
        let build_id = self.discover_build_id(&http, city).await?;
        info!(run_id = %ctx.run_id, city, build_id, "resolved portal build id");

        // Page 1 first: it carries the pagination envelope.
        ctx.delay.pause().await;
        let first = self.fetch_feed_page(&http, &build_id, city, 1).await?;
        let total_pages =
            get_i64(&first, &["pageProps", "feed", "pagination", "totalPages"]).unwrap_or(1);
        let total_items = get_i64(&first, &["pageProps", "feed", "pagination", "total"]).unwrap_or(0);
        debug!(city, total_pages, total_items, "portal feed pagination");

        let mut pages: BTreeMap<u64, Vec<Listing>> = BTreeMap::new();
        pages.insert(1, feed_page_listings(&first, ctx));

        let mut tasks = JoinSet::new();
        for page in 2..=total_pages.max(1) as u64 {
            let adapter = self.clone();
            let http = Arc::clone(&http);
            let build_id = build_id.clone();
            let ctx = ctx.clone();
            tasks.spawn(async move {
                ctx.delay.pause().await;
                let feed = adapter.fetch_feed_page(&http, &build_id, city, page).await?;
                Ok::<_, AdapterError>((page, feed_page_listings(&feed, &ctx)))
            });
        }
        while let Some(joined) = tasks.join_next().await {
            let (page, page_listings) = joined
                .map_err(|err| AdapterError::Other(anyhow::anyhow!("page task panicked: {err}")))??;
            pages.insert(page, page_listings);
        }

        let listings: Vec<Listing> = pages.into_values().flatten().collect();
        if total_items > 0 && listings.len() as i64 != total_items {
            warn!(
                city,
                expected = total_items,
                got = listings.len(),
                "portal feed count differs from advertised total"
            );
        }
        info!(city, count = listings.len(), "extracted portal listings");
        Ok(listings)
    }

    /// Pull the current build identifier out of the rent page's bootstrap
    /// script. Its absence means the portal changed shape.
    async fn discover_build_id(
        &self,
        http: &HttpFetcher,
        city: u32,
    ) -> Result<String, AdapterError> {
        let url = self.rent_page_url(city);
        let page = http.fetch_document(SourceType::Portal.as_str(), &url).await?;
        let bootstrap = extract_next_data(&page.body).ok_or_else(|| AdapterError::Shape {
            source: SourceType::Portal,
            reason: format!("no bootstrap script in rent page {url}"),
        })?;
        let parsed: JsonValue =
            serde_json::from_str(&bootstrap).map_err(|err| AdapterError::Shape {
                source: SourceType::Portal,
                reason: format!("bootstrap script is not valid JSON: {err}"),
            })?;
        get_str(&parsed, &["buildId"])
            .map(str::to_string)
            .ok_or_else(|| AdapterError::Shape {
                source: SourceType::Portal,
                reason: "bootstrap script has no buildId".to_string(),
            })
    }

    async fn fetch_feed_page(
        &self,
        http: &HttpFetcher,
        build_id: &str,
        city: u32,
        page: u64,
    ) -> Result<JsonValue, AdapterError> {
        let url = self.feed_url(build_id, city, page);
        let doc = http.fetch_document(SourceType::Portal.as_str(), &url).await?;
        serde_json::from_str(&doc.body).map_err(|err| AdapterError::Shape {
            source: SourceType::Portal,
            reason: format!("feed page {page} is not valid JSON: {err}"),
        })
    }
}

fn feed_page_listings(feed: &JsonValue, ctx: &AdapterContext) -> Vec<Listing> {
    get_array(feed, &["pageProps", "feed", "private"])
        .map(|items| items.iter().map(|item| normalize_feed_item(item, ctx)).collect())
        .unwrap_or_default()
}

fn normalize_feed_item(item: &JsonValue, ctx: &AdapterContext) -> Listing {
    let token = get_str(item, &["token"]).unwrap_or_default().to_string();
    let city = get_str(item, &["address", "city", "text"]).unwrap_or_default();
    let street = get_str(item, &["address", "street", "text"]).unwrap_or_default();

    let mut detail_fields = BTreeMap::new();
    if let Some(rooms) = get_path(item, &["additionalDetails", "roomsCount"]) {
        detail_fields.insert("rooms".to_string(), json!(rooms.to_string()));
    }
    if let Some(size) = get_i64(item, &["additionalDetails", "squareMeter"]) {
        detail_fields.insert("size_sqm".to_string(), json!(size));
    }
    if let Some(floor) = get_path(item, &["address", "house", "floor"]) {
        detail_fields.insert("floor".to_string(), floor.clone());
    }
    if let Some(images) = get_array(item, &["metaData", "images"]) {
        detail_fields.insert("images".to_string(), JsonValue::Array(images.clone()));
    }
    if let Some(tags) = get_array(item, &["tags"]) {
        let names: Vec<JsonValue> = tags
            .iter()
            .filter_map(|tag| get_str(tag, &["name"]))
            .map(|name| JsonValue::String(name.to_string()))
            .collect();
        detail_fields.insert("tags".to_string(), JsonValue::Array(names));
    }
    if let Some(lat) = get_path(item, &["address", "coords", "lat"]) {
        detail_fields.insert("latitude".to_string(), lat.clone());
    }
    if let Some(lon) = get_path(item, &["address", "coords", "lon"]) {
        detail_fields.insert("longitude".to_string(), lon.clone());
    }

    Listing {
        id: token.clone(),
        source_type: SourceType::Portal,
        price: get_i64(item, &["price"]),
        location: compose_location(street, city),
        resource_url: format!("{PORTAL_BASE_URL}/item/{token}"),
        // The feed already carries every attribute the portal exposes.
        detail_resource: None,
        detail_fields,
        fetched_at: ctx.fetched_at,
    }
}
