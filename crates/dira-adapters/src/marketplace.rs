//! Marketplace adapter: listings embedded in page scripts, details fetched
//! per listing through its share URI.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dira_core::{parse_price, Listing, SourceType, UNAVAILABLE};
use dira_storage::HttpFetcher;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info};

use crate::enrich::{enrich_listings, DetailExtractor, EnrichmentOutcome};
use crate::payload::{
    get_array, get_f64, get_i64, get_path, get_str, locate_payload, DETAIL_PAGE_QUERY,
    LISTING_FEED_QUERY,
};
use crate::{extract_embedded_blobs, AdapterContext, AdapterError, SourceAdapter};

const MARKETPLACE_BASE_URL: &str = "https://www.facebook.com/marketplace/";

static ROOMS_FROM_UNIT_INFO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)\s*beds?").expect("rooms pattern compiles"));

#[derive(Debug, Clone)]
pub struct MarketplaceFilters {
    pub min_price: i64,
    pub max_price: i64,
    pub min_bedrooms: u32,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: u32,
}

impl Default for MarketplaceFilters {
    fn default() -> Self {
        // Central Tel Aviv, matching the reference deployment.
        Self {
            min_price: 3000,
            max_price: 10000,
            min_bedrooms: 2,
            latitude: 32.0853,
            longitude: 34.7818,
            radius_m: 5000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarketplaceAdapter {
    filters: MarketplaceFilters,
}

impl MarketplaceAdapter {
    pub fn new(config: &crate::FilterConfig) -> Self {
        let defaults = MarketplaceFilters::default();
        Self {
            filters: MarketplaceFilters {
                min_price: config.min_price.unwrap_or(defaults.min_price),
                max_price: config.max_price.unwrap_or(defaults.max_price),
                min_bedrooms: config.min_bedrooms.unwrap_or(defaults.min_bedrooms),
                latitude: config.latitude.unwrap_or(defaults.latitude),
                longitude: config.longitude.unwrap_or(defaults.longitude),
                radius_m: config.radius_m.unwrap_or(defaults.radius_m),
            },
        }
    }

    fn listings_url(&self) -> String {
        format!(
            "{MARKETPLACE_BASE_URL}telaviv/propertyrentals?minPrice={}&maxPrice={}&minBedrooms={}&exact=false&latitude={}&longitude={}&radius={}",
            self.filters.min_price,
            self.filters.max_price,
            self.filters.min_bedrooms,
            self.filters.latitude,
            self.filters.longitude,
            self.filters.radius_m,
        )
    }
}

#[async_trait]
impl SourceAdapter for MarketplaceAdapter {
    fn source_type(&self) -> SourceType {
        SourceType::Marketplace
    }

    async fn fetch_listings(
        &self,
        http: Arc<HttpFetcher>,
        ctx: &AdapterContext,
    ) -> Result<Vec<Listing>, AdapterError> {
        let url = self.listings_url();
        info!(run_id = %ctx.run_id, url, "fetching marketplace listings page");

        let page = http
            .fetch_document(SourceType::Marketplace.as_str(), &url)
            .await?;
        let candidates = extract_embedded_blobs(&page.body, &url)?;
        debug!(candidates = candidates.len(), "extracted embedded payload blobs");

        let stories = locate_payload(&candidates, &LISTING_FEED_QUERY)?;
        let edges = get_array(&stories, &["edges"]).cloned().unwrap_or_default();

        let mut listings: Vec<Listing> = edges
            .iter()
            .map(|edge| normalize_edge(edge, ctx))
            .collect();
        info!(count = listings.len(), "extracted marketplace listings");

        let outcomes = enrich_listings(
            http,
            Arc::new(MarketplaceDetailExtractor),
            SourceType::Marketplace,
            &mut listings,
            &ctx.enrichment,
        )
        .await?;
        let enriched = outcomes.iter().filter(|o| o.is_enriched()).count();
        let failed = outcomes
            .iter()
            .filter(|o| matches!(o, EnrichmentOutcome::Failed(_)))
            .count();
        info!(enriched, failed, total = listings.len(), "marketplace enrichment complete");

        Ok(listings)
    }
}

fn normalize_edge(edge: &JsonValue, ctx: &AdapterContext) -> Listing {
    let item_path = &["node", "for_sale_item"];
    let id = get_str(edge, &["node", "for_sale_item", "id"])
        .unwrap_or(UNAVAILABLE)
        .to_string();
    let formatted_price =
        get_str(edge, &["node", "for_sale_item", "formatted_price", "text"]).unwrap_or(UNAVAILABLE);
    let share_uri = get_str(edge, &["node", "for_sale_item", "share_uri"])
        .filter(|uri| *uri != UNAVAILABLE)
        .map(str::to_string);

    let images: Vec<JsonValue> = get_array(edge, &["node", "for_sale_item", "listing_photos"])
        .map(|photos| {
            photos
                .iter()
                .filter_map(|photo| get_str(photo, &["image", "uri"]))
                .map(|uri| JsonValue::String(uri.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let mut detail_fields = BTreeMap::new();
    detail_fields.insert(
        "formatted_price".to_string(),
        JsonValue::String(formatted_price.to_string()),
    );
    detail_fields.insert("images".to_string(), JsonValue::Array(images));
    if let Some(item) = get_path(edge, item_path) {
        if let Some(lat) = get_f64(item, &["location", "latitude"]) {
            detail_fields.insert("latitude".to_string(), json!(lat));
        }
        if let Some(lng) = get_f64(item, &["location", "longitude"]) {
            detail_fields.insert("longitude".to_string(), json!(lng));
        }
    }

    Listing {
        id,
        source_type: SourceType::Marketplace,
        price: parse_price(formatted_price),
        // The listing feed carries no address; the detail page fills it in.
        location: String::new(),
        resource_url: share_uri.clone().unwrap_or_default(),
        detail_resource: share_uri,
        detail_fields,
        fetched_at: ctx.fetched_at,
    }
}

/// Extracts the secondary attribute set from a detail page document.
pub struct MarketplaceDetailExtractor;

impl DetailExtractor for MarketplaceDetailExtractor {
    fn extract(
        &self,
        document: &str,
        listing_id: &str,
    ) -> Result<BTreeMap<String, JsonValue>, AdapterError> {
        let candidates = extract_embedded_blobs(document, listing_id)?;
        let details = locate_payload(&candidates, &DETAIL_PAGE_QUERY)?;

        let Some(target) = details.get("target").filter(|t| t.is_object()) else {
            return Err(AdapterError::Shape {
                source: SourceType::Marketplace,
                reason: format!("product details for listing {listing_id} have no target object"),
            });
        };

        let description = get_str(target, &["redacted_description", "text"]).unwrap_or(UNAVAILABLE);
        let city = get_str(target, &["location", "reverse_geocode_detailed", "city"])
            .unwrap_or(UNAVAILABLE);
        let street = get_str(target, &["home_address", "street"]).unwrap_or(UNAVAILABLE);
        let full_address = if street != UNAVAILABLE && city != UNAVAILABLE {
            format!("{street}, {city}")
        } else {
            UNAVAILABLE.to_string()
        };

        let delivery_types = get_array(target, &["delivery_types"])
            .cloned()
            .unwrap_or_default();
        let unit_room_info = get_str(target, &["unit_room_info"]).unwrap_or(UNAVAILABLE);
        let rooms = ROOMS_FROM_UNIT_INFO
            .captures(unit_room_info)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| UNAVAILABLE.to_string());
        let comments_count = get_i64(target, &["marketplace_comments", "total_count"])
            .map(|n| json!(n))
            .unwrap_or_else(|| json!(UNAVAILABLE));

        let mut fields = BTreeMap::new();
        fields.insert("description".to_string(), json!(description));
        fields.insert("full_address".to_string(), json!(full_address));
        fields.insert("location".to_string(), json!(full_address));
        fields.insert(
            "delivery_types".to_string(),
            JsonValue::Array(delivery_types),
        );
        fields.insert("unit_room_info".to_string(), json!(unit_room_info));
        fields.insert("rooms".to_string(), json!(rooms));
        fields.insert("comments_count".to_string(), comments_count);
        Ok(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dira_storage::DelayRange;

    fn ctx() -> AdapterContext {
        AdapterContext::new(DelayRange::none(), crate::EnrichmentConfig::default())
    }

    fn sample_edge() -> JsonValue {
        json!({
            "node": {
                "for_sale_item": {
                    "id": "987654321",
                    "formatted_price": {"text": "₪6,500 / Month"},
                    "share_uri": "https://www.facebook.com/share/abc123",
                    "location": {"latitude": 32.08, "longitude": 34.78},
                    "listing_photos": [
                        {"image": {"uri": "https://img.example/1.jpg"}},
                        {"image": {"uri": "https://img.example/2.jpg"}},
                        {"image": {}}
                    ]
                }
            }
        })
    }

    #[test]
    fn edges_normalize_into_listings() {
        let listing = normalize_edge(&sample_edge(), &ctx());
        assert_eq!(listing.id, "987654321");
        assert_eq!(listing.price, Some(6500));
        assert_eq!(
            listing.detail_resource.as_deref(),
            Some("https://www.facebook.com/share/abc123")
        );
        assert_eq!(listing.resource_url, "https://www.facebook.com/share/abc123");
        let images = listing.detail_fields.get("images").unwrap();
        assert_eq!(images.as_array().unwrap().len(), 2);
        assert_eq!(
            listing.detail_fields.get("formatted_price"),
            Some(&json!("₪6,500 / Month"))
        );
    }

    #[test]
    fn sparse_edges_still_normalize_with_sentinels() {
        let listing = normalize_edge(&json!({"node": {}}), &ctx());
        assert_eq!(listing.id, UNAVAILABLE);
        assert_eq!(listing.price, None);
        assert!(listing.detail_resource.is_none());
    }

    fn detail_document(target: JsonValue) -> String {
        let details = json!({
            "__bbox": {
                "result": {
                    "data": {
                        "viewer": {
                            "marketplace_product_details_page": {"target": target}
                        }
                    }
                }
            }
        });
        let inner = json!([[
            "Module", "handler", [],
            ["adp_MarketplacePDPContainerQueryRelayPreloader_1", details]
        ]]);
        let blob = json!({
            "require": [["Outer", "handler", [], [{"__bbox": {"require": inner}}]]]
        });
        format!("<html><script data-sjs>{blob}</script></html>")
    }

    #[test]
    fn detail_extraction_composes_address_and_rooms() {
        let document = detail_document(json!({
            "redacted_description": {"text": "Sunny flat near the beach"},
            "location": {"reverse_geocode_detailed": {"city": "Tel Aviv"}},
            "home_address": {"street": "Frishman 20"},
            "unit_room_info": "3 beds · 1 bath",
            "delivery_types": ["IN_PERSON"],
            "marketplace_comments": {"total_count": 4}
        }));

        let fields = MarketplaceDetailExtractor
            .extract(&document, "987654321")
            .expect("extracted");
        assert_eq!(fields.get("description"), Some(&json!("Sunny flat near the beach")));
        assert_eq!(fields.get("location"), Some(&json!("Frishman 20, Tel Aviv")));
        assert_eq!(fields.get("rooms"), Some(&json!("3")));
        assert_eq!(fields.get("comments_count"), Some(&json!(4)));
    }

    #[test]
    fn missing_detail_attributes_default_to_sentinel() {
        let document = detail_document(json!({}));
        let fields = MarketplaceDetailExtractor
            .extract(&document, "987654321")
            .expect("extracted");
        assert_eq!(fields.get("description"), Some(&json!(UNAVAILABLE)));
        assert_eq!(fields.get("location"), Some(&json!(UNAVAILABLE)));
        assert_eq!(fields.get("rooms"), Some(&json!(UNAVAILABLE)));
        assert_eq!(fields.get("comments_count"), Some(&json!(UNAVAILABLE)));
    }

    #[test]
    fn detail_page_without_target_is_shape_drift() {
        let document = detail_document(JsonValue::Null);
        let err = MarketplaceDetailExtractor
            .extract(&document, "987654321")
            .unwrap_err();
        assert!(matches!(err, AdapterError::Shape { .. }));
    }

    #[test]
    fn listings_url_carries_all_filters() {
        let adapter = MarketplaceAdapter::new(&crate::FilterConfig::default());
        let url = adapter.listings_url();
        assert!(url.contains("minPrice=3000"));
        assert!(url.contains("maxPrice=10000"));
        assert!(url.contains("minBedrooms=2"));
        assert!(url.contains("radius=5000"));
    }
}
