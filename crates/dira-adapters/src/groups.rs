//! Groups adapter: an aggregator API over community group postings.
//!
//! Unlike the embedded-payload sources this one speaks plain JSON over a
//! paged REST endpoint. Postings are freeform, so normalization tolerates
//! string-or-number prices and assembles an address from whichever of the
//! hood/area/city parts the aggregator extracted.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dira_core::{parse_price, Listing, SourceType, UNAVAILABLE};
use dira_storage::{url_with_params, HttpFetcher, SnapshotStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

use crate::payload::{get_array, get_path, get_str};
use crate::{AdapterContext, AdapterError, SourceAdapter};

const API_BASE_URL: &str = "https://rentlyfly.ai/api/listings";

/// Neighborhood filter understood by the aggregator API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredLocation {
    pub hood: String,
    pub area: String,
}

fn default_locations() -> Vec<StructuredLocation> {
    ["לב העיר", "הצפון הישן", "כרם התימנים", "פלורנטין"]
        .into_iter()
        .map(|hood| StructuredLocation {
            hood: hood.to_string(),
            area: "תל אביב - יפו".to_string(),
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct GroupsFilters {
    pub min_price: i64,
    pub max_price: i64,
    pub min_rooms: f64,
    pub max_rooms: f64,
    pub limit: u32,
    pub is_shared_apartment: bool,
    pub is_sublet: bool,
    pub structured_locations: Vec<StructuredLocation>,
}

impl Default for GroupsFilters {
    fn default() -> Self {
        Self {
            min_price: 3000,
            max_price: 10000,
            min_rooms: 2.0,
            max_rooms: 4.0,
            limit: 50,
            is_shared_apartment: false,
            is_sublet: false,
            structured_locations: default_locations(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GroupsAdapter {
    filters: GroupsFilters,
}

impl GroupsAdapter {
    pub fn new(config: &crate::FilterConfig) -> Self {
        let defaults = GroupsFilters::default();
        Self {
            filters: GroupsFilters {
                min_price: config.min_price.unwrap_or(defaults.min_price),
                max_price: config.max_price.unwrap_or(defaults.max_price),
                min_rooms: config.min_rooms.unwrap_or(defaults.min_rooms),
                max_rooms: config.max_rooms.unwrap_or(defaults.max_rooms),
                limit: config.limit.unwrap_or(defaults.limit),
                is_shared_apartment: config
                    .is_shared_apartment
                    .unwrap_or(defaults.is_shared_apartment),
                is_sublet: config.is_sublet.unwrap_or(defaults.is_sublet),
                structured_locations: config
                    .structured_locations
                    .clone()
                    .unwrap_or(defaults.structured_locations),
            },
        }
    }

    fn page_url(&self, page: u64) -> Result<String, AdapterError> {
        let locations = serde_json::to_string(&self.filters.structured_locations)
            .map_err(|err| AdapterError::Other(err.into()))?;
        let params = [
            ("minPrice", self.filters.min_price.to_string()),
            ("maxPrice", self.filters.max_price.to_string()),
            ("minRooms", self.filters.min_rooms.to_string()),
            ("maxRooms", self.filters.max_rooms.to_string()),
            ("limit", self.filters.limit.to_string()),
            (
                "isSharedApartment",
                self.filters.is_shared_apartment.to_string(),
            ),
            ("isSublet", self.filters.is_sublet.to_string()),
            ("structuredLocations", locations),
            ("page", page.to_string()),
        ];
        Ok(url_with_params(API_BASE_URL, &params)?)
    }
}

#[async_trait]
impl SourceAdapter for GroupsAdapter {
    fn source_type(&self) -> SourceType {
        SourceType::Groups
    }

    async fn fetch_listings(
        &self,
        http: Arc<HttpFetcher>,
        ctx: &AdapterContext,
    ) -> Result<Vec<Listing>, AdapterError> {
        let mut listings = Vec::new();
        let mut page = 1u64;
        loop {
            ctx.delay.pause().await;
            let url = self.page_url(page)?;
            info!(run_id = %ctx.run_id, page, "fetching groups api page");

            let doc = http.fetch_document(SourceType::Groups.as_str(), &url).await?;
            let body: JsonValue =
                serde_json::from_str(&doc.body).map_err(|err| AdapterError::Shape {
                    source: SourceType::Groups,
                    reason: format!("api page {page} is not valid JSON: {err}"),
                })?;

            // The api reports failures inside a 200 body.
            if let Some(message) = get_str(&body, &["error"]) {
                return Err(AdapterError::Api {
                    url,
                    message: message.to_string(),
                });
            }

            let Some(data) = get_array(&body, &["data"]).filter(|d| !d.is_empty()) else {
                warn!(page, "groups api returned an empty page, stopping");
                break;
            };
            listings.extend(data.iter().map(|item| normalize_posting(item, ctx)));

            let has_more = get_path(&body, &["pagination", "hasMore"])
                .and_then(JsonValue::as_bool)
                .unwrap_or(false);
            if !has_more {
                break;
            }
            page += 1;
        }
        info!(count = listings.len(), pages = page, "extracted groups listings");
        Ok(listings)
    }
}

fn normalize_posting(item: &JsonValue, ctx: &AdapterContext) -> Listing {
    let id = posting_id(item);
    let resource_url = get_str(item, &["url"])
        .or_else(|| get_str(item, &["postUrl"]))
        .unwrap_or_default()
        .to_string();

    let mut detail_fields = BTreeMap::new();
    let copy_keys = [
        ("description", &["description"][..]),
        ("formatted_price", &["price"]),
        ("rooms", &["roomsAvailable"]),
        ("images", &["photos"]),
        ("thumbnail_url", &["thumbnailUrl"]),
        ("time_posted", &["timePosted"]),
        ("phones", &["phones"]),
        ("user", &["user"]),
        ("group", &["group"]),
    ];
    for (key, path) in copy_keys {
        if let Some(value) = get_path(item, path) {
            detail_fields.insert(key.to_string(), value.clone());
        }
    }
    detail_fields.insert(
        "is_shared_apartment".to_string(),
        json!(get_path(item, &["isSharedApartment"])
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)),
    );
    detail_fields.insert(
        "is_sublet".to_string(),
        json!(get_path(item, &["isSublet"])
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)),
    );

    Listing {
        id,
        source_type: SourceType::Groups,
        price: posting_price(item),
        location: posting_address(item),
        resource_url,
        detail_resource: None,
        detail_fields,
        fetched_at: ctx.fetched_at,
    }
}

/// Some postings arrive without a stable identifier; fall back to a content
/// hash so reconciliation still has something to store.
fn posting_id(item: &JsonValue) -> String {
    match get_path(item, &["id"]) {
        Some(JsonValue::String(id)) if !id.is_empty() => id.clone(),
        Some(JsonValue::Number(id)) => id.to_string(),
        _ => {
            let digest = SnapshotStore::sha256_hex(item.to_string().as_bytes());
            format!("posting-{}", &digest[..12])
        }
    }
}

/// Prices arrive as a number or a formatted string depending on how the
/// aggregator parsed the posting.
fn posting_price(item: &JsonValue) -> Option<i64> {
    match get_path(item, &["price"])? {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(text) => parse_price(text),
        _ => None,
    }
}

fn posting_address(item: &JsonValue) -> String {
    let parts = [
        get_str(item, &["street"]),
        get_str(item, &["structuredLocation", "hood"]),
        get_str(item, &["structuredLocation", "area"]),
        get_str(item, &["city"]),
    ];
    let kept: Vec<&str> = parts
        .into_iter()
        .flatten()
        .filter(|part| !part.is_empty() && *part != UNAVAILABLE)
        .collect();
    kept.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use dira_storage::DelayRange;

    fn ctx() -> AdapterContext {
        AdapterContext::new(DelayRange::none(), crate::EnrichmentConfig::default())
    }

    fn sample_posting() -> JsonValue {
        json!({
            "id": 44211,
            "url": "https://example.test/groups/post/44211",
            "price": "₪5,800",
            "street": "שינקין 12",
            "structuredLocation": {"hood": "לב העיר", "area": "תל אביב - יפו"},
            "description": "דירת 3 חדרים משופצת",
            "roomsAvailable": 3,
            "photos": ["https://img.example/a.jpg"],
            "timePosted": "2026-08-29T18:00:00Z",
            "isSublet": true
        })
    }

    #[test]
    fn postings_normalize_with_string_prices() {
        let listing = normalize_posting(&sample_posting(), &ctx());
        assert_eq!(listing.id, "44211");
        assert_eq!(listing.price, Some(5800));
        assert_eq!(listing.location, "שינקין 12, לב העיר, תל אביב - יפו");
        assert_eq!(listing.resource_url, "https://example.test/groups/post/44211");
        assert_eq!(listing.detail_fields.get("rooms"), Some(&json!(3)));
        assert_eq!(listing.detail_fields.get("is_sublet"), Some(&json!(true)));
        assert_eq!(
            listing.detail_fields.get("is_shared_apartment"),
            Some(&json!(false))
        );
    }

    #[test]
    fn numeric_prices_pass_through() {
        assert_eq!(posting_price(&json!({"price": 6200})), Some(6200));
        assert_eq!(posting_price(&json!({"price": "no price"})), None);
        assert_eq!(posting_price(&json!({})), None);
    }

    #[test]
    fn missing_id_falls_back_to_content_hash() {
        let a = posting_id(&json!({"description": "same"}));
        let b = posting_id(&json!({"description": "same"}));
        let c = posting_id(&json!({"description": "different"}));
        assert!(a.starts_with("posting-"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn address_skips_unavailable_parts() {
        let item = json!({
            "street": "N/A",
            "structuredLocation": {"hood": "פלורנטין", "area": ""},
            "city": "תל אביב"
        });
        assert_eq!(posting_address(&item), "פלורנטין, תל אביב");
        assert_eq!(posting_address(&json!({})), "");
    }

    #[test]
    fn page_url_encodes_filters_and_locations() {
        let adapter = GroupsAdapter::new(&crate::FilterConfig::default());
        let url = adapter.page_url(2).expect("url builds");
        assert!(url.starts_with("https://rentlyfly.ai/api/listings?"));
        assert!(url.contains("minPrice=3000"));
        assert!(url.contains("isSublet=false"));
        assert!(url.contains("page=2"));
        assert!(url.contains("structuredLocations=%5B%7B%22hood%22"));
    }

    #[test]
    fn default_locations_cover_central_neighborhoods() {
        let defaults = default_locations();
        assert_eq!(defaults.len(), 4);
        assert!(defaults.iter().all(|loc| loc.area == "תל אביב - יפו"));
    }
}
