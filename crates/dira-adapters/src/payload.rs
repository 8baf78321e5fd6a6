//! Payload Locator: tolerant tree search over untyped nested JSON blobs.
//!
//! Source pages embed their data inside script tags as a manifest of
//! dynamically-keyed module payloads. The outer shape varies harmlessly
//! between fetches (the nested manifest is sometimes attached one level
//! deeper), so every step of the walk is guarded; only a non-deserializable
//! candidate or total exhaustion is an error.

use serde_json::Value as JsonValue;
use thiserror::Error;

/// Top-level and nested manifest lists share this key.
const MANIFEST_KEY: &str = "require";

/// Alternate locations of the nested manifest inside a container entry.
const NESTED_MANIFEST_PATHS: &[&[&str]] = &[&["__bbox", MANIFEST_KEY], &[MANIFEST_KEY]];

/// One named search through the manifest: match module keys by prefix, then
/// descend a fixed chain of map lookups to the target value.
#[derive(Debug, Clone, Copy)]
pub struct PayloadQuery {
    pub key_prefix: &'static str,
    pub descent: &'static [&'static str],
}

/// Locates the rental-listing feed embedded in the listings page.
pub const LISTING_FEED_QUERY: PayloadQuery = PayloadQuery {
    key_prefix: "adp_CometMarketplaceRealEstateMapStoryQueryRelayPreloader_",
    descent: &[
        "__bbox",
        "result",
        "data",
        "viewer",
        "marketplace_rentals_map_view_stories",
    ],
};

/// Locates the product-details payload embedded in a listing's detail page.
pub const DETAIL_PAGE_QUERY: PayloadQuery = PayloadQuery {
    key_prefix: "adp_MarketplacePDPContainerQueryRelayPreloader_",
    descent: &[
        "__bbox",
        "result",
        "data",
        "viewer",
        "marketplace_product_details_page",
    ],
};

#[derive(Debug, Error)]
pub enum LocateError {
    #[error("candidate blob {index} is not valid JSON: {source}")]
    Decode {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("no payload matching key prefix {prefix:?} across {candidates} candidate blob(s)")]
    NotFound {
        prefix: &'static str,
        candidates: usize,
    },
}

/// Search the ordered candidate blobs for the query's target value.
///
/// A deserialization failure on any candidate aborts the whole search: a
/// malformed blob means the source's page shape drifted, which must surface
/// rather than be skipped. Exhausting all candidates without a match fails
/// with the sought prefix for diagnosis.
pub fn locate_payload(
    candidates: &[String],
    query: &PayloadQuery,
) -> Result<JsonValue, LocateError> {
    for (index, text) in candidates.iter().enumerate() {
        let parsed: JsonValue =
            serde_json::from_str(text).map_err(|source| LocateError::Decode { index, source })?;
        if let Some(found) = search_manifest(&parsed, query) {
            return Ok(found.clone());
        }
    }
    Err(LocateError::NotFound {
        prefix: query.key_prefix,
        candidates: candidates.len(),
    })
}

fn search_manifest<'a>(blob: &'a JsonValue, query: &PayloadQuery) -> Option<&'a JsonValue> {
    let manifest = blob.get(MANIFEST_KEY)?.as_array()?;
    for entry in manifest {
        let Some(container) = manifest_entry_payload(entry) else {
            continue;
        };
        let Some(nested) = nested_manifest(container) else {
            continue;
        };
        for inner in nested {
            let Some((key, data)) = keyed_entry(inner) else {
                continue;
            };
            if !key.starts_with(query.key_prefix) {
                continue;
            }
            if let Some(target) = get_path(data, query.descent) {
                return Some(target);
            }
        }
    }
    None
}

/// A manifest entry is a list of length >= 4 whose 4th element is a
/// non-empty list; its first member is the container.
fn manifest_entry_payload(entry: &JsonValue) -> Option<&JsonValue> {
    let list = entry.as_array()?;
    if list.len() < 4 {
        return None;
    }
    list[3].as_array()?.first()
}

fn nested_manifest(container: &JsonValue) -> Option<&Vec<JsonValue>> {
    NESTED_MANIFEST_PATHS
        .iter()
        .find_map(|path| get_path(container, path)?.as_array())
}

/// An inner entry exposes `[key, data]` as the first two members of its 4th
/// element.
fn keyed_entry(entry: &JsonValue) -> Option<(&str, &JsonValue)> {
    let list = entry.as_array()?;
    if list.len() < 4 {
        return None;
    }
    let payload = list[3].as_array()?;
    if payload.len() < 2 {
        return None;
    }
    Some((payload[0].as_str()?, &payload[1]))
}

// Guarded accessors: a missing step is "no value", never an error.

pub fn get_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut current = value;
    for segment in path {
        current = current.get(*segment)?;
    }
    Some(current)
}

pub fn get_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    get_path(value, path)?.as_str()
}

pub fn get_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    get_path(value, path)?.as_i64()
}

pub fn get_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    get_path(value, path)?.as_f64()
}

pub fn get_array<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a Vec<JsonValue>> {
    get_path(value, path)?.as_array()
}
