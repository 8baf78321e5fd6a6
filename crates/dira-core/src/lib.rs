//! Core domain model for Dira: normalized listings and content fingerprints.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "dira-core";

/// Sentinel used for detail attributes a source did not provide.
pub const UNAVAILABLE: &str = "N/A";

/// Origin site of a listing. One variant per registered source adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Portal,
    Marketplace,
    Groups,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Portal => "portal",
            SourceType::Marketplace => "marketplace",
            SourceType::Groups => "groups",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for SourceType {}

/// A normalized rental listing from one source.
///
/// Created by adapter normalizers, augmented in place by the enrichment
/// orchestrator, immutable afterwards. `id` is the source-native token and
/// may rotate across fetches for the same physical listing; identity across
/// cycles comes from [`Fingerprint`], not `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub source_type: SourceType,
    pub price: Option<i64>,
    pub location: String,
    pub resource_url: String,
    #[serde(default)]
    pub detail_resource: Option<String>,
    #[serde(default)]
    pub detail_fields: BTreeMap<String, JsonValue>,
    pub fetched_at: DateTime<Utc>,
}

impl Listing {
    /// Insert a detail attribute, overwriting any earlier value.
    pub fn set_detail(&mut self, key: impl Into<String>, value: JsonValue) {
        self.detail_fields.insert(key.into(), value);
    }
}

/// Content-derived identity key, stable across source-rotated identifiers.
///
/// Hex-encoded SHA-256 over a canonical JSON document of the listing's price
/// and location. `id` and `resource_url` are deliberately excluded so that a
/// token rotation on the source side does not produce a spurious "new"
/// listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Fingerprint {
    fn from(value: String) -> Self {
        Fingerprint(value)
    }
}

pub fn fingerprint(listing: &Listing) -> Fingerprint {
    // serde_json's default map is key-ordered, so the digest input is
    // deterministic regardless of field insertion order.
    let canonical = serde_json::json!({
        "location": listing.location,
        "price": listing.price,
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    Fingerprint(hex::encode(hasher.finalize()))
}

/// Parse a freeform formatted price string ("₪5,200", "5 200 ILS / month")
/// into a numeric value. Unparsable input yields `None`, never an error.
///
/// Semantics follow the reference sources: every character except ASCII
/// digits and thousands-separator commas is dropped, then commas are
/// removed and the remainder parsed as an integer.
pub fn parse_price(text: &str) -> Option<i64> {
    let kept: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ',')
        .collect();
    let digits = kept.replace(',', "");
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Compose a unified free-text location from optional street and city parts.
pub fn compose_location(street: &str, city: &str) -> String {
    match (street.is_empty(), city.is_empty()) {
        (false, false) => format!("{street}, {city}"),
        (false, true) => street.to_string(),
        (true, false) => city.to_string(),
        (true, true) => String::new(),
    }
}
