//! End-to-end extraction from a rendered page document: pull the script
//! blobs out of the HTML, locate the listing feed among them, and walk the
//! payload down to individual listing attributes.

use dira_adapters::payload::{get_array, get_str, DETAIL_PAGE_QUERY, LISTING_FEED_QUERY};
use dira_adapters::{extract_embedded_blobs, AdapterError, DetailExtractor};
use dira_adapters::marketplace::MarketplaceDetailExtractor;
use serde_json::json;

fn feed_page_html() -> String {
    let stories = json!({
        "__bbox": {
            "result": {
                "data": {
                    "viewer": {
                        "marketplace_rentals_map_view_stories": {
                            "edges": [
                                {"node": {"for_sale_item": {
                                    "id": "111",
                                    "formatted_price": {"text": "₪5,500"},
                                    "share_uri": "https://example.test/share/111"
                                }}},
                                {"node": {"for_sale_item": {
                                    "id": "222",
                                    "formatted_price": {"text": "₪7,200"},
                                    "share_uri": "https://example.test/share/222"
                                }}}
                            ]
                        }
                    }
                }
            }
        }
    });
    let inner = json!([[
        "Module", "handler", [],
        ["adp_CometMarketplaceRealEstateMapStoryQueryRelayPreloader_7f", stories]
    ]]);
    let blob = json!({
        "require": [["Outer", "handler", [], [{"__bbox": {"require": inner}}]]]
    });
    format!(
        r#"<!doctype html><html><head>
        <script>window.noise = 1;</script>
        <script data-sjs>{{"require": [["Unrelated", null, null, []]]}}</script>
        <script data-sjs>{blob}</script>
        </head><body></body></html>"#
    )
}

#[test]
fn feed_page_yields_listing_edges_in_order() {
    let html = feed_page_html();
    let blobs = extract_embedded_blobs(&html, "https://example.test/feed").expect("blobs");
    assert_eq!(blobs.len(), 2);

    let stories = locate(&blobs);
    let edges = get_array(&stories, &["edges"]).expect("edges");
    let ids: Vec<&str> = edges
        .iter()
        .filter_map(|edge| get_str(edge, &["node", "for_sale_item", "id"]))
        .collect();
    assert_eq!(ids, vec!["111", "222"]);
}

fn locate(blobs: &[String]) -> serde_json::Value {
    dira_adapters::payload::locate_payload(blobs, &LISTING_FEED_QUERY).expect("located")
}

#[test]
fn feed_query_does_not_match_detail_pages_and_vice_versa() {
    let html = feed_page_html();
    let blobs = extract_embedded_blobs(&html, "https://example.test/feed").expect("blobs");
    let err = dira_adapters::payload::locate_payload(&blobs, &DETAIL_PAGE_QUERY).unwrap_err();
    assert!(err.to_string().contains("MarketplacePDPContainerQuery"));
}

#[test]
fn detail_extractor_rejects_a_feed_page() {
    let err = MarketplaceDetailExtractor
        .extract(&feed_page_html(), "111")
        .unwrap_err();
    // A feed page has blobs but no detail payload.
    assert!(matches!(err, AdapterError::Locate(_)));
}
