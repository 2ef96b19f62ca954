//! Listing parsing and item persistence seams
//!
//! Turning a listing page into item references and storing a fetched item
//! are site-specific. The scheduler only sees the [`ListingParser`] and
//! [`ItemSink`] traits; the built-in implementations read a JSON feed and
//! write JSON Lines.

use crate::config::CatalogueEntry;
use crate::fetch::{FetchError, FetchResult};
use crate::storage::{DiscoveredListing, ItemRecord, ItemRef};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Why a fetched payload could not be used
#[derive(Debug, Clone, Error)]
pub enum ParseError {
    /// The payload is malformed or incomplete
    #[error("unusable payload: {0}")]
    Unusable(String),

    /// The payload says the item no longer exists
    #[error("item removed: {0}")]
    Removed(String),

    /// The payload was fine but could not be stored
    #[error("could not persist item: {0}")]
    Persist(String),
}

impl ParseError {
    /// Maps the failure onto the fetch taxonomy used for retry decisions
    pub fn into_fetch_error(self, url: &str) -> FetchError {
        match self {
            ParseError::Unusable(msg) => FetchError::ParseFailure(msg),
            ParseError::Removed(_) => FetchError::NotFound {
                url: url.to_string(),
                status: 200,
            },
            ParseError::Persist(msg) => FetchError::Transport(msg),
        }
    }
}

/// Reads listing pages
pub trait ListingParser: Send + Sync {
    /// URL of one listing page of a relation
    fn listing_url(&self, catalogue: &CatalogueEntry, relation_id: i64, page_number: u32) -> String;

    /// Extracts item references and the relation's page count
    ///
    /// # Arguments
    ///
    /// * `body` - Listing page body
    /// * `final_url` - URL the body was served from, for resolving relative links
    fn parse_listing(&self, body: &str, final_url: &str) -> Result<DiscoveredListing, ParseError>;
}

/// Receives every successfully fetched item
pub trait ItemSink: Send + Sync {
    fn accept(&self, item: &ItemRecord, page: &FetchResult) -> Result<(), ParseError>;
}

/// Substitutes `{relation}` and `{page}` in a listing URL template
pub fn expand_listing_url(template: &str, relation_id: i64, page_number: u32) -> String {
    template
        .replace("{relation}", &relation_id.to_string())
        .replace("{page}", &page_number.to_string())
}

#[derive(Debug, Deserialize)]
struct FeedPage {
    #[serde(default)]
    total_pages: Option<u32>,
    items: Vec<FeedItem>,
}

#[derive(Debug, Deserialize)]
struct FeedItem {
    code: String,
    url: String,
}

/// Parser for the JSON listing feed
///
/// Expects `{"total_pages": n, "items": [{"code": "...", "url": "..."}]}`;
/// `total_pages` may be absent on pages that do not report it.
#[derive(Debug, Clone, Default)]
pub struct JsonListingParser;

impl ListingParser for JsonListingParser {
    fn listing_url(&self, catalogue: &CatalogueEntry, relation_id: i64, page_number: u32) -> String {
        expand_listing_url(&catalogue.listing_url, relation_id, page_number)
    }

    fn parse_listing(&self, body: &str, final_url: &str) -> Result<DiscoveredListing, ParseError> {
        let feed: FeedPage = serde_json::from_str(body)
            .map_err(|e| ParseError::Unusable(format!("listing is not a feed document: {}", e)))?;
        let base = Url::parse(final_url)
            .map_err(|e| ParseError::Unusable(format!("bad listing URL {}: {}", final_url, e)))?;

        let mut items = Vec::with_capacity(feed.items.len());
        for item in feed.items {
            let code = item.code.trim();
            if code.is_empty() {
                return Err(ParseError::Unusable("listing item without code".to_string()));
            }
            let url = base
                .join(&item.url)
                .map_err(|e| ParseError::Unusable(format!("bad item URL '{}': {}", item.url, e)))?;
            items.push(ItemRef {
                code: code.to_string(),
                url: url.to_string(),
            });
        }

        Ok(DiscoveredListing {
            total_pages: feed.total_pages,
            items,
        })
    }
}
