//! Review-source clients and the bounded paged fetch loop.
//!
//! Two providers are supported: the Google Play `batchexecute` review RPC and
//! the App Store customer-reviews RSS feed. Both normalize into
//! [`ReviewRecord`] behind the [`ReviewSource`] trait; [`fetch_reviews`]
//! drives paging until the cutoff date is crossed, the per-source cap is
//! reached, or the provider signals exhaustion.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rasp_core::{ReviewRecord, ReviewSourceKind};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::debug;

pub const CRATE_NAME: &str = "rasp-sources";

const GOOGLE_BATCHEXECUTE_URL: &str = "https://play.google.com/_/PlayStoreUi/data/batchexecute";
const GOOGLE_REVIEWS_RPC_ID: &str = "UsvDTd";
const GOOGLE_PAGE_SIZE: usize = 200;
const GOOGLE_SORT_NEWEST: u32 = 2;

const ITUNES_SEARCH_URL: &str = "https://itunes.apple.com/search";
const RSS_MAX_PAGE: u32 = 10;

// Upper bound on pages pulled from one source per run, in case a provider
// keeps handing out cursors without ever exhausting.
const MAX_PAGES_PER_SOURCE: usize = 50;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed {store} payload: {detail}")]
    Payload { store: &'static str, detail: String },
    #[error("app '{app_name}' not found in the {country} App Store")]
    AppNotFound { app_name: String, country: String },
}

impl SourceError {
    fn payload(store: &'static str, detail: impl Into<String>) -> Self {
        SourceError::Payload {
            store,
            detail: detail.into(),
        }
    }
}

/// One provider page: records in source-native (newest-first) order plus the
/// cursor for the next page, if any.
#[derive(Debug, Clone)]
pub struct ReviewPage {
    pub reviews: Vec<ReviewRecord>,
    pub next: Option<String>,
}

#[async_trait]
pub trait ReviewSource: Send + Sync {
    fn kind(&self) -> ReviewSourceKind;
    fn app_id(&self) -> &str;

    /// Fetch one provider page. `cursor` is `None` for the first page and the
    /// previously returned `next` value afterwards.
    async fn fetch_page(&self, cursor: Option<&str>) -> Result<ReviewPage, SourceError>;
}

/// Result of draining one source: whatever was collected before the loop
/// stopped, plus the error that interrupted it, if any. A failed source
/// degrades to its partial output; it never aborts the caller.
#[derive(Debug)]
pub struct FetchOutcome {
    pub reviews: Vec<ReviewRecord>,
    pub error: Option<SourceError>,
}

/// Pull pages from `source` until a record older than `cutoff` appears, `max`
/// records are collected, or the source runs out of pages.
pub async fn fetch_reviews(
    source: &dyn ReviewSource,
    cutoff: DateTime<Utc>,
    max: usize,
) -> FetchOutcome {
    let mut collected: Vec<ReviewRecord> = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_PAGES_PER_SOURCE {
        let page = match source.fetch_page(cursor.as_deref()).await {
            Ok(page) => page,
            Err(err) => {
                return FetchOutcome {
                    reviews: collected,
                    error: Some(err),
                }
            }
        };

        // A page may normalize to zero records (e.g. feed metadata entries)
        // and still carry a cursor; only a missing cursor ends paging.
        let mut stop = false;
        for review in page.reviews {
            if review.posted_at < cutoff || collected.len() >= max {
                stop = true;
                break;
            }
            collected.push(review);
        }
        if stop {
            break;
        }

        match page.next {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    debug!(
        app_id = source.app_id(),
        store = source.kind().display_name(),
        count = collected.len(),
        "source drained"
    );
    FetchOutcome {
        reviews: collected,
        error: None,
    }
}

/// Google Play review client speaking the `batchexecute` RPC envelope.
#[derive(Debug, Clone)]
pub struct GooglePlayClient {
    http: Client,
    app_id: String,
    lang: String,
    country: String,
}

impl GooglePlayClient {
    pub fn new(http: Client, app_id: impl Into<String>) -> Self {
        Self {
            http,
            app_id: app_id.into(),
            lang: "en".to_string(),
            country: "us".to_string(),
        }
    }

    fn rpc_envelope(&self, token: Option<&str>) -> String {
        // Inner payload is a JSON string embedded inside the outer envelope.
        let paging = match token {
            Some(token) => serde_json::json!([GOOGLE_PAGE_SIZE, null, token]),
            None => serde_json::json!([GOOGLE_PAGE_SIZE, null, null]),
        };
        let payload = serde_json::json!([
            null,
            null,
            [2, GOOGLE_SORT_NEWEST, paging, null, []],
            [self.app_id, 7]
        ])
        .to_string();
        serde_json::json!([[[GOOGLE_REVIEWS_RPC_ID, payload, null, "generic"]]]).to_string()
    }
}

#[async_trait]
impl ReviewSource for GooglePlayClient {
    fn kind(&self) -> ReviewSourceKind {
        ReviewSourceKind::GooglePlay
    }

    fn app_id(&self) -> &str {
        &self.app_id
    }

    async fn fetch_page(&self, cursor: Option<&str>) -> Result<ReviewPage, SourceError> {
        let url = format!(
            "{GOOGLE_BATCHEXECUTE_URL}?hl={}&gl={}",
            self.lang, self.country
        );
        let response = self
            .http
            .post(&url)
            .form(&[("f.req", self.rpc_envelope(cursor))])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SourceError::HttpStatus {
                status: response.status().as_u16(),
                url,
            });
        }
        let body = response.text().await?;
        let (reviews, next) = parse_google_play_body(&self.app_id, &body)?;
        Ok(ReviewPage { reviews, next })
    }
}

/// Synthesized per-review deep link into the Play Store listing.
fn google_review_url(app_id: &str, review_id: &str) -> String {
    format!("https://play.google.com/store/apps/details?id={app_id}&reviewId={review_id}")
}

fn value_at<'a>(root: &'a Value, path: &[usize]) -> Option<&'a Value> {
    let mut current = root;
    for index in path {
        current = current.get(*index)?;
    }
    Some(current)
}

/// Decode one `batchexecute` response body into records plus the continuation
/// token. The body carries an anti-hijacking prefix and double-encoded JSON.
pub fn parse_google_play_body(
    app_id: &str,
    body: &str,
) -> Result<(Vec<ReviewRecord>, Option<String>), SourceError> {
    let json_start = body
        .find('[')
        .ok_or_else(|| SourceError::payload("Google Play", "no JSON envelope in response"))?;
    let outer: Value = serde_json::from_str(&body[json_start..])
        .map_err(|e| SourceError::payload("Google Play", format!("outer envelope: {e}")))?;
    let inner_text = value_at(&outer, &[0, 2])
        .and_then(Value::as_str)
        .ok_or_else(|| SourceError::payload("Google Play", "missing inner payload"))?;
    let inner: Value = serde_json::from_str(inner_text)
        .map_err(|e| SourceError::payload("Google Play", format!("inner payload: {e}")))?;

    let raw_reviews = inner
        .get(0)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let token = value_at(&inner, &[1, 1])
        .and_then(Value::as_str)
        .map(ToString::to_string);

    let mut reviews = Vec::with_capacity(raw_reviews.len());
    for raw in &raw_reviews {
        let id = raw
            .get(0)
            .and_then(Value::as_str)
            .ok_or_else(|| SourceError::payload("Google Play", "review without id"))?;
        let username = value_at(raw, &[1, 0])
            .and_then(Value::as_str)
            .unwrap_or_default();
        let rating = raw.get(2).and_then(Value::as_i64).unwrap_or(0) as i32;
        let text = raw.get(4).and_then(Value::as_str).unwrap_or_default();
        let seconds = value_at(raw, &[5, 0]).and_then(Value::as_i64).unwrap_or(0);
        let posted_at = DateTime::<Utc>::from_timestamp(seconds, 0)
            .ok_or_else(|| SourceError::payload("Google Play", "review timestamp out of range"))?;

        reviews.push(ReviewRecord::new(
            id,
            ReviewSourceKind::GooglePlay,
            app_id,
            username,
            posted_at,
            rating,
            text,
            google_review_url(app_id, id),
        ));
    }
    Ok((reviews, token))
}

/// App Store review client over the iTunes customer-reviews RSS feed. The
/// human-facing app name is resolved to a numeric track id once, lazily, via
/// the iTunes search API.
#[derive(Debug)]
pub struct AppStoreClient {
    http: Client,
    app_name: String,
    country: String,
    track_id: OnceCell<u64>,
}

impl AppStoreClient {
    pub fn new(http: Client, app_name: impl Into<String>, country: impl Into<String>) -> Self {
        Self {
            http,
            app_name: app_name.into(),
            country: country.into(),
            track_id: OnceCell::new(),
        }
    }

    async fn resolve_track_id(&self) -> Result<u64, SourceError> {
        self.track_id
            .get_or_try_init(|| async {
                let term = self.app_name.replace('-', " ");
                let response = self
                    .http
                    .get(ITUNES_SEARCH_URL)
                    .query(&[
                        ("term", term.as_str()),
                        ("country", self.country.as_str()),
                        ("entity", "software"),
                        ("limit", "1"),
                    ])
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(SourceError::HttpStatus {
                        status: response.status().as_u16(),
                        url: response.url().to_string(),
                    });
                }
                let results: ItunesSearchResponse = response.json().await?;
                results
                    .results
                    .first()
                    .map(|r| r.track_id)
                    .ok_or_else(|| SourceError::AppNotFound {
                        app_name: self.app_name.clone(),
                        country: self.country.clone(),
                    })
            })
            .await
            .copied()
    }

    fn feed_url(&self, track_id: u64, page: u32) -> String {
        format!(
            "https://itunes.apple.com/{}/rss/customerreviews/page={}/id={}/sortby=mostrecent/json",
            self.country, page, track_id
        )
    }
}

#[derive(Debug, Deserialize)]
struct ItunesSearchResponse {
    #[serde(default)]
    results: Vec<ItunesSearchResult>,
}

#[derive(Debug, Deserialize)]
struct ItunesSearchResult {
    #[serde(rename = "trackId")]
    track_id: u64,
}

#[derive(Debug, Deserialize)]
struct RssEnvelope {
    feed: RssFeed,
}

#[derive(Debug, Deserialize)]
struct RssFeed {
    #[serde(default)]
    entry: Vec<RssEntry>,
}

#[derive(Debug, Deserialize)]
struct RssEntry {
    id: RssLabel,
    author: RssAuthor,
    // The feed's first entry is sometimes app metadata with no rating; those
    // entries are skipped.
    #[serde(rename = "im:rating", default)]
    rating: Option<RssLabel>,
    #[serde(default)]
    content: Option<RssLabel>,
    updated: RssLabel,
}

#[derive(Debug, Deserialize)]
struct RssAuthor {
    name: RssLabel,
}

#[derive(Debug, Deserialize, Default)]
struct RssLabel {
    label: String,
}

/// Decode one RSS feed page into normalized records plus the raw entry
/// count. The entry count drives paging: a page holding only skipped
/// metadata entries must still advance to the next page.
pub fn parse_app_store_feed(
    app_name: &str,
    body: &str,
) -> Result<(Vec<ReviewRecord>, usize), SourceError> {
    let envelope: RssEnvelope = serde_json::from_str(body)
        .map_err(|e| SourceError::payload("App Store", format!("rss feed: {e}")))?;

    let entry_count = envelope.feed.entry.len();
    let mut reviews = Vec::new();
    for entry in envelope.feed.entry {
        let Some(rating) = entry.rating else {
            continue;
        };
        let rating: i32 = rating.label.trim().parse().map_err(|_| {
            SourceError::payload("App Store", format!("non-numeric rating '{}'", rating.label))
        })?;
        let posted_at = DateTime::parse_from_rfc3339(&entry.updated.label)
            .map_err(|e| {
                SourceError::payload(
                    "App Store",
                    format!("timestamp '{}': {e}", entry.updated.label),
                )
            })?
            .with_timezone(&Utc);
        reviews.push(ReviewRecord::new(
            entry.id.label,
            ReviewSourceKind::AppStore,
            app_name,
            entry.author.name.label,
            posted_at,
            rating,
            entry.content.map(|c| c.label).unwrap_or_default(),
            // The feed exposes no per-review URL.
            "",
        ));
    }
    Ok((reviews, entry_count))
}

#[async_trait]
impl ReviewSource for AppStoreClient {
    fn kind(&self) -> ReviewSourceKind {
        ReviewSourceKind::AppStore
    }

    fn app_id(&self) -> &str {
        &self.app_name
    }

    async fn fetch_page(&self, cursor: Option<&str>) -> Result<ReviewPage, SourceError> {
        let page: u32 = match cursor {
            Some(cursor) => cursor.parse().map_err(|_| {
                SourceError::payload("App Store", format!("bad page cursor '{cursor}'"))
            })?,
            None => 1,
        };
        let track_id = self.resolve_track_id().await?;
        let url = self.feed_url(track_id, page);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(SourceError::HttpStatus {
                status: response.status().as_u16(),
                url,
            });
        }
        let body = response.text().await?;
        let (reviews, entry_count) = parse_app_store_feed(&self.app_name, &body)?;
        let next = if entry_count > 0 && page < RSS_MAX_PAGE {
            Some((page + 1).to_string())
        } else {
            None
        };
        Ok(ReviewPage { reviews, next })
    }
}
