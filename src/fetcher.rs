use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feed_rs::model::{FeedType, Text};
use feed_rs::parser;
use htmlescape::decode_html;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::debug;

/// One entry of a fetched feed, in the order the document lists it.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub title: String,
    pub link: String,
    pub description: String,
    pub published: Option<DateTime<Utc>>,
}

/// A parsed RSS channel. Lives for a single scheduler tick.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub title: String,
    pub link: String,
    pub description: String,
    pub items: Vec<Item>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Network(reqwest::Error),

    #[error("unexpected HTTP status {0}")]
    HttpStatus(StatusCode),

    #[error("failed to parse feed: {0}")]
    Parse(String),

    #[error("fetch did not complete within {0:?}")]
    Timeout(Duration),
}

impl FetchError {
    /// Short label used as a structured logging field.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Network(_) => "network",
            FetchError::HttpStatus(_) => "http_status",
            FetchError::Parse(_) => "parse",
            FetchError::Timeout(_) => "timeout",
        }
    }
}

#[async_trait]
pub trait FetchFeed: Send + Sync {
    /// Fetch and parse the feed at `url`, giving up once `deadline` has elapsed.
    async fn fetch_feed(&self, url: &str, deadline: Duration) -> Result<FetchResult, FetchError>;
}

pub struct FeedClient {
    client: Client,
}

impl FeedClient {
    pub fn new(user_agent: &str) -> reqwest::Result<Self> {
        let client = Client::builder().user_agent(user_agent).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FetchFeed for FeedClient {
    async fn fetch_feed(&self, url: &str, deadline: Duration) -> Result<FetchResult, FetchError> {
        debug!(url, ?deadline, "requesting feed");

        // The deadline covers connect, headers and body; on expiry the request future is dropped.
        let body = tokio::time::timeout(deadline, async {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(FetchError::Network)?;

            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus(status));
            }

            let body = response.bytes().await.map_err(FetchError::Network)?;
            Ok::<_, FetchError>(body)
        })
        .await
        .map_err(|_| FetchError::Timeout(deadline))??;

        parse_feed(&body)
    }
}

/// Parse an RSS document into a [`FetchResult`].
///
/// Atom, JSON Feed and RSS 1.0 documents are rejected. Titles and
/// descriptions are passed through [`unescape`] because many feeds encode
/// their markup twice.
pub fn parse_feed(body: &[u8]) -> Result<FetchResult, FetchError> {
    let feed = parser::parse(body).map_err(|e| FetchError::Parse(e.to_string()))?;

    match feed.feed_type {
        FeedType::RSS0 | FeedType::RSS2 => {}
        other => {
            return Err(FetchError::Parse(format!(
                "unsupported feed format {:?}, expected RSS",
                other
            )))
        }
    }

    let items = feed
        .entries
        .into_iter()
        .map(|entry| Item {
            title: unescape_text(entry.title),
            link: entry
                .links
                .into_iter()
                .next()
                .map(|l| l.href)
                .unwrap_or_default(),
            description: unescape_text(entry.summary),
            published: entry.published,
        })
        .collect();

    Ok(FetchResult {
        title: unescape_text(feed.title),
        link: feed
            .links
            .into_iter()
            .next()
            .map(|l| l.href)
            .unwrap_or_default(),
        description: unescape_text(feed.description),
        items,
    })
}

/// Decode HTML entities (`&amp;`, `&#8217;`, ...).
///
/// Each `&...;` sequence is decoded on its own. A stray `&` or an unknown
/// entity is kept as literal text, so `AT&T &amp; more` becomes `AT&T & more`.
pub fn unescape(text: &str) -> String {
    let mut decoded = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find('&') {
        decoded.push_str(&rest[..start]);
        rest = &rest[start..];

        // An entity runs up to the first `;`, with no whitespace or second `&` inside.
        let end = rest[1..]
            .find(|c: char| c == ';' || c == '&' || c.is_whitespace())
            .map(|i| i + 1)
            .filter(|&i| rest.as_bytes()[i] == b';');

        match end {
            Some(end) => {
                let entity = &rest[..=end];
                match decode_html(entity) {
                    Ok(text) => decoded.push_str(&text),
                    Err(_) => decoded.push_str(entity),
                }
                rest = &rest[end + 1..];
            }
            None => {
                decoded.push('&');
                rest = &rest[1..];
            }
        }
    }

    decoded.push_str(rest);
    decoded
}

fn unescape_text(text: Option<Text>) -> String {
    text.map(|t| unescape(&t.content)).unwrap_or_default()
}
