use anyhow::Result;
use futures::stream::{self, StreamExt};
use std::time::Duration;
use thiserror::Error;

use super::parser::parse_feed;
use crate::storage::Database;
use crate::util::{validate_url_with, UrlValidationError};

pub const DEFAULT_USER_AGENT: &str = concat!("gather/", env!("CARGO_PKG_VERSION"));

/// Errors that can occur while syncing one feed.
///
/// These cover the full lifecycle of a sync: address policy, network,
/// HTTP status, parsing and the final store.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request and body did not complete within the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Document could not be parsed as RSS, Atom or JSON Feed
    #[error("Parse error: {0}")]
    Parse(String),
    /// Storing the feed or its articles failed; nothing was committed
    #[error("Database error: {0}")]
    Database(String),
    /// Response body exceeded the configured size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Received fewer bytes than Content-Length announced
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// Address refused before any request was made
    #[error("Invalid feed address: {0}")]
    InvalidUrl(#[from] UrlValidationError),
    /// Feed was unsubscribed while its fetch was in flight; nothing stored
    #[error("Feed {0} no longer exists")]
    FeedRemoved(i64),
}

/// Limits applied to every feed fetch.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Upper bound for request plus body download
    pub timeout: Duration,
    pub max_feed_size: usize,
    /// Feeds fetched at once during a refresh-all pass
    pub max_concurrent: usize,
    /// Permit loopback and private-network feed hosts
    pub allow_private_hosts: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_feed_size: 10 * 1024 * 1024,
            max_concurrent: 10,
            allow_private_hosts: false,
        }
    }
}

/// Outcome of one successful sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSync {
    pub feed_id: i64,
    pub title: String,
    /// Articles inserted by this sync; already-known links are not counted
    pub new_articles: usize,
}

/// Result of a single feed fetch during a refresh-all pass.
#[derive(Debug)]
pub struct FetchResult {
    pub feed_id: i64,
    /// Number of new articles inserted, or the error that occurred
    pub result: Result<usize, FetchError>,
}

/// Build the HTTP client shared by every fetch.
pub fn build_client(user_agent: &str) -> Result<reqwest::Client, FetchError> {
    let client = reqwest::Client::builder()
        .user_agent(user_agent)
        .connect_timeout(Duration::from_secs(10))
        .build()?;
    Ok(client)
}

/// Fetch the feed at `url` and merge it into the store.
///
/// The feed row is upserted by address (a known address keeps its ID and
/// group; `group_id` only applies to a new subscription) and every fetched
/// item is inserted unless its link is already stored. Feed row and articles
/// commit together.
///
/// # Errors
///
/// - [`FetchError::InvalidUrl`] - address refused by URL policy, nothing fetched
/// - [`FetchError::Network`] / [`FetchError::Timeout`] - transport failure
/// - [`FetchError::HttpStatus`] - non-2xx response
/// - [`FetchError::ResponseTooLarge`] / [`FetchError::IncompleteResponse`] - bad body
/// - [`FetchError::Parse`] - not a feed document
/// - [`FetchError::Database`] - store failed, nothing written
pub async fn add_or_update_feed(
    db: &Database,
    client: &reqwest::Client,
    options: &FetchOptions,
    url: &str,
    group_id: Option<i64>,
) -> Result<FeedSync, FetchError> {
    // Stored as given (trimmed) so a re-add matches the existing row
    let url = url.trim();
    validate_url_with(url, options.allow_private_hosts)?;

    let bytes = fetch_bytes(client, options, url).await?;
    let parsed = parse_feed(&bytes, chrono::Utc::now().timestamp())
        .map_err(|e| FetchError::Parse(e.to_string()))?;

    let (feed_id, new_articles) = db
        .store_fetched_feed(url, group_id, &parsed.metadata, &parsed.articles)
        .await
        .map_err(|e| FetchError::Database(e.to_string()))?;

    tracing::debug!(
        feed_id,
        url = %url,
        items = parsed.articles.len(),
        new_articles,
        "Feed synced"
    );

    Ok(FeedSync {
        feed_id,
        title: parsed.metadata.title,
        new_articles,
    })
}

/// Sync an already-subscribed feed and record the outcome on its row.
///
/// A failure is stored as the feed's error status and otherwise leaves
/// existing state untouched; success clears it.
pub async fn sync_feed(
    db: &Database,
    client: &reqwest::Client,
    options: &FetchOptions,
    feed_id: i64,
    url: &str,
) -> Result<FeedSync, FetchError> {
    let result = sync_existing(db, client, options, feed_id, url).await;

    if let Err(e) = &result {
        tracing::warn!(feed_id, url = %url, error = %e, "Feed sync failed");
        if matches!(e, FetchError::FeedRemoved(_)) {
            return result;
        }
        if let Err(db_err) = db.set_feed_error(feed_id, Some(&e.to_string())).await {
            tracing::warn!(feed_id, error = %db_err, "Failed to record feed error");
        }
    }
    result
}

/// Fetch and merge one existing feed, updating its row by ID.
async fn sync_existing(
    db: &Database,
    client: &reqwest::Client,
    options: &FetchOptions,
    feed_id: i64,
    url: &str,
) -> Result<FeedSync, FetchError> {
    validate_url_with(url, options.allow_private_hosts)?;
    let bytes = fetch_bytes(client, options, url).await?;
    let parsed = parse_feed(&bytes, chrono::Utc::now().timestamp())
        .map_err(|e| FetchError::Parse(e.to_string()))?;

    let new_articles = db
        .update_fetched_feed(feed_id, &parsed.metadata, &parsed.articles)
        .await
        .map_err(|e| FetchError::Database(e.to_string()))?
        .ok_or(FetchError::FeedRemoved(feed_id))?;

    Ok(FeedSync {
        feed_id,
        title: parsed.metadata.title,
        new_articles,
    })
}

/// Sync every subscribed feed concurrently.
///
/// Feeds are fetched at most `options.max_concurrent` at a time, and each
/// one succeeds or fails on its own: an unreachable or malformed feed is
/// reported in its [`FetchResult`] and never affects the others. Error
/// statuses for the whole pass are written in one statement at the end.
///
/// # Returns
///
/// One [`FetchResult`] per feed, in completion order.
///
/// # Errors
///
/// Only when the feed list itself cannot be read.
pub async fn refresh_all(
    db: &Database,
    client: &reqwest::Client,
    options: &FetchOptions,
) -> Result<Vec<FetchResult>> {
    let sources = db.feed_sources().await?;
    if sources.is_empty() {
        return Ok(Vec::new());
    }

    let results: Vec<FetchResult> = stream::iter(sources)
        .map(|(feed_id, url)| async move {
            let result = sync_existing(db, client, options, feed_id, &url)
                .await
                .map(|sync| sync.new_articles);
            if let Err(e) = &result {
                tracing::warn!(feed_id, url = %url, error = %e, "Feed refresh failed");
            }
            FetchResult { feed_id, result }
        })
        .buffer_unordered(options.max_concurrent.max(1))
        .collect()
        .await;

    let updates: Vec<(i64, Option<String>)> = results
        .iter()
        .map(|r| (r.feed_id, r.result.as_ref().err().map(ToString::to_string)))
        .collect();
    if let Err(e) = db.batch_set_feed_errors(&updates).await {
        tracing::warn!(error = %e, "Failed to batch update feed error statuses");
    }

    Ok(results)
}

async fn fetch_bytes(
    client: &reqwest::Client,
    options: &FetchOptions,
    url: &str,
) -> Result<Vec<u8>, FetchError> {
    tokio::time::timeout(options.timeout, download(client, url, options.max_feed_size))
        .await
        .map_err(|_| FetchError::Timeout)?
}

async fn download(client: &reqwest::Client, url: &str, limit: usize) -> Result<Vec<u8>, FetchError> {
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(FetchError::HttpStatus(response.status().as_u16()));
    }
    read_limited_bytes(response, limit).await
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let announced = response.content_length();
    if announced.is_some_and(|len| len > limit as u64) {
        return Err(FetchError::ResponseTooLarge);
    }

    let mut body = Vec::with_capacity(announced.map_or(0, |len| len as usize));
    let mut chunks = response.bytes_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        if body.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        body.extend_from_slice(&chunk);
    }

    if let Some(expected) = announced {
        if (body.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: body.len(),
            });
        }
    }

    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ArticleFilter;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Mock Feed</title>
    <item><title>One</title><link>https://example.com/1</link></item>
    <item><title>Two</title><link>https://example.com/2</link></item>
</channel></rss>"#;

    fn local_options() -> FetchOptions {
        FetchOptions {
            allow_private_hosts: true,
            ..FetchOptions::default()
        }
    }

    async fn serve(server: &MockServer, route: &str, response: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(response)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_add_feed_stores_feed_and_articles() {
        let server = MockServer::start().await;
        serve(&server, "/feed", ResponseTemplate::new(200).set_body_string(VALID_RSS)).await;
        let db = Database::open(":memory:").await.unwrap();
        let client = reqwest::Client::new();
        let url = format!("{}/feed", server.uri());

        let sync = add_or_update_feed(&db, &client, &local_options(), &url, None)
            .await
            .unwrap();
        assert_eq!(sync.title, "Mock Feed");
        assert_eq!(sync.new_articles, 2);

        let articles = db
            .list_articles(Some(sync.feed_id), None, ArticleFilter::All)
            .await
            .unwrap();
        assert_eq!(articles.len(), 2);
    }

    #[tokio::test]
    async fn test_re_adding_is_idempotent() {
        let server = MockServer::start().await;
        serve(&server, "/feed", ResponseTemplate::new(200).set_body_string(VALID_RSS)).await;
        let db = Database::open(":memory:").await.unwrap();
        let client = reqwest::Client::new();
        let url = format!("{}/feed", server.uri());
        let options = local_options();

        let first = add_or_update_feed(&db, &client, &options, &url, None).await.unwrap();
        let second = add_or_update_feed(&db, &client, &options, &url, None).await.unwrap();

        assert_eq!(first.feed_id, second.feed_id);
        assert_eq!(second.new_articles, 0);
        assert_eq!(db.list_feeds().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_private_host_refused_without_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .expect(0)
            .mount(&server)
            .await;
        let db = Database::open(":memory:").await.unwrap();
        let client = reqwest::Client::new();

        let err = add_or_update_feed(
            &db,
            &client,
            &FetchOptions::default(),
            &format!("{}/feed", server.uri()),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_http_error_recorded_on_feed() {
        let server = MockServer::start().await;
        serve(&server, "/gone", ResponseTemplate::new(404)).await;
        let db = Database::open(":memory:").await.unwrap();
        let client = reqwest::Client::new();
        let url = format!("{}/gone", server.uri());
        let feed_id = db.insert_feed(&url, "Gone", None, None).await.unwrap();

        let err = sync_feed(&db, &client, &local_options(), feed_id, &url)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus(404)), "got {err:?}");

        let feed = db.get_feed(feed_id).await.unwrap().unwrap();
        assert_eq!(feed.error.as_deref(), Some("HTTP error: status 404"));
    }

    #[tokio::test]
    async fn test_server_error_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;
        let db = Database::open(":memory:").await.unwrap();
        let client = reqwest::Client::new();
        let url = format!("{}/feed", server.uri());

        let err = add_or_update_feed(&db, &client, &local_options(), &url, None)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus(503)));
    }

    #[tokio::test]
    async fn test_malformed_feed_parse_error() {
        let server = MockServer::start().await;
        serve(&server, "/feed", ResponseTemplate::new(200).set_body_string("<not valid xml")).await;
        let db = Database::open(":memory:").await.unwrap();
        let client = reqwest::Client::new();
        let url = format!("{}/feed", server.uri());

        let err = add_or_update_feed(&db, &client, &local_options(), &url, None)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)), "got {err:?}");
        assert!(db.list_feeds().await.unwrap().is_empty(), "nothing stored on failure");
    }

    #[tokio::test]
    async fn test_empty_feed_is_success() {
        let server = MockServer::start().await;
        serve(
            &server,
            "/feed",
            ResponseTemplate::new(200)
                .set_body_string(r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Quiet</title></channel></rss>"#),
        )
        .await;
        let db = Database::open(":memory:").await.unwrap();
        let client = reqwest::Client::new();
        let url = format!("{}/feed", server.uri());

        let sync = add_or_update_feed(&db, &client, &local_options(), &url, None)
            .await
            .unwrap();
        assert_eq!(sync.new_articles, 0);
        assert_eq!(sync.title, "Quiet");
    }

    #[tokio::test]
    async fn test_slow_response_times_out() {
        let server = MockServer::start().await;
        serve(
            &server,
            "/slow",
            ResponseTemplate::new(200)
                .set_body_string(VALID_RSS)
                .set_delay(Duration::from_secs(5)),
        )
        .await;
        let db = Database::open(":memory:").await.unwrap();
        let client = reqwest::Client::new();
        let options = FetchOptions {
            timeout: Duration::from_millis(200),
            ..local_options()
        };

        let err = add_or_update_feed(&db, &client, &options, &format!("{}/slow", server.uri()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout), "got {err:?}");
    }

    #[tokio::test]
    async fn test_oversized_response_rejected() {
        let server = MockServer::start().await;
        serve(&server, "/big", ResponseTemplate::new(200).set_body_string("x".repeat(4096))).await;
        let db = Database::open(":memory:").await.unwrap();
        let client = reqwest::Client::new();
        let options = FetchOptions {
            max_feed_size: 1024,
            ..local_options()
        };

        let err = add_or_update_feed(&db, &client, &options, &format!("{}/big", server.uri()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::ResponseTooLarge), "got {err:?}");
    }

    #[tokio::test]
    async fn test_refresh_all_isolates_failures() {
        let server = MockServer::start().await;
        serve(&server, "/good", ResponseTemplate::new(200).set_body_string(VALID_RSS)).await;
        serve(&server, "/bad", ResponseTemplate::new(500)).await;
        let db = Database::open(":memory:").await.unwrap();
        let client = reqwest::Client::new();

        let good = db
            .insert_feed(&format!("{}/good", server.uri()), "Good", None, None)
            .await
            .unwrap();
        let bad = db
            .insert_feed(&format!("{}/bad", server.uri()), "Bad", None, None)
            .await
            .unwrap();

        let mut results = refresh_all(&db, &client, &local_options()).await.unwrap();
        results.sort_by_key(|r| r.feed_id);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].feed_id, good);
        assert_eq!(*results[0].result.as_ref().unwrap(), 2);
        assert_eq!(results[1].feed_id, bad);
        assert!(matches!(results[1].result, Err(FetchError::HttpStatus(500))));

        assert!(db.get_feed(good).await.unwrap().unwrap().error.is_none());
        assert!(db.get_feed(bad).await.unwrap().unwrap().error.is_some());
        assert_eq!(
            db.list_articles(Some(good), None, ArticleFilter::All)
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_feed_deleted_during_refresh_stays_deleted() {
        let server = MockServer::start().await;
        serve(
            &server,
            "/slow",
            ResponseTemplate::new(200)
                .set_body_string(VALID_RSS)
                .set_delay(Duration::from_millis(500)),
        )
        .await;
        let db = Database::open(":memory:").await.unwrap();
        let group = db.create_group("News", None).await.unwrap();
        let feed_id = db
            .insert_feed(&format!("{}/slow", server.uri()), "Slow", None, Some(group.id))
            .await
            .unwrap();

        let refresh = tokio::spawn({
            let db = db.clone();
            async move {
                refresh_all(&db, &reqwest::Client::new(), &local_options())
                    .await
                    .unwrap()
            }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(db.delete_feed(feed_id).await.unwrap());

        let results = refresh.await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0].result, Err(FetchError::FeedRemoved(id)) if id == feed_id));

        assert!(db.list_feeds().await.unwrap().is_empty());
        assert!(db
            .list_articles(None, None, ArticleFilter::All)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_sync_feed_after_delete_reports_removed() {
        let server = MockServer::start().await;
        serve(&server, "/feed", ResponseTemplate::new(200).set_body_string(VALID_RSS)).await;
        let db = Database::open(":memory:").await.unwrap();
        let url = format!("{}/feed", server.uri());
        let feed_id = db.insert_feed(&url, "Feed", None, None).await.unwrap();
        db.delete_feed(feed_id).await.unwrap();

        let err = sync_feed(&db, &reqwest::Client::new(), &local_options(), feed_id, &url)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::FeedRemoved(_)));
        assert!(db.list_feeds().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_all_without_feeds() {
        let db = Database::open(":memory:").await.unwrap();
        let client = reqwest::Client::new();
        assert!(refresh_all(&db, &client, &local_options()).await.unwrap().is_empty());
    }
}
