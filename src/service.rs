//! Request/response boundary used by a presentation shell.
//!
//! Every operation here returns a structured outcome instead of letting a
//! fault escape: import, add and sync report `success` plus a message,
//! refresh-all reports per feed, and queries return a [`ServiceError`] that
//! callers can render.

use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::feed::{self, FetchError, FetchOptions};
use crate::storage::{
    ArticleFilter, ArticleSummary, Database, Feed, Group, GroupRuleError, LAST_REFRESH_KEY,
};

/// Failure categories at the service boundary.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Source selection was aborted; informational rather than a fault
    #[error("No subscription file selected")]
    UserCancelled,

    #[error("Parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    #[error("{0}")]
    Invalid(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl ServiceError {
    fn not_found(kind: &'static str, id: i64) -> Self {
        ServiceError::NotFound { kind, id }
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<GroupRuleError>() {
            Some(GroupRuleError::MissingParent(id)) => ServiceError::not_found("Group", *id),
            Some(rule) => ServiceError::Invalid(rule.to_string()),
            None => ServiceError::Storage(format!("{err:#}")),
        }
    }
}

/// Result of `import-subscriptions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportOutcome {
    pub success: bool,
    /// Feeds newly created by this import
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Result of `add-or-update-feed` and `sync-one-feed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_articles: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl FeedOutcome {
    fn synced(sync: feed::FeedSync) -> Self {
        Self {
            success: true,
            feed_id: Some(sync.feed_id),
            title: Some(sync.title),
            new_articles: Some(sync.new_articles),
            message: None,
        }
    }

    fn failed(feed_id: Option<i64>, err: &ServiceError) -> Self {
        Self {
            success: false,
            feed_id,
            title: None,
            new_articles: None,
            message: Some(err.to_string()),
        }
    }
}

/// One feed's entry in a refresh-all report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshEntry {
    pub feed_id: i64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_articles: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The feed reader core: one store, one HTTP client, shared by every caller.
///
/// Cheap to clone; clones share the store, the client and the refresh
/// in-flight counter.
#[derive(Clone)]
pub struct FeedService {
    db: Database,
    client: reqwest::Client,
    options: FetchOptions,
    refreshes_in_flight: Arc<AtomicUsize>,
}

/// Decrements the in-flight counter when a refresh pass ends
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl FeedService {
    pub fn new(db: Database, client: reqwest::Client, options: FetchOptions) -> Self {
        Self {
            db,
            client,
            options,
            refreshes_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    // ========================================================================
    // Import / Export
    // ========================================================================

    /// Import an OPML subscription list.
    ///
    /// `None` means the user dismissed file selection and is reported as a
    /// cancellation. Otherwise the document is parsed and the whole tree is
    /// committed in one transaction; `count` is the number of feeds actually
    /// created (already-subscribed addresses are skipped).
    pub async fn import_subscriptions(&self, file: Option<&Path>) -> ImportOutcome {
        let Some(path) = file else {
            return ImportOutcome {
                success: false,
                count: 0,
                message: Some(ServiceError::UserCancelled.to_string()),
            };
        };

        match self.import_file(path).await {
            Ok(count) => ImportOutcome {
                success: true,
                count,
                message: None,
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Subscription import failed");
                ImportOutcome {
                    success: false,
                    count: 0,
                    message: Some(e.to_string()),
                }
            }
        }
    }

    async fn import_file(&self, path: &Path) -> Result<usize, ServiceError> {
        let outlines = feed::opml::parse(path, self.options.allow_private_hosts)
            .await
            .map_err(|e| ServiceError::Parse(format!("{e:#}")))?;
        let summary = self.db.import_outlines(&outlines).await?;
        Ok(summary.feeds_created)
    }

    /// Write every group and feed to an OPML file, returning the feed count.
    pub async fn export_subscriptions(&self, path: &Path) -> Result<usize, ServiceError> {
        let groups = self.db.list_groups().await?;
        let feeds = self.db.list_feeds().await?;
        let path = path.to_path_buf();
        let count = feeds.len();

        tokio::task::spawn_blocking(move || feed::export_to_file(&groups, &feeds, &path))
            .await
            .map_err(|e| ServiceError::Storage(e.to_string()))??;

        tracing::info!(feeds = count, "Exported subscriptions");
        Ok(count)
    }

    // ========================================================================
    // Synchronization
    // ========================================================================

    /// Subscribe to (or refresh) the feed at `url`.
    pub async fn add_or_update_feed(&self, url: &str, group_id: Option<i64>) -> FeedOutcome {
        let result = async {
            if let Some(gid) = group_id {
                self.require_group(gid).await?;
            }
            let sync =
                feed::add_or_update_feed(&self.db, &self.client, &self.options, url, group_id)
                    .await?;
            Ok::<_, ServiceError>(sync)
        }
        .await;

        match result {
            Ok(sync) => FeedOutcome::synced(sync),
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Add feed failed");
                FeedOutcome::failed(None, &e)
            }
        }
    }

    /// Sync one existing feed by ID.
    pub async fn sync_feed(&self, feed_id: i64) -> FeedOutcome {
        let row = match self.db.get_feed(feed_id).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                return FeedOutcome::failed(Some(feed_id), &ServiceError::not_found("Feed", feed_id))
            }
            Err(e) => return FeedOutcome::failed(Some(feed_id), &e.into()),
        };

        match feed::sync_feed(&self.db, &self.client, &self.options, row.id, &row.url).await {
            Ok(sync) => FeedOutcome::synced(sync),
            Err(FetchError::FeedRemoved(id)) => {
                FeedOutcome::failed(Some(feed_id), &ServiceError::not_found("Feed", id))
            }
            Err(e) => FeedOutcome::failed(Some(feed_id), &e.into()),
        }
    }

    /// Sync every feed concurrently and report each one's outcome.
    ///
    /// Runs even when another pass is already in flight; use
    /// [`try_refresh_all`](Self::try_refresh_all) to skip instead.
    pub async fn refresh_all_feeds(&self) -> Vec<RefreshEntry> {
        self.refreshes_in_flight.fetch_add(1, Ordering::AcqRel);
        let _guard = InFlight(Arc::clone(&self.refreshes_in_flight));
        self.run_refresh().await
    }

    /// Refresh all feeds unless another refresh is already running.
    ///
    /// Returns `None` when skipped.
    pub async fn try_refresh_all(&self) -> Option<Vec<RefreshEntry>> {
        self.refreshes_in_flight
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let _guard = InFlight(Arc::clone(&self.refreshes_in_flight));
        Some(self.run_refresh().await)
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshes_in_flight.load(Ordering::Acquire) > 0
    }

    async fn run_refresh(&self) -> Vec<RefreshEntry> {
        let results = match feed::refresh_all(&self.db, &self.client, &self.options).await {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!(error = %e, "Could not list feeds for refresh");
                return Vec::new();
            }
        };

        let entries: Vec<RefreshEntry> = results
            .into_iter()
            .map(|r| match r.result {
                Ok(new_articles) => RefreshEntry {
                    feed_id: r.feed_id,
                    success: true,
                    new_articles: Some(new_articles),
                    error: None,
                },
                Err(e) => RefreshEntry {
                    feed_id: r.feed_id,
                    success: false,
                    new_articles: None,
                    error: Some(e.to_string()),
                },
            })
            .collect();

        let failed = entries.iter().filter(|e| !e.success).count();
        tracing::info!(
            feeds = entries.len(),
            failed,
            new_articles = entries.iter().filter_map(|e| e.new_articles).sum::<usize>(),
            "Refresh pass complete"
        );

        let now = chrono::Utc::now().timestamp().to_string();
        if let Err(e) = self.db.set_setting(LAST_REFRESH_KEY, &now).await {
            tracing::warn!(error = %e, "Failed to record refresh time");
        }

        entries
    }

    /// Unix time of the last completed refresh-all pass, if any.
    pub async fn last_refresh(&self) -> Result<Option<i64>, ServiceError> {
        let value = self.db.get_setting(LAST_REFRESH_KEY).await?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn list_feeds(&self) -> Result<Vec<Feed>, ServiceError> {
        Ok(self.db.list_feeds().await?)
    }

    pub async fn list_groups(&self) -> Result<Vec<Group>, ServiceError> {
        Ok(self.db.list_groups().await?)
    }

    /// Up to 100 most recent articles for the given scope and filter.
    pub async fn list_articles(
        &self,
        feed_id: Option<i64>,
        group_id: Option<i64>,
        filter: ArticleFilter,
    ) -> Result<Vec<ArticleSummary>, ServiceError> {
        Ok(self.db.list_articles(feed_id, group_id, filter).await?)
    }

    /// Sanitized body of one article; `None` for an unknown ID.
    pub async fn get_article_content(&self, article_id: i64) -> Result<Option<String>, ServiceError> {
        Ok(self.db.get_article_content(article_id).await?)
    }

    /// Set the read flag. Unknown IDs and repeated values are no-ops.
    pub async fn mark_read(&self, article_id: i64, read: bool) -> Result<(), ServiceError> {
        if !self.db.mark_article_read(article_id, read).await? {
            tracing::debug!(article_id, read, "mark_read changed nothing");
        }
        Ok(())
    }

    /// Set the saved flag. Unknown IDs and repeated values are no-ops.
    pub async fn mark_saved(&self, article_id: i64, saved: bool) -> Result<(), ServiceError> {
        if !self.db.mark_article_saved(article_id, saved).await? {
            tracing::debug!(article_id, saved, "mark_saved changed nothing");
        }
        Ok(())
    }

    // ========================================================================
    // Organization
    // ========================================================================

    pub async fn create_group(&self, name: &str, parent_id: Option<i64>) -> Result<Group, ServiceError> {
        Ok(self.db.create_group(name, parent_id).await?)
    }

    pub async fn rename_group(&self, id: i64, name: &str) -> Result<Group, ServiceError> {
        self.db
            .rename_group(id, name)
            .await?
            .ok_or_else(|| ServiceError::not_found("Group", id))
    }

    /// Delete a group; its feeds and child groups move to the root.
    pub async fn delete_group(&self, id: i64) -> Result<(), ServiceError> {
        if !self.db.delete_group(id).await? {
            tracing::debug!(group_id = id, "delete_group: no such group");
        }
        Ok(())
    }

    /// Re-parent a group (`None` = root), rejecting cycles.
    pub async fn move_group(&self, id: i64, parent_id: Option<i64>) -> Result<(), ServiceError> {
        if self.db.move_group(id, parent_id).await? {
            Ok(())
        } else {
            Err(ServiceError::not_found("Group", id))
        }
    }

    /// Move a feed into a group, or to the root with `None`.
    pub async fn move_feed_to_group(
        &self,
        feed_id: i64,
        group_id: Option<i64>,
    ) -> Result<(), ServiceError> {
        if let Some(gid) = group_id {
            self.require_group(gid).await?;
        }
        if self.db.move_feed_to_group(feed_id, group_id).await? {
            Ok(())
        } else {
            Err(ServiceError::not_found("Feed", feed_id))
        }
    }

    /// Unsubscribe, deleting the feed's articles with it.
    pub async fn delete_feed(&self, feed_id: i64) -> Result<(), ServiceError> {
        if self.db.delete_feed(feed_id).await? {
            Ok(())
        } else {
            Err(ServiceError::not_found("Feed", feed_id))
        }
    }

    async fn require_group(&self, id: i64) -> Result<(), ServiceError> {
        match self.db.get_group(id).await? {
            Some(_) => Ok(()),
            None => Err(ServiceError::not_found("Group", id)),
        }
    }
}
