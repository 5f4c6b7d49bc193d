use anyhow::Result;
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{ArticleFilter, ArticleSummary};

// ============================================================================
// Query Limit Constants
// ============================================================================

/// Article listings return at most this many rows; there is no paging past it
pub const ARTICLE_LIST_LIMIT: i64 = 100;

impl Database {
    // ========================================================================
    // Article Queries
    // ========================================================================

    /// List the most recently published articles matching the given scope.
    ///
    /// `feed_id` and `group_id` are AND-combined when both are given; a group
    /// matches feeds directly inside it. With neither, articles from every
    /// feed are returned.
    pub async fn list_articles(
        &self,
        feed_id: Option<i64>,
        group_id: Option<i64>,
        filter: ArticleFilter,
    ) -> Result<Vec<ArticleSummary>> {
        tracing::debug!(
            feed_id = ?feed_id,
            group_id = ?group_id,
            filter = %filter,
            limit = ARTICLE_LIST_LIMIT,
            "list_articles"
        );

        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            r#"
            SELECT a.id, a.feed_id, f.title AS feed_title, f.icon_url,
                   a.title, a.author, a.published, a.url, a.read, a.saved
            FROM articles a
            JOIN feeds f ON a.feed_id = f.id
            WHERE 1 = 1"#,
        );

        if let Some(feed_id) = feed_id {
            builder.push(" AND a.feed_id = ");
            builder.push_bind(feed_id);
        }
        if let Some(group_id) = group_id {
            builder.push(" AND f.group_id = ");
            builder.push_bind(group_id);
        }
        match filter {
            ArticleFilter::All => {}
            ArticleFilter::Unread => {
                builder.push(" AND a.read = 0");
            }
            ArticleFilter::Saved => {
                builder.push(" AND a.saved = 1");
            }
        }

        builder.push(" ORDER BY a.published DESC, a.id DESC LIMIT ");
        builder.push_bind(ARTICLE_LIST_LIMIT);

        let rows = builder
            .build_query_as::<ArticleSummary>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Get the sanitized body of one article.
    ///
    /// Returns `None` for an unknown ID.
    pub async fn get_article_content(&self, article_id: i64) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT content FROM articles WHERE id = ?")
                .bind(article_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(content,)| content.unwrap_or_default()))
    }

    // ========================================================================
    // Article Mutations
    // ========================================================================

    /// Set the read flag, returns whether the row changed
    ///
    /// The `read != ?` guard makes repeated calls with the same value a no-op.
    pub async fn mark_article_read(&self, article_id: i64, read: bool) -> Result<bool> {
        let mut w = self.begin_write().await?;
        let result = sqlx::query("UPDATE articles SET read = ? WHERE id = ? AND read != ?")
            .bind(read)
            .bind(article_id)
            .bind(read)
            .execute(&mut *w.tx)
            .await?;
        w.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Set the saved flag, returns whether the row changed
    pub async fn mark_article_saved(&self, article_id: i64, saved: bool) -> Result<bool> {
        let mut w = self.begin_write().await?;
        let result = sqlx::query("UPDATE articles SET saved = ? WHERE id = ? AND saved != ?")
            .bind(saved)
            .bind(article_id)
            .bind(saved)
            .execute(&mut *w.tx)
            .await?;
        w.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}
