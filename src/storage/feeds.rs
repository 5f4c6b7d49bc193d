use anyhow::Result;
use sqlx::QueryBuilder;

use super::schema::{Database, WriteTx};
use super::types::{Feed, FeedMetadata, NewArticle};

/// Articles per multi-row INSERT: 7 columns * 50 rows = 350 bound
/// parameters, under SQLite's 999 limit
const ARTICLE_BATCH_SIZE: usize = 50;

/// Feed columns plus the unread aggregate, shared by every feed query
const FEED_SELECT: &str = r#"
    SELECT
        f.id, f.url, f.title, f.description, f.html_url, f.icon_url,
        f.group_id, f.last_fetched, f.error,
        COUNT(CASE WHEN a.read = 0 THEN 1 END) AS unread_count
    FROM feeds f
    LEFT JOIN articles a ON f.id = a.feed_id
"#;

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Subscribe to a feed without fetching it.
    ///
    /// Re-adding an existing URL updates title and site link in place and
    /// returns the existing ID; group assignment is left untouched.
    pub async fn insert_feed(
        &self,
        url: &str,
        title: &str,
        html_url: Option<&str>,
        group_id: Option<i64>,
    ) -> Result<i64> {
        let mut w = self.begin_write().await?;
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feeds (url, title, html_url, group_id)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET
                title = excluded.title,
                html_url = excluded.html_url
            RETURNING id
        "#,
        )
        .bind(url)
        .bind(title)
        .bind(html_url)
        .bind(group_id)
        .fetch_one(&mut *w.tx)
        .await?;
        w.commit().await?;
        Ok(row.0)
    }

    /// Store the result of a successful fetch in one transaction.
    ///
    /// The feed row is upserted by URL first (metadata refreshed, error
    /// cleared, identity and group preserved), then every article is inserted
    /// with `INSERT OR IGNORE` against the unique article URL, so items seen on
    /// an earlier sync are never touched again.
    ///
    /// Used when subscribing by address. Syncs of an existing feed go through
    /// [`update_fetched_feed`](Self::update_fetched_feed) instead, which never
    /// creates a row.
    ///
    /// # Returns
    ///
    /// The feed ID and the number of newly inserted articles.
    pub async fn store_fetched_feed(
        &self,
        url: &str,
        group_id: Option<i64>,
        metadata: &FeedMetadata,
        articles: &[NewArticle],
    ) -> Result<(i64, usize)> {
        let now = chrono::Utc::now().timestamp();
        let mut w = self.begin_write().await?;

        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feeds (url, title, description, html_url, icon_url, group_id, last_fetched)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET
                title = excluded.title,
                description = excluded.description,
                html_url = excluded.html_url,
                icon_url = COALESCE(excluded.icon_url, feeds.icon_url),
                last_fetched = excluded.last_fetched,
                error = NULL
            RETURNING id
        "#,
        )
        .bind(url)
        .bind(&metadata.title)
        .bind(&metadata.description)
        .bind(&metadata.html_url)
        .bind(&metadata.icon_url)
        .bind(group_id)
        .bind(now)
        .fetch_one(&mut *w.tx)
        .await?;
        let feed_id = row.0;

        let inserted = insert_articles(&mut w, feed_id, articles, now).await?;
        w.commit().await?;
        Ok((feed_id, inserted))
    }

    /// Store a fetch result for an existing feed, addressed by ID.
    ///
    /// Same merge as [`store_fetched_feed`](Self::store_fetched_feed), but
    /// the row is only updated, never inserted: a feed deleted while its
    /// fetch was in flight stays deleted.
    ///
    /// # Returns
    ///
    /// The number of newly inserted articles, or `None` when no feed has this
    /// ID any more (nothing is written).
    pub async fn update_fetched_feed(
        &self,
        feed_id: i64,
        metadata: &FeedMetadata,
        articles: &[NewArticle],
    ) -> Result<Option<usize>> {
        let now = chrono::Utc::now().timestamp();
        let mut w = self.begin_write().await?;

        let result = sqlx::query(
            r#"
            UPDATE feeds SET
                title = ?,
                description = ?,
                html_url = ?,
                icon_url = COALESCE(?, icon_url),
                last_fetched = ?,
                error = NULL
            WHERE id = ?
        "#,
        )
        .bind(&metadata.title)
        .bind(&metadata.description)
        .bind(&metadata.html_url)
        .bind(&metadata.icon_url)
        .bind(now)
        .bind(feed_id)
        .execute(&mut *w.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }

        let inserted = insert_articles(&mut w, feed_id, articles, now).await?;
        w.commit().await?;
        Ok(Some(inserted))
    }

    /// Get all feeds with their unread counts, ordered by title
    ///
    /// Ties on title are broken by ID so the order is stable across calls.
    pub async fn list_feeds(&self) -> Result<Vec<Feed>> {
        let query = format!("{FEED_SELECT} GROUP BY f.id ORDER BY f.title, f.id");
        let feeds = sqlx::query_as::<_, Feed>(&query)
            .fetch_all(&self.pool)
            .await?;
        Ok(feeds)
    }

    /// Get a single feed by ID
    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<Feed>> {
        let query = format!("{FEED_SELECT} WHERE f.id = ? GROUP BY f.id");
        let feed = sqlx::query_as::<_, Feed>(&query)
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(feed)
    }

    /// `(id, url)` for every subscribed feed, for bulk refresh
    pub async fn feed_sources(&self) -> Result<Vec<(i64, String)>> {
        let rows = sqlx::query_as("SELECT id, url FROM feeds ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Delete a feed; its articles go with it (ON DELETE CASCADE).
    ///
    /// Returns `false` when no feed has this ID.
    pub async fn delete_feed(&self, feed_id: i64) -> Result<bool> {
        let mut w = self.begin_write().await?;
        let result = sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(feed_id)
            .execute(&mut *w.tx)
            .await?;
        w.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Set or clear the error status for a feed
    pub async fn set_feed_error(&self, feed_id: i64, error: Option<&str>) -> Result<()> {
        let mut w = self.begin_write().await?;
        sqlx::query("UPDATE feeds SET error = ? WHERE id = ?")
            .bind(error)
            .bind(feed_id)
            .execute(&mut *w.tx)
            .await?;
        w.commit().await?;
        Ok(())
    }

    /// Batch update feed error statuses in a single UPDATE statement.
    ///
    /// # Arguments
    ///
    /// * `updates` - Slice of (feed_id, error_message) tuples. `None` clears the error.
    pub async fn batch_set_feed_errors(&self, updates: &[(i64, Option<String>)]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }

        // Build: UPDATE feeds SET error = CASE id
        //            WHEN 1 THEN 'error1'
        //            WHEN 2 THEN NULL
        //        END
        //        WHERE id IN (1, 2)
        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("UPDATE feeds SET error = CASE id ");

        for (feed_id, error) in updates {
            builder.push("WHEN ");
            builder.push_bind(*feed_id);
            builder.push(" THEN ");
            builder.push_bind(error.as_deref());
            builder.push(" ");
        }

        builder.push("END WHERE id IN (");
        let mut separated = builder.separated(", ");
        for (feed_id, _) in updates {
            separated.push_bind(*feed_id);
        }
        separated.push_unseparated(")");

        let mut w = self.begin_write().await?;
        builder.build().execute(&mut *w.tx).await?;
        w.commit().await?;

        Ok(())
    }
}

/// Insert articles for `feed_id` inside an open write, skipping known links.
async fn insert_articles(
    w: &mut WriteTx<'_>,
    feed_id: i64,
    articles: &[NewArticle],
    fetched_at: i64,
) -> Result<usize> {
    let mut inserted: usize = 0;

    for chunk in articles.chunks(ARTICLE_BATCH_SIZE) {
        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "INSERT OR IGNORE INTO articles (feed_id, title, content, author, published, url, fetched_at) ",
        );
        builder.push_values(chunk, |mut b, article| {
            b.push_bind(feed_id)
                .push_bind(&article.title)
                .push_bind(&article.content)
                .push_bind(&article.author)
                .push_bind(article.published)
                .push_bind(&article.url)
                .push_bind(fetched_at);
        });
        let result = builder.build().execute(&mut *w.tx).await?;
        inserted += result.rows_affected() as usize;
    }
    Ok(inserted)
}
