use anyhow::Result;

use super::schema::Database;
use super::types::{ImportSummary, Outline};
use crate::util::strip_control_chars;

/// Title stored for folders and feeds that carry none
pub const UNTITLED: &str = "Untitled";

impl Database {
    // ========================================================================
    // Subscription Import
    // ========================================================================

    /// Materialize a parsed subscription tree as groups and feeds.
    ///
    /// Nodes are visited depth-first, parent before children, so a new
    /// folder's ID is known before its children are inserted. Feeds use
    /// `INSERT OR IGNORE` on the URL: an existing subscription is skipped, not
    /// updated. A node whose insert fails is logged and skipped (a failed
    /// folder takes its subtree with it) without aborting its siblings.
    ///
    /// The whole tree commits in one transaction.
    pub async fn import_outlines(&self, outlines: &[Outline]) -> Result<ImportSummary> {
        let mut summary = ImportSummary::default();
        let mut w = self.begin_write().await?;

        // Reversed pushes keep document order when popping.
        let mut stack: Vec<(&Outline, Option<i64>)> =
            outlines.iter().rev().map(|node| (node, None)).collect();

        while let Some((node, parent_id)) = stack.pop() {
            match node {
                Outline::Feed(feed) => {
                    let title = display_title(&feed.title);
                    let result = sqlx::query(
                        "INSERT OR IGNORE INTO feeds (url, title, html_url, group_id) VALUES (?, ?, ?, ?)",
                    )
                    .bind(&feed.xml_url)
                    .bind(&title)
                    .bind(&feed.html_url)
                    .bind(parent_id)
                    .execute(&mut *w.tx)
                    .await;

                    match result {
                        Ok(done) if done.rows_affected() > 0 => summary.feeds_created += 1,
                        Ok(_) => {
                            tracing::debug!(url = %feed.xml_url, "Feed already subscribed, skipping");
                        }
                        Err(e) => {
                            tracing::warn!(url = %feed.xml_url, error = %e, "Failed to import feed");
                            summary.skipped += 1;
                        }
                    }
                }
                Outline::Folder { title, children } => {
                    let name = display_title(title);
                    let result: Result<(i64,), sqlx::Error> = sqlx::query_as(
                        "INSERT INTO groups (name, parent_id) VALUES (?, ?) RETURNING id",
                    )
                    .bind(&name)
                    .bind(parent_id)
                    .fetch_one(&mut *w.tx)
                    .await;

                    match result {
                        Ok((group_id,)) => {
                            summary.groups_created += 1;
                            stack.extend(children.iter().rev().map(|child| (child, Some(group_id))));
                        }
                        Err(e) => {
                            tracing::warn!(folder = %name, error = %e, "Failed to import folder, skipping its entries");
                            summary.skipped += 1;
                        }
                    }
                }
            }
        }

        w.commit().await?;
        tracing::info!(
            groups = summary.groups_created,
            feeds = summary.feeds_created,
            skipped = summary.skipped,
            "Imported subscriptions"
        );
        Ok(summary)
    }
}

fn display_title(raw: &str) -> String {
    let cleaned = strip_control_chars(raw);
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        UNTITLED.to_owned()
    } else {
        trimmed.to_owned()
    }
}
