use anyhow::Result;

use super::schema::Database;
use super::types::{Group, GroupRuleError};
use crate::util::strip_control_chars;

impl Database {
    // ========================================================================
    // Group Operations
    // ========================================================================

    /// Strip control characters, trim whitespace, and reject empty names.
    pub(crate) fn sanitize_group_name(name: &str) -> Result<String> {
        let sanitized = strip_control_chars(name);
        let trimmed = sanitized.trim();
        if trimmed.is_empty() {
            return Err(GroupRuleError::EmptyName.into());
        }
        Ok(trimmed.to_owned())
    }

    /// Create a new group under `parent_id` (or at the root).
    ///
    /// Names need not be unique. A `parent_id` that does not exist is rejected.
    pub async fn create_group(&self, name: &str, parent_id: Option<i64>) -> Result<Group> {
        let clean_name = Self::sanitize_group_name(name)?;

        let mut w = self.begin_write().await?;
        if let Some(pid) = parent_id {
            let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM groups WHERE id = ?")
                .bind(pid)
                .fetch_optional(&mut *w.tx)
                .await?;
            if exists.is_none() {
                return Err(GroupRuleError::MissingParent(pid).into());
            }
        }

        let group = sqlx::query_as::<_, Group>(
            "INSERT INTO groups (name, parent_id) VALUES (?, ?) RETURNING id, name, parent_id",
        )
        .bind(&clean_name)
        .bind(parent_id)
        .fetch_one(&mut *w.tx)
        .await?;
        w.commit().await?;

        Ok(group)
    }

    /// Rename an existing group, returning the updated row.
    pub async fn rename_group(&self, id: i64, new_name: &str) -> Result<Option<Group>> {
        let clean_name = Self::sanitize_group_name(new_name)?;

        let mut w = self.begin_write().await?;
        let group = sqlx::query_as::<_, Group>(
            "UPDATE groups SET name = ? WHERE id = ? RETURNING id, name, parent_id",
        )
        .bind(&clean_name)
        .bind(id)
        .fetch_optional(&mut *w.tx)
        .await?;
        w.commit().await?;
        Ok(group)
    }

    /// Delete a group. Its feeds move to the root; they are never deleted.
    ///
    /// Child groups are lifted to the root by the ON DELETE SET NULL FK.
    /// Returns `false` when no group has this ID.
    pub async fn delete_group(&self, id: i64) -> Result<bool> {
        let mut w = self.begin_write().await?;

        sqlx::query("UPDATE feeds SET group_id = NULL WHERE group_id = ?")
            .bind(id)
            .execute(&mut *w.tx)
            .await?;

        let result = sqlx::query("DELETE FROM groups WHERE id = ?")
            .bind(id)
            .execute(&mut *w.tx)
            .await?;

        w.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move a feed into a group, or to the root if `group_id` is `None`.
    ///
    /// Returns `false` when no feed has this ID.
    pub async fn move_feed_to_group(&self, feed_id: i64, group_id: Option<i64>) -> Result<bool> {
        let mut w = self.begin_write().await?;
        let result = sqlx::query("UPDATE feeds SET group_id = ? WHERE id = ?")
            .bind(group_id)
            .bind(feed_id)
            .execute(&mut *w.tx)
            .await?;
        w.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Re-parent a group, or move it to the root if `parent_id` is `None`.
    ///
    /// Rejects moves that would make a group its own ancestor.
    /// Returns `false` when no group has this ID.
    pub async fn move_group(&self, id: i64, parent_id: Option<i64>) -> Result<bool> {
        let mut w = self.begin_write().await?;

        if let Some(pid) = parent_id {
            // Walk up from the new parent; meeting `id` on the way means a cycle.
            // LIMIT bounds the walk if corrupted data already holds a cycle.
            let ancestors: Vec<(i64,)> = sqlx::query_as(
                r#"
                WITH RECURSIVE ancestors(id, parent_id) AS (
                    SELECT id, parent_id FROM groups WHERE id = ?
                    UNION ALL
                    SELECT g.id, g.parent_id
                    FROM groups g
                    JOIN ancestors a ON g.id = a.parent_id
                    LIMIT 1000
                )
                SELECT id FROM ancestors
                "#,
            )
            .bind(pid)
            .fetch_all(&mut *w.tx)
            .await?;

            if ancestors.is_empty() {
                return Err(GroupRuleError::MissingParent(pid).into());
            }
            if ancestors.iter().any(|(ancestor,)| *ancestor == id) {
                return Err(GroupRuleError::Cycle(id).into());
            }
        }

        let result = sqlx::query("UPDATE groups SET parent_id = ? WHERE id = ?")
            .bind(parent_id)
            .bind(id)
            .execute(&mut *w.tx)
            .await?;
        w.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// All groups as a flat list ordered by name.
    /// Callers build the tree from `parent_id`.
    pub async fn list_groups(&self) -> Result<Vec<Group>> {
        let groups = sqlx::query_as::<_, Group>(
            "SELECT id, name, parent_id FROM groups ORDER BY name, id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(groups)
    }

    pub async fn get_group(&self, id: i64) -> Result<Option<Group>> {
        let group = sqlx::query_as::<_, Group>("SELECT id, name, parent_id FROM groups WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(group)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, GroupRuleError};

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    async fn add_feed(db: &Database, n: i64) -> i64 {
        db.insert_feed(
            &format!("https://feed{n}.example.com/rss"),
            &format!("Feed {n}"),
            None,
            None,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_group() {
        let db = test_db().await;

        let group = db.create_group("Tech", None).await.unwrap();
        assert!(group.id > 0);
        assert_eq!(group.name, "Tech");

        let groups = db.list_groups().await.unwrap();
        assert_eq!(groups, vec![group]);
    }

    #[tokio::test]
    async fn test_create_group_with_missing_parent_rejected() {
        let db = test_db().await;
        let result = db.create_group("Orphan", Some(77)).await;
        assert!(result.unwrap_err().to_string().contains("does not exist"));
        assert!(db.list_groups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_names_allowed() {
        let db = test_db().await;
        db.create_group("Same", None).await.unwrap();
        db.create_group("Same", None).await.unwrap();
        assert_eq!(db.list_groups().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_move_feed_to_group_and_back() {
        let db = test_db().await;
        let feed_id = add_feed(&db, 1).await;
        let group = db.create_group("News", None).await.unwrap();

        assert!(db.move_feed_to_group(feed_id, Some(group.id)).await.unwrap());
        assert_eq!(db.get_feed(feed_id).await.unwrap().unwrap().group_id, Some(group.id));

        assert!(db.move_feed_to_group(feed_id, None).await.unwrap());
        assert_eq!(db.get_feed(feed_id).await.unwrap().unwrap().group_id, None);

        assert!(!db.move_feed_to_group(9999, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_group_moves_feeds_to_root() {
        let db = test_db().await;
        let f1 = add_feed(&db, 1).await;
        let f2 = add_feed(&db, 2).await;
        let group = db.create_group("Disposable", None).await.unwrap();
        db.move_feed_to_group(f1, Some(group.id)).await.unwrap();
        db.move_feed_to_group(f2, Some(group.id)).await.unwrap();

        assert!(db.delete_group(group.id).await.unwrap());

        let feeds = db.list_feeds().await.unwrap();
        assert_eq!(feeds.len(), 2);
        assert!(feeds.iter().all(|f| f.group_id.is_none()));
        assert!(db.list_groups().await.unwrap().is_empty());
        assert!(!db.delete_group(group.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_group_lifts_children_to_root() {
        let db = test_db().await;
        let parent = db.create_group("Parent", None).await.unwrap();
        let child = db.create_group("Child", Some(parent.id)).await.unwrap();

        db.delete_group(parent.id).await.unwrap();

        let groups = db.list_groups().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].id, child.id);
        assert_eq!(groups[0].parent_id, None);
    }

    #[tokio::test]
    async fn test_move_group_rejects_cycles() {
        let db = test_db().await;
        let root = db.create_group("Root", None).await.unwrap();
        let child = db.create_group("Child", Some(root.id)).await.unwrap();
        let grandchild = db.create_group("Grandchild", Some(child.id)).await.unwrap();

        let onto_self = db.move_group(root.id, Some(root.id)).await.unwrap_err();
        assert!(onto_self.to_string().contains("descendants"));

        let onto_descendant = db.move_group(root.id, Some(grandchild.id)).await.unwrap_err();
        assert_eq!(
            onto_descendant.downcast_ref::<GroupRuleError>(),
            Some(&GroupRuleError::Cycle(root.id))
        );

        assert!(db.move_group(grandchild.id, Some(root.id)).await.unwrap());
        assert!(db.move_group(child.id, None).await.unwrap());

        let child = db.get_group(child.id).await.unwrap().unwrap();
        assert_eq!(child.parent_id, None);
    }

    #[tokio::test]
    async fn test_list_groups_ordering() {
        let db = test_db().await;
        db.create_group("Zebra", None).await.unwrap();
        db.create_group("Alpha", None).await.unwrap();
        db.create_group("Middle", None).await.unwrap();

        let names: Vec<String> = db.list_groups().await.unwrap().into_iter().map(|g| g.name).collect();
        assert_eq!(names, vec!["Alpha", "Middle", "Zebra"]);
    }

    #[tokio::test]
    async fn test_rename_group() {
        let db = test_db().await;
        let group = db.create_group("Old Name", None).await.unwrap();

        let renamed = db.rename_group(group.id, "  New Name  ").await.unwrap().unwrap();
        assert_eq!(renamed.name, "New Name");
        assert!(db.rename_group(9999, "Nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_group_name_strips_control_chars() {
        let db = test_db().await;
        let group = db.create_group("\x1b[31mEvil\x1b[0m", None).await.unwrap();
        assert_eq!(group.name, "Evil");
    }

    #[tokio::test]
    async fn test_group_name_rejects_empty() {
        let db = test_db().await;
        for bad in ["", "   ", "\x1b[31m\x1b[0m"] {
            let result = db.create_group(bad, None).await;
            assert!(result.unwrap_err().to_string().contains("empty"));
        }

        let group = db.create_group("Valid", None).await.unwrap();
        assert!(db.rename_group(group.id, "").await.is_err());
        assert_eq!(db.list_groups().await.unwrap()[0].name, "Valid");
    }
}
