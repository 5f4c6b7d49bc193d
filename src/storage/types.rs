use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("Another instance of gather appears to be running. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_message(&err.to_string()) {
            return DatabaseError::InstanceLocked;
        }
        DatabaseError::Other(err)
    }
}

/// A group mutation refused because it would break the folder tree's rules
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GroupRuleError {
    #[error("Group name cannot be empty or whitespace-only")]
    EmptyName,

    #[error("Parent group {0} does not exist")]
    MissingParent(i64),

    #[error("Cannot move group {0} under itself or one of its descendants")]
    Cycle(i64),
}

/// SQLITE_BUSY (5), SQLITE_LOCKED (6) and SQLITE_CANTOPEN (14) all surface as
/// one of these messages.
pub(crate) fn is_lock_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
        || message.contains("sqlite_locked")
        || message.contains("unable to open database file")
}

// ============================================================================
// Write-side Inputs
// ============================================================================

/// One node of a parsed subscription list.
///
/// Folders carry their children in document order; feeds are leaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outline {
    Folder {
        title: String,
        children: Vec<Outline>,
    },
    Feed(OpmlFeed),
}

/// A feed subscription read from an interchange document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpmlFeed {
    pub title: String,
    pub xml_url: String,
    pub html_url: Option<String>,
}

/// Channel-level metadata captured on every successful fetch
#[derive(Debug, Clone, Default)]
pub struct FeedMetadata {
    pub title: String,
    pub description: Option<String>,
    pub html_url: Option<String>,
    pub icon_url: Option<String>,
}

/// A normalized, sanitized article ready for insertion.
///
/// All defaults for missing feed fields have already been applied.
#[derive(Debug, Clone)]
pub struct NewArticle {
    pub url: String,
    pub title: String,
    pub content: String,
    pub author: String,
    pub published: i64,
}

/// Row counts produced by a subscription import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub groups_created: usize,
    pub feeds_created: usize,
    /// Entries that failed to insert; duplicates are not counted here
    pub skipped: usize,
}

// ============================================================================
// Read-side Rows
// ============================================================================

/// A folder in the group tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub parent_id: Option<i64>,
}

/// Feed data from database, with its unread count
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Feed {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub description: Option<String>,
    pub html_url: Option<String>,
    pub icon_url: Option<String>,
    pub group_id: Option<i64>,
    pub last_fetched: Option<i64>,
    /// Last sync failure, cleared on the next successful sync
    pub error: Option<String>,
    pub unread_count: i64,
}

/// Article list entry; the body is fetched separately by id
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ArticleSummary {
    pub id: i64,
    pub feed_id: i64,
    pub feed_title: String,
    pub icon_url: Option<String>,
    pub title: String,
    pub author: Option<String>,
    pub published: i64,
    pub url: String,
    pub read: bool,
    pub saved: bool,
}

/// Read/saved filter for article listings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArticleFilter {
    #[default]
    All,
    Unread,
    Saved,
}

impl fmt::Display for ArticleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArticleFilter::All => "all",
            ArticleFilter::Unread => "unread",
            ArticleFilter::Saved => "saved",
        };
        f.write_str(name)
    }
}

impl FromStr for ArticleFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(ArticleFilter::All),
            "unread" => Ok(ArticleFilter::Unread),
            "saved" => Ok(ArticleFilter::Saved),
            other => Err(format!("unknown filter '{other}' (expected all, unread or saved)")),
        }
    }
}
