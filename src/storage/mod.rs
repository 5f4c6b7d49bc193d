//! Local SQLite store for groups, feeds, articles and settings.
//!
//! Every multi-row mutation runs in one transaction, and all write
//! transactions are serialized through the handle's writer lock.

mod articles;
mod feeds;
mod groups;
mod import;
mod schema;
mod settings;
mod types;

pub use articles::ARTICLE_LIST_LIMIT;
pub use import::UNTITLED;
pub use schema::Database;
pub use settings::LAST_REFRESH_KEY;
pub use types::{
    ArticleFilter, ArticleSummary, DatabaseError, Feed, FeedMetadata, Group, GroupRuleError,
    ImportSummary, NewArticle, OpmlFeed, Outline,
};
