//! Feed synchronization and local storage core for a desktop feed reader.
//!
//! - [`storage`]: SQLite store for groups, feeds, articles and settings
//! - [`feed`]: fetching, parsing, sanitizing and OPML import/export
//! - [`service`]: the request/response boundary a presentation shell calls
//! - [`scheduler`]: the background refresh timer
//! - [`config`]: optional TOML configuration

pub mod config;
pub mod feed;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod util;

pub use config::{Config, ConfigError};
pub use scheduler::RefreshScheduler;
pub use service::{FeedOutcome, FeedService, ImportOutcome, RefreshEntry, ServiceError};
pub use storage::{ArticleFilter, Database, DatabaseError};
