//! Everything that turns remote documents into stored rows.
//!
//! - [`parser`]: feed-rs parsing plus normalization and defaults
//! - [`sanitize`]: HTML cleaning applied to every article body
//! - [`fetcher`]: HTTP retrieval, per-feed sync and concurrent refresh-all
//! - [`opml`]: subscription list import tree and export

pub mod fetcher;
pub mod opml;
pub mod parser;
pub mod sanitize;

pub use fetcher::{
    add_or_update_feed, build_client, refresh_all, sync_feed, FeedSync, FetchError, FetchOptions,
    FetchResult, DEFAULT_USER_AGENT,
};
pub use opml::{export_opml, export_to_file, parse_opml_content, OpmlError, MAX_OPML_DEPTH};
pub use parser::{parse_feed, ParsedFeed, UNTITLED_ARTICLE, UNTITLED_FEED};
pub use sanitize::sanitize_html;
