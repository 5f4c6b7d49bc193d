use anyhow::Result;
use feed_rs::model::{Entry, Link};
use feed_rs::parser;
use sha2::{Digest, Sha256};

use super::sanitize::sanitize_html;
use crate::storage::{FeedMetadata, NewArticle};
use crate::util::strip_control_chars;

/// Fallback title for a feed document without one
pub const UNTITLED_FEED: &str = "Untitled Feed";
/// Fallback title for an item without one
pub const UNTITLED_ARTICLE: &str = "No Title";

/// A fetched feed document, normalized and ready to store.
#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub metadata: FeedMetadata,
    pub articles: Vec<NewArticle>,
}

/// Parse an RSS, Atom or JSON Feed document.
///
/// Every item comes out with its body sanitized and defaults applied for
/// missing fields. Items without a publish date are stamped with `now`
/// (Unix seconds).
pub fn parse_feed(bytes: &[u8], now: i64) -> Result<ParsedFeed> {
    let feed = parser::parse(bytes)?;

    let title = feed
        .title
        .map(|t| clean_text(&t.content))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| UNTITLED_FEED.to_string());
    let description = feed
        .description
        .map(|d| clean_text(&d.content))
        .filter(|d| !d.is_empty());
    let html_url = feed
        .links
        .iter()
        .find(|l| l.rel.as_deref() != Some("self"))
        .map(|l| l.href.clone());
    let icon_url = feed.icon.or(feed.logo).map(|image| image.uri);

    let articles = feed
        .entries
        .into_iter()
        .map(|entry| normalize_entry(entry, now))
        .collect();

    Ok(ParsedFeed {
        metadata: FeedMetadata {
            title,
            description,
            html_url,
            icon_url,
        },
        articles,
    })
}

fn normalize_entry(entry: Entry, now: i64) -> NewArticle {
    let title = entry
        .title
        .as_ref()
        .map(|t| clean_text(&t.content))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| UNTITLED_ARTICLE.to_string());
    let published = entry
        .published
        .or(entry.updated)
        .map(|dt| dt.timestamp())
        .unwrap_or(now);
    let author = entry
        .authors
        .first()
        .map(|p| clean_text(&p.name))
        .unwrap_or_default();

    let raw_body = entry
        .content
        .as_ref()
        .and_then(|c| c.body.as_deref())
        .or_else(|| entry.summary.as_ref().map(|s| s.content.as_str()))
        .unwrap_or("");
    let content = sanitize_html(raw_body);

    let url = article_key(article_link(&entry.links), &entry.id, &title, published);

    NewArticle {
        url,
        title,
        content,
        author,
        published,
    }
}

/// The item's own page: an `alternate` (or untyped) link, else the first link.
fn article_link(links: &[Link]) -> Option<&str> {
    links
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
        .or_else(|| links.first())
        .map(|l| l.href.trim())
        .filter(|href| !href.is_empty())
}

/// Dedup key for an item: its link, else its entry id, else a digest of
/// title and publish time.
fn article_key(link: Option<&str>, id: &str, title: &str, published: i64) -> String {
    if let Some(link) = link {
        return link.to_string();
    }

    let id = id.trim();
    if !id.is_empty() {
        return id.to_string();
    }

    let hash = Sha256::digest(format!("{title}|{published}").as_bytes());
    format!("urn:sha256:{:x}", hash)
}

fn clean_text(s: &str) -> String {
    strip_control_chars(s).trim().to_string()
}
