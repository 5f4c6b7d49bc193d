use anyhow::{Context, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::Path;
use thiserror::Error;

use crate::storage::{Feed, Group, OpmlFeed, Outline};
use crate::util::validate_url_with;

/// Deepest folder nesting kept on import. Outlines below it are flattened
/// into the folder at this depth.
pub const MAX_OPML_DEPTH: usize = 50;

/// Errors that can occur during OPML parsing.
#[derive(Debug, Error)]
pub enum OpmlError {
    #[error("XML parse error: {0}")]
    XmlParse(String),

    #[error("Failed to read OPML file: {0}")]
    Io(#[from] std::io::Error),
}

/// Read and parse an OPML subscription list from disk.
///
/// See [`parse_opml_content`] for the tree rules.
pub async fn parse(path: &Path, allow_private_hosts: bool) -> Result<Vec<Outline>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(OpmlError::Io)
        .with_context(|| format!("Failed to read OPML file: {}", path.display()))?;
    parse_opml_content(&content, allow_private_hosts)
}

/// An `<outline>` whose end tag has not been seen yet
enum Frame {
    Folder { title: String, children: Vec<Outline> },
    Feed { feed: OpmlFeed, children: Vec<Outline> },
    Skipped { children: Vec<Outline> },
}

impl Frame {
    fn children_mut(&mut self) -> &mut Vec<Outline> {
        match self {
            Frame::Folder { children, .. }
            | Frame::Feed { children, .. }
            | Frame::Skipped { children } => children,
        }
    }
}

/// Parse OPML text into an outline tree.
///
/// - An outline with a usable `xmlUrl` is a feed, whatever its `type`.
/// - An outline without one is a folder; folders with no surviving
///   children are dropped.
/// - Titles come from `text`, else `title`, else stay empty (the importer
///   substitutes a placeholder).
/// - Entries whose `xmlUrl` fails validation are logged and skipped; any
///   outlines nested inside them move up to the enclosing folder.
/// - Nesting of any depth is accepted. Folders deeper than
///   [`MAX_OPML_DEPTH`] are not created; the feeds inside them land in the
///   deepest kept folder.
///
/// Entity declarations in a DOCTYPE are never expanded: quick-xml only
/// resolves the five predefined XML entities, and an attribute with any
/// other entity reference is treated as absent.
///
/// # Errors
///
/// [`OpmlError::XmlParse`] for malformed XML.
pub fn parse_opml_content(content: &str, allow_private_hosts: bool) -> Result<Vec<Outline>> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut roots: Vec<Outline> = Vec::new();
    let mut open: Vec<Frame> = Vec::new();
    // Open outlines past MAX_OPML_DEPTH, which have no frame of their own
    let mut flattened: usize = 0;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                if open.len() >= MAX_OPML_DEPTH {
                    if flattened == 0 {
                        tracing::warn!(
                            max_depth = MAX_OPML_DEPTH,
                            "OPML nesting too deep, flattening inner folders"
                        );
                    }
                    flattened += 1;
                    if let OutlineKind::Feed(feed) = read_outline(&e, &reader, allow_private_hosts) {
                        attach(&mut open, &mut roots, Outline::Feed(feed));
                    }
                } else {
                    let frame = match read_outline(&e, &reader, allow_private_hosts) {
                        OutlineKind::Feed(feed) => Frame::Feed {
                            feed,
                            children: Vec::new(),
                        },
                        OutlineKind::Folder(title) => Frame::Folder {
                            title,
                            children: Vec::new(),
                        },
                        OutlineKind::Rejected => Frame::Skipped {
                            children: Vec::new(),
                        },
                    };
                    open.push(frame);
                }
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                match read_outline(&e, &reader, allow_private_hosts) {
                    OutlineKind::Feed(feed) => {
                        attach(&mut open, &mut roots, Outline::Feed(feed));
                    }
                    OutlineKind::Folder(title) => {
                        tracing::debug!(folder = %title, "Skipping empty OPML folder");
                    }
                    OutlineKind::Rejected => {}
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                if flattened > 0 {
                    flattened -= 1;
                } else if let Some(frame) = open.pop() {
                    close(frame, &mut open, &mut roots);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(OpmlError::XmlParse(e.to_string()).into()),
            _ => {}
        }
        buf.clear();
    }

    Ok(roots)
}

fn attach(open: &mut [Frame], roots: &mut Vec<Outline>, node: Outline) {
    match open.last_mut() {
        Some(parent) => parent.children_mut().push(node),
        None => roots.push(node),
    }
}

fn close(frame: Frame, open: &mut [Frame], roots: &mut Vec<Outline>) {
    match frame {
        Frame::Folder { title, children } => {
            if children.is_empty() {
                tracing::debug!(folder = %title, "Skipping empty OPML folder");
            } else {
                attach(open, roots, Outline::Folder { title, children });
            }
        }
        Frame::Feed { feed, children } => {
            attach(open, roots, Outline::Feed(feed));
            for child in children {
                attach(open, roots, child);
            }
        }
        Frame::Skipped { children } => {
            for child in children {
                attach(open, roots, child);
            }
        }
    }
}

enum OutlineKind {
    Feed(OpmlFeed),
    Folder(String),
    Rejected,
}

fn read_outline(
    e: &BytesStart<'_>,
    reader: &Reader<&[u8]>,
    allow_private_hosts: bool,
) -> OutlineKind {
    let mut xml_url = None;
    let mut html_url = None;
    let mut title = None;
    let mut text = None;

    for attr in e.attributes() {
        let attr = match attr {
            Ok(attr) => attr,
            Err(err) => {
                tracing::warn!(error = %err, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let value = match attr.decode_and_unescape_value(reader.decoder()) {
            Ok(value) => value.into_owned(),
            Err(err) => {
                tracing::warn!(error = %err, "Skipping undecodable OPML attribute");
                continue;
            }
        };
        match attr.key.as_ref() {
            b"xmlUrl" => xml_url = Some(value),
            b"htmlUrl" => html_url = Some(value),
            b"title" => title = Some(value),
            b"text" => text = Some(value),
            _ => {}
        }
    }

    let title = text
        .filter(|t| !t.trim().is_empty())
        .or(title)
        .unwrap_or_default();

    let Some(xml_url) = xml_url else {
        return OutlineKind::Folder(title);
    };
    if let Err(err) = validate_url_with(&xml_url, allow_private_hosts) {
        tracing::warn!(url = %xml_url, error = %err, "Skipping invalid feed URL");
        return OutlineKind::Rejected;
    }

    let html_url = html_url.filter(|url| match validate_url_with(url, allow_private_hosts) {
        Ok(_) => true,
        Err(err) => {
            tracing::warn!(url = %url, error = %err, "Ignoring invalid htmlUrl in OPML");
            false
        }
    });

    OutlineKind::Feed(OpmlFeed {
        title,
        xml_url: xml_url.trim().to_string(),
        html_url,
    })
}

// ============================================================================
// Export
// ============================================================================

/// Render the subscription tree as an OPML 2.0 document.
///
/// Groups become nested folder outlines (in the order given, which
/// `list_groups` makes name order), feeds become `type="rss"` leaves inside
/// their group, and feeds without a group sit directly under `<body>`. A
/// group whose parent is not in `groups` is treated as top level.
pub fn export_opml(groups: &[Group], feeds: &[Feed]) -> Result<String> {
    let known: HashMap<i64, &Group> = groups.iter().map(|g| (g.id, g)).collect();

    let mut child_groups: HashMap<Option<i64>, Vec<&Group>> = HashMap::new();
    for group in groups {
        let parent = group.parent_id.filter(|p| known.contains_key(p));
        child_groups.entry(parent).or_default().push(group);
    }
    let mut group_feeds: HashMap<Option<i64>, Vec<&Feed>> = HashMap::new();
    for feed in feeds {
        let group = feed.group_id.filter(|g| known.contains_key(g));
        group_feeds.entry(group).or_default().push(feed);
    }

    let tree = ExportTree {
        child_groups,
        group_feeds,
    };

    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .context("Failed to write XML declaration")?;

    let mut opml = BytesStart::new("opml");
    opml.push_attribute(("version", "2.0"));
    writer.write_event(Event::Start(opml))?;

    writer.write_event(Event::Start(BytesStart::new("head")))?;
    writer.write_event(Event::Start(BytesStart::new("title")))?;
    writer.write_event(Event::Text(BytesText::new("gather subscriptions")))?;
    writer.write_event(Event::End(BytesEnd::new("title")))?;
    writer.write_event(Event::End(BytesEnd::new("head")))?;

    writer.write_event(Event::Start(BytesStart::new("body")))?;
    tree.write_body(&mut writer)?;
    writer.write_event(Event::End(BytesEnd::new("body")))?;

    writer.write_event(Event::End(BytesEnd::new("opml")))?;

    let bytes = writer.into_inner().into_inner();
    String::from_utf8(bytes).context("Generated OPML contains invalid UTF-8")
}

struct ExportTree<'a> {
    child_groups: HashMap<Option<i64>, Vec<&'a Group>>,
    group_feeds: HashMap<Option<i64>, Vec<&'a Feed>>,
}

/// Pending work while walking the group tree
enum Step<'a> {
    /// Subgroups then feeds of a group (`None` = body)
    Level(Option<i64>),
    Open(&'a Group),
    Feeds(Option<i64>),
    Close,
}

impl<'a> ExportTree<'a> {
    /// Write every outline under `<body>`, groups before feeds at each level.
    ///
    /// Walks with an explicit stack, so group depth is unbounded.
    fn write_body(&self, writer: &mut Writer<Cursor<Vec<u8>>>) -> Result<()> {
        let mut pending: Vec<Step<'a>> = vec![Step::Level(None)];

        while let Some(step) = pending.pop() {
            match step {
                Step::Level(parent) => {
                    pending.push(Step::Feeds(parent));
                    let groups = self.child_groups.get(&parent).into_iter().flatten();
                    pending.extend(groups.rev().map(|group| Step::Open(*group)));
                }
                Step::Open(group) => {
                    let mut outline = BytesStart::new("outline");
                    outline.push_attribute(("text", group.name.as_str()));
                    outline.push_attribute(("title", group.name.as_str()));
                    writer.write_event(Event::Start(outline))?;
                    pending.push(Step::Close);
                    pending.push(Step::Level(Some(group.id)));
                }
                Step::Feeds(parent) => {
                    for feed in self.group_feeds.get(&parent).into_iter().flatten() {
                        write_feed(writer, feed)?;
                    }
                }
                Step::Close => {
                    writer.write_event(Event::End(BytesEnd::new("outline")))?;
                }
            }
        }
        Ok(())
    }
}

fn write_feed(writer: &mut Writer<Cursor<Vec<u8>>>, feed: &Feed) -> Result<()> {
    let mut outline = BytesStart::new("outline");
    outline.push_attribute(("type", "rss"));
    outline.push_attribute(("text", feed.title.as_str()));
    outline.push_attribute(("title", feed.title.as_str()));
    outline.push_attribute(("xmlUrl", feed.url.as_str()));
    if let Some(html_url) = feed.html_url.as_deref() {
        outline.push_attribute(("htmlUrl", html_url));
    }
    writer.write_event(Event::Empty(outline))?;
    Ok(())
}

/// Write the OPML export to `path` without ever leaving a partial file.
///
/// The document goes to a fresh sibling temp file first, is flushed to disk,
/// then renamed over the destination.
pub fn export_to_file(groups: &[Group], feeds: &[Feed], path: &Path) -> Result<()> {
    let content = export_opml(groups, feeds)?;

    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_path = path.with_extension(format!("tmp.{}.{:x}", std::process::id(), nonce));

    let written = (|| -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create '{}'", temp_path.display()))?;
        file.write_all(content.as_bytes())
            .with_context(|| format!("Failed to write '{}'", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync '{}'", temp_path.display()))?;
        std::fs::rename(&temp_path, path).with_context(|| {
            format!(
                "Failed to move '{}' to '{}'",
                temp_path.display(),
                path.display()
            )
        })
    })();

    if written.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    written
}
