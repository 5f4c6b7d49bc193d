//! End-to-end tests through `FeedService`: import, subscribe, sync, refresh.
//!
//! Feeds are served by a local wiremock server, so every service here is
//! built with `allow_private_hosts` set.

use std::path::PathBuf;

use gather::feed::FetchOptions;
use gather::storage::ArticleFilter;
use gather::{Database, FeedService};
use pretty_assertions::assert_eq;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn service() -> FeedService {
    let db = Database::open(":memory:").await.unwrap();
    let options = FetchOptions {
        allow_private_hosts: true,
        ..FetchOptions::default()
    };
    FeedService::new(db, reqwest::Client::new(), options)
}

fn temp_file(name: &str, content: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("gather_sync_test_{}_{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let file = dir.join("subscriptions.opml");
    std::fs::write(&file, content).unwrap();
    file
}

fn rss(title: &str, items: &[(&str, &str, &str)]) -> String {
    let items: String = items
        .iter()
        .map(|(item_title, link, description)| {
            format!(
                "<item><title>{item_title}</title><link>{link}</link>\
                 <description>{description}</description>\
                 <pubDate>Tue, 10 Jun 2025 04:00:00 GMT</pubDate></item>"
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0"?><rss version="2.0"><channel><title>{title}</title><link>https://site.example/</link>{items}</channel></rss>"#
    )
}

async fn mount_feed(server: &MockServer, route: &str, body: String) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_import_places_feed_in_group() {
    let svc = service().await;
    let file = temp_file(
        "import",
        r#"<?xml version="1.0"?>
<opml version="2.0">
  <head><title>Subscriptions</title></head>
  <body>
    <outline text="Tech">
      <outline text="Example" type="rss" xmlUrl="https://example.com/rss"/>
    </outline>
  </body>
</opml>"#,
    );

    let outcome = svc.import_subscriptions(Some(&file)).await;
    assert!(outcome.success);
    assert_eq!(outcome.count, 1);

    let groups = svc.list_groups().await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].name, "Tech");

    let feeds = svc.list_feeds().await.unwrap();
    assert_eq!(feeds.len(), 1);
    assert_eq!(feeds[0].title, "Example");
    assert_eq!(feeds[0].url, "https://example.com/rss");
    assert_eq!(feeds[0].group_id, Some(groups[0].id));

    std::fs::remove_dir_all(file.parent().unwrap()).ok();
}

#[tokio::test]
async fn test_sync_is_idempotent() {
    let server = MockServer::start().await;
    mount_feed(
        &server,
        "/feed",
        rss(
            "Blog",
            &[
                ("One", "https://blog.example/1", "first"),
                ("Two", "https://blog.example/2", "second"),
            ],
        ),
    )
    .await;
    let svc = service().await;

    let added = svc
        .add_or_update_feed(&format!("{}/feed", server.uri()), None)
        .await;
    assert!(added.success, "{:?}", added.message);
    assert_eq!(added.new_articles, Some(2));
    assert_eq!(added.title.as_deref(), Some("Blog"));

    let feed_id = added.feed_id.unwrap();
    let again = svc.sync_feed(feed_id).await;
    assert!(again.success);
    assert_eq!(again.feed_id, Some(feed_id));
    assert_eq!(again.new_articles, Some(0));

    let articles = svc
        .list_articles(Some(feed_id), None, ArticleFilter::All)
        .await
        .unwrap();
    assert_eq!(articles.len(), 2);
}

#[tokio::test]
async fn test_read_state_survives_resync() {
    let server = MockServer::start().await;
    mount_feed(
        &server,
        "/feed",
        rss("Blog", &[("One", "https://blog.example/1", "first")]),
    )
    .await;
    let svc = service().await;

    let feed_id = svc
        .add_or_update_feed(&format!("{}/feed", server.uri()), None)
        .await
        .feed_id
        .unwrap();
    let article_id = svc
        .list_articles(Some(feed_id), None, ArticleFilter::All)
        .await
        .unwrap()[0]
        .id;
    svc.mark_read(article_id, true).await.unwrap();
    svc.mark_saved(article_id, true).await.unwrap();

    svc.sync_feed(feed_id).await;

    let articles = svc
        .list_articles(Some(feed_id), None, ArticleFilter::All)
        .await
        .unwrap();
    assert_eq!(articles.len(), 1);
    assert!(articles[0].read);
    assert!(articles[0].saved);
    assert_eq!(svc.list_feeds().await.unwrap()[0].unread_count, 0);
}

#[tokio::test]
async fn test_refresh_failure_is_isolated() {
    let server = MockServer::start().await;
    mount_feed(
        &server,
        "/good",
        rss("Good", &[("Post", "https://good.example/post", "hello")]),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let svc = service().await;
    let good = svc
        .database()
        .insert_feed(&format!("{}/good", server.uri()), "Good", None, None)
        .await
        .unwrap();
    let broken = svc
        .database()
        .insert_feed(&format!("{}/broken", server.uri()), "Broken", None, None)
        .await
        .unwrap();

    let mut entries = svc.refresh_all_feeds().await;
    entries.sort_by_key(|e| e.feed_id);
    assert_eq!(entries.len(), 2);

    let good_entry = entries.iter().find(|e| e.feed_id == good).unwrap();
    assert!(good_entry.success);
    assert_eq!(good_entry.new_articles, Some(1));

    let broken_entry = entries.iter().find(|e| e.feed_id == broken).unwrap();
    assert!(!broken_entry.success);
    assert!(broken_entry.error.as_deref().unwrap().contains("500"));

    let broken_row = svc
        .list_feeds()
        .await
        .unwrap()
        .into_iter()
        .find(|f| f.id == broken)
        .unwrap();
    assert!(broken_row.error.is_some());
    assert!(svc.last_refresh().await.unwrap().is_some());
}

#[tokio::test]
async fn test_unsubscribe_during_refresh_is_kept() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(rss("Slow", &[("Post", "https://slow.example/post", "x")]))
                .set_delay(std::time::Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let svc = service().await;
    let group = svc.create_group("News", None).await.unwrap();
    let feed_id = svc
        .database()
        .insert_feed(&format!("{}/slow", server.uri()), "Slow", None, Some(group.id))
        .await
        .unwrap();

    let refresh = tokio::spawn({
        let svc = svc.clone();
        async move { svc.refresh_all_feeds().await }
    });
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    svc.delete_feed(feed_id).await.unwrap();

    let entries = refresh.await.unwrap();
    assert_eq!(entries.len(), 1);
    assert!(!entries[0].success);
    assert!(svc.list_feeds().await.unwrap().is_empty());
    assert!(svc
        .list_articles(None, None, ArticleFilter::All)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_article_content_is_sanitized() {
    let server = MockServer::start().await;
    mount_feed(
        &server,
        "/feed",
        rss(
            "Blog",
            &[(
                "Unsafe",
                "https://blog.example/unsafe",
                "&lt;p onclick=\"steal()\"&gt;Hi&lt;/p&gt;&lt;script&gt;alert(1)&lt;/script&gt;\
                 &lt;a href=\"javascript:alert(2)\"&gt;x&lt;/a&gt;",
            )],
        ),
    )
    .await;
    let svc = service().await;
    let feed_id = svc
        .add_or_update_feed(&format!("{}/feed", server.uri()), None)
        .await
        .feed_id
        .unwrap();

    let article = &svc
        .list_articles(Some(feed_id), None, ArticleFilter::All)
        .await
        .unwrap()[0];
    let content = svc.get_article_content(article.id).await.unwrap().unwrap();

    assert!(content.contains("Hi"));
    assert!(!content.contains("<script"));
    assert!(!content.contains("onclick"));
    assert!(!content.contains("javascript:"));
}

#[tokio::test]
async fn test_delete_group_keeps_feeds() {
    let svc = service().await;
    let group = svc.create_group("Tech", None).await.unwrap();
    let feed_id = svc
        .database()
        .insert_feed("https://example.com/rss", "Example", None, Some(group.id))
        .await
        .unwrap();

    svc.delete_group(group.id).await.unwrap();

    let feeds = svc.list_feeds().await.unwrap();
    assert_eq!(feeds.len(), 1);
    assert_eq!(feeds[0].id, feed_id);
    assert_eq!(feeds[0].group_id, None);
    assert!(svc.list_groups().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_shared_link_stored_once_across_feeds() {
    let server = MockServer::start().await;
    mount_feed(
        &server,
        "/a",
        rss("A", &[("Shared", "https://news.example/story", "from a")]),
    )
    .await;
    mount_feed(
        &server,
        "/b",
        rss("B", &[("Shared", "https://news.example/story", "from b")]),
    )
    .await;
    let svc = service().await;

    let a = svc.add_or_update_feed(&format!("{}/a", server.uri()), None).await;
    let b = svc.add_or_update_feed(&format!("{}/b", server.uri()), None).await;
    assert_eq!(a.new_articles, Some(1));
    assert_eq!(b.new_articles, Some(0));

    let all = svc.list_articles(None, None, ArticleFilter::All).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].feed_id, a.feed_id.unwrap());
}

#[tokio::test]
async fn test_filters_combine_feed_and_read_state() {
    let server = MockServer::start().await;
    mount_feed(
        &server,
        "/a",
        rss(
            "A",
            &[
                ("A1", "https://a.example/1", "x"),
                ("A2", "https://a.example/2", "x"),
            ],
        ),
    )
    .await;
    mount_feed(&server, "/b", rss("B", &[("B1", "https://b.example/1", "x")])).await;
    let svc = service().await;
    let group = svc.create_group("Only A", None).await.unwrap();

    let a = svc
        .add_or_update_feed(&format!("{}/a", server.uri()), Some(group.id))
        .await
        .feed_id
        .unwrap();
    svc.add_or_update_feed(&format!("{}/b", server.uri()), None)
        .await;

    let in_a = svc
        .list_articles(Some(a), None, ArticleFilter::All)
        .await
        .unwrap();
    assert_eq!(in_a.len(), 2);
    svc.mark_read(in_a[0].id, true).await.unwrap();

    let unread_in_group = svc
        .list_articles(None, Some(group.id), ArticleFilter::Unread)
        .await
        .unwrap();
    assert_eq!(unread_in_group.len(), 1);
    assert_eq!(unread_in_group[0].feed_id, a);
    assert!(!unread_in_group[0].read);

    assert!(svc
        .list_articles(None, None, ArticleFilter::Saved)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        svc.list_articles(None, None, ArticleFilter::All)
            .await
            .unwrap()
            .len(),
        3
    );
}

#[tokio::test]
async fn test_export_then_import_round_trip() {
    let svc = service().await;
    let group = svc.create_group("Tech", None).await.unwrap();
    svc.database()
        .insert_feed("https://example.com/rss", "Example", None, Some(group.id))
        .await
        .unwrap();
    svc.database()
        .insert_feed("https://root.example/rss", "Root", None, None)
        .await
        .unwrap();

    let dir = std::env::temp_dir().join(format!("gather_sync_test_export_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let file = dir.join("export.opml");
    assert_eq!(svc.export_subscriptions(&file).await.unwrap(), 2);

    let fresh = service().await;
    let outcome = fresh.import_subscriptions(Some(&file)).await;
    assert!(outcome.success);
    assert_eq!(outcome.count, 2);

    let groups = fresh.list_groups().await.unwrap();
    let feeds = fresh.list_feeds().await.unwrap();
    let example = feeds.iter().find(|f| f.url == "https://example.com/rss").unwrap();
    assert_eq!(example.group_id, Some(groups[0].id));
    let root = feeds.iter().find(|f| f.url == "https://root.example/rss").unwrap();
    assert_eq!(root.group_id, None);

    std::fs::remove_dir_all(&dir).ok();
}
