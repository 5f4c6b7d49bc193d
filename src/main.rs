use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

use gather::feed::build_client;
use gather::{ArticleFilter, Config, Database, DatabaseError, FeedService, RefreshScheduler};

/// Get the config directory path (~/.config/gather/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("gather"))
}

#[derive(Parser, Debug)]
#[command(name = "gather", version, about = "Feed reader core: subscriptions, sync and articles")]
struct Args {
    /// Config file (default: ~/.config/gather/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Database file, overriding the config file
    #[arg(long, global = true, value_name = "FILE")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import an OPML subscription list (no FILE = cancelled selection)
    Import { file: Option<PathBuf> },
    /// Export subscriptions as OPML
    Export { file: PathBuf },
    /// Subscribe to a feed, or refresh it if already subscribed
    Add {
        url: String,
        #[arg(long)]
        group: Option<i64>,
    },
    /// Sync every feed now
    Refresh,
    /// Sync one feed
    Sync { feed_id: i64 },
    /// List feeds with unread counts
    Feeds,
    /// List groups
    Groups,
    /// List up to 100 recent articles
    Articles {
        #[arg(long)]
        feed: Option<i64>,
        #[arg(long)]
        group: Option<i64>,
        #[arg(long, default_value_t = ArticleFilter::All)]
        filter: ArticleFilter,
    },
    /// Print an article's sanitized content
    Content { article_id: i64 },
    /// Mark an article read (or unread)
    MarkRead {
        article_id: i64,
        #[arg(long)]
        unread: bool,
    },
    /// Save an article (or unsave it)
    MarkSaved {
        article_id: i64,
        #[arg(long)]
        unsave: bool,
    },
    /// Manage groups
    #[command(subcommand)]
    Group(GroupCommand),
    /// Move a feed into a group (no --group = root)
    MoveFeed {
        feed_id: i64,
        #[arg(long)]
        group: Option<i64>,
    },
    /// Unsubscribe from a feed and delete its articles
    DeleteFeed { feed_id: i64 },
    /// Run the background refresh timer until interrupted
    Watch,
}

#[derive(Subcommand, Debug)]
enum GroupCommand {
    Create {
        name: String,
        #[arg(long)]
        parent: Option<i64>,
    },
    Rename { id: i64, name: String },
    Delete { id: i64 },
    /// Re-parent a group (no --parent = root)
    Move {
        id: i64,
        #[arg(long)]
        parent: Option<i64>,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn done() -> Result<()> {
    print_json(&serde_json::json!({ "success": true }))
}

async fn open_database(path: &Path) -> Result<Database> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;

    match Database::open(path_str).await {
        Ok(db) => Ok(db),
        Err(DatabaseError::InstanceLocked) => {
            eprintln!(
                "Error: Another instance of gather appears to be running. Please close it and try again."
            );
            std::process::exit(1);
        }
        Err(e) => Err(anyhow::anyhow!("Failed to open database: {}", e)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries JSON output only
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    let db_path = args
        .database
        .clone()
        .or_else(|| config.database_path.clone())
        .unwrap_or_else(|| config_dir.join("gather.db"));
    let db = open_database(&db_path).await?;

    let client = build_client(&config.user_agent).context("Failed to build HTTP client")?;
    let service = FeedService::new(db, client, config.fetch_options());

    run(args.command, &service, &config).await
}

async fn run(command: Command, service: &FeedService, config: &Config) -> Result<()> {
    match command {
        Command::Import { file } => print_json(&service.import_subscriptions(file.as_deref()).await),
        Command::Export { file } => {
            let count = service.export_subscriptions(&file).await?;
            print_json(&serde_json::json!({ "success": true, "count": count }))
        }
        Command::Add { url, group } => print_json(&service.add_or_update_feed(&url, group).await),
        Command::Refresh => print_json(&service.refresh_all_feeds().await),
        Command::Sync { feed_id } => print_json(&service.sync_feed(feed_id).await),
        Command::Feeds => print_json(&service.list_feeds().await?),
        Command::Groups => print_json(&service.list_groups().await?),
        Command::Articles {
            feed,
            group,
            filter,
        } => print_json(&service.list_articles(feed, group, filter).await?),
        Command::Content { article_id } => {
            print_json(&service.get_article_content(article_id).await?)
        }
        Command::MarkRead { article_id, unread } => {
            service.mark_read(article_id, !unread).await?;
            done()
        }
        Command::MarkSaved { article_id, unsave } => {
            service.mark_saved(article_id, !unsave).await?;
            done()
        }
        Command::Group(group) => match group {
            GroupCommand::Create { name, parent } => {
                print_json(&service.create_group(&name, parent).await?)
            }
            GroupCommand::Rename { id, name } => print_json(&service.rename_group(id, &name).await?),
            GroupCommand::Delete { id } => {
                service.delete_group(id).await?;
                done()
            }
            GroupCommand::Move { id, parent } => {
                service.move_group(id, parent).await?;
                done()
            }
        },
        Command::MoveFeed { feed_id, group } => {
            service.move_feed_to_group(feed_id, group).await?;
            done()
        }
        Command::DeleteFeed { feed_id } => {
            service.delete_feed(feed_id).await?;
            done()
        }
        Command::Watch => watch(service, config).await,
    }
}

async fn watch(service: &FeedService, config: &Config) -> Result<()> {
    let Some(period) = config.refresh_interval() else {
        anyhow::bail!("Background refresh is disabled (refresh_interval_minutes = 0)");
    };

    let (report_tx, mut report_rx) = mpsc::channel(4);
    let scheduler = RefreshScheduler::spawn(service.clone(), period, Some(report_tx));

    loop {
        tokio::select! {
            biased;

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received interrupt, shutting down");
                break;
            }

            Some(entries) = report_rx.recv() => {
                print_json(&entries)?;
            }
        }
    }

    scheduler.shutdown().await;
    Ok(())
}
