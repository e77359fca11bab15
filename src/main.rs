use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use newsdesk::config::Config;
use newsdesk::feed::{FeedFilter, Sampler};
use newsdesk::net::{
    spawn_poll, Connectivity, NewsApiClient, NewsSource, NewsWatcher, WatchEvent,
    LAST_BATCH_KEY_PREFIX,
};
use newsdesk::session::{FeedOrigin, NewsSession};
use newsdesk::storage::{Article, Category, Database, PersistenceAdapter, StorageError};
use newsdesk::util::{strip_control_chars, truncate_to_width};

const TITLE_WIDTH: usize = 72;

/// Get the config directory path (~/.config/newsdesk/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("newsdesk"))
}

#[derive(Parser, Debug)]
#[command(name = "newsdesk", about = "Offline-aware headline reader backed by NewsAPI")]
struct Args {
    /// Start offline: serve the last fetched batch and skip the network
    #[arg(long, global = true)]
    offline: bool,

    /// Reset database (delete and recreate)
    #[arg(long)]
    reset_db: bool,

    /// Config file (default: ~/.config/newsdesk/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the headline feed for a category
    Headlines {
        #[arg(short, long)]
        category: Option<Category>,
        /// Comma-separated: latest, popular, followed, saved
        #[arg(short, long, value_delimiter = ',')]
        filter: Vec<FeedFilter>,
    },
    /// Search all articles (online only)
    Search { query: String },
    /// Save or unsave a previously listed article by URL
    Save { url: String },
    /// Keep or drop an offline copy of a previously listed article by URL
    Offline { url: String },
    /// Follow or unfollow a source by name
    Follow { source: String },
    /// List saved articles
    Saved,
    /// List articles available offline
    OfflineList,
    /// List categories with a cached batch for offline use
    Cached,
    /// Show related content for an article in a category's last batch
    Related {
        url: String,
        #[arg(short, long)]
        category: Option<Category>,
    },
    /// Poll headlines and report new top stories until interrupted
    Watch {
        #[arg(short, long)]
        category: Option<Category>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        println!("Created config directory: {}", config_dir.display());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(&config_dir, std::fs::Permissions::from_mode(0o700))
        {
            tracing::warn!(
                path = %config_dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    tracing::debug!(config = ?config, "Effective configuration");

    let db_path = config_dir.join("newsdesk.db");
    if args.reset_db && db_path.exists() {
        std::fs::remove_file(&db_path).context("Failed to delete database")?;
        println!("Database reset.");
    }

    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(StorageError::InstanceLocked) => {
            eprintln!(
                "Error: Another instance of newsdesk appears to be running. Please close it and try again."
            );
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };
    let db = Arc::new(db);
    let kv: Arc<dyn PersistenceAdapter> = Arc::clone(&db) as Arc<dyn PersistenceAdapter>;

    let client =
        NewsApiClient::new(config.news_api_config()).context("Invalid news API configuration")?;
    let source: Arc<dyn NewsSource> = Arc::new(client);

    let connectivity = if args.offline {
        Connectivity::Offline
    } else {
        Connectivity::Online
    };
    let session = NewsSession::load(
        Arc::clone(&source),
        kv,
        connectivity,
        Arc::new(Sampler::from_entropy()),
        config.raw_batch_memory_slots,
    )
    .await;

    let default_category = config.category()?;
    let result = run(
        args.command,
        &session,
        &db,
        source,
        &config,
        default_category,
    )
    .await;

    if let Err(e) = session.flush_pending().await {
        tracing::warn!(error = %e, "Some changes could not be written to disk");
        eprintln!("Warning: {e}");
    }
    result
}

async fn run(
    command: Command,
    session: &NewsSession,
    db: &Database,
    source: Arc<dyn NewsSource>,
    config: &Config,
    default_category: Category,
) -> Result<()> {
    match command {
        Command::Headlines { category, filter } => {
            let category = category.unwrap_or(default_category);
            let view = session.load_feed(category, &filter).await;
            if view.origin == FeedOrigin::OfflineCache {
                println!("(offline: showing the last {} batch)", category);
            }
            print_articles(view.feed.articles());
        }
        Command::Search { query } => {
            let feed = session.search(&query).await?;
            print_articles(feed.articles());
        }
        Command::Save { url } => {
            let article = known_article(session, &url).await?;
            let outcome = session.toggle_saved(&article).await?;
            println!("{} {}", if outcome.added { "Saved" } else { "Unsaved" }, article.title);
            warn_unpersisted(outcome.persisted);
        }
        Command::Offline { url } => {
            let article = known_article(session, &url).await?;
            let outcome = session.toggle_offline(&article).await?;
            let verb = if outcome.added { "Stored offline:" } else { "Removed offline copy:" };
            println!("{verb} {}", article.title);
            warn_unpersisted(outcome.persisted);
        }
        Command::Follow { source } => {
            let outcome = session.toggle_follow(&source).await?;
            let verb = if outcome.added { "Following" } else { "Unfollowed" };
            println!("{verb} {}", source.trim());
            warn_unpersisted(outcome.persisted);
        }
        Command::Saved => {
            for saved in session.saved_articles().await {
                let minutes = saved.read_time_minutes.unwrap_or_default();
                println!(
                    "{:>3} min  {}  {}",
                    minutes,
                    truncate_to_width(&saved.article.title, TITLE_WIDTH),
                    saved.article.id
                );
            }
        }
        Command::OfflineList => {
            for offline in session.offline_articles().await {
                println!(
                    "{}  {}  {}",
                    offline.saved_at.format("%Y-%m-%d %H:%M"),
                    truncate_to_width(&offline.snapshot.title, TITLE_WIDTH),
                    offline.snapshot.id
                );
            }
        }
        Command::Cached => {
            let keys = db
                .keys_with_prefix(LAST_BATCH_KEY_PREFIX)
                .await
                .context("Failed to list cached batches")?;
            if keys.is_empty() {
                println!("  (none)");
            }
            for key in keys {
                let label = key.trim_start_matches(LAST_BATCH_KEY_PREFIX);
                match label.parse::<Category>() {
                    Ok(category) => {
                        let count = session.gate().last_batch(category).await.len();
                        println!("  {label:<14} {count} articles");
                    }
                    Err(_) => tracing::debug!(key = %key, "Ignoring unrecognized cache key"),
                }
            }
        }
        Command::Related { url, category } => {
            let category = category.unwrap_or(default_category);
            let pool = session.gate().last_batch(category).await;
            let focal = match pool.iter().find(|a| a.id == url) {
                Some(a) => a.clone(),
                None => known_article(session, &url).await?,
            };
            if let Some(bundle) = session.select(&focal, &pool).await {
                println!("Same source:");
                print_articles(&bundle.same_source);
                println!("Trending:");
                print_articles(&bundle.trending);
                println!("Recommended:");
                print_articles(&bundle.recommended);
            }
        }
        Command::Watch { category } => {
            let category = category.unwrap_or(default_category);
            session.gate().require_online("watch")?;

            let (tx, mut rx) = mpsc::channel(16);
            let handle = spawn_poll(source, category, config.poll_interval(), NewsWatcher::new(), tx);
            println!(
                "Watching {} headlines every {} min (Ctrl+C to stop)",
                category, config.poll_interval_minutes
            );

            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(WatchEvent::NewArticle(article)) => {
                            println!("New: {}  {}", strip_control_chars(&article.title), article.id);
                        }
                        Some(WatchEvent::FetchFailed(reason)) => {
                            eprintln!("Poll failed: {reason}");
                        }
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            drop(rx);
            handle.await.context("Polling task failed")?;
        }
    }
    Ok(())
}

async fn known_article(session: &NewsSession, url: &str) -> Result<Article> {
    session
        .articles()
        .get(url)
        .await
        .with_context(|| format!("Unknown article {url}; list it with `headlines` or `search` first"))
}

fn warn_unpersisted(persisted: bool) {
    if !persisted {
        eprintln!("Warning: change kept in memory only; it will be retried on the next write");
    }
}

fn print_articles(articles: &[Article]) {
    if articles.is_empty() {
        println!("  (none)");
        return;
    }
    for article in articles {
        let title = strip_control_chars(&article.title);
        let source = strip_control_chars(article.source_name.as_deref().unwrap_or("-"));
        println!(
            "  {}  [{}]  {}",
            truncate_to_width(&title, TITLE_WIDTH),
            source,
            article.id
        );
    }
}
