//! channelmesh CLI
//!
//! Thin wrapper around channelmesh-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show node information
//! channelmesh info
//!
//! # Publish a channel and list the feed
//! channelmesh feed submit <drive_key> --bee <bee_key>
//! channelmesh feed list
//!
//! # Never show a channel again
//! channelmesh feed hide <drive_key>
//!
//! # Run a node that gossips feeds and answers searches
//! channelmesh serve --peer <endpoint_id> --resource videos --index index.json
//!
//! # Search locally and across peers
//! channelmesh search "cats" --resource videos --timeout-ms 2000
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use channelmesh_core::sync::parse_endpoint_id;
use channelmesh_core::{
    FeedEvent, MemorySearchIndex, MeshConfig, MeshEngine, SearchEngine, SearchOptions,
};
use clap::{Parser, Subcommand};
use tracing::debug;

/// channelmesh - channel discovery and federated search
#[derive(Parser)]
#[command(name = "channelmesh")]
#[command(version)]
#[command(about = "channelmesh - channel discovery and federated search over a P2P mesh")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Data directory (default: ~/.channelmesh/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show node information
    Info,

    /// Channel feed management
    Feed {
        #[command(subcommand)]
        action: FeedAction,
    },

    /// Run a node: gossip feeds and answer searches until Ctrl+C
    Serve {
        #[command(flatten)]
        net: NetArgs,
    },

    /// Search the local index and, unless --local, connected peers
    Search {
        /// Search text
        query: String,

        /// Maximum number of results
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// How long to wait for peer answers
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Restrict the search to one resource scope
        #[arg(long)]
        scope: Option<String>,

        /// Do not ask peers
        #[arg(long)]
        local: bool,

        #[command(flatten)]
        net: NetArgs,
    },
}

#[derive(Subcommand)]
enum FeedAction {
    /// List discovered channels, newest first
    List,

    /// List channels published from this node
    Published,

    /// Publish a channel
    Submit {
        /// 64-character hex drive key
        drive_key: String,

        /// 64-character hex public bee key
        #[arg(long)]
        bee: Option<String>,
    },

    /// Hide a channel from the feed, now and in future gossip
    Hide { drive_key: String },

    /// Withdraw a channel published from this node
    Unpublish { drive_key: String },

    /// Feed counters
    Stats,
}

#[derive(clap::Args)]
struct NetArgs {
    /// Endpoint id of a peer to connect to (repeatable)
    #[arg(short, long = "peer")]
    peers: Vec<String>,

    /// Search resource to join (repeatable)
    #[arg(short, long = "resource")]
    resources: Vec<String>,

    /// JSON file of documents for the local search index
    #[arg(short, long)]
    index: Option<PathBuf>,
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Get the default data directory (~/.channelmesh/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".channelmesh")
        .join("data")
}

fn load_config(path: Option<&Path>) -> Result<MeshConfig> {
    match path {
        Some(path) => MeshConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(MeshConfig::default()),
    }
}

fn load_index(path: Option<&Path>) -> Result<Arc<dyn SearchEngine>> {
    let index = match path {
        Some(path) => MemorySearchIndex::load(path)
            .with_context(|| format!("Failed to load index {}", path.display()))?,
        None => MemorySearchIndex::new(),
    };
    Ok(Arc::new(index))
}

/// Validate `--peer` values and add them to the bootstrap list
fn add_peers(config: &mut MeshConfig, peers: &[String]) -> Result<()> {
    for peer in peers {
        parse_endpoint_id(peer).with_context(|| format!("Invalid peer '{}'", peer))?;
        if !config.network.bootstrap_peers.contains(peer) {
            config.network.bootstrap_peers.push(peer.clone());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let mut config = load_config(cli.config.as_deref())?;
    debug!(data_dir = %data_dir.display(), "Using data directory");

    match cli.command {
        Commands::Info => {
            let engine = MeshEngine::offline(&data_dir, config, load_index(None)?)?;
            engine.start().await;
            let info = engine.node_info()?;

            println!("channelmesh v{}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("Node:");
            match info.node_id {
                Some(node_id) => println!("  ID: {}", node_id),
                None => println!("  ID: (created on first serve)"),
            }
            println!();
            println!("Data directory: {}", info.data_dir.display());
            println!("Feed entries: {}", info.stats.total_entries);
            println!("Published: {}", info.stats.published_count);
            println!("Hidden: {}", info.stats.hidden_count);
            engine.shutdown().await;
        }

        Commands::Feed { action } => {
            let engine = MeshEngine::offline(&data_dir, config, load_index(None)?)?;
            engine.start().await;
            let feed = engine.feed();

            match action {
                FeedAction::List => {
                    let entries = feed.get_feed();
                    if entries.is_empty() {
                        println!("No channels in feed.");
                    } else {
                        println!("Channels ({}):", entries.len());
                        for entry in entries {
                            let added = format_added(entry.added_at);
                            println!("  {} [{}] {}", entry.drive_key, entry.source, added);
                            if let Some(bee) = entry.public_bee_key {
                                println!("    bee: {}", bee);
                            }
                        }
                    }
                }

                FeedAction::Published => {
                    let published = feed.published_channels();
                    if published.is_empty() {
                        println!("No published channels.");
                    } else {
                        println!("Published ({}):", published.len());
                        for channel in published {
                            println!("  {}", channel.drive_key);
                        }
                    }
                }

                FeedAction::Submit { drive_key, bee } => {
                    let sent = feed.submit_channel(&drive_key, bee.as_deref())?;
                    println!("Channel published: {}", drive_key.to_lowercase());
                    println!("  Sent to {} peer(s)", sent);
                }

                FeedAction::Hide { drive_key } => {
                    if feed.hide_channel(&drive_key)? {
                        println!("Channel hidden: {}", drive_key.to_lowercase());
                    } else {
                        println!("Channel already hidden.");
                    }
                }

                FeedAction::Unpublish { drive_key } => {
                    if feed.unpublish_channel(&drive_key)? {
                        println!("Channel unpublished: {}", drive_key.to_lowercase());
                    } else {
                        println!("Channel was not published.");
                    }
                }

                FeedAction::Stats => {
                    let stats = feed.get_stats();
                    println!("Entries: {}", stats.total_entries);
                    println!("Published: {}", stats.published_count);
                    println!("Hidden: {}", stats.hidden_count);
                }
            }
            engine.shutdown().await;
        }

        Commands::Serve { net } => {
            add_peers(&mut config, &net.peers)?;
            let index = load_index(net.index.as_deref())?;

            println!("Starting channelmesh...");
            println!();

            let engine = MeshEngine::online(&data_dir, config, index).await?;
            let mut events = engine.feed().subscribe();
            engine.start().await;
            for resource in &net.resources {
                engine.join_search(resource).await?;
            }

            let info = engine.node_info()?;
            println!("Node:");
            if let Some(node_id) = &info.node_id {
                println!("  ID: {}", node_id);
            }
            println!();
            for resource in &net.resources {
                println!("Answering searches for: {}", resource);
            }
            println!("Data directory: {}", info.data_dir.display());
            println!();
            println!("Node is running. Press Ctrl+C to stop.");
            println!();

            let status_interval = Duration::from_secs(60);
            let mut last_status = std::time::Instant::now();

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        println!();
                        println!("Received shutdown signal...");
                        break;
                    }
                    event = events.recv() => {
                        if let Ok(FeedEvent::Updated) = event {
                            println!("[Feed] {} channel(s)", engine.feed().get_stats().total_entries);
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {
                        if last_status.elapsed() >= status_interval {
                            last_status = std::time::Instant::now();
                            let stats = engine.feed().get_stats();
                            println!(
                                "[Status] {} channel(s), {} feed peer(s), {} search peer(s)",
                                stats.total_entries,
                                stats.open_channels,
                                engine.query().open_channels()
                            );
                        }
                    }
                }
            }

            engine.shutdown().await;
            println!("Stopped.");
        }

        Commands::Search {
            query,
            top_k,
            timeout_ms,
            scope,
            local,
            net,
        } => {
            let index = load_index(net.index.as_deref())?;
            let options = SearchOptions {
                top_k,
                federated: !local,
                timeout: timeout_ms.map(Duration::from_millis),
                scope_key: scope,
            };

            let engine = if local {
                MeshEngine::offline(&data_dir, config, index)?
            } else {
                add_peers(&mut config, &net.peers)?;
                let engine = MeshEngine::online(&data_dir, config, index).await?;
                engine.start().await;
                for resource in &net.resources {
                    engine.join_search(resource).await?;
                }
                engine
            };

            let hits = engine.query().search(&query, options).await?;
            if hits.is_empty() {
                println!("No results.");
            } else {
                println!("Results ({}):", hits.len());
                for (rank, hit) in hits.iter().enumerate() {
                    println!("  {}. {} ({:.3})", rank + 1, hit.id, hit.score);
                    if !hit.metadata.is_null() {
                        println!("     {}", hit.metadata);
                    }
                }
            }
            engine.shutdown().await;
        }
    }

    Ok(())
}

/// `added_at` (unix millis) as a local timestamp
fn format_added(added_at: i64) -> String {
    chrono::DateTime::from_timestamp_millis(added_at)
        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}
