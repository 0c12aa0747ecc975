use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use futures::FutureExt;
use metrics::counter;
use tokio::signal;
use tracing::{info, warn};
use unistore_api::{
    new_resource_server, FeatureToggles, KeyPattern, ListRequest, Resource, ResourceApi, ResourceKey,
    ResourceServer, SearchRequest, ServerOptions, Version, WatchEvent, WatchEventType, WatchRequest, FLAG_UNIFIED_STORAGE_SEARCH,
};
use unistore_persist::{ProviderOptions, SqliteProvider};

#[derive(Parser, Debug)]
#[command(name = "unistorectl", version, about = "Unistore CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Database file (default: ~/.unistore/unistore.db)
    #[arg(long = "db", env = "UNISTORE_DB_PATH", global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or update a resource from a YAML or JSON file ("-" for stdin)
    Put {
        /// Key, e.g. "playlist.grafana.app/playlists/default/fav"
        key: String,
        file: String,
        /// Expected current version; 0 creates only
        #[arg(long = "expect")]
        expect: Option<Version>,
    },
    /// Print a resource (latest, or a retained version)
    Get {
        key: String,
        #[arg(long = "version")]
        version: Option<Version>,
    },
    /// Delete a resource
    Rm {
        key: String,
        #[arg(long = "expect")]
        expect: Option<Version>,
    },
    /// List resources matching a pattern ("group/resource/namespace/name", `*` wildcards)
    Ls {
        #[arg(default_value = "")]
        pattern: String,
        #[arg(long = "limit")]
        limit: Option<usize>,
        /// Continue token from a previous page
        #[arg(long = "continue")]
        continue_token: Option<String>,
    },
    /// Show every retained version of a key
    History { key: String },
    /// Watch a pattern and print +/- events until Ctrl-C. Polls the database,
    /// so writes from other processes show up.
    Watch {
        #[arg(default_value = "")]
        pattern: String,
        /// Report changes after this version (default: the current version)
        #[arg(long = "since")]
        since: Option<Version>,
        /// Poll interval in milliseconds
        #[arg(long = "interval", default_value_t = 1000)]
        interval_ms: u64,
    },
    /// Search the index (builds it on startup)
    Search {
        /// Query: free text plus ns:/g:/r:/k:/label:k=v/anno:k=v filters
        query: String,
        #[arg(long = "limit", default_value_t = 20)]
        limit: usize,
        /// Explain filter stages and counts
        #[arg(long = "explain", action = ArgAction::SetTrue)]
        explain: bool,
    },
    /// Store version, index state and watcher count
    Health,
}

const DEFAULT_LOG: &str = "info";

/// `UNISTORE_LOG` if it parses as a filter, otherwise `info`.
fn log_filter(raw: Option<&str>) -> tracing_subscriber::EnvFilter {
    raw.and_then(|s| tracing_subscriber::EnvFilter::from_str(s).ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new(DEFAULT_LOG))
}

fn init_tracing() {
    let filter = log_filter(std::env::var("UNISTORE_LOG").ok().as_deref());
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("UNISTORE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid UNISTORE_METRICS_ADDR; expected host:port");
        }
    }
}

async fn open_server(db: Option<&str>, features: &FeatureToggles) -> Result<Arc<ResourceServer>> {
    let provider = match db {
        Some(path) => SqliteProvider::open(path, ProviderOptions::from_env())?,
        None => SqliteProvider::open_default()?,
    };
    let mut opts = ServerOptions::from_env();
    // One-shot commands have nothing to supervise.
    opts.supervise = false;
    Ok(new_resource_server(Arc::new(provider), opts, features).await?)
}

/// Parse a YAML or JSON document into the JSON bytes stored for a resource.
fn payload_from_text(text: &str) -> Result<Vec<u8>> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => serde_yaml::from_str(text).context("payload is neither JSON nor YAML")?,
    };
    Ok(serde_json::to_vec(&value)?)
}

fn read_input(file: &str) -> Result<String> {
    if file == "-" {
        let mut buf = String::new();
        std::io::Read::read_to_string(&mut std::io::stdin(), &mut buf)?;
        return Ok(buf);
    }
    std::fs::read_to_string(file).with_context(|| format!("reading {}", file))
}

/// Stored payload as JSON for printing; non-JSON payloads become a string.
fn object(value: &[u8]) -> serde_json::Value {
    serde_json::from_slice(value).unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(value).into_owned()))
}

fn created_at(value: &[u8]) -> Option<i64> {
    let ts = Resource::decode(value).ok()?.metadata.creation_timestamp?;
    chrono::DateTime::parse_from_rfc3339(&ts).ok().map(|t| t.timestamp())
}

/// Changes committed after `after` by any process sharing the database, oldest
/// first. A short-lived watch with `since` replays them from the change log.
async fn poll_changes(server: &ResourceServer, pattern: &KeyPattern, after: Version) -> Result<Vec<WatchEvent>> {
    let mut sub = server.watch(WatchRequest { pattern: pattern.clone(), since: Some(after) }).await?;
    let mut events = Vec::new();
    while let Some(Some(item)) = sub.recv().now_or_never() {
        events.push(item?);
    }
    Ok(events)
}

fn print_event(output: Output, ev: &WatchEvent) {
    match output {
        Output::Human => {
            let sign = if ev.event_type == WatchEventType::Deleted { '-' } else { '+' };
            println!("{} {} {}", sign, ev.key, ev.version());
        }
        Output::Json => println!(
            "{}",
            serde_json::json!({
                "type": ev.event_type.as_str(),
                "key": ev.key,
                "resourceVersion": ev.version(),
                "object": object(&ev.resource.value),
            })
        ),
    }
}

fn kind_of(value: &[u8]) -> String { Resource::decode(value).map(|r| r.kind).unwrap_or_else(|_| "-".to_string()) }

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let mut features = FeatureToggles::from_env();
    if matches!(cli.command, Commands::Search { .. }) {
        features = features.with(FLAG_UNIFIED_STORAGE_SEARCH);
    }
    let server = open_server(cli.db.as_deref(), &features).await?;

    match cli.command {
        Commands::Put { key, file, expect } => {
            counter!("cli_commands_total", 1u64, "cmd" => "put");
            let key = ResourceKey::from_str(&key)?;
            let value = payload_from_text(&read_input(&file)?)?;
            let rv = server.write(&key, value, expect).await?;
            match cli.output {
                Output::Human => println!("{} written at version {}", key, rv),
                Output::Json => println!("{}", serde_json::json!({ "key": key, "resourceVersion": rv })),
            }
        }
        Commands::Get { key, version } => {
            counter!("cli_commands_total", 1u64, "cmd" => "get");
            let key = ResourceKey::from_str(&key)?;
            let got = server.read(&key, version).await?;
            match cli.output {
                Output::Human => {
                    println!("# {} @ {}", key, got.resource_version);
                    print!("{}", serde_yaml::to_string(&object(&got.value))?);
                }
                Output::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "key": key,
                        "resourceVersion": got.resource_version,
                        "object": object(&got.value),
                    }))?
                ),
            }
        }
        Commands::Rm { key, expect } => {
            counter!("cli_commands_total", 1u64, "cmd" => "rm");
            let key = ResourceKey::from_str(&key)?;
            let rv = server.delete(&key, expect).await?;
            match cli.output {
                Output::Human => println!("{} deleted at version {}", key, rv),
                Output::Json => println!("{}", serde_json::json!({ "key": key, "resourceVersion": rv })),
            }
        }
        Commands::Ls { pattern, limit, continue_token } => {
            counter!("cli_commands_total", 1u64, "cmd" => "ls");
            let pattern = KeyPattern::from_str(&pattern)?;
            info!(pattern = %pattern, limit = ?limit, "ls invoked");
            let resp = server.list(ListRequest { pattern, limit, continue_token }).await?;
            match cli.output {
                Output::Human => {
                    println!("{:<56} {:<10} {:<16} AGE", "KEY", "VERSION", "KIND");
                    for item in &resp.items {
                        let age = created_at(&item.resource.value).map(render_age).unwrap_or_else(|| "-".to_string());
                        println!(
                            "{:<56} {:<10} {:<16} {}",
                            item.key.to_string(),
                            item.resource.resource_version,
                            kind_of(&item.resource.value),
                            age
                        );
                    }
                    if let Some(next) = &resp.next {
                        eprintln!("more results: --continue {}", next);
                    }
                }
                Output::Json => {
                    let items: Vec<_> = resp
                        .items
                        .iter()
                        .map(|i| serde_json::json!({ "key": i.key, "resourceVersion": i.resource.resource_version, "object": object(&i.resource.value) }))
                        .collect();
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&serde_json::json!({
                            "items": items,
                            "continue": resp.next,
                            "resourceVersion": resp.resource_version,
                        }))?
                    );
                }
            }
        }
        Commands::History { key } => {
            counter!("cli_commands_total", 1u64, "cmd" => "history");
            let key = ResourceKey::from_str(&key)?;
            let entries = server.history(&key).await?;
            match cli.output {
                Output::Human => {
                    println!("{:<10} ACTION", "VERSION");
                    for e in &entries {
                        println!("{:<10} {}", e.resource.resource_version, e.action.as_str());
                    }
                }
                Output::Json => {
                    let rows: Vec<_> = entries
                        .iter()
                        .map(|e| serde_json::json!({ "action": e.action.as_str(), "resourceVersion": e.resource.resource_version, "object": object(&e.resource.value) }))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
        }
        Commands::Watch { pattern, since, interval_ms } => {
            counter!("cli_commands_total", 1u64, "cmd" => "watch");
            let pattern = KeyPattern::from_str(&pattern)?;
            let mut last = match since {
                Some(v) => v,
                None => server.is_healthy().await?.resource_version,
            };
            info!(pattern = %pattern, since = last, interval_ms, "watch invoked");
            let mut tick = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        match poll_changes(&server, &pattern, last).await {
                            Ok(events) => {
                                for ev in events {
                                    last = last.max(ev.version());
                                    print_event(cli.output, &ev);
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "watch poll failed");
                                eprintln!("watch error: {}", e);
                                break;
                            }
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }
        }
        Commands::Search { query, limit, explain } => {
            counter!("cli_commands_total", 1u64, "cmd" => "search");
            let wait_secs = std::env::var("UNISTORE_WAIT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(8);
            server.wait_ready(Duration::from_secs(wait_secs)).await?;
            info!(query = %query, limit, "search invoked");
            let resp = server.search(SearchRequest { query, limit: Some(limit) }).await?;
            match cli.output {
                Output::Human => {
                    println!("{:<56} {:<10} {:<8} AGE", "KEY", "VERSION", "SCORE");
                    for h in &resp.hits {
                        let age = h.created.map(render_age).unwrap_or_else(|| "-".to_string());
                        println!("{:<56} {:<10} {:<8.2} {}", h.key.to_string(), h.version, h.score, age);
                    }
                    if explain {
                        let d = &resp.debug;
                        eprintln!(
                            "debug: total={} docs={} after_scope={} after_label_keys={} after_labels={} after_anno_keys={} after_annos={} matched={}",
                            resp.total, d.docs, d.after_scope, d.after_label_keys, d.after_labels, d.after_anno_keys, d.after_annos, d.matched
                        );
                    }
                }
                Output::Json => {
                    if explain {
                        println!("{}", serde_json::to_string_pretty(&resp)?);
                    } else {
                        println!("{}", serde_json::to_string_pretty(&resp.hits)?);
                    }
                }
            }
        }
        Commands::Health => {
            counter!("cli_commands_total", 1u64, "cmd" => "health");
            let health = server.is_healthy().await?;
            match cli.output {
                Output::Human => {
                    println!("mode: {:?}", health.mode);
                    println!("version: {}", health.resource_version);
                    match &health.index {
                        Some(state) => println!("index: {}", state),
                        None => println!("index: (disabled)"),
                    }
                    println!("watchers: {}", health.watchers);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&health)?),
            }
        }
    }

    server.shutdown();
    Ok(())
}

fn render_age(creation_ts: i64) -> String {
    if creation_ts <= 0 { return "-".to_string(); }
    let now = chrono::Utc::now().timestamp();
    let mut secs = (now - creation_ts).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
