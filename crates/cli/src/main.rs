use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use kestrel_api::Storage;
use kestrel_backends::{client_with_timeout, HttpStorage};
use kestrel_cacher::Cacher;
use kestrel_core::{Event, LabelSelector, Layout, Object, OverflowPolicy, RawObject, Selector, Settings};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kestrelctl", version, about = "Kestrel storage CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Base URL of the HTTP storage endpoint
    #[arg(long = "server", global = true, env = "KESTREL_SERVER", default_value = "http://127.0.0.1:8080")]
    server: String,

    /// Keys of this kind have no namespace segment
    #[arg(long = "flat", global = true)]
    flat: bool,

    /// Restrict to one namespace
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Label selector, e.g. "tier=web,env!=dev"
    #[arg(short = 'l', long = "selector", global = true)]
    selector: Option<String>,

    /// Overflow policy for watch subscribers (block|drop|disconnect)
    #[arg(long = "overflow", global = true, env = "KESTREL_OVERFLOW")]
    overflow: Option<String>,

    /// Connect timeout in seconds
    #[arg(long = "connect-timeout", global = true, default_value_t = 5)]
    connect_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List objects under a key, e.g. "apps" or "apps/ns1"
    List { key: String },
    /// Watch objects under a key and print +/~/- events
    Watch { key: String },
    /// Fetch a single object, e.g. "apps/ns1/web-0"
    Get {
        key: String,
        /// Print nothing instead of failing when the object is missing
        #[arg(long = "ignore-not-found")]
        ignore_not_found: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("KESTREL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

/// Serve Prometheus metrics when `KESTREL_METRICS_ADDR` is set. A malformed address is fatal.
fn serve_metrics(settings: &Settings) -> Result<()> {
    let Some(addr) = settings.metrics_addr.as_deref() else { return Ok(()) };
    let sock: SocketAddr = addr.parse().with_context(|| format!("KESTREL_METRICS_ADDR {addr:?} is not host:port"))?;
    PrometheusBuilder::new().with_http_listener(sock).install().context("installing metrics exporter")?;
    info!(addr = %sock, "metrics: serving");
    Ok(())
}

fn build_selector(cli: &Cli) -> Result<Selector> {
    let mut parts = Vec::new();
    if let Some(ns) = cli.namespace.as_deref() {
        parts.push(Selector::namespace(ns));
    }
    if let Some(expr) = cli.selector.as_deref() {
        let labels = LabelSelector::from_str(expr).with_context(|| format!("parsing selector {expr:?}"))?;
        parts.push(Selector::labels(labels));
    }
    Ok(Selector::and(parts))
}

/// Compact age such as `3d4h`, `2h10m`, `5m` or `42s`; `-` without a creation timestamp.
fn age(obj: &RawObject, now: DateTime<Utc>) -> String {
    let Some(created) = obj.creation_timestamp() else { return "-".to_string() };
    let d = (now - created).max(TimeDelta::zero());
    match (d.num_days(), d.num_hours() % 24, d.num_minutes() % 60) {
        (days, hours, _) if days > 0 => format!("{days}d{hours}h"),
        (_, hours, mins) if hours > 0 => format!("{hours}h{mins}m"),
        (_, _, mins) if mins > 0 => format!("{mins}m"),
        _ => format!("{}s", d.num_seconds()),
    }
}

fn display_key(obj: &RawObject) -> String {
    match obj.namespace() {
        Some(ns) => format!("{}/{}", ns, obj.name()),
        None => obj.name().to_string(),
    }
}

fn print_items(output: Output, items: &[RawObject]) -> Result<()> {
    match output {
        Output::Human => {
            let now = Utc::now();
            println!("NAMESPACE   NAME                 AGE");
            for item in items {
                println!("{:<11} {:<20} {}", item.namespace().unwrap_or("-"), item.name(), age(item, now));
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(items)?),
    }
    Ok(())
}

fn print_event(output: Output, ev: &Event<RawObject>) -> Result<()> {
    match (output, ev) {
        (Output::Json, _) => {
            let line = match ev {
                Event::Error(msg) => serde_json::json!({ "type": ev.kind().as_wire(), "message": msg }),
                _ => serde_json::json!({ "type": ev.kind().as_wire(), "object": ev.object() }),
            };
            println!("{}", serde_json::to_string(&line)?);
        }
        (Output::Human, Event::Added(o)) => println!("+ {}", display_key(o)),
        (Output::Human, Event::Updated(o)) | (Output::Human, Event::Sync(o)) => println!("~ {}", display_key(o)),
        (Output::Human, Event::Deleted(o)) => println!("- {}", display_key(o)),
        (Output::Human, Event::Error(msg)) => eprintln!("! {}", msg),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut settings = Settings::from_env();
    if let Some(p) = cli.overflow.as_deref() {
        settings.overflow = OverflowPolicy::from_str(p).context("parsing --overflow")?;
    }
    serve_metrics(&settings)?;

    let layout = if cli.flat { Layout::Flat } else { Layout::Namespaced };
    let client = client_with_timeout(Duration::from_secs(cli.connect_timeout.max(1))).context("building HTTP client")?;
    let backend: Arc<HttpStorage<RawObject>> = Arc::new(HttpStorage::with_client(client, &cli.server, layout).with_capacity(settings.queue_cap));
    let selector = build_selector(&cli)?;

    match &cli.command {
        Commands::List { key } => {
            info!(key = %key, selector = %selector, "list invoked");
            let cacher = Cacher::builder("kestrelctl", backend.clone(), key).selector(selector.clone()).settings(&settings).build();
            let stats = cacher.reflector().list_all_data().await.with_context(|| format!("listing {key}"))?;
            info!(added = stats.added, "list ok");
            let items = cacher.list(key, &selector).await?;
            print_items(cli.output, &items)?;
        }
        Commands::Get { key, ignore_not_found } => {
            info!(key = %key, "get invoked");
            match backend.get(key, *ignore_not_found).await.with_context(|| format!("getting {key}"))? {
                Some(obj) => print_items(cli.output, std::slice::from_ref(&obj))?,
                None => info!(key = %key, "not found"),
            }
        }
        Commands::Watch { key } => {
            info!(key = %key, selector = %selector, "watch invoked");
            let cacher = Cacher::builder("kestrelctl", backend.clone(), key).selector(selector.clone()).settings(&settings).build();
            cacher.run();
            let mut rx = cacher.watch(key, &selector).await.with_context(|| format!("watching {key}"))?;
            loop {
                tokio::select! {
                    next = rx.recv() => match next {
                        Some(ev) => print_event(cli.output, &ev)?,
                        None => {
                            warn!("watch channel closed; exiting watch loop");
                            break;
                        }
                    },
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }
            cacher.close().await;
            warn!("watch loop ended (graceful shutdown)");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["kestrelctl", "watch", "apps", "--ns", "ns1", "-l", "tier=web", "-o", "json"]).unwrap();
        assert_eq!(cli.output, Output::Json);
        assert!(matches!(cli.command, Commands::Watch { ref key } if key == "apps"));
        let sel = build_selector(&cli).unwrap();
        let mut obj = RawObject::new(Some("ns1"), "a");
        assert!(!sel.matches_object(&obj));
        obj.meta.labels.insert("tier".into(), "web".into());
        assert!(sel.matches_object(&obj));
        assert!(!sel.matches_object(&RawObject::new(Some("ns2"), "a").with_field("x", serde_json::json!(1))));
    }

    #[test]
    fn bad_selector_is_an_error() {
        let cli = Cli::try_parse_from(["kestrelctl", "list", "apps", "-l", "tier in (web"]).unwrap();
        assert!(build_selector(&cli).is_err());
    }

    #[test]
    fn display_key_omits_missing_namespace() {
        assert_eq!(display_key(&RawObject::new(Some("ns1"), "a")), "ns1/a");
        assert_eq!(display_key(&RawObject::new(None, "node-1")), "node-1");
    }

    #[test]
    fn age_is_compact_and_never_negative() {
        let now = Utc::now();
        let born = |secs: i64| {
            let mut o = RawObject::new(None, "x");
            o.set_creation_timestamp(now - TimeDelta::seconds(secs));
            o
        };
        assert_eq!(age(&RawObject::new(None, "x"), now), "-");
        assert_eq!(age(&born(42), now), "42s");
        assert_eq!(age(&born(5 * 60 + 3), now), "5m");
        assert_eq!(age(&born(2 * 3600 + 10 * 60), now), "2h10m");
        assert_eq!(age(&born(3 * 86_400 + 4 * 3600), now), "3d4h");
        assert_eq!(age(&born(-30), now), "0s");
    }

    #[test]
    fn malformed_metrics_address_is_rejected() {
        let settings = Settings { metrics_addr: Some("nowhere".into()), ..Settings::default() };
        assert!(serve_metrics(&settings).is_err());
        assert!(serve_metrics(&Settings::default()).is_ok());
    }
}
