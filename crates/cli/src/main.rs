use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use reflex_core::{EventType, GroupVersion, QueryParams, TypeKey};
use reflex_kubehub::{KubeTransport, Transport};
use reflex_reflector::{ChannelNotifier, Notification, WatcherOptions, WatcherRegistry};
use reflex_schema::SchemaResolver;
use serde_json::Value;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "reflexctl", version, about = "Reflex: cached, watch-driven views of cluster resources")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Restrict watches to one namespace (cluster-scoped types ignore it)
    #[arg(long = "ns", env = "REFLEX_NAMESPACE", global = true)]
    namespace: Option<String>,

    /// Extra group/versions to index at startup, e.g. "cert-manager.io/v1,networking.k8s.io/v1"
    #[arg(long = "preindex", env = "REFLEX_PREINDEX", value_delimiter = ',', global = true)]
    preindex: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List API groups served by the cluster
    Groups,
    /// List resources of one group/version, e.g. "v1" or "apps/v1"
    Resources {
        gv: String,
    },
    /// List cached objects of a type, optionally filtered
    Get {
        /// GVK key, e.g. "v1/ConfigMap" or "apps/v1/Deployment"
        gvk: String,
        #[arg(long = "name")]
        name: Option<String>,
        #[arg(long = "uid")]
        uid: Option<String>,
        /// Field match `path=value`; the value is parsed as JSON, falling back to a string
        #[arg(long = "field", short = 'f')]
        fields: Vec<String>,
        /// Label match `key=value`
        #[arg(long = "label", short = 'l')]
        labels: Vec<String>,
        /// Annotation match `key=value`
        #[arg(long = "annotation")]
        annotations: Vec<String>,
    },
    /// Follow changes of a type and print them
    Watch {
        gvk: String,
        /// Only these events (ADDED, MODIFIED, DELETED); all when omitted
        #[arg(long = "events", value_delimiter = ',')]
        events: Vec<String>,
        /// Skip notifications for the initial list
        #[arg(long = "changes-only", action = ArgAction::SetTrue)]
        changes_only: bool,
    },
    /// Keep watchers for the given types running until Ctrl-C
    Run {
        #[arg(required = true)]
        gvks: Vec<String>,
        /// Seconds between cache size reports
        #[arg(long = "report-every", default_value_t = 30)]
        report_every: u64,
    },
}

fn init_tracing() {
    let env = std::env::var("REFLEX_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("REFLEX_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid REFLEX_METRICS_ADDR; expected host:port");
        }
    }
}

fn split_pair(raw: &str) -> Result<(String, String)> {
    let (k, v) = raw.split_once('=').with_context(|| format!("expected key=value, got `{}`", raw))?;
    Ok((k.trim().to_string(), v.trim().to_string()))
}

fn parse_field_value(raw: &str) -> Value { serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())) }

fn parse_events(raw: &[String]) -> Result<Vec<EventType>> {
    raw.iter()
        .map(|s| s.trim().to_ascii_uppercase().parse::<EventType>().map_err(|bad| anyhow::anyhow!("unknown event `{}`", bad)))
        .collect()
}

fn print_objects(output: Output, objs: &[Arc<Value>]) -> Result<()> {
    match output {
        Output::Human => {
            for o in objs {
                let ns = reflex_core::object::namespace(o).unwrap_or("-");
                let name = reflex_core::object::name(o).unwrap_or("?");
                let rv = reflex_core::object::resource_version(o).unwrap_or("");
                println!("{:<24} {:<48} {}", ns, name, rv);
            }
            info!(count = objs.len(), "objects listed");
        }
        Output::Json => {
            let list: Vec<&Value> = objs.iter().map(|o| o.as_ref()).collect();
            println!("{}", serde_json::to_string_pretty(&list)?);
        }
    }
    Ok(())
}

fn print_notification(output: Output, n: &Notification) -> Result<()> {
    match output {
        Output::Human => {
            let sign = match n.event_type() {
                EventType::Added => '+',
                EventType::Modified => '~',
                EventType::Deleted => '-',
            };
            println!("{} {}", sign, reflex_core::object::display_key(n.object()));
        }
        Output::Json => println!("{}", serde_json::to_string(n)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let transport: Arc<dyn Transport> = Arc::new(KubeTransport::try_default().await.context("connecting to cluster")?);
    let preindex: Vec<GroupVersion> = cli.preindex.iter().filter(|s| !s.is_empty()).map(|s| GroupVersion::parse(s)).collect();
    let resolver = Arc::new(SchemaResolver::connect(transport.clone(), preindex).await);
    let defaults = WatcherOptions { namespace: cli.namespace.clone(), ..Default::default() };
    let registry = WatcherRegistry::new(resolver.clone(), transport).with_defaults(defaults);

    match cli.command {
        Commands::Groups => {
            let groups = resolver.api_groups(false).await.context("listing api groups")?;
            match cli.output {
                Output::Human => {
                    println!("v1 (core)");
                    for g in groups.groups.iter() {
                        let preferred = g.preferred_version.as_ref().map(|p| p.version.as_str()).unwrap_or("");
                        for v in g.versions.iter() {
                            let mark = if v.version == preferred { " *" } else { "" };
                            println!("{}{}", v.group_version, mark);
                        }
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&groups)?),
            }
        }
        Commands::Resources { gv } => {
            let gv = GroupVersion::parse(&gv);
            let list = resolver.group_resources(&gv, true).await.with_context(|| format!("discovering {}", gv))?;
            match cli.output {
                Output::Human => {
                    for r in list.resources.iter().filter(|r| !r.name.contains('/')) {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        println!("{} • {} • {}", r.kind, r.name, scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&list)?),
            }
        }
        Commands::Get { gvk, name, uid, fields, labels, annotations } => {
            let key = TypeKey::parse(&gvk)?;
            let mut q = QueryParams::for_type(&key);
            q.name = name;
            q.uid = uid;
            q.namespace = cli.namespace.clone();
            for raw in fields.iter() {
                let (path, value) = split_pair(raw)?;
                q.field_matches.insert(path, parse_field_value(&value));
            }
            for raw in labels.iter() {
                let (k, v) = split_pair(raw)?;
                q.label_selectors.insert(k, v);
            }
            for raw in annotations.iter() {
                let (k, v) = split_pair(raw)?;
                q.annotation_selectors.insert(k, v);
            }
            info!(gvk = %key, ns = ?q.namespace, "get invoked");
            let objs = match registry.query(&q).await {
                Ok(objs) => objs,
                Err(reflex_core::Error::TypeNotFound(what)) => {
                    let candidates = resolver.search_by_kind(&key.kind);
                    for c in candidates.iter() {
                        eprintln!("did you mean {} ({})?", c.type_key(), c.resource_name);
                    }
                    anyhow::bail!("resource type not found: {}", what);
                }
                Err(e) => return Err(e).context("query failed"),
            };
            print_objects(cli.output, &objs)?;
            registry.stop_all();
        }
        Commands::Watch { gvk, events, changes_only } => {
            let key = TypeKey::parse(&gvk)?;
            let events = parse_events(&events)?;
            let (notifier, mut rx) = ChannelNotifier::new();
            let notifier = notifier.with_events(&events);
            let watcher = registry.get_or_create(&key, None).await.with_context(|| format!("watching {}", key))?;
            let snapshot = watcher.subscribe_with_snapshot(Arc::new(notifier));
            if !changes_only && (events.is_empty() || events.contains(&EventType::Added)) {
                for o in snapshot.iter() {
                    print_notification(cli.output, &Notification::Added(o.clone()))?;
                }
            }
            info!(gvk = %key, objects = snapshot.len(), "watching; Ctrl-C to stop");
            loop {
                tokio::select! {
                    _ = signal::ctrl_c() => break,
                    next = rx.recv() => match next {
                        Some(n) => print_notification(cli.output, &n)?,
                        None => break,
                    }
                }
            }
            registry.stop_all();
        }
        Commands::Run { gvks, report_every } => {
            for raw in gvks.iter() {
                let key = match TypeKey::parse(raw) {
                    Ok(k) => k,
                    Err(e) => {
                        warn!(gvk = %raw, error = %e, "skipping");
                        continue;
                    }
                };
                if let Err(e) = registry.get_or_create(&key, None).await {
                    error!(gvk = %key, error = %e, "watcher failed to start");
                }
            }
            if registry.watched_types().is_empty() {
                anyhow::bail!("no watcher could be started");
            }
            let mut tick = tokio::time::interval(Duration::from_secs(report_every.max(1)));
            loop {
                tokio::select! {
                    _ = signal::ctrl_c() => {
                        info!("interrupt received; stopping");
                        break;
                    }
                    _ = tick.tick() => {
                        for key in registry.watched_types() {
                            let state = registry.get(&key).map(|w| w.state());
                            info!(gvk = %key, objects = registry.cached_objects_count(&key), state = ?state, "cache size");
                        }
                    }
                }
            }
            registry.stop_all();
        }
    }

    Ok(())
}
