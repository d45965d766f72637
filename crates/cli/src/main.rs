use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use kestrel_controller::{Controller, Lifecycle, Registry};
use kestrel_core::{ControllerConfig, Key, ListFilter, ScopeFilter, Selector};
use kestrel_kubehub::KubeStore;
use kube::{core::DynamicObject, Client, ResourceExt};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "kestrelctl", version, about = "Kestrel controller CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resources (incl. CRDs)
    Discover,
    /// Sync a controller's cache and print what the lister sees
    Ls {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
        /// Label selector, e.g. "app=web,tier!=db"
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
    },
    /// Run a controller printing +/- per reconciled key until Ctrl-C
    Watch {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
    },
    /// Run a logging lifecycle that holds a finalizer on every object until Ctrl-C
    Finalize {
        gvk: String,
        /// Lifecycle name; the finalizer is controller.kestrel.io/<name>
        #[arg(long = "name")]
        name: String,
    },
}

fn init_tracing() {
    let env = std::env::var("KESTREL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KESTREL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KESTREL_METRICS_ADDR; expected host:port");
        }
    }
}

/// Lifecycle that only logs, so the finalizer gating is visible on a live cluster.
struct LoggingLifecycle {
    name: String,
}

#[async_trait::async_trait]
impl Lifecycle<DynamicObject> for LoggingLifecycle {
    async fn create(&self, obj: DynamicObject) -> kestrel_core::Result<Option<DynamicObject>> {
        info!(lifecycle = %self.name, key = %Key::of(&obj), "create");
        Ok(None)
    }

    async fn updated(&self, obj: DynamicObject) -> kestrel_core::Result<Option<DynamicObject>> {
        info!(lifecycle = %self.name, key = %Key::of(&obj), rv = ?obj.resource_version(), "updated");
        Ok(None)
    }

    async fn remove(&self, obj: DynamicObject) -> kestrel_core::Result<Option<DynamicObject>> {
        info!(lifecycle = %self.name, key = %Key::of(&obj), "remove; releasing finalizer");
        Ok(None)
    }
}

struct Session {
    registry: Registry,
    controller: Arc<Controller<DynamicObject>>,
    config: ControllerConfig,
    shutdown: CancellationToken,
}

async fn session(gvk: &str, namespace: Option<&str>, selector: Selector) -> Result<Session> {
    let config = ControllerConfig::from_env()?;
    let client = Client::try_default().await?;
    let store = kestrel_kubehub::store_for(client, gvk).await?;
    let filter = ListFilter { namespace: namespace.map(str::to_string), selector };
    let registry = Registry::new();
    let controller = registry.controller(gvk, namespace, || {
        Controller::new(gvk, Arc::new(store) as Arc<dyn kestrel_core::BackingStore<DynamicObject>>, filter, config.clone())
    })?;
    Ok(Session { registry, controller, config, shutdown: CancellationToken::new() })
}

impl Session {
    async fn start(&self) -> Result<()> {
        self.registry.start_all(&self.shutdown, self.config.workers).await?;
        self.registry.sync_all(&self.shutdown).await?;
        Ok(())
    }

    async fn run_until_ctrl_c(&self) -> Result<()> {
        self.start().await?;
        match signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received; stopping controllers"),
            Err(e) => error!(error = %e, "failed to listen for Ctrl-C"),
        }
        self.shutdown.cancel();
        self.registry.stop_all().await;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Discover => {
            let client = Client::try_default().await?;
            let resources = kestrel_kubehub::discover(client).await?;
            match cli.output {
                Output::Human => {
                    for r in resources {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        println!("{:<48} {}", r.gvk_key(), scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
            }
        }
        Commands::Ls { gvk, selector } => {
            let selector: Selector = selector.as_deref().unwrap_or("").parse()?;
            info!(gvk = %gvk, ns = ?ns, selector = %selector, "ls invoked");
            let s = session(&gvk, ns, selector.clone()).await?;
            s.start().await?;
            let listing = s.controller.lister().list(ns, &selector);
            match cli.output {
                Output::Human => {
                    println!("{:<20} {:<32} {:<10} AGE", "NAMESPACE", "NAME", "RV");
                    for o in listing.iter() {
                        println!(
                            "{:<20} {:<32} {:<10} {}",
                            o.namespace().unwrap_or_else(|| "-".to_string()),
                            o.name_any(),
                            o.resource_version().unwrap_or_default(),
                            render_age(o)
                        );
                    }
                }
                Output::Json => {
                    let items = listing.iter().map(|o| kestrel_kubehub::to_display_json(o)).collect::<Result<Vec<_>>>()?;
                    println!("{}", serde_json::to_string_pretty(&items)?);
                }
            }
            s.shutdown.cancel();
            s.registry.stop_all().await;
        }
        Commands::Watch { gvk } => {
            info!(gvk = %gvk, ns = ?ns, "watch invoked");
            let s = session(&gvk, ns, Selector::everything()).await?;
            s.controller.add_handler("print", ScopeFilter::All, |key: Key, obj: Option<DynamicObject>| async move {
                match obj {
                    Some(o) => println!("+ {} rv={}", key, o.resource_version().unwrap_or_default()),
                    None => println!("- {}", key),
                }
                Ok::<_, kestrel_core::Error>(None)
            })?;
            s.run_until_ctrl_c().await?;
        }
        Commands::Finalize { gvk, name } => {
            info!(gvk = %gvk, ns = ?ns, lifecycle = %name, "finalize invoked");
            let s = session(&gvk, ns, Selector::everything()).await?;
            let filter = match ns {
                Some(ns) => ScopeFilter::Namespace(ns.to_string()),
                None => ScopeFilter::All,
            };
            s.controller.add_lifecycle(&name, filter, LoggingLifecycle { name: name.clone() })?;
            s.run_until_ctrl_c().await?;
        }
    }

    Ok(())
}

fn render_age(obj: &DynamicObject) -> String {
    let Some(created) = obj.creation_timestamp() else {
        return "-".to_string();
    };
    let mut secs = (chrono::Utc::now() - created.0).num_seconds().max(0) as u64;
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}
