use std::io::{BufRead, IsTerminal, Write};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kubist_agent::{AgentConfig, ChannelAggregator, ReflectionAgent};
use kubist_kubehub::{ResolvedResource, ResourceWatcher, WatchTarget};
use kubist_store::{CouchClient, CouchDatabase, DocumentStore};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;

use config::{Overrides, Settings};

#[derive(Parser, Debug)]
#[command(
    name = "kubist-agent",
    version,
    about = "Reflects Kubernetes resources into CouchDB",
    after_help = "Settings are read from flags, then environment variables, then kubist.json \
                  (./, ~/.config/, /etc/kubist/), then built-in defaults."
)]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(flatten)]
    settings: Overrides,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Reflect the configured resources into CouchDB (default)
    Run,
    /// Print the merged change-event stream without writing anything
    Watch,
    /// Tail the database's continuous changes feed
    Changes {
        /// Start after this update sequence (default: from the beginning)
        #[arg(long)]
        since: Option<String>,
    },
    /// List resource types served by the cluster
    Resources,
}

fn init_tracing() {
    let env = std::env::var("KUBIST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics(addr: Option<SocketAddr>) {
    if let Some(sock) = addr {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        match builder.with_http_listener(sock).install() {
            Ok(_) => info!(addr = %sock, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        }
    }
}

/// Prompt for the CouchDB password without echo on a terminal; read one
/// line from piped stdin otherwise.
fn read_password() -> Result<String> {
    let stdin = std::io::stdin();
    if stdin.is_terminal() {
        return rpassword::prompt_password("CouchDB password: ").context("reading password from terminal");
    }
    eprintln!("stdin is not a tty, reading password from stdin");
    read_password_line(stdin.lock())
}

fn read_password_line<R: BufRead>(mut input: R) -> Result<String> {
    let mut line = String::new();
    input.read_line(&mut line).context("reading password from stdin")?;
    Ok(line.trim_end_matches(|c| c == '\r' || c == '\n').to_string())
}

/// Resolves once SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn cancel_on_signal(stop: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        stop.cancel();
    });
}

fn open_database(settings: &Settings) -> Result<CouchDatabase> {
    let client = CouchClient::new(&settings.couchdb_url, settings.credentials.clone())
        .with_context(|| format!("CouchDB url {}", settings.couchdb_url))?
        .with_timeout(settings.request_timeout);
    Ok(client.database(&settings.database))
}

/// Make sure the database exists, dropping it first when `recreate` is set.
async fn prepare_database<S: DocumentStore + ?Sized>(db: &S, name: &str, recreate: bool) -> Result<()> {
    let exists = db.exists().await.with_context(|| format!("checking database {}", name))?;
    if exists && recreate {
        info!(database = %name, "dropping database");
        db.drop_database().await.with_context(|| format!("dropping database {}", name))?;
    }
    if !exists || recreate {
        info!(database = %name, "creating database");
        db.create().await.with_context(|| format!("creating database {}", name))?;
    }
    Ok(())
}

async fn resolve(settings: &Settings) -> Result<(kube::Client, Vec<ResolvedResource>)> {
    let client = kubist_kubehub::connect(&settings.client).await?;
    let resolved = kubist_kubehub::resolve_all(client.clone(), &settings.resources).await?;
    Ok((client, resolved))
}

async fn run(settings: Settings) -> Result<()> {
    let (client, resolved) = resolve(&settings).await?;
    let db = open_database(&settings)?;
    prepare_database(&db, &settings.database, settings.recreate_database).await?;

    let ns = settings.namespace.as_deref();
    let targets: Vec<_> = resolved.iter().map(|r| r.watch_target(client.clone(), ns)).collect();
    let keys: Vec<String> = resolved.iter().map(|r| r.spec.to_string()).collect();
    info!(
        resources = ?keys,
        scope = ns.unwrap_or("all namespaces"),
        database = %settings.database,
        lanes = settings.workers,
        "reflecting resources"
    );

    let agent = ReflectionAgent::new(
        Arc::new(db),
        AgentConfig { lanes: settings.workers, queue_capacity: settings.queue_capacity, resync_period: settings.resync },
    );
    cancel_on_signal(agent.stop_handle());
    let report = agent.run(targets).await?;
    info!(report = %serde_json::to_string(&report)?, "bye");
    Ok(())
}

async fn watch(settings: Settings, output: Output) -> Result<()> {
    let (client, resolved) = resolve(&settings).await?;
    let ns = settings.namespace.as_deref();
    let targets = resolved.iter().map(|r| r.watch_target(client.clone(), ns)).collect();
    let stop = CancellationToken::new();
    cancel_on_signal(stop.clone());
    let printed =
        print_deltas(targets, settings.queue_capacity, settings.resync, output, stop, &mut std::io::stdout()).await?;
    info!(printed, "watch finished");
    Ok(())
}

/// Print the merged delta stream of `targets` until stopped, until every
/// stream ends, or until the first watcher fails.
async fn print_deltas<W: Write>(
    targets: Vec<WatchTarget>,
    capacity: usize,
    resync: Option<Duration>,
    output: Output,
    stop: CancellationToken,
    out: &mut W,
) -> Result<u64> {
    let (tx, mut rx) = mpsc::channel(capacity.max(1));
    let aggregator = ChannelAggregator::with_stop(tx, stop.child_token());
    let mut watchers = JoinSet::new();
    for target in targets {
        let mut w = ResourceWatcher::new(target).with_stop(stop.child_token()).with_capacity(capacity).with_resync(resync);
        aggregator.add(w.watch()?)?;
        let resource = w.resource().to_string();
        watchers.spawn(async move { (resource, w.join().await) });
    }
    let closer = tokio::spawn(async move {
        aggregator.wait().await;
        drop(aggregator);
    });

    let mut printed = 0u64;
    let mut fatal: Option<anyhow::Error> = None;
    loop {
        tokio::select! {
            biased;
            Some(joined) = watchers.join_next() => match joined {
                Ok((resource, Ok(stats))) => info!(resource = %resource, ?stats, "watcher finished"),
                Ok((resource, Err(e))) => {
                    error!(resource = %resource, error = %e, "watcher failed");
                    fatal = Some(e.into());
                    break;
                }
                Err(e) => error!(error = %e, "watcher task panicked"),
            },
            delta = rx.recv() => match delta {
                Some(delta) => {
                    match output {
                        Output::Human => writeln!(
                            out,
                            "[{}] {} rv={}",
                            delta.kind,
                            delta.document_id(),
                            delta.object.resource_version
                        )?,
                        Output::Json => writeln!(out, "{}", serde_json::to_string(&delta)?)?,
                    }
                    printed += 1;
                }
                None => break,
            },
        }
    }

    stop.cancel();
    drop(rx);
    let _ = closer.await;
    while let Some(joined) = watchers.join_next().await {
        if let Ok((resource, Err(e))) = joined {
            match fatal {
                None => fatal = Some(e.into()),
                Some(_) => warn!(resource = %resource, error = %e, "watcher failed during shutdown"),
            }
        }
    }
    match fatal {
        Some(e) => Err(e),
        None => Ok(printed),
    }
}

async fn changes(settings: Settings, since: Option<String>) -> Result<()> {
    let db = open_database(&settings)?;
    let stop = CancellationToken::new();
    cancel_on_signal(stop.clone());

    let (tx, mut rx) = mpsc::channel(settings.queue_capacity);
    let feed = tokio::spawn({
        let db = db.clone();
        let stop = stop.clone();
        async move { db.changes(since.as_deref(), tx, stop).await }
    });
    while let Some(row) = rx.recv().await {
        println!("{}", serde_json::Value::Object(row));
    }
    feed.await.context("changes feed task")??;
    Ok(())
}

async fn resources(settings: Settings, output: Output) -> Result<()> {
    let client = kubist_kubehub::connect(&settings.client).await?;
    let resources = kubist_kubehub::discover(client).await?;
    match output {
        Output::Human => {
            for r in resources {
                let scope = if r.namespaced { "namespaced" } else { "cluster" };
                println!("{} • {} • {}", r.resource_key(), r.kind, scope);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let (path, file) = config::load_file(cli.settings.config.as_deref())?;
    if let Some(p) = &path {
        info!(path = %p.display(), "read config");
    }
    let mut settings = Settings::resolve(&cli.settings, file, &config::hostname())?;
    init_metrics(settings.metrics_addr);

    let command = cli.command.clone().unwrap_or(Commands::Run);
    if settings.read_password && matches!(command, Commands::Run | Commands::Changes { .. }) {
        let password = read_password()?;
        let username = settings.credentials.take().map(|c| c.username).unwrap_or_default();
        settings.credentials = Some(kubist_store::Credentials { username, password });
    }

    let res = match command {
        Commands::Run => run(settings).await,
        Commands::Watch => watch(settings, cli.output).await,
        Commands::Changes { since } => changes(settings, since).await,
        Commands::Resources => resources(settings, cli.output).await,
    };
    if let Err(e) = &res {
        error!(error = ?e, "fatal");
    }
    res
}
