//! Settings resolution: flags > environment > `kubist.json` > defaults.
//!
//! clap covers the first two layers (every flag has an `env` fallback); the
//! config file and the built-in defaults fill whatever is still unset.
//! Switches are `Option<bool>` so an explicit `false` still beats the file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args};
use kubist_kubehub::{ClientOptions, ResourceSpec};
use kubist_store::Credentials;
use serde::Deserialize;

pub const CONFIG_FILE: &str = "kubist.json";
pub const DEFAULT_COUCHDB_URL: &str = "http://localhost:5984";
pub const DEFAULT_WORKERS: usize = 10;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Settings that can come from flags or the environment.
#[derive(Args, Debug, Default, Clone)]
pub struct Overrides {
    /// Config file (default: first kubist.json in ., ~/.config, /etc/kubist)
    #[arg(long, global = true, env = "KUBIST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Resource to reflect, e.g. "v1/pods" or "apps/v1/deployments" (repeatable)
    #[arg(short = 'r', long = "resource", global = true, env = "KUBIST_RESOURCES", value_delimiter = ',')]
    pub resources: Vec<ResourceSpec>,

    /// Only watch this namespace (default: all namespaces)
    #[arg(short = 'n', long, global = true, env = "KUBIST_NAMESPACE")]
    pub namespace: Option<String>,

    /// Path to a kubeconfig (default: $KUBECONFIG or ~/.kube/config)
    #[arg(short = 'f', long, global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// Use in-cluster service account configuration instead of a kubeconfig
    #[arg(short = 'C', long, global = true, env = "KUBIST_IN_CLUSTER",
          action = ArgAction::Set, num_args = 0..=1, require_equals = true,
          default_missing_value = "true", value_parser = BoolishValueParser::new())]
    pub in_cluster: Option<bool>,

    /// Kubeconfig context to use
    #[arg(long, global = true, env = "KUBIST_CONTEXT")]
    pub context: Option<String>,

    /// Base URL for CouchDB
    #[arg(short = 'u', long, global = true, env = "COUCHDB_URL")]
    pub couchdb_url: Option<String>,

    /// Username for CouchDB authentication
    #[arg(short = 'U', long, global = true, env = "COUCHDB_USERNAME")]
    pub couchdb_username: Option<String>,

    /// Password for CouchDB authentication
    #[arg(short = 'P', long, global = true, env = "COUCHDB_PASSWORD", hide_env_values = true)]
    pub couchdb_password: Option<String>,

    /// Read the CouchDB password from stdin
    #[arg(short = 'p', long, global = true,
          action = ArgAction::Set, num_args = 0..=1, require_equals = true,
          default_missing_value = "true", value_parser = BoolishValueParser::new())]
    pub couchdb_read_password: Option<bool>,

    /// Database name (default: kubist/<hostname>)
    #[arg(long, global = true, env = "KUBIST_DATABASE")]
    pub database: Option<String>,

    /// Drop and recreate the database on startup. This may break replication
    #[arg(long, global = true, env = "KUBIST_RECREATE_DATABASE",
          action = ArgAction::Set, num_args = 0..=1, require_equals = true,
          default_missing_value = "true", value_parser = BoolishValueParser::new())]
    pub recreate_database: Option<bool>,

    /// Number of apply lanes
    #[arg(short = 'w', long, global = true, env = "KUBIST_WORKERS")]
    pub workers: Option<usize>,

    /// Bound of each internal event queue
    #[arg(long, global = true, env = "KUBIST_QUEUE_CAPACITY")]
    pub queue_capacity: Option<usize>,

    /// Per-request CouchDB timeout in seconds (0 disables)
    #[arg(long, global = true, env = "KUBIST_REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: Option<u64>,

    /// Replay every known object as a sync event this often (seconds)
    #[arg(long, global = true, env = "KUBIST_RESYNC_SECS")]
    pub resync_secs: Option<u64>,

    /// Serve Prometheus metrics on this address, e.g. 0.0.0.0:9898
    #[arg(long, global = true, env = "KUBIST_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

/// A `resources` entry in the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ResourceEntry {
    Key(String),
    Spec(ResourceSpec),
}

impl ResourceEntry {
    fn into_spec(self) -> Result<ResourceSpec> {
        match self {
            ResourceEntry::Key(key) => key.parse(),
            ResourceEntry::Spec(spec) => Ok(spec),
        }
    }
}

/// Contents of `kubist.json`. Keys may be written with `_` or `-`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub resources: Option<Vec<ResourceEntry>>,
    #[serde(alias = "kube-namespace")]
    pub namespace: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    #[serde(alias = "in-cluster")]
    pub in_cluster: Option<bool>,
    pub context: Option<String>,
    #[serde(alias = "couchdb-url")]
    pub couchdb_url: Option<String>,
    #[serde(alias = "couchdb-username")]
    pub couchdb_username: Option<String>,
    #[serde(alias = "couchdb-password")]
    pub couchdb_password: Option<String>,
    #[serde(alias = "couchdb-read-password")]
    pub couchdb_read_password: Option<bool>,
    pub database: Option<String>,
    #[serde(alias = "recreate-database")]
    pub recreate_database: Option<bool>,
    pub workers: Option<usize>,
    #[serde(alias = "queue-capacity")]
    pub queue_capacity: Option<usize>,
    #[serde(alias = "request-timeout-secs")]
    pub request_timeout_secs: Option<u64>,
    #[serde(alias = "resync-secs")]
    pub resync_secs: Option<u64>,
    #[serde(alias = "metrics-addr")]
    pub metrics_addr: Option<String>,
}

/// Fully resolved settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub resources: Vec<ResourceSpec>,
    pub namespace: Option<String>,
    pub client: ClientOptions,
    pub couchdb_url: String,
    pub credentials: Option<Credentials>,
    pub read_password: bool,
    pub database: String,
    pub recreate_database: bool,
    pub workers: usize,
    pub queue_capacity: usize,
    pub request_timeout: Option<Duration>,
    pub resync: Option<Duration>,
    pub metrics_addr: Option<SocketAddr>,
}

impl Settings {
    pub fn resolve(over: &Overrides, file: FileConfig, host: &str) -> Result<Self> {
        let resources = if !over.resources.is_empty() {
            over.resources.clone()
        } else if let Some(entries) = file.resources {
            entries.into_iter().map(ResourceEntry::into_spec).collect::<Result<Vec<_>>>()?
        } else {
            vec![ResourceSpec::new("", "v1", "pods")]
        };
        if resources.is_empty() {
            return Err(anyhow!("no resources configured"));
        }

        let namespace = over.namespace.clone().or(file.namespace).filter(|ns| !ns.is_empty());
        let client = ClientOptions {
            kubeconfig: over.kubeconfig.clone().or(file.kubeconfig),
            context: over.context.clone().or(file.context),
            in_cluster: over.in_cluster.or(file.in_cluster).unwrap_or(false),
        };

        let username = over.couchdb_username.clone().or(file.couchdb_username).unwrap_or_default();
        let password = over.couchdb_password.clone().or(file.couchdb_password).unwrap_or_default();
        let credentials = (!username.is_empty()).then(|| Credentials { username, password });

        let metrics_addr = match &over.metrics_addr {
            Some(addr) => Some(*addr),
            None => file
                .metrics_addr
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<SocketAddr>().with_context(|| format!("invalid metrics_addr {:?}", s)))
                .transpose()?,
        };

        let timeout_secs = over.request_timeout_secs.or(file.request_timeout_secs).unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
        Ok(Self {
            resources,
            namespace,
            client,
            couchdb_url: over
                .couchdb_url
                .clone()
                .or(file.couchdb_url)
                .unwrap_or_else(|| DEFAULT_COUCHDB_URL.to_string()),
            credentials,
            read_password: over.couchdb_read_password.or(file.couchdb_read_password).unwrap_or(false),
            database: over.database.clone().or(file.database).unwrap_or_else(|| database_name(host)),
            recreate_database: over.recreate_database.or(file.recreate_database).unwrap_or(false),
            workers: over.workers.or(file.workers).unwrap_or(DEFAULT_WORKERS).max(1),
            queue_capacity: over.queue_capacity.or(file.queue_capacity).unwrap_or(DEFAULT_QUEUE_CAPACITY).max(1),
            request_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            resync: over.resync_secs.or(file.resync_secs).filter(|s| *s > 0).map(Duration::from_secs),
            metrics_addr,
        })
    }
}

/// Default database for this host: `kubist/<host>`, lowercased, `.` → `_`.
pub fn database_name(host: &str) -> String {
    format!("kubist/{}", host).replace('.', "_").to_lowercase()
}

pub fn hostname() -> String {
    if let Ok(h) = std::env::var("HOSTNAME") {
        if !h.trim().is_empty() {
            return h.trim().to_string();
        }
    }
    match std::fs::read_to_string("/etc/hostname") {
        Ok(h) if !h.trim().is_empty() => h.trim().to_string(),
        _ => "localhost".to_string(),
    }
}

fn search_paths() -> Vec<PathBuf> {
    let mut out = vec![PathBuf::from(CONFIG_FILE)];
    if let Some(home) = std::env::var_os("HOME") {
        out.push(Path::new(&home).join(".config").join(CONFIG_FILE));
    }
    out.push(Path::new("/etc/kubist").join(CONFIG_FILE));
    out
}

/// Load the config file. An explicit path must exist; otherwise the first
/// file found on the search path is used and none at all is fine.
pub fn load_file(explicit: Option<&Path>) -> Result<(Option<PathBuf>, FileConfig)> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => match search_paths().into_iter().find(|p| p.is_file()) {
            Some(p) => p,
            None => return Ok((None, FileConfig::default())),
        },
    };
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading config {}", path.display()))?;
    let file = parse_file(&raw).with_context(|| format!("parsing config {}", path.display()))?;
    Ok((Some(path), file))
}

pub fn parse_file(raw: &str) -> Result<FileConfig> {
    Ok(serde_json::from_str(raw)?)
}
