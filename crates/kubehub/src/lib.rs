//! Kubist kubehub – client setup, discovery and watcher wiring

#![forbid(unsafe_code)]

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use kube::{
    api::Api,
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    runtime::watcher,
    Client,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

mod resource_watcher;

pub use resource_watcher::{EventStream, ResourceWatcher, WatchError, WatchStats, WatchTarget};

/// How to reach the cluster.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Explicit kubeconfig path; `None` uses `KUBECONFIG` / `~/.kube/config`.
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    /// Use the pod's service account instead of a kubeconfig.
    pub in_cluster: bool,
}

pub async fn connect(opts: &ClientOptions) -> Result<Client> {
    let config = if opts.in_cluster {
        kube::Config::incluster().context("in-cluster config failed")?
    } else {
        let kco = KubeConfigOptions { context: opts.context.clone(), ..Default::default() };
        match &opts.kubeconfig {
            Some(path) => {
                let kc = Kubeconfig::read_from(path).with_context(|| format!("kubeconfig {:?} failed", path))?;
                kube::Config::from_custom_kubeconfig(kc, &kco)
                    .await
                    .with_context(|| format!("kubeconfig {:?} failed", path))?
            }
            None => kube::Config::from_kubeconfig(&kco).await.context("loading kubeconfig")?,
        }
    };
    debug!(cluster_url = %config.cluster_url, "kube client configured");
    Client::try_from(config).context("building kube client")
}

/// A watched resource type as configured: group, version and resource
/// (plural name such as `pods`, or the Kind such as `Pod`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl ResourceSpec {
    pub fn new(group: &str, version: &str, resource: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), resource: resource.to_string() }
    }
}

impl FromStr for ResourceSpec {
    type Err = anyhow::Error;

    /// `v1/pods` or `apps/v1/deployments`.
    fn from_str(key: &str) -> Result<Self> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, resource] if !version.is_empty() && !resource.is_empty() => Ok(Self::new("", version, resource)),
            [group, version, resource] if !version.is_empty() && !resource.is_empty() => {
                Ok(Self::new(group, version, resource))
            }
            _ => Err(anyhow!("invalid resource key: {} (expect v1/pods or group/v1/resource)", key)),
        }
    }
}

impl fmt::Display for ResourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

/// A [`ResourceSpec`] matched against the server's discovery data.
#[derive(Debug, Clone)]
pub struct ResolvedResource {
    pub spec: ResourceSpec,
    pub api_resource: ApiResource,
    pub namespaced: bool,
}

impl ResolvedResource {
    /// Build the list+watch event stream for this resource, optionally
    /// narrowed to one namespace.
    pub fn watch_target(&self, client: Client, namespace: Option<&str>) -> WatchTarget {
        let api: Api<DynamicObject> = match (self.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(client, ns, &self.api_resource),
            _ => Api::all_with(client, &self.api_resource),
        };
        let events = watcher::watcher(api, watcher::Config::default()).boxed();
        WatchTarget { resource: self.spec.to_string(), kind: self.api_resource.kind.clone(), events }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn resource_key(&self) -> String {
        ResourceSpec::new(&self.group, &self.version, &self.plural).to_string()
    }
}

/// Discover served resources (incl. CRDs) using kube Discovery.
pub async fn discover(client: Client) -> Result<Vec<DiscoveredResource>> {
    let discovery = Discovery::new(client).run().await?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            out.push(DiscoveredResource {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                plural: ar.plural.clone(),
                namespaced: matches!(caps.scope, Scope::Namespaced),
            });
        }
    }
    // Stable-ish order
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    Ok(out)
}

/// Resolve every spec with a single discovery pass. Unknown resources are an error.
pub async fn resolve_all(client: Client, specs: &[ResourceSpec]) -> Result<Vec<ResolvedResource>> {
    let discovery = Discovery::new(client).run().await.context("running API discovery")?;
    let mut out = Vec::with_capacity(specs.len());
    'specs: for spec in specs {
        for group in discovery.groups() {
            if group.name() != spec.group {
                continue;
            }
            for (ar, caps) in group.versioned_resources(&spec.version) {
                if ar.plural == spec.resource || ar.kind == spec.resource {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    info!(resource = %spec, kind = %ar.kind, namespaced, "resolved resource");
                    out.push(ResolvedResource { spec: spec.clone(), api_resource: ar, namespaced });
                    continue 'specs;
                }
            }
        }
        return Err(anyhow!("resource not served by the cluster: {}", spec));
    }
    Ok(out)
}
