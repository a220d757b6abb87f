//! Kubist apply: turn one change event into at most one document-store write.
//!
//! Ordering is decided solely by comparing `metadata.resourceVersion` as an
//! integer. Replays and duplicates become no-ops, stale events and store
//! rejections become [`Conflict`] values, and only malformed versions and
//! non-status store failures are errors.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use kubist_core::{parse_resource_version, CoreError, Delta, DeltaKind, ResourceObject};
use kubist_store::{Document, DocumentStore, StoreError, WriteResult};
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("document store: {0}")]
    Store(#[from] StoreError),
    #[error("{id}: {source}")]
    Version {
        id: String,
        #[source]
        source: CoreError,
    },
}

/// Why an event was not written. Reported, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "conflict", rename_all = "snake_case")]
pub enum Conflict {
    /// `Added` for an id already stored at the same version.
    AlreadyExists { version: String },
    /// `Added` for an id already stored at a different version.
    VersionMismatch { stored: String, incoming: String },
    /// Incoming version is older than the stored one.
    Stale { stored: String, incoming: String },
    /// The store refused the write or delete with a structured status.
    Rejected { code: u16, reason: String },
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conflict::AlreadyExists { version } => write!(f, "already exists at resourceVersion {}", version),
            Conflict::VersionMismatch { stored, incoming } => {
                write!(f, "added at resourceVersion {} but stored at {}", incoming, stored)
            }
            Conflict::Stale { stored, incoming } => {
                write!(f, "stale resourceVersion {} (stored {})", incoming, stored)
            }
            Conflict::Rejected { code, reason } => write!(f, "store rejected write: {} {}", code, reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Created { rev: String },
    Updated { rev: String },
    Deleted,
    /// Stored document already at the incoming version.
    Unchanged,
    /// Delete for a document that is not stored.
    Absent,
    Conflict(Conflict),
}

impl ApplyOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ApplyOutcome::Created { .. } => "created",
            ApplyOutcome::Updated { .. } => "updated",
            ApplyOutcome::Deleted => "deleted",
            ApplyOutcome::Unchanged => "unchanged",
            ApplyOutcome::Absent => "absent",
            ApplyOutcome::Conflict(_) => "conflict",
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, ApplyOutcome::Created { .. } | ApplyOutcome::Updated { .. } | ApplyOutcome::Deleted)
    }
}

/// Applies deltas against a shared document store.
pub struct Applier<S: DocumentStore + ?Sized> {
    store: Arc<S>,
}

impl<S: DocumentStore + ?Sized> Clone for Applier<S> {
    fn clone(&self) -> Self {
        Self { store: self.store.clone() }
    }
}

impl<S: DocumentStore + ?Sized> Applier<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn apply(&self, delta: &Delta) -> Result<ApplyOutcome, ApplyError> {
        let t0 = Instant::now();
        let id = delta.document_id();
        let res = match delta.kind {
            DeltaKind::Added => self.add(&id, &delta.object).await,
            DeltaKind::Updated | DeltaKind::Sync => self.upsert(&id, &delta.object).await,
            DeltaKind::Deleted => self.remove(&id).await,
        };
        histogram!("kubist_apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(outcome) => {
                counter!("kubist_apply_total", 1, "outcome" => outcome.label());
                report(delta, &id, outcome);
            }
            Err(e) => {
                counter!("kubist_apply_total", 1, "outcome" => "error");
                warn!(kind = %delta.kind, id = %id, error = %e, "apply failed");
            }
        }
        res
    }

    async fn add(&self, id: &str, obj: &ResourceObject) -> Result<ApplyOutcome, ApplyError> {
        match self.store.get_or_none(id).await? {
            Some(doc) => {
                let stored = doc.resource_version().unwrap_or_default().to_string();
                let conflict = if stored == obj.resource_version {
                    Conflict::AlreadyExists { version: stored }
                } else {
                    Conflict::VersionMismatch { stored, incoming: obj.resource_version.clone() }
                };
                Ok(ApplyOutcome::Conflict(conflict))
            }
            None => self.write(id, obj, None).await,
        }
    }

    async fn upsert(&self, id: &str, obj: &ResourceObject) -> Result<ApplyOutcome, ApplyError> {
        let doc = match self.store.get_or_none(id).await? {
            Some(doc) => doc,
            None => return self.write(id, obj, None).await,
        };
        let stored_raw = doc.resource_version().unwrap_or_default();
        let stored = version(id, stored_raw)?;
        let incoming = version(id, &obj.resource_version)?;
        if incoming < stored {
            return Ok(ApplyOutcome::Conflict(Conflict::Stale {
                stored: stored_raw.to_string(),
                incoming: obj.resource_version.clone(),
            }));
        }
        if incoming == stored {
            return Ok(ApplyOutcome::Unchanged);
        }
        self.write(id, obj, Some(&doc)).await
    }

    async fn remove(&self, id: &str) -> Result<ApplyOutcome, ApplyError> {
        let doc = match self.store.get_or_none(id).await? {
            Some(doc) => doc,
            None => return Ok(ApplyOutcome::Absent),
        };
        match self.store.delete(&doc).await {
            Ok(_) => Ok(ApplyOutcome::Deleted),
            Err(e) => rejected(e),
        }
    }

    /// Create (no `current`) or update at `current`'s revision.
    async fn write(&self, id: &str, obj: &ResourceObject, current: Option<&Document>) -> Result<ApplyOutcome, ApplyError> {
        let rev = current.map(|d| d.rev.as_str());
        match self.store.put(id, obj.to_document(id), rev).await {
            Ok(WriteResult { rev, .. }) if current.is_some() => Ok(ApplyOutcome::Updated { rev }),
            Ok(WriteResult { rev, .. }) => Ok(ApplyOutcome::Created { rev }),
            Err(e) => rejected(e),
        }
    }
}

fn version(id: &str, raw: &str) -> Result<u64, ApplyError> {
    parse_resource_version(raw).map_err(|source| ApplyError::Version { id: id.to_string(), source })
}

fn rejected(e: StoreError) -> Result<ApplyOutcome, ApplyError> {
    match e {
        StoreError::Status { code, reason, .. } => Ok(ApplyOutcome::Conflict(Conflict::Rejected { code, reason })),
        other => Err(ApplyError::Store(other)),
    }
}

fn report(delta: &Delta, id: &str, outcome: &ApplyOutcome) {
    let rv = delta.object.resource_version.as_str();
    match outcome {
        ApplyOutcome::Created { rev } | ApplyOutcome::Updated { rev } => {
            info!(kind = %delta.kind, id = %id, resource_version = rv, rev = %rev, "{}", outcome.label())
        }
        ApplyOutcome::Deleted => info!(kind = %delta.kind, id = %id, resource_version = rv, "deleted"),
        ApplyOutcome::Unchanged | ApplyOutcome::Absent => {
            debug!(kind = %delta.kind, id = %id, resource_version = rv, "{}", outcome.label())
        }
        ApplyOutcome::Conflict(c) => warn!(kind = %delta.kind, id = %id, resource_version = rv, "conflict: {}", c),
    }
}
