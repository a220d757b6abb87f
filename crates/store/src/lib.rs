//! Kubist document store client.
//!
//! [`DocumentStore`] is the capability surface the apply protocol needs: a
//! key/value document API with optimistic-concurrency revisions. It is
//! implemented by [`CouchDatabase`] (CouchDB over HTTP) and by
//! [`MemoryStore`], which mimics CouchDB's revision rules in process.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

mod couch;
mod memory;

pub use couch::{CouchClient, CouchDatabase, Credentials};
pub use memory::MemoryStore;

/// A JSON document body.
pub type Body = Map<String, Value>;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Structured status returned by the store (HTTP status semantics).
    #[error("HTTP status {code} {reason}")]
    Status { code: u16, reason: String, body: Option<Body> },
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("base url {0:?} cannot carry a path")]
    BaseUrl(String),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("document {id:?} missing {field}")]
    InvalidDocument { id: String, field: &'static str },
}

impl StoreError {
    pub fn status(code: u16, reason: impl Into<String>) -> Self {
        StoreError::Status { code, reason: reason.into(), body: None }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            StoreError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Optimistic-concurrency rejection (409 Conflict / 412 Precondition Failed).
    pub fn is_conflict(&self) -> bool {
        matches!(self.status_code(), Some(409) | Some(412))
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }
}

/// A stored document: id, current revision and full body (which also
/// carries `_id` and `_rev`).
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub rev: String,
    pub body: Body,
}

impl Document {
    pub fn from_body(body: Body) -> StoreResult<Self> {
        let id = body
            .get("_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| StoreError::InvalidDocument { id: String::new(), field: "_id" })?
            .to_string();
        let rev = body
            .get("_rev")
            .and_then(|v| v.as_str())
            .ok_or_else(|| StoreError::InvalidDocument { id: id.clone(), field: "_rev" })?
            .to_string();
        Ok(Self { id, rev, body })
    }

    /// `metadata.resourceVersion` copied from the reflected object.
    pub fn resource_version(&self) -> Option<&str> {
        self.body.get("metadata")?.get("resourceVersion")?.as_str()
    }
}

/// Acknowledgement of a successful write or delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    pub id: String,
    pub rev: String,
}

#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    async fn exists(&self) -> StoreResult<bool>;

    async fn create(&self) -> StoreResult<()>;

    async fn drop_database(&self) -> StoreResult<()>;

    /// Fetch a document; a missing one is `None`, not an error.
    async fn get_or_none(&self, id: &str) -> StoreResult<Option<Document>>;

    /// Fetch a document; a missing one is a 404 status error.
    async fn get(&self, id: &str) -> StoreResult<Document> {
        self.get_or_none(id)
            .await?
            .ok_or_else(|| StoreError::status(404, "not_found"))
    }

    /// Write `body` under `id`. When `rev` is given it is the precondition the
    /// store checks against the current revision.
    async fn put(&self, id: &str, body: Body, rev: Option<&str>) -> StoreResult<WriteResult>;

    /// Delete `doc` at its carried revision.
    async fn delete(&self, doc: &Document) -> StoreResult<WriteResult>;
}
