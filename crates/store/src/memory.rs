//! In-process document store following CouchDB's revision rules: writes to
//! an existing document must name its current revision, deletes likewise.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::{Body, Document, DocumentStore, StoreError, StoreResult, WriteResult};

#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<FxHashMap<String, Document>>,
    exists: Mutex<bool>,
    seq: AtomicU64,
    writes: AtomicU64,
}

impl MemoryStore {
    /// An empty store whose database already exists.
    pub fn new() -> Self {
        let s = Self::default();
        *s.exists_guard() = true;
        s
    }

    /// Number of successful puts and deletes so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.docs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current document under `id`, without going through the async API.
    pub fn snapshot(&self, id: &str) -> Option<Document> {
        self.docs().get(id).cloned()
    }

    fn docs(&self) -> MutexGuard<'_, FxHashMap<String, Document>> {
        self.docs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn exists_guard(&self) -> MutexGuard<'_, bool> {
        self.exists.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_rev(&self, generation: u64) -> String {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        format!("{}-{:08x}", generation, seq)
    }
}

fn rev_generation(rev: &str) -> u64 {
    rev.split_once('-').and_then(|(g, _)| g.parse().ok()).unwrap_or(0)
}

fn conflict() -> StoreError {
    StoreError::status(409, "Document update conflict.")
}

#[async_trait::async_trait]
impl DocumentStore for MemoryStore {
    async fn exists(&self) -> StoreResult<bool> {
        Ok(*self.exists_guard())
    }

    async fn create(&self) -> StoreResult<()> {
        let mut exists = self.exists_guard();
        if *exists {
            return Err(StoreError::status(412, "The database could not be created, the file already exists."));
        }
        *exists = true;
        Ok(())
    }

    async fn drop_database(&self) -> StoreResult<()> {
        let mut exists = self.exists_guard();
        if !*exists {
            return Err(StoreError::status(404, "Database does not exist."));
        }
        *exists = false;
        self.docs().clear();
        Ok(())
    }

    async fn get_or_none(&self, id: &str) -> StoreResult<Option<Document>> {
        Ok(self.docs().get(id).cloned())
    }

    async fn put(&self, id: &str, mut body: Body, rev: Option<&str>) -> StoreResult<WriteResult> {
        let mut docs = self.docs();
        let generation = match (docs.get(id), rev) {
            (Some(cur), Some(r)) if cur.rev == r => rev_generation(&cur.rev) + 1,
            (None, None) => 1,
            _ => return Err(conflict()),
        };
        let new_rev = self.next_rev(generation);
        body.insert("_id".into(), Value::String(id.to_string()));
        body.insert("_rev".into(), Value::String(new_rev.clone()));
        docs.insert(id.to_string(), Document { id: id.to_string(), rev: new_rev.clone(), body });
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(WriteResult { id: id.to_string(), rev: new_rev })
    }

    async fn delete(&self, doc: &Document) -> StoreResult<WriteResult> {
        let mut docs = self.docs();
        let generation = match docs.get(&doc.id) {
            None => return Err(StoreError::status(404, "deleted")),
            Some(cur) if cur.rev != doc.rev => return Err(conflict()),
            Some(cur) => rev_generation(&cur.rev) + 1,
        };
        docs.remove(&doc.id);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(WriteResult { id: doc.id.clone(), rev: self.next_rev(generation) })
    }
}
