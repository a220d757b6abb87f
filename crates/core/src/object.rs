//! Structured view over an untyped Kubernetes object.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::CoreError;

/// Snapshot of one resource: the identifying fields pulled out of the raw
/// object plus the object itself as an opaque JSON map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceObject {
    pub kind: String,
    /// Empty for cluster-scoped objects.
    pub namespace: String,
    pub name: String,
    pub resource_version: String,
    pub body: Map<String, Value>,
}

/// `Kind/namespace/name`, or `Kind/name` when cluster-scoped.
pub fn document_id(kind: &str, namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        format!("{}/{}", kind, name)
    } else {
        format!("{}/{}/{}", kind, namespace, name)
    }
}

impl ResourceObject {
    /// Build from a raw object. `fallback_kind` is used when the object does
    /// not carry `kind` itself (list items usually don't).
    pub fn from_json(fallback_kind: &str, raw: Value) -> Result<Self, CoreError> {
        let mut body = match raw {
            Value::Object(map) => map,
            _ => return Err(CoreError::NotAnObject),
        };
        let own_kind = body.get("kind").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let kind = if !own_kind.is_empty() {
            own_kind
        } else if !fallback_kind.is_empty() {
            body.insert("kind".into(), Value::String(fallback_kind.to_string()));
            fallback_kind.to_string()
        } else {
            return Err(CoreError::MissingField("kind"));
        };
        #[cfg(feature = "strip-managed-fields")]
        strip_managed_fields(&mut body);

        let meta = body
            .get("metadata")
            .and_then(|m| m.as_object())
            .ok_or(CoreError::MissingField("metadata"))?;
        let name = meta
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or(CoreError::MissingField("metadata.name"))?
            .to_string();
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let resource_version = meta
            .get("resourceVersion")
            .and_then(|v| v.as_str())
            .ok_or(CoreError::MissingField("metadata.resourceVersion"))?
            .to_string();

        Ok(Self { kind, namespace, name, resource_version, body })
    }

    pub fn document_id(&self) -> String {
        document_id(&self.kind, &self.namespace, &self.name)
    }

    /// Body to persist for this object, keyed by `id`.
    pub fn to_document(&self, id: &str) -> Map<String, Value> {
        let mut doc = self.body.clone();
        doc.insert("_id".into(), Value::String(id.to_string()));
        doc
    }

    /// `metadata.resourceVersion` of a stored document body, if present.
    pub fn version_of(body: &Map<String, Value>) -> Option<&str> {
        body.get("metadata")?.get("resourceVersion")?.as_str()
    }
}

#[cfg(feature = "strip-managed-fields")]
fn strip_managed_fields(body: &mut Map<String, Value>) {
    if let Some(meta) = body.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}
