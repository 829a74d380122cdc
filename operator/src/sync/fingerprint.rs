use crate::util::{self, Error};
use drsync_common::annotations;
use kube::api::DynamicObject;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

/// Metadata fields the source cluster owns; they differ between clusters
/// for identical content and must not influence the fingerprint.
const CLUSTER_LOCAL_METADATA: &[&str] = &[
    "uid",
    "resourceVersion",
    "selfLink",
    "creationTimestamp",
    "generation",
    "managedFields",
    "ownerReferences",
    "finalizers",
];

/// Strips cluster-local noise from a serialized object so that two
/// clusters holding the same content normalize to the same value.
pub fn normalize(obj: &DynamicObject) -> Result<Value, Error> {
    let mut value = serde_json::to_value(obj)?;
    if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        for field in CLUSTER_LOCAL_METADATA {
            metadata.remove(*field);
        }
        if let Some(ann) = metadata.get_mut("annotations").and_then(Value::as_object_mut) {
            ann.remove(annotations::LAST_APPLIED);
            if ann.is_empty() {
                metadata.remove("annotations");
            }
        }
    }
    // Status is the server's view, not content.
    if let Some(obj) = value.as_object_mut() {
        obj.remove("status");
    }
    Ok(value)
}

/// Content hash of the normalized object. serde_json's map keys are
/// sorted, so serialization order is stable.
pub fn fingerprint(obj: &DynamicObject) -> Result<String, Error> {
    Ok(util::hash_spec(&normalize(obj)?))
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FingerprintKey {
    pub cluster: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

/// In-memory only; never persisted. Decides whether a source object needs
/// to be re-transformed and re-written.
#[derive(Default)]
pub struct FingerprintCache {
    entries: Mutex<HashMap<FingerprintKey, String>>,
}

impl FingerprintCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the object is new or its content hash moved since the
    /// last recorded write.
    pub fn changed(&self, key: &FingerprintKey, fingerprint: &str) -> bool {
        let entries = self.entries.lock().unwrap();
        entries.get(key).map(String::as_str) != Some(fingerprint)
    }

    /// Records the hash of a successfully written object.
    pub fn record(&self, key: FingerprintKey, fingerprint: String) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key, fingerprint);
    }

    pub fn forget(&self, key: &FingerprintKey) {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(key);
    }

    /// Drops every entry for one mapping's (cluster, namespace); called on
    /// NamespaceMapping deletion.
    pub fn evict_mapping(&self, cluster: &str, namespace: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|k, _| !(k.cluster == cluster && k.namespace == namespace));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn object(resource_version: &str, uid: &str, data: serde_json::Value) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some("web".into()),
                namespace: Some("prod".into()),
                resource_version: Some(resource_version.into()),
                uid: Some(uid.into()),
                annotations: Some(
                    [(
                        annotations::LAST_APPLIED.to_string(),
                        "{\"old\":true}".to_string(),
                    )]
                    .into(),
                ),
                ..Default::default()
            },
            data,
        }
    }

    #[test]
    fn fingerprint_ignores_cluster_local_metadata() {
        let spec = serde_json::json!({"spec": {"replicas": 3}});
        let a = fingerprint(&object("100", "aaa", spec.clone())).unwrap();
        let b = fingerprint(&object("999", "bbb", spec)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_tracks_spec_changes() {
        let a = fingerprint(&object("1", "u", serde_json::json!({"spec": {"replicas": 3}}))).unwrap();
        let b = fingerprint(&object("1", "u", serde_json::json!({"spec": {"replicas": 5}}))).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_ignores_status() {
        let a = fingerprint(&object(
            "1",
            "u",
            serde_json::json!({"spec": {"x": 1}, "status": {"ready": 1}}),
        ))
        .unwrap();
        let b = fingerprint(&object(
            "1",
            "u",
            serde_json::json!({"spec": {"x": 1}, "status": {"ready": 2}}),
        ))
        .unwrap();
        assert_eq!(a, b);
    }

    fn key(ns: &str, name: &str) -> FingerprintKey {
        FingerprintKey {
            cluster: "prod".into(),
            kind: "ConfigMap".into(),
            namespace: ns.into(),
            name: name.into(),
        }
    }

    #[test]
    fn cache_skips_unchanged_and_evicts_per_mapping() {
        let cache = FingerprintCache::new();
        let k = key("web", "cm");
        assert!(cache.changed(&k, "abc"));
        cache.record(k.clone(), "abc".into());
        assert!(!cache.changed(&k, "abc"));
        assert!(cache.changed(&k, "def"));

        cache.record(key("other", "cm"), "zzz".into());
        cache.evict_mapping("prod", "web");
        assert!(cache.changed(&k, "abc"));
        assert!(!cache.changed(&key("other", "cm"), "zzz"));
    }
}
