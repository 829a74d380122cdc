use super::transform::TransformContext;
use crate::util::Error;
use drsync_common::labels;
use drsync_types::{AccessModeMapping, StorageClassMapping};
use kube::api::DynamicObject;
use serde_json::Value;

/// PVC spec attributes cleared on the destination unless listed in
/// PVCConfig.preservedAttributes (volumeName has its own override rules).
const CLEARED_UNLESS_PRESERVED: &[&str] = &["dataSource", "dataSourceRef", "selector"];

/// Storage-class translation: the per-PVC label override wins, then the
/// first matching `From→To` entry, then the source value unchanged. An
/// empty `From` matches PVCs with no class set.
pub fn map_storage_class(
    mappings: &[StorageClassMapping],
    label_override: Option<&str>,
    source_class: Option<&str>,
) -> Option<String> {
    if let Some(class) = label_override {
        return Some(class.to_string());
    }
    let source = source_class.unwrap_or("");
    for m in mappings {
        if m.from == source {
            return Some(m.to.clone());
        }
    }
    source_class.map(str::to_string)
}

/// Per-mode translation; unmatched modes pass through. A label override
/// replaces the whole list with the single named mode.
pub fn map_access_modes(
    mappings: &[AccessModeMapping],
    label_override: Option<&str>,
    modes: &[String],
) -> Vec<String> {
    if let Some(mode) = label_override {
        return vec![mode.to_string()];
    }
    modes
        .iter()
        .map(|mode| {
            mappings
                .iter()
                .find(|m| &m.from == mode)
                .map(|m| m.to.clone())
                .unwrap_or_else(|| mode.clone())
        })
        .collect()
}

/// Parses a Kubernetes resource quantity into a comparable byte count.
/// Covers the suffixes that appear on storage requests; fractional values
/// round down.
pub fn parse_quantity(q: &str) -> Option<i128> {
    let q = q.trim();
    let split = q
        .find(|c: char| !c.is_ascii_digit() && c != '.' && c != '-')
        .unwrap_or(q.len());
    let (num, suffix) = q.split_at(split);
    let value: f64 = num.parse().ok()?;
    let scale: f64 = match suffix {
        "" => 1.0,
        "m" => 0.001,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        _ => return None,
    };
    Some((value * scale) as i128)
}

fn storage_request(obj: &DynamicObject) -> Option<String> {
    obj.data
        .get("spec")?
        .get("resources")?
        .get("requests")?
        .get("storage")?
        .as_str()
        .map(str::to_string)
}

fn pvc_label<'a>(obj: &'a DynamicObject, key: &str) -> Option<&'a str> {
    obj.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
}

/// Whether the PV backing this PVC should be carried to the destination.
/// The `dr-syncer.io/sync-pv` label is an unconditional override of the
/// spec flag when present.
pub fn sync_pv_effective(source: &DynamicObject, spec_flag: bool) -> bool {
    match pvc_label(source, labels::SYNC_PV) {
        Some("true") => true,
        Some("false") => false,
        _ => spec_flag,
    }
}

/// Applies the PVC rules on top of the generic transform. `out` has been
/// sanitized already; `source` still carries the original labels.
pub fn transform_pvc(
    out: &mut DynamicObject,
    source: &DynamicObject,
    ctx: &TransformContext<'_>,
) -> Result<(), Error> {
    let cfg = &ctx.spec.pvc_config;

    match ctx.existing {
        Some(existing) => {
            // storageClassName, volumeName and accessModes are immutable
            // after creation; only expansion flows through.
            let existing_spec = existing.data.get("spec");
            let Some(spec) = out.data.get_mut("spec").and_then(Value::as_object_mut) else {
                return Ok(());
            };
            for field in ["storageClassName", "volumeName", "accessModes"] {
                match existing_spec.and_then(|s| s.get(field)) {
                    Some(v) => {
                        spec.insert(field.to_string(), v.clone());
                    }
                    None => {
                        spec.remove(field);
                    }
                }
            }
            let source_bytes = storage_request(source).as_deref().and_then(parse_quantity);
            let existing_bytes = storage_request(existing).as_deref().and_then(parse_quantity);
            if let (Some(src), Some(cur)) = (source_bytes, existing_bytes)
                && src <= cur
            {
                // Contraction is refused; keep the destination's request.
                if let Some(requests) = spec
                    .get_mut("resources")
                    .and_then(|r| r.get_mut("requests"))
                    .and_then(Value::as_object_mut)
                    && let Some(v) = existing_spec
                        .and_then(|s| s.get("resources"))
                        .and_then(|r| r.get("requests"))
                        .and_then(|r| r.get("storage"))
                {
                    requests.insert("storage".to_string(), v.clone());
                }
            }
        }
        None => {
            let storage_class_override = pvc_label(source, labels::STORAGE_CLASS);
            let access_mode_override = pvc_label(source, labels::ACCESS_MODE);
            let keep_volume_name = sync_pv_effective(source, cfg.sync_persistent_volumes)
                || cfg.preserved_attributes.iter().any(|a| a == "volumeName");

            let Some(spec) = out.data.get_mut("spec").and_then(Value::as_object_mut) else {
                return Ok(());
            };

            let source_class = spec
                .get("storageClassName")
                .and_then(Value::as_str)
                .map(str::to_string);
            match map_storage_class(
                &cfg.storage_class_mappings,
                storage_class_override,
                source_class.as_deref(),
            ) {
                Some(class) => {
                    spec.insert("storageClassName".to_string(), Value::from(class));
                }
                None => {
                    spec.remove("storageClassName");
                }
            }

            if let Some(modes) = spec.get("accessModes").and_then(Value::as_array) {
                let modes: Vec<String> = modes
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
                let mapped =
                    map_access_modes(&cfg.access_mode_mappings, access_mode_override, &modes);
                spec.insert("accessModes".to_string(), Value::from(mapped));
            }

            if !keep_volume_name {
                spec.remove("volumeName");
            }
            for field in CLEARED_UNLESS_PRESERVED {
                if !cfg.preserved_attributes.iter().any(|a| a == field) {
                    spec.remove(*field);
                }
            }
            if !cfg.preserve_volume_attributes {
                for field in ["volumeMode", "volumeAttributesClassName"] {
                    if !cfg.preserved_attributes.iter().any(|a| a == field) {
                        spec.remove(field);
                    }
                }
            }
        }
    }
    Ok(())
}

/// Sanitizes a PV for creation in the destination cluster: the claimRef
/// is repointed at the destination namespace with its server-owned fields
/// cleared, and the storage class is mapped like the PVC's.
pub fn transform_pv(out: &mut DynamicObject, ctx: &TransformContext<'_>) {
    let cfg = &ctx.spec.pvc_config;
    let Some(spec) = out.data.get_mut("spec").and_then(Value::as_object_mut) else {
        return;
    };
    if let Some(class) = spec
        .get("storageClassName")
        .and_then(Value::as_str)
        .map(str::to_string)
        && let Some(mapped) = map_storage_class(&cfg.storage_class_mappings, None, Some(&class))
    {
        spec.insert("storageClassName".to_string(), Value::from(mapped));
    }
    if let Some(claim) = spec.get_mut("claimRef").and_then(Value::as_object_mut) {
        claim.remove("uid");
        claim.remove("resourceVersion");
        claim.insert(
            "namespace".to_string(),
            Value::from(ctx.spec.destination_namespace.clone()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::kinds::SyncKind;
    use crate::sync::transform::{TransformContext, transform};
    use drsync_types::NamespaceMappingSpec;
    use kube::api::ObjectMeta;

    fn mappings() -> Vec<StorageClassMapping> {
        vec![
            StorageClassMapping {
                from: "do-block-storage".into(),
                to: "do-block-storage-xfs".into(),
            },
            StorageClassMapping {
                from: "".into(),
                to: "default-dr".into(),
            },
        ]
    }

    #[test]
    fn storage_class_first_match_wins() {
        let m = mappings();
        assert_eq!(
            map_storage_class(&m, None, Some("do-block-storage")),
            Some("do-block-storage-xfs".into())
        );
        assert_eq!(
            map_storage_class(&m, None, Some("unmapped")),
            Some("unmapped".into())
        );
    }

    #[test]
    fn empty_source_class_maps_explicitly() {
        assert_eq!(map_storage_class(&mappings(), None, None), Some("default-dr".into()));
        assert_eq!(map_storage_class(&[], None, None), None);
    }

    #[test]
    fn label_override_beats_mappings() {
        assert_eq!(
            map_storage_class(&mappings(), Some("premium"), Some("do-block-storage")),
            Some("premium".into())
        );
    }

    #[test]
    fn storage_class_mapping_is_stable_under_reapplication() {
        // apply(apply(mapping, x)) = apply(mapping, x) for mapped values
        // whose target is outside the mapping domain.
        let m = mappings();
        let once = map_storage_class(&m, None, Some("do-block-storage")).unwrap();
        let twice = map_storage_class(&m, None, Some(&once)).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn access_modes_translate_per_mode() {
        let m = vec![AccessModeMapping {
            from: "ReadOnlyMany".into(),
            to: "ReadWriteMany".into(),
        }];
        let out = map_access_modes(
            &m,
            None,
            &["ReadWriteOnce".to_string(), "ReadOnlyMany".to_string()],
        );
        assert_eq!(out, vec!["ReadWriteOnce".to_string(), "ReadWriteMany".to_string()]);
        // stable under reapplication when targets are outside the domain
        assert_eq!(map_access_modes(&m, None, &out), out);
    }

    #[test]
    fn quantities_compare_across_suffixes() {
        assert_eq!(parse_quantity("1Ki"), Some(1024));
        assert!(parse_quantity("10Gi") < parse_quantity("20Gi"));
        assert!(parse_quantity("1Gi") > parse_quantity("1G"));
        assert!(parse_quantity("1500m") < parse_quantity("2"));
        assert_eq!(parse_quantity("weird"), None);
    }

    fn mapping_spec(extra: serde_json::Value) -> NamespaceMappingSpec {
        let mut base = serde_json::json!({
            "sourceNamespace": "prod",
            "destinationNamespace": "prod-dr",
        });
        base.as_object_mut()
            .unwrap()
            .extend(extra.as_object().cloned().unwrap_or_default());
        serde_json::from_value(base).unwrap()
    }

    fn pvc(labels_json: serde_json::Value, spec_json: serde_json::Value) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some("db-data".into()),
                namespace: Some("prod".into()),
                labels: serde_json::from_value(labels_json).ok(),
                ..Default::default()
            },
            data: serde_json::json!({"spec": spec_json}),
        }
    }

    #[test]
    fn create_applies_mappings_and_clears_volume_name() {
        let spec = mapping_spec(serde_json::json!({
            "pvcConfig": {
                "storageClassMappings": [
                    {"from": "do-block-storage", "to": "do-block-storage-xfs"}
                ]
            }
        }));
        let ctx = TransformContext {
            spec: &spec,
            scales: &[],
            source_cluster: "prod-east",
            existing: None,
        };
        let source = pvc(
            serde_json::json!({}),
            serde_json::json!({
                "storageClassName": "do-block-storage",
                "accessModes": ["ReadWriteOnce"],
                "volumeName": "pv-123",
                "resources": {"requests": {"storage": "10Gi"}}
            }),
        );
        let out = transform(SyncKind::PersistentVolumeClaim, &source, &ctx).unwrap();
        assert_eq!(out.data["spec"]["storageClassName"], "do-block-storage-xfs");
        assert_eq!(out.data["spec"]["accessModes"][0], "ReadWriteOnce");
        assert_eq!(out.data["spec"]["resources"]["requests"]["storage"], "10Gi");
        assert!(out.data["spec"].get("volumeName").is_none());
    }

    #[test]
    fn sync_pv_label_keeps_volume_name() {
        let spec = mapping_spec(serde_json::json!({}));
        let ctx = TransformContext {
            spec: &spec,
            scales: &[],
            source_cluster: "prod-east",
            existing: None,
        };
        let source = pvc(
            serde_json::json!({"dr-syncer.io/sync-pv": "true"}),
            serde_json::json!({"volumeName": "pv-123", "accessModes": ["ReadWriteOnce"]}),
        );
        let out = transform(SyncKind::PersistentVolumeClaim, &source, &ctx).unwrap();
        assert_eq!(out.data["spec"]["volumeName"], "pv-123");
    }

    #[test]
    fn sync_pv_label_false_overrides_spec_flag() {
        let source = pvc(
            serde_json::json!({"dr-syncer.io/sync-pv": "false"}),
            serde_json::json!({}),
        );
        assert!(!sync_pv_effective(&source, true));
        let unlabeled = pvc(serde_json::json!({}), serde_json::json!({}));
        assert!(sync_pv_effective(&unlabeled, true));
        assert!(!sync_pv_effective(&unlabeled, false));
    }

    #[test]
    fn update_preserves_immutables_and_refuses_contraction() {
        let spec = mapping_spec(serde_json::json!({}));
        let existing = pvc(
            serde_json::json!({}),
            serde_json::json!({
                "storageClassName": "do-block-storage-xfs",
                "accessModes": ["ReadWriteMany"],
                "volumeName": "pv-dest",
                "resources": {"requests": {"storage": "20Gi"}}
            }),
        );
        let ctx = TransformContext {
            spec: &spec,
            scales: &[],
            source_cluster: "prod-east",
            existing: Some(&existing),
        };
        let source = pvc(
            serde_json::json!({}),
            serde_json::json!({
                "storageClassName": "do-block-storage",
                "accessModes": ["ReadWriteOnce"],
                "resources": {"requests": {"storage": "10Gi"}}
            }),
        );
        let out = transform(SyncKind::PersistentVolumeClaim, &source, &ctx).unwrap();
        assert_eq!(out.data["spec"]["storageClassName"], "do-block-storage-xfs");
        assert_eq!(out.data["spec"]["accessModes"][0], "ReadWriteMany");
        assert_eq!(out.data["spec"]["volumeName"], "pv-dest");
        assert_eq!(out.data["spec"]["resources"]["requests"]["storage"], "20Gi");
    }

    #[test]
    fn update_allows_expansion() {
        let spec = mapping_spec(serde_json::json!({}));
        let existing = pvc(
            serde_json::json!({}),
            serde_json::json!({
                "accessModes": ["ReadWriteOnce"],
                "resources": {"requests": {"storage": "10Gi"}}
            }),
        );
        let ctx = TransformContext {
            spec: &spec,
            scales: &[],
            source_cluster: "prod-east",
            existing: Some(&existing),
        };
        let source = pvc(
            serde_json::json!({}),
            serde_json::json!({
                "accessModes": ["ReadWriteOnce"],
                "resources": {"requests": {"storage": "30Gi"}}
            }),
        );
        let out = transform(SyncKind::PersistentVolumeClaim, &source, &ctx).unwrap();
        assert_eq!(out.data["spec"]["resources"]["requests"]["storage"], "30Gi");
    }

    #[test]
    fn pv_claim_ref_is_repointed() {
        let spec = mapping_spec(serde_json::json!({}));
        let ctx = TransformContext {
            spec: &spec,
            scales: &[],
            source_cluster: "prod-east",
            existing: None,
        };
        let source = DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some("pv-123".into()),
                ..Default::default()
            },
            data: serde_json::json!({
                "spec": {
                    "capacity": {"storage": "10Gi"},
                    "claimRef": {
                        "name": "db-data",
                        "namespace": "prod",
                        "uid": "u-9",
                        "resourceVersion": "77"
                    }
                }
            }),
        };
        let out = transform(SyncKind::PersistentVolume, &source, &ctx).unwrap();
        let claim = &out.data["spec"]["claimRef"];
        assert_eq!(claim["namespace"], "prod-dr");
        assert!(claim.get("uid").is_none());
        assert!(claim.get("resourceVersion").is_none());
        assert_eq!(out.metadata.namespace, None);
    }
}
