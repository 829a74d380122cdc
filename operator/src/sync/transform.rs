use super::kinds::SyncKind;
use super::pvc;
use crate::util::Error;
use drsync_common::{annotations, labels};
use drsync_types::{DeploymentScale, NamespaceMappingSpec};
use kube::api::DynamicObject;
use serde_json::Value;

/// Everything a transform needs to know about the pass it runs in.
pub struct TransformContext<'a> {
    pub spec: &'a NamespaceMappingSpec,
    /// Recorded first-sync replica counts (read-only here; the engine
    /// appends new entries after a successful write).
    pub scales: &'a [DeploymentScale],
    pub source_cluster: &'a str,
    /// Current destination object, when one exists. Immutable fields are
    /// preserved from it.
    pub existing: Option<&'a DynamicObject>,
}

/// Rewrites a source object into its destination form.
pub fn transform(
    kind: SyncKind,
    source: &DynamicObject,
    ctx: &TransformContext<'_>,
) -> Result<DynamicObject, Error> {
    let mut out = source.clone();
    sanitize_metadata(&mut out, kind, ctx);
    if let Some(data) = out.data.as_object_mut() {
        data.remove("status");
    }

    match kind {
        SyncKind::Namespace => transform_namespace(&mut out, ctx),
        SyncKind::Service => transform_service(&mut out, ctx),
        SyncKind::Secret => transform_secret(&mut out, ctx),
        SyncKind::Ingress => transform_ingress(&mut out, ctx),
        SyncKind::PersistentVolumeClaim => pvc::transform_pvc(&mut out, source, ctx)?,
        SyncKind::PersistentVolume => pvc::transform_pv(&mut out, ctx),
        k if k.is_workload() => transform_workload(&mut out, source, ctx),
        _ => {}
    }

    Ok(out)
}

/// Clears everything the source API server owns and stamps our own
/// bookkeeping. Labels other than `dr-syncer.io/ignore` are preserved.
pub fn sanitize_metadata(out: &mut DynamicObject, kind: SyncKind, ctx: &TransformContext<'_>) {
    let meta = &mut out.metadata;
    meta.uid = None;
    meta.resource_version = None;
    meta.creation_timestamp = None;
    meta.generation = None;
    meta.managed_fields = None;
    meta.owner_references = None;
    meta.finalizers = None;
    meta.deletion_timestamp = None;
    meta.deletion_grace_period_seconds = None;

    let meta_annotations = meta.annotations.get_or_insert_with(Default::default);
    meta_annotations.remove(annotations::LAST_APPLIED);
    meta_annotations.insert(
        annotations::SOURCE_CLUSTER.to_string(),
        ctx.source_cluster.to_string(),
    );
    meta_annotations.insert(
        annotations::SOURCE_NAMESPACE.to_string(),
        ctx.spec.source_namespace.clone(),
    );

    let meta_labels = meta.labels.get_or_insert_with(Default::default);
    meta_labels.remove(labels::IGNORE);
    meta_labels.insert(
        labels::MANAGED_BY.to_string(),
        crate::util::MANAGER_NAME.to_string(),
    );

    if kind == SyncKind::Namespace {
        meta.name = Some(ctx.spec.destination_namespace.clone());
        meta.namespace = None;
    } else if kind.cluster_scoped() {
        meta.namespace = None;
    } else {
        meta.namespace = Some(ctx.spec.destination_namespace.clone());
    }
}

fn transform_namespace(out: &mut DynamicObject, ctx: &TransformContext<'_>) {
    let cfg = &ctx.spec.namespace_config;
    if !cfg.preserve_labels
        && let Some(all) = out.metadata.labels.as_mut()
    {
        all.retain(|k, _| k == labels::MANAGED_BY);
    }
    if !cfg.preserve_annotations
        && let Some(all) = out.metadata.annotations.as_mut()
    {
        all.retain(|k, _| k.starts_with("dr-syncer.io/"));
    }
}

/// Replica count for a workload on the destination. The per-object
/// `scale-override` label wins over scaleToZero.
pub fn desired_replicas(
    scale_to_zero: bool,
    override_label: Option<&str>,
    source_replicas: i64,
) -> i64 {
    if let Some(raw) = override_label
        && let Ok(n) = raw.parse::<i64>()
        && n >= 0
    {
        return n;
    }
    if scale_to_zero { 0 } else { source_replicas }
}

pub fn source_replicas(obj: &DynamicObject) -> i64 {
    obj.data
        .get("spec")
        .and_then(|s| s.get("replicas"))
        .and_then(Value::as_i64)
        .unwrap_or(1)
}

fn transform_workload(out: &mut DynamicObject, source: &DynamicObject, ctx: &TransformContext<'_>) {
    let override_label = source
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(labels::SCALE_OVERRIDE))
        .map(String::as_str);
    let replicas = desired_replicas(
        ctx.spec.scale_to_zero,
        override_label,
        source_replicas(source),
    );
    if let Some(spec) = out.data.get_mut("spec").and_then(Value::as_object_mut) {
        spec.insert("replicas".to_string(), Value::from(replicas));
        // .spec.selector is immutable; an existing destination keeps its own.
        if let Some(existing) = ctx.existing
            && let Some(selector) = existing.data.get("spec").and_then(|s| s.get("selector"))
        {
            spec.insert("selector".to_string(), selector.clone());
        }
    }
}

fn transform_service(out: &mut DynamicObject, ctx: &TransformContext<'_>) {
    let Some(spec) = out.data.get_mut("spec").and_then(Value::as_object_mut) else {
        return;
    };
    match ctx.existing {
        Some(existing) => {
            // ClusterIP/ClusterIPs are immutable on an existing Service and
            // must survive the update.
            let existing_spec = existing.data.get("spec");
            for field in ["clusterIP", "clusterIPs"] {
                match existing_spec.and_then(|s| s.get(field)) {
                    Some(v) => {
                        spec.insert(field.to_string(), v.clone());
                    }
                    None => {
                        spec.remove(field);
                    }
                }
            }
        }
        None => {
            // Source-cluster IPs are meaningless in the destination CIDR.
            spec.remove("clusterIP");
            spec.remove("clusterIPs");
        }
    }
}

fn transform_secret(out: &mut DynamicObject, ctx: &TransformContext<'_>) {
    // Secret.type is immutable; keep the destination's.
    if let Some(existing) = ctx.existing
        && let Some(existing_type) = existing.data.get("type")
        && let Some(data) = out.data.as_object_mut()
    {
        data.insert("type".to_string(), existing_type.clone());
    }
}

fn transform_ingress(out: &mut DynamicObject, ctx: &TransformContext<'_>) {
    let cfg = &ctx.spec.ingress_config;
    if !cfg.preserve_annotations
        && let Some(all) = out.metadata.annotations.as_mut()
    {
        all.retain(|k, _| k.starts_with("dr-syncer.io/"));
    }
    let Some(spec) = out.data.get_mut("spec").and_then(Value::as_object_mut) else {
        return;
    };
    if !cfg.preserve_tls {
        spec.remove("tls");
    }
    if !cfg.preserve_backends {
        spec.remove("defaultBackend");
    }
}

/// Appends a first-sync scale record unless one already exists for the
/// workload. Existing records are never overwritten; they are the replica
/// counts a failover operator restores.
pub fn record_scale(
    scales: &mut Vec<DeploymentScale>,
    kind: SyncKind,
    name: &str,
    namespace: &str,
    original_replicas: i64,
) -> bool {
    if scales
        .iter()
        .any(|s| s.kind == kind.kind() && s.name == name && s.namespace == namespace)
    {
        return false;
    }
    scales.push(DeploymentScale {
        kind: kind.kind().to_string(),
        name: name.to_string(),
        namespace: namespace.to_string(),
        original_replicas: original_replicas as i32,
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use drsync_types::NamespaceConfig;
    use kube::api::ObjectMeta;

    fn mapping_spec() -> NamespaceMappingSpec {
        serde_json::from_value(serde_json::json!({
            "sourceNamespace": "prod",
            "destinationNamespace": "prod-dr",
            "scaleToZero": true,
        }))
        .unwrap()
    }

    fn ctx<'a>(
        spec: &'a NamespaceMappingSpec,
        existing: Option<&'a DynamicObject>,
    ) -> TransformContext<'a> {
        TransformContext {
            spec,
            scales: &[],
            source_cluster: "prod-east",
            existing,
        }
    }

    fn source_object(data: serde_json::Value) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some("test-deployment".into()),
                namespace: Some("prod".into()),
                uid: Some("u-1".into()),
                resource_version: Some("42".into()),
                labels: Some([("app".to_string(), "web".to_string())].into()),
                annotations: Some(
                    [(
                        annotations::LAST_APPLIED.to_string(),
                        "{}".to_string(),
                    )]
                    .into(),
                ),
                ..Default::default()
            },
            data,
        }
    }

    #[test]
    fn metadata_is_sanitized_and_stamped() {
        let spec = mapping_spec();
        let source = source_object(serde_json::json!({"spec": {"replicas": 3}}));
        let out = transform(SyncKind::Deployment, &source, &ctx(&spec, None)).unwrap();

        assert_eq!(out.metadata.uid, None);
        assert_eq!(out.metadata.resource_version, None);
        assert_eq!(out.metadata.namespace.as_deref(), Some("prod-dr"));
        let labels_map = out.metadata.labels.unwrap();
        assert_eq!(
            labels_map.get(labels::MANAGED_BY).map(String::as_str),
            Some("dr-syncer")
        );
        assert_eq!(labels_map.get("app").map(String::as_str), Some("web"));
        let ann = out.metadata.annotations.unwrap();
        assert!(!ann.contains_key(annotations::LAST_APPLIED));
        assert_eq!(
            ann.get(annotations::SOURCE_CLUSTER).map(String::as_str),
            Some("prod-east")
        );
    }

    #[test]
    fn scale_to_zero_zeroes_the_destination() {
        let spec = mapping_spec();
        let source = source_object(serde_json::json!({"spec": {"replicas": 3}}));
        let out = transform(SyncKind::Deployment, &source, &ctx(&spec, None)).unwrap();
        assert_eq!(out.data["spec"]["replicas"], 0);
    }

    #[test]
    fn scale_override_label_wins() {
        let spec = mapping_spec();
        let mut source = source_object(serde_json::json!({"spec": {"replicas": 3}}));
        source
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .insert(labels::SCALE_OVERRIDE.to_string(), "2".to_string());
        let out = transform(SyncKind::Deployment, &source, &ctx(&spec, None)).unwrap();
        assert_eq!(out.data["spec"]["replicas"], 2);
    }

    #[test]
    fn unparsable_scale_override_falls_back() {
        assert_eq!(desired_replicas(true, Some("lots"), 3), 0);
        assert_eq!(desired_replicas(false, Some("-1"), 3), 3);
        assert_eq!(desired_replicas(false, None, 3), 3);
    }

    #[test]
    fn deployment_selector_is_preserved_from_destination() {
        let spec = mapping_spec();
        let source = source_object(serde_json::json!({
            "spec": {"replicas": 3, "selector": {"matchLabels": {"app": "new"}}}
        }));
        let existing = source_object(serde_json::json!({
            "spec": {"replicas": 0, "selector": {"matchLabels": {"app": "old"}}}
        }));
        let out = transform(SyncKind::Deployment, &source, &ctx(&spec, Some(&existing))).unwrap();
        assert_eq!(out.data["spec"]["selector"]["matchLabels"]["app"], "old");
    }

    #[test]
    fn service_cluster_ip_survives_updates() {
        let spec = mapping_spec();
        let source = source_object(serde_json::json!({
            "spec": {"clusterIP": "172.1.2.3", "ports": [{"port": 8080}]}
        }));
        let existing = source_object(serde_json::json!({
            "spec": {"clusterIP": "10.0.0.100", "clusterIPs": ["10.0.0.100"], "ports": [{"port": 80}]}
        }));
        let out = transform(SyncKind::Service, &source, &ctx(&spec, Some(&existing))).unwrap();
        assert_eq!(out.data["spec"]["clusterIP"], "10.0.0.100");
        assert_eq!(out.data["spec"]["ports"][0]["port"], 8080);
    }

    #[test]
    fn fresh_service_drops_source_cluster_ips() {
        let spec = mapping_spec();
        let source = source_object(serde_json::json!({
            "spec": {"clusterIP": "172.1.2.3", "clusterIPs": ["172.1.2.3"], "ports": [{"port": 80}]}
        }));
        let out = transform(SyncKind::Service, &source, &ctx(&spec, None)).unwrap();
        assert!(out.data["spec"].get("clusterIP").is_none());
        assert!(out.data["spec"].get("clusterIPs").is_none());
    }

    #[test]
    fn secret_type_is_preserved_from_destination() {
        let spec = mapping_spec();
        let source = source_object(serde_json::json!({
            "type": "Opaque",
            "data": {"k": "djI="}
        }));
        let existing = source_object(serde_json::json!({
            "type": "kubernetes.io/tls",
            "data": {"k": "djE="}
        }));
        let out = transform(SyncKind::Secret, &source, &ctx(&spec, Some(&existing))).unwrap();
        assert_eq!(out.data["type"], "kubernetes.io/tls");
        assert_eq!(out.data["data"]["k"], "djI=");
    }

    #[test]
    fn ingress_flags_strip_sections() {
        let mut spec = mapping_spec();
        spec.ingress_config.preserve_tls = false;
        spec.ingress_config.preserve_backends = false;
        let source = source_object(serde_json::json!({
            "spec": {
                "ingressClassName": "nginx",
                "tls": [{"hosts": ["a.example.com"]}],
                "defaultBackend": {"service": {"name": "web"}},
                "rules": [{"host": "a.example.com"}]
            }
        }));
        let out = transform(SyncKind::Ingress, &source, &ctx(&spec, None)).unwrap();
        assert!(out.data["spec"].get("tls").is_none());
        assert!(out.data["spec"].get("defaultBackend").is_none());
        assert_eq!(out.data["spec"]["ingressClassName"], "nginx");
        assert_eq!(out.data["spec"]["rules"][0]["host"], "a.example.com");
    }

    #[test]
    fn namespace_maps_to_destination_name() {
        let spec = mapping_spec();
        let source = source_object(serde_json::json!({}));
        let out = transform(SyncKind::Namespace, &source, &ctx(&spec, None)).unwrap();
        assert_eq!(out.metadata.name.as_deref(), Some("prod-dr"));
        assert_eq!(out.metadata.namespace, None);
    }

    #[test]
    fn namespace_config_can_drop_labels() {
        let mut spec = mapping_spec();
        spec.namespace_config = NamespaceConfig {
            create_namespace: true,
            preserve_labels: false,
            preserve_annotations: false,
        };
        let source = source_object(serde_json::json!({}));
        let out = transform(SyncKind::Namespace, &source, &ctx(&spec, None)).unwrap();
        let labels_map = out.metadata.labels.unwrap();
        assert_eq!(labels_map.len(), 1);
        assert!(labels_map.contains_key(labels::MANAGED_BY));
    }

    #[test]
    fn ignore_label_never_reaches_the_destination() {
        let spec = mapping_spec();
        let mut source = source_object(serde_json::json!({"data": {}}));
        source
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .insert(labels::IGNORE.to_string(), "false".to_string());
        let out = transform(SyncKind::ConfigMap, &source, &ctx(&spec, None)).unwrap();
        assert!(!out.metadata.labels.unwrap().contains_key(labels::IGNORE));
    }

    #[test]
    fn scale_records_are_write_once() {
        let mut scales = Vec::new();
        assert!(record_scale(&mut scales, SyncKind::Deployment, "web", "prod", 3));
        // The source scaling to 5 later must not disturb the record.
        assert!(!record_scale(&mut scales, SyncKind::Deployment, "web", "prod", 5));
        assert_eq!(scales.len(), 1);
        assert_eq!(scales[0].original_replicas, 3);
        assert!(record_scale(&mut scales, SyncKind::StatefulSet, "web", "prod", 2));
    }
}
