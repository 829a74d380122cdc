use super::kinds::SyncKind;
use crate::util::{self, Error};
use drsync_common::labels;
use drsync_types::{ImmutableHandling, ImmutableResourceConfig};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    Api, ResourceExt,
    api::{DeleteParams, DynamicObject, EvictParams, ListParams, Patch, PatchParams, PropagationPolicy},
};
use owo_colors::OwoColorize;
use serde_json::{Value, json};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Picks the strategy for a write that would touch an immutable field.
/// Order: per-object label, per-kind override, mapping default, NoChange.
pub fn select_strategy(
    source: &DynamicObject,
    cfg: &ImmutableResourceConfig,
    kind: SyncKind,
) -> ImmutableHandling {
    if let Some(raw) = source
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(labels::IMMUTABLE_HANDLING))
        && let Ok(handling) = raw.parse::<ImmutableHandling>()
    {
        return handling;
    }
    if let Some(handling) = cfg.resource_overrides.get(&kind.kind_group_key()) {
        return *handling;
    }
    cfg.default_handling
}

/// The merge-patch body containing only the fields §4.3 declares mutable
/// for this kind. Used by the PartialUpdate strategy; immutable fields are
/// left to whatever the destination already holds.
pub fn mutable_subset(kind: SyncKind, desired: &DynamicObject) -> Value {
    let spec_fields = |fields: &[&str]| -> Value {
        let mut out = serde_json::Map::new();
        if let Some(spec) = desired.data.get("spec").and_then(Value::as_object) {
            for field in fields {
                if let Some(v) = spec.get(*field) {
                    out.insert((*field).to_string(), v.clone());
                }
            }
        }
        json!({ "spec": Value::Object(out) })
    };
    let top_fields = |fields: &[&str]| -> Value {
        let mut out = serde_json::Map::new();
        for field in fields {
            if let Some(v) = desired.data.get(*field) {
                out.insert((*field).to_string(), v.clone());
            }
        }
        Value::Object(out)
    };
    match kind {
        SyncKind::Deployment | SyncKind::StatefulSet | SyncKind::DaemonSet => spec_fields(&[
            "replicas",
            "template",
            "strategy",
            "updateStrategy",
            "minReadySeconds",
            "revisionHistoryLimit",
            "paused",
            "progressDeadlineSeconds",
        ]),
        SyncKind::Service => spec_fields(&[
            "ports",
            "selector",
            "externalIPs",
            "externalTrafficPolicy",
            "sessionAffinity",
            "externalName",
        ]),
        SyncKind::ConfigMap => top_fields(&["data", "binaryData"]),
        SyncKind::Secret => top_fields(&["data", "stringData"]),
        SyncKind::PersistentVolumeClaim => json!({
            "spec": {
                "resources": desired
                    .data
                    .get("spec")
                    .and_then(|s| s.get("resources"))
                    .cloned()
                    .unwrap_or(Value::Null)
            }
        }),
        SyncKind::Ingress => spec_fields(&["ingressClassName", "defaultBackend", "rules", "tls"]),
        _ => json!({ "spec": desired.data.get("spec").cloned().unwrap_or(Value::Null) }),
    }
}

async fn wait_until_gone(
    api: &Api<DynamicObject>,
    name: &str,
    cancel: &CancellationToken,
    deadline: Duration,
) -> Result<bool, Error> {
    drsync_common::wait::poll_until(cancel, deadline, Duration::from_secs(5), || async {
        Ok(api.get_opt(name).await?.is_none())
    })
    .await
    .map_err(|_| Error::Cancelled)
}

/// Delete, wait until the object is gone, create anew.
pub async fn recreate(
    api: &Api<DynamicObject>,
    desired: &DynamicObject,
    cancel: &CancellationToken,
    deadline: Duration,
) -> Result<(), Error> {
    let name = desired.name_any();
    match api.delete(&name, &DeleteParams::default()).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => return Err(e.into()),
    }
    if !wait_until_gone(api, &name, cancel, deadline).await? {
        return Err(Error::UserInput(format!(
            "'{name}' still present after delete; cannot recreate"
        )));
    }
    let mut fresh = desired.clone();
    fresh.metadata.resource_version = None;
    api.create(&Default::default(), &fresh).await?;
    Ok(())
}

/// Delete with foreground propagation, bounded wait, then create.
pub async fn force_update(
    api: &Api<DynamicObject>,
    desired: &DynamicObject,
    cancel: &CancellationToken,
    deadline: Duration,
) -> Result<(), Error> {
    let name = desired.name_any();
    let dp = DeleteParams {
        propagation_policy: Some(PropagationPolicy::Foreground),
        ..Default::default()
    };
    match api.delete(&name, &dp).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => return Err(e.into()),
    }
    if !wait_until_gone(api, &name, cancel, deadline).await? {
        return Err(Error::UserInput(format!(
            "'{name}' not fully deleted within the force-delete window"
        )));
    }
    let mut fresh = desired.clone();
    fresh.metadata.resource_version = None;
    api.create(&Default::default(), &fresh).await?;
    Ok(())
}

/// Evicts every pod attached to the object (by its selector), bounded by
/// the drain timeout, then recreates.
pub async fn recreate_with_drain(
    api: &Api<DynamicObject>,
    pods: &Api<Pod>,
    existing: &DynamicObject,
    desired: &DynamicObject,
    cancel: &CancellationToken,
    drain_deadline: Duration,
    recreate_deadline: Duration,
) -> Result<(), Error> {
    if let Some(selector) = pod_selector(existing) {
        let lp = ListParams::default().labels(&selector);
        let attached = pods.list(&lp).await?;
        for pod in attached.items {
            let pod_name = pod.name_any();
            match pods.evict(&pod_name, &EvictParams::default()).await {
                Ok(_) => println!("{}", format!("evicted pod '{pod_name}'").dimmed()),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => eprintln!("{}", format!("evict '{pod_name}': {e}").yellow()),
            }
        }
        let drained = drsync_common::wait::poll_until(
            cancel,
            drain_deadline,
            Duration::from_secs(5),
            || async { Ok(pods.list(&lp).await?.items.is_empty()) },
        )
        .await
        .map_err(|_| Error::Cancelled)?;
        if !drained {
            eprintln!(
                "{}",
                format!(
                    "pods for '{}' not fully drained within {}; recreating anyway",
                    existing.name_any(),
                    util::format_duration(drain_deadline)
                )
                .yellow()
            );
        }
    }
    recreate(api, desired, cancel, recreate_deadline).await
}

/// Patch only the mutable fields, leaving immutables untouched.
pub async fn partial_update(
    api: &Api<DynamicObject>,
    kind: SyncKind,
    desired: &DynamicObject,
) -> Result<(), Error> {
    let name = desired.name_any();
    let body = mutable_subset(kind, desired);
    api.patch(&name, &PatchParams::default(), &Patch::Merge(&body))
        .await?;
    Ok(())
}

/// Label selector string for the pods an object owns, when it has one.
fn pod_selector(obj: &DynamicObject) -> Option<String> {
    let match_labels = obj
        .data
        .get("spec")?
        .get("selector")?
        .get("matchLabels")?
        .as_object()?;
    let parts: Vec<String> = match_labels
        .iter()
        .filter_map(|(k, v)| v.as_str().map(|v| format!("{k}={v}")))
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn object(labels_json: serde_json::Value, data: serde_json::Value) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some("x".into()),
                labels: serde_json::from_value(labels_json).ok(),
                ..Default::default()
            },
            data,
        }
    }

    fn config(default: ImmutableHandling, overrides: &[(&str, ImmutableHandling)]) -> ImmutableResourceConfig {
        ImmutableResourceConfig {
            default_handling: default,
            resource_overrides: overrides
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn label_beats_override_beats_default() {
        let cfg = config(
            ImmutableHandling::Recreate,
            &[("ConfigMap", ImmutableHandling::PartialUpdate)],
        );

        let labeled = object(
            serde_json::json!({"dr-syncer.io/immutable-handling": "force-update"}),
            serde_json::json!({}),
        );
        assert_eq!(
            select_strategy(&labeled, &cfg, SyncKind::ConfigMap),
            ImmutableHandling::ForceUpdate
        );

        let unlabeled = object(serde_json::json!({}), serde_json::json!({}));
        assert_eq!(
            select_strategy(&unlabeled, &cfg, SyncKind::ConfigMap),
            ImmutableHandling::PartialUpdate
        );
        assert_eq!(
            select_strategy(&unlabeled, &cfg, SyncKind::Secret),
            ImmutableHandling::Recreate
        );
    }

    #[test]
    fn bogus_label_falls_through() {
        let cfg = config(ImmutableHandling::NoChange, &[]);
        let labeled = object(
            serde_json::json!({"dr-syncer.io/immutable-handling": "explode"}),
            serde_json::json!({}),
        );
        assert_eq!(
            select_strategy(&labeled, &cfg, SyncKind::Service),
            ImmutableHandling::NoChange
        );
    }

    #[test]
    fn deployment_subset_omits_selector() {
        let desired = object(
            serde_json::json!({}),
            serde_json::json!({
                "spec": {
                    "replicas": 0,
                    "selector": {"matchLabels": {"app": "web"}},
                    "template": {"metadata": {"labels": {"app": "web"}}},
                    "minReadySeconds": 5
                }
            }),
        );
        let patch = mutable_subset(SyncKind::Deployment, &desired);
        assert_eq!(patch["spec"]["replicas"], 0);
        assert_eq!(patch["spec"]["minReadySeconds"], 5);
        assert!(patch["spec"].get("selector").is_none());
    }

    #[test]
    fn configmap_subset_overwrites_data_only() {
        let desired = object(
            serde_json::json!({}),
            serde_json::json!({"data": {"a": "1"}, "binaryData": {"b": "Yg=="}, "immutable": true}),
        );
        let patch = mutable_subset(SyncKind::ConfigMap, &desired);
        assert_eq!(patch["data"]["a"], "1");
        assert_eq!(patch["binaryData"]["b"], "Yg==");
        assert!(patch.get("immutable").is_none());
        assert!(patch.get("metadata").is_none());
    }

    #[test]
    fn service_subset_excludes_cluster_ip() {
        let desired = object(
            serde_json::json!({}),
            serde_json::json!({
                "spec": {
                    "clusterIP": "10.0.0.1",
                    "ports": [{"port": 8080}],
                    "selector": {"app": "web"}
                }
            }),
        );
        let patch = mutable_subset(SyncKind::Service, &desired);
        assert!(patch["spec"].get("clusterIP").is_none());
        assert_eq!(patch["spec"]["ports"][0]["port"], 8080);
    }

    #[test]
    fn pvc_subset_is_expansion_only() {
        let desired = object(
            serde_json::json!({}),
            serde_json::json!({
                "spec": {
                    "storageClassName": "fast",
                    "accessModes": ["ReadWriteOnce"],
                    "resources": {"requests": {"storage": "20Gi"}}
                }
            }),
        );
        let patch = mutable_subset(SyncKind::PersistentVolumeClaim, &desired);
        assert_eq!(patch["spec"]["resources"]["requests"]["storage"], "20Gi");
        assert!(patch["spec"].get("storageClassName").is_none());
        assert!(patch["spec"].get("accessModes").is_none());
    }

    #[test]
    fn selector_string_is_built_from_match_labels() {
        let obj = object(
            serde_json::json!({}),
            serde_json::json!({"spec": {"selector": {"matchLabels": {"app": "web", "tier": "db"}}}}),
        );
        let s = pod_selector(&obj).unwrap();
        assert!(s.contains("app=web"));
        assert!(s.contains("tier=db"));
        assert!(pod_selector(&object(serde_json::json!({}), serde_json::json!({}))).is_none());
    }
}
