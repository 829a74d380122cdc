use super::kinds::SyncKind;
use crate::util::Error;
use drsync_common::labels;
use kube::api::DynamicObject;

/// Resolves a NamespaceMapping's resourceTypes list into the kinds to
/// process, always in write order. `"*"` selects every syncable kind;
/// unknown entries are a config error so typos surface on the Ready
/// condition instead of silently skipping resources.
pub fn selected_kinds(resource_types: &[String]) -> Result<Vec<SyncKind>, Error> {
    if resource_types.iter().any(|t| t == "*") {
        return Ok(SyncKind::WRITE_ORDER.to_vec());
    }
    let mut selected = Vec::new();
    for entry in resource_types {
        let kind = SyncKind::from_name(entry)
            .ok_or_else(|| Error::UserInput(format!("unknown resource type '{entry}'")))?;
        if !selected.contains(&kind) {
            selected.push(kind);
        }
    }
    selected.sort();
    Ok(selected)
}

/// Whether the `dr-syncer.io/ignore=true` label excludes this object.
pub fn is_ignored(obj: &DynamicObject) -> bool {
    obj.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(labels::IGNORE))
        .is_some_and(|v| v == "true")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn labeled(key: &str, value: &str) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some("x".into()),
                labels: Some([(key.to_string(), value.to_string())].into()),
                ..Default::default()
            },
            data: serde_json::json!({}),
        }
    }

    #[test]
    fn wildcard_selects_everything_in_order() {
        let kinds = selected_kinds(&["*".to_string()]).unwrap();
        assert_eq!(kinds, SyncKind::WRITE_ORDER.to_vec());
    }

    #[test]
    fn explicit_kinds_are_reordered_and_deduped() {
        let kinds = selected_kinds(&[
            "deployments".to_string(),
            "ConfigMap".to_string(),
            "configmaps".to_string(),
        ])
        .unwrap();
        assert_eq!(kinds, vec![SyncKind::ConfigMap, SyncKind::Deployment]);
    }

    #[test]
    fn unknown_kind_is_a_config_error() {
        assert!(selected_kinds(&["FlexVolume".to_string()]).is_err());
    }

    #[test]
    fn ignore_label_excludes() {
        assert!(is_ignored(&labeled(labels::IGNORE, "true")));
        assert!(!is_ignored(&labeled(labels::IGNORE, "false")));
        assert!(!is_ignored(&labeled("app", "web")));
    }
}
