use drsync_common::{annotations, labels};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PersistentVolumeClaimVolumeSource, Pod, PodSpec,
    SecurityContext, Volume, VolumeMount,
};
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

const DATA_DIR: &str = "/data";

fn sync_pod_metadata(name: &str, namespace: &str, role: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some({
            let mut labels_map = BTreeMap::new();
            labels_map.insert(labels::SYNC_POD.to_string(), role.to_string());
            labels_map.insert(
                labels::MANAGED_BY.to_string(),
                crate::util::MANAGER_NAME.to_string(),
            );
            labels_map
        }),
        annotations: Some({
            let mut annotations_map = BTreeMap::new();
            annotations_map.insert(
                annotations::CREATED_BY.to_string(),
                crate::util::MANAGER_NAME.to_string(),
            );
            annotations_map
        }),
        ..Default::default()
    }
}

/// One-shot pod on the destination cluster that mounts the destination PVC
/// and serves rsync over sshd, trusting exactly the per-operation key.
/// Node placement comes from the caller: the node the PVC can bind on, or
/// none for ReadWriteMany claims.
pub fn rsync_server_pod(
    name: &str,
    namespace: &str,
    pvc_name: &str,
    image: &str,
    ssh_port: u16,
    authorized_keys: &str,
    node_name: Option<&str>,
) -> Pod {
    Pod {
        metadata: sync_pod_metadata(name, namespace, "rsync-server"),
        spec: Some(PodSpec {
            node_name: node_name.map(str::to_string),
            volumes: Some(vec![Volume {
                name: "replica".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: pvc_name.to_string(),
                    read_only: None,
                }),
                ..Default::default()
            }]),
            containers: vec![Container {
                name: "rsync-server".to_string(),
                image: Some(image.to_string()),
                args: Some(vec!["rsync-server".to_string()]),
                env: Some(vec![
                    EnvVar {
                        name: "AUTHORIZED_KEYS".to_string(),
                        value: Some(authorized_keys.to_string()),
                        value_from: None,
                    },
                    EnvVar {
                        name: "SSH_PORT".to_string(),
                        value: Some(ssh_port.to_string()),
                        value_from: None,
                    },
                    EnvVar {
                        name: "DATA_DIR".to_string(),
                        value: Some(DATA_DIR.to_string()),
                        value_from: None,
                    },
                ]),
                ports: Some(vec![ContainerPort {
                    container_port: ssh_port as i32,
                    name: Some("ssh".to_string()),
                    ..Default::default()
                }]),
                volume_mounts: Some(vec![VolumeMount {
                    name: "replica".to_string(),
                    mount_path: DATA_DIR.to_string(),
                    ..Default::default()
                }]),
                security_context: Some(SecurityContext {
                    run_as_user: Some(0),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

/// Short-lived pod that mounts a source PVC nobody is using, so the
/// kubelet materializes a host path we can rsync from.
pub fn placeholder_pod(name: &str, namespace: &str, pvc_name: &str, image: &str) -> Pod {
    Pod {
        metadata: sync_pod_metadata(name, namespace, "placeholder"),
        spec: Some(PodSpec {
            volumes: Some(vec![Volume {
                name: "source".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: pvc_name.to_string(),
                    read_only: Some(true),
                }),
                ..Default::default()
            }]),
            containers: vec![Container {
                name: "placeholder".to_string(),
                image: Some(image.to_string()),
                args: Some(vec!["idle".to_string()]),
                volume_mounts: Some(vec![VolumeMount {
                    name: "source".to_string(),
                    mount_path: DATA_DIR.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsync_pod_mounts_the_claim_on_the_chosen_node() {
        let pod = rsync_server_pod(
            "dr-rsync-db-data",
            "prod-dr",
            "db-data",
            "supporttools/dr-syncer-agent:latest",
            2222,
            "command=\"rsync --server --daemon .\",restrict ssh-ed25519 AAAA op",
            Some("node-b"),
        );
        let spec = pod.spec.unwrap();
        assert_eq!(spec.node_name.as_deref(), Some("node-b"));
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let volume = &spec.volumes.as_ref().unwrap()[0];
        assert_eq!(
            volume.persistent_volume_claim.as_ref().unwrap().claim_name,
            "db-data"
        );
        let labels_map = pod.metadata.labels.unwrap();
        assert_eq!(
            labels_map.get(labels::SYNC_POD).map(String::as_str),
            Some("rsync-server")
        );
    }

    #[test]
    fn rwx_claims_skip_node_pinning() {
        let pod = rsync_server_pod("p", "ns", "claim", "img", 2222, "keys", None);
        assert_eq!(pod.spec.unwrap().node_name, None);
    }

    #[test]
    fn placeholder_mounts_read_only() {
        let pod = placeholder_pod("dr-ph-db-data", "prod", "db-data", "img");
        let spec = pod.spec.unwrap();
        let volume = &spec.volumes.as_ref().unwrap()[0];
        assert_eq!(
            volume.persistent_volume_claim.as_ref().unwrap().read_only,
            Some(true)
        );
    }
}
