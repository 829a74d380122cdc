use crate::pvcsync::keys;
use crate::util::{self, Error};
use drsync_common::{annotations, labels};
use drsync_types::RemoteCluster;
use k8s_openapi::ByteString;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HostPathVolumeSource, PodSpec, PodTemplateSpec,
    SecretVolumeSource, Secret, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

/// Namespace the agent plane occupies on every remote cluster.
pub const AGENT_NAMESPACE: &str = "dr-syncer";
pub const DAEMONSET_NAME: &str = "dr-syncer-agent";
pub const HOST_KEYS_SECRET: &str = "dr-syncer-agent-host-keys";
pub const AUTHORIZED_KEYS_SECRET: &str = "dr-syncer-agent-authorized-keys";
pub const PAIR_KEY_SECRET: &str = "dr-syncer-pair-key";

pub fn agent_selector_labels() -> BTreeMap<String, String> {
    let mut m = BTreeMap::new();
    m.insert(labels::AGENT.to_string(), "true".to_string());
    m.insert(
        labels::MANAGED_BY.to_string(),
        util::MANAGER_NAME.to_string(),
    );
    m
}

fn agent_metadata(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(AGENT_NAMESPACE.to_string()),
        labels: Some(agent_selector_labels()),
        ..Default::default()
    }
}

/// Generates a fresh sshd host-key set and wraps it in a secret. Rotation
/// is a new secret applied before the old data is dropped; the DaemonSet
/// spec hash picks the change up and rolls the pods.
pub fn build_host_keys_secret(cluster_name: &str) -> Result<Secret, Error> {
    let generated = keys::generate_host_keys(&format!("dr-syncer-agent@{cluster_name}"))?;
    let mut data = BTreeMap::new();
    for (algorithm, key) in generated {
        data.insert(
            format!("ssh_host_{algorithm}_key"),
            ByteString(key.private_openssh.into_bytes()),
        );
        data.insert(
            format!("ssh_host_{algorithm}_key.pub"),
            ByteString(key.public_openssh.into_bytes()),
        );
    }
    Ok(Secret {
        metadata: agent_metadata(HOST_KEYS_SECRET),
        data: Some(data),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    })
}

/// The agent DaemonSet: one sshd+rsync bastion per node, host keys and
/// authorized keys mounted from their secrets, the kubelet pod directory
/// mounted so rsync can reach CSI publish paths.
pub fn build_daemonset(cluster: &RemoteCluster, host_keys_version: &str) -> DaemonSet {
    let agent = &cluster.spec.agent;
    let pod_labels = agent_selector_labels();

    let spec_hash = util::hash_spec(&(agent, host_keys_version));
    let mut annotations_map = BTreeMap::new();
    annotations_map.insert(annotations::SPEC_HASH.to_string(), spec_hash);
    annotations_map.insert(
        annotations::CREATED_BY.to_string(),
        util::MANAGER_NAME.to_string(),
    );

    let volumes = vec![
        Volume {
            name: "host-keys".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(HOST_KEYS_SECRET.to_string()),
                default_mode: Some(0o400),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "authorized-keys".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(AUTHORIZED_KEYS_SECRET.to_string()),
                optional: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "pair-key".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(PAIR_KEY_SECRET.to_string()),
                default_mode: Some(0o400),
                optional: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "kubelet-pods".to_string(),
            host_path: Some(HostPathVolumeSource {
                path: "/var/lib/kubelet/pods".to_string(),
                type_: Some("Directory".to_string()),
            }),
            ..Default::default()
        },
    ];

    let container = Container {
        name: "agent".to_string(),
        image: Some(agent.image.clone()),
        args: Some(vec!["agent".to_string()]),
        env: Some(vec![EnvVar {
            name: "SSH_PORT".to_string(),
            value: Some(agent.ssh_port.to_string()),
            value_from: None,
        }]),
        ports: Some(vec![ContainerPort {
            container_port: agent.ssh_port as i32,
            host_port: agent.host_network.then_some(agent.ssh_port as i32),
            name: Some("ssh".to_string()),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "host-keys".to_string(),
                mount_path: "/etc/ssh/keys".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "authorized-keys".to_string(),
                mount_path: "/etc/dr-syncer/authorized".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "pair-key".to_string(),
                mount_path: "/etc/dr-syncer/pair".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "kubelet-pods".to_string(),
                mount_path: "/var/lib/kubelet/pods".to_string(),
                ..Default::default()
            },
        ]),
        resources: agent.resources.clone(),
        security_context: Some(SecurityContext {
            privileged: Some(agent.privileged),
            run_as_user: Some(0),
            ..Default::default()
        }),
        ..Default::default()
    };

    DaemonSet {
        metadata: ObjectMeta {
            annotations: Some(annotations_map.clone()),
            ..agent_metadata(DAEMONSET_NAME)
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(pod_labels.clone()),
                match_expressions: None,
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: Some(annotations_map),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    host_network: Some(agent.host_network),
                    node_selector: agent.node_selector.clone(),
                    tolerations: agent.tolerations.clone(),
                    volumes: Some(volumes),
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(agent_json: serde_json::Value) -> RemoteCluster {
        let spec = serde_json::from_value(serde_json::json!({
            "credentialRef": {"name": "dr-east-kubeconfig"},
            "agent": agent_json,
        }))
        .unwrap();
        RemoteCluster::new("dr-east", spec)
    }

    #[test]
    fn daemonset_defaults_to_host_network_on_2222() {
        let ds = build_daemonset(&cluster(serde_json::json!({})), "v1");
        let pod = ds.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.host_network, Some(true));
        let port = &pod.containers[0].ports.as_ref().unwrap()[0];
        assert_eq!(port.container_port, 2222);
        assert_eq!(port.host_port, Some(2222));
    }

    #[test]
    fn spec_hash_moves_with_agent_config_and_key_rotation() {
        let a = build_daemonset(&cluster(serde_json::json!({})), "v1");
        let b = build_daemonset(&cluster(serde_json::json!({})), "v2");
        let c = build_daemonset(&cluster(serde_json::json!({"sshPort": 2322})), "v1");
        let hash = |ds: &DaemonSet| {
            ds.metadata
                .annotations
                .as_ref()
                .unwrap()
                .get(annotations::SPEC_HASH)
                .cloned()
                .unwrap()
        };
        assert_ne!(hash(&a), hash(&b));
        assert_ne!(hash(&a), hash(&c));
        assert_eq!(hash(&a), hash(&build_daemonset(&cluster(serde_json::json!({})), "v1")));
    }

    #[test]
    fn host_key_secret_carries_all_three_algorithms() {
        let secret = build_host_keys_secret("dr-east").unwrap();
        let data = secret.data.unwrap();
        for algorithm in ["rsa", "ecdsa", "ed25519"] {
            assert!(data.contains_key(&format!("ssh_host_{algorithm}_key")));
            assert!(data.contains_key(&format!("ssh_host_{algorithm}_key.pub")));
        }
    }

    #[test]
    fn kubelet_pod_directory_is_mounted() {
        let ds = build_daemonset(&cluster(serde_json::json!({})), "v1");
        let pod = ds.spec.unwrap().template.spec.unwrap();
        let mount = pod.containers[0]
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .find(|m| m.name == "kubelet-pods")
            .unwrap();
        assert_eq!(mount.mount_path, "/var/lib/kubelet/pods");
    }
}
