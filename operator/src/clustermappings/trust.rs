use crate::access::ClusterConnection;
use crate::pvcsync::{PAIR_KEY_PATH, SSH_USER, exec, keys};
use crate::remoteclusters::agent;
use crate::util::{self, Error};
use drsync_common::labels;
use drsync_types::{ClusterMapping, NodeConnectionStatus};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::{
    Api, Client, ResourceExt,
    api::{ListParams, ObjectMeta, Patch, PatchParams},
};
use std::collections::BTreeMap;
use std::time::Duration;

const DEFAULT_PUBLIC_KEY: &str = "id_ed25519.pub";
const DEFAULT_PRIVATE_KEY: &str = "id_ed25519";

/// The resolved cluster-pair keypair.
pub struct PairKey {
    pub public_openssh: String,
    pub private_openssh: String,
}

/// Loads the pair key from the referenced secret, generating and storing
/// a fresh one when it does not exist yet.
pub async fn ensure_pair_key(hub: &Client, mapping: &ClusterMapping) -> Result<PairKey, Error> {
    let namespace = mapping
        .spec
        .ssh_key_secret_ref
        .as_ref()
        .and_then(|r| r.namespace.clone())
        .or_else(|| mapping.namespace())
        .ok_or_else(|| Error::UserInput("ClusterMapping is missing a namespace".to_string()))?;
    let secret_name = mapping
        .spec
        .ssh_key_secret_ref
        .as_ref()
        .map(|r| r.name.clone())
        .unwrap_or_else(|| format!("dr-syncer-pair-{}", mapping.name_any()));
    let public_key_name = mapping
        .spec
        .ssh_key_secret_ref
        .as_ref()
        .and_then(|r| r.public_key.clone())
        .unwrap_or_else(|| DEFAULT_PUBLIC_KEY.to_string());
    let private_key_name = mapping
        .spec
        .ssh_key_secret_ref
        .as_ref()
        .and_then(|r| r.private_key.clone())
        .unwrap_or_else(|| DEFAULT_PRIVATE_KEY.to_string());

    let api: Api<Secret> = Api::namespaced(hub.clone(), &namespace);
    if let Some(secret) = api.get_opt(&secret_name).await? {
        let data = secret.data.unwrap_or_default();
        let read = |key: &str| -> Result<String, Error> {
            data.get(key)
                .and_then(|b| String::from_utf8(b.0.clone()).ok())
                .ok_or_else(|| {
                    Error::UserInput(format!(
                        "pair key secret '{namespace}/{secret_name}' is missing '{key}'"
                    ))
                })
        };
        return Ok(PairKey {
            public_openssh: read(&public_key_name)?,
            private_openssh: read(&private_key_name)?,
        });
    }

    let generated = keys::generate_ed25519(&format!("dr-syncer-pair-{}", mapping.name_any()))?;
    let mut data = BTreeMap::new();
    data.insert(
        public_key_name,
        ByteString(generated.public_openssh.clone().into_bytes()),
    );
    data.insert(
        private_key_name,
        ByteString(generated.private_openssh.clone().into_bytes()),
    );
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(secret_name),
            namespace: Some(namespace),
            labels: Some({
                let mut m = BTreeMap::new();
                m.insert(
                    labels::MANAGED_BY.to_string(),
                    util::MANAGER_NAME.to_string(),
                );
                m
            }),
            ..Default::default()
        },
        data: Some(data),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    };
    match api.create(&Default::default(), &secret).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 409 => {}
        Err(e) => return Err(e.into()),
    }
    Ok(PairKey {
        public_openssh: generated.public_openssh,
        private_openssh: generated.private_openssh,
    })
}

/// Installs the pair trust on one cluster's agent plane: the private key
/// for outbound hops and a command-restricted authorized_keys entry for
/// inbound ones. Applied to both ends of the mapping, this gives each
/// side's agents bidirectional reach.
pub async fn push_trust(conn: &ClusterConnection, key: &PairKey) -> Result<(), Error> {
    let authorized_line = keys::restricted_authorized_key(&key.public_openssh);

    let private = Secret {
        metadata: ObjectMeta {
            name: Some(agent::PAIR_KEY_SECRET.to_string()),
            namespace: Some(agent::AGENT_NAMESPACE.to_string()),
            labels: Some(agent::agent_selector_labels()),
            ..Default::default()
        },
        data: Some({
            let mut data = BTreeMap::new();
            data.insert(
                "id_ed25519".to_string(),
                ByteString(key.private_openssh.clone().into_bytes()),
            );
            data
        }),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    };
    let secrets: Api<Secret> = Api::namespaced(conn.client.clone(), agent::AGENT_NAMESPACE);
    secrets
        .patch(
            agent::PAIR_KEY_SECRET,
            &PatchParams::apply(util::MANAGER_NAME).force(),
            &Patch::Apply(&util::apply_body(&private, "v1", "Secret")?),
        )
        .await?;

    // Merge our line into the authorized_keys payload, keeping entries
    // other mappings may have added.
    let existing = secrets.get_opt(agent::AUTHORIZED_KEYS_SECRET).await?;
    let mut lines: Vec<String> = existing
        .as_ref()
        .and_then(|s| s.data.as_ref())
        .and_then(|d| d.get("authorized_keys"))
        .and_then(|b| String::from_utf8(b.0.clone()).ok())
        .map(|content| content.lines().map(str::to_string).collect())
        .unwrap_or_default();
    if !lines.contains(&authorized_line) {
        lines.push(authorized_line);
    }
    let authorized = Secret {
        metadata: ObjectMeta {
            name: Some(agent::AUTHORIZED_KEYS_SECRET.to_string()),
            namespace: Some(agent::AGENT_NAMESPACE.to_string()),
            labels: Some(agent::agent_selector_labels()),
            ..Default::default()
        },
        data: Some({
            let mut data = BTreeMap::new();
            data.insert(
                "authorized_keys".to_string(),
                ByteString(format!("{}\n", lines.join("\n")).into_bytes()),
            );
            data
        }),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    };
    secrets
        .patch(
            agent::AUTHORIZED_KEYS_SECRET,
            &PatchParams::apply(util::MANAGER_NAME).force(),
            &Patch::Apply(&util::apply_body(&authorized, "v1", "Secret")?),
        )
        .await?;
    Ok(())
}

struct AgentNode {
    pod_name: String,
    node: String,
    host_ip: Option<String>,
}

async fn list_agents(conn: &ClusterConnection) -> Result<Vec<AgentNode>, Error> {
    let api: Api<Pod> = Api::namespaced(conn.client.clone(), agent::AGENT_NAMESPACE);
    let lp = ListParams::default().labels(&format!("{}=true", labels::AGENT));
    Ok(api
        .list(&lp)
        .await?
        .items
        .into_iter()
        .filter(|p| {
            p.status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .is_some_and(|phase| phase == "Running")
        })
        .map(|p| AgentNode {
            node: p
                .spec
                .as_ref()
                .and_then(|s| s.node_name.clone())
                .unwrap_or_else(|| p.name_any()),
            host_ip: p.status.as_ref().and_then(|s| s.host_ip.clone()),
            pod_name: p.name_any(),
        })
        .collect())
}

/// Issues `test-connection` over SSH from every ready source agent to
/// every ready target agent, bounded overall by the mapping timeout.
pub async fn verify_connectivity(
    source: &ClusterConnection,
    target: &ClusterConnection,
    ssh_port: u16,
    timeout: Duration,
) -> Result<Vec<NodeConnectionStatus>, Error> {
    let source_agents = list_agents(source).await?;
    let target_agents = list_agents(target).await?;
    if source_agents.is_empty() || target_agents.is_empty() {
        return Ok(Vec::new());
    }

    let matrix = async {
        let mut results = Vec::new();
        for src in &source_agents {
            for dst in &target_agents {
                let detail = match &dst.host_ip {
                    Some(address) => {
                        let command = format!(
                            "ssh -i {PAIR_KEY_PATH} -p {ssh_port} -o BatchMode=yes -o StrictHostKeyChecking=no {SSH_USER}@{address} test-connection",
                        );
                        match exec::exec_pod(
                            &source.client,
                            agent::AGENT_NAMESPACE,
                            &src.pod_name,
                            &["sh", "-c", &command],
                            None,
                            timeout,
                        )
                        .await
                        {
                            Ok(output) if output.success() => NodeConnectionStatus {
                                source_node: src.node.clone(),
                                target_node: dst.node.clone(),
                                connected: true,
                                error: None,
                            },
                            Ok(output) => NodeConnectionStatus {
                                source_node: src.node.clone(),
                                target_node: dst.node.clone(),
                                connected: false,
                                error: Some(format!(
                                    "exit {}: {}",
                                    output.exit_code,
                                    output.stderr.trim()
                                )),
                            },
                            Err(e) => NodeConnectionStatus {
                                source_node: src.node.clone(),
                                target_node: dst.node.clone(),
                                connected: false,
                                error: Some(e.to_string()),
                            },
                        }
                    }
                    None => NodeConnectionStatus {
                        source_node: src.node.clone(),
                        target_node: dst.node.clone(),
                        connected: false,
                        error: Some("target agent has no host address".to_string()),
                    },
                };
                results.push(detail);
            }
        }
        results
    };
    match tokio::time::timeout(timeout, matrix).await {
        Ok(results) => Ok(results),
        Err(_) => Ok(vec![NodeConnectionStatus {
            source_node: "*".to_string(),
            target_node: "*".to_string(),
            connected: false,
            error: Some(format!(
                "connectivity verification exceeded {}",
                util::format_duration(timeout)
            )),
        }]),
    }
}
