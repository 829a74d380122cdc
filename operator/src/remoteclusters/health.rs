use super::agent;
use crate::util::{self, Error};
use drsync_common::labels;
use drsync_types::{AgentNodeStatus, ClusterHealth, HealthConfig};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, jiff::Timestamp};
use kube::{Api, Client, ResourceExt, api::ListParams};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

/// Connects to an agent's sshd and reads the protocol banner. A TCP
/// accept alone is not enough; the banner proves sshd answered.
pub async fn ssh_reachable(address: &str, port: u16, timeout: Duration) -> Result<(), String> {
    let attempt = async {
        let mut stream = TcpStream::connect((address, port))
            .await
            .map_err(|e| format!("connect: {e}"))?;
        let mut banner = [0u8; 7];
        stream
            .read_exact(&mut banner)
            .await
            .map_err(|e| format!("banner read: {e}"))?;
        if banner.starts_with(b"SSH-") {
            Ok(())
        } else {
            Err(format!(
                "unexpected banner {:?}",
                String::from_utf8_lossy(&banner)
            ))
        }
    };
    match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(format!("no SSH banner within {}", util::format_duration(timeout))),
    }
}

/// Probes every agent pod of a remote cluster over SSH, retrying per the
/// HealthConfig, and reports one status entry per node.
pub async fn probe_agents(
    client: &Client,
    health: &HealthConfig,
    ssh_port: u16,
) -> Result<Vec<AgentNodeStatus>, Error> {
    let ssh_timeout = util::parse_spec_duration(&health.ssh_timeout)?;
    let retry_interval = util::parse_spec_duration(&health.retry_interval)?;

    let api: Api<Pod> = Api::namespaced(client.clone(), agent::AGENT_NAMESPACE);
    let lp = ListParams::default().labels(&format!("{}=true", labels::AGENT));
    let pods = api.list(&lp).await?;

    let mut statuses = Vec::new();
    for pod in pods.items {
        let node = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .unwrap_or_else(|| pod.name_any());
        let pod_phase = pod.status.as_ref().and_then(|s| s.phase.clone());
        let address = pod.status.as_ref().and_then(|s| s.host_ip.clone());

        let mut ssh_connected = false;
        let mut message = None;
        match &address {
            Some(address) => {
                for attempt in 0..health.retry_attempts.max(1) {
                    match ssh_reachable(address, ssh_port, ssh_timeout).await {
                        Ok(()) => {
                            ssh_connected = true;
                            message = None;
                            break;
                        }
                        Err(e) => {
                            message = Some(e);
                            if attempt + 1 < health.retry_attempts.max(1) {
                                tokio::time::sleep(retry_interval).await;
                            }
                        }
                    }
                }
            }
            None => message = Some("agent pod has no host address yet".to_string()),
        }

        statuses.push(AgentNodeStatus {
            node,
            ready: pod_phase.as_deref() == Some("Running") && ssh_connected,
            last_heartbeat: ssh_connected.then(|| Time::from(Timestamp::now())),
            ssh_connected,
            pod_phase,
            message,
        });
    }
    Ok(statuses)
}

/// Rolls per-node results up into the cluster health verdict.
pub fn overall_health(nodes: &[AgentNodeStatus]) -> ClusterHealth {
    if nodes.is_empty() {
        return ClusterHealth::Unreachable;
    }
    let connected = nodes.iter().filter(|n| n.ssh_connected).count();
    if connected == nodes.len() {
        ClusterHealth::Healthy
    } else if connected > 0 {
        ClusterHealth::Degraded
    } else {
        ClusterHealth::Unreachable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(ssh: bool) -> AgentNodeStatus {
        AgentNodeStatus {
            node: "n".into(),
            ready: ssh,
            ssh_connected: ssh,
            ..Default::default()
        }
    }

    #[test]
    fn health_rollup_covers_all_three_states() {
        assert_eq!(overall_health(&[]), ClusterHealth::Unreachable);
        assert_eq!(overall_health(&[node(true), node(true)]), ClusterHealth::Healthy);
        assert_eq!(overall_health(&[node(true), node(false)]), ClusterHealth::Degraded);
        assert_eq!(overall_health(&[node(false)]), ClusterHealth::Unreachable);
    }

    #[tokio::test]
    async fn ssh_probe_reads_the_banner() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            tokio::io::AsyncWriteExt::write_all(&mut socket, b"SSH-2.0-dr-syncer\r\n")
                .await
                .unwrap();
        });
        assert!(
            ssh_reachable("127.0.0.1", port, Duration::from_secs(2))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn ssh_probe_rejects_non_ssh_services() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            tokio::io::AsyncWriteExt::write_all(&mut socket, b"HTTP/1.1 200 OK\r\n")
                .await
                .unwrap();
        });
        assert!(
            ssh_reachable("127.0.0.1", port, Duration::from_secs(2))
                .await
                .is_err()
        );
    }
}
