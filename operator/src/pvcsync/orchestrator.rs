use super::{PAIR_KEY_PATH, SSH_USER, SYNC_DEADLINE, exec, keys, pods};
use crate::access::ClusterConnection;
use crate::scheduler::{self, BackoffPolicy};
use crate::util::{self, Error, PvcSyncError};
use drsync_common::labels;
use drsync_types::NamespaceMapping;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::{
    Api, Client, ResourceExt,
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
};
use owo_colors::OwoColorize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

/// How to reach the agent plane of one cluster.
#[derive(Clone)]
pub struct AgentEndpoints {
    pub namespace: String,
    pub image: String,
    pub ssh_port: u16,
    /// Cap on concurrent rsync jobs per destination node.
    pub concurrency: u32,
}

pub struct PvcSyncContext<'a> {
    pub mapping: &'a NamespaceMapping,
    pub source: &'a ClusterConnection,
    pub dest: &'a ClusterConnection,
    pub source_agent: AgentEndpoints,
    pub dest_agent: AgentEndpoints,
    pub backoff: BackoffPolicy,
    pub cancel: &'a CancellationToken,
}

struct SourceMount {
    node: String,
    host_path: String,
}

struct RsyncServer {
    pod_name: String,
    pod_ip: String,
    node: Option<String>,
}

/// Replicates PVC bytes through the agent bastion. Shared across passes so
/// the per-destination-node concurrency caps hold globally.
pub struct Orchestrator {
    node_caps: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            node_caps: Mutex::new(HashMap::new()),
        }
    }

    async fn node_permit(&self, node: &str, cap: u32) -> tokio::sync::OwnedSemaphorePermit {
        let semaphore = {
            let mut caps = self.node_caps.lock().await;
            caps.entry(node.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(cap.max(1) as usize)))
                .clone()
        };
        semaphore
            .acquire_owned()
            .await
            .expect("node cap semaphore closed")
    }

    /// Replicates one PVC. Pod lifecycles are bounded by an absolute
    /// deadline so a stuck reconcile cannot leak resources.
    pub async fn sync_pvc(
        &self,
        ctx: &PvcSyncContext<'_>,
        pvc_name: &str,
    ) -> Result<(), PvcSyncError> {
        match tokio::time::timeout(SYNC_DEADLINE, self.sync_pvc_inner(ctx, pvc_name)).await {
            Ok(result) => result,
            Err(_) => {
                // Deadline passed: reclaim the pods before surfacing.
                self.cleanup(ctx, pvc_name).await.ok();
                Err(PvcSyncError::RsyncFatal(format!(
                    "replication of '{pvc_name}' exceeded the {} deadline",
                    util::format_duration(SYNC_DEADLINE),
                )))
            }
        }
    }

    async fn sync_pvc_inner(
        &self,
        ctx: &PvcSyncContext<'_>,
        pvc_name: &str,
    ) -> Result<(), PvcSyncError> {
        println!(
            "💾 {}",
            format!(
                "Replicating PVC '{}/{pvc_name}' → '{}'",
                ctx.mapping.spec.source_namespace, ctx.mapping.spec.destination_namespace,
            )
            .dimmed()
        );

        let mount = self.locate_source_mount(ctx, pvc_name).await?;
        let (node_hint, rwx) = self.ensure_destination(ctx, pvc_name).await?;

        // Fresh key per operation; it exists in the server pod's
        // authorized_keys and the source agent's tmpfs only.
        let op_key = keys::generate_ed25519(&format!("dr-syncer-op-{pvc_name}"))
            .map_err(|e| PvcSyncError::KeyPropagationFailed(e.to_string()))?;

        let server_node = if rwx { None } else { node_hint };
        let server = self
            .spawn_rsync_server(ctx, pvc_name, &op_key, server_node.as_deref())
            .await?;

        let cap_key = server.node.clone().unwrap_or_else(|| "<any>".to_string());
        let _permit = self.node_permit(&cap_key, ctx.dest_agent.concurrency).await;

        let mut result = Ok(());
        for attempt in 0..=ctx.backoff.max_retries {
            if ctx.cancel.is_cancelled() {
                result = Err(PvcSyncError::RsyncTransient("cancelled".to_string()));
                break;
            }
            result = self.run_rsync(ctx, pvc_name, &mount, &server, &op_key).await;
            match &result {
                Ok(()) => break,
                Err(e) if e.is_retryable() && attempt < ctx.backoff.max_retries => {
                    let delay = scheduler::backoff_delay_jittered(&ctx.backoff, attempt);
                    eprintln!(
                        "{}",
                        format!(
                            "rsync for '{pvc_name}' failed ({e}); retry {}/{} in {}",
                            attempt + 1,
                            ctx.backoff.max_retries,
                            util::format_duration(delay),
                        )
                        .yellow()
                    );
                    // The rsync-server pod stays warm between retries.
                    tokio::time::sleep(delay).await;
                }
                Err(_) => break,
            }
        }

        let cleanup = self.cleanup(ctx, pvc_name).await;
        match result {
            Ok(()) => {
                println!("✅ {}", format!("PVC '{pvc_name}' replicated").green());
                cleanup
            }
            Err(e) => Err(e),
        }
    }

    /// Step 1: find where the source PVC is materialized. A running pod
    /// wins; a Bound-but-unmounted claim gets a placeholder pod; a claim
    /// held by a non-running pod elsewhere is refused rather than
    /// dual-mounted.
    async fn locate_source_mount(
        &self,
        ctx: &PvcSyncContext<'_>,
        pvc_name: &str,
    ) -> Result<SourceMount, PvcSyncError> {
        let namespace = &ctx.mapping.spec.source_namespace;
        let pvcs: Api<PersistentVolumeClaim> =
            Api::namespaced(ctx.source.client.clone(), namespace);
        let pvc = pvcs
            .get(pvc_name)
            .await
            .map_err(|e| PvcSyncError::SourceMountNotFound(e.to_string()))?;
        let volume_name = pvc
            .spec
            .as_ref()
            .and_then(|s| s.volume_name.clone())
            .ok_or_else(|| {
                PvcSyncError::SourceMountNotFound(format!("PVC '{pvc_name}' is not bound"))
            })?;
        let bound = pvc
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .is_some_and(|p| p == "Bound");

        let pod_api: Api<Pod> = Api::namespaced(ctx.source.client.clone(), namespace);
        let pod_list = pod_api
            .list(&ListParams::default())
            .await
            .map_err(|e| PvcSyncError::SourceMountNotFound(e.to_string()))?;
        let mounting: Vec<&Pod> = pod_list
            .items
            .iter()
            .filter(|pod| pod_mounts_claim(pod, pvc_name))
            .collect();

        if let Some(pod) = mounting.iter().find(|p| pod_is_running(p)) {
            return Ok(SourceMount {
                node: pod
                    .spec
                    .as_ref()
                    .and_then(|s| s.node_name.clone())
                    .unwrap_or_default(),
                host_path: csi_mount_path(pod, &volume_name),
            });
        }
        if !mounting.is_empty() {
            return Err(PvcSyncError::SourceMountNotFound(format!(
                "PVC '{pvc_name}' is claimed by a pod that is not running; refusing dual-mount"
            )));
        }
        if !bound {
            return Err(PvcSyncError::SourceMountNotFound(format!(
                "PVC '{pvc_name}' has no mounting pod and is not Bound"
            )));
        }

        // Bound and idle: mount it ourselves, read-only.
        let placeholder_name = sync_pod_name("dr-placeholder", pvc_name);
        let pod = pods::placeholder_pod(
            &placeholder_name,
            namespace,
            pvc_name,
            &ctx.source_agent.image,
        );
        match pod_api.create(&PostParams::default(), &pod).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 409 => {}
            Err(e) => return Err(PvcSyncError::SourceMountNotFound(e.to_string())),
        }
        let binding_timeout = util::parse_spec_duration(&ctx.mapping.spec.pvc_config.binding_timeout)
            .unwrap_or(Duration::from_secs(300));
        let running = wait_for_running(&pod_api, &placeholder_name, ctx.cancel, binding_timeout)
            .await
            .map_err(|e| PvcSyncError::SourceMountNotFound(e.to_string()))?;
        let Some(pod) = running else {
            pod_api
                .delete(&placeholder_name, &DeleteParams::default())
                .await
                .ok();
            return Err(PvcSyncError::SourceMountNotFound(format!(
                "placeholder pod for '{pvc_name}' never became ready"
            )));
        };
        Ok(SourceMount {
            node: pod
                .spec
                .as_ref()
                .and_then(|s| s.node_name.clone())
                .unwrap_or_default(),
            host_path: csi_mount_path(&pod, &volume_name),
        })
    }

    /// Step 2: the destination PVC must exist and be Bound; its capacity
    /// is expanded to the source's when smaller, never contracted.
    async fn ensure_destination(
        &self,
        ctx: &PvcSyncContext<'_>,
        pvc_name: &str,
    ) -> Result<(Option<String>, bool), PvcSyncError> {
        let spec = &ctx.mapping.spec;
        let dest_api: Api<PersistentVolumeClaim> =
            Api::namespaced(ctx.dest.client.clone(), &spec.destination_namespace);
        let source_api: Api<PersistentVolumeClaim> =
            Api::namespaced(ctx.source.client.clone(), &spec.source_namespace);

        let dest = dest_api.get_opt(pvc_name).await.map_err(to_binding_err)?;
        let Some(dest) = dest else {
            return Err(PvcSyncError::DestinationBindingTimeout(format!(
                "destination PVC '{pvc_name}' does not exist yet"
            )));
        };
        let source = source_api.get(pvc_name).await.map_err(to_binding_err)?;

        let request = |pvc: &PersistentVolumeClaim| -> Option<String> {
            pvc.spec
                .as_ref()?
                .resources
                .as_ref()?
                .requests
                .as_ref()?
                .get("storage")
                .map(|q| q.0.clone())
        };
        let source_bytes = request(&source)
            .as_deref()
            .and_then(crate::sync::pvc::parse_quantity);
        let dest_bytes = request(&dest)
            .as_deref()
            .and_then(crate::sync::pvc::parse_quantity);
        if let (Some(src), Some(cur)) = (source_bytes, dest_bytes)
            && src > cur
        {
            let patch = serde_json::json!({
                "spec": {"resources": {"requests": {"storage": request(&source)}}}
            });
            dest_api
                .patch(
                    pvc_name,
                    &PatchParams::apply(util::MANAGER_NAME),
                    &Patch::Merge(&patch),
                )
                .await
                .map_err(to_binding_err)?;
        }

        if spec.pvc_config.wait_for_binding {
            let binding_timeout = util::parse_spec_duration(&spec.pvc_config.binding_timeout)
                .unwrap_or(Duration::from_secs(300));
            let bound = drsync_common::wait::poll_until(
                ctx.cancel,
                binding_timeout,
                Duration::from_secs(10),
                || async {
                    let pvc = dest_api.get(pvc_name).await?;
                    Ok(pvc
                        .status
                        .as_ref()
                        .and_then(|s| s.phase.as_deref())
                        .is_some_and(|p| p == "Bound"))
                },
            )
            .await
            .map_err(|e| PvcSyncError::DestinationBindingTimeout(e.to_string()))?;
            if !bound {
                return Err(PvcSyncError::DestinationBindingTimeout(pvc_name.to_string()));
            }
        }

        let fresh = dest_api.get(pvc_name).await.map_err(to_binding_err)?;
        let rwx = fresh
            .spec
            .as_ref()
            .and_then(|s| s.access_modes.as_ref())
            .is_some_and(|m| m.iter().any(|mode| mode == "ReadWriteMany"));
        let node_hint = fresh
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get("volume.kubernetes.io/selected-node"))
            .cloned();
        Ok((node_hint, rwx))
    }

    /// Step 3: the short-lived rsync server on the destination. Reused if
    /// it already exists (a previous attempt left it warm).
    async fn spawn_rsync_server(
        &self,
        ctx: &PvcSyncContext<'_>,
        pvc_name: &str,
        op_key: &keys::GeneratedKey,
        node: Option<&str>,
    ) -> Result<RsyncServer, PvcSyncError> {
        let namespace = &ctx.mapping.spec.destination_namespace;
        let pod_api: Api<Pod> = Api::namespaced(ctx.dest.client.clone(), namespace);
        let pod_name = sync_pod_name("dr-rsync", pvc_name);
        let authorized = keys::rsync_only_authorized_key(&op_key.public_openssh);
        let pod = pods::rsync_server_pod(
            &pod_name,
            namespace,
            pvc_name,
            &ctx.dest_agent.image,
            ctx.dest_agent.ssh_port,
            &authorized,
            node,
        );
        match pod_api.create(&PostParams::default(), &pod).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 409 => {}
            Err(e) => return Err(PvcSyncError::RsyncTransient(e.to_string())),
        }
        let running = wait_for_running(&pod_api, &pod_name, ctx.cancel, Duration::from_secs(300))
            .await
            .map_err(|e| PvcSyncError::RsyncTransient(e.to_string()))?;
        let Some(pod) = running else {
            return Err(PvcSyncError::RsyncTransient(format!(
                "rsync-server pod '{pod_name}' never became ready"
            )));
        };
        let pod_ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .ok_or_else(|| {
                PvcSyncError::RsyncTransient(format!("rsync-server pod '{pod_name}' has no IP"))
            })?;
        let server = RsyncServer {
            pod_name,
            pod_ip,
            node: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
        };
        println!(
            "🛰️ {}",
            format!(
                "rsync server '{}' ready at {} (node {})",
                server.pod_name,
                server.pod_ip,
                server.node.as_deref().unwrap_or("<any>"),
            )
            .dimmed()
        );
        Ok(server)
    }

    /// Step 4: push the per-operation key into the source agent's tmpfs
    /// and drive rsync from there, through the destination agent bastion,
    /// into the server pod.
    async fn run_rsync(
        &self,
        ctx: &PvcSyncContext<'_>,
        pvc_name: &str,
        mount: &SourceMount,
        server: &RsyncServer,
        op_key: &keys::GeneratedKey,
    ) -> Result<(), PvcSyncError> {
        let source_agent =
            agent_pod_on_node(&ctx.source.client, &ctx.source_agent.namespace, Some(&mount.node))
                .await
                .map_err(|e| PvcSyncError::KeyPropagationFailed(e.to_string()))?;
        let dest_agent =
            agent_pod_on_node(&ctx.dest.client, &ctx.dest_agent.namespace, server.node.as_deref())
                .await
                .map_err(|e| PvcSyncError::KeyPropagationFailed(e.to_string()))?;
        let dest_agent_addr = dest_agent
            .1
            .ok_or_else(|| PvcSyncError::KeyPropagationFailed("destination agent has no host address".into()))?;

        let key_path = format!("/dev/shm/{}.key", sync_pod_name("op", pvc_name));
        let push = exec::exec_pod(
            &ctx.source.client,
            &ctx.source_agent.namespace,
            &source_agent.0,
            &["sh", "-c", &format!("umask 077; cat > {key_path}")],
            Some(op_key.private_openssh.as_bytes()),
            Duration::from_secs(30),
        )
        .await
        .map_err(|e| PvcSyncError::KeyPropagationFailed(e.to_string()))?;
        if !push.success() {
            return Err(PvcSyncError::KeyPropagationFailed(push.stderr));
        }

        let port = ctx.dest_agent.ssh_port;
        let proxy = format!(
            "ssh -i {PAIR_KEY_PATH} -o StrictHostKeyChecking=no -p {port} -W {pod_ip}:{port} {SSH_USER}@{dest_agent_addr}",
            pod_ip = server.pod_ip,
        );
        let rsync_cmd = format!(
            "rsync -az --delete -e \"ssh -p {port} -i {key_path} -o StrictHostKeyChecking=no -o ProxyCommand='{proxy}'\" {src}/ {SSH_USER}@{pod_ip}:/data/",
            src = mount.host_path,
            pod_ip = server.pod_ip,
        );
        let output = exec::exec_pod(
            &ctx.source.client,
            &ctx.source_agent.namespace,
            &source_agent.0,
            &["sh", "-c", &rsync_cmd],
            None,
            SYNC_DEADLINE,
        )
        .await
        .map_err(|e| PvcSyncError::RsyncTransient(e.to_string()))?;

        classify_rsync_exit(output.exit_code, &output.stderr)
    }

    /// Step 5: reclaim everything the operation created. Pod names are
    /// deterministic, so a deadline-abandoned attempt is reclaimed too.
    /// Failures here surface as CleanupFailed but never rerun rsync.
    async fn cleanup(&self, ctx: &PvcSyncContext<'_>, pvc_name: &str) -> Result<(), PvcSyncError> {
        let mut failures = Vec::new();

        let dest_pods: Api<Pod> = Api::namespaced(
            ctx.dest.client.clone(),
            &ctx.mapping.spec.destination_namespace,
        );
        let server_name = sync_pod_name("dr-rsync", pvc_name);
        match dest_pods.delete(&server_name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => failures.push(format!("delete '{server_name}': {e}")),
        }

        let source_pods: Api<Pod> =
            Api::namespaced(ctx.source.client.clone(), &ctx.mapping.spec.source_namespace);
        let placeholder_name = sync_pod_name("dr-placeholder", pvc_name);
        match source_pods
            .delete(&placeholder_name, &DeleteParams::default())
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => failures.push(format!("delete '{placeholder_name}': {e}")),
        }

        // The per-operation key dies with the agent tmpfs file and the
        // server pod's authorized_keys; remove the tmpfs copy eagerly.
        let key_path = format!("/dev/shm/{}.key", sync_pod_name("op", pvc_name));
        if let Ok(agents) = agent_pods(&ctx.source.client, &ctx.source_agent.namespace).await {
            for agent in agents {
                exec::exec_pod(
                    &ctx.source.client,
                    &ctx.source_agent.namespace,
                    &agent,
                    &["sh", "-c", &format!("rm -f {key_path}")],
                    None,
                    Duration::from_secs(10),
                )
                .await
                .ok();
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PvcSyncError::CleanupFailed(failures.join("; ")))
        }
    }
}

fn to_binding_err(err: kube::Error) -> PvcSyncError {
    PvcSyncError::DestinationBindingTimeout(err.to_string())
}

fn pod_mounts_claim(pod: &Pod, claim: &str) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .is_some_and(|volumes| {
            volumes.iter().any(|v| {
                v.persistent_volume_claim
                    .as_ref()
                    .is_some_and(|c| c.claim_name == claim)
            })
        })
}

fn pod_is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|p| p == "Running")
        && pod.metadata.deletion_timestamp.is_none()
}

/// The kubelet CSI publish path for a volume inside a pod sandbox.
fn csi_mount_path(pod: &Pod, volume_name: &str) -> String {
    let uid = pod.metadata.uid.as_deref().unwrap_or_default();
    format!("/var/lib/kubelet/pods/{uid}/volumes/kubernetes.io~csi/{volume_name}/mount")
}

/// DNS-1123 safe pod name under the 63-character limit.
fn sync_pod_name(prefix: &str, pvc_name: &str) -> String {
    let name = format!("{prefix}-{pvc_name}");
    if name.len() <= 63 {
        name
    } else {
        let digest = &util::hash_spec(&pvc_name)[..8];
        format!("{}-{digest}", &name[..54])
    }
}

async fn wait_for_running(
    api: &Api<Pod>,
    name: &str,
    cancel: &CancellationToken,
    deadline: Duration,
) -> Result<Option<Pod>, Error> {
    let ready = drsync_common::wait::poll_until(cancel, deadline, Duration::from_secs(10), || async {
        Ok(api
            .get_opt(name)
            .await?
            .as_ref()
            .is_some_and(pod_is_running))
    })
    .await
    .map_err(|_| Error::Cancelled)?;
    if !ready {
        return Ok(None);
    }
    Ok(api.get_opt(name).await?)
}

async fn agent_pods(client: &Client, namespace: &str) -> Result<Vec<String>, Error> {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let lp = ListParams::default().labels(&format!("{}=true", labels::AGENT));
    Ok(api
        .list(&lp)
        .await?
        .items
        .iter()
        .filter(|p| pod_is_running(p))
        .map(|p| p.name_any())
        .collect())
}

/// Picks the agent pod on the given node, falling back to any running
/// agent. Returns (pod name, host address).
async fn agent_pod_on_node(
    client: &Client,
    namespace: &str,
    node: Option<&str>,
) -> Result<(String, Option<String>), Error> {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let lp = ListParams::default().labels(&format!("{}=true", labels::AGENT));
    let agents = api.list(&lp).await?;
    let running: Vec<&Pod> = agents.items.iter().filter(|p| pod_is_running(p)).collect();
    let chosen = running
        .iter()
        .find(|p| {
            node.is_some() && p.spec.as_ref().and_then(|s| s.node_name.as_deref()) == node
        })
        .or_else(|| running.first())
        .ok_or_else(|| Error::UserInput(format!("no running agent pod in '{namespace}'")))?;
    let host_ip = chosen.status.as_ref().and_then(|s| s.host_ip.clone());
    Ok((chosen.name_any(), host_ip))
}

/// Maps rsync/ssh exit codes onto the retry taxonomy. Socket, timeout and
/// partial-transfer classes retry; protocol and usage errors do not.
fn classify_rsync_exit(code: i32, stderr: &str) -> Result<(), PvcSyncError> {
    const TRANSIENT: &[i32] = &[10, 11, 12, 23, 24, 30, 35, 255];
    match code {
        0 => Ok(()),
        c if TRANSIENT.contains(&c) => Err(PvcSyncError::RsyncTransient(format!(
            "rsync exit {c}: {}",
            stderr.trim()
        ))),
        c => Err(PvcSyncError::RsyncFatal(format!(
            "rsync exit {c}: {}",
            stderr.trim()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_split_into_retry_classes() {
        assert!(classify_rsync_exit(0, "").is_ok());
        assert!(matches!(
            classify_rsync_exit(30, "timeout in data send"),
            Err(PvcSyncError::RsyncTransient(_))
        ));
        assert!(matches!(
            classify_rsync_exit(255, "connection reset"),
            Err(PvcSyncError::RsyncTransient(_))
        ));
        // Auth/usage errors must not retry.
        assert!(matches!(
            classify_rsync_exit(2, "protocol incompatibility"),
            Err(PvcSyncError::RsyncFatal(_))
        ));
    }

    #[test]
    fn csi_path_matches_kubelet_layout() {
        let pod = Pod {
            metadata: kube::api::ObjectMeta {
                uid: Some("abc-123".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(
            csi_mount_path(&pod, "pv-9"),
            "/var/lib/kubelet/pods/abc-123/volumes/kubernetes.io~csi/pv-9/mount"
        );
    }

    #[test]
    fn pod_names_respect_dns_limit() {
        assert_eq!(sync_pod_name("dr-rsync", "db"), "dr-rsync-db");
        let long = "a".repeat(80);
        let name = sync_pod_name("dr-rsync", &long);
        assert!(name.len() <= 63);
    }

    #[test]
    fn claim_matching_reads_pod_volumes() {
        let pod: Pod = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "web-0"},
            "spec": {
                "volumes": [
                    {"name": "data", "persistentVolumeClaim": {"claimName": "db-data"}}
                ]
            },
            "status": {"phase": "Running"}
        }))
        .unwrap();
        assert!(pod_mounts_claim(&pod, "db-data"));
        assert!(!pod_mounts_claim(&pod, "other"));
        assert!(pod_is_running(&pod));
    }
}
