use super::trust;
use crate::access::ClusterAccess;
use crate::util::{self, Error, events, patch::patch_status_with_retry};
use drsync_types::*;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, jiff::Timestamp};
use kube::Client;
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::time::Duration;

fn current_conditions(instance: &ClusterMapping) -> &[Condition] {
    instance
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or(&[])
}

pub async fn paused(client: Client, instance: &ClusterMapping) -> Result<(), Error> {
    let condition = util::condition(
        "Ready",
        true,
        "Paused",
        "Reconciliation suspended by spec.paused",
    );
    let transitioned = util::condition_transitions(current_conditions(instance), &condition);
    patch_status_with_retry(client.clone(), instance, move |status: &mut ClusterMappingStatus| {
        status.message = Some("Mapping is paused".to_string());
        util::set_condition(&mut status.conditions, condition.clone());
    })
    .await?;
    if transitioned {
        events::emit(
            &client,
            instance,
            "Normal",
            "Paused",
            "Connectivity reconciliation suspended",
        )
        .await;
    }
    Ok(())
}

pub async fn invalid(client: Client, instance: &ClusterMapping, message: String) -> Result<(), Error> {
    let condition = util::condition("Ready", false, "InvalidSpec", &message);
    let transitioned = util::condition_transitions(current_conditions(instance), &condition);
    patch_status_with_retry(client.clone(), instance, move |status: &mut ClusterMappingStatus| {
        status.phase = ClusterMappingPhase::Failed;
        status.message = Some(message.clone());
        util::set_condition(&mut status.conditions, condition.clone());
    })
    .await?;
    if transitioned {
        events::emit(
            &client,
            instance,
            "Warning",
            "InvalidSpec",
            "ClusterMapping spec cannot be acted on",
        )
        .await;
    }
    Ok(())
}

/// Provisions the pair key, installs trust on both agent planes and,
/// unless disabled, verifies SSH reachability agent-to-agent.
pub async fn connect(access: Arc<ClusterAccess>, instance: &ClusterMapping) -> Result<(), Error> {
    let hub = access.hub();
    patch_status_with_retry(hub.clone(), instance, |status: &mut ClusterMappingStatus| {
        status.phase = ClusterMappingPhase::Connecting;
        status.last_attempt_time = Some(Time::from(Timestamp::now()));
        status.message = None;
    })
    .await?;

    let result = connect_inner(&access, instance).await;
    match result {
        Ok(connection_status) => {
            let reachable = connection_status.iter().any(|c| c.connected);
            let verified = instance.spec.verify_connectivity;
            // Without verification, provisioning the trust is the whole job.
            let connected = reachable || !verified;
            let pairs_connected = connection_status.iter().filter(|c| c.connected).count();
            let detail = format!(
                "{pairs_connected}/{} node pairs connected",
                connection_status.len(),
            );
            let verify_condition = util::condition(
                "ConnectionVerified",
                connected,
                if verified { "Verified" } else { "VerificationDisabled" },
                &detail,
            );
            let transitioned =
                util::condition_transitions(current_conditions(instance), &verify_condition);
            patch_status_with_retry(hub.clone(), instance, move |status: &mut ClusterMappingStatus| {
                status.phase = if connected {
                    ClusterMappingPhase::Connected
                } else {
                    ClusterMappingPhase::Failed
                };
                status.connection_status = connection_status.clone();
                if connected {
                    status.consecutive_failures = 0;
                    status.last_verified = Some(Time::from(Timestamp::now()));
                    status.message = None;
                } else {
                    status.consecutive_failures = status.consecutive_failures.saturating_add(1);
                    status.message =
                        Some("no source agent can reach any target agent".to_string());
                }
                util::set_condition(&mut status.conditions, verify_condition.clone());
                util::set_condition(
                    &mut status.conditions,
                    util::condition("Ready", connected, "Provisioned", "SSH trust installed"),
                );
            })
            .await?;
            if transitioned {
                events::emit(
                    &hub,
                    instance,
                    if connected { "Normal" } else { "Warning" },
                    if connected { "Connected" } else { "ConnectionFailed" },
                    &detail,
                )
                .await;
            }
            if connected {
                println!(
                    "🔐 {}",
                    format!(
                        "ClusterMapping '{}' connected ({} → {})",
                        instance
                            .metadata
                            .name
                            .as_deref()
                            .unwrap_or_default(),
                        instance.spec.source_cluster,
                        instance.spec.target_cluster,
                    )
                    .green()
                );
            }
            Ok(())
        }
        Err(e) => {
            let message = e.to_string();
            let condition = util::condition("Ready", false, "ProvisioningFailed", &message);
            let transitioned =
                util::condition_transitions(current_conditions(instance), &condition);
            patch_status_with_retry(hub.clone(), instance, move |status: &mut ClusterMappingStatus| {
                status.phase = ClusterMappingPhase::Failed;
                status.consecutive_failures = status.consecutive_failures.saturating_add(1);
                status.message = Some(message.clone());
                util::set_condition(&mut status.conditions, condition.clone());
            })
            .await?;
            if transitioned {
                events::emit(
                    &hub,
                    instance,
                    "Warning",
                    "ProvisioningFailed",
                    "SSH trust provisioning or verification failed",
                )
                .await;
            }
            Err(e)
        }
    }
}

async fn connect_inner(
    access: &Arc<ClusterAccess>,
    instance: &ClusterMapping,
) -> Result<Vec<NodeConnectionStatus>, Error> {
    let (source_cluster, source) = access
        .connect_by_name(&instance.spec.source_cluster)
        .await?;
    let (_, target) = access.connect_by_name(&instance.spec.target_cluster).await?;

    let key = trust::ensure_pair_key(&access.hub(), instance).await?;
    trust::push_trust(&source, &key).await?;
    trust::push_trust(&target, &key).await?;

    if !instance.spec.verify_connectivity {
        return Ok(Vec::new());
    }
    let timeout = Duration::from_secs(instance.spec.connectivity_timeout_seconds.max(1));
    trust::verify_connectivity(
        &source,
        &target,
        source_cluster.spec.agent.ssh_port,
        timeout,
    )
    .await
}
