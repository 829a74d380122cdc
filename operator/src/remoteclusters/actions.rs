use super::{agent, health};
use crate::access::ClusterAccess;
use crate::util::{self, Error, events, patch::patch_status_with_retry};
use drsync_types::*;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, jiff::Timestamp};
use kube::{
    Api, Client,
    api::{ObjectMeta, Patch, PatchParams, PostParams},
};
use owo_colors::OwoColorize;
use std::sync::Arc;

fn current_conditions(instance: &RemoteCluster) -> &[Condition] {
    instance
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or(&[])
}

/// Makes sure the agent namespace exists on the remote cluster.
async fn ensure_agent_namespace(client: &Client) -> Result<(), Error> {
    let api: Api<Namespace> = Api::all(client.clone());
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(agent::AGENT_NAMESPACE.to_string()),
            labels: Some(agent::agent_selector_labels()),
            ..Default::default()
        },
        ..Default::default()
    };
    match api.create(&PostParams::default(), &ns).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Generates and uploads the sshd host keys. The new secret is fully
/// applied before any old one could be removed, so rotation is atomic
/// from the agents' point of view.
pub async fn provision_host_keys(
    access: Arc<ClusterAccess>,
    instance: &RemoteCluster,
) -> Result<(), Error> {
    let conn = access.connect(instance).await?;
    ensure_agent_namespace(&conn.client).await?;
    let secret = agent::build_host_keys_secret(&conn.name)?;
    let api: Api<Secret> = Api::namespaced(conn.client, agent::AGENT_NAMESPACE);
    match api.create(&PostParams::default(), &secret).await {
        Ok(_) => println!(
            "🔑 {}",
            format!("Provisioned agent host keys on '{}'", conn.name).green()
        ),
        Err(kube::Error::Api(ae)) if ae.code == 409 => {}
        Err(e) => return Err(e.into()),
    }
    let condition = util::condition(
        "AgentReady",
        false,
        "ProvisioningHostKeys",
        "Generating and uploading agent host keys",
    );
    let transitioned = util::condition_transitions(current_conditions(instance), &condition);
    patch_status_with_retry(access.hub(), instance, move |status: &mut RemoteClusterStatus| {
        status.agent_phase = AgentPhase::Deploying;
        status.message = Some("Provisioning agent host keys".to_string());
        util::set_condition(&mut status.conditions, condition.clone());
    })
    .await?;
    if transitioned {
        events::emit(
            &access.hub(),
            instance,
            "Normal",
            "ProvisioningHostKeys",
            "Agent sshd host keys provisioned",
        )
        .await;
    }
    Ok(())
}

/// Applies the agent DaemonSet; the spec-hash annotation makes this a
/// no-op when nothing changed and a rolling restart when keys rotated.
pub async fn deploy_agent(
    access: Arc<ClusterAccess>,
    instance: &RemoteCluster,
    reason: String,
) -> Result<(), Error> {
    let conn = access.connect(instance).await?;
    let secrets: Api<Secret> = Api::namespaced(conn.client.clone(), agent::AGENT_NAMESPACE);
    let host_keys = secrets.get(agent::HOST_KEYS_SECRET).await?;
    let host_keys_version = host_keys.metadata.resource_version.unwrap_or_default();

    let ds = agent::build_daemonset(instance, &host_keys_version);
    let api: Api<DaemonSet> = Api::namespaced(conn.client, agent::AGENT_NAMESPACE);
    println!(
        "🚚 {}",
        format!("Deploying agent DaemonSet to '{}' • reason: {reason}", conn.name).green()
    );
    api.patch(
        agent::DAEMONSET_NAME,
        &PatchParams::apply(util::MANAGER_NAME).force(),
        &Patch::Apply(&util::apply_body(&ds, "apps/v1", "DaemonSet")?),
    )
    .await?;

    let condition = util::condition("AgentReady", false, "Deploying", "Agent rollout in progress");
    let transitioned = util::condition_transitions(current_conditions(instance), &condition);
    patch_status_with_retry(access.hub(), instance, move |status: &mut RemoteClusterStatus| {
        status.agent_phase = AgentPhase::Deploying;
        status.last_deployment_time = Some(Time::from(Timestamp::now()));
        status.message = Some(reason.clone());
        util::set_condition(&mut status.conditions, condition.clone());
    })
    .await?;
    if transitioned {
        events::emit(
            &access.hub(),
            instance,
            "Normal",
            "AgentDeploying",
            "Agent DaemonSet rollout started",
        )
        .await;
    }
    Ok(())
}

/// Probes every agent node over SSH and records the results atomically in
/// one status patch.
pub async fn probe(access: Arc<ClusterAccess>, instance: &RemoteCluster) -> Result<(), Error> {
    let conn = access.connect(instance).await?;
    let nodes = health::probe_agents(
        &conn.client,
        &instance.spec.health,
        instance.spec.agent.ssh_port,
    )
    .await?;
    let verdict = health::overall_health(&nodes);
    let agent_phase = match verdict {
        ClusterHealth::Healthy => AgentPhase::Running,
        ClusterHealth::Degraded => AgentPhase::Degraded,
        ClusterHealth::Unreachable => AgentPhase::Failed,
    };
    let reachable = nodes.iter().filter(|n| n.ssh_connected).count();
    let detail = format!("{reachable}/{} agent nodes reachable over SSH", nodes.len());
    let agent_condition = util::condition(
        "AgentReady",
        verdict == ClusterHealth::Healthy,
        &verdict.to_string(),
        &detail,
    );
    let transitioned = util::condition_transitions(current_conditions(instance), &agent_condition);

    patch_status_with_retry(access.hub(), instance, move |status: &mut RemoteClusterStatus| {
        status.health = Some(verdict);
        status.agent_phase = agent_phase;
        status.agent_nodes = nodes.clone();
        status.last_sync_time = Some(Time::from(Timestamp::now()));
        status.message = None;
        if verdict != ClusterHealth::Healthy {
            status.failed_syncs = status.failed_syncs.saturating_add(1);
        } else {
            status.failed_syncs = 0;
        }
        util::set_condition(&mut status.conditions, agent_condition.clone());
        util::set_condition(
            &mut status.conditions,
            util::condition("Ready", true, "Connected", "Cluster credentials are valid"),
        );
    })
    .await?;
    if transitioned {
        events::emit(
            &access.hub(),
            instance,
            if verdict == ClusterHealth::Healthy {
                "Normal"
            } else {
                "Warning"
            },
            &format!("Agent{verdict}"),
            &detail,
        )
        .await;
    }
    Ok(())
}

/// Agent plane disabled: the cluster is only used as a sync endpoint.
pub async fn disabled(access: Arc<ClusterAccess>, instance: &RemoteCluster) -> Result<(), Error> {
    // Reaching the API server at all proves the credentials work.
    let connected = access.connect(instance).await.is_ok();
    let condition = util::condition(
        "Ready",
        connected,
        "AgentDisabled",
        "Agent plane is disabled",
    );
    let transitioned = util::condition_transitions(current_conditions(instance), &condition);
    patch_status_with_retry(access.hub(), instance, move |status: &mut RemoteClusterStatus| {
        status.health = Some(if connected {
            ClusterHealth::Healthy
        } else {
            ClusterHealth::Unreachable
        });
        status.agent_phase = AgentPhase::Pending;
        status.agent_nodes.clear();
        status.message = Some("Agent disabled".to_string());
        util::set_condition(&mut status.conditions, condition.clone());
    })
    .await?;
    if transitioned {
        events::emit(
            &access.hub(),
            instance,
            if connected { "Normal" } else { "Warning" },
            "AgentDisabled",
            if connected {
                "Cluster reachable; agent plane disabled by spec"
            } else {
                "Cluster unreachable; agent plane disabled by spec"
            },
        )
        .await;
    }
    Ok(())
}

pub async fn error(client: Client, instance: &RemoteCluster, message: String) -> Result<(), Error> {
    let condition = util::condition("Ready", false, "Error", &message);
    let transitioned = util::condition_transitions(current_conditions(instance), &condition);
    patch_status_with_retry(client.clone(), instance, move |status: &mut RemoteClusterStatus| {
        status.health = Some(ClusterHealth::Unreachable);
        status.message = Some(message.clone());
        util::set_condition(&mut status.conditions, condition.clone());
    })
    .await?;
    if transitioned {
        events::emit(
            &client,
            instance,
            "Warning",
            "ClusterUnreachable",
            "Cluster credentials or connectivity failed",
        )
        .await;
    }
    Ok(())
}
