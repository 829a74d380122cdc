use drsync_types::*;
use futures::stream::StreamExt;
use k8s_openapi::jiff::Timestamp;
use kube::{
    Api, ResourceExt,
    api::ListParams,
    client::Client,
    runtime::{Controller, controller::Action},
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use std::{collections::HashMap, sync::Arc, time::Instant};
use tokio::{sync::Mutex, time::Duration};
use tokio_util::sync::CancellationToken;

use super::{actions, agent};
use crate::access::ClusterAccess;
use crate::util::{
    self, Error, PROBE_INTERVAL,
    colors::{FG1, FG2},
};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// Entrypoint for the `RemoteCluster` controller.
pub async fn run(client: Client, access: Arc<ClusterAccess>) -> Result<(), Error> {
    println!("{}", "⚙️ Starting RemoteCluster controller...".green());

    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone(), access));

    // Namespace where we run both leader election and the controller.
    // This lets us keep RBAC namespaced rather than cluster-scoped.
    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());

    // The CRD must be installed before anything else can work; abort with
    // a config error instead of spinning on watch failures.
    let crd_api: Api<RemoteCluster> = Api::namespaced(client.clone(), &lease_namespace);
    if let Err(e) = crd_api.list(&ListParams::default().limit(1)).await {
        eprintln!(
            "{}",
            format!("RemoteCluster CRD not available; install the CRDs first: {e}").red()
        );
        return Err(Error::UserInput(format!(
            "RemoteCluster CRD is not installed: {e}"
        )));
    }

    // Unique identity per replica (Downward API POD_NAME is ideal).
    // Fallback to hostname if not present.
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("dr-syncer-remotecluster-{}", uuid::Uuid::new_v4()));
    let lease_name = "dr-syncer-remotecluster-controller-lock".to_string();
    // TTL: how long leadership is considered valid without renewal.
    // Renew should happen well before TTL expires.
    let lease_ttl = Duration::from_secs(15);
    let renew_every = Duration::from_secs(5);
    let leadership = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name,
            lease_ttl,
        },
    );

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        drsync_common::shutdown::wait_for_signal().await;
        shutdown_signal.cancel();
    });
    // We run indefinitely; only the leader runs the controller.
    // On leadership loss, we abort the controller and go back to standby.
    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(renew_every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(task) = controller_task.take() {
                    task.abort();
                    task.await.ok();
                }
                break Ok(())
            },
            _ = tick.tick() => {}
        }
        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                // If we can't talk to the apiserver / update Lease, assume we are not safe to lead.
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some(task) = controller_task.take() {
                    task.abort();
                    eprintln!("aborted controller due to leader election error");
                }
                continue;
            }
        };
        if matches!(lease, LeaseLockResult::Acquired(_)) {
            // We are leader; ensure controller is running
            if controller_task.is_none() {
                println!("{}", "👑 Acquired leadership; starting RemoteCluster controller".green());
                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                let controller_namespace = lease_namespace.clone();
                let crd_api: Api<RemoteCluster> =
                    Api::namespaced(client_for_controller.clone(), &controller_namespace);
                controller_task = Some(tokio::spawn(async move {
                    println!("{}", "🚀 RemoteCluster controller started.".green());
                    Controller::new(crd_api, Default::default())
                        .run(reconcile, on_error, context_for_controller)
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            // We are NOT leader; ensure controller is stopped
            eprintln!("lost leadership; stopping controller");
            task.abort();
        }
    }
}

/// Context injected with each `reconcile` and `on_error` method invocation.
struct ContextData {
    client: Client,
    access: Arc<ClusterAccess>,

    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,

    last_action: Mutex<HashMap<(String, String), (RemoteClusterAction, Instant)>>,
}

impl ContextData {
    pub fn new(client: Client, access: Arc<ClusterAccess>) -> Self {
        #[cfg(feature = "metrics")]
        {
            ContextData {
                client,
                access,
                metrics: ControllerMetrics::new("remoteclusters"),
                last_action: Mutex::new(HashMap::new()),
            }
        }
        #[cfg(not(feature = "metrics"))]
        {
            ContextData {
                client,
                access,
                last_action: Mutex::new(HashMap::new()),
            }
        }
    }
}

/// Action to be taken upon a `RemoteCluster` resource during reconciliation.
#[derive(Debug, PartialEq, Clone)]
enum RemoteClusterAction {
    /// Agent plane is disabled for this cluster.
    Disabled,

    /// The sshd host-key secret does not exist on the remote cluster yet.
    ProvisionHostKeys,

    /// DaemonSet missing or its spec hash moved.
    DeployAgent { reason: String },

    /// Periodic SSH health probe of every agent node.
    Probe,

    /// An error occurred during reconciliation.
    Error(String),

    /// The resource is in desired state and requires no actions to be taken.
    NoOp,

    Requeue(Duration),
}

impl RemoteClusterAction {
    fn to_str(&self) -> &str {
        match self {
            RemoteClusterAction::Disabled => "Disabled",
            RemoteClusterAction::ProvisionHostKeys => "ProvisionHostKeys",
            RemoteClusterAction::DeployAgent { .. } => "DeployAgent",
            RemoteClusterAction::Probe => "Probe",
            RemoteClusterAction::Error(_) => "Error",
            RemoteClusterAction::NoOp => "NoOp",
            RemoteClusterAction::Requeue(_) => "Requeue",
        }
    }
}

/// Reconciliation function for the `RemoteCluster` resource.
async fn reconcile(
    instance: Arc<RemoteCluster>,
    context: Arc<ContextData>,
) -> Result<Action, Error> {
    let namespace: String = match instance.namespace() {
        None => {
            return Err(Error::UserInput(
                "Expected RemoteCluster resource to be namespaced.".to_owned(),
            ));
        }
        Some(namespace) => namespace,
    };
    let name = instance.name_any();

    #[cfg(feature = "metrics")]
    context
        .metrics
        .reconcile_counter
        .with_label_values(&[&name, &namespace])
        .inc();

    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    // Read phase of reconciliation determines goal during the write phase.
    let action = determine_action(context.access.clone(), &instance).await?;

    if action != RemoteClusterAction::NoOp {
        let value = {
            let mut la = context.last_action.lock().await;
            la.insert(
                (namespace.clone(), name.clone()),
                (action.clone(), Instant::now()),
            )
        };
        if let Some((last_action, last_instant)) = value
            && (Some(&action) != Some(&last_action)
                || last_instant.elapsed() > Duration::from_secs(300))
        {
            println!(
                "🔧 {}{}{}{}{}",
                namespace.color(FG2),
                "/".color(FG1),
                name.color(FG2),
                " ACTION: ".color(FG1),
                format!("{:?}", action).color(FG2),
            );
        }
    }

    #[cfg(feature = "metrics")]
    context
        .metrics
        .read_histogram
        .with_label_values(&[&name, &namespace, action.to_str()])
        .observe(start.elapsed().as_secs_f64());

    #[cfg(feature = "metrics")]
    context
        .metrics
        .action_counter
        .with_label_values(&[&name, &namespace, action.to_str()])
        .inc();

    #[cfg(feature = "metrics")]
    let timer = match action {
        RemoteClusterAction::NoOp => None,
        _ => Some(
            context
                .metrics
                .write_histogram
                .with_label_values(&[&name, &namespace, action.to_str()])
                .start_timer(),
        ),
    };

    let probe_interval = util::parse_spec_duration(&instance.spec.health.check_interval)
        .unwrap_or(PROBE_INTERVAL);
    let result = match action {
        RemoteClusterAction::Requeue(duration) => Action::requeue(duration),
        RemoteClusterAction::Disabled => {
            actions::disabled(context.access.clone(), &instance).await?;
            Action::requeue(probe_interval)
        }
        RemoteClusterAction::ProvisionHostKeys => {
            actions::provision_host_keys(context.access.clone(), &instance).await?;
            Action::requeue(Duration::from_secs(2))
        }
        RemoteClusterAction::DeployAgent { reason } => {
            actions::deploy_agent(context.access.clone(), &instance, reason).await?;
            Action::requeue(Duration::from_secs(10))
        }
        RemoteClusterAction::Probe => {
            actions::probe(context.access.clone(), &instance).await?;
            Action::requeue(probe_interval)
        }
        RemoteClusterAction::Error(message) => {
            actions::error(context.client.clone(), &instance, message).await?;
            Action::requeue(probe_interval)
        }
        RemoteClusterAction::NoOp => Action::requeue(probe_interval),
    };

    #[cfg(feature = "metrics")]
    if let Some(timer) = timer {
        timer.observe_duration();
    }

    Ok(result)
}

/// Looks at the state of the given `RemoteCluster` and decides which
/// action needs to be performed next.
async fn determine_action(
    access: Arc<ClusterAccess>,
    instance: &RemoteCluster,
) -> Result<RemoteClusterAction, Error> {
    // Don't do anything while being deleted.
    if instance.metadata.deletion_timestamp.is_some() {
        return Ok(RemoteClusterAction::Requeue(Duration::from_secs(2)));
    }

    let conn = match access.connect(instance).await {
        Ok(conn) => conn,
        Err(e) => return Ok(RemoteClusterAction::Error(e.to_string())),
    };

    if !instance.spec.agent.enabled {
        return Ok(RemoteClusterAction::Disabled);
    }

    let secrets: Api<k8s_openapi::api::core::v1::Secret> =
        Api::namespaced(conn.client.clone(), agent::AGENT_NAMESPACE);
    let host_keys = match secrets.get(agent::HOST_KEYS_SECRET).await {
        Ok(secret) => secret,
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            return Ok(RemoteClusterAction::ProvisionHostKeys);
        }
        Err(e) => return Err(e.into()),
    };
    let host_keys_version = host_keys.metadata.resource_version.unwrap_or_default();

    let daemonsets: Api<k8s_openapi::api::apps::v1::DaemonSet> =
        Api::namespaced(conn.client, agent::AGENT_NAMESPACE);
    let existing = match daemonsets.get(agent::DAEMONSET_NAME).await {
        Ok(ds) => ds,
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            return Ok(RemoteClusterAction::DeployAgent {
                reason: "agent DaemonSet does not exist".to_string(),
            });
        }
        Err(e) => return Err(e.into()),
    };

    // Check the hash
    let desired_hash = util::hash_spec(&(&instance.spec.agent, host_keys_version.as_str()));
    if existing
        .metadata
        .annotations
        .as_ref()
        .is_none_or(|a| a.get(drsync_common::annotations::SPEC_HASH) != Some(&desired_hash))
    {
        return Ok(RemoteClusterAction::DeployAgent {
            reason: "agent spec hash mismatch".to_string(),
        });
    }

    // Probe when the last health sample is older than the check interval.
    let check_interval =
        util::parse_spec_duration(&instance.spec.health.check_interval).unwrap_or(PROBE_INTERVAL);
    let due = match instance
        .status
        .as_ref()
        .and_then(|s| s.last_sync_time.as_ref())
    {
        Some(last) => {
            let age = Timestamp::now().duration_since(last.0);
            Duration::try_from(age).map(|age| age >= check_interval).unwrap_or(true)
        }
        None => true,
    };
    if due {
        return Ok(RemoteClusterAction::Probe);
    }
    Ok(RemoteClusterAction::NoOp)
}

/// Actions to be taken when a reconciliation fails - for whatever reason.
fn on_error(instance: Arc<RemoteCluster>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!("Reconciliation error: {:?} ({})", error, instance.name_any()).red()
    );
    Action::requeue(Duration::from_secs(5))
}
