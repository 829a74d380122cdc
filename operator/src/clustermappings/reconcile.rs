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

use super::actions;
use crate::access::ClusterAccess;
use crate::scheduler::{self, BackoffPolicy};
use crate::util::{
    Error, PROBE_INTERVAL,
    colors::{FG1, FG2},
};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// Connected mappings are re-verified at this cadence.
const VERIFY_INTERVAL: Duration = Duration::from_secs(300);

/// Entrypoint for the `ClusterMapping` controller.
pub async fn run(client: Client, access: Arc<ClusterAccess>) -> Result<(), Error> {
    println!("{}", "⚙️ Starting ClusterMapping controller...".green());

    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone(), access));

    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());

    // The CRD must be installed before anything else can work; abort with
    // a config error instead of spinning on watch failures.
    let crd_api: Api<ClusterMapping> = Api::namespaced(client.clone(), &lease_namespace);
    if let Err(e) = crd_api.list(&ListParams::default().limit(1)).await {
        eprintln!(
            "{}",
            format!("ClusterMapping CRD not available; install the CRDs first: {e}").red()
        );
        return Err(Error::UserInput(format!(
            "ClusterMapping CRD is not installed: {e}"
        )));
    }

    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("dr-syncer-clustermapping-{}", uuid::Uuid::new_v4()));
    let lease_name = "dr-syncer-clustermapping-controller-lock".to_string();
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
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some(task) = controller_task.take() {
                    task.abort();
                    eprintln!("aborted controller due to leader election error");
                }
                continue;
            }
        };
        if matches!(lease, LeaseLockResult::Acquired(_)) {
            if controller_task.is_none() {
                println!("{}", "👑 Acquired leadership; starting ClusterMapping controller".green());
                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                let controller_namespace = lease_namespace.clone();
                let crd_api: Api<ClusterMapping> =
                    Api::namespaced(client_for_controller.clone(), &controller_namespace);
                controller_task = Some(tokio::spawn(async move {
                    println!("{}", "🚀 ClusterMapping controller started.".green());
                    Controller::new(crd_api, Default::default())
                        .run(reconcile, on_error, context_for_controller)
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            eprintln!("lost leadership; stopping controller");
            task.abort();
        }
    }
}

struct ContextData {
    client: Client,
    access: Arc<ClusterAccess>,

    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,

    last_action: Mutex<HashMap<(String, String), (ClusterMappingAction, Instant)>>,
}

impl ContextData {
    pub fn new(client: Client, access: Arc<ClusterAccess>) -> Self {
        #[cfg(feature = "metrics")]
        {
            ContextData {
                client,
                access,
                metrics: ControllerMetrics::new("clustermappings"),
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

#[derive(Debug, PartialEq, Clone)]
enum ClusterMappingAction {
    Paused,

    /// Spec cannot be acted on (e.g. self-referential pair).
    Invalid(String),

    /// Provision keys, push trust, verify the connection matrix.
    Connect,

    NoOp,

    Requeue(Duration),
}

impl ClusterMappingAction {
    fn to_str(&self) -> &str {
        match self {
            ClusterMappingAction::Paused => "Paused",
            ClusterMappingAction::Invalid(_) => "Invalid",
            ClusterMappingAction::Connect => "Connect",
            ClusterMappingAction::NoOp => "NoOp",
            ClusterMappingAction::Requeue(_) => "Requeue",
        }
    }
}

async fn reconcile(
    instance: Arc<ClusterMapping>,
    context: Arc<ContextData>,
) -> Result<Action, Error> {
    let namespace: String = match instance.namespace() {
        None => {
            return Err(Error::UserInput(
                "Expected ClusterMapping resource to be namespaced.".to_owned(),
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

    let action = determine_action(&instance)?;

    if action != ClusterMappingAction::NoOp {
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
        ClusterMappingAction::NoOp => None,
        _ => Some(
            context
                .metrics
                .write_histogram
                .with_label_values(&[&name, &namespace, action.to_str()])
                .start_timer(),
        ),
    };

    let result = match action {
        ClusterMappingAction::Requeue(duration) => Action::requeue(duration),
        ClusterMappingAction::Paused => {
            actions::paused(context.client.clone(), &instance).await?;
            Action::requeue(PROBE_INTERVAL)
        }
        ClusterMappingAction::Invalid(message) => {
            actions::invalid(context.client.clone(), &instance, message).await?;
            // No retry until the spec changes.
            Action::await_change()
        }
        ClusterMappingAction::Connect => {
            actions::connect(context.access.clone(), &instance).await?;
            Action::requeue(VERIFY_INTERVAL)
        }
        ClusterMappingAction::NoOp => Action::requeue(PROBE_INTERVAL),
    };

    #[cfg(feature = "metrics")]
    if let Some(timer) = timer {
        timer.observe_duration();
    }

    Ok(result)
}

fn determine_action(instance: &ClusterMapping) -> Result<ClusterMappingAction, Error> {
    if instance.metadata.deletion_timestamp.is_some() {
        return Ok(ClusterMappingAction::Requeue(Duration::from_secs(2)));
    }
    if instance.spec.paused {
        return Ok(ClusterMappingAction::Paused);
    }
    // A mapping cannot be self-referential.
    if instance.spec.source_cluster == instance.spec.target_cluster {
        return Ok(ClusterMappingAction::Invalid(format!(
            "sourceCluster and targetCluster are both '{}'",
            instance.spec.source_cluster
        )));
    }

    let status = instance.status.clone().unwrap_or_default();

    // After a failure, back off from the last attempt before reconnecting.
    if status.phase == ClusterMappingPhase::Failed
        && status.consecutive_failures > 0
        && let Some(last_attempt) = &status.last_attempt_time
    {
        let policy = BackoffPolicy::from_retry(&RetryPolicy::default())?;
        let delay = scheduler::backoff_delay(&policy, status.consecutive_failures - 1);
        let age = Timestamp::now().duration_since(last_attempt.0);
        if let Ok(age) = Duration::try_from(age)
            && age < delay
        {
            return Ok(ClusterMappingAction::Requeue(delay - age));
        }
        return Ok(ClusterMappingAction::Connect);
    }

    // Re-verify a connected mapping once its last verification goes stale.
    if status.phase == ClusterMappingPhase::Connected
        && let Some(last_verified) = &status.last_verified
    {
        let age = Timestamp::now().duration_since(last_verified.0);
        if let Ok(age) = Duration::try_from(age)
            && age < VERIFY_INTERVAL
        {
            return Ok(ClusterMappingAction::NoOp);
        }
    }
    Ok(ClusterMappingAction::Connect)
}

fn on_error(instance: Arc<ClusterMapping>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!("Reconciliation error: {:?} ({})", error, instance.name_any()).red()
    );
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(source: &str, target: &str) -> ClusterMapping {
        let spec = serde_json::from_value(serde_json::json!({
            "sourceCluster": source,
            "targetCluster": target,
        }))
        .unwrap();
        ClusterMapping::new("pair", spec)
    }

    #[test]
    fn self_referential_mapping_is_rejected() {
        let action = determine_action(&mapping("prod", "prod")).unwrap();
        assert!(matches!(action, ClusterMappingAction::Invalid(_)));
    }

    #[test]
    fn fresh_mapping_connects() {
        let action = determine_action(&mapping("prod", "dr")).unwrap();
        assert_eq!(action, ClusterMappingAction::Connect);
    }

    #[test]
    fn paused_mapping_stays_put() {
        let mut m = mapping("prod", "dr");
        m.spec.paused = true;
        assert_eq!(determine_action(&m).unwrap(), ClusterMappingAction::Paused);
    }

    #[test]
    fn failed_mapping_backs_off_from_last_attempt() {
        let mut m = mapping("prod", "dr");
        m.status = Some(ClusterMappingStatus {
            phase: ClusterMappingPhase::Failed,
            consecutive_failures: 3,
            last_attempt_time: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                Timestamp::now(),
            )),
            ..Default::default()
        });
        match determine_action(&m).unwrap() {
            ClusterMappingAction::Requeue(d) => {
                // 30s * 2^2 = 120s window, minus the instant just spent
                assert!(d <= Duration::from_secs(120));
                assert!(d > Duration::from_secs(100));
            }
            other => panic!("expected Requeue, got {other:?}"),
        }
    }
}
