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

use super::actions::{self, PassDeps, SyncTrigger};
use super::watch::WatchRegistry;
use crate::access::ClusterAccess;
use crate::pvcsync::Orchestrator;
use crate::scheduler;
use crate::sync::engine::KeyLocks;
use crate::sync::filter;
use crate::sync::fingerprint::FingerprintCache;
use crate::util::{
    Error, PROBE_INTERVAL,
    colors::{FG1, FG2},
};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// Requeue cadence while waiting on watch events in Continuous mode.
const CONTINUOUS_POLL: Duration = Duration::from_secs(5);

/// Entrypoint for the `NamespaceMapping` controller.
pub async fn run(client: Client, access: Arc<ClusterAccess>) -> Result<(), Error> {
    println!("{}", "⚙️ Starting NamespaceMapping controller...".green());

    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone(), access));

    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());

    // The CRD must be installed before anything else can work; abort with
    // a config error instead of spinning on watch failures.
    let crd_api: Api<NamespaceMapping> = Api::namespaced(client.clone(), &lease_namespace);
    if let Err(e) = crd_api.list(&ListParams::default().limit(1)).await {
        eprintln!(
            "{}",
            format!("NamespaceMapping CRD not available; install the CRDs first: {e}").red()
        );
        return Err(Error::UserInput(format!(
            "NamespaceMapping CRD is not installed: {e}"
        )));
    }

    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("dr-syncer-namespacemapping-{}", uuid::Uuid::new_v4()));
    let lease_name = "dr-syncer-namespacemapping-controller-lock".to_string();
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
                context.cancel_all().await;
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
                println!("{}", "👑 Acquired leadership; starting NamespaceMapping controller".green());
                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                let controller_namespace = lease_namespace.clone();
                let crd_api: Api<NamespaceMapping> =
                    Api::namespaced(client_for_controller.clone(), &controller_namespace);
                controller_task = Some(tokio::spawn(async move {
                    println!("{}", "🚀 NamespaceMapping controller started.".green());
                    Controller::new(crd_api, Default::default())
                        .run(reconcile, on_error, context_for_controller)
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            // We are NOT leader; in-flight passes must stop writing too.
            eprintln!("lost leadership; stopping controller");
            context.cancel_all().await;
            task.abort();
        }
    }
}

struct ContextData {
    client: Client,
    deps: PassDeps,
    watches: WatchRegistry,
    /// One cancellation token per mapping; cancelled on deletion so all
    /// in-flight work for that mapping stops within bounded time.
    cancels: Mutex<HashMap<String, CancellationToken>>,

    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,

    last_action: Mutex<HashMap<(String, String), (NamespaceMappingAction, Instant)>>,
}

impl ContextData {
    pub fn new(client: Client, access: Arc<ClusterAccess>) -> Self {
        let deps = PassDeps {
            access,
            cache: Arc::new(FingerprintCache::new()),
            locks: Arc::new(KeyLocks::new()),
            orchestrator: Arc::new(Orchestrator::new()),
        };
        #[cfg(feature = "metrics")]
        {
            ContextData {
                client,
                deps,
                watches: WatchRegistry::new(),
                cancels: Mutex::new(HashMap::new()),
                metrics: ControllerMetrics::new("namespacemappings"),
                last_action: Mutex::new(HashMap::new()),
            }
        }
        #[cfg(not(feature = "metrics"))]
        {
            ContextData {
                client,
                deps,
                watches: WatchRegistry::new(),
                cancels: Mutex::new(HashMap::new()),
                last_action: Mutex::new(HashMap::new()),
            }
        }
    }

    async fn cancel_token(&self, key: &str) -> CancellationToken {
        let mut cancels = self.cancels.lock().await;
        cancels
            .entry(key.to_string())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    async fn cancel_mapping(&self, key: &str) {
        let mut cancels = self.cancels.lock().await;
        if let Some(token) = cancels.remove(key) {
            token.cancel();
        }
    }

    async fn cancel_all(&self) {
        let mut cancels = self.cancels.lock().await;
        for (_, token) in cancels.drain() {
            token.cancel();
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
enum NamespaceMappingAction {
    /// Mapping is being deleted: stop watches, cancel work, drop caches.
    /// Destination resources are left in place.
    Deleted,

    Paused,

    /// Spec cannot be acted on; wait for it to change.
    Invalid(String),

    /// Record the next cron tick on status.
    ScheduleNext,

    /// Run a full replication pass.
    RunPass(SyncTrigger),

    NoOp,

    Requeue(Duration),
}

impl NamespaceMappingAction {
    fn to_str(&self) -> &str {
        match self {
            NamespaceMappingAction::Deleted => "Deleted",
            NamespaceMappingAction::Paused => "Paused",
            NamespaceMappingAction::Invalid(_) => "Invalid",
            NamespaceMappingAction::ScheduleNext => "ScheduleNext",
            NamespaceMappingAction::RunPass(_) => "RunPass",
            NamespaceMappingAction::NoOp => "NoOp",
            NamespaceMappingAction::Requeue(_) => "Requeue",
        }
    }
}

async fn reconcile(
    instance: Arc<NamespaceMapping>,
    context: Arc<ContextData>,
) -> Result<Action, Error> {
    let namespace: String = match instance.namespace() {
        None => {
            return Err(Error::UserInput(
                "Expected NamespaceMapping resource to be namespaced.".to_owned(),
            ));
        }
        Some(namespace) => namespace,
    };
    let name = instance.name_any();
    let key = format!("{namespace}/{name}");

    #[cfg(feature = "metrics")]
    context
        .metrics
        .reconcile_counter
        .with_label_values(&[&name, &namespace])
        .inc();

    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    let action = determine_action(&context, &key, &instance).await?;

    if action != NamespaceMappingAction::NoOp {
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
        NamespaceMappingAction::NoOp => None,
        _ => Some(
            context
                .metrics
                .write_histogram
                .with_label_values(&[&name, &namespace, action.to_str()])
                .start_timer(),
        ),
    };

    let result = match action {
        NamespaceMappingAction::Requeue(duration) => Action::requeue(duration),
        NamespaceMappingAction::Deleted => {
            context.cancel_mapping(&key).await;
            context.watches.remove(&key).await;
            if let Ok((source, _)) = actions::resolve_clusters(&context.client, &instance).await {
                context
                    .deps
                    .cache
                    .evict_mapping(&source, &instance.spec.source_namespace);
            }
            Action::await_change()
        }
        NamespaceMappingAction::Paused => {
            actions::paused(context.client.clone(), &instance).await?;
            Action::requeue(PROBE_INTERVAL)
        }
        NamespaceMappingAction::Invalid(message) => {
            actions::invalid(context.client.clone(), &instance, message).await?;
            // No retry until the spec changes.
            Action::await_change()
        }
        NamespaceMappingAction::ScheduleNext => {
            actions::schedule_next(context.client.clone(), &instance).await?;
            Action::requeue(Duration::from_secs(1))
        }
        NamespaceMappingAction::RunPass(trigger) => {
            let cancel = context.cancel_token(&key).await;
            let last_watch_event = context.watches.last_event(&key).await;
            actions::execute_pass(&context.deps, &instance, trigger, last_watch_event, cancel)
                .await?;
            match instance.spec.replication_mode {
                ReplicationMode::Continuous => Action::requeue(CONTINUOUS_POLL),
                _ => Action::requeue(Duration::from_secs(1)),
            }
        }
        NamespaceMappingAction::NoOp => Action::requeue(PROBE_INTERVAL),
    };

    #[cfg(feature = "metrics")]
    if let Some(timer) = timer {
        timer.observe_duration();
    }

    Ok(result)
}

/// The state machine's read phase: decides what this reconcile should do.
async fn determine_action(
    context: &Arc<ContextData>,
    key: &str,
    instance: &NamespaceMapping,
) -> Result<NamespaceMappingAction, Error> {
    if instance.metadata.deletion_timestamp.is_some() {
        return Ok(NamespaceMappingAction::Deleted);
    }
    if instance.spec.paused {
        return Ok(NamespaceMappingAction::Paused);
    }

    let spec = &instance.spec;
    if let Err(e) = filter::selected_kinds(&spec.resource_types) {
        return Ok(NamespaceMappingAction::Invalid(e.to_string()));
    }
    if spec.explicit_clusters().is_none() && spec.cluster_mapping_ref.is_none() {
        return Ok(NamespaceMappingAction::Invalid(
            "either clusterMappingRef or sourceCluster/destinationCluster must be set".to_string(),
        ));
    }
    if spec.replication_mode == ReplicationMode::Scheduled {
        match spec.schedule.as_deref() {
            Some(expr) => {
                if let Err(e) = scheduler::parse_schedule(expr) {
                    return Ok(NamespaceMappingAction::Invalid(e.to_string()));
                }
            }
            None => {
                return Ok(NamespaceMappingAction::Invalid(
                    "schedule is required for Scheduled mode".to_string(),
                ));
            }
        }
    }

    // The manual trigger works in every mode.
    if instance
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(drsync_common::annotations::SYNC_NOW))
        .is_some_and(|v| v == "true")
    {
        return Ok(NamespaceMappingAction::RunPass(SyncTrigger::Manual));
    }

    let status = instance.status.clone().unwrap_or_default();

    // First reconcile after creation runs immediately.
    if status.last_sync_time.is_none() && status.phase == SyncPhase::Pending {
        return Ok(NamespaceMappingAction::RunPass(SyncTrigger::Initial));
    }

    // A failed pass waits for its backoff window (already the later of the
    // backoff target and the next schedule tick).
    if let Some(retry) = &status.retry_status
        && let Some(at) = &retry.next_retry_time
    {
        let now = Timestamp::now();
        if now < at.0 {
            let remaining = at.0.duration_since(now);
            let remaining = Duration::try_from(remaining).unwrap_or(PROBE_INTERVAL);
            return Ok(NamespaceMappingAction::Requeue(remaining.min(PROBE_INTERVAL)));
        }
        return Ok(NamespaceMappingAction::RunPass(SyncTrigger::Retry));
    }

    match spec.replication_mode {
        ReplicationMode::Scheduled => match &status.next_sync_time {
            None => Ok(NamespaceMappingAction::ScheduleNext),
            Some(at) => {
                let now = Timestamp::now();
                if now >= at.0 {
                    Ok(NamespaceMappingAction::RunPass(SyncTrigger::Schedule))
                } else {
                    let remaining = Duration::try_from(at.0.duration_since(now))
                        .unwrap_or(PROBE_INTERVAL);
                    Ok(NamespaceMappingAction::Requeue(remaining.min(PROBE_INTERVAL)))
                }
            }
        },
        ReplicationMode::Continuous => {
            // Keep the source watches alive and coalesce their events.
            let (source_name, _) =
                actions::resolve_clusters(&context.client, instance).await?;
            if let Ok((_, conn)) = context.deps.access.connect_by_name(&source_name).await {
                let kinds = filter::selected_kinds(&spec.resource_types)?;
                context
                    .watches
                    .ensure(key, &conn, &spec.source_namespace, &kinds)
                    .await;
            }
            if context.watches.take_dirty(key).await {
                Ok(NamespaceMappingAction::RunPass(SyncTrigger::WatchEvent))
            } else {
                Ok(NamespaceMappingAction::Requeue(CONTINUOUS_POLL))
            }
        }
        ReplicationMode::Manual => Ok(NamespaceMappingAction::NoOp),
    }
}

fn on_error(instance: Arc<NamespaceMapping>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!("Reconciliation error: {:?} ({})", error, instance.name_any()).red()
    );
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(extra: serde_json::Value) -> NamespaceMapping {
        let mut base = serde_json::json!({
            "sourceCluster": "prod",
            "destinationCluster": "dr",
            "sourceNamespace": "web",
            "destinationNamespace": "web-dr",
        });
        base.as_object_mut()
            .unwrap()
            .extend(extra.as_object().cloned().unwrap_or_default());
        NamespaceMapping::new("job", serde_json::from_value(base).unwrap())
    }

    #[test]
    fn scheduled_mode_requires_a_schedule() {
        let m = mapping(serde_json::json!({"replicationMode": "Scheduled"}));
        assert!(m.spec.schedule.is_none());
        // determine_action is async over context; the validation rule it
        // applies is visible through the scheduler directly.
        assert!(scheduler::parse_schedule("not-cron").is_err());
        assert!(scheduler::parse_schedule("*/5 * * * *").is_ok());
    }

    #[test]
    fn action_names_are_stable_for_metrics() {
        assert_eq!(
            NamespaceMappingAction::RunPass(SyncTrigger::Manual).to_str(),
            "RunPass"
        );
        assert_eq!(NamespaceMappingAction::Deleted.to_str(), "Deleted");
    }

    #[test]
    fn explicit_cluster_pair_resolves_without_a_mapping_ref() {
        let m = mapping(serde_json::json!({}));
        assert_eq!(m.spec.explicit_clusters(), Some(("prod", "dr")));
        let m2 = mapping(serde_json::json!({
            "sourceCluster": null,
            "destinationCluster": null,
        }));
        assert_eq!(m2.spec.explicit_clusters(), None);
    }
}
