use crate::access::ClusterAccess;
use crate::pvcsync::{Orchestrator, orchestrator::{AgentEndpoints, PvcSyncContext}};
use crate::scheduler::{self, BackoffPolicy};
use crate::sync::engine::{self, KeyLocks, PassOutcome, SyncPass};
use crate::sync::fingerprint::FingerprintCache;
use crate::util::{self, Error, PvcSyncError, events, patch::patch_status_with_retry};
use drsync_types::*;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, jiff::Timestamp};
use kube::{Api, Client, ResourceExt};
use owo_colors::OwoColorize;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn current_conditions(instance: &NamespaceMapping) -> &[Condition] {
    instance
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or(&[])
}

/// Why a pass is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Initial,
    Schedule,
    WatchEvent,
    Manual,
    Retry,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncTrigger::Initial => write!(f, "initial reconcile"),
            SyncTrigger::Schedule => write!(f, "schedule tick"),
            SyncTrigger::WatchEvent => write!(f, "source change"),
            SyncTrigger::Manual => write!(f, "sync-now annotation"),
            SyncTrigger::Retry => write!(f, "retry after failure"),
        }
    }
}

/// Long-lived collaborators shared by every pass.
pub struct PassDeps {
    pub access: Arc<ClusterAccess>,
    pub cache: Arc<FingerprintCache>,
    pub locks: Arc<KeyLocks>,
    pub orchestrator: Arc<Orchestrator>,
}

/// Resolves the (source, destination) RemoteCluster names, either from the
/// explicit pair or through the referenced ClusterMapping.
pub async fn resolve_clusters(
    hub: &Client,
    instance: &NamespaceMapping,
) -> Result<(String, String), Error> {
    if let Some((src, dst)) = instance.spec.explicit_clusters() {
        return Ok((src.to_string(), dst.to_string()));
    }
    let Some(reference) = &instance.spec.cluster_mapping_ref else {
        return Err(Error::UserInput(
            "either clusterMappingRef or sourceCluster/destinationCluster must be set".to_string(),
        ));
    };
    let namespace = reference
        .namespace
        .clone()
        .or_else(|| instance.namespace())
        .ok_or_else(|| Error::UserInput("NamespaceMapping is missing a namespace".to_string()))?;
    let api: Api<ClusterMapping> = Api::namespaced(hub.clone(), &namespace);
    let mapping = match api.get(&reference.name).await {
        Ok(m) => m,
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            return Err(Error::UserInput(format!(
                "ClusterMapping '{}/{}' does not exist",
                namespace, reference.name
            )));
        }
        Err(e) => return Err(e.into()),
    };
    Ok((mapping.spec.source_cluster, mapping.spec.target_cluster))
}

pub async fn paused(client: Client, instance: &NamespaceMapping) -> Result<(), Error> {
    let condition = util::condition(
        "Ready",
        true,
        "Paused",
        "Replication suspended by spec.paused",
    );
    let transitioned = util::condition_transitions(current_conditions(instance), &condition);
    patch_status_with_retry(client.clone(), instance, move |status: &mut NamespaceMappingStatus| {
        util::set_condition(&mut status.conditions, condition.clone());
    })
    .await?;
    if transitioned {
        events::emit(
            &client,
            instance,
            "Normal",
            "Paused",
            "Replication suspended",
        )
        .await;
    }
    Ok(())
}

/// Config errors: surfaced on Ready=False, no retry until the spec moves.
pub async fn invalid(client: Client, instance: &NamespaceMapping, message: String) -> Result<(), Error> {
    eprintln!(
        "{}",
        format!("NamespaceMapping '{}' invalid: {message}", instance.name_any()).red()
    );
    let condition = util::condition("Ready", false, "InvalidSpec", &message);
    let transitioned = util::condition_transitions(current_conditions(instance), &condition);
    patch_status_with_retry(client.clone(), instance, move |status: &mut NamespaceMappingStatus| {
        status.phase = SyncPhase::Failed;
        status.last_error = Some(message.clone());
        util::set_condition(&mut status.conditions, condition.clone());
    })
    .await?;
    if transitioned {
        events::emit(
            &client,
            instance,
            "Warning",
            "InvalidSpec",
            "NamespaceMapping spec cannot be acted on",
        )
        .await;
    }
    Ok(())
}

/// Computes and records the next scheduled run.
pub async fn schedule_next(client: Client, instance: &NamespaceMapping) -> Result<(), Error> {
    let Some(schedule) = instance.spec.schedule.as_deref() else {
        return Ok(());
    };
    let next = scheduler::next_cron_tick(schedule, chrono::Utc::now())?;
    let next_time = next.map(scheduler::to_k8s_time);
    let condition = util::condition(
        "Ready",
        true,
        "Scheduled",
        "Waiting for the next schedule tick",
    );
    let transitioned = util::condition_transitions(current_conditions(instance), &condition);
    patch_status_with_retry(client.clone(), instance, move |status: &mut NamespaceMappingStatus| {
        status.next_sync_time = next_time.clone();
        util::set_condition(&mut status.conditions, condition.clone());
    })
    .await?;
    if transitioned {
        events::emit(
            &client,
            instance,
            "Normal",
            "Scheduled",
            "Next replication pass scheduled",
        )
        .await;
    }
    Ok(())
}

/// Runs one full pass: resource sync, PVC data replication, status report.
/// A failed pass is recorded on status (with backoff bookkeeping), not
/// returned as an error, so requeue pacing stays under our control.
pub async fn execute_pass(
    deps: &PassDeps,
    instance: &NamespaceMapping,
    trigger: SyncTrigger,
    last_watch_event: Option<Time>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let hub = deps.access.hub();
    let name = instance.name_any();
    let spec = &instance.spec;
    println!(
        "🔄 {}",
        format!(
            "Syncing '{name}' ({} → {}) • trigger: {trigger}",
            spec.source_namespace, spec.destination_namespace,
        )
        .green()
    );

    let (source_name, dest_name) = resolve_clusters(&hub, instance).await?;
    let (source_cluster, source_conn) = deps.access.connect_by_name(&source_name).await?;
    let (dest_cluster, dest_conn) = deps.access.connect_by_name(&dest_name).await?;

    patch_status_with_retry(hub.clone(), instance, |status: &mut NamespaceMappingStatus| {
        status.phase = SyncPhase::Running;
        util::set_condition(
            &mut status.conditions,
            util::condition("Ready", true, "Syncing", "Replication pass in progress"),
        );
    })
    .await?;

    let pass = SyncPass {
        mapping: instance,
        source: &source_conn,
        dest: &dest_conn,
        cache: deps.cache.clone(),
        locks: deps.locks.clone(),
        cancel: cancel.clone(),
    };
    let mut outcome = match pass.run().await {
        Ok(outcome) => outcome,
        Err(Error::Cancelled) => {
            // Cancellation is recorded as such, never as a failure.
            let condition =
                util::condition("Synced", false, "Cancelled", "Replication pass cancelled");
            let transitioned =
                util::condition_transitions(current_conditions(instance), &condition);
            patch_status_with_retry(hub.clone(), instance, move |status: &mut NamespaceMappingStatus| {
                util::set_condition(&mut status.conditions, condition.clone());
            })
            .await?;
            if transitioned {
                events::emit(
                    &hub,
                    instance,
                    "Normal",
                    "SyncCancelled",
                    "Replication pass cancelled before completion",
                )
                .await;
            }
            return Ok(());
        }
        Err(e) => {
            let mut outcome = PassOutcome::default();
            outcome.failed = true;
            outcome.last_error = Some(e.to_string());
            *outcome
                .error_categories
                .entry(e.category().as_str().to_string())
                .or_insert(0) += 1;
            outcome
        }
    };

    if !outcome.pvcs_to_sync.is_empty() {
        sync_pvc_data(
            deps,
            instance,
            &source_cluster,
            &source_conn,
            &dest_cluster,
            &dest_conn,
            &mut outcome,
            &cancel,
        )
        .await;
    }

    report(deps, instance, trigger, last_watch_event, outcome).await
}

/// Drives the data plane for every PVC the pass touched.
#[allow(clippy::too_many_arguments)]
async fn sync_pvc_data(
    deps: &PassDeps,
    instance: &NamespaceMapping,
    source_cluster: &RemoteCluster,
    source_conn: &crate::access::ClusterConnection,
    dest_cluster: &RemoteCluster,
    dest_conn: &crate::access::ClusterConnection,
    outcome: &mut PassOutcome,
    cancel: &CancellationToken,
) {
    let endpoints = |cluster: &RemoteCluster| AgentEndpoints {
        namespace: crate::remoteclusters::agent::AGENT_NAMESPACE.to_string(),
        image: cluster.spec.agent.image.clone(),
        ssh_port: cluster.spec.agent.ssh_port,
        concurrency: cluster.spec.agent.concurrency,
    };
    let backoff = match BackoffPolicy::from_retry(&instance.spec.retry) {
        Ok(policy) => policy,
        Err(e) => {
            outcome.failed = true;
            outcome.last_error = Some(e.to_string());
            return;
        }
    };
    let ctx = PvcSyncContext {
        mapping: instance,
        source: source_conn,
        dest: dest_conn,
        source_agent: endpoints(source_cluster),
        dest_agent: endpoints(dest_cluster),
        backoff,
        cancel,
    };
    let pvcs = outcome.pvcs_to_sync.clone();
    for pvc in pvcs {
        match deps.orchestrator.sync_pvc(&ctx, &pvc).await {
            Ok(()) => {}
            Err(e @ PvcSyncError::CleanupFailed(_)) => {
                // Data landed; only the teardown is dirty. Surface it
                // without failing the pass or rerunning rsync.
                eprintln!("{}", format!("PVC '{pvc}': {e}").yellow());
                *outcome
                    .error_categories
                    .entry(e.category().to_string())
                    .or_insert(0) += 1;
            }
            Err(e) => {
                outcome.failed = true;
                *outcome
                    .error_categories
                    .entry(e.category().to_string())
                    .or_insert(0) += 1;
                outcome.last_error = Some(format!("PVC '{pvc}': {e}"));
                eprintln!("{}", format!("PVC '{pvc}': {e}").red());
            }
        }
    }
}

/// Writes the pass outcome to the status subresource and emits an event.
async fn report(
    deps: &PassDeps,
    instance: &NamespaceMapping,
    trigger: SyncTrigger,
    last_watch_event: Option<Time>,
    outcome: PassOutcome,
) -> Result<(), Error> {
    let hub = deps.access.hub();
    let spec = &instance.spec;
    let failed = outcome.failed;
    let now = Time::from(Timestamp::now());
    let schedule = spec.schedule.clone();
    let backoff = BackoffPolicy::from_retry(&spec.retry)?;

    let previous_failures = instance
        .status
        .as_ref()
        .map(|s| s.consecutive_failures)
        .unwrap_or(0);
    let consecutive_failures = if failed { previous_failures + 1 } else { 0 };

    // On failure the backoff target competes with the cron schedule and
    // the later one wins; on success the schedule alone decides.
    let next_sync = if failed {
        Some(scheduler::to_k8s_time(scheduler::next_attempt(
            schedule.as_deref(),
            chrono::Utc::now(),
            &backoff,
            consecutive_failures.saturating_sub(1),
        )?))
    } else {
        match schedule.as_deref() {
            Some(expr) => scheduler::next_cron_tick(expr, chrono::Utc::now())?
                .map(scheduler::to_k8s_time),
            None => None,
        }
    };
    let retry_status = failed.then(|| RetryStatus {
        next_retry_time: next_sync.clone(),
        retries_remaining: backoff.max_retries.saturating_sub(consecutive_failures),
        backoff_duration: Some(util::format_duration(scheduler::backoff_delay(
            &backoff,
            consecutive_failures.saturating_sub(1),
        ))),
    });

    let updated = patch_status_with_retry(hub.clone(), instance, move |status: &mut NamespaceMappingStatus| {
        status.phase = if failed {
            SyncPhase::Failed
        } else {
            SyncPhase::Completed
        };
        status.last_sync_time = Some(now.clone());
        status.next_sync_time = next_sync.clone();
        status.last_watch_event = last_watch_event.clone();
        status.sync_progress = Some(outcome.progress.clone());
        status.sync_stats = Some(outcome.stats.clone());
        status.resource_groups = outcome.groups.clone();
        status.resource_status = outcome.resource_status.clone();
        status.detailed_status = outcome.detailed.clone();
        status.last_error = outcome.last_error.clone();
        status.consecutive_failures = consecutive_failures;
        status.retry_status = retry_status.clone();
        if !outcome.new_scales.is_empty() {
            status.deployment_scales = outcome.new_scales.clone();
        }
        for (category, count) in &outcome.error_categories {
            match status
                .error_categories
                .iter_mut()
                .find(|c| &c.category == category)
            {
                Some(entry) => {
                    entry.count += count;
                    entry.last_occurred = Some(now.clone());
                }
                None => status.error_categories.push(ErrorCategoryCount {
                    category: category.clone(),
                    count: *count,
                    last_occurred: Some(now.clone()),
                }),
            }
        }
        util::set_condition(
            &mut status.conditions,
            util::condition(
                "Synced",
                !failed,
                if failed { "SyncFailed" } else { "SyncComplete" },
                &match &status.sync_stats {
                    Some(stats) => format!(
                        "{}/{} resources synced",
                        stats.successful, stats.total_resources
                    ),
                    None => "no resources processed".to_string(),
                },
            ),
        );
        util::set_condition(
            &mut status.conditions,
            util::condition(
                "Ready",
                !failed,
                if failed { "Backoff" } else { "Idle" },
                if failed {
                    "Waiting out backoff before the next attempt"
                } else {
                    "Replication up to date"
                },
            ),
        );
    })
    .await?;

    // A served manual trigger is consumed exactly once.
    let sync_now_set = instance
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(drsync_common::annotations::SYNC_NOW))
        .is_some();
    if sync_now_set {
        engine::clear_sync_now(&hub, instance).await?;
    }

    if failed {
        events::emit(
            &hub,
            &updated,
            "Warning",
            "SyncFailed",
            updated
                .status
                .as_ref()
                .and_then(|s| s.last_error.as_deref())
                .unwrap_or("replication pass failed"),
        )
        .await;
    } else {
        events::emit(
            &hub,
            &updated,
            "Normal",
            "SyncCompleted",
            &format!("Replication pass completed ({trigger})"),
        )
        .await;
    }
    Ok(())
}
