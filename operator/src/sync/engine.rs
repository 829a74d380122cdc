use super::filter;
use super::fingerprint::{self, FingerprintCache, FingerprintKey};
use super::immutable;
use super::kinds::SyncKind;
use super::pvc;
use super::transform::{self, TransformContext};
use crate::access::{ClusterConnection, dynamic_api};
use crate::scheduler::BackoffPolicy;
use crate::util::{self, Error, ErrorCategory};
use drsync_common::{labels, wait};
use drsync_types::*;
use futures::stream::{self, StreamExt};
use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, jiff::Timestamp};
use kube::{
    Api, ResourceExt,
    api::{DynamicObject, ListParams, Patch, PatchParams, PostParams},
};
use owo_colors::OwoColorize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::util::colors::{FG1, FG2};

/// Serializes writes that target the same destination (kind, namespace,
/// name). Held only for the duration of one write.
#[derive(Default)]
pub struct KeyLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// What one write did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    Updated,
    /// Fingerprint unchanged or create raced another writer; no write issued.
    Unchanged,
    /// Existing destination object lacks our managed-by label.
    SkippedUnmanaged,
    /// Immutable conflict resolved as NoChange.
    SkippedImmutable,
}

struct ObjectResult {
    kind: SyncKind,
    name: String,
    outcome: Result<WriteOutcome, Error>,
    scale: Option<(String, i64)>,
    duration: Duration,
}

/// One reconcile pass for a NamespaceMapping.
pub struct SyncPass<'a> {
    pub mapping: &'a NamespaceMapping,
    pub source: &'a ClusterConnection,
    pub dest: &'a ClusterConnection,
    pub cache: Arc<FingerprintCache>,
    pub locks: Arc<KeyLocks>,
    pub cancel: CancellationToken,
}

/// Everything the status reporter needs to know about a finished pass.
#[derive(Clone, Default)]
pub struct PassOutcome {
    pub stats: SyncStats,
    pub progress: SyncProgress,
    pub groups: Vec<ResourceGroupStatus>,
    pub resource_status: Vec<ResourceSyncStatus>,
    pub detailed: Vec<DetailedResourceStatus>,
    pub new_scales: Vec<DeploymentScale>,
    pub error_categories: BTreeMap<String, u32>,
    /// PVCs synced this pass whose data should be replicated next.
    pub pvcs_to_sync: Vec<String>,
    pub last_error: Option<String>,
    pub failed: bool,
}

impl PassOutcome {
    fn count_error(&mut self, category: &str) {
        *self.error_categories.entry(category.to_string()).or_insert(0) += 1;
    }
}

impl SyncPass<'_> {
    pub async fn run(&self) -> Result<PassOutcome, Error> {
        let spec = &self.mapping.spec;
        let started = Instant::now();
        let kinds = filter::selected_kinds(&spec.resource_types)?;
        let backoff = BackoffPolicy::from_retry(&spec.retry)?;
        let mut outcome = PassOutcome::default();
        let mut scales: Vec<DeploymentScale> = self
            .mapping
            .status
            .as_ref()
            .map(|s| s.deployment_scales.clone())
            .unwrap_or_default();
        let recorded_scales = scales.len();

        // The destination namespace comes first whenever it is wanted,
        // whether or not the kind list names it.
        if spec.namespace_config.create_namespace || kinds.contains(&SyncKind::Namespace) {
            self.sync_namespace(&mut outcome).await;
        }

        for kind in kinds {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            // PVs ride along with their PVCs so ordering holds per claim;
            // the namespace was handled above.
            if kind == SyncKind::PersistentVolume || kind == SyncKind::Namespace {
                continue;
            }

            let objects = self.list_source(kind).await?;
            let total = objects.len();
            let mut group = ResourceGroupStatus {
                kind: kind.kind().to_string(),
                total: total as u32,
                ..Default::default()
            };

            let results: Vec<ObjectResult> = stream::iter(objects)
                .map(|obj| self.sync_one(kind, obj, &scales, &backoff))
                .buffer_unordered(spec.concurrency.max(1) as usize)
                .collect()
                .await;

            for result in results {
                outcome.progress.total += 1;
                outcome.stats.total_resources += 1;
                match &result.outcome {
                    Ok(write) => {
                        outcome.progress.completed += 1;
                        outcome.stats.successful += 1;
                        group.synced += 1;
                        if let Some((name, replicas)) = &result.scale {
                            transform::record_scale(
                                &mut scales,
                                result.kind,
                                name,
                                &spec.source_namespace,
                                *replicas,
                            );
                        }
                        if matches!(write, WriteOutcome::SkippedImmutable) {
                            outcome.count_error(ErrorCategory::ImmutableConflict.as_str());
                        }
                        if result.kind == SyncKind::PersistentVolumeClaim
                            && spec.pvc_config.sync_data
                            && !matches!(write, WriteOutcome::SkippedUnmanaged)
                        {
                            outcome.pvcs_to_sync.push(result.name.clone());
                        }
                        self.push_status(&mut outcome, &result, None);
                    }
                    Err(e) => {
                        outcome.stats.failed += 1;
                        group.failed += 1;
                        outcome.failed = true;
                        outcome.count_error(e.category().as_str());
                        let message = e.to_string();
                        outcome.last_error = Some(message.clone());
                        eprintln!(
                            "❌ {}{}{}{}{}",
                            result.kind.kind().color(FG2),
                            "/".color(FG1),
                            result.name.color(FG2),
                            ": ".color(FG1),
                            message.color(FG2),
                        );
                        self.push_status(&mut outcome, &result, Some(message));
                    }
                }
            }
            outcome.groups.push(group);
        }

        outcome.new_scales = scales.split_off(0);
        // Only report scales when this pass learned new ones; the reporter
        // never rewrites records captured by an earlier sync.
        if outcome.new_scales.len() == recorded_scales {
            outcome.new_scales.clear();
        }
        outcome.stats.last_sync_duration = Some(util::format_duration(started.elapsed()));
        Ok(outcome)
    }

    fn push_status(&self, outcome: &mut PassOutcome, result: &ObjectResult, error: Option<String>) {
        let phase = if error.is_some() {
            ResourcePhase::Failed
        } else {
            ResourcePhase::Synced
        };
        outcome.resource_status.push(ResourceSyncStatus {
            kind: result.kind.kind().to_string(),
            name: result.name.clone(),
            namespace: self.mapping.spec.destination_namespace.clone(),
            status: phase,
            last_sync_time: Some(Time::from(Timestamp::now())),
            error: error.clone(),
        });
        let significant = result.kind.is_workload()
            || result.kind == SyncKind::PersistentVolumeClaim
            || error.is_some();
        if significant {
            outcome.detailed.push(DetailedResourceStatus {
                kind: result.kind.kind().to_string(),
                name: result.name.clone(),
                status: phase,
                message: error,
                duration: Some(util::format_duration(result.duration)),
            });
        }
    }

    async fn list_source(&self, kind: SyncKind) -> Result<Vec<DynamicObject>, Error> {
        let ar = kind.api_resource();
        let api = dynamic_api(
            &self.source.client,
            &ar,
            Some(&self.mapping.spec.source_namespace),
        );
        let list = api.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter(|obj| !filter::is_ignored(obj))
            .filter(|obj| !self.is_our_own_artifact(obj))
            .collect())
    }

    /// Pods and secrets the data plane creates in a namespace must never
    /// be mirrored back.
    fn is_our_own_artifact(&self, obj: &DynamicObject) -> bool {
        obj.metadata
            .labels
            .as_ref()
            .is_some_and(|l| l.contains_key(labels::SYNC_POD))
    }

    async fn sync_namespace(&self, outcome: &mut PassOutcome) {
        let started = Instant::now();
        let result = self.ensure_namespace().await;
        let record = ObjectResult {
            kind: SyncKind::Namespace,
            name: self.mapping.spec.destination_namespace.clone(),
            outcome: result,
            scale: None,
            duration: started.elapsed(),
        };
        outcome.progress.total += 1;
        outcome.stats.total_resources += 1;
        match &record.outcome {
            Ok(_) => {
                outcome.progress.completed += 1;
                outcome.stats.successful += 1;
                self.push_status(outcome, &record, None);
            }
            Err(e) => {
                outcome.stats.failed += 1;
                outcome.failed = true;
                outcome.count_error(e.category().as_str());
                outcome.last_error = Some(e.to_string());
                self.push_status(outcome, &record, Some(e.to_string()));
            }
        }
    }

    async fn ensure_namespace(&self) -> Result<WriteOutcome, Error> {
        let spec = &self.mapping.spec;
        let ar = SyncKind::Namespace.api_resource();
        let source_api = dynamic_api(&self.source.client, &ar, None);
        let dest_api = dynamic_api(&self.dest.client, &ar, None);

        let source_ns = source_api.get(&spec.source_namespace).await?;
        let existing = dest_api.get_opt(&spec.destination_namespace).await?;
        if existing.is_some() {
            return Ok(WriteOutcome::Unchanged);
        }
        let ctx = TransformContext {
            spec,
            scales: &[],
            source_cluster: &self.source.name,
            existing: None,
        };
        let desired = transform::transform(SyncKind::Namespace, &source_ns, &ctx)?;
        match dest_api.create(&PostParams::default(), &desired).await {
            Ok(_) => Ok(WriteOutcome::Created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(WriteOutcome::Unchanged),
            Err(e) => Err(e.into()),
        }
    }

    /// Fingerprint, transform and write one object, honoring the retry
    /// budget for transient errors.
    async fn sync_one(
        &self,
        kind: SyncKind,
        source_obj: DynamicObject,
        scales: &[DeploymentScale],
        backoff: &BackoffPolicy,
    ) -> ObjectResult {
        let started = Instant::now();
        let name = source_obj.name_any();
        let scale = kind
            .is_workload()
            .then(|| (name.clone(), transform::source_replicas(&source_obj)));

        let fp_key = FingerprintKey {
            cluster: self.source.name.clone(),
            kind: kind.kind().to_string(),
            namespace: self.mapping.spec.source_namespace.clone(),
            name: name.clone(),
        };
        let outcome = match fingerprint::fingerprint(&source_obj) {
            Ok(fp) if !self.cache.changed(&fp_key, &fp) => Ok(WriteOutcome::Unchanged),
            Ok(fp) => {
                let mut attempt = 0;
                loop {
                    if self.cancel.is_cancelled() {
                        break Err(Error::Cancelled);
                    }
                    match self.write_object(kind, &source_obj, scales).await {
                        Ok(write) => {
                            self.cache.record(fp_key.clone(), fp.clone());
                            break Ok(write);
                        }
                        Err(e) if e.is_retryable() && attempt < backoff.max_retries => {
                            attempt += 1;
                            eprintln!(
                                "{}",
                                format!(
                                    "retrying {}/{} after transient error ({attempt}/{}): {e}",
                                    kind.kind(),
                                    name,
                                    backoff.max_retries,
                                )
                                .yellow()
                            );
                            if wait::wait_with_backoff(
                                &self.cancel,
                                attempt as usize,
                                backoff.max_delay,
                            )
                            .await
                            .is_err()
                            {
                                break Err(Error::Cancelled);
                            }
                        }
                        Err(e) => break Err(e),
                    }
                }
            }
            Err(e) => Err(e),
        };

        ObjectResult {
            kind,
            name,
            outcome,
            scale,
            duration: started.elapsed(),
        }
    }

    async fn write_object(
        &self,
        kind: SyncKind,
        source_obj: &DynamicObject,
        scales: &[DeploymentScale],
    ) -> Result<WriteOutcome, Error> {
        let spec = &self.mapping.spec;
        let name = source_obj.name_any();
        let key = format!("{}/{}/{}", kind.kind(), spec.destination_namespace, name);
        let _guard = self.locks.acquire(&key).await;

        if kind == SyncKind::PersistentVolumeClaim
            && pvc::sync_pv_effective(source_obj, spec.pvc_config.sync_persistent_volumes)
        {
            self.ensure_pv(source_obj).await?;
        }

        let ar = kind.api_resource();
        let api = dynamic_api(&self.dest.client, &ar, Some(&spec.destination_namespace));
        let existing = api.get_opt(&name).await?;

        if let Some(current) = &existing
            && !current
                .metadata
                .labels
                .as_ref()
                .is_some_and(|l| l.contains_key(labels::MANAGED_BY))
        {
            eprintln!(
                "{}",
                format!(
                    "destination {}/{} exists but is not managed by dr-syncer; leaving it alone",
                    kind.kind(),
                    name
                )
                .yellow()
            );
            return Ok(WriteOutcome::SkippedUnmanaged);
        }

        let ctx = TransformContext {
            spec,
            scales,
            source_cluster: &self.source.name,
            existing: existing.as_ref(),
        };
        let mut desired = transform::transform(kind, source_obj, &ctx)?;

        let Some(current) = existing else {
            return match api.create(&PostParams::default(), &desired).await {
                Ok(_) => Ok(WriteOutcome::Created),
                Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(WriteOutcome::Unchanged),
                Err(e) => Err(e.into()),
            };
        };

        desired.metadata.resource_version = current.metadata.resource_version.clone();
        match api.replace(&name, &PostParams::default(), &desired).await {
            Ok(_) => Ok(WriteOutcome::Updated),
            Err(e) if util::is_immutable_field_error(&e) => {
                self.resolve_immutable(kind, source_obj, &current, &desired, &api)
                    .await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve_immutable(
        &self,
        kind: SyncKind,
        source_obj: &DynamicObject,
        current: &DynamicObject,
        desired: &DynamicObject,
        api: &Api<DynamicObject>,
    ) -> Result<WriteOutcome, Error> {
        let cfg = &self.mapping.spec.immutable_resource_config;
        let strategy = immutable::select_strategy(source_obj, cfg, kind);
        let name = desired.name_any();
        println!(
            "🔧 {}{}{}{}{}",
            kind.kind().color(FG2),
            "/".color(FG1),
            name.color(FG2),
            " immutable conflict, handling: ".color(FG1),
            strategy.to_string().color(FG2),
        );
        let drain_timeout = util::parse_spec_duration(&cfg.drain_timeout)?;
        let force_timeout = util::parse_spec_duration(&cfg.force_delete_timeout)?;
        match strategy {
            ImmutableHandling::NoChange => {
                eprintln!(
                    "{}",
                    format!("immutable field change on {}/{} not applied", kind.kind(), name)
                        .yellow()
                );
                Ok(WriteOutcome::SkippedImmutable)
            }
            ImmutableHandling::Recreate => {
                immutable::recreate(api, desired, &self.cancel, force_timeout).await?;
                Ok(WriteOutcome::Updated)
            }
            ImmutableHandling::RecreateWithPodDrain => {
                let pods: Api<k8s_openapi::api::core::v1::Pod> = Api::namespaced(
                    self.dest.client.clone(),
                    &self.mapping.spec.destination_namespace,
                );
                immutable::recreate_with_drain(
                    api,
                    &pods,
                    current,
                    desired,
                    &self.cancel,
                    drain_timeout,
                    force_timeout,
                )
                .await?;
                Ok(WriteOutcome::Updated)
            }
            ImmutableHandling::PartialUpdate => {
                immutable::partial_update(api, kind, desired).await?;
                Ok(WriteOutcome::Updated)
            }
            ImmutableHandling::ForceUpdate => {
                immutable::force_update(api, desired, &self.cancel, force_timeout).await?;
                Ok(WriteOutcome::Updated)
            }
        }
    }

    /// Creates the source PVC's PersistentVolume in the destination before
    /// the claim itself, so the claim can bind to it.
    async fn ensure_pv(&self, source_pvc: &DynamicObject) -> Result<(), Error> {
        let Some(volume_name) = source_pvc
            .data
            .get("spec")
            .and_then(|s| s.get("volumeName"))
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
        else {
            return Ok(());
        };
        let ar = SyncKind::PersistentVolume.api_resource();
        let source_api = dynamic_api(&self.source.client, &ar, None);
        let dest_api = dynamic_api(&self.dest.client, &ar, None);

        let Some(source_pv) = source_api.get_opt(&volume_name).await? else {
            return Ok(());
        };
        if dest_api.get_opt(&volume_name).await?.is_some() {
            return Ok(());
        }
        let ctx = TransformContext {
            spec: &self.mapping.spec,
            scales: &[],
            source_cluster: &self.source.name,
            existing: None,
        };
        let desired = transform::transform(SyncKind::PersistentVolume, &source_pv, &ctx)?;
        match dest_api.create(&PostParams::default(), &desired).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Clears the sync-now annotation after a manual trigger has been served.
pub async fn clear_sync_now(
    client: &kube::Client,
    mapping: &NamespaceMapping,
) -> Result<(), Error> {
    let Some(namespace) = mapping.namespace() else {
        return Ok(());
    };
    let api: Api<NamespaceMapping> = Api::namespaced(client.clone(), &namespace);
    let mut annotations = serde_json::Map::new();
    annotations.insert(
        drsync_common::annotations::SYNC_NOW.to_string(),
        serde_json::Value::Null,
    );
    let patch = serde_json::json!({
        "metadata": { "annotations": annotations }
    });
    api.patch(
        &mapping.name_any(),
        &PatchParams::apply(util::MANAGER_NAME),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn key_locks_serialize_same_key() {
        let locks = Arc::new(KeyLocks::new());
        let guard = locks.acquire("Deployment/ns/web").await;
        let locks2 = locks.clone();
        let contended = tokio::spawn(async move {
            let _g = locks2.acquire("Deployment/ns/web").await;
        });
        // The second acquire cannot complete while the guard is held.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contended.is_finished());
        drop(guard);
        contended.await.unwrap();
    }

    #[tokio::test]
    async fn key_locks_allow_distinct_keys() {
        let locks = KeyLocks::new();
        let _a = locks.acquire("a").await;
        // Must not deadlock.
        let _b = locks.acquire("b").await;
    }

    #[test]
    fn outcome_counts_error_categories() {
        let mut outcome = PassOutcome::default();
        outcome.count_error("Transient");
        outcome.count_error("Transient");
        outcome.count_error("Config");
        assert_eq!(outcome.error_categories.get("Transient"), Some(&2));
        assert_eq!(outcome.error_categories.get("Config"), Some(&1));
    }
}
