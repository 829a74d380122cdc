use crate::access::{ClusterConnection, dynamic_api};
use crate::sync::kinds::SyncKind;
use crate::util;
use futures::StreamExt;
use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, jiff::Timestamp};
use kube::runtime::watcher;
use owo_colors::OwoColorize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

struct WatchHandle {
    /// Hash of (cluster, namespace, kinds); a change respawns the watchers.
    generation: String,
    dirty: Arc<AtomicBool>,
    last_event: Arc<Mutex<Option<Time>>>,
    cancel: CancellationToken,
}

/// Source-cluster watches for Continuous-mode mappings. Any number of
/// events between two passes collapse into one dirty flag, which the next
/// reconcile consumes.
#[derive(Default)]
pub struct WatchRegistry {
    inner: Mutex<HashMap<String, WatchHandle>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes sure watcher tasks for this mapping exist and match its
    /// current source cluster, namespace and kind selection.
    pub async fn ensure(
        &self,
        key: &str,
        source: &ClusterConnection,
        namespace: &str,
        kinds: &[SyncKind],
    ) {
        let kind_names: Vec<&str> = kinds.iter().map(|k| k.kind()).collect();
        let generation = util::hash_spec(&(&source.name, namespace, &kind_names));
        let mut registry = self.inner.lock().await;
        if let Some(handle) = registry.get(key) {
            if handle.generation == generation {
                return;
            }
            handle.cancel.cancel();
        }

        let dirty = Arc::new(AtomicBool::new(false));
        let last_event = Arc::new(Mutex::new(None));
        let cancel = CancellationToken::new();
        for kind in kinds {
            if *kind == SyncKind::Namespace {
                continue;
            }
            let api = dynamic_api(&source.client, &kind.api_resource(), Some(namespace));
            let dirty = dirty.clone();
            let last_event = last_event.clone();
            let cancel = cancel.clone();
            let label = format!("{}/{}/{}", source.name, namespace, kind.kind());
            tokio::spawn(async move {
                let mut stream = watcher(api, watcher::Config::default()).boxed();
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = stream.next() => match event {
                            Some(Ok(watcher::Event::Apply(_) | watcher::Event::Delete(_))) => {
                                dirty.store(true, Ordering::SeqCst);
                                *last_event.lock().await = Some(Time::from(Timestamp::now()));
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                eprintln!("{}", format!("watch '{label}': {e}").yellow());
                                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                            }
                            None => break,
                        }
                    }
                }
            });
        }
        registry.insert(
            key.to_string(),
            WatchHandle {
                generation,
                dirty,
                last_event,
                cancel,
            },
        );
    }

    /// Consumes the dirty flag: true at most once per burst of events.
    pub async fn take_dirty(&self, key: &str) -> bool {
        let registry = self.inner.lock().await;
        registry
            .get(key)
            .is_some_and(|h| h.dirty.swap(false, Ordering::SeqCst))
    }

    pub async fn last_event(&self, key: &str) -> Option<Time> {
        let registry = self.inner.lock().await;
        match registry.get(key) {
            Some(handle) => handle.last_event.lock().await.clone(),
            None => None,
        }
    }

    /// Stops and forgets the watchers for one mapping.
    pub async fn remove(&self, key: &str) {
        let mut registry = self.inner.lock().await;
        if let Some(handle) = registry.remove(key) {
            handle.cancel.cancel();
        }
    }
}
