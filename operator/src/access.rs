use crate::util::{AccessError, Error};
use drsync_types::RemoteCluster;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    Api, Client, ResourceExt,
    api::{ApiResource, DynamicObject},
    config::{Config, KubeConfigOptions, Kubeconfig},
};
use owo_colors::OwoColorize;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// A connected external cluster: the name it is registered under plus a
/// client that serves both typed and dynamic access.
#[derive(Clone)]
pub struct ClusterConnection {
    pub name: String,
    pub client: Client,
}

struct CachedClient {
    secret_version: String,
    client: Client,
}

/// Resolves RemoteClusters to clients, loading kubeconfig payloads from
/// their credential secrets. Clients are cached by
/// (secret name, resourceVersion); a rotated secret invalidates the cache
/// entry on next access.
pub struct ClusterAccess {
    hub: Client,
    namespace: String,
    cache: Mutex<HashMap<String, CachedClient>>,
}

impl ClusterAccess {
    /// `hub` is the client for the cluster this operator runs in; that is
    /// where RemoteClusters and their credential secrets live.
    pub fn new(hub: Client, namespace: String) -> Self {
        Self {
            hub,
            namespace,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn hub(&self) -> Client {
        self.hub.clone()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Fetches a RemoteCluster by name and connects to it.
    pub async fn connect_by_name(&self, name: &str) -> Result<(RemoteCluster, ClusterConnection), Error> {
        let api: Api<RemoteCluster> = Api::namespaced(self.hub.clone(), &self.namespace);
        let cluster = match api.get(name).await {
            Ok(c) => c,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return Err(Error::UserInput(format!(
                    "RemoteCluster '{name}' does not exist"
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let conn = self.connect(&cluster).await?;
        Ok((cluster, conn))
    }

    /// Builds (or returns a cached) client for the given RemoteCluster.
    pub async fn connect(&self, cluster: &RemoteCluster) -> Result<ClusterConnection, Error> {
        let cluster_name = cluster.name_any();
        let cred = &cluster.spec.credential_ref;
        let secret_namespace = cred
            .namespace
            .clone()
            .or_else(|| cluster.namespace())
            .unwrap_or_else(|| self.namespace.clone());

        let secrets: Api<Secret> = Api::namespaced(self.hub.clone(), &secret_namespace);
        let secret = match secrets.get(&cred.name).await {
            Ok(s) => s,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return Err(AccessError::SecretNotFound {
                    namespace: secret_namespace,
                    name: cred.name.clone(),
                }
                .into());
            }
            Err(e) => {
                return Err(AccessError::Unreachable {
                    cluster: cluster_name,
                    reason: e.to_string(),
                }
                .into());
            }
        };

        let secret_version = secret.metadata.resource_version.clone().unwrap_or_default();
        let cache_key = format!("{secret_namespace}/{}", cred.name);
        {
            let cache = self.cache.lock().await;
            if let Some(cached) = cache.get(&cache_key)
                && cached.secret_version == secret_version
            {
                return Ok(ClusterConnection {
                    name: cluster_name,
                    client: cached.client.clone(),
                });
            }
        }

        let invalid = |reason: String| -> Error {
            AccessError::InvalidCredential {
                namespace: secret_namespace.clone(),
                name: cred.name.clone(),
                reason,
            }
            .into()
        };

        let payload = secret
            .data
            .as_ref()
            .and_then(|d| d.get(&cred.key))
            .ok_or_else(|| invalid(format!("key '{}' missing from secret data", cred.key)))?;
        let yaml = std::str::from_utf8(&payload.0)
            .map_err(|e| invalid(format!("kubeconfig is not valid UTF-8: {e}")))?;
        let kubeconfig =
            Kubeconfig::from_yaml(yaml).map_err(|e| invalid(format!("kubeconfig parse: {e}")))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| invalid(format!("kubeconfig resolve: {e}")))?;
        let client = Client::try_from(config)
            .map_err(|e| invalid(format!("client construction: {e}")))?;

        // One cheap round-trip proves the credentials actually reach an
        // API server before we hand the client out.
        if let Err(e) = client.apiserver_version().await {
            return Err(AccessError::Unreachable {
                cluster: cluster_name,
                reason: e.to_string(),
            }
            .into());
        }

        println!(
            "🔗 {}",
            format!("Connected to cluster '{cluster_name}' (secret rv {secret_version})").dimmed()
        );
        let mut cache = self.cache.lock().await;
        cache.insert(
            cache_key,
            CachedClient {
                secret_version,
                client: client.clone(),
            },
        );
        Ok(ClusterConnection {
            name: cluster_name,
            client,
        })
    }

    /// Drops any cached client built from the given credential secret.
    pub async fn evict(&self, secret_namespace: &str, secret_name: &str) {
        let mut cache = self.cache.lock().await;
        cache.remove(&format!("{secret_namespace}/{secret_name}"));
    }
}

/// Dynamic access to an arbitrary kind on any connected cluster.
pub fn dynamic_api(client: &Client, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
    match namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, ar),
        None => Api::all_with(client.clone(), ar),
    }
}
