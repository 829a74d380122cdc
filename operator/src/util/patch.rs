use super::MANAGER_NAME;
use drsync_types::*;
use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, jiff::Timestamp};
use kube::{
    Api, Client, Error,
    api::{Patch, PatchParams, Resource},
    core::NamespaceResourceScope,
};
use owo_colors::OwoColorize;
use serde::{Serialize, de::DeserializeOwned};
use std::{clone::Clone, fmt::Debug};

/// Bound on refetch-and-repatch attempts after a resourceVersion conflict.
const CONFLICT_RETRIES: usize = 3;

pub trait Object<S: Status> {
    /// Returns a mutable reference to the status object, initializing
    /// it with the default value if it does not exist.
    fn mut_status(&mut self) -> &mut S;
}

pub trait Status {
    /// Sets the last updated timestamp to the given value.
    fn set_last_updated(&mut self, last_updated: Time);
}

impl Object<RemoteClusterStatus> for RemoteCluster {
    fn mut_status(&mut self) -> &mut RemoteClusterStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

impl Status for RemoteClusterStatus {
    fn set_last_updated(&mut self, last_updated: Time) {
        self.last_updated = Some(last_updated);
    }
}

impl Object<ClusterMappingStatus> for ClusterMapping {
    fn mut_status(&mut self) -> &mut ClusterMappingStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

impl Status for ClusterMappingStatus {
    fn set_last_updated(&mut self, last_updated: Time) {
        self.last_updated = Some(last_updated);
    }
}

impl Object<NamespaceMappingStatus> for NamespaceMapping {
    fn mut_status(&mut self) -> &mut NamespaceMappingStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

impl Status for NamespaceMappingStatus {
    fn set_last_updated(&mut self, last_updated: Time) {
        self.last_updated = Some(last_updated);
    }
}

/// Patch the resource's status object with the provided function.
/// The function is passed a mutable reference to the status object,
/// which is to be mutated in-place. Move closures are supported.
pub async fn patch_status<S: Status, T>(
    client: Client,
    instance: &T,
    f: impl FnOnce(&mut S),
) -> Result<T, Error>
where
    <T as Resource>::DynamicType: Default,
    T: Clone
        + Resource
        + Object<S>
        + Serialize
        + DeserializeOwned
        + Debug
        + Resource<Scope = NamespaceResourceScope>,
{
    let patch = Patch::Json::<T>({
        let mut modified = instance.clone();
        let status = modified.mut_status();
        f(status);
        status.set_last_updated(Time::from(Timestamp::now()));
        json_patch::diff(
            &serde_json::to_value(instance).unwrap(),
            &serde_json::to_value(&modified).unwrap(),
        )
    });
    let name = instance.meta().name.as_deref().unwrap();
    let namespace = instance.meta().namespace.as_deref().unwrap();
    let api: Api<T> = Api::namespaced(client, namespace);
    api.patch_status(name, &PatchParams::apply(MANAGER_NAME), &patch)
        .await
}

/// Like [`patch_status`], but on a resourceVersion conflict the object is
/// refetched and the mutation re-applied, up to a small bound. The closure
/// therefore runs against the freshest status each attempt.
pub async fn patch_status_with_retry<S: Status, T>(
    client: Client,
    instance: &T,
    f: impl Fn(&mut S) + Clone,
) -> Result<T, Error>
where
    <T as Resource>::DynamicType: Default,
    T: Clone
        + Resource
        + Object<S>
        + Serialize
        + DeserializeOwned
        + Debug
        + Resource<Scope = NamespaceResourceScope>,
{
    let name = instance.meta().name.as_deref().unwrap().to_string();
    let namespace = instance.meta().namespace.as_deref().unwrap().to_string();
    let mut current = instance.clone();
    let mut attempt = 0;
    loop {
        match patch_status(client.clone(), &current, f.clone()).await {
            Ok(v) => return Ok(v),
            Err(Error::Api(ae)) if ae.code == 409 && attempt < CONFLICT_RETRIES => {
                attempt += 1;
                let api: Api<T> = Api::namespaced(client.clone(), &namespace);
                let fresh = api.get(&name).await?;
                eprintln!(
                    "{}",
                    format!(
                        "status conflict on '{}/{}' (rv {:?} → {:?}), retrying ({}/{})",
                        namespace,
                        name,
                        current.meta().resource_version,
                        fresh.meta().resource_version,
                        attempt,
                        CONFLICT_RETRIES,
                    )
                    .yellow()
                );
                current = fresh;
            }
            Err(e) => return Err(e),
        }
    }
}
