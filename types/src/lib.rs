use k8s_openapi::api::core::v1::{ResourceRequirements, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::{fmt, str::FromStr};

fn default_true() -> bool {
    true
}

fn default_kubeconfig_key() -> String {
    "kubeconfig".to_string()
}

fn default_ssh_port() -> u16 {
    2222
}

fn default_agent_image() -> String {
    "supporttools/dr-syncer-agent:latest".to_string()
}

fn default_agent_concurrency() -> u32 {
    4
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_delay() -> String {
    "30s".to_string()
}

fn default_max_delay() -> String {
    "10m".to_string()
}

fn default_check_interval() -> String {
    "1m".to_string()
}

fn default_ssh_timeout() -> String {
    "10s".to_string()
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_interval() -> String {
    "5s".to_string()
}

fn default_connectivity_timeout_seconds() -> u64 {
    60
}

fn default_resource_types() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_sync_concurrency() -> u32 {
    4
}

fn default_binding_timeout() -> String {
    "5m".to_string()
}

fn default_drain_timeout() -> String {
    "5m".to_string()
}

fn default_force_delete_timeout() -> String {
    "5m".to_string()
}

/// Reference to an opaque secret holding a kubeconfig payload.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRef {
    pub name: String,
    pub namespace: Option<String>,
    /// Key within the secret's data; defaults to `kubeconfig`.
    #[serde(default = "default_kubeconfig_key")]
    pub key: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Duration string, e.g. "30s".
    #[serde(default = "default_initial_delay")]
    pub initial_delay: String,
    /// Duration string, e.g. "10m".
    #[serde(default = "default_max_delay")]
    pub max_delay: String,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    pub name: String,
    pub namespace: Option<String>,
}

/// Tuning for the per-node agent DaemonSet deployed into a remote cluster.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_agent_image")]
    pub image: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    /// Secret holding the agent SSH host keys; generated when absent.
    pub ssh_key_secret_ref: Option<SecretRef>,
    /// Cap on concurrent rsync operations bastioned through one agent.
    #[serde(default = "default_agent_concurrency")]
    pub concurrency: u32,
    #[serde(default)]
    pub retry: RetryPolicy,
    pub node_selector: Option<BTreeMap<String, String>>,
    pub tolerations: Option<Vec<Toleration>>,
    pub resources: Option<ResourceRequirements>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default = "default_true")]
    pub host_network: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            image: default_agent_image(),
            ssh_port: default_ssh_port(),
            ssh_key_secret_ref: None,
            concurrency: default_agent_concurrency(),
            retry: RetryPolicy::default(),
            node_selector: None,
            tolerations: None,
            resources: None,
            privileged: false,
            host_network: true,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthConfig {
    /// Duration string between probes, e.g. "1m".
    #[serde(default = "default_check_interval")]
    pub check_interval: String,
    /// Per-connection SSH timeout, e.g. "10s".
    #[serde(default = "default_ssh_timeout")]
    pub ssh_timeout: String,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_interval")]
    pub retry_interval: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            ssh_timeout: default_ssh_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_interval: default_retry_interval(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ClusterHealth {
    Healthy,
    Degraded,
    Unreachable,
}

impl fmt::Display for ClusterHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterHealth::Healthy => write!(f, "Healthy"),
            ClusterHealth::Degraded => write!(f, "Degraded"),
            ClusterHealth::Unreachable => write!(f, "Unreachable"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, JsonSchema, Default)]
pub enum AgentPhase {
    #[default]
    Pending,
    Deploying,
    Running,
    Degraded,
    Failed,
}

impl fmt::Display for AgentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentPhase::Pending => write!(f, "Pending"),
            AgentPhase::Deploying => write!(f, "Deploying"),
            AgentPhase::Running => write!(f, "Running"),
            AgentPhase::Degraded => write!(f, "Degraded"),
            AgentPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Observed state of one agent pod, keyed by node.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentNodeStatus {
    pub node: String,
    pub ready: bool,
    pub last_heartbeat: Option<Time>,
    pub ssh_connected: bool,
    pub pod_phase: Option<String>,
    pub message: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RemoteClusterStatus {
    pub health: Option<ClusterHealth>,
    pub last_sync_time: Option<Time>,
    #[serde(default)]
    pub agent_phase: AgentPhase,
    #[serde(default)]
    pub agent_nodes: Vec<AgentNodeStatus>,
    pub last_deployment_time: Option<Time>,
    #[serde(default)]
    pub failed_syncs: u32,
    pub message: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub last_updated: Option<Time>,
}

/// Handle to an external cluster plus its agent configuration.
#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "dr-syncer.io",
    version = "v1alpha1",
    kind = "RemoteCluster",
    plural = "remoteclusters",
    shortname = "rc",
    derive = "PartialEq",
    status = "RemoteClusterStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.health\", \"name\": \"HEALTH\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.agentPhase\", \"name\": \"AGENT\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.lastUpdated\", \"name\": \"AGE\", \"type\": \"date\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct RemoteClusterSpec {
    /// Opaque secret holding the kubeconfig used to reach this cluster.
    pub credential_ref: CredentialRef,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

/// Names for the public/private key entries of a cluster-pair secret.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SshKeySecretRef {
    pub name: String,
    pub namespace: Option<String>,
    pub public_key: Option<String>,
    pub private_key: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, JsonSchema, Default)]
pub enum ClusterMappingPhase {
    #[default]
    Pending,
    Connecting,
    Connected,
    Failed,
}

impl FromStr for ClusterMappingPhase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(ClusterMappingPhase::Pending),
            "Connecting" => Ok(ClusterMappingPhase::Connecting),
            "Connected" => Ok(ClusterMappingPhase::Connected),
            "Failed" => Ok(ClusterMappingPhase::Failed),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ClusterMappingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterMappingPhase::Pending => write!(f, "Pending"),
            ClusterMappingPhase::Connecting => write!(f, "Connecting"),
            ClusterMappingPhase::Connected => write!(f, "Connected"),
            ClusterMappingPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Outcome of one source-node → target-node SSH probe.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeConnectionStatus {
    pub source_node: String,
    pub target_node: String,
    pub connected: bool,
    pub error: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMappingStatus {
    #[serde(default)]
    pub phase: ClusterMappingPhase,
    #[serde(default)]
    pub connection_status: Vec<NodeConnectionStatus>,
    pub last_verified: Option<Time>,
    #[serde(default)]
    pub consecutive_failures: u32,
    pub last_attempt_time: Option<Time>,
    pub message: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub last_updated: Option<Time>,
}

/// A directed cluster pair with shared SSH trust.
#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "dr-syncer.io",
    version = "v1alpha1",
    kind = "ClusterMapping",
    plural = "clustermappings",
    shortname = "cm",
    derive = "PartialEq",
    status = "ClusterMappingStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.sourceCluster\", \"name\": \"SOURCE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.targetCluster\", \"name\": \"TARGET\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.lastVerified\", \"name\": \"VERIFIED\", \"type\": \"date\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMappingSpec {
    pub source_cluster: String,
    pub target_cluster: String,
    pub ssh_key_secret_ref: Option<SshKeySecretRef>,
    #[serde(default = "default_true")]
    pub verify_connectivity: bool,
    #[serde(default = "default_connectivity_timeout_seconds")]
    pub connectivity_timeout_seconds: u64,
    #[serde(default)]
    pub paused: bool,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, JsonSchema, Default)]
pub enum ReplicationMode {
    #[default]
    Scheduled,
    Continuous,
    Manual,
}

impl fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationMode::Scheduled => write!(f, "Scheduled"),
            ReplicationMode::Continuous => write!(f, "Continuous"),
            ReplicationMode::Manual => write!(f, "Manual"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageClassMapping {
    /// Source class; an empty string matches PVCs with no class set.
    #[serde(default)]
    pub from: String,
    pub to: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessModeMapping {
    pub from: String,
    pub to: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PvcConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub preserve_volume_attributes: bool,
    #[serde(default)]
    pub sync_persistent_volumes: bool,
    /// Replicate PVC contents through the agent plane.
    #[serde(default)]
    pub sync_data: bool,
    #[serde(default)]
    pub storage_class_mappings: Vec<StorageClassMapping>,
    #[serde(default)]
    pub access_mode_mappings: Vec<AccessModeMapping>,
    /// PVC spec attributes carried over verbatim; everything else not
    /// implied by the source spec is cleared on the destination.
    #[serde(default)]
    pub preserved_attributes: Vec<String>,
    #[serde(default = "default_true")]
    pub wait_for_binding: bool,
    #[serde(default = "default_binding_timeout")]
    pub binding_timeout: String,
}

impl Default for PvcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            preserve_volume_attributes: false,
            sync_persistent_volumes: false,
            sync_data: false,
            storage_class_mappings: Vec::new(),
            access_mode_mappings: Vec::new(),
            preserved_attributes: Vec::new(),
            wait_for_binding: true,
            binding_timeout: default_binding_timeout(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum ImmutableHandling {
    #[default]
    NoChange,
    Recreate,
    RecreateWithPodDrain,
    PartialUpdate,
    ForceUpdate,
}

impl FromStr for ImmutableHandling {
    type Err = ();

    /// Accepts the kebab-case forms used by the
    /// `dr-syncer.io/immutable-handling` label.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no-change" => Ok(ImmutableHandling::NoChange),
            "recreate" => Ok(ImmutableHandling::Recreate),
            "recreate-with-drain" => Ok(ImmutableHandling::RecreateWithPodDrain),
            "partial-update" => Ok(ImmutableHandling::PartialUpdate),
            "force-update" => Ok(ImmutableHandling::ForceUpdate),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ImmutableHandling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImmutableHandling::NoChange => write!(f, "no-change"),
            ImmutableHandling::Recreate => write!(f, "recreate"),
            ImmutableHandling::RecreateWithPodDrain => write!(f, "recreate-with-drain"),
            ImmutableHandling::PartialUpdate => write!(f, "partial-update"),
            ImmutableHandling::ForceUpdate => write!(f, "force-update"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImmutableResourceConfig {
    #[serde(default)]
    pub default_handling: ImmutableHandling,
    /// Per-kind overrides keyed by `Kind.Group` (e.g. `Deployment.apps`).
    #[serde(default)]
    pub resource_overrides: BTreeMap<String, ImmutableHandling>,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,
    #[serde(default = "default_force_delete_timeout")]
    pub force_delete_timeout: String,
}

impl Default for ImmutableResourceConfig {
    fn default() -> Self {
        Self {
            default_handling: ImmutableHandling::default(),
            resource_overrides: BTreeMap::new(),
            drain_timeout: default_drain_timeout(),
            force_delete_timeout: default_force_delete_timeout(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressConfig {
    #[serde(default = "default_true")]
    pub preserve_annotations: bool,
    #[serde(default = "default_true")]
    pub preserve_tls: bool,
    #[serde(default = "default_true")]
    pub preserve_backends: bool,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            preserve_annotations: true,
            preserve_tls: true,
            preserve_backends: true,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceConfig {
    #[serde(default = "default_true")]
    pub create_namespace: bool,
    #[serde(default = "default_true")]
    pub preserve_labels: bool,
    #[serde(default)]
    pub preserve_annotations: bool,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            create_namespace: true,
            preserve_labels: true,
            preserve_annotations: false,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMappingRef {
    pub name: String,
    pub namespace: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, JsonSchema, Default)]
pub enum SyncPhase {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl FromStr for SyncPhase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(SyncPhase::Pending),
            "Running" => Ok(SyncPhase::Running),
            "Completed" => Ok(SyncPhase::Completed),
            "Failed" => Ok(SyncPhase::Failed),
            _ => Err(()),
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncPhase::Pending => write!(f, "Pending"),
            SyncPhase::Running => write!(f, "Running"),
            SyncPhase::Completed => write!(f, "Completed"),
            SyncPhase::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, JsonSchema, Default)]
pub enum ResourcePhase {
    #[default]
    Pending,
    InProgress,
    Synced,
    Failed,
}

impl fmt::Display for ResourcePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourcePhase::Pending => write!(f, "Pending"),
            ResourcePhase::InProgress => write!(f, "InProgress"),
            ResourcePhase::Synced => write!(f, "Synced"),
            ResourcePhase::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub total: u32,
    pub completed: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub total_resources: u32,
    pub successful: u32,
    pub failed: u32,
    /// Wall time of the last pass, e.g. "12s".
    pub last_sync_duration: Option<String>,
}

/// Per-kind rollup of the last pass.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGroupStatus {
    pub kind: String,
    pub total: u32,
    pub synced: u32,
    pub failed: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSyncStatus {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub status: ResourcePhase,
    pub last_sync_time: Option<Time>,
    pub error: Option<String>,
}

/// Per-resource detail retained for significant resources (workloads,
/// PVCs, anything that failed).
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DetailedResourceStatus {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub status: ResourcePhase,
    pub message: Option<String>,
    pub duration: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorCategoryCount {
    pub category: String,
    pub count: u32,
    pub last_occurred: Option<Time>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryStatus {
    pub next_retry_time: Option<Time>,
    pub retries_remaining: u32,
    /// Duration string of the current backoff window, e.g. "4m".
    pub backoff_duration: Option<String>,
}

/// Source replica count captured at the moment of the first sync. Never
/// overwritten on later passes so a failover operator can restore it.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentScale {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub original_replicas: i32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceMappingStatus {
    #[serde(default)]
    pub phase: SyncPhase,
    pub last_sync_time: Option<Time>,
    pub next_sync_time: Option<Time>,
    pub last_watch_event: Option<Time>,
    pub sync_progress: Option<SyncProgress>,
    pub sync_stats: Option<SyncStats>,
    #[serde(default)]
    pub resource_groups: Vec<ResourceGroupStatus>,
    #[serde(default)]
    pub detailed_status: Vec<DetailedResourceStatus>,
    #[serde(default)]
    pub error_categories: Vec<ErrorCategoryCount>,
    pub retry_status: Option<RetryStatus>,
    #[serde(default)]
    pub resource_status: Vec<ResourceSyncStatus>,
    pub last_error: Option<String>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub deployment_scales: Vec<DeploymentScale>,
    pub last_updated: Option<Time>,
}

/// One replication job: what to replicate, how often, how to transform.
#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "dr-syncer.io",
    version = "v1alpha1",
    kind = "NamespaceMapping",
    plural = "namespacemappings",
    shortname = "nm",
    derive = "PartialEq",
    status = "NamespaceMappingStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.sourceNamespace\", \"name\": \"SOURCE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".spec.destinationNamespace\", \"name\": \"DEST\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.lastSyncTime\", \"name\": \"LAST-SYNC\", \"type\": \"date\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.nextSyncTime\", \"name\": \"NEXT-SYNC\", \"type\": \"date\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceMappingSpec {
    /// Either a reference to a ClusterMapping or an explicit cluster pair.
    pub cluster_mapping_ref: Option<ClusterMappingRef>,
    pub source_cluster: Option<String>,
    pub destination_cluster: Option<String>,
    pub source_namespace: String,
    pub destination_namespace: String,
    /// Kinds to replicate; `"*"` means all syncable kinds.
    #[serde(default = "default_resource_types")]
    pub resource_types: Vec<String>,
    #[serde(default)]
    pub replication_mode: ReplicationMode,
    /// Cron expression; required for Scheduled mode.
    pub schedule: Option<String>,
    #[serde(default)]
    pub scale_to_zero: bool,
    #[serde(default)]
    pub paused: bool,
    /// Bounded parallelism for writes within one pass.
    #[serde(default = "default_sync_concurrency")]
    pub concurrency: u32,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub pvc_config: PvcConfig,
    #[serde(default)]
    pub immutable_resource_config: ImmutableResourceConfig,
    #[serde(default)]
    pub ingress_config: IngressConfig,
    #[serde(default)]
    pub namespace_config: NamespaceConfig,
}

impl NamespaceMappingSpec {
    /// The explicit cluster pair, when one is given instead of a
    /// ClusterMapping reference.
    pub fn explicit_clusters(&self) -> Option<(&str, &str)> {
        match (&self.source_cluster, &self.destination_cluster) {
            (Some(src), Some(dst)) => Some((src.as_str(), dst.as_str())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immutable_handling_parses_label_values() {
        assert_eq!(
            "recreate-with-drain".parse::<ImmutableHandling>(),
            Ok(ImmutableHandling::RecreateWithPodDrain)
        );
        assert_eq!(
            "partial-update".parse::<ImmutableHandling>(),
            Ok(ImmutableHandling::PartialUpdate)
        );
        assert!("delete".parse::<ImmutableHandling>().is_err());
    }

    #[test]
    fn spec_defaults_round_trip() {
        let spec: NamespaceMappingSpec = serde_json::from_value(serde_json::json!({
            "sourceNamespace": "prod",
            "destinationNamespace": "prod-dr",
        }))
        .unwrap();
        assert_eq!(spec.resource_types, vec!["*".to_string()]);
        assert_eq!(spec.replication_mode, ReplicationMode::Scheduled);
        assert_eq!(spec.concurrency, 4);
        assert!(spec.pvc_config.enabled);
        assert!(!spec.pvc_config.sync_data);
        assert_eq!(
            spec.immutable_resource_config.default_handling,
            ImmutableHandling::NoChange
        );
    }

    #[test]
    fn agent_defaults_follow_wire_protocol() {
        let agent: AgentConfig = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(agent.enabled);
        assert_eq!(agent.ssh_port, 2222);
        assert!(agent.host_network);
    }

    #[test]
    fn retry_policy_defaults() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.max_retries, 5);
        assert_eq!(retry.initial_delay, "30s");
        assert_eq!(retry.max_delay, "10m");
    }
}
