pub mod shutdown;
pub mod wait;

/// Signals to the kubelet readiness probe that this process is serving.
pub fn signal_ready() {
    std::fs::write("/etc/ready", "ready").expect("Failed to write readiness file");
}

pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_else(|_| String::new())
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);
}

/// API group served by the operator's CRDs.
pub const API_GROUP: &str = "dr-syncer.io";

/// Labels recognized on synced objects and on our own managed resources.
pub mod labels {
    /// Set on every object the operator writes to a destination cluster.
    /// Objects without it are never modified.
    pub const MANAGED_BY: &str = "dr-syncer.io/managed-by";

    /// `true` excludes the object from synchronization entirely.
    pub const IGNORE: &str = "dr-syncer.io/ignore";

    /// Destination replica count for a single workload, overriding scaleToZero.
    pub const SCALE_OVERRIDE: &str = "dr-syncer.io/scale-override";

    /// Per-PVC storage class override, takes precedence over spec mappings.
    pub const STORAGE_CLASS: &str = "dr-syncer.io/storage-class";

    /// Per-PVC access mode override, takes precedence over spec mappings.
    pub const ACCESS_MODE: &str = "dr-syncer.io/access-mode";

    /// Per-PVC override of PVCConfig.syncPersistentVolumes ("true"/"false").
    pub const SYNC_PV: &str = "dr-syncer.io/sync-pv";

    /// Per-object immutable-field strategy override.
    pub const IMMUTABLE_HANDLING: &str = "dr-syncer.io/immutable-handling";

    /// Selects agent pods of a RemoteCluster's DaemonSet.
    pub const AGENT: &str = "dr-syncer.io/agent";

    /// Marks the short-lived rsync-server and placeholder pods.
    pub const SYNC_POD: &str = "dr-syncer.io/sync-pod";
}

pub mod annotations {
    /// `true` on a NamespaceMapping forces an immediate pass; cleared after.
    pub const SYNC_NOW: &str = "dr-syncer.io/sync-now";

    /// Content hash of the spec that produced a managed resource.
    pub const SPEC_HASH: &str = "dr-syncer.io/spec-hash";

    pub const CREATED_BY: &str = "dr-syncer.io/created-by";

    /// Name of the source cluster a synced object came from.
    pub const SOURCE_CLUSTER: &str = "dr-syncer.io/source-cluster";

    /// Namespace the object occupied in the source cluster.
    pub const SOURCE_NAMESPACE: &str = "dr-syncer.io/source-namespace";

    /// Client-side apply bookkeeping, stripped before fingerprinting and writes.
    pub const LAST_APPLIED: &str = "kubectl.kubernetes.io/last-applied-configuration";
}
