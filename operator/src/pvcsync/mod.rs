pub mod exec;
pub mod keys;
pub mod orchestrator;
pub mod pods;

pub use orchestrator::Orchestrator;

/// SSH identity the agents accept connections for.
pub(crate) const SSH_USER: &str = "root";

/// Where the cluster-pair private key is mounted inside agent pods.
pub(crate) const PAIR_KEY_PATH: &str = "/etc/dr-syncer/pair/id_ed25519";

/// Absolute ceiling on one PVC replication attempt including retries;
/// a stuck reconcile cannot hold pods past this.
pub(crate) const SYNC_DEADLINE: std::time::Duration = std::time::Duration::from_secs(3600);
