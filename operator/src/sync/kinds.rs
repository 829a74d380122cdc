use kube::api::{ApiResource, GroupVersionKind};

/// The kinds the synchronizer knows how to carry to a destination cluster.
///
/// Declaration order is the write order within a pass: dependencies first
/// so references resolve at read time on the destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SyncKind {
    Namespace,
    ConfigMap,
    Secret,
    PersistentVolume,
    PersistentVolumeClaim,
    Service,
    Deployment,
    StatefulSet,
    DaemonSet,
    Job,
    CronJob,
    Ingress,
}

impl SyncKind {
    pub const WRITE_ORDER: [SyncKind; 12] = [
        SyncKind::Namespace,
        SyncKind::ConfigMap,
        SyncKind::Secret,
        SyncKind::PersistentVolume,
        SyncKind::PersistentVolumeClaim,
        SyncKind::Service,
        SyncKind::Deployment,
        SyncKind::StatefulSet,
        SyncKind::DaemonSet,
        SyncKind::Job,
        SyncKind::CronJob,
        SyncKind::Ingress,
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            SyncKind::Namespace => "Namespace",
            SyncKind::ConfigMap => "ConfigMap",
            SyncKind::Secret => "Secret",
            SyncKind::PersistentVolume => "PersistentVolume",
            SyncKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            SyncKind::Service => "Service",
            SyncKind::Deployment => "Deployment",
            SyncKind::StatefulSet => "StatefulSet",
            SyncKind::DaemonSet => "DaemonSet",
            SyncKind::Job => "Job",
            SyncKind::CronJob => "CronJob",
            SyncKind::Ingress => "Ingress",
        }
    }

    pub fn group(&self) -> &'static str {
        match self {
            SyncKind::Deployment | SyncKind::StatefulSet | SyncKind::DaemonSet => "apps",
            SyncKind::Job | SyncKind::CronJob => "batch",
            SyncKind::Ingress => "networking.k8s.io",
            _ => "",
        }
    }

    pub fn version(&self) -> &'static str {
        "v1"
    }

    fn plural(&self) -> &'static str {
        match self {
            SyncKind::Namespace => "namespaces",
            SyncKind::ConfigMap => "configmaps",
            SyncKind::Secret => "secrets",
            SyncKind::PersistentVolume => "persistentvolumes",
            SyncKind::PersistentVolumeClaim => "persistentvolumeclaims",
            SyncKind::Service => "services",
            SyncKind::Deployment => "deployments",
            SyncKind::StatefulSet => "statefulsets",
            SyncKind::DaemonSet => "daemonsets",
            SyncKind::Job => "jobs",
            SyncKind::CronJob => "cronjobs",
            SyncKind::Ingress => "ingresses",
        }
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk(self.group(), self.version(), self.kind()),
            self.plural(),
        )
    }

    /// Namespace and PersistentVolume live outside any namespace.
    pub fn cluster_scoped(&self) -> bool {
        matches!(self, SyncKind::Namespace | SyncKind::PersistentVolume)
    }

    /// Kinds subject to scale-to-zero.
    pub fn is_workload(&self) -> bool {
        matches!(self, SyncKind::Deployment | SyncKind::StatefulSet)
    }

    /// Key into ImmutableResourceConfig.resourceOverrides: `Kind.Group`,
    /// with the trailing dot dropped for the core group.
    pub fn kind_group_key(&self) -> String {
        if self.group().is_empty() {
            self.kind().to_string()
        } else {
            format!("{}.{}", self.kind(), self.group())
        }
    }

    /// Parses a resourceTypes entry. Accepts the kind name, its lowercase
    /// form, and the plural form.
    pub fn from_name(name: &str) -> Option<SyncKind> {
        let lowered = name.to_lowercase();
        Self::WRITE_ORDER
            .iter()
            .copied()
            .find(|k| k.kind().to_lowercase() == lowered || k.plural() == lowered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_order_puts_dependencies_first() {
        let order = SyncKind::WRITE_ORDER;
        let pos = |k: SyncKind| order.iter().position(|x| *x == k).unwrap();
        assert!(pos(SyncKind::Namespace) < pos(SyncKind::ConfigMap));
        assert!(pos(SyncKind::Secret) < pos(SyncKind::Deployment));
        assert!(pos(SyncKind::PersistentVolume) < pos(SyncKind::PersistentVolumeClaim));
        assert!(pos(SyncKind::PersistentVolumeClaim) < pos(SyncKind::StatefulSet));
        assert!(pos(SyncKind::Service) < pos(SyncKind::Ingress));
    }

    #[test]
    fn names_parse_in_all_spellings() {
        assert_eq!(SyncKind::from_name("ConfigMap"), Some(SyncKind::ConfigMap));
        assert_eq!(SyncKind::from_name("configmaps"), Some(SyncKind::ConfigMap));
        assert_eq!(SyncKind::from_name("ingress"), Some(SyncKind::Ingress));
        assert_eq!(SyncKind::from_name("ingresses"), Some(SyncKind::Ingress));
        assert_eq!(SyncKind::from_name("Pod"), None);
    }

    #[test]
    fn override_keys_follow_kind_group() {
        assert_eq!(SyncKind::ConfigMap.kind_group_key(), "ConfigMap");
        assert_eq!(SyncKind::Deployment.kind_group_key(), "Deployment.apps");
        assert_eq!(
            SyncKind::Ingress.kind_group_key(),
            "Ingress.networking.k8s.io"
        );
    }

    #[test]
    fn plurals_are_exact() {
        // `Ingress` would pluralize wrongly by naive suffixing.
        assert_eq!(SyncKind::Ingress.api_resource().plural, "ingresses");
    }
}
