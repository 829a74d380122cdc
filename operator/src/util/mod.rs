use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use k8s_openapi::jiff::Timestamp;
use std::time::Duration;

pub mod events;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod patch;

pub(crate) mod colors;

mod error;

pub use error::*;

/// The default interval for requeuing a managed resource.
pub(crate) const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Name of the kubernetes resource manager.
pub(crate) const MANAGER_NAME: &str = "dr-syncer";

pub fn hash_spec<T: serde::Serialize>(spec: &T) -> String {
    use sha2::{Digest, Sha256};
    let spec_bytes = serde_json::to_vec(spec).unwrap();
    let mut hasher = Sha256::new();
    hasher.update(&spec_bytes);
    let result = hasher.finalize();
    hex::encode(result)
}

/// Parses duration strings from CRD specs ("30s", "10m", "1h30m").
pub fn parse_spec_duration(s: &str) -> Result<Duration, Error> {
    Ok(parse_duration::parse(s)?)
}

/// Renders a Duration the way it appears in status fields ("12s", "4m10s").
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{h}h"));
    }
    if m > 0 {
        out.push_str(&format!("{m}m"));
    }
    if s > 0 || out.is_empty() {
        out.push_str(&format!("{s}s"));
    }
    out
}

/// Server-side apply requires apiVersion/kind on the patch body; the
/// k8s-openapi structs do not serialize them, so they are spliced in here.
pub fn apply_body<T: serde::Serialize>(
    obj: &T,
    api_version: &str,
    kind: &str,
) -> Result<serde_json::Value, Error> {
    let mut value = serde_json::to_value(obj)?;
    if let Some(map) = value.as_object_mut() {
        map.insert("apiVersion".to_string(), api_version.into());
        map.insert("kind".to_string(), kind.into());
    }
    Ok(value)
}

pub fn condition(type_: &str, ok: bool, reason: &str, message: &str) -> Condition {
    Condition {
        last_transition_time: Time::from(Timestamp::now()),
        message: message.to_string(),
        observed_generation: None,
        reason: reason.to_string(),
        status: if ok { "True" } else { "False" }.to_string(),
        type_: type_.to_string(),
    }
}

/// True when applying this condition would flip its status or reason,
/// i.e. a transition worth publishing an Event for.
pub fn condition_transitions(conditions: &[Condition], candidate: &Condition) -> bool {
    match conditions.iter().find(|c| c.type_ == candidate.type_) {
        Some(existing) => {
            existing.status != candidate.status || existing.reason != candidate.reason
        }
        None => true,
    }
}

/// Replaces the condition of the same type, keeping the original
/// transition time when the status did not actually flip.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            let transition = if existing.status == condition.status {
                existing.last_transition_time.clone()
            } else {
                condition.last_transition_time.clone()
            };
            *existing = Condition {
                last_transition_time: transition,
                ..condition
            };
        }
        None => conditions.push(condition),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditions_keep_transition_time_when_status_is_stable() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, condition("Ready", true, "Synced", "ok"));
        let original = conditions[0].last_transition_time.clone();
        set_condition(&mut conditions, condition("Ready", true, "Synced", "still ok"));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, original);
        assert_eq!(conditions[0].message, "still ok");
        set_condition(&mut conditions, condition("Ready", false, "Failed", "broke"));
        assert_eq!(conditions[0].status, "False");
    }

    #[test]
    fn transition_detection_ignores_message_churn() {
        let mut conditions = Vec::new();
        let ready = condition("Ready", true, "Synced", "ok");
        assert!(condition_transitions(&conditions, &ready));
        set_condition(&mut conditions, ready);
        // Same status+reason, new message: no transition.
        assert!(!condition_transitions(
            &conditions,
            &condition("Ready", true, "Synced", "still ok")
        ));
        assert!(condition_transitions(
            &conditions,
            &condition("Ready", false, "Failed", "broke")
        ));
        assert!(condition_transitions(
            &conditions,
            &condition("Ready", true, "Paused", "suspended")
        ));
    }

    #[test]
    fn durations_format_compactly() {
        assert_eq!(format_duration(Duration::from_secs(12)), "12s");
        assert_eq!(format_duration(Duration::from_secs(250)), "4m10s");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h");
        assert_eq!(format_duration(Duration::from_secs(0)), "0s");
    }

    #[test]
    fn spec_durations_parse() {
        assert_eq!(parse_spec_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_spec_duration("10m").unwrap(), Duration::from_secs(600));
        assert!(parse_spec_duration("never").is_err());
    }

    #[test]
    fn hash_is_stable_for_equal_specs() {
        let a = serde_json::json!({"replicas": 3, "image": "nginx"});
        let b = serde_json::json!({"image": "nginx", "replicas": 3});
        // serde_json maps are sorted, so field order does not matter
        assert_eq!(hash_spec(&a), hash_spec(&b));
    }
}
