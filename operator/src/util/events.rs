use k8s_openapi::api::core::v1::Event;
use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, jiff::Timestamp};
use kube::{Api, Client, Resource, ResourceExt, api::PostParams};
use owo_colors::OwoColorize;

/// Publishes a Kubernetes Event against one of our CRD instances. Event
/// delivery is best-effort; a failure is logged and swallowed so it can
/// never fail a reconcile.
pub async fn emit<K>(client: &Client, instance: &K, event_type: &str, reason: &str, message: &str)
where
    K: Resource<DynamicType = ()>,
{
    let Some(namespace) = instance.namespace() else {
        return;
    };
    let events: Api<Event> = Api::namespaced(client.clone(), &namespace);
    let now = Time::from(Timestamp::now());
    let event = Event {
        metadata: kube::api::ObjectMeta {
            generate_name: Some(format!("{}-", instance.name_any())),
            namespace: Some(namespace),
            ..Default::default()
        },
        type_: Some(event_type.to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        involved_object: instance.object_ref(&()),
        first_timestamp: Some(now.clone()),
        last_timestamp: Some(now),
        count: Some(1),
        ..Default::default()
    };
    if let Err(e) = events.create(&PostParams::default(), &event).await {
        eprintln!("{}", format!("event emit failed: {e}").yellow());
    }
}
