use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

fn counting_handler() -> (Arc<dyn MessageHandler>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    let handler: Arc<dyn MessageHandler> = Arc::new(move |_: &Message| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    (handler, count)
}

#[test]
fn test_topic_matches_exact() {
    assert!(topic_matches("a/b/c", "a/b/c"));
    assert!(!topic_matches("a/b/c", "a/b"));
    assert!(!topic_matches("a/b", "a/b/c"));
}

#[test]
fn test_topic_matches_single_level_wildcard() {
    assert!(topic_matches("a/+/c", "a/b/c"));
    assert!(!topic_matches("a/+/c", "a/b/d/c"));
    assert!(topic_matches("a/+", "a/"));
}

#[test]
fn test_topic_matches_multi_level_wildcard() {
    assert!(topic_matches("a/#", "a/b/c"));
    assert!(topic_matches("a/#", "a"));
    assert!(!topic_matches("a/#/c", "a/b/c")); // '#' must be last
}

#[test]
fn test_topic_matches_dollar_topics() {
    assert!(!topic_matches("#", "$aws/certificates/create/json/accepted"));
    assert!(!topic_matches("+/certificates/#", "$aws/certificates/create/json"));
    assert!(topic_matches(
        "$aws/certificates/create/json/+",
        "$aws/certificates/create/json/rejected"
    ));
}

#[test]
fn test_qos_from_level() {
    assert_eq!(QoS::try_from(0).unwrap(), QoS::AtMostOnce);
    assert_eq!(QoS::try_from(1).unwrap(), QoS::AtLeastOnce);
    assert_eq!(QoS::try_from(2).unwrap(), QoS::ExactlyOnce);
    assert!(QoS::try_from(3).is_err());
    assert_eq!(QoS::default().level(), 1);
}

#[test]
fn test_mqtt_config_default() {
    let config = MqttConfig::default();
    assert_eq!(config.port, 8883);
    assert_eq!(config.disconnect_grace(), Duration::from_millis(250));
    assert_eq!(config.client_id_for("SN-1"), "device-SN-1");
}

#[test]
fn test_mqtt_config_explicit_client_id() {
    let config = MqttConfig {
        client_id: Some("factory-line-3".to_string()),
        ..Default::default()
    };
    assert_eq!(config.client_id_for("SN-1"), "factory-line-3");
}

#[test]
fn test_message_payload_str() {
    let message = Message::new("t", "quota exceeded", QoS::AtLeastOnce);
    assert_eq!(message.payload_str(), "quota exceeded");
}

#[tokio::test]
async fn test_subscription_table_dispatch_matching_only() {
    let table = SubscriptionTable::new();
    let (accepted, accepted_count) = counting_handler();
    let (rejected, rejected_count) = counting_handler();
    table.insert("x/accepted", accepted).await;
    table.insert("x/rejected", rejected).await;

    let invoked = table
        .dispatch(&Message::new("x/accepted", "{}", QoS::AtLeastOnce))
        .await;

    assert_eq!(invoked, 1);
    assert_eq!(accepted_count.load(Ordering::SeqCst), 1);
    assert_eq!(rejected_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_subscription_table_remove() {
    let table = SubscriptionTable::new();
    let (first, _) = counting_handler();
    let (second, _) = counting_handler();
    let (other, _) = counting_handler();
    table.insert("x/accepted", first).await;
    table.insert("x/accepted", second).await;
    table.insert("x/rejected", other).await;

    assert_eq!(table.remove("x/accepted").await, 2);
    assert_eq!(table.len().await, 1);
    assert_eq!(table.remove("x/accepted").await, 0);
}

#[tokio::test]
async fn test_subscription_table_handler_may_reenter() {
    let table = Arc::new(SubscriptionTable::new());
    let inner = Arc::clone(&table);
    let handler: Arc<dyn MessageHandler> = Arc::new(move |_: &Message| {
        // A handler that inspects the table must not deadlock the dispatcher.
        assert!(inner.entries.try_read().is_ok());
    });
    table.insert("t", handler).await;

    assert_eq!(
        table.dispatch(&Message::new("t", "", QoS::AtMostOnce)).await,
        1
    );
}
