//! Broker fan-out and subscription registry tests

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use khala_broker::{Broker, HandlerError, MessageHandler, Subscriber};
use khala_test_utils::{record, Recorder};
use khala_core::Payload;

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn publish_reaches_matching_subscriber_exactly_once() {
    let broker = Broker::new(false);
    let recorder = record(&broker, &["matriarch/1.marsara/up"]);

    broker.publish(
        "matriarch/1.marsara/up",
        Payload::Json(json!({"state": "up", "timestamp": 1700000000})),
    );

    assert!(recorder.wait_for(1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.count(), 1);

    let (topic, payload) = recorder.first().unwrap();
    assert_eq!(topic, "matriarch/1.marsara/up");
    let Payload::Json(value) = payload else {
        panic!("expected a typed payload");
    };
    assert_eq!(value["state"], "up");
}

#[tokio::test]
async fn wildcard_subscription_sees_all_devices() {
    let broker = Broker::new(false);
    let recorder = record(&broker, &["pylon/+/wan/ping"]);

    broker.publish("pylon/1.marsara/wan/ping", b"{}".to_vec());
    broker.publish("pylon/2.auir/wan/ping", b"{}".to_vec());
    broker.publish("pylon/1.marsara/wifi/poll", b"{}".to_vec());

    assert!(recorder.wait_for(2, WAIT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.count(), 2);
}

#[tokio::test]
async fn duplicate_subscription_is_idempotent() {
    let broker = Broker::new(false);
    let recorder = Arc::new(Recorder::new());
    let handler = broker.register_handler(recorder.clone() as Arc<dyn MessageHandler>);

    broker.subscribe("a/b/c", handler.clone());
    broker.subscribe("a/b/c", handler);
    assert_eq!(broker.subscription_count(), 1);

    broker.publish("a/b/c", b"x".to_vec());
    assert!(recorder.wait_for(1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.count(), 1);
}

#[tokio::test]
async fn unsubscribe_stops_deliveries() {
    let broker = Broker::new(false);
    let recorder = Arc::new(Recorder::new());
    let handler = broker.register_handler(recorder.clone() as Arc<dyn MessageHandler>);
    broker.subscribe("a/b", handler.clone());

    broker.publish("a/b", b"1".to_vec());
    assert!(recorder.wait_for(1, WAIT).await);

    broker.unsubscribe("a/b", &Subscriber::Handler(handler));
    broker.publish("a/b", b"2".to_vec());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.count(), 1);
}

struct Failing;

impl MessageHandler for Failing {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn handle_message(&self, _topic: &str, _payload: Payload) -> Result<(), HandlerError> {
        Err("boom".into())
    }
}

#[tokio::test]
async fn failing_subscriber_does_not_block_others() {
    let broker = Broker::new(false);
    let failing = broker.register_handler(Arc::new(Failing));
    broker.subscribe("pylon/+/exception", failing);
    let recorder = record(&broker, &["pylon/+/exception"]);

    broker.publish("pylon/1.marsara/exception", b"{}".to_vec());

    assert!(recorder.wait_for(1, WAIT).await);
}

#[tokio::test]
async fn deliveries_to_one_subscriber_preserve_publish_order() {
    let broker = Broker::new(false);
    let recorder = record(&broker, &["seq/#"]);

    for i in 0..100u32 {
        broker.publish("seq/values", Payload::Json(json!(i)));
    }

    assert!(recorder.wait_for(100, WAIT).await);
    for i in 0..100u32 {
        let (_, payload) = recorder.get(i as usize).unwrap();
        let Payload::Json(value) = payload else {
            panic!("expected a typed payload");
        };
        assert_eq!(value, json!(i));
    }
}

#[tokio::test]
async fn slash_prefixed_topics_are_normalized_when_enabled() {
    let broker = Broker::new(true);
    let recorder = record(&broker, &["pylon/+/up"]);

    broker.publish("/pylon/1.marsara/up", b"x".to_vec());

    assert!(recorder.wait_for(1, WAIT).await);
    let (topic, _) = recorder.first().unwrap();
    assert_eq!(topic, "pylon/1.marsara/up");
}

#[tokio::test]
async fn slash_prefix_disabled_leaves_topics_alone() {
    let broker = Broker::new(false);
    let recorder = record(&broker, &["pylon/+/up"]);

    broker.publish("/pylon/1.marsara/up", b"x".to_vec());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.count(), 0);
}

#[tokio::test]
async fn remove_drops_every_subscription_of_a_subscriber() {
    let broker = Broker::new(false);
    let recorder = Arc::new(Recorder::new());
    let handler = broker.register_handler(recorder.clone() as Arc<dyn MessageHandler>);
    broker.subscribe("a/1", handler.clone());
    broker.subscribe("a/2", handler.clone());
    assert_eq!(broker.subscription_count(), 2);

    broker.remove(&Subscriber::Handler(handler).id());
    assert_eq!(broker.subscription_count(), 0);
}
