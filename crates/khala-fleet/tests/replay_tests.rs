//! Subscribe-replay: a fresh control subscriber receives current snapshots
//! computed from live state

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use khala_broker::{Broker, LogErrorSink, Server};
use khala_test_utils::TestClient;
use khala_core::packet::{ConnectReturnCode, Packet};
use khala_fleet::handlers::ping::{self, PingReport};
use khala_fleet::{handlers, FormationMap};

const FORMATION_ID: &str = "00000000-0000-0000-0000-000000000001";
const DEVICE: &str = "1.marsara";

async fn start_control(broker: Arc<Broker>) -> SocketAddr {
    let server = Server::bind(
        "127.0.0.1:0",
        broker,
        Duration::from_secs(5),
        Arc::new(LogErrorSink),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

async fn connected_control(addr: SocketAddr) -> TestClient {
    let mut client = TestClient::connect(addr).await.unwrap();
    client.send_control_connect("support-ui").await.unwrap();
    let Packet::Connack(ack) = client.recv().await.unwrap() else {
        panic!("expected CONNACK");
    };
    assert_eq!(ack.return_code, ConnectReturnCode::Accepted);
    client
}

#[tokio::test]
async fn subscribe_replays_persisted_ping_snapshot() {
    let broker = Arc::new(Broker::new(false));
    let formations = Arc::new(FormationMap::new());
    handlers::ping::register(&broker, &formations);

    formations.add_device(DEVICE, FORMATION_ID);
    let report: PingReport = serde_json::from_value(json!({
        "version": 1,
        "timestamp": 1700000000,
        "internet": {
            "ping": {"sent": 10, "received": 9, "loss_now": 0.1, "loss_24_hours": 0.1},
            "dns": {"sent": 5, "received": 5, "loss_now": 0.0, "loss_24_hours": 0.0}
        },
        "gateway": {"ping": {"sent": 4, "received": 4, "loss_now": 0.0, "loss_24_hours": 0.0}},
        "tunnel": {"ping": {"sent": 2, "received": 2, "loss_now": 0.0, "loss_24_hours": 0.0}}
    }))
    .unwrap();
    formations
        .write()
        .put_device_state(FORMATION_ID, DEVICE, ping::KEY, report);

    let addr = start_control(Arc::clone(&broker)).await;
    let mut client = connected_control(addr).await;
    client.subscribe(&["matriarch/1.marsara/#"]).await.unwrap();

    let Packet::Suback(suback) = client.recv().await.unwrap() else {
        panic!("expected SUBACK");
    };
    assert_eq!(suback.return_codes, vec![0]);

    let Packet::Publish(publish) = client.recv().await.unwrap() else {
        panic!("expected the replayed snapshot");
    };
    assert_eq!(publish.topic_name, "matriarch/1.marsara/wan/ping");
    let value: serde_json::Value = serde_json::from_slice(&publish.payload).unwrap();
    assert_eq!(value["timestamp"], 1700000000);
    assert_eq!(value["internet"]["ping"]["sent"], 10);
    assert_eq!(value["internet"]["ping"]["loss_now"], 0.1);
}

#[tokio::test]
async fn replay_skips_devices_without_state() {
    let broker = Arc::new(Broker::new(false));
    let formations = Arc::new(FormationMap::new());
    handlers::ping::register(&broker, &formations);

    let addr = start_control(Arc::clone(&broker)).await;
    let mut client = connected_control(addr).await;
    client.subscribe(&["matriarch/9.unknown/#"]).await.unwrap();

    let Packet::Suback(_) = client.recv().await.unwrap() else {
        panic!("expected SUBACK");
    };
    let err = client.recv().await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
}

#[tokio::test]
async fn device_telemetry_folds_into_control_snapshot() {
    let broker = Arc::new(Broker::new(false));
    let formations = Arc::new(FormationMap::new());
    handlers::ping::register(&broker, &formations);
    formations.add_device(DEVICE, FORMATION_ID);

    let addr = start_control(Arc::clone(&broker)).await;
    let mut client = connected_control(addr).await;
    client
        .subscribe(&["matriarch/1.marsara/wan/ping"])
        .await
        .unwrap();
    client.recv().await.unwrap();

    let report = json!({
        "version": 1,
        "timestamp": 1700000000,
        "internet": {
            "ping": {"sent": 10, "received": 8, "loss_now": 0, "loss_24_hours": 0},
            "dns": {"sent": 5, "received": 5, "loss_now": 0, "loss_24_hours": 0}
        },
        "gateway": {"ping": {"sent": 4, "received": 4, "loss_now": 0, "loss_24_hours": 0}},
        "tunnel": {"ping": {"sent": 2, "received": 2, "loss_now": 0, "loss_24_hours": 0}}
    });
    broker.publish(
        "pylon/1.marsara/wan/ping",
        serde_json::to_vec(&report).unwrap(),
    );

    let Packet::Publish(publish) = client.recv().await.unwrap() else {
        panic!("expected the folded snapshot");
    };
    assert_eq!(publish.topic_name, "matriarch/1.marsara/wan/ping");
    let value: serde_json::Value = serde_json::from_slice(&publish.payload).unwrap();
    assert_eq!(value["internet"]["ping"]["loss_now"].as_f64().unwrap(), 0.2);
    assert_eq!(value["internet"]["ping"]["sent"], 10);
    assert_eq!(value["internet"]["ping"]["received"], 8);
}
