use edgesync_core::{AttributeType, Constraint, Node};
use edgesync_endpoint::{Endpoint, EndpointConfig, MemoryStore, SessionState};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mqtt_birth_and_set_roundtrip() {
    if std::env::var("EDGESYNC_INTEGRATION").is_err() {
        eprintln!("Skipping integration test; set EDGESYNC_INTEGRATION=1 to run");
        return;
    }

    let broker =
        std::env::var("EDGESYNC_HOST_URI").unwrap_or_else(|_| "tcp://localhost:1883".to_string());
    let (host, port) = edgesync_endpoint::transport::mqtt::parse_mqtt_url(&broker).unwrap();
    let endpoint_id = format!("it-{}", Uuid::new_v4().simple());

    let mut opts = MqttOptions::new(format!("observer-{}", Uuid::new_v4()), host, port);
    opts.set_keep_alive(Duration::from_secs(5));
    let (client, mut eventloop) = AsyncClient::new(opts, 10);
    client
        .subscribe(format!("@online/{endpoint_id}"), QoS::AtLeastOnce)
        .await
        .unwrap();
    client
        .subscribe(format!("@didSet/{endpoint_id}/#"), QoS::AtLeastOnce)
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::channel(10);
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if tx.send((publish.topic, publish.payload.to_vec())).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut config = EndpointConfig::new(endpoint_id.clone());
    config.host_uri = broker;
    config.clean_session = true;
    let endpoint = Endpoint::builder(endpoint_id.clone())
        .config(config)
        .store(Arc::new(MemoryStore::new()))
        .build()
        .unwrap();
    let node = Node::new("n1");
    node.add_attribute("target", Constraint::SetPoint, AttributeType::NUMBER)
        .unwrap();
    endpoint.add_node(&node).unwrap();
    let _supervisor = endpoint.start().unwrap();

    let (topic, payload) = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timeout waiting for birth message")
        .expect("observer stopped");
    assert_eq!(topic, format!("@online/{endpoint_id}"));
    let birth: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert!(birth["nodes"]["n1"].is_object());
    assert_eq!(endpoint.state(), SessionState::Online);

    let request = serde_json::json!({
        "timestamp": 1_700_000_000.0,
        "value": 4.5,
        "correlationID": "it-1"
    });
    client
        .publish(
            format!("@set/{endpoint_id}/nodes/n1/attributes/target"),
            QoS::AtLeastOnce,
            false,
            serde_json::to_vec(&request).unwrap(),
        )
        .await
        .unwrap();

    let (topic, payload) = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timeout waiting for acknowledgement")
        .expect("observer stopped");
    assert_eq!(topic, format!("@didSet/{endpoint_id}/nodes/n1/attributes/target"));
    let ack: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(ack["correlationID"], "it-1");

    endpoint.close().await.unwrap();
}
