use chrono::{TimeZone, Utc};
use mtconnect_uns_agent::{source, Forwarder, ForwarderConfig};
use mtconnect_uns_connection::{
    parse_mqtt_url, Connection, ConnectionManager, ConnectionState, Direction, MemoryTransport,
    PublishedMessage,
};
use mtconnect_uns_core::{JsonFormatter, Observation, TopicScheme};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use uuid::Uuid;

fn memory_forwarder(root: &str, transport: &Arc<MemoryTransport>) -> Forwarder {
    let transport: Arc<MemoryTransport> = Arc::clone(transport);
    let mut connections = ConnectionManager::default();
    connections.add_connection(Connection::new(
        "primary",
        Direction::Output,
        transport,
        Duration::from_millis(500),
    ));
    Forwarder::new(
        TopicScheme::new(root),
        connections,
        Arc::new(JsonFormatter::new()),
    )
}

async fn wait_for(transport: &MemoryTransport, count: usize) -> Vec<PublishedMessage> {
    for _ in 0..200 {
        let published = transport.published();
        if published.len() >= count {
            return published;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    transport.published()
}

#[tokio::test]
async fn duplicate_temperature_is_suppressed() {
    let transport = Arc::new(MemoryTransport::new());
    let forwarder = memory_forwarder("Root", &transport);
    forwarder.start().await;

    let t1 = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
    let (tx, rx) = mpsc::channel(8);
    for (seconds, value) in [(0, 98.6), (1, 98.6), (2, 99.1)] {
        let timestamp = t1 + chrono::Duration::seconds(seconds);
        let observation = Observation::new("D1", "TEMP", timestamp, value)
            .with_sequence(u64::try_from(seconds).unwrap() + 1);
        tx.send(observation).await.unwrap();
    }
    drop(tx);

    let stats = forwarder.run(rx, std::future::pending()).await;
    assert_eq!(stats.received, 3);
    assert_eq!(stats.suppressed, 1);

    let published = wait_for(&transport, 2).await;
    let data: Vec<_> = published
        .iter()
        .filter(|message| message.topic == "Root/Devices/D1/TEMP")
        .map(|message| message.json().unwrap())
        .collect();

    assert_eq!(data.len(), 2);
    assert_eq!(data[0]["value"], serde_json::json!(98.6));
    assert_eq!(data[0]["sequence"], serde_json::json!(1));
    assert_eq!(data[1]["value"], serde_json::json!(99.1));
    assert_eq!(data[1]["timestamp"], serde_json::json!("2024-03-01T08:00:02Z"));
    assert_eq!(transport.interests(), vec!["Root/Devices/D1"]);

    forwarder.stop().await;
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn json_lines_feed_end_to_end() {
    let transport = Arc::new(MemoryTransport::new());
    let forwarder = memory_forwarder("MTConnect", &transport);
    forwarder.start().await;

    let input: &'static [u8] = br#"{"deviceUuid":"mill-01","dataItemId":"exec","timestamp":"2024-03-01T08:00:00Z","value":"ACTIVE","category":"EVENT","type":"EXECUTION"}
[{"deviceUuid":"mill-01","dataItemId":"exec","timestamp":"2024-03-01T08:00:01Z","value":"ACTIVE"},{"deviceUuid":"lathe-07","dataItemId":"Srpm","timestamp":"2024-03-01T08:00:01Z","value":1200}]
not an observation
{"deviceUuid":"mill-01","dataItemId":"exec","timestamp":"2024-03-01T08:00:02Z","value":"STOPPED"}
"#;

    let feed = source::spawn_json_lines(input, 16);
    let stats = forwarder.run(feed, std::future::pending()).await;

    assert_eq!(stats.received, 4);
    assert_eq!(stats.forwarded, 3);
    assert_eq!(stats.suppressed, 1);

    let topics: Vec<_> = wait_for(&transport, 3)
        .await
        .into_iter()
        .map(|message| message.topic)
        .collect();
    assert_eq!(
        topics,
        vec![
            "MTConnect/Devices/mill-01/exec",
            "MTConnect/Devices/lathe-07/Srpm",
            "MTConnect/Devices/mill-01/exec",
        ]
    );
    assert_eq!(forwarder.registry().len(), 2);

    let stats = forwarder.stop().await;
    assert_eq!(stats.publish_failures, 0);
    assert_eq!(
        forwarder.connections().states(),
        vec![("primary".to_string(), ConnectionState::Stopped)]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mqtt_forwarding_roundtrip() {
    if std::env::var("UNS_INTEGRATION").is_err() {
        eprintln!("Skipping integration test; set UNS_INTEGRATION=1 to run");
        return;
    }

    let broker =
        std::env::var("UNS_MQTT_BROKER").unwrap_or_else(|_| "tcp://localhost:1883".to_string());
    let (host, port) = parse_mqtt_url(&broker).unwrap();

    let root = format!("it-{}", Uuid::new_v4().simple());
    let scheme = TopicScheme::new(&root);
    let topic = scheme.data_item("D1", "TEMP");

    let sub_id = format!("sub-{}", Uuid::new_v4());
    let mut sub_opts = MqttOptions::new(sub_id, host.clone(), port);
    sub_opts.set_keep_alive(Duration::from_secs(5));
    let (sub_client, mut sub_eventloop) = AsyncClient::new(sub_opts, 10);
    sub_client.subscribe(&topic, QoS::AtLeastOnce).await.unwrap();

    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        loop {
            match sub_eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let _ = tx.send(publish.payload.to_vec());
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    tokio::time::sleep(Duration::from_millis(200)).await;

    let config = ForwarderConfig::from_lookup(|key| match key {
        "UNS_MQTT_BROKER_ADDRESS" => Some(host.clone()),
        "UNS_MQTT_BROKER_PORT" => Some(port.to_string()),
        "UNS_TOPIC_ROOT" => Some(root.clone()),
        "UNS_DEVICES" => Some("D1".to_string()),
        _ => None,
    })
    .unwrap();

    let forwarder = Forwarder::from_config(&config).await;
    assert_eq!(forwarder.start().await, 1);

    forwarder
        .handle(&Observation::new("D1", "TEMP", Utc::now(), 98.6))
        .await;

    let received = timeout(Duration::from_secs(5), rx)
        .await
        .expect("timeout waiting for MQTT message")
        .expect("subscriber dropped");

    let payload: serde_json::Value = serde_json::from_slice(&received).unwrap();
    assert_eq!(payload["deviceUuid"], "D1");
    assert_eq!(payload["value"], serde_json::json!(98.6));

    forwarder.stop().await;
}
