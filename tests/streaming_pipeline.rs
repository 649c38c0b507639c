//! End-to-end tests for the streaming dispatcher over an in-memory transport

use async_trait::async_trait;
use databroker::{
    BrokerConfig, ConnectionState, ConsumerError, ConsumerRegistry, Dispatcher, HandlerRegistry,
    LiveTransport, MemoryTransport, SchemaCatalog, SourceConfig, StreamConsumer, StreamContext,
    Transformer,
};
use serde_json::{json, Value as JsonValue};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

const CONFIG: &str = r#"
grace_delay_ms: 20
send_timeout_secs: 1
sources:
  - id: kone-elevators
    url: memory://kone
    topics: [status]
    identity_field: unitId
    handshake:
      method: login
      args: { clientId: test }
    schema: elevator
    consumers: [collect]
"#;

struct CollectingConsumer {
    tx: mpsc::UnboundedSender<(StreamContext, Vec<JsonValue>)>,
}

#[async_trait]
impl StreamConsumer for CollectingConsumer {
    fn name(&self) -> &str {
        "collect"
    }

    async fn consume(&self, context: &StreamContext, results: &[JsonValue]) -> Result<(), ConsumerError> {
        let _ = self.tx.send((context.clone(), results.to_vec()));
        Ok(())
    }
}

struct Broker {
    dispatcher: Dispatcher,
    transports: Arc<Mutex<Vec<Arc<MemoryTransport>>>>,
    deliveries: mpsc::UnboundedReceiver<(StreamContext, Vec<JsonValue>)>,
}

impl Broker {
    fn transport(&self, index: usize) -> Arc<MemoryTransport> {
        self.transports.lock().unwrap()[index].clone()
    }
}

fn broker() -> Broker {
    let config = BrokerConfig::from_yaml_str(CONFIG).unwrap();

    let mut schemas = SchemaCatalog::new();
    schemas
        .load_from_dir(PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/schemas"))
        .unwrap();

    let (tx, deliveries) = mpsc::unbounded_channel();
    let mut consumers = ConsumerRegistry::new();
    consumers.register(Arc::new(CollectingConsumer { tx }));

    let transports = Arc::new(Mutex::new(Vec::new()));
    let created = transports.clone();
    let factory = move |_: &SourceConfig| -> Arc<dyn LiveTransport> {
        let transport = Arc::new(MemoryTransport::new());
        created.lock().unwrap().push(transport.clone());
        transport
    };

    let dispatcher = Dispatcher::new(
        Arc::new(schemas),
        Transformer::new(Arc::new(HandlerRegistry::with_builtins())),
        Arc::new(consumers),
        Arc::new(factory),
        config.dispatcher_options(),
    );
    for source in config.sources {
        dispatcher.add_source(source);
    }

    Broker {
        dispatcher,
        transports,
        deliveries,
    }
}

fn elevator_event(unit: &str, floor: i64) -> JsonValue {
    json!({
        "unitId": unit,
        "building": {"name": "HQ"},
        "status": {"floor": floor, "door": "CLOSED"},
        "ts": 1706702400000i64
    })
}

#[tokio::test]
async fn test_events_flow_to_consumers_and_queries() {
    let mut broker = broker();
    broker.dispatcher.connect("kone-elevators").await.unwrap();

    let transport = broker.transport(0);
    assert_eq!(transport.calls()[0].0, "login");

    transport.emit("status", elevator_event("E1", 2));
    transport.emit("status", elevator_event("E2", 7));

    let (first, results) = broker.deliveries.recv().await.unwrap();
    assert_eq!(first.entity_id, "E1");
    assert_eq!(results.len(), 1);
    assert_eq!(
        first.schema_id.as_deref(),
        Some("https://standards.oftrust.net/v2/Schema/DataProductOutput/ElevatorStatus")
    );

    let (second, results) = broker.deliveries.recv().await.unwrap();
    assert_eq!(second.entity_id, "E2");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["data"]["elevator"][0]["idLocal"], json!("E2"));
    assert_eq!(results[0]["data"]["elevator"][0]["floor"], json!(7));
    assert_eq!(
        results[0]["data"]["elevator"][0]["updated"],
        json!("2024-01-31T12:00:00.000Z")
    );

    let fetched = broker
        .dispatcher
        .get_data("kone-elevators", &["E1".to_string()])
        .unwrap();
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0]["data"]["elevator"][0]["idLocal"], json!("E1"));
    assert_eq!(fetched[0]["data"]["elevator"][0]["doorState"], json!("closed"));
}

#[tokio::test]
async fn test_concurrent_reconnects_leave_one_connection() {
    let broker = broker();
    let dispatcher = broker.dispatcher.clone();

    let attempts: Vec<_> = (0..3)
        .map(|_| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.connect("kone-elevators").await })
        })
        .collect();
    for attempt in attempts {
        attempt.await.unwrap().unwrap();
    }

    let transports = broker.transports.lock().unwrap().clone();
    assert_eq!(transports.len(), 3);
    assert_eq!(transports.iter().filter(|t| t.is_open()).count(), 1);
    assert_eq!(dispatcher.connection_count(), 1);
    assert_eq!(dispatcher.state("kone-elevators"), ConnectionState::Subscribed);
}

#[tokio::test]
async fn test_send_uses_live_connection() {
    let broker = broker();
    broker.dispatcher.connect("kone-elevators").await.unwrap();
    broker.transport(0).reply_to("elevator.call", json!({"accepted": true}));

    let reply = broker
        .dispatcher
        .send("kone-elevators", "elevator.call", json!({"unitId": "E1", "floor": 5}))
        .await
        .unwrap();

    assert_eq!(reply, json!({"accepted": true}));
    assert_eq!(
        broker.transport(0).calls().last().unwrap().1,
        json!({"unitId": "E1", "floor": 5})
    );
}

#[tokio::test]
async fn test_close_then_reconnect() {
    let broker = broker();
    broker.dispatcher.connect("kone-elevators").await.unwrap();

    assert!(broker.dispatcher.close("kone-elevators").await);
    assert_eq!(broker.dispatcher.state("kone-elevators"), ConnectionState::Disconnected);

    broker.dispatcher.connect("kone-elevators").await.unwrap();
    assert!(broker.transport(1).is_open());
    assert_eq!(broker.transport(0).open_count(), 1);
}
