//! End-to-end registry scenarios
//!
//! Nodes share one in-memory log and one group coordinator, the way
//! registry processes share a topic and a consumer group.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemalog::log::{LogEntry, LogError};
use schemalog::state::Rejection;
use schemalog::{
    ChangeType, CompatibilityMode, GroupCoordinator, LeaderGate, LogTransport, MemoryLog,
    NewSchema, NodeIdentity, Operation, ReaderSettings, Registrar, RegistrationOutcome, RegistryError,
    RegistryConfig, ReplicatedStore, SchemaFormat, SchemaId, SchemaReader, SchemaRecord, Version, VersionSpec,
};

const ORDER_V1: &str = include_str!("fixtures/order_v1.avsc");
const ORDER_WITHOUT_AMOUNT: &str = include_str!("fixtures/order_without_amount.avsc");
const ORDER_WITH_CURRENCY: &str = include_str!("fixtures/order_with_currency.avsc");
const CUSTOMER_V1: &str = include_str!("fixtures/customer_v1.json");
const CUSTOMER_V2: &str = include_str!("fixtures/customer_v2.json");
const CUSTOMER_NARROWED: &str = include_str!("fixtures/customer_narrowed.json");
const PAYMENT_V1: &str = include_str!("fixtures/payment_v1.proto");
const PAYMENT_V2: &str = include_str!("fixtures/payment_v2.proto");
const PAYMENT_RETYPED: &str = include_str!("fixtures/payment_retyped.proto");

const TIMEOUT: Duration = Duration::from_secs(2);

struct Cluster {
    log: Arc<MemoryLog>,
    group: Arc<GroupCoordinator>,
}

struct Node {
    registrar: Registrar,
    reader: SchemaReader,
}

impl Cluster {
    fn new() -> Self {
        Self {
            log: Arc::new(MemoryLog::new()),
            group: Arc::new(RegistryConfig::default().coordinator()),
        }
    }

    fn config(id: &str, master_eligible: bool) -> RegistryConfig {
        let mut config = RegistryConfig::default();
        config.node.node_id = id.to_string();
        config.node.host = format!("{}.registry.internal", id);
        config.node.master_eligibility = master_eligible;
        config.registry.poll_interval_ms = 2;
        config.registry.batch_size = 16;
        config.registry.catch_up_timeout_ms = TIMEOUT.as_millis() as u64;
        config
    }

    async fn store(&self) -> (Arc<ReplicatedStore>, SchemaReader) {
        let store = Arc::new(ReplicatedStore::new(CompatibilityMode::Backward));
        let settings = ReaderSettings {
            poll_interval: Duration::from_millis(2),
            batch_size: 16,
        };
        let reader = SchemaReader::start(store.clone(), self.log.clone(), settings);
        store.wait_for_ready(TIMEOUT).await.unwrap();
        (store, reader)
    }

    async fn join(&self, id: &str) -> Node {
        self.join_with(Self::config(id, true)).await
    }

    async fn join_with(&self, config: RegistryConfig) -> Node {
        let (registrar, reader) = Registrar::from_config(&config, self.group.clone(), self.log.clone())
            .await
            .unwrap();
        Node { registrar, reader }
    }
}

impl Node {
    async fn stop(self) {
        self.reader.shutdown().await;
    }
}

/// Read side of the shared log that can be paused, as a lagging consumer would be
struct PausableLog {
    inner: Arc<MemoryLog>,
    paused: AtomicBool,
}

impl PausableLog {
    fn new(inner: Arc<MemoryLog>) -> Self {
        Self {
            inner,
            paused: AtomicBool::new(false),
        }
    }

    fn pause(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }
}

#[async_trait]
impl LogTransport for PausableLog {
    async fn append(&self, payload: Vec<u8>) -> Result<u64, LogError> {
        self.inner.append(payload).await
    }

    async fn read_from(&self, offset: u64, max: usize) -> Result<Vec<LogEntry>, LogError> {
        if self.paused.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        self.inner.read_from(offset, max).await
    }

    async fn end_offset(&self) -> Result<u64, LogError> {
        self.inner.end_offset().await
    }
}

/// A leader whose local reader tails the log through a [`PausableLog`]
async fn lagging_leader(cluster: &Cluster, timeout: Duration) -> (Registrar, Arc<PausableLog>, SchemaReader) {
    let identity = NodeIdentity::new("sr-1", "sr-1.registry.internal", 8081);
    cluster.group.join(identity.clone(), true);
    let tail = Arc::new(PausableLog::new(cluster.log.clone()));
    let store = Arc::new(ReplicatedStore::new(CompatibilityMode::Backward));
    let settings = ReaderSettings {
        poll_interval: Duration::from_millis(2),
        batch_size: 16,
    };
    let reader = SchemaReader::start(store.clone(), tail.clone(), settings);
    store.wait_for_ready(TIMEOUT).await.unwrap();
    let gate = LeaderGate::new(identity, cluster.group.clone());
    let registrar = Registrar::new(gate, store, cluster.log.clone()).with_timeout(timeout);
    (registrar, tail, reader)
}

const ORDER_WITH_NOTE: &str = r#"{"type":"record","name":"Order","namespace":"shop","fields":[
    {"name":"id","type":"string"},{"name":"amount","type":"double"},
    {"name":"currency","type":"string","default":"EUR"},{"name":"note","type":"string","default":""}]}"#;

#[tokio::test]
async fn test_orders_value_evolution() {
    let cluster = Cluster::new();
    let node = cluster.join("sr-1").await;
    let registrar = &node.registrar;

    let first = registrar.register("orders-value", NewSchema::avro(ORDER_V1)).await.unwrap();
    assert_eq!((first.id, first.version), (SchemaId::new(1), Version::new(1)));

    let rejected = registrar
        .register("orders-value", NewSchema::avro(ORDER_WITHOUT_AMOUNT))
        .await
        .unwrap_err();
    let result = rejected.compatibility().expect("incompatibility carries its diff");
    let change = result.breaking_changes().next().unwrap();
    assert_eq!(change.change_type, ChangeType::FieldRemoved);
    assert!(change.path.ends_with("amount"), "unexpected path {}", change.path);
    assert!(result.summary.contains("amount"));

    let second = registrar
        .register("orders-value", NewSchema::avro(ORDER_WITH_CURRENCY))
        .await
        .unwrap();
    assert_eq!((second.id, second.version), (SchemaId::new(2), Version::new(2)));

    let again = registrar.register("orders-value", NewSchema::avro(ORDER_V1)).await.unwrap();
    assert_eq!((again.id, again.version), (SchemaId::new(1), Version::new(1)));
    assert_eq!(again.outcome, RegistrationOutcome::Existing);

    let store = registrar.store();
    assert_eq!(store.versions("orders-value", false).unwrap(), vec![Version::new(1), Version::new(2)]);
    assert_eq!(store.latest("orders-value").unwrap().id, SchemaId::new(2));
    node.stop().await;
}

#[tokio::test]
async fn test_registration_is_idempotent_under_retries() {
    let cluster = Cluster::new();
    let node = cluster.join("sr-1").await;
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(node.registrar.register("orders-value", NewSchema::avro(ORDER_V1)).await.unwrap());
    }
    assert!(ids.iter().all(|r| r.id == ids[0].id && r.version == ids[0].version));

    // Whitespace and key order do not make new content
    let reformatted = ORDER_V1.replace('\n', " ").replace("  ", " ");
    let same = node.registrar.register("orders-value", NewSchema::avro(reformatted)).await.unwrap();
    assert_eq!(same.outcome, RegistrationOutcome::Existing);
    assert_eq!(node.registrar.store().versions("orders-value", true).unwrap().len(), 1);
    node.stop().await;
}

#[tokio::test]
async fn test_json_and_protobuf_subjects() {
    let cluster = Cluster::new();
    let node = cluster.join("sr-1").await;
    let registrar = &node.registrar;

    registrar.set_compatibility(None, CompatibilityMode::Full).await.unwrap();
    registrar.register("customers-value", NewSchema::json(CUSTOMER_V1)).await.unwrap();
    let v2 = registrar.register("customers-value", NewSchema::json(CUSTOMER_V2)).await.unwrap();
    assert_eq!(v2.version, Version::new(2));
    let err = registrar
        .register("customers-value", NewSchema::json(CUSTOMER_NARROWED))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::IncompatibleSchema { .. }));

    registrar.register("payments-value", NewSchema::protobuf(PAYMENT_V1)).await.unwrap();
    let v2 = registrar.register("payments-value", NewSchema::protobuf(PAYMENT_V2)).await.unwrap();
    assert_eq!(v2.version, Version::new(2));
    let err = registrar
        .register("payments-value", NewSchema::protobuf(PAYMENT_RETYPED))
        .await
        .unwrap_err();
    let result = err.compatibility().unwrap();
    assert!(result
        .breaking_changes()
        .any(|c| c.change_type == ChangeType::TypeChanged && c.path == "billing.Payment.amount_cents"));

    let stored = registrar.store().latest("payments-value").unwrap();
    assert_eq!(stored.schema.format, SchemaFormat::Protobuf);
    assert!(!stored.schema.text.contains("Adds a memo"), "comments are not part of the canonical form");
    node.stop().await;
}

#[tokio::test]
async fn test_replay_reproduces_state() {
    let cluster = Cluster::new();
    let node = cluster.join("sr-1").await;
    let registrar = &node.registrar;
    registrar.register("orders-value", NewSchema::avro(ORDER_V1)).await.unwrap();
    registrar.register("orders-value", NewSchema::avro(ORDER_WITH_CURRENCY)).await.unwrap();
    registrar.register("audit-value", NewSchema::avro(ORDER_V1)).await.unwrap();
    registrar.delete_version("orders-value", VersionSpec::Latest, false).await.unwrap();
    registrar
        .set_compatibility(Some("audit-value"), CompatibilityMode::None)
        .await
        .unwrap();

    let (replayed, reader) = cluster.store().await;
    let end = cluster.log.end_offset().await.unwrap();
    replayed.wait_for_offset(end - 1, TIMEOUT).await.unwrap();
    assert_eq!(*replayed.snapshot(), *registrar.store().snapshot());
    assert_eq!(replayed.compatibility(Some("audit-value")).unwrap(), CompatibilityMode::None);
    reader.shutdown().await;
    node.stop().await;
}

#[tokio::test]
async fn test_single_writer_across_failover() {
    let cluster = Cluster::new();
    let a = cluster.join("sr-1").await;
    let b = cluster.join("sr-2").await;

    let err = b.registrar.register("orders-value", NewSchema::avro(ORDER_V1)).await.unwrap_err();
    assert!(matches!(err, RegistryError::NotMaster { leader: Some(ref l) } if l.node_id == "sr-1"));
    a.registrar.register("orders-value", NewSchema::avro(ORDER_V1)).await.unwrap();
    let stale = a.registrar.gate().acquire().unwrap();

    cluster.group.leave("sr-1");
    let err = a
        .registrar
        .register("orders-value", NewSchema::avro(ORDER_WITH_CURRENCY))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::NotMaster { .. }));

    let promoted = b
        .registrar
        .register("orders-value", NewSchema::avro(ORDER_WITH_CURRENCY))
        .await
        .unwrap();
    assert_eq!(promoted.version, Version::new(2));

    // An append from the deposed writer that still reaches the log is ignored
    let late = SchemaRecord::new(
        Operation::DeleteSubject {
            subject: "orders-value".into(),
            up_to: None,
            permanent: false,
        },
        stale.generation,
    );
    let offset = cluster.log.append(late.encode().unwrap()).await.unwrap();
    let store = b.registrar.store();
    store.wait_for_offset(offset, TIMEOUT).await.unwrap();
    assert_eq!(store.snapshot().rejection(offset), Some(Rejection::Fenced));
    assert_eq!(store.versions("orders-value", false).unwrap().len(), 2);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_configured_node_settings_take_effect() {
    let cluster = Cluster::new();
    // Sorts first, so it would win a lowest-url election if it were eligible
    let observer = cluster.join_with(Cluster::config("sr-0", false)).await;
    let mut lenient = Cluster::config("sr-1", true);
    lenient.registry.default_compatibility = CompatibilityMode::None;
    let leader = cluster.join_with(lenient).await;

    let err = observer
        .registrar
        .register("orders-value", NewSchema::avro(ORDER_V1))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::NotMaster { leader: Some(ref l) } if l.node_id == "sr-1"));

    leader.registrar.register("orders-value", NewSchema::avro(ORDER_V1)).await.unwrap();
    let dropped = leader
        .registrar
        .register("orders-value", NewSchema::avro(ORDER_WITHOUT_AMOUNT))
        .await
        .unwrap();
    assert_eq!(dropped.version, Version::new(2));
    assert_eq!(leader.registrar.store().compatibility(None).unwrap(), CompatibilityMode::None);

    observer.stop().await;
    leader.stop().await;
}

#[tokio::test]
async fn test_followers_observe_leader_writes() {
    let cluster = Cluster::new();
    let leader = cluster.join("sr-1").await;
    let follower = cluster.join("sr-2").await;

    leader.registrar.register("orders-value", NewSchema::avro(ORDER_V1)).await.unwrap();
    let end = cluster.log.end_offset().await.unwrap();
    let store = follower.registrar.store();
    store.wait_for_offset(end - 1, TIMEOUT).await.unwrap();
    assert_eq!(store.latest("orders-value").unwrap().id, SchemaId::new(1));

    let check = follower
        .registrar
        .check_compatibility("orders-value", &NewSchema::avro(ORDER_WITHOUT_AMOUNT), VersionSpec::Latest)
        .unwrap();
    assert!(!check.is_compatible);

    leader.stop().await;
    follower.stop().await;
}

#[tokio::test]
async fn test_log_outage_leaves_state_untouched() {
    let cluster = Cluster::new();
    let node = cluster.join("sr-1").await;
    node.registrar.register("orders-value", NewSchema::avro(ORDER_V1)).await.unwrap();

    cluster.log.set_available(false);
    let err = node
        .registrar
        .register("orders-value", NewSchema::avro(ORDER_WITH_CURRENCY))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::LogUnavailable(_)));
    assert!(err.is_retriable());
    cluster.log.set_available(true);

    assert_eq!(node.registrar.store().versions("orders-value", true).unwrap().len(), 1);
    let retried = node
        .registrar
        .register("orders-value", NewSchema::avro(ORDER_WITH_CURRENCY))
        .await
        .unwrap();
    assert_eq!(retried.version, Version::new(2));
    node.stop().await;
}

#[tokio::test]
async fn test_write_after_catch_up_timeout_sees_the_timed_out_record() {
    let cluster = Cluster::new();
    let (registrar, tail, reader) = lagging_leader(&cluster, Duration::from_millis(300)).await;
    registrar.register("orders-value", NewSchema::avro(ORDER_V1)).await.unwrap();

    tail.pause(true);
    let err = registrar
        .register("orders-value", NewSchema::avro(ORDER_WITH_CURRENCY))
        .await
        .unwrap_err();
    let timed_out = match err {
        RegistryError::CatchUpTimeout { offset, .. } => offset,
        other => panic!("expected CatchUpTimeout, got {:?}", other),
    };
    assert_eq!(timed_out, 2);

    // Still lagging: the next write waits for the timed-out record and writes nothing
    let end = cluster.log.end_offset().await.unwrap();
    let err = registrar.register("orders-value", NewSchema::avro(ORDER_WITH_NOTE)).await.unwrap_err();
    assert!(matches!(err, RegistryError::CatchUpTimeout { offset, .. } if offset == timed_out));
    assert_eq!(cluster.log.end_offset().await.unwrap(), end);

    let resume = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        tail.pause(false);
    };
    let (third, _) = tokio::join!(registrar.register("orders-value", NewSchema::avro(ORDER_WITH_NOTE)), resume);
    let third = third.unwrap();
    assert_eq!((third.id, third.version), (SchemaId::new(3), Version::new(3)));

    let store = registrar.store();
    assert!(store.schema_by_id(SchemaId::new(2)).unwrap().text.contains("currency"));
    assert!(store.schema_by_id(SchemaId::new(3)).unwrap().text.contains("note"));
    assert_eq!(store.latest("orders-value").unwrap().id, SchemaId::new(3));

    // Retrying the timed-out request finds it already registered
    let retried = registrar
        .register("orders-value", NewSchema::avro(ORDER_WITH_CURRENCY))
        .await
        .unwrap();
    assert_eq!((retried.id, retried.version), (SchemaId::new(2), Version::new(2)));
    assert_eq!(retried.outcome, RegistrationOutcome::Existing);
    reader.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_writer_does_not_leak_its_id() {
    let cluster = Cluster::new();
    let (registrar, tail, reader) = lagging_leader(&cluster, TIMEOUT).await;
    registrar.register("orders-value", NewSchema::avro(ORDER_V1)).await.unwrap();

    tail.pause(true);
    let cancelled = tokio::time::timeout(
        Duration::from_millis(50),
        registrar.register("orders-value", NewSchema::avro(ORDER_WITH_CURRENCY)),
    )
    .await;
    assert!(cancelled.is_err(), "the write should still be waiting to apply");
    tail.pause(false);

    let next = registrar
        .register("orders-value", NewSchema::avro(ORDER_WITH_NOTE))
        .await
        .unwrap();
    assert_eq!((next.id, next.version), (SchemaId::new(3), Version::new(3)));
    let store = registrar.store();
    assert_eq!(store.versions("orders-value", false).unwrap().len(), 3);
    assert!(store.subject_version("orders-value", VersionSpec::Exact(Version::new(2)), false)
        .unwrap()
        .schema
        .text
        .contains("currency"));
    reader.shutdown().await;
}
