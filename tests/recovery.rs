// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use async_trait::async_trait;
use lapin::BasicProperties;
use parking_lot::Mutex;
use rabbitmq_recovery::{
    exchange::{ExchangeBinding, ExchangeDefinition},
    queue::{QueueBinding, QueueDefinition},
    recorded::{RecordedEntity, RecordedExchange},
    transport::memory::MemoryBroker,
    AmqpError, ConnectionParams, ConsumerCallback, ConsumerDefinition, Delivery,
    RecoveringConnection, RecoveryConfig, RecoveryListener, RecoveryPolicy, RecoveryState,
    ShutdownSignal, TopologyRecoveryFilter,
};
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::mpsc;

#[derive(Debug)]
enum Event {
    Started,
    Completed(HashMap<String, String>),
    Failed(Option<RecordedEntity>, AmqpError),
}

struct Events(mpsc::UnboundedSender<Event>);

impl RecoveryListener for Events {
    fn on_recovery_started(&self) {
        let _ = self.0.send(Event::Started);
    }

    fn on_recovery_completed(&self, renamed: &HashMap<String, String>) {
        let _ = self.0.send(Event::Completed(renamed.clone()));
    }

    fn on_recovery_failed(&self, entity: Option<&RecordedEntity>, cause: &AmqpError) {
        let _ = self.0.send(Event::Failed(entity.cloned(), cause.clone()));
    }
}

#[derive(Default)]
struct Collector {
    deliveries: Mutex<Vec<Delivery>>,
    recovered: Mutex<Vec<String>>,
    cancelled: Mutex<Vec<String>>,
}

#[async_trait]
impl ConsumerCallback for Collector {
    async fn handle_delivery(&self, delivery: Delivery) {
        self.deliveries.lock().push(delivery);
    }

    async fn handle_cancel(&self, consumer_tag: &str) {
        self.cancelled.lock().push(consumer_tag.to_owned());
    }

    async fn handle_recover_ok(&self, consumer_tag: &str) {
        self.recovered.lock().push(consumer_tag.to_owned());
    }
}

async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

fn fast() -> RecoveryConfig {
    RecoveryConfig::default()
        .interval(Duration::from_millis(10))
        .call_timeout(Duration::from_secs(1))
}

async fn connect(
    broker: &MemoryBroker,
    config: RecoveryConfig,
    policy: RecoveryPolicy,
) -> (RecoveringConnection, mpsc::UnboundedReceiver<Event>) {
    let conn = RecoveringConnection::open(
        Arc::new(broker.clone()),
        ConnectionParams::default(),
        config,
        policy,
    )
    .await
    .unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    conn.add_recovery_listener(Arc::new(Events(tx)));
    (conn, rx)
}

/// Waits for the end of a cycle and returns the per-entity failures seen
/// before it, along with the renames it reported.
async fn completed(
    events: &mut mpsc::UnboundedReceiver<Event>,
) -> (HashMap<String, String>, Vec<(Option<RecordedEntity>, AmqpError)>) {
    let mut failures = vec![];
    loop {
        match within(events.recv()).await.expect("listener dropped") {
            Event::Started => {}
            Event::Failed(entity @ Some(_), cause) => failures.push((entity, cause)),
            Event::Failed(None, cause) => panic!("recovery abandoned: {cause}"),
            Event::Completed(renamed) => return (renamed, failures),
        }
    }
}

async fn abandoned(events: &mut mpsc::UnboundedReceiver<Event>) -> AmqpError {
    loop {
        match within(events.recv()).await.expect("listener dropped") {
            Event::Failed(None, cause) => return cause,
            Event::Completed(_) => panic!("recovery completed"),
            _ => {}
        }
    }
}

async fn wait_for_state(conn: &RecoveringConnection, wanted: RecoveryState) {
    let mut state = conn.subscribe_state();
    within(state.wait_for(|s| *s == wanted)).await.unwrap();
}

#[tokio::test]
async fn recovers_server_named_queue_binding_and_consumer() {
    let broker = MemoryBroker::new();
    let (conn, mut events) = connect(&broker, fast(), RecoveryPolicy::default()).await;
    let channel = conn.create_channel().await.unwrap();
    let consumer = Arc::new(Collector::default());

    channel
        .exchange_declare(&ExchangeDefinition::new("E").topic())
        .await
        .unwrap();
    let old = channel
        .queue_declare(&QueueDefinition::server_named())
        .await
        .unwrap();
    channel
        .queue_bind(&QueueBinding::new(&old).exchange("E").routing_key("k"))
        .await
        .unwrap();
    let old_tag = channel
        .basic_consume(&ConsumerDefinition::new(&old), consumer.clone())
        .await
        .unwrap();

    broker.kill_connections();
    let (renamed, failures) = completed(&mut events).await;

    assert!(failures.is_empty());
    let new = renamed.get(&old).cloned().unwrap();
    let new_tag = renamed.get(&old_tag).cloned().unwrap();
    assert_ne!(new, old);
    assert!(new.starts_with("amq.gen-"));
    assert!(!broker.has_queue(&old));
    assert_eq!(broker.bindings_to(&new), vec![("E".to_owned(), "k".to_owned())]);
    assert_eq!(broker.consumers_on(&new), vec![new_tag.clone()]);
    assert_eq!(*consumer.recovered.lock(), vec![new_tag.clone()]);
    conn.with_topology(|registry| {
        assert!(registry.queue(&new).is_some());
        assert!(registry.queue(&old).is_none());
        assert_eq!(registry.consumer(&new_tag).map(|c| c.queue.clone()), Some(new.clone()));
    });

    channel
        .basic_publish("E", "k", b"after", BasicProperties::default())
        .await
        .unwrap();

    let deliveries = consumer.deliveries.lock();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].consumer_tag, new_tag);
    assert_eq!(deliveries[0].data, b"after");
}

#[tokio::test]
async fn replays_exchanges_then_queues_then_bindings_then_consumers() {
    let broker = MemoryBroker::new();
    let (conn, mut events) = connect(&broker, fast(), RecoveryPolicy::default()).await;
    let channel = conn.create_channel().await.unwrap();

    channel.queue_declare(&QueueDefinition::new("Q")).await.unwrap();
    channel
        .exchange_declare(&ExchangeDefinition::new("X").topic())
        .await
        .unwrap();
    channel
        .queue_bind(&QueueBinding::new("Q").exchange("X").routing_key("k"))
        .await
        .unwrap();
    channel
        .exchange_declare(&ExchangeDefinition::new("Y").fanout())
        .await
        .unwrap();
    channel
        .exchange_bind(&ExchangeBinding::new("Y", "X").routing_key("k2"))
        .await
        .unwrap();
    channel
        .basic_consume(
            &ConsumerDefinition::new("Q").tag("worker"),
            Arc::new(Collector::default()),
        )
        .await
        .unwrap();

    broker.kill_connections();
    broker.clear_operations();
    completed(&mut events).await;

    assert_eq!(
        broker.operations(),
        vec![
            "connection.open",
            "channel.open 1",
            "exchange.declare X",
            "exchange.declare Y",
            "queue.declare Q",
            "queue.bind Q X k",
            "exchange.bind Y X k2",
            "basic.consume Q",
        ]
    );
    assert_eq!(conn.state(), RecoveryState::Active);
}

#[tokio::test]
async fn rejected_exchange_does_not_stop_its_siblings() {
    let broker = MemoryBroker::new();
    let (conn, mut events) = connect(&broker, fast(), RecoveryPolicy::default()).await;
    let channel = conn.create_channel().await.unwrap();

    for name in ["E", "F"] {
        channel
            .exchange_declare(&ExchangeDefinition::new(name).direct())
            .await
            .unwrap();
    }
    channel.queue_declare(&QueueDefinition::new("q")).await.unwrap();
    channel
        .queue_bind(&QueueBinding::new("q").exchange("E").routing_key("a"))
        .await
        .unwrap();
    channel
        .queue_bind(&QueueBinding::new("q").exchange("F").routing_key("b"))
        .await
        .unwrap();
    channel
        .basic_consume(&ConsumerDefinition::new("q"), Arc::new(Collector::default()))
        .await
        .unwrap();

    broker.reject_exchange("E");
    broker.kill_connections();
    broker.clear_operations();
    let (_, failures) = completed(&mut events).await;

    assert_eq!(failures.len(), 1);
    match &failures[0] {
        (Some(RecordedEntity::Exchange(exchange)), AmqpError::EntityRejected(_)) => {
            assert_eq!(exchange.name, "E")
        }
        other => panic!("unexpected failure {other:?}"),
    }

    let operations = broker.operations();
    assert!(operations.contains(&"exchange.declare F".to_owned()));
    assert!(operations.contains(&"queue.bind q F b".to_owned()));
    assert!(!operations.contains(&"queue.bind q E a".to_owned()));
    assert_eq!(broker.consumers_on("q").len(), 1);

    // The channel the broker closed on rejection was reopened.
    assert!(channel.is_open());
    channel
        .basic_publish("F", "b", b"still works", BasicProperties::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn close_while_reconnecting_stops_further_attempts() {
    let broker = MemoryBroker::new();
    let (conn, mut events) = connect(&broker, fast(), RecoveryPolicy::default()).await;
    let channel = conn.create_channel().await.unwrap();
    broker.fail_next_connects(u32::MAX);

    broker.kill_connections();
    wait_for_state(&conn, RecoveryState::Reconnecting).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    conn.close().await.unwrap();
    let attempts = broker.connection_attempts();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(broker.connection_attempts(), attempts);
    assert_eq!(conn.state(), RecoveryState::Abandoned);
    assert!(!conn.is_open());
    assert!(!channel.is_open());
    assert!(matches!(
        channel.queue_declare(&QueueDefinition::new("q")).await,
        Err(AmqpError::ChannelClosed(_) | AmqpError::ConnectionClosed(_))
    ));
    assert!(matches!(
        conn.create_channel().await,
        Err(AmqpError::ConnectionClosed(_))
    ));

    // An application close is not reported as a recovery failure.
    while let Ok(event) = events.try_recv() {
        assert!(matches!(event, Event::Started), "unexpected {event:?}");
    }
}

#[tokio::test]
async fn disabled_recovery_abandons_on_loss() {
    let broker = MemoryBroker::new();
    let (conn, mut events) =
        connect(&broker, RecoveryConfig::disabled(), RecoveryPolicy::default()).await;
    let channel = conn.create_channel().await.unwrap();

    broker.kill_connections();
    let cause = abandoned(&mut events).await;

    assert_eq!(cause, AmqpError::ConnectionClosed("connection reset by peer".to_owned()));
    assert_eq!(conn.state(), RecoveryState::Abandoned);
    assert_eq!(broker.connection_attempts(), 1);
    assert!(channel
        .basic_publish("", "q", b"lost", BasicProperties::default())
        .await
        .is_err());
}

#[tokio::test]
async fn policy_can_decline_recovery() {
    let broker = MemoryBroker::new();
    let policy = RecoveryPolicy::default()
        .recover_when(|signal: &ShutdownSignal| signal.cause.contains("CONNECTION_FORCED"));
    let (conn, mut events) = connect(&broker, fast(), policy).await;

    broker.kill_connections();
    abandoned(&mut events).await;

    assert_eq!(conn.state(), RecoveryState::Abandoned);
    assert_eq!(broker.connection_attempts(), 1);
}

#[tokio::test]
async fn callers_blocked_during_recovery_resume_on_the_new_connection() {
    let broker = MemoryBroker::new();
    let (conn, mut events) = connect(&broker, fast(), RecoveryPolicy::default()).await;
    let channel = conn.create_channel().await.unwrap();
    channel
        .queue_declare(&QueueDefinition::new("jobs").durable())
        .await
        .unwrap();
    broker.fail_next_connects(3);

    broker.kill_connections();
    wait_for_state(&conn, RecoveryState::Reconnecting).await;

    let publisher = channel.clone();
    let publish = tokio::spawn(async move {
        publisher
            .basic_publish("", "jobs", b"queued", BasicProperties::default())
            .await
    });

    within(publish).await.unwrap().unwrap();
    completed(&mut events).await;

    assert_eq!(broker.message_count("jobs"), 1);
    assert_eq!(broker.connection_attempts(), 5);
    assert_eq!(broker.open_connections(), 1);
}

#[tokio::test]
async fn calls_right_after_a_loss_wait_for_recovery() {
    let broker = MemoryBroker::new();
    let (conn, mut events) = connect(&broker, fast(), RecoveryPolicy::default()).await;
    let channel = conn.create_channel().await.unwrap();

    broker.kill_connections();
    assert!(conn.state().is_recovering());

    within(channel.queue_declare(&QueueDefinition::new("late").durable()))
        .await
        .unwrap();
    completed(&mut events).await;

    assert!(broker.has_queue("late"));
    assert_eq!(broker.connection_attempts(), 2);
}

/// Kills the broker connections the first time its consumer is recovered.
struct KillOnRecover {
    broker: MemoryBroker,
    recovered: AtomicUsize,
}

#[async_trait]
impl ConsumerCallback for KillOnRecover {
    async fn handle_delivery(&self, _delivery: Delivery) {}

    async fn handle_recover_ok(&self, _consumer_tag: &str) {
        if self.recovered.fetch_add(1, Ordering::SeqCst) == 0 {
            self.broker.kill_connections();
            tokio::task::yield_now().await;
        }
    }
}

#[tokio::test]
async fn loss_while_notifying_recovered_consumers_starts_another_cycle() {
    let broker = MemoryBroker::new();
    let (conn, mut events) = connect(&broker, fast(), RecoveryPolicy::default()).await;
    let channel = conn.create_channel().await.unwrap();
    channel
        .queue_declare(&QueueDefinition::new("jobs").durable())
        .await
        .unwrap();
    let consumer = Arc::new(KillOnRecover {
        broker: broker.clone(),
        recovered: AtomicUsize::new(0),
    });
    channel
        .basic_consume(&ConsumerDefinition::new("jobs").tag("worker"), consumer.clone())
        .await
        .unwrap();

    broker.kill_connections();
    completed(&mut events).await;
    completed(&mut events).await;

    assert_eq!(conn.state(), RecoveryState::Active);
    assert_eq!(consumer.recovered.load(Ordering::SeqCst), 2);
    assert_eq!(broker.connection_attempts(), 3);
    assert_eq!(broker.open_connections(), 1);
    assert_eq!(broker.consumers_on("jobs"), vec!["worker".to_owned()]);
    channel
        .queue_declare(&QueueDefinition::new("after").durable())
        .await
        .unwrap();
}

#[tokio::test]
async fn channel_created_during_recovery_is_opened_once() {
    let broker = MemoryBroker::new();
    let (conn, mut events) = connect(&broker, fast(), RecoveryPolicy::default()).await;
    let _first = conn.create_channel().await.unwrap();
    broker.fail_next_connects(3);

    broker.kill_connections();
    broker.clear_operations();
    let creating = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.create_channel().await })
    };
    completed(&mut events).await;
    let second = within(creating).await.unwrap().unwrap();

    let opens = broker
        .operations()
        .iter()
        .filter(|op| op.as_str() == "channel.open 2")
        .count();
    assert_eq!(second.number(), 2);
    assert_eq!(opens, 1);
    second
        .exchange_declare(&ExchangeDefinition::new("fresh").fanout())
        .await
        .unwrap();
}

#[tokio::test]
async fn exhausted_reconnect_budget_abandons() {
    let broker = MemoryBroker::new();
    let (conn, mut events) =
        connect(&broker, fast().max_attempts(2), RecoveryPolicy::default()).await;
    broker.fail_next_connects(10);

    broker.kill_connections();
    let cause = abandoned(&mut events).await;

    assert!(matches!(cause, AmqpError::ConnectionError(_)));
    assert_eq!(broker.connection_attempts(), 3);
    assert_eq!(conn.state(), RecoveryState::Abandoned);
}

#[tokio::test]
async fn refused_connection_abandons_without_retrying() {
    let broker = MemoryBroker::new();
    let (conn, mut events) = connect(&broker, fast(), RecoveryPolicy::default()).await;
    broker.refuse_connections(true);

    broker.kill_connections();
    let cause = abandoned(&mut events).await;

    assert!(matches!(cause, AmqpError::ConnectionRejected(_)));
    assert_eq!(broker.connection_attempts(), 2);
    assert!(matches!(
        conn.create_channel().await,
        Err(AmqpError::ConnectionClosed(_))
    ));
}

#[tokio::test]
async fn shutdown_listeners_fire_once_per_shutdown() {
    let broker = MemoryBroker::new();
    let (conn, mut events) = connect(&broker, fast(), RecoveryPolicy::default()).await;
    let channel = conn.create_channel().await.unwrap();

    let connection_hits = Arc::new(AtomicUsize::new(0));
    let channel_hits = Arc::new(AtomicUsize::new(0));
    {
        let hits = connection_hits.clone();
        conn.add_shutdown_listener(Arc::new(move |_: &ShutdownSignal| {
            hits.fetch_add(1, Ordering::SeqCst);
        }));
        let hits = channel_hits.clone();
        channel.add_shutdown_listener(Arc::new(move |_: &ShutdownSignal| {
            hits.fetch_add(1, Ordering::SeqCst);
        }));
    }

    broker.kill_connections();
    completed(&mut events).await;
    assert_eq!(connection_hits.load(Ordering::SeqCst), 1);
    assert_eq!(channel_hits.load(Ordering::SeqCst), 1);

    conn.close().await.unwrap();
    conn.close().await.unwrap();
    assert_eq!(connection_hits.load(Ordering::SeqCst), 2);
    assert_eq!(conn.state(), RecoveryState::Abandoned);
}

#[tokio::test]
async fn restores_channel_modes() {
    let broker = MemoryBroker::new();
    let (conn, mut events) = connect(&broker, fast(), RecoveryPolicy::default()).await;
    let channel = conn.create_channel().await.unwrap();
    channel.basic_qos(10, false).await.unwrap();
    channel.basic_qos(50, true).await.unwrap();
    channel.confirm_select().await.unwrap();

    broker.kill_connections();
    broker.clear_operations();
    completed(&mut events).await;

    assert_eq!(
        broker.operations(),
        vec![
            "connection.open",
            "channel.open 1",
            "basic.qos 50 global=true",
            "basic.qos 10 global=false",
            "confirm.select 1",
        ]
    );
    assert_eq!(channel.number(), 1);
}

#[tokio::test]
async fn cancel_accepts_a_tag_replaced_by_recovery() {
    let broker = MemoryBroker::new();
    let (conn, mut events) = connect(&broker, fast(), RecoveryPolicy::default()).await;
    let channel = conn.create_channel().await.unwrap();
    channel
        .queue_declare(&QueueDefinition::new("jobs").durable())
        .await
        .unwrap();
    let old_tag = channel
        .basic_consume(&ConsumerDefinition::new("jobs"), Arc::new(Collector::default()))
        .await
        .unwrap();

    broker.kill_connections();
    let (renamed, _) = completed(&mut events).await;
    let new_tag = renamed.get(&old_tag).cloned().unwrap();

    channel.basic_cancel(&old_tag).await.unwrap();

    assert!(broker.operations().contains(&format!("basic.cancel {new_tag}")));
    assert!(broker.consumers_on("jobs").is_empty());
    assert!(conn
        .recorded_entities()
        .iter()
        .all(|e| !matches!(e, RecordedEntity::Consumer(_))));
}

#[tokio::test]
async fn deleted_entities_are_not_replayed() {
    let broker = MemoryBroker::new();
    let (conn, mut events) = connect(&broker, fast(), RecoveryPolicy::default()).await;
    let channel = conn.create_channel().await.unwrap();
    let consumer = Arc::new(Collector::default());

    for name in ["E", "E2"] {
        channel
            .exchange_declare(&ExchangeDefinition::new(name).fanout())
            .await
            .unwrap();
    }
    channel.queue_declare(&QueueDefinition::new("Q")).await.unwrap();
    channel
        .queue_bind(&QueueBinding::new("Q").exchange("E"))
        .await
        .unwrap();
    channel
        .exchange_bind(&ExchangeBinding::new("E2", "E"))
        .await
        .unwrap();
    let tag = channel
        .basic_consume(&ConsumerDefinition::new("Q"), consumer.clone())
        .await
        .unwrap();

    channel.queue_delete("Q", false, false).await.unwrap();
    assert_eq!(*consumer.cancelled.lock(), vec![tag]);
    assert_eq!(conn.recorded_entities().len(), 3);

    channel.exchange_delete("E", false).await.unwrap();
    assert_eq!(conn.recorded_entities().len(), 1);

    broker.kill_connections();
    broker.clear_operations();
    completed(&mut events).await;

    assert_eq!(
        broker.operations(),
        vec!["connection.open", "channel.open 1", "exchange.declare E2"]
    );
}

#[tokio::test]
async fn topology_of_closed_channels_is_still_replayed() {
    let broker = MemoryBroker::new();
    let (conn, mut events) = connect(&broker, fast(), RecoveryPolicy::default()).await;
    let setup = conn.create_channel().await.unwrap();
    setup
        .exchange_declare(&ExchangeDefinition::new("events").topic())
        .await
        .unwrap();
    setup.close().await.unwrap();

    broker.restart();
    assert!(!broker.has_exchange("events"));
    broker.clear_operations();
    completed(&mut events).await;

    assert!(broker.has_exchange("events"));
    let operations = broker.operations();
    assert_eq!(operations[0], "connection.open");
    assert!(operations[1].starts_with("channel.open"));
    assert_eq!(operations[2], "exchange.declare events");
    assert!(operations[3].starts_with("channel.close"));
    assert!(setup.exchange_declare(&ExchangeDefinition::new("x")).await.is_err());
}

#[tokio::test]
async fn without_topology_recovery_only_channels_come_back() {
    let broker = MemoryBroker::new();
    let (conn, mut events) = connect(
        &broker,
        fast().without_topology_recovery(),
        RecoveryPolicy::default(),
    )
    .await;
    let channel = conn.create_channel().await.unwrap();
    channel
        .exchange_declare(&ExchangeDefinition::new("E"))
        .await
        .unwrap();

    broker.kill_connections();
    broker.clear_operations();
    completed(&mut events).await;

    assert_eq!(broker.operations(), vec!["connection.open", "channel.open 1"]);
    assert_eq!(conn.recorded_entities().len(), 1);
}

struct SkipTemporary;

impl TopologyRecoveryFilter for SkipTemporary {
    fn filter_exchange(&self, exchange: &RecordedExchange) -> bool {
        !exchange.name.starts_with("tmp.")
    }
}

#[tokio::test]
async fn filtered_entities_stay_recorded_but_are_not_replayed() {
    let broker = MemoryBroker::new();
    let policy = RecoveryPolicy::default().topology_filter(Arc::new(SkipTemporary));
    let (conn, mut events) = connect(&broker, fast(), policy).await;
    let channel = conn.create_channel().await.unwrap();
    for name in ["tmp.scratch", "orders"] {
        channel
            .exchange_declare(&ExchangeDefinition::new(name))
            .await
            .unwrap();
    }

    broker.kill_connections();
    broker.clear_operations();
    completed(&mut events).await;

    let operations = broker.operations();
    assert!(operations.contains(&"exchange.declare orders".to_owned()));
    assert!(!operations.contains(&"exchange.declare tmp.scratch".to_owned()));
    assert_eq!(conn.recorded_entities().len(), 2);
}

#[tokio::test]
async fn recovers_repeatedly() {
    let broker = MemoryBroker::new();
    let (conn, mut events) = connect(&broker, fast(), RecoveryPolicy::default()).await;
    let channel = conn.create_channel().await.unwrap();
    let consumer = Arc::new(Collector::default());
    let queue = channel
        .queue_declare(&QueueDefinition::server_named())
        .await
        .unwrap();
    channel
        .basic_consume(&ConsumerDefinition::new(&queue).tag("c1"), consumer.clone())
        .await
        .unwrap();

    let mut current = queue;
    for _ in 0..3 {
        broker.kill_connections();
        let (renamed, _) = completed(&mut events).await;
        current = renamed.get(&current).cloned().unwrap();
    }

    assert_eq!(broker.queue_names(), vec![current.clone()]);
    assert_eq!(broker.consumers_on(&current), vec!["c1".to_owned()]);
    assert_eq!(*consumer.recovered.lock(), vec!["c1"; 3]);

    channel
        .basic_publish("", &current, b"hello", BasicProperties::default())
        .await
        .unwrap();
    assert_eq!(consumer.deliveries.lock().len(), 1);
}
