// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! [`MemoryBroker`] simulates an AMQP 0-9-1 broker inside the process. It
//! keeps exchanges, queues, bindings and consumers, routes published messages
//! (direct, fanout, topic and exchange-to-exchange), and applies the broker
//! side effects a recovery has to cope with:
//!
//! - exclusive queues die with their connection;
//! - auto-delete queues die with their last consumer;
//! - a channel-level rejection closes the channel it happened on;
//! - non-durable entities are lost on [`MemoryBroker::restart`].
//!
//! Faults are injected explicitly: refused connects, rejected exchanges and
//! connection resets. Every protocol method the broker receives is appended
//! to an operation log so tests can assert the exact replay order.
//!
//! Deliveries are dispatched inline by the publishing call, which keeps
//! test scenarios deterministic. Messages buffered while a queue had no
//! consumer are handed to the next consumer from a spawned task.

use crate::{
    config::ConnectionParams,
    consumer::{ConsumerCallback, Delivery},
    errors::AmqpError,
    exchange::ExchangeKind,
    recorded::BindingKind,
    shutdown::{Listeners, ShutdownListener, ShutdownSignal},
    transport::{Transport, TransportChannel, TransportConnection},
};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeBindOptions,
        ExchangeDeclareOptions, ExchangeDeleteOptions, ExchangeUnbindOptions, QueueBindOptions,
        QueueDeclareOptions, QueueDeleteOptions,
    },
    types::FieldTable,
    BasicProperties,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};
use tracing::debug;
use uuid::Uuid;

const PREDECLARED: [(&str, ExchangeKind); 4] = [
    ("amq.direct", ExchangeKind::Direct),
    ("amq.fanout", ExchangeKind::Fanout),
    ("amq.topic", ExchangeKind::Topic),
    ("amq.headers", ExchangeKind::Headers),
];

#[derive(Debug, Clone)]
struct ExchangeState {
    kind: ExchangeKind,
    durable: bool,
    auto_delete: bool,
    internal: bool,
}

#[derive(Debug, Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    properties: BasicProperties,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct QueueState {
    durable: bool,
    auto_delete: bool,
    owner: Option<u64>,
    consumers: Vec<String>,
    had_consumers: bool,
    next_consumer: usize,
    messages: VecDeque<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BindingState {
    kind: BindingKind,
    source: String,
    destination: String,
    routing_key: String,
}

struct ConsumerState {
    queue: String,
    connection: u64,
    channel: u16,
    callback: Arc<dyn ConsumerCallback>,
}

type Dispatch = (Arc<dyn ConsumerCallback>, Delivery);

/// Broker reply text for a refused channel-level method.
type Reject = String;

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<BindingState>,
    consumers: HashMap<String, ConsumerState>,
    connections: BTreeMap<u64, Weak<MemoryConnection>>,
    delivery_tags: HashMap<(u64, u16), u64>,
    next_connection: u64,
    connection_attempts: u32,
    failing_connects: u32,
    refusing: bool,
    rejected_exchanges: HashSet<String>,
    operations: Vec<String>,
}

impl BrokerState {
    fn new() -> BrokerState {
        let mut state = BrokerState::default();
        state.predeclare();
        state
    }

    fn predeclare(&mut self) {
        for (name, kind) in PREDECLARED {
            self.exchanges.insert(
                name.to_owned(),
                ExchangeState {
                    kind,
                    durable: true,
                    auto_delete: false,
                    internal: false,
                },
            );
        }
    }

    fn log(&mut self, operation: String) {
        debug!(operation, "memory broker");
        self.operations.push(operation);
    }

    fn declare_exchange(
        &mut self,
        name: &str,
        kind: &ExchangeKind,
        options: &ExchangeDeclareOptions,
    ) -> Result<(), Reject> {
        self.log(format!("exchange.declare {name}"));

        if self.rejected_exchanges.contains(name) {
            return Err(format!(
                "PRECONDITION_FAILED - inequivalent arg for exchange '{name}'"
            ));
        }
        match self.exchanges.get(name) {
            Some(existing) if !options.passive && existing.kind != *kind => Err(format!(
                "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{name}'"
            )),
            Some(_) => Ok(()),
            None if options.passive => Err(format!("NOT_FOUND - no exchange '{name}'")),
            None if name.starts_with("amq.") => {
                Err(format!("ACCESS_REFUSED - exchange name '{name}' is reserved"))
            }
            None => {
                self.exchanges.insert(
                    name.to_owned(),
                    ExchangeState {
                        kind: kind.clone(),
                        durable: options.durable,
                        auto_delete: options.auto_delete,
                        internal: options.internal,
                    },
                );
                Ok(())
            }
        }
    }

    fn delete_exchange(&mut self, name: &str, if_unused: bool) -> Result<(), Reject> {
        self.log(format!("exchange.delete {name}"));

        if if_unused && self.bindings.iter().any(|b| b.source == name) {
            return Err(format!("PRECONDITION_FAILED - exchange '{name}' in use"));
        }
        self.exchanges.remove(name);
        self.bindings.retain(|b| {
            b.source != name && !(b.kind == BindingKind::Exchange && b.destination == name)
        });
        Ok(())
    }

    fn declare_queue(
        &mut self,
        name: &str,
        connection: u64,
        options: &QueueDeclareOptions,
    ) -> Result<String, Reject> {
        self.log(format!("queue.declare {name}"));

        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_owned()
        };

        match self.queues.get(&name) {
            Some(queue) if queue.owner.is_some_and(|owner| owner != connection) => Err(format!(
                "RESOURCE_LOCKED - cannot obtain exclusive access to queue '{name}'"
            )),
            Some(queue) if !options.passive && queue.durable != options.durable => Err(format!(
                "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{name}'"
            )),
            Some(_) => Ok(name),
            None if options.passive => Err(format!("NOT_FOUND - no queue '{name}'")),
            None => {
                self.queues.insert(
                    name.clone(),
                    QueueState {
                        durable: options.durable,
                        auto_delete: options.auto_delete,
                        owner: options.exclusive.then_some(connection),
                        ..Default::default()
                    },
                );
                Ok(name)
            }
        }
    }

    /// Removes a queue and returns the callbacks of the consumers it cancels.
    fn remove_queue(&mut self, name: &str) -> Vec<(String, Arc<dyn ConsumerCallback>)> {
        let Some(queue) = self.queues.remove(name) else {
            return vec![];
        };
        self.bindings
            .retain(|b| !(b.kind == BindingKind::Queue && b.destination == name));
        queue
            .consumers
            .iter()
            .filter_map(|tag| {
                self.consumers
                    .remove(tag)
                    .map(|c| (tag.clone(), c.callback))
            })
            .collect()
    }

    fn delete_queue(
        &mut self,
        name: &str,
        options: &QueueDeleteOptions,
    ) -> Result<(u32, Vec<(String, Arc<dyn ConsumerCallback>)>), Reject> {
        self.log(format!("queue.delete {name}"));

        let Some(queue) = self.queues.get(name) else {
            return Ok((0, vec![]));
        };
        if options.if_unused && !queue.consumers.is_empty() {
            return Err(format!("PRECONDITION_FAILED - queue '{name}' in use"));
        }
        if options.if_empty && !queue.messages.is_empty() {
            return Err(format!("PRECONDITION_FAILED - queue '{name}' not empty"));
        }

        let purged = queue.messages.len() as u32;
        Ok((purged, self.remove_queue(name)))
    }

    fn bind(&mut self, binding: BindingState) -> Result<(), Reject> {
        let method = match binding.kind {
            BindingKind::Queue => "queue.bind",
            BindingKind::Exchange => "exchange.bind",
        };
        self.log(format!(
            "{method} {} {} {}",
            binding.destination, binding.source, binding.routing_key
        ));

        if !self.exchanges.contains_key(&binding.source) {
            return Err(format!("NOT_FOUND - no exchange '{}'", binding.source));
        }
        let destination_exists = match binding.kind {
            BindingKind::Queue => self.queues.contains_key(&binding.destination),
            BindingKind::Exchange => self.exchanges.contains_key(&binding.destination),
        };
        if !destination_exists {
            return Err(format!("NOT_FOUND - no destination '{}'", binding.destination));
        }

        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
        Ok(())
    }

    fn unbind(&mut self, binding: &BindingState) {
        let method = match binding.kind {
            BindingKind::Queue => "queue.unbind",
            BindingKind::Exchange => "exchange.unbind",
        };
        self.log(format!(
            "{method} {} {} {}",
            binding.destination, binding.source, binding.routing_key
        ));

        self.bindings.retain(|b| b != binding);
        let auto_delete = self
            .exchanges
            .get(&binding.source)
            .is_some_and(|e| e.auto_delete);
        if auto_delete && !self.bindings.iter().any(|b| b.source == binding.source) {
            self.exchanges.remove(&binding.source);
        }
    }

    fn consume(
        &mut self,
        queue: &str,
        tag: &str,
        connection: u64,
        channel: u16,
        callback: Arc<dyn ConsumerCallback>,
    ) -> Result<(String, Vec<Dispatch>), Reject> {
        self.log(format!("basic.consume {queue}"));

        let tag = if tag.is_empty() {
            format!("amq.ctag-{}", Uuid::new_v4().simple())
        } else {
            tag.to_owned()
        };
        if self.consumers.contains_key(&tag) {
            return Err(format!("NOT_ALLOWED - attempt to reuse consumer tag '{tag}'"));
        }
        let Some(state) = self.queues.get_mut(queue) else {
            return Err(format!("NOT_FOUND - no queue '{queue}'"));
        };
        if state.owner.is_some_and(|owner| owner != connection) {
            return Err(format!(
                "RESOURCE_LOCKED - cannot obtain exclusive access to queue '{queue}'"
            ));
        }

        state.consumers.push(tag.clone());
        state.had_consumers = true;
        let pending: Vec<Message> = state.messages.drain(..).collect();
        self.consumers.insert(
            tag.clone(),
            ConsumerState {
                queue: queue.to_owned(),
                connection,
                channel,
                callback: callback.clone(),
            },
        );

        let dispatches = pending
            .into_iter()
            .map(|message| {
                let delivery_tag = self.next_delivery_tag(connection, channel);
                (callback.clone(), delivery(&tag, delivery_tag, message))
            })
            .collect();
        Ok((tag, dispatches))
    }

    fn next_delivery_tag(&mut self, connection: u64, channel: u16) -> u64 {
        let tag = self.delivery_tags.entry((connection, channel)).or_default();
        *tag += 1;
        *tag
    }

    /// Removes a consumer, and its queue if the queue is auto-delete and
    /// this was its last consumer.
    fn remove_consumer(&mut self, tag: &str) {
        let Some(consumer) = self.consumers.remove(tag) else {
            return;
        };
        let Some(queue) = self.queues.get_mut(&consumer.queue) else {
            return;
        };
        queue.consumers.retain(|t| t != tag);
        if queue.auto_delete && queue.had_consumers && queue.consumers.is_empty() {
            self.remove_queue(&consumer.queue);
        }
    }

    fn cancel(&mut self, tag: &str) {
        self.log(format!("basic.cancel {tag}"));
        self.remove_consumer(tag);
    }

    fn drop_channel(&mut self, connection: u64, channel: u16) {
        let tags: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.connection == connection && c.channel == channel)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in tags {
            self.remove_consumer(&tag);
        }
        self.delivery_tags.remove(&(connection, channel));
    }

    fn drop_connection(&mut self, connection: u64) {
        self.connections.remove(&connection);

        let tags: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.connection == connection)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in tags {
            self.remove_consumer(&tag);
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            self.remove_queue(&name);
        }
        self.delivery_tags.retain(|(c, _), _| *c != connection);
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<BTreeSet<String>, Reject> {
        let mut targets = BTreeSet::new();
        if exchange.is_empty() {
            if self.queues.contains_key(routing_key) {
                targets.insert(routing_key.to_owned());
            }
            return Ok(targets);
        }
        if !self.exchanges.contains_key(exchange) {
            return Err(format!("NOT_FOUND - no exchange '{exchange}'"));
        }

        let mut visited = HashSet::new();
        let mut pending = vec![exchange.to_owned()];
        while let Some(name) = pending.pop() {
            if !visited.insert(name.clone()) {
                continue;
            }
            let Some(state) = self.exchanges.get(&name) else {
                continue;
            };
            for binding in self
                .bindings
                .iter()
                .filter(|b| b.source == name && matches(&state.kind, &b.routing_key, routing_key))
            {
                match binding.kind {
                    BindingKind::Queue => {
                        targets.insert(binding.destination.clone());
                    }
                    BindingKind::Exchange => pending.push(binding.destination.clone()),
                }
            }
        }
        Ok(targets)
    }

    fn publish(&mut self, message: Message) -> Result<Vec<Dispatch>, Reject> {
        self.log(format!(
            "basic.publish {} {}",
            message.exchange, message.routing_key
        ));

        if self
            .exchanges
            .get(&message.exchange)
            .is_some_and(|e| e.internal)
        {
            return Err(format!(
                "ACCESS_REFUSED - cannot publish to internal exchange '{}'",
                message.exchange
            ));
        }

        let mut dispatches = vec![];
        for name in self.route(&message.exchange, &message.routing_key)? {
            let Some(queue) = self.queues.get_mut(&name) else {
                continue;
            };
            if queue.consumers.is_empty() {
                queue.messages.push_back(message.clone());
                continue;
            }

            let tag = queue.consumers[queue.next_consumer % queue.consumers.len()].clone();
            queue.next_consumer = queue.next_consumer.wrapping_add(1);
            let Some((callback, connection, channel)) = self
                .consumers
                .get(&tag)
                .map(|c| (c.callback.clone(), c.connection, c.channel))
            else {
                continue;
            };
            let delivery_tag = self.next_delivery_tag(connection, channel);
            dispatches.push((callback, delivery(&tag, delivery_tag, message.clone())));
        }
        Ok(dispatches)
    }

    /// Drops everything a broker restart does not keep.
    fn restart(&mut self) {
        self.log("broker.restart".to_owned());

        self.exchanges.retain(|_, e| e.durable);
        self.queues.retain(|_, q| q.durable);
        for queue in self.queues.values_mut() {
            queue.consumers.clear();
        }
        self.consumers.clear();

        let exchanges = &self.exchanges;
        let queues = &self.queues;
        self.bindings.retain(|b| {
            exchanges.contains_key(&b.source)
                && match b.kind {
                    BindingKind::Queue => queues.contains_key(&b.destination),
                    BindingKind::Exchange => exchanges.contains_key(&b.destination),
                }
        });
    }
}

fn delivery(consumer_tag: &str, delivery_tag: u64, message: Message) -> Delivery {
    Delivery {
        consumer_tag: consumer_tag.to_owned(),
        delivery_tag,
        exchange: message.exchange,
        routing_key: message.routing_key,
        redelivered: false,
        properties: message.properties,
        data: message.data,
    }
}

fn matches(kind: &ExchangeKind, pattern: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout | ExchangeKind::Headers => true,
        ExchangeKind::Topic => topic_matches(pattern, routing_key),
        ExchangeKind::Direct | ExchangeKind::XMessageDelayed => pattern == routing_key,
    }
}

/// AMQP topic matching: `*` matches one word, `#` zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn words(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| words(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && words(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && words(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words(&pattern, &key)
}

async fn dispatch(dispatches: Vec<Dispatch>) {
    for (callback, delivery) in dispatches {
        callback.handle_delivery(delivery).await;
    }
}

/// Shared handle on a simulated broker. Clones refer to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        MemoryBroker {
            state: Arc::new(Mutex::new(BrokerState::new())),
        }
    }
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    /// Makes the next `count` connection attempts fail as refused.
    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().failing_connects = count;
    }

    /// Refuses every connection attempt with an authentication failure.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refusing = refuse;
    }

    /// Rejects every declaration of `exchange` with PRECONDITION_FAILED.
    pub fn reject_exchange(&self, exchange: &str) {
        self.state
            .lock()
            .rejected_exchanges
            .insert(exchange.to_owned());
    }

    pub fn accept_exchange(&self, exchange: &str) {
        self.state.lock().rejected_exchanges.remove(exchange);
    }

    /// Resets every open connection as a network failure would.
    pub fn kill_connections(&self) {
        let connections: Vec<Arc<MemoryConnection>> = self
            .state
            .lock()
            .connections
            .values()
            .filter_map(Weak::upgrade)
            .collect();

        for connection in connections {
            connection.shutdown(ShutdownSignal::transport("connection reset by peer"));
        }
    }

    /// Resets every connection and drops all non-durable entities.
    pub fn restart(&self) {
        self.kill_connections();
        self.state.lock().restart();
    }

    pub fn connection_attempts(&self) -> u32 {
        self.state.lock().connection_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.state
            .lock()
            .connections
            .values()
            .filter(|c| c.strong_count() > 0)
            .count()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state.lock().exchanges.contains_key(name)
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.state.lock().exchanges.get(name).map(|e| e.kind.clone())
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// `(source, routing_key)` of every binding into `destination`.
    pub fn bindings_to(&self, destination: &str) -> Vec<(String, String)> {
        self.state
            .lock()
            .bindings
            .iter()
            .filter(|b| b.destination == destination)
            .map(|b| (b.source.clone(), b.routing_key.clone()))
            .collect()
    }

    pub fn consumers_on(&self, queue: &str) -> Vec<String> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.clone())
            .unwrap_or_default()
    }

    pub fn message_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    /// Every protocol method received so far, e.g. `"queue.bind q E k"`.
    pub fn operations(&self) -> Vec<String> {
        self.state.lock().operations.clone()
    }

    pub fn clear_operations(&self) {
        self.state.lock().operations.clear();
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn open_connection(
        &self,
        params: &ConnectionParams,
    ) -> Result<Arc<dyn TransportConnection>, AmqpError> {
        let mut state = self.state.lock();
        state.connection_attempts += 1;
        state.log("connection.open".to_owned());

        if state.refusing {
            return Err(AmqpError::ConnectionRejected(format!(
                "ACCESS_REFUSED - login refused for user '{}'",
                params.user
            )));
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        state.next_connection += 1;
        let connection = Arc::new(MemoryConnection {
            id: state.next_connection,
            broker: self.clone(),
            channel_max: params.channel_max,
            closed: AtomicBool::new(false),
            channels: Mutex::new(BTreeMap::new()),
            listeners: Listeners::default(),
        });
        state
            .connections
            .insert(connection.id, Arc::downgrade(&connection));
        Ok(connection)
    }
}

pub struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
    channel_max: u16,
    closed: AtomicBool,
    channels: Mutex<BTreeMap<u16, Arc<MemoryChannel>>>,
    listeners: Listeners<dyn ShutdownListener>,
}

impl MemoryConnection {
    fn shutdown(&self, signal: ShutdownSignal) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.broker.state.lock().drop_connection(self.id);
        let channels: Vec<Arc<MemoryChannel>> =
            std::mem::take(&mut *self.channels.lock()).into_values().collect();
        for channel in channels {
            channel.shutdown(signal.clone());
        }
        self.listeners.fire(&signal);
    }
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    async fn open_channel(
        &self,
        number: Option<u16>,
    ) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::ConnectionError("connection is closed".to_owned()));
        }

        let mut channels = self.channels.lock();
        channels.retain(|_, c| c.is_open());
        let max = match self.channel_max {
            0 => u16::MAX,
            max => max,
        };
        let number = number
            .filter(|n| *n <= max && !channels.contains_key(n))
            .or_else(|| (1..=max).find(|n| !channels.contains_key(n)))
            .ok_or_else(|| AmqpError::ChannelError("no free channel number".to_owned()))?;

        let channel = Arc::new(MemoryChannel {
            number,
            connection: self.id,
            broker: self.broker.clone(),
            closed: AtomicBool::new(false),
            listeners: Listeners::default(),
        });
        channels.insert(number, channel.clone());
        self.broker
            .state
            .lock()
            .log(format!("channel.open {number}"));
        Ok(channel)
    }

    async fn close(&self, _reply_code: u16, reply_text: &str) -> Result<(), AmqpError> {
        self.broker.state.lock().log("connection.close".to_owned());
        self.shutdown(ShutdownSignal::application(true, reply_text));
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn on_shutdown(&self, listener: Arc<dyn ShutdownListener>) {
        self.listeners.add(listener);
    }
}

pub struct MemoryChannel {
    number: u16,
    connection: u64,
    broker: MemoryBroker,
    closed: AtomicBool,
    listeners: Listeners<dyn ShutdownListener>,
}

impl MemoryChannel {
    fn shutdown(&self, signal: ShutdownSignal) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.broker
            .state
            .lock()
            .drop_channel(self.connection, self.number);
        self.listeners.fire(&signal);
    }

    fn check_open(&self) -> Result<(), AmqpError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(AmqpError::ChannelError(format!(
                "channel {} is closed",
                self.number
            )))
        }
    }

    /// Applies a broker decision; a rejection closes the channel.
    fn settle<T>(&self, outcome: Result<T, Reject>) -> Result<T, AmqpError> {
        outcome.map_err(|reply| {
            self.shutdown(ShutdownSignal::peer(false, reply.clone()));
            AmqpError::EntityRejected(reply)
        })
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut BrokerState) -> T) -> T {
        f(&mut self.broker.state.lock())
    }
}

#[async_trait]
impl TransportChannel for MemoryChannel {
    fn number(&self) -> u16 {
        self.number
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn on_shutdown(&self, listener: Arc<dyn ShutdownListener>) {
        self.listeners.add(listener);
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: &ExchangeKind,
        options: ExchangeDeclareOptions,
        _arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.check_open()?;
        let outcome = self.with_state(|s| s.declare_exchange(exchange, kind, &options));
        self.settle(outcome)
    }

    async fn exchange_delete(
        &self,
        exchange: &str,
        options: ExchangeDeleteOptions,
    ) -> Result<(), AmqpError> {
        self.check_open()?;
        let outcome = self.with_state(|s| s.delete_exchange(exchange, options.if_unused));
        self.settle(outcome)
    }

    async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        _options: ExchangeBindOptions,
        _arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.check_open()?;
        let outcome = self.with_state(|s| {
            s.bind(BindingState {
                kind: BindingKind::Exchange,
                source: source.to_owned(),
                destination: destination.to_owned(),
                routing_key: routing_key.to_owned(),
            })
        });
        self.settle(outcome)
    }

    async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        _options: ExchangeUnbindOptions,
        _arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.check_open()?;
        self.with_state(|s| {
            s.unbind(&BindingState {
                kind: BindingKind::Exchange,
                source: source.to_owned(),
                destination: destination.to_owned(),
                routing_key: routing_key.to_owned(),
            })
        });
        Ok(())
    }

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        _arguments: FieldTable,
    ) -> Result<String, AmqpError> {
        self.check_open()?;
        let outcome = self.with_state(|s| s.declare_queue(queue, self.connection, &options));
        self.settle(outcome)
    }

    async fn queue_delete(
        &self,
        queue: &str,
        options: QueueDeleteOptions,
    ) -> Result<u32, AmqpError> {
        self.check_open()?;
        let outcome = self.with_state(|s| s.delete_queue(queue, &options));
        let (purged, cancelled) = self.settle(outcome)?;

        for (tag, callback) in cancelled {
            callback.handle_cancel(&tag).await;
        }
        Ok(purged)
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _options: QueueBindOptions,
        _arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.check_open()?;
        let outcome = self.with_state(|s| {
            s.bind(BindingState {
                kind: BindingKind::Queue,
                source: exchange.to_owned(),
                destination: queue.to_owned(),
                routing_key: routing_key.to_owned(),
            })
        });
        self.settle(outcome)
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.check_open()?;
        self.with_state(|s| {
            s.unbind(&BindingState {
                kind: BindingKind::Queue,
                source: exchange.to_owned(),
                destination: queue.to_owned(),
                routing_key: routing_key.to_owned(),
            })
        });
        Ok(())
    }

    async fn basic_qos(
        &self,
        prefetch_count: u16,
        options: BasicQosOptions,
    ) -> Result<(), AmqpError> {
        self.check_open()?;
        self.with_state(|s| {
            s.log(format!(
                "basic.qos {prefetch_count} global={}",
                options.global
            ))
        });
        Ok(())
    }

    async fn confirm_select(&self, _options: ConfirmSelectOptions) -> Result<(), AmqpError> {
        self.check_open()?;
        self.with_state(|s| s.log(format!("confirm.select {}", self.number)));
        Ok(())
    }

    async fn tx_select(&self) -> Result<(), AmqpError> {
        self.check_open()?;
        self.with_state(|s| s.log(format!("tx.select {}", self.number)));
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        _options: BasicConsumeOptions,
        _arguments: FieldTable,
        callback: Arc<dyn ConsumerCallback>,
    ) -> Result<String, AmqpError> {
        self.check_open()?;
        let outcome = self.with_state(|s| {
            s.consume(queue, consumer_tag, self.connection, self.number, callback)
        });
        let (tag, pending) = self.settle(outcome)?;

        // Runs detached so a recovery replaying this consumer never waits on
        // application callbacks.
        if !pending.is_empty() {
            tokio::spawn(dispatch(pending));
        }
        Ok(tag)
    }

    async fn basic_cancel(
        &self,
        consumer_tag: &str,
        _options: BasicCancelOptions,
    ) -> Result<(), AmqpError> {
        self.check_open()?;
        self.with_state(|s| s.cancel(consumer_tag));
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        _options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.check_open()?;
        let message = Message {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties,
            data: payload.to_vec(),
        };
        let outcome = self.with_state(|s| s.publish(message));
        let dispatches = self.settle(outcome)?;

        dispatch(dispatches).await;
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64, options: BasicAckOptions) -> Result<(), AmqpError> {
        self.check_open()?;
        self.with_state(|s| {
            s.log(format!(
                "basic.ack {delivery_tag} multiple={}",
                options.multiple
            ))
        });
        Ok(())
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        options: BasicNackOptions,
    ) -> Result<(), AmqpError> {
        self.check_open()?;
        self.with_state(|s| {
            s.log(format!(
                "basic.nack {delivery_tag} requeue={}",
                options.requeue
            ))
        });
        Ok(())
    }

    async fn close(&self, _reply_code: u16, reply_text: &str) -> Result<(), AmqpError> {
        self.with_state(|s| s.log(format!("channel.close {}", self.number)));
        self.shutdown(ShutdownSignal::application(false, reply_text));
        Ok(())
    }
}
