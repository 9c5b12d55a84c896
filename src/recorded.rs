// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Recorded Topology Entities
//!
//! A recorded entity captures what the application asked to exist, with
//! enough detail to declare it again from scratch on a new channel. The set
//! of kinds is closed: exchanges, queues, bindings and consumers, wrapped by
//! [`RecordedEntity`] so callers can match exhaustively.
//!
//! Equality compares declaration fields only. The channel an entity was
//! declared through and the consumer callback are runtime attachments and do
//! not take part in identity.

use crate::{
    consumer::{ConsumerCallback, ConsumerDefinition},
    errors::AmqpError,
    exchange::{ExchangeBinding, ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
    transport::TransportChannel,
};
use lapin::{
    options::{
        BasicConsumeOptions, ExchangeBindOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
};
use std::{fmt, sync::Arc};

/// Replay order. Variants are declared in dependency order so `Ord` sorts correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    Exchange,
    Queue,
    Binding,
    Consumer,
}

/// An exchange declaration as it will be re-issued on recovery.
#[derive(Debug, Clone)]
pub struct RecordedExchange {
    pub(crate) channel: u16,
    /// Exchange name
    pub name: String,
    /// Exchange type
    pub kind: ExchangeKind,
    /// Survives broker restarts
    pub durable: bool,
    /// Deleted by the broker once its last binding is removed
    pub auto_delete: bool,
    /// Only reachable through exchange-to-exchange bindings
    pub internal: bool,
    /// Extra declaration arguments, e.g. `alternate-exchange`
    pub arguments: FieldTable,
}

impl RecordedExchange {
    pub(crate) fn new(channel: u16, def: &ExchangeDefinition) -> RecordedExchange {
        RecordedExchange {
            channel,
            name: def.name.clone(),
            kind: def.kind.clone(),
            durable: def.durable,
            auto_delete: def.delete,
            internal: def.internal,
            arguments: def.arguments(),
        }
    }

    /// Declares the exchange again on `channel`.
    pub async fn recover(&self, channel: &dyn TransportChannel) -> Result<(), AmqpError> {
        channel
            .exchange_declare(
                &self.name,
                &self.kind,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: self.durable,
                    auto_delete: self.auto_delete,
                    internal: self.internal,
                    nowait: false,
                },
                self.arguments.clone(),
            )
            .await
    }
}

impl PartialEq for RecordedExchange {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.kind == other.kind
            && self.durable == other.durable
            && self.auto_delete == other.auto_delete
            && self.internal == other.internal
            && self.arguments == other.arguments
    }
}

impl fmt::Display for RecordedExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RecordedExchange[name={}, type={}, durable={}, autoDelete={}, channel={}]",
            self.name, self.kind, self.durable, self.auto_delete, self.channel
        )
    }
}

/// A queue declaration as it will be re-issued on recovery.
#[derive(Debug, Clone)]
pub struct RecordedQueue {
    pub(crate) channel: u16,
    /// Current name; rewritten in place when a server-named queue is recovered.
    pub name: String,
    /// Declared with an empty name; the broker assigns a new one on every recovery
    pub server_named: bool,
    /// Survives broker restarts
    pub durable: bool,
    /// Owned by the declaring connection
    pub exclusive: bool,
    /// Deleted by the broker once its last consumer is cancelled
    pub auto_delete: bool,
    /// Extra declaration arguments, e.g. `x-message-ttl`
    pub arguments: FieldTable,
}

impl RecordedQueue {
    pub(crate) fn new(channel: u16, actual_name: &str, def: &QueueDefinition) -> RecordedQueue {
        RecordedQueue {
            channel,
            name: actual_name.to_owned(),
            server_named: def.is_server_named(),
            durable: def.durable,
            exclusive: def.exclusive,
            auto_delete: def.delete,
            arguments: def.arguments(),
        }
    }

    /// Declares the queue again and returns the name the broker answered with.
    pub async fn recover(&self, channel: &dyn TransportChannel) -> Result<String, AmqpError> {
        let requested = if self.server_named { "" } else { &self.name };

        channel
            .queue_declare(
                requested,
                QueueDeclareOptions {
                    passive: false,
                    durable: self.durable,
                    exclusive: self.exclusive,
                    auto_delete: self.auto_delete,
                    nowait: false,
                },
                self.arguments.clone(),
            )
            .await
    }
}

impl PartialEq for RecordedQueue {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.server_named == other.server_named
            && self.durable == other.durable
            && self.exclusive == other.exclusive
            && self.auto_delete == other.auto_delete
            && self.arguments == other.arguments
    }
}

impl fmt::Display for RecordedQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RecordedQueue[name={}, serverNamed={}, durable={}, exclusive={}, autoDelete={}, channel={}]",
            self.name, self.server_named, self.durable, self.exclusive, self.auto_delete, self.channel
        )
    }
}

/// What a binding's destination is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    /// Exchange to queue
    Queue,
    /// Exchange to exchange
    Exchange,
}

/// A binding as it will be re-issued on recovery.
#[derive(Debug, Clone)]
pub struct RecordedBinding {
    pub(crate) channel: u16,
    pub kind: BindingKind,
    /// Always an exchange.
    pub source: String,
    /// A queue or an exchange depending on `kind`.
    pub destination: String,
    pub routing_key: String,
    /// Binding arguments, matched by headers exchanges
    pub arguments: FieldTable,
}

impl RecordedBinding {
    pub(crate) fn queue(channel: u16, binding: &QueueBinding) -> RecordedBinding {
        RecordedBinding {
            channel,
            kind: BindingKind::Queue,
            source: binding.exchange_name.clone(),
            destination: binding.queue_name.clone(),
            routing_key: binding.routing_key.clone(),
            arguments: FieldTable::from(binding.params.clone()),
        }
    }

    pub(crate) fn exchange(channel: u16, binding: &ExchangeBinding) -> RecordedBinding {
        RecordedBinding {
            channel,
            kind: BindingKind::Exchange,
            source: binding.source.clone(),
            destination: binding.destination.clone(),
            routing_key: binding.routing_key.clone(),
            arguments: FieldTable::from(binding.params.clone()),
        }
    }

    /// Binds again on `channel`, using the destination's current name.
    pub async fn recover(&self, channel: &dyn TransportChannel) -> Result<(), AmqpError> {
        match self.kind {
            BindingKind::Queue => {
                channel
                    .queue_bind(
                        &self.destination,
                        &self.source,
                        &self.routing_key,
                        QueueBindOptions { nowait: false },
                        self.arguments.clone(),
                    )
                    .await
            }
            BindingKind::Exchange => {
                channel
                    .exchange_bind(
                        &self.destination,
                        &self.source,
                        &self.routing_key,
                        ExchangeBindOptions { nowait: false },
                        self.arguments.clone(),
                    )
                    .await
            }
        }
    }
}

impl PartialEq for RecordedBinding {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.source == other.source
            && self.destination == other.destination
            && self.routing_key == other.routing_key
            && self.arguments == other.arguments
    }
}

impl fmt::Display for RecordedBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            BindingKind::Queue => "RecordedQueueBinding",
            BindingKind::Exchange => "RecordedExchangeBinding",
        };
        write!(
            f,
            "{kind}[source={}, destination={}, routingKey={}, channel={}]",
            self.source, self.destination, self.routing_key, self.channel
        )
    }
}

/// A consumer registration, kept with its callback so recovery can hand
/// deliveries to the same application code.
#[derive(Clone)]
pub struct RecordedConsumer {
    pub(crate) channel: u16,
    /// Current name of the consumed queue
    pub queue: String,
    /// Current tag; rewritten in place when a server-assigned tag is recovered.
    pub tag: String,
    /// Registered with an empty tag; the broker assigns a new one on every recovery
    pub server_tag: bool,
    /// Deliveries are acknowledged on send
    pub auto_ack: bool,
    /// No other consumer may use the queue
    pub exclusive: bool,
    /// Extra consume arguments, e.g. `x-priority`
    pub arguments: FieldTable,
    pub(crate) callback: Arc<dyn ConsumerCallback>,
}

impl RecordedConsumer {
    pub(crate) fn new(
        channel: u16,
        actual_tag: &str,
        def: &ConsumerDefinition,
        callback: Arc<dyn ConsumerCallback>,
    ) -> RecordedConsumer {
        RecordedConsumer {
            channel,
            queue: def.queue.clone(),
            tag: actual_tag.to_owned(),
            server_tag: def.tag.is_empty(),
            auto_ack: def.auto_ack,
            exclusive: def.exclusive,
            arguments: def.arguments(),
            callback,
        }
    }

    /// The application callback deliveries are dispatched to.
    pub fn callback(&self) -> &Arc<dyn ConsumerCallback> {
        &self.callback
    }

    /// Registers the consumer again with the same callback and returns its tag.
    pub async fn recover(&self, channel: &dyn TransportChannel) -> Result<String, AmqpError> {
        let requested = if self.server_tag { "" } else { &self.tag };

        channel
            .basic_consume(
                &self.queue,
                requested,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: self.auto_ack,
                    exclusive: self.exclusive,
                    nowait: false,
                },
                self.arguments.clone(),
                self.callback.clone(),
            )
            .await
    }
}

impl PartialEq for RecordedConsumer {
    fn eq(&self, other: &Self) -> bool {
        self.queue == other.queue
            && self.tag == other.tag
            && self.server_tag == other.server_tag
            && self.auto_ack == other.auto_ack
            && self.exclusive == other.exclusive
            && self.arguments == other.arguments
    }
}

impl fmt::Debug for RecordedConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordedConsumer")
            .field("channel", &self.channel)
            .field("queue", &self.queue)
            .field("tag", &self.tag)
            .field("server_tag", &self.server_tag)
            .field("auto_ack", &self.auto_ack)
            .field("exclusive", &self.exclusive)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for RecordedConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RecordedConsumer[tag={}, queue={}, autoAck={}, exclusive={}, channel={}]",
            self.tag, self.queue, self.auto_ack, self.exclusive, self.channel
        )
    }
}

/// Any recorded topology element.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedEntity {
    Exchange(RecordedExchange),
    Queue(RecordedQueue),
    Binding(RecordedBinding),
    Consumer(RecordedConsumer),
}

impl RecordedEntity {
    /// The replay group the entity belongs to.
    pub fn category(&self) -> Category {
        match self {
            RecordedEntity::Exchange(_) => Category::Exchange,
            RecordedEntity::Queue(_) => Category::Queue,
            RecordedEntity::Binding(_) => Category::Binding,
            RecordedEntity::Consumer(_) => Category::Consumer,
        }
    }

    /// Number of the channel the entity was declared through.
    pub fn channel(&self) -> u16 {
        match self {
            RecordedEntity::Exchange(e) => e.channel,
            RecordedEntity::Queue(q) => q.channel,
            RecordedEntity::Binding(b) => b.channel,
            RecordedEntity::Consumer(c) => c.channel,
        }
    }

    /// Re-issues the declaration and returns the new server-assigned identity,
    /// if the entity has one (queue name or consumer tag).
    pub async fn recover(
        &self,
        channel: &dyn TransportChannel,
    ) -> Result<Option<String>, AmqpError> {
        match self {
            RecordedEntity::Exchange(e) => e.recover(channel).await.map(|_| None),
            RecordedEntity::Queue(q) => q.recover(channel).await.map(Some),
            RecordedEntity::Binding(b) => b.recover(channel).await.map(|_| None),
            RecordedEntity::Consumer(c) => c.recover(channel).await.map(Some),
        }
    }
}

impl fmt::Display for RecordedEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordedEntity::Exchange(e) => e.fmt(f),
            RecordedEntity::Queue(q) => q.fmt(f),
            RecordedEntity::Binding(b) => b.fmt(f),
            RecordedEntity::Consumer(c) => c.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{consumer::Delivery, transport::MockTransportChannel};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl ConsumerCallback for Noop {
        async fn handle_delivery(&self, _delivery: Delivery) {}
    }

    #[tokio::test]
    async fn exchange_binding_passes_destination_first() {
        let binding = RecordedBinding::exchange(
            1,
            &ExchangeBinding::new("audit", "events").routing_key("orders.#"),
        );

        let mut channel = MockTransportChannel::new();
        channel
            .expect_exchange_bind()
            .withf(|destination, source, key, _, _| {
                destination == "audit" && source == "events" && key == "orders.#"
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));

        binding.recover(&channel).await.unwrap();
    }

    #[tokio::test]
    async fn queue_binding_binds_queue_to_exchange() {
        let binding =
            RecordedBinding::queue(1, &QueueBinding::new("q").exchange("e").routing_key("k"));

        let mut channel = MockTransportChannel::new();
        channel
            .expect_queue_bind()
            .withf(|queue, exchange, key, _, _| queue == "q" && exchange == "e" && key == "k")
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));

        binding.recover(&channel).await.unwrap();
    }

    #[tokio::test]
    async fn server_named_queue_redeclares_anonymously() {
        let queue = RecordedQueue::new(1, "amq.gen-old", &QueueDefinition::server_named());

        let mut channel = MockTransportChannel::new();
        channel
            .expect_queue_declare()
            .withf(|name, opts, _| name.is_empty() && opts.exclusive && !opts.passive)
            .times(1)
            .returning(|_, _, _| Ok("amq.gen-new".to_owned()));

        let entity = RecordedEntity::Queue(queue);
        assert_eq!(
            entity.recover(&channel).await.unwrap(),
            Some("amq.gen-new".to_owned())
        );
    }

    #[tokio::test]
    async fn named_queue_keeps_its_name() {
        let queue = RecordedQueue::new(1, "orders", &QueueDefinition::new("orders").durable());

        let mut channel = MockTransportChannel::new();
        channel
            .expect_queue_declare()
            .withf(|name, opts, _| name == "orders" && opts.durable)
            .times(1)
            .returning(|name, _, _| Ok(name.to_owned()));

        assert_eq!(queue.recover(&channel).await.unwrap(), "orders");
    }

    #[tokio::test]
    async fn consumer_reuses_client_tag_and_callback() {
        let callback: Arc<dyn ConsumerCallback> = Arc::new(Noop);
        let consumer = RecordedConsumer::new(
            2,
            "worker-1",
            &ConsumerDefinition::new("orders").tag("worker-1").auto_ack(),
            callback.clone(),
        );

        let expected = callback.clone();
        let mut channel = MockTransportChannel::new();
        channel
            .expect_basic_consume()
            .withf(move |queue, tag, opts, _, cb| {
                queue == "orders" && tag == "worker-1" && opts.no_ack && Arc::ptr_eq(cb, &expected)
            })
            .times(1)
            .returning(|_, tag, _, _, _| Ok(tag.to_owned()));

        assert_eq!(consumer.recover(&channel).await.unwrap(), "worker-1");
    }

    #[tokio::test]
    async fn propagates_broker_rejection() {
        let exchange = RecordedExchange::new(1, &ExchangeDefinition::new("E").topic());

        let mut channel = MockTransportChannel::new();
        channel
            .expect_exchange_declare()
            .returning(|_, _, _, _| Err(AmqpError::EntityRejected("PRECONDITION_FAILED".into())));

        let err = exchange.recover(&channel).await.unwrap_err();
        assert_eq!(err, AmqpError::EntityRejected("PRECONDITION_FAILED".into()));
    }

    #[test]
    fn identity_ignores_declaring_channel() {
        let def = QueueBinding::new("q").exchange("e").routing_key("k");

        assert_eq!(RecordedBinding::queue(1, &def), RecordedBinding::queue(7, &def));
        assert_ne!(
            RecordedBinding::queue(1, &def),
            RecordedBinding::queue(1, &def.clone().routing_key("other"))
        );
    }

    #[test]
    fn categories_sort_in_replay_order() {
        let mut categories = vec![
            Category::Consumer,
            Category::Binding,
            Category::Exchange,
            Category::Queue,
        ];
        categories.sort();

        assert_eq!(
            categories,
            vec![
                Category::Exchange,
                Category::Queue,
                Category::Binding,
                Category::Consumer
            ]
        );
    }
}
