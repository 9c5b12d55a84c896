// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Declares a batch of exchanges, queues and bindings in one call. Everything
//! is declared through a [`RecoveringChannel`], so the whole topology is
//! recorded and replayed after a connection recovery.
//!
//! The main components are:
//! - `Topology` trait: Interface for topology management
//! - `AmqpTopology`: Implementation of the Topology trait for RabbitMQ

use crate::{
    channel::RecoveringChannel,
    errors::AmqpError,
    exchange::{ExchangeBinding, ExchangeDefinition},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use tracing::{debug, error};

/// Trait defining the interface for topology management.
///
/// This trait provides methods for registering exchanges, queues, and bindings,
/// as well as installing the topology to the RabbitMQ server.
#[async_trait]
pub trait Topology<'tp> {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: &'tp ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: &'tp QueueDefinition) -> Self;

    /// Adds an exchange-to-exchange binding to the topology.
    fn exchange_binding(self, binding: &'tp ExchangeBinding) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: &'tp QueueBinding) -> Self;

    /// Installs the topology to the RabbitMQ server.
    ///
    /// This creates all the exchanges and queues, and sets up all the bindings.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Topology trait.
pub struct AmqpTopology<'tp> {
    channel: RecoveringChannel,
    pub(crate) queues: Vec<&'tp QueueDefinition>,
    pub(crate) queues_binding: Vec<&'tp QueueBinding>,
    pub(crate) exchanges: Vec<&'tp ExchangeDefinition>,
    pub(crate) exchanges_binding: Vec<&'tp ExchangeBinding>,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new(channel: RecoveringChannel) -> AmqpTopology<'tp> {
        AmqpTopology {
            channel,
            queues: vec![],
            queues_binding: vec![],
            exchanges: vec![],
            exchanges_binding: vec![],
        }
    }
}

#[async_trait]
impl<'tp> Topology<'tp> for AmqpTopology<'tp> {
    fn exchange(mut self, def: &'tp ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue definition. Queues are declared in the order added;
    /// a named queue added twice is declared once. Every server-named
    /// definition yields its own queue.
    fn queue(mut self, def: &'tp QueueDefinition) -> Self {
        if def.is_server_named() || !self.queues.iter().any(|q| q.name == def.name) {
            self.queues.push(def);
        }
        self
    }

    fn exchange_binding(mut self, binding: &'tp ExchangeBinding) -> Self {
        self.exchanges_binding.push(binding);
        self
    }

    fn queue_binding(mut self, binding: &'tp QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs the topology to the RabbitMQ server.
    ///
    /// This method performs the following operations in order:
    /// 1. Creates all exchanges
    /// 2. Creates all queues
    /// 3. Sets up exchange-to-exchange bindings
    /// 4. Sets up queue-to-exchange bindings
    async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchange().await?;
        self.install_queue().await?;
        self.binding_exchanges().await?;
        self.binding_queues().await
    }
}

impl AmqpTopology<'_> {
    async fn install_exchange(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            if let Err(err) = self.channel.exchange_declare(exch).await {
                error!(
                    error = err.to_string(),
                    name = exch.name,
                    "error to declare the exchange"
                );
                return Err(err);
            }
        }

        Ok(())
    }

    async fn install_queue(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            if let Err(err) = self.channel.queue_declare(def).await {
                error!(error = err.to_string(), name = def.name, "error to declare the queue");
                return Err(err);
            }
        }

        Ok(())
    }

    async fn binding_exchanges(&self) -> Result<(), AmqpError> {
        for binding in &self.exchanges_binding {
            debug!(
                "binding exchange: {} to the exchange: {} with the key: {}",
                binding.destination, binding.source, binding.routing_key
            );

            if let Err(err) = self.channel.exchange_bind(binding).await {
                error!(error = err.to_string(), "error to bind exchange to exchange");
                return Err(err);
            }
        }

        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            if let Err(err) = self.channel.queue_bind(binding).await {
                error!(error = err.to_string(), "error to bind queue to exchange");
                return Err(err);
            }
        }

        debug!("queue was bounded");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ConnectionParams, RecoveryConfig, RecoveryPolicy},
        connection::RecoveringConnection,
        recorded::Category,
        transport::memory::MemoryBroker,
    };
    use std::sync::Arc;

    async fn open(broker: &MemoryBroker) -> RecoveringConnection {
        RecoveringConnection::open(
            Arc::new(broker.clone()),
            ConnectionParams::default(),
            RecoveryConfig::default(),
            RecoveryPolicy::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn installs_in_dependency_order_and_records_everything() {
        let broker = MemoryBroker::new();
        let conn = open(&broker).await;
        let channel = conn.create_channel().await.unwrap();

        let events = ExchangeDefinition::new("events").topic().durable();
        let audit = ExchangeDefinition::new("audit").fanout();
        let orders = QueueDefinition::new("orders").durable().ttl(60_000);
        let log = QueueDefinition::new("audit-log");
        let to_audit = ExchangeBinding::new("audit", "events").routing_key("#");
        let order_binding = QueueBinding::new("orders")
            .exchange("events")
            .routing_key("orders.*");
        let log_binding = QueueBinding::new("audit-log").exchange("audit");

        broker.clear_operations();
        AmqpTopology::new(channel)
            .queue_binding(&order_binding)
            .queue(&orders)
            .exchange(&events)
            .exchange_binding(&to_audit)
            .queue(&log)
            .queue(&orders)
            .exchange(&audit)
            .queue_binding(&log_binding)
            .install()
            .await
            .unwrap();

        let methods: Vec<String> = broker
            .operations()
            .iter()
            .map(|op| op.split(' ').next().unwrap_or_default().to_owned())
            .collect();
        assert_eq!(
            methods,
            vec![
                "exchange.declare",
                "exchange.declare",
                "queue.declare",
                "queue.declare",
                "exchange.bind",
                "queue.bind",
                "queue.bind",
            ]
        );

        conn.with_topology(|registry| {
            assert_eq!(registry.entities_of(Category::Exchange).count(), 2);
            assert_eq!(registry.entities_of(Category::Queue).count(), 2);
            assert_eq!(registry.entities_of(Category::Binding).count(), 3);
        });
    }

    #[tokio::test]
    async fn declares_each_server_named_queue() {
        let broker = MemoryBroker::new();
        let conn = open(&broker).await;
        let channel = conn.create_channel().await.unwrap();

        let first = QueueDefinition::server_named();
        let second = QueueDefinition::server_named();
        let orders = QueueDefinition::new("orders");

        AmqpTopology::new(channel)
            .queue(&first)
            .queue(&orders)
            .queue(&second)
            .queue(&orders)
            .install()
            .await
            .unwrap();

        assert_eq!(broker.queue_names().len(), 3);
        conn.with_topology(|registry| {
            assert_eq!(registry.entities_of(Category::Queue).count(), 3);
        });
    }

    #[tokio::test]
    async fn stops_at_the_first_rejected_declaration() {
        let broker = MemoryBroker::new();
        let conn = open(&broker).await;
        let channel = conn.create_channel().await.unwrap();
        broker.reject_exchange("events");

        let events = ExchangeDefinition::new("events").topic();
        let orders = QueueDefinition::new("orders");

        let err = AmqpTopology::new(channel)
            .exchange(&events)
            .queue(&orders)
            .install()
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::DeclareExchangeError("events".to_owned()));
        assert!(!broker.has_queue("orders"));
        assert!(conn.recorded_entities().is_empty());
    }
}
