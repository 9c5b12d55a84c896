// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Consumers
//!
//! A consumer is registered with a [`ConsumerDefinition`] and an application
//! supplied [`ConsumerCallback`]. The same callback object stays attached to
//! the consumer across recoveries; only the queue name and the consumer tag
//! it is bound to may change.

use async_trait::async_trait;
use lapin::{
    options::BasicConsumeOptions,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use std::collections::BTreeMap;

/// Definition of a consumer on a queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumerDefinition {
    pub(crate) queue: String,
    pub(crate) tag: String,
    pub(crate) auto_ack: bool,
    pub(crate) exclusive: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl ConsumerDefinition {
    /// Creates a consumer on `queue` with a server-assigned tag.
    pub fn new(queue: &str) -> ConsumerDefinition {
        ConsumerDefinition {
            queue: queue.to_owned(),
            ..Default::default()
        }
    }

    /// Uses a client-chosen consumer tag instead of a server-assigned one.
    pub fn tag(mut self, tag: &str) -> Self {
        self.tag = tag.to_owned();
        self
    }

    /// Deliveries are considered acknowledged as soon as they are sent.
    pub fn auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }

    /// Requests exclusive access to the queue.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Adds a single consumer argument (e.g. `x-priority`).
    pub fn param(mut self, key: ShortString, value: AMQPValue) -> Self {
        self.params.insert(key, value);
        self
    }

    pub(crate) fn options(&self) -> BasicConsumeOptions {
        BasicConsumeOptions {
            no_local: false,
            no_ack: self.auto_ack,
            exclusive: self.exclusive,
            nowait: false,
        }
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        FieldTable::from(self.params.clone())
    }
}

/// A message handed to a [`ConsumerCallback`].
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub consumer_tag: String,
    /// Channel-scoped; tags restart on the new channel after a recovery.
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

/// Application code receiving deliveries for a consumer.
#[async_trait]
pub trait ConsumerCallback: Send + Sync {
    async fn handle_delivery(&self, delivery: Delivery);

    /// Called once the broker confirmed the registration under `consumer_tag`.
    async fn handle_consume_ok(&self, _consumer_tag: &str) {}

    /// Called when the broker cancels the consumer (e.g. its queue was deleted).
    async fn handle_cancel(&self, _consumer_tag: &str) {}

    /// Called after recovery re-registered the consumer, with its current tag.
    async fn handle_recover_ok(&self, _consumer_tag: &str) {}
}
