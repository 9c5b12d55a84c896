// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Boundary
//!
//! The recovering handles never talk to a socket. They drive a transport
//! through the three traits in this module:
//!
//! - [`Transport`] opens connections from [`ConnectionParams`].
//! - [`TransportConnection`] opens channels and reports its own shutdown.
//! - [`TransportChannel`] performs the synchronous protocol methods.
//!
//! Two implementations ship with the crate: [`amqp`] talks to a real broker
//! through `lapin`, and [`memory`] simulates a broker in-process with fault
//! injection for tests and local development.

pub mod amqp;
pub mod memory;

use crate::{
    config::ConnectionParams, consumer::ConsumerCallback, errors::AmqpError,
    exchange::ExchangeKind, shutdown::ShutdownListener,
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
use std::sync::Arc;

/// Opens transport connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a new connection, negotiating limits from scratch.
    async fn open_connection(
        &self,
        params: &ConnectionParams,
    ) -> Result<Arc<dyn TransportConnection>, AmqpError>;
}

/// A live transport connection.
#[async_trait]
pub trait TransportConnection: Send + Sync {
    /// Opens a channel, asking for `number` when given.
    async fn open_channel(&self, number: Option<u16>)
        -> Result<Arc<dyn TransportChannel>, AmqpError>;

    async fn close(&self, reply_code: u16, reply_text: &str) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;

    /// Registers a listener fired once when this connection shuts down.
    fn on_shutdown(&self, listener: Arc<dyn ShutdownListener>);
}

/// A live transport channel with the protocol methods the handles forward.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportChannel: Send + Sync {
    fn number(&self) -> u16;

    fn is_open(&self) -> bool;

    /// Registers a listener fired once when this channel shuts down.
    fn on_shutdown(&self, listener: Arc<dyn ShutdownListener>);

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: &ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn exchange_delete(
        &self,
        exchange: &str,
        options: ExchangeDeleteOptions,
    ) -> Result<(), AmqpError>;

    async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        options: ExchangeBindOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        options: ExchangeUnbindOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    /// Declares a queue and returns its actual name (generated when `queue` is empty).
    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<String, AmqpError>;

    /// Deletes a queue and returns the number of messages it held.
    async fn queue_delete(&self, queue: &str, options: QueueDeleteOptions)
        -> Result<u32, AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn basic_qos(&self, prefetch_count: u16, options: BasicQosOptions)
        -> Result<(), AmqpError>;

    async fn confirm_select(&self, options: ConfirmSelectOptions) -> Result<(), AmqpError>;

    async fn tx_select(&self) -> Result<(), AmqpError>;

    /// Starts a consumer and returns its tag (generated when `consumer_tag` is empty).
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
        callback: Arc<dyn ConsumerCallback>,
    ) -> Result<String, AmqpError>;

    async fn basic_cancel(
        &self,
        consumer_tag: &str,
        options: BasicCancelOptions,
    ) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64, options: BasicAckOptions)
        -> Result<(), AmqpError>;

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        options: BasicNackOptions,
    ) -> Result<(), AmqpError>;

    async fn close(&self, reply_code: u16, reply_text: &str) -> Result<(), AmqpError>;
}

/// Reply code sent when the application closes a connection or channel.
pub const REPLY_SUCCESS: u16 = 200;
