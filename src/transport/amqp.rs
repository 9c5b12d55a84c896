// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Transport
//!
//! Backs the transport traits with a real broker through `lapin`.
//!
//! lapin reports connection failures through `Connection::on_error`; this
//! module turns them into a [`ShutdownSignal`] and fans it out to the
//! connection's listeners and then to every channel opened on it. Channels
//! closed by the broker after a rejected method are detected on the failing
//! call. Consumers are driven by one task per lapin consumer stream, which
//! forwards deliveries to the [`ConsumerCallback`] inside a consumer span.

use crate::{
    config::{Address, ConnectionParams},
    consumer::{ConsumerCallback, Delivery},
    errors::{AmqpError, ErrorScope},
    exchange::ExchangeKind,
    otel,
    shutdown::{Listeners, ShutdownListener, ShutdownSignal},
    transport::{Transport, TransportChannel, TransportConnection},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeBindOptions,
        ExchangeDeclareOptions, ExchangeDeleteOptions, ExchangeUnbindOptions, QueueBindOptions,
        QueueDeclareOptions, QueueDeleteOptions,
    },
    protocol::AMQPErrorKind,
    publisher_confirm::Confirmation,
    types::{FieldTable, LongString},
    uri::{AMQPAuthority, AMQPQueryString, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};
use tracing::{debug, error, warn};

impl From<lapin::Error> for AmqpError {
    fn from(err: lapin::Error) -> Self {
        match &err {
            lapin::Error::ProtocolError(protocol) => match protocol.kind() {
                AMQPErrorKind::Soft(_) => AmqpError::EntityRejected(err.to_string()),
                AMQPErrorKind::Hard(_) => AmqpError::ConnectionRejected(err.to_string()),
            },
            lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidChannel(_) => {
                AmqpError::ChannelError(err.to_string())
            }
            _ => AmqpError::ConnectionError(err.to_string()),
        }
    }
}

/// Maps a publisher confirm onto the publish outcome. A nack fails the
/// publish; acks and publishes outside confirm mode succeed.
fn settle_confirmation(
    exchange: &str,
    routing_key: &str,
    confirmation: Confirmation,
) -> Result<(), AmqpError> {
    match confirmation {
        Confirmation::Nack(_) => {
            warn!(exchange, routing_key, "publish nacked by the broker");
            Err(AmqpError::PublishingError(format!(
                "nacked on `{exchange}` with key `{routing_key}`"
            )))
        }
        Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
    }
}

fn shutdown_signal(err: &lapin::Error) -> ShutdownSignal {
    match err {
        lapin::Error::ProtocolError(protocol) => ShutdownSignal::peer(
            matches!(protocol.kind(), AMQPErrorKind::Hard(_)),
            err.to_string(),
        ),
        _ => ShutdownSignal::transport(err.to_string()),
    }
}

/// Builds the connection URI, carrying the requested limits as query
/// parameters so every reconnect negotiates them again. Credentials and
/// vhost are passed as plain values, so reserved characters need no escaping.
fn uri(params: &ConnectionParams, address: &Address) -> AMQPUri {
    AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: params.user.clone(),
                password: params.password.clone(),
            },
            host: address.host.clone(),
            port: address.port,
        },
        vhost: params.vhost.clone(),
        query: AMQPQueryString {
            frame_max: Some(params.frame_max),
            channel_max: Some(params.channel_max),
            heartbeat: Some(params.heartbeat),
            ..AMQPQueryString::default()
        },
        ..AMQPUri::default()
    }
}

/// Opens lapin connections, trying each configured address in turn.
#[derive(Debug, Clone, Default)]
pub struct LapinTransport;

impl LapinTransport {
    pub fn new() -> LapinTransport {
        LapinTransport
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn open_connection(
        &self,
        params: &ConnectionParams,
    ) -> Result<Arc<dyn TransportConnection>, AmqpError> {
        let mut last_error = AmqpError::ConnectionError("no address configured".to_owned());

        for address in &params.addresses {
            debug!(address = %address, "creating amqp connection...");
            let options = ConnectionProperties::default()
                .with_connection_name(LongString::from(params.connection_name.clone()));

            match Connection::connect_uri(uri(params, address), options).await {
                Ok(connection) => {
                    debug!(address = %address, "amqp connected");
                    return Ok(LapinConnection::new(connection));
                }
                Err(err) => {
                    error!(error = err.to_string(), address = %address, "failure to connect");
                    last_error = AmqpError::from(err);
                    if last_error.scope() == ErrorScope::Connection {
                        return Err(last_error);
                    }
                }
            }
        }

        Err(last_error)
    }
}

pub struct LapinConnection {
    connection: Connection,
    closed: AtomicBool,
    listeners: Listeners<dyn ShutdownListener>,
    channels: Mutex<Vec<Weak<LapinChannel>>>,
}

impl LapinConnection {
    fn new(connection: Connection) -> Arc<LapinConnection> {
        let conn = Arc::new(LapinConnection {
            connection,
            closed: AtomicBool::new(false),
            listeners: Listeners::default(),
            channels: Mutex::new(vec![]),
        });

        let weak = Arc::downgrade(&conn);
        conn.connection.on_error(move |err| {
            warn!(error = err.to_string(), "amqp connection error");
            if let Some(conn) = weak.upgrade() {
                conn.shutdown(shutdown_signal(&err));
            }
        });

        conn
    }

    fn shutdown(&self, signal: ShutdownSignal) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let channels: Vec<Arc<LapinChannel>> = std::mem::take(&mut *self.channels.lock())
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for channel in channels {
            channel.shutdown(signal.clone());
        }
        self.listeners.fire(&signal);
    }
}

#[async_trait]
impl TransportConnection for LapinConnection {
    /// lapin assigns channel numbers itself; the requested number is ignored.
    async fn open_channel(
        &self,
        _number: Option<u16>,
    ) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        debug!("creating amqp channel...");
        let channel = match self.connection.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                return Err(AmqpError::from(err));
            }
        };
        debug!(number = channel.id(), "channel created");

        let channel = Arc::new_cyclic(|me| LapinChannel {
            me: me.clone(),
            channel,
            closed: AtomicBool::new(false),
            listeners: Listeners::default(),
            cancelled: Mutex::new(HashSet::new()),
        });

        let mut channels = self.channels.lock();
        channels.retain(|c| c.strong_count() > 0);
        channels.push(Arc::downgrade(&channel));

        Ok(channel)
    }

    async fn close(&self, reply_code: u16, reply_text: &str) -> Result<(), AmqpError> {
        let result = self.connection.close(reply_code, reply_text).await;
        self.shutdown(ShutdownSignal::application(true, reply_text));
        result.map_err(AmqpError::from)
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.connection.status().connected()
    }

    fn on_shutdown(&self, listener: Arc<dyn ShutdownListener>) {
        self.listeners.add(listener);
    }
}

pub struct LapinChannel {
    me: Weak<LapinChannel>,
    channel: Channel,
    closed: AtomicBool,
    listeners: Listeners<dyn ShutdownListener>,
    cancelled: Mutex<HashSet<String>>,
}

impl LapinChannel {
    fn shutdown(&self, signal: ShutdownSignal) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.listeners.fire(&signal);
    }

    /// Converts a lapin failure, noticing when the broker closed the channel.
    fn settle<T>(&self, result: Result<T, lapin::Error>) -> Result<T, AmqpError> {
        result.map_err(|err| {
            let mapped = AmqpError::from(err);
            if !self.channel.status().connected() {
                self.shutdown(ShutdownSignal::peer(false, mapped.to_string()));
            }
            mapped
        })
    }

    async fn drive(
        mut consumer: lapin::Consumer,
        tag: String,
        callback: Arc<dyn ConsumerCallback>,
        channel: Weak<LapinChannel>,
    ) {
        let tracer = global::tracer("amqp consumer");

        while let Some(result) = consumer.next().await {
            match result {
                Ok(delivery) => {
                    let (_ctx, mut span) =
                        otel::consumer_span(&delivery.properties, &tracer, &tag);
                    debug!(
                        "received: {} - exchange: {}",
                        tag,
                        delivery.exchange.to_string(),
                    );

                    callback
                        .handle_delivery(Delivery {
                            consumer_tag: tag.clone(),
                            delivery_tag: delivery.delivery_tag,
                            exchange: delivery.exchange.to_string(),
                            routing_key: delivery.routing_key.to_string(),
                            redelivered: delivery.redelivered,
                            properties: delivery.properties,
                            data: delivery.data,
                        })
                        .await;
                    span.set_status(Status::Ok);
                    span.end();
                }
                Err(err) => error!(error = err.to_string(), "errors consume msg"),
            }
        }

        // The stream also ends when the channel dies; only a live channel
        // with a consumer we did not cancel means the broker cancelled it.
        let Some(channel) = channel.upgrade() else {
            return;
        };
        let cancelled_by_us = channel.cancelled.lock().remove(&tag);
        if !cancelled_by_us && channel.is_open() {
            debug!(consumer_tag = tag, "consumer cancelled by broker");
            callback.handle_cancel(&tag).await;
        }
    }
}

#[async_trait]
impl TransportChannel for LapinChannel {
    fn number(&self) -> u16 {
        self.channel.id()
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.channel.status().connected()
    }

    fn on_shutdown(&self, listener: Arc<dyn ShutdownListener>) {
        self.listeners.add(listener);
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: &ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let result = self
            .channel
            .exchange_declare(exchange, kind.into(), options, arguments)
            .await;
        self.settle(result)
    }

    async fn exchange_delete(
        &self,
        exchange: &str,
        options: ExchangeDeleteOptions,
    ) -> Result<(), AmqpError> {
        let result = self.channel.exchange_delete(exchange, options).await;
        self.settle(result)
    }

    async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        options: ExchangeBindOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let result = self
            .channel
            .exchange_bind(destination, source, routing_key, options, arguments)
            .await;
        self.settle(result)
    }

    async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        options: ExchangeUnbindOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let result = self
            .channel
            .exchange_unbind(destination, source, routing_key, options, arguments)
            .await;
        self.settle(result)
    }

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<String, AmqpError> {
        let result = self.channel.queue_declare(queue, options, arguments).await;
        self.settle(result).map(|q| q.name().as_str().to_owned())
    }

    async fn queue_delete(
        &self,
        queue: &str,
        options: QueueDeleteOptions,
    ) -> Result<u32, AmqpError> {
        let result = self.channel.queue_delete(queue, options).await;
        self.settle(result)
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let result = self
            .channel
            .queue_bind(queue, exchange, routing_key, options, arguments)
            .await;
        self.settle(result)
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let result = self
            .channel
            .queue_unbind(queue, exchange, routing_key, arguments)
            .await;
        self.settle(result)
    }

    async fn basic_qos(
        &self,
        prefetch_count: u16,
        options: BasicQosOptions,
    ) -> Result<(), AmqpError> {
        let result = self.channel.basic_qos(prefetch_count, options).await;
        self.settle(result)
    }

    async fn confirm_select(&self, options: ConfirmSelectOptions) -> Result<(), AmqpError> {
        let result = self.channel.confirm_select(options).await;
        self.settle(result)
    }

    async fn tx_select(&self) -> Result<(), AmqpError> {
        let result = self.channel.tx_select().await;
        self.settle(result)
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
        callback: Arc<dyn ConsumerCallback>,
    ) -> Result<String, AmqpError> {
        let result = self
            .channel
            .basic_consume(queue, consumer_tag, options, arguments)
            .await;
        let consumer = self.settle(result)?;
        let tag = consumer.tag().as_str().to_owned();

        // The consumer task must not keep a dropped channel alive.
        tokio::spawn(LapinChannel::drive(
            consumer,
            tag.clone(),
            callback,
            self.me.clone(),
        ));

        Ok(tag)
    }

    async fn basic_cancel(
        &self,
        consumer_tag: &str,
        options: BasicCancelOptions,
    ) -> Result<(), AmqpError> {
        self.cancelled.lock().insert(consumer_tag.to_owned());
        let result = self.channel.basic_cancel(consumer_tag, options).await;
        self.settle(result)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let properties = otel::with_current_context(properties);
        let result = self
            .channel
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await;

        let confirm = match result {
            Ok(confirm) => confirm,
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                return self.settle(Err(err));
            }
        };

        // Resolves at once unless the channel is in confirm mode.
        let confirmation = confirm.await;
        settle_confirmation(exchange, routing_key, self.settle(confirmation)?)
    }

    async fn basic_ack(&self, delivery_tag: u64, options: BasicAckOptions) -> Result<(), AmqpError> {
        let result = self.channel.basic_ack(delivery_tag, options).await;
        self.settle(result)
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        options: BasicNackOptions,
    ) -> Result<(), AmqpError> {
        let result = self.channel.basic_nack(delivery_tag, options).await;
        self.settle(result)
    }

    async fn close(&self, reply_code: u16, reply_text: &str) -> Result<(), AmqpError> {
        let result = self.channel.close(reply_code, reply_text).await;
        self.shutdown(ShutdownSignal::application(false, reply_text));
        result.map_err(AmqpError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_uri_with_negotiated_limits() {
        let params = ConnectionParams::default().credentials("app", "secret");
        let uri = uri(&params, &params.addresses[0]);

        assert_eq!(uri.authority.userinfo.username, "app");
        assert_eq!(uri.authority.userinfo.password, "secret");
        assert_eq!(uri.authority.host, "localhost");
        assert_eq!(uri.authority.port, 5672);
        assert_eq!(uri.vhost, "/");
        assert_eq!(uri.query.heartbeat, Some(60));
        assert_eq!(uri.query.frame_max, Some(131_072));
        assert_eq!(uri.query.channel_max, Some(2047));
    }

    #[test]
    fn nacked_publish_fails() {
        assert_eq!(
            settle_confirmation("orders", "created", Confirmation::Nack(None)),
            Err(AmqpError::PublishingError(
                "nacked on `orders` with key `created`".to_owned()
            ))
        );
        assert_eq!(settle_confirmation("", "jobs", Confirmation::Ack(None)), Ok(()));
        assert_eq!(settle_confirmation("", "jobs", Confirmation::NotRequested), Ok(()));
    }

    #[test]
    fn keeps_reserved_characters_in_credentials_and_vhost() {
        let params = ConnectionParams::default()
            .credentials("ops@acme", "p@ss:w/rd#1?")
            .vhost("orders/eu");
        let uri = uri(&params, &params.addresses[0]);

        assert_eq!(uri.authority.userinfo.username, "ops@acme");
        assert_eq!(uri.authority.userinfo.password, "p@ss:w/rd#1?");
        assert_eq!(uri.vhost, "orders/eu");
    }
}
