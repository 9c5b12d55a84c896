// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Recovering Channel
//!
//! [`RecoveringChannel`] is the stable channel handle the application uses to
//! declare topology, consume and publish. Each call waits for any recovery in
//! progress, forwards to the current transport channel and, once the broker
//! accepted a topology change, records or forgets it in the connection's
//! topology registry.

use crate::{
    connection::{timed, ConnectionShared},
    consumer::{ConsumerCallback, ConsumerDefinition, Delivery},
    errors::{AmqpError, ErrorScope},
    exchange::{ExchangeBinding, ExchangeDefinition},
    queue::{QueueBinding, QueueDefinition},
    recorded::{RecordedBinding, RecordedConsumer, RecordedEntity, RecordedExchange, RecordedQueue},
    registry::EntityId,
    shutdown::{Listeners, ShutdownListener, ShutdownSignal},
    transport::{TransportChannel, REPLY_SUCCESS},
};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeBindOptions, ExchangeDeleteOptions,
        ExchangeUnbindOptions, QueueBindOptions, QueueDeleteOptions,
    },
    types::FieldTable,
    BasicProperties,
};
use parking_lot::Mutex;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};
use tracing::{debug, error, warn};

pub(crate) struct ChannelShared {
    pub(crate) number: u16,
    pub(crate) connection: Arc<ConnectionShared>,
    delegate: Mutex<Option<Arc<dyn TransportChannel>>>,
    closed: AtomicBool,
    pub(crate) shutdown_listeners: Listeners<dyn ShutdownListener>,
}

impl ChannelShared {
    pub(crate) fn new(number: u16, connection: Arc<ConnectionShared>) -> Arc<ChannelShared> {
        Arc::new(ChannelShared {
            number,
            connection,
            delegate: Mutex::new(None),
            closed: AtomicBool::new(false),
            shutdown_listeners: Listeners::default(),
        })
    }

    pub(crate) fn current_delegate(&self) -> Option<Arc<dyn TransportChannel>> {
        self.delegate.lock().clone()
    }

    /// Swaps in a new transport channel and forwards its shutdown to the
    /// listeners registered on this handle.
    pub(crate) fn install_delegate(self: &Arc<Self>, delegate: Arc<dyn TransportChannel>) {
        delegate.on_shutdown(Arc::new(ChannelWatcher {
            channel: Arc::downgrade(self),
            delegate: Arc::downgrade(&delegate),
        }));
        *self.delegate.lock() = Some(delegate);
    }

    /// Drops the delegate after the connection was abandoned.
    pub(crate) fn detach(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.delegate.lock().take();
    }

    fn is_current(&self, delegate: &Weak<dyn TransportChannel>) -> bool {
        match (self.delegate.lock().as_ref(), delegate.upgrade()) {
            (Some(current), Some(delegate)) => Arc::ptr_eq(current, &delegate),
            _ => false,
        }
    }

    async fn delegate(&self) -> Result<(Arc<dyn TransportChannel>, u64), AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelClosed(self.number));
        }

        let (_, generation) = self.connection.await_delegate().await?;
        let delegate = self.current_delegate();
        match delegate {
            Some(delegate) => Ok((delegate, generation)),
            None => Err(AmqpError::ChannelClosed(self.number)),
        }
    }

    /// Forwards one protocol call to the current delegate.
    ///
    /// A retryable failure caused by the delegate being replaced under the
    /// call is re-issued once against the recovered delegate.
    async fn call<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T, AmqpError>
    where
        F: Fn(Arc<dyn TransportChannel>) -> Fut,
        Fut: Future<Output = Result<T, AmqpError>>,
    {
        let mut retried = false;
        loop {
            let (delegate, generation) = self.delegate().await?;

            match timed(self.connection.config.call_timeout, f(delegate)).await {
                Ok(value) => return Ok(value),
                Err(err)
                    if !retried
                        && err.is_retryable()
                        && self.connection.replaced_since(generation) =>
                {
                    warn!(
                        error = err.to_string(),
                        operation, "delegate replaced during call, retrying after recovery"
                    );
                    retried = true;
                }
                Err(err) => {
                    error!(error = err.to_string(), operation, "channel operation failed");
                    return Err(err);
                }
            }
        }
    }
}

struct ChannelWatcher {
    channel: Weak<ChannelShared>,
    delegate: Weak<dyn TransportChannel>,
}

impl ShutdownListener for ChannelWatcher {
    fn shutdown_completed(&self, signal: &ShutdownSignal) {
        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        if channel.is_current(&self.delegate) {
            channel.shutdown_listeners.fire(signal);
        }
    }
}

/// Wraps the application callback so a broker-initiated cancel also
/// forgets the recorded consumer.
struct CancelAware {
    inner: Arc<dyn ConsumerCallback>,
    connection: Weak<ConnectionShared>,
}

#[async_trait]
impl ConsumerCallback for CancelAware {
    async fn handle_delivery(&self, delivery: Delivery) {
        self.inner.handle_delivery(delivery).await
    }

    async fn handle_consume_ok(&self, consumer_tag: &str) {
        self.inner.handle_consume_ok(consumer_tag).await
    }

    async fn handle_cancel(&self, consumer_tag: &str) {
        if let Some(connection) = self.connection.upgrade() {
            let removed = connection.registry.lock().cancel_consumer(consumer_tag);
            debug!(consumer_tag, removed = removed.len(), "consumer cancelled by broker");
        }
        self.inner.handle_cancel(consumer_tag).await
    }

    async fn handle_recover_ok(&self, consumer_tag: &str) {
        self.inner.handle_recover_ok(consumer_tag).await
    }
}

/// Application-facing channel handle that survives transport failures.
#[derive(Clone)]
pub struct RecoveringChannel {
    shared: Arc<ChannelShared>,
}

impl RecoveringChannel {
    pub(crate) fn new(shared: Arc<ChannelShared>) -> RecoveringChannel {
        RecoveringChannel { shared }
    }

    /// The channel number, stable across recoveries.
    pub fn number(&self) -> u16 {
        self.shared.number
    }

    /// `false` once the channel or its connection was closed.
    pub fn is_open(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst) && !self.shared.connection.state().is_terminal()
    }

    /// Registers a listener notified on every shutdown of the underlying
    /// transport channel.
    pub fn add_shutdown_listener(&self, listener: Arc<dyn ShutdownListener>) {
        self.shared.shutdown_listeners.add(listener);
    }

    fn record(&self, entity: RecordedEntity) -> EntityId {
        self.shared.connection.registry.lock().record(entity)
    }

    /// Declares an exchange and records it for recovery.
    pub async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        self.shared
            .call("exchange.declare", |ch| async move {
                ch.exchange_declare(&def.name, &def.kind, def.options(), def.arguments())
                    .await
            })
            .await
            .map_err(|err| match err.scope() {
                ErrorScope::Entity => {
                    AmqpError::DeclareExchangeError(def.name.clone())
                }
                _ => err,
            })?;

        if !def.passive {
            self.record(RecordedEntity::Exchange(RecordedExchange::new(
                self.number(),
                def,
            )));
        }
        debug!("exchange: {} was created", def.name);
        Ok(())
    }

    /// Deletes an exchange and forgets every binding that references it.
    pub async fn exchange_delete(&self, name: &str, if_unused: bool) -> Result<(), AmqpError> {
        self.shared
            .call("exchange.delete", |ch| async move {
                ch.exchange_delete(
                    name,
                    ExchangeDeleteOptions {
                        if_unused,
                        nowait: false,
                    },
                )
                .await
            })
            .await?;

        let removed = self
            .shared
            .connection
            .registry
            .lock()
            .cascade_remove(&EntityId::Exchange(name.to_owned()));
        debug!(name, removed = removed.len(), "exchange deleted");
        Ok(())
    }

    /// Binds `binding.destination` to `binding.source`.
    pub async fn exchange_bind(&self, binding: &ExchangeBinding) -> Result<(), AmqpError> {
        self.shared
            .call("exchange.bind", |ch| async move {
                ch.exchange_bind(
                    &binding.destination,
                    &binding.source,
                    &binding.routing_key,
                    ExchangeBindOptions { nowait: false },
                    FieldTable::from(binding.params.clone()),
                )
                .await
            })
            .await
            .map_err(|err| Self::binding_error(err, &binding.source, &binding.destination))?;

        self.record(RecordedEntity::Binding(RecordedBinding::exchange(
            self.number(),
            binding,
        )));
        Ok(())
    }

    /// Removes an exchange-to-exchange binding and forgets it, together with
    /// an auto-delete source exchange that has no other binding.
    pub async fn exchange_unbind(&self, binding: &ExchangeBinding) -> Result<(), AmqpError> {
        self.shared
            .call("exchange.unbind", |ch| async move {
                ch.exchange_unbind(
                    &binding.destination,
                    &binding.source,
                    &binding.routing_key,
                    ExchangeUnbindOptions { nowait: false },
                    FieldTable::from(binding.params.clone()),
                )
                .await
            })
            .await?;

        self.shared
            .connection
            .registry
            .lock()
            .unbind(&RecordedBinding::exchange(self.number(), binding));
        Ok(())
    }

    /// Declares a queue, records it, and returns its actual name.
    ///
    /// Declaring with an empty name lets the broker generate one; the queue
    /// is then re-declared anonymously, and renamed, on every recovery.
    pub async fn queue_declare(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        debug!("creating queue: {}", def.name);

        let name = self
            .shared
            .call("queue.declare", |ch| async move {
                ch.queue_declare(&def.name, def.options(), def.arguments())
                    .await
            })
            .await
            .map_err(|err| match err.scope() {
                ErrorScope::Entity => AmqpError::DeclareQueueError(def.name.clone()),
                _ => err,
            })?;

        if !def.passive {
            self.record(RecordedEntity::Queue(RecordedQueue::new(
                self.number(),
                &name,
                def,
            )));
        }
        debug!("queue: {} was created", name);
        Ok(name)
    }

    /// Deletes a queue, forgetting its bindings and consumers, and returns
    /// the number of messages it held.
    pub async fn queue_delete(
        &self,
        name: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, AmqpError> {
        let purged = self
            .shared
            .call("queue.delete", |ch| async move {
                ch.queue_delete(
                    name,
                    QueueDeleteOptions {
                        if_unused,
                        if_empty,
                        nowait: false,
                    },
                )
                .await
            })
            .await?;

        let removed = self
            .shared
            .connection
            .registry
            .lock()
            .cascade_remove(&EntityId::Queue(name.to_owned()));
        debug!(name, removed = removed.len(), "queue deleted");
        Ok(purged)
    }

    /// Binds a queue to an exchange.
    ///
    /// # Parameters
    /// * `binding` - Queue, exchange, routing key and arguments of the binding
    ///
    /// # Returns
    /// [`AmqpError::BindingError`] when the broker rejects the binding
    pub async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        self.shared
            .call("queue.bind", |ch| async move {
                ch.queue_bind(
                    &binding.queue_name,
                    &binding.exchange_name,
                    &binding.routing_key,
                    QueueBindOptions { nowait: false },
                    FieldTable::from(binding.params.clone()),
                )
                .await
            })
            .await
            .map_err(|err| {
                Self::binding_error(err, &binding.exchange_name, &binding.queue_name)
            })?;

        self.record(RecordedEntity::Binding(RecordedBinding::queue(
            self.number(),
            binding,
        )));
        Ok(())
    }

    /// Removes a queue binding and forgets it.
    pub async fn queue_unbind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.shared
            .call("queue.unbind", |ch| async move {
                ch.queue_unbind(
                    &binding.queue_name,
                    &binding.exchange_name,
                    &binding.routing_key,
                    FieldTable::from(binding.params.clone()),
                )
                .await
            })
            .await?;

        self.shared
            .connection
            .registry
            .lock()
            .unbind(&RecordedBinding::queue(self.number(), binding));
        Ok(())
    }

    /// Sets the prefetch limit, restored on this channel after recovery.
    pub async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError> {
        self.shared
            .call("basic.qos", |ch| async move {
                ch.basic_qos(prefetch_count, BasicQosOptions { global })
                    .await
            })
            .await?;

        let mut registry = self.shared.connection.registry.lock();
        let record = registry.channel_mut(self.number());
        if global {
            record.global_prefetch = Some(prefetch_count);
        } else {
            record.prefetch = Some(prefetch_count);
        }
        Ok(())
    }

    /// Enables publisher confirms, restored on this channel after recovery.
    pub async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.shared
            .call("confirm.select", |ch| async move {
                ch.confirm_select(ConfirmSelectOptions { nowait: false })
                    .await
            })
            .await?;

        self.shared
            .connection
            .registry
            .lock()
            .channel_mut(self.number())
            .confirm = true;
        Ok(())
    }

    /// Enables transactions, restored on this channel after recovery.
    pub async fn tx_select(&self) -> Result<(), AmqpError> {
        self.shared
            .call("tx.select", |ch| async move { ch.tx_select().await })
            .await?;

        self.shared
            .connection
            .registry
            .lock()
            .channel_mut(self.number())
            .transactional = true;
        Ok(())
    }

    /// Starts a consumer and returns its tag.
    ///
    /// `callback` keeps receiving deliveries after a recovery, possibly
    /// under a new server-assigned tag reported through `handle_recover_ok`.
    pub async fn basic_consume(
        &self,
        def: &ConsumerDefinition,
        callback: Arc<dyn ConsumerCallback>,
    ) -> Result<String, AmqpError> {
        let callback: Arc<dyn ConsumerCallback> = Arc::new(CancelAware {
            inner: callback,
            connection: Arc::downgrade(&self.shared.connection),
        });

        let tag = self
            .shared
            .call("basic.consume", |ch| {
                let callback = callback.clone();
                async move {
                    ch.basic_consume(
                        &def.queue,
                        &def.tag,
                        def.options(),
                        def.arguments(),
                        callback,
                    )
                    .await
                }
            })
            .await
            .map_err(|err| match err.scope() {
                ErrorScope::Entity => {
                    AmqpError::BindingConsumerError(def.queue.clone())
                }
                _ => err,
            })?;

        self.record(RecordedEntity::Consumer(RecordedConsumer::new(
            self.number(),
            &tag,
            def,
            callback.clone(),
        )));
        callback.handle_consume_ok(&tag).await;
        debug!(consumer_tag = tag, queue = def.queue, "consumer registered");
        Ok(tag)
    }

    /// Cancels a consumer. Tags replaced by a recovery are still accepted.
    pub async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let current = self
            .shared
            .connection
            .registry
            .lock()
            .resolve_tag(consumer_tag);

        self.shared
            .call("basic.cancel", |ch| {
                let current = current.clone();
                async move {
                    ch.basic_cancel(&current, BasicCancelOptions { nowait: false })
                        .await
                }
            })
            .await?;

        let removed = self
            .shared
            .connection
            .registry
            .lock()
            .cancel_consumer(&current);
        debug!(consumer_tag = current, removed = removed.len(), "consumer cancelled");
        Ok(())
    }

    /// Publishes a message.
    ///
    /// # Parameters
    /// * `exchange` - Exchange to publish to; empty for the default exchange
    /// * `routing_key` - Routing key for the message
    /// * `payload` - Message body
    /// * `properties` - Message properties; the current trace context is injected
    ///
    /// # Returns
    /// Once the channel is in confirm mode, the call waits for the broker's
    /// confirm and fails with [`AmqpError::PublishingError`] on a nack.
    pub async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.shared
            .call("basic.publish", |ch| {
                let properties = properties.clone();
                async move {
                    ch.basic_publish(
                        exchange,
                        routing_key,
                        BasicPublishOptions {
                            mandatory: false,
                            immediate: false,
                        },
                        payload,
                        properties,
                    )
                    .await
                }
            })
            .await
    }

    /// Acknowledges a delivery received on this channel.
    pub async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.shared
            .call("basic.ack", |ch| async move {
                ch.basic_ack(delivery_tag, BasicAckOptions { multiple }).await
            })
            .await
    }

    /// Rejects a delivery received on this channel.
    pub async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.shared
            .call("basic.nack", |ch| async move {
                ch.basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
                    .await
            })
            .await
    }

    /// Closes the channel and forgets its consumers. Topology declared
    /// through it stays recorded and is replayed on another channel.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let removed = self.shared.connection.forget_channel(self.number());
        debug!(number = self.number(), consumers = removed.len(), "closing channel");

        let delegate = self.shared.delegate.lock().take();
        match delegate {
            Some(delegate) if delegate.is_open() => delegate
                .close(REPLY_SUCCESS, "closed by application")
                .await
                .inspect_err(|err| {
                    warn!(error = err.to_string(), "failure closing the channel")
                }),
            _ => Ok(()),
        }
    }

    fn binding_error(err: AmqpError, source: &str, destination: &str) -> AmqpError {
        match err.scope() {
            ErrorScope::Entity => {
                AmqpError::BindingError(source.to_owned(), destination.to_owned())
            }
            _ => err,
        }
    }
}
