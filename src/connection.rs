// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Recovering Connection
//!
//! [`RecoveringConnection`] is the stable connection handle the application
//! keeps for the lifetime of its session. It forwards to the transport
//! connection currently installed as its delegate. When the delegate shuts
//! down abnormally, a recovery cycle (see [`crate::recovery`]) opens a new
//! one, swaps it in and replays the recorded topology. Callers that need the
//! delegate while that happens wait until the cycle finishes.
//!
//! All shared mutable state (delegate, channel table, registry) sits behind
//! short `parking_lot` critical sections. No lock is held across transport I/O.

use crate::{
    channel::{ChannelShared, RecoveringChannel},
    config::{ConnectionParams, RecoveryConfig, RecoveryPolicy},
    errors::AmqpError,
    recorded::RecordedEntity,
    recovery::{self, RecoveryListener, RecoveryState},
    registry::TopologyRegistry,
    shutdown::{Listeners, ShutdownListener, ShutdownSignal},
    transport::{Transport, TransportConnection, REPLY_SUCCESS},
};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{runtime::Handle, sync::watch};
use tracing::{debug, error, info, warn};

const CLOSED_BY_APPLICATION: &str = "closed by application";

/// Runs `fut` under `limit`, turning an elapsed timer into a retryable error.
pub(crate) async fn timed<T, F>(limit: Duration, fut: F) -> Result<T, AmqpError>
where
    F: Future<Output = Result<T, AmqpError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(AmqpError::Timeout(limit)),
    }
}

pub(crate) struct ConnectionShared {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) params: ConnectionParams,
    pub(crate) config: RecoveryConfig,
    pub(crate) policy: RecoveryPolicy,
    runtime: Handle,
    delegate: Mutex<Option<Arc<dyn TransportConnection>>>,
    generation: AtomicU64,
    pub(crate) channels: Mutex<BTreeMap<u16, Arc<ChannelShared>>>,
    pub(crate) registry: Mutex<TopologyRegistry>,
    state: watch::Sender<RecoveryState>,
    closing: AtomicBool,
    closed_cause: Mutex<Option<String>>,
    pub(crate) cycle: tokio::sync::Mutex<()>,
    pub(crate) shutdown_listeners: Listeners<dyn ShutdownListener>,
    pub(crate) recovery_listeners: Listeners<dyn RecoveryListener>,
}

impl ConnectionShared {
    pub(crate) fn state(&self) -> RecoveryState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<RecoveryState> {
        self.state.subscribe()
    }

    /// Moves the state machine forward. `Abandoned` is terminal, so this
    /// returns `false` once the connection was closed or given up.
    pub(crate) fn transition(&self, next: RecoveryState) -> bool {
        let mut moved = false;
        self.state.send_if_modified(|state| {
            if *state == RecoveryState::Abandoned {
                return false;
            }
            moved = true;
            if *state == next {
                return false;
            }
            debug!(from = %state, to = %next, "recovery state transition");
            *state = next;
            true
        });
        moved
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn closed_error(&self) -> AmqpError {
        let cause = self
            .closed_cause
            .lock()
            .clone()
            .unwrap_or_else(|| CLOSED_BY_APPLICATION.to_owned());
        AmqpError::ConnectionClosed(cause)
    }

    /// Resolves once the connection reached `Abandoned`.
    pub(crate) async fn abandoned(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx
            .wait_for(|state| *state == RecoveryState::Abandoned)
            .await;
    }

    pub(crate) fn current_delegate(&self) -> Option<Arc<dyn TransportConnection>> {
        self.delegate.lock().clone()
    }

    /// Waits until no recovery is in progress and returns the live delegate
    /// together with its generation.
    pub(crate) async fn await_delegate(
        &self,
    ) -> Result<(Arc<dyn TransportConnection>, u64), AmqpError> {
        let mut rx = self.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                RecoveryState::Active => {
                    let delegate = self.current_delegate();
                    return match delegate {
                        Some(delegate) => Ok((delegate, self.generation())),
                        None => Err(self.closed_error()),
                    };
                }
                RecoveryState::Abandoned => return Err(self.closed_error()),
                _ => {}
            }

            if rx.changed().await.is_err() {
                return Err(self.closed_error());
            }
        }
    }

    /// `true` when the delegate of `generation` has been, or is being, replaced.
    pub(crate) fn replaced_since(&self, generation: u64) -> bool {
        self.generation() != generation
            || !matches!(
                self.state(),
                RecoveryState::Active | RecoveryState::Abandoned
            )
    }

    /// Swaps in a new connection delegate and watches it for shutdown.
    pub(crate) fn install_delegate(self: &Arc<Self>, delegate: Arc<dyn TransportConnection>) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        delegate.on_shutdown(Arc::new(DelegateWatcher {
            shared: Arc::downgrade(self),
            generation,
        }));
        *self.delegate.lock() = Some(delegate);
        debug!(generation, "connection delegate installed");
        generation
    }

    /// Closes the current delegate without reporting its shutdown, before a
    /// recovery cycle starts over on a fresh connection.
    pub(crate) async fn retire_delegate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let delegate = self.delegate.lock().take();
        if let Some(delegate) = delegate.filter(|d| d.is_open()) {
            if let Err(err) = delegate.close(REPLY_SUCCESS, "restarting recovery").await {
                debug!(error = err.to_string(), "failure to close retired delegate");
            }
        }
    }

    fn delegate_shutdown(self: &Arc<Self>, generation: u64, signal: &ShutdownSignal) {
        if generation != self.generation() {
            debug!(generation, "ignoring shutdown of a replaced delegate");
            return;
        }
        if self.state() == RecoveryState::Abandoned {
            return;
        }

        self.shutdown_listeners.fire(signal);

        if signal.is_initiated_by_application() || self.is_closing() {
            return;
        }

        warn!(cause = %signal, "connection lost");
        if !self.claim_loss() {
            debug!("loss left to the recovery cycle in progress");
            return;
        }
        self.runtime
            .spawn(recovery::run(self.clone(), signal.clone()));
    }

    /// Moves `Active` to `DetectingLoss` in one step, so callers start
    /// waiting before any recovery task is polled. Returns `false` when
    /// another loss or a running cycle already owns the transition.
    pub(crate) fn claim_loss(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state != RecoveryState::Active {
                return false;
            }
            debug!(from = %state, to = %RecoveryState::DetectingLoss, "recovery state transition");
            *state = RecoveryState::DetectingLoss;
            true
        })
    }

    /// Moves to `Abandoned`, closing the delegate and failing every waiter
    /// with a "connection closed" error that carries `cause`.
    pub(crate) async fn abandon(&self, cause: &str) {
        {
            let mut closed_cause = self.closed_cause.lock();
            if closed_cause.is_none() {
                *closed_cause = Some(cause.to_owned());
            }
        }

        self.state.send_if_modified(|state| {
            if *state == RecoveryState::Abandoned {
                return false;
            }
            *state = RecoveryState::Abandoned;
            true
        });

        let delegate = self.delegate.lock().take();
        let channels: Vec<Arc<ChannelShared>> = {
            let mut table = self.channels.lock();
            let channels = table.values().cloned().collect();
            table.clear();
            channels
        };
        for channel in channels {
            channel.detach();
        }

        if let Some(delegate) = delegate {
            if delegate.is_open() {
                if let Err(err) = delegate.close(REPLY_SUCCESS, cause).await {
                    debug!(error = err.to_string(), "failure to close abandoned delegate");
                }
            }
        }
    }

    fn next_channel_number(&self, table: &BTreeMap<u16, Arc<ChannelShared>>) -> Option<u16> {
        let max = match self.params.channel_max {
            0 => u16::MAX,
            max => max,
        };
        (1..=max).find(|n| !table.contains_key(n))
    }

    pub(crate) fn forget_channel(&self, number: u16) -> Vec<RecordedEntity> {
        self.channels.lock().remove(&number);
        self.registry.lock().remove_channel(number)
    }
}

struct DelegateWatcher {
    shared: Weak<ConnectionShared>,
    generation: u64,
}

impl ShutdownListener for DelegateWatcher {
    fn shutdown_completed(&self, signal: &ShutdownSignal) {
        if let Some(shared) = self.shared.upgrade() {
            shared.delegate_shutdown(self.generation, signal);
        }
    }
}

/// Application-facing connection handle that survives transport failures.
#[derive(Clone)]
pub struct RecoveringConnection {
    shared: Arc<ConnectionShared>,
}

impl RecoveringConnection {
    /// Opens the first transport connection.
    ///
    /// Failures here are returned to the caller as-is; automatic recovery
    /// only applies to connections that were established once.
    ///
    /// # Parameters
    /// * `transport` - Factory for transport connections, used again on every reconnect
    /// * `params` - Addresses, credentials and negotiated limits
    /// * `config` - Recovery switches, backoff interval and call timeout
    /// * `policy` - Decides which shutdowns are recovered and which entities are replayed
    ///
    /// # Returns
    /// The connection handle, in the `Active` state
    pub async fn open(
        transport: Arc<dyn Transport>,
        params: ConnectionParams,
        config: RecoveryConfig,
        policy: RecoveryPolicy,
    ) -> Result<RecoveringConnection, AmqpError> {
        debug!("creating amqp connection...");
        let delegate = timed(config.call_timeout, transport.open_connection(&params)).await;
        let delegate = match delegate {
            Ok(delegate) => delegate,
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                return Err(err);
            }
        };

        let (state, _) = watch::channel(RecoveryState::Active);
        let shared = Arc::new(ConnectionShared {
            transport,
            params,
            config,
            policy,
            runtime: Handle::current(),
            delegate: Mutex::new(None),
            generation: AtomicU64::new(0),
            channels: Mutex::new(BTreeMap::new()),
            registry: Mutex::new(TopologyRegistry::new()),
            state,
            closing: AtomicBool::new(false),
            closed_cause: Mutex::new(None),
            cycle: tokio::sync::Mutex::new(()),
            shutdown_listeners: Listeners::default(),
            recovery_listeners: Listeners::default(),
        });
        shared.install_delegate(delegate);
        info!(name = shared.params.connection_name, "amqp connected");

        Ok(RecoveringConnection { shared })
    }

    /// Opens a channel handle backed by a fresh transport channel.
    ///
    /// During a recovery the call waits for it to finish. The lowest free
    /// channel number is used and stays the same across recoveries.
    ///
    /// # Returns
    /// The channel handle, or a closed error once the connection was abandoned
    pub async fn create_channel(&self) -> Result<RecoveringChannel, AmqpError> {
        let channel = {
            let mut table = self.shared.channels.lock();
            let number = self
                .shared
                .next_channel_number(&table)
                .ok_or_else(|| AmqpError::ChannelError("channel limit reached".to_owned()))?;
            let channel = ChannelShared::new(number, self.shared.clone());
            table.insert(number, channel.clone());
            channel
        };
        let number = channel.number;

        debug!(number, "creating amqp channel...");
        loop {
            let delegate = self.shared.await_delegate().await;
            let (delegate, generation) = match delegate {
                Ok(found) => found,
                Err(err) => {
                    self.shared.channels.lock().remove(&number);
                    return Err(err);
                }
            };
            // The handle was already in the table when a recovery reopened it.
            if channel.current_delegate().is_some_and(|d| d.is_open()) {
                break;
            }

            match timed(
                self.shared.config.call_timeout,
                delegate.open_channel(Some(number)),
            )
            .await
            {
                // A recovery that started meanwhile reopens this channel itself.
                Ok(_) if self.shared.generation() != generation => continue,
                Ok(transport_channel) => {
                    channel.install_delegate(transport_channel);
                    break;
                }
                Err(err) if err.is_retryable() && self.shared.replaced_since(generation) => {
                    continue
                }
                Err(err) => {
                    error!(error = err.to_string(), "error to create the channel");
                    self.shared.channels.lock().remove(&number);
                    return Err(err);
                }
            }
        }

        self.shared.registry.lock().channel_mut(number);
        debug!(number, "channel created");

        Ok(RecoveringChannel::new(channel))
    }

    /// Closes the connection. Any recovery in progress stops at its next
    /// step, and every caller waiting on a handle fails with a closed error.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("closing amqp connection");

        let delegate = self.shared.current_delegate();
        let was_active = self.shared.state() == RecoveryState::Active;
        let open_delegate = delegate.filter(|d| was_active && d.is_open());

        match open_delegate {
            Some(delegate) => {
                // The transport reports the application-initiated shutdown
                // to the delegate watcher, which fans it out.
                if let Err(err) = delegate.close(REPLY_SUCCESS, CLOSED_BY_APPLICATION).await {
                    warn!(error = err.to_string(), "failure closing the connection");
                }
            }
            None => self
                .shared
                .shutdown_listeners
                .fire(&ShutdownSignal::application(true, CLOSED_BY_APPLICATION)),
        }

        self.shared.abandon(CLOSED_BY_APPLICATION).await;
        Ok(())
    }

    /// Current position in the recovery state machine.
    pub fn state(&self) -> RecoveryState {
        self.shared.state()
    }

    /// Watches state transitions, e.g. to wait for a recovery to finish.
    pub fn subscribe_state(&self) -> watch::Receiver<RecoveryState> {
        self.shared.subscribe_state()
    }

    /// `false` once the connection was closed or recovery was abandoned.
    /// A connection in the middle of a recovery is still open.
    pub fn is_open(&self) -> bool {
        self.shared.state() != RecoveryState::Abandoned
    }

    /// Registers a listener notified once for every shutdown of the
    /// underlying transport connection, including the final close.
    ///
    /// # Parameters
    /// * `listener` - The listener; the same `Arc` removes it again
    pub fn add_shutdown_listener(&self, listener: Arc<dyn ShutdownListener>) {
        self.shared.shutdown_listeners.add(listener);
    }

    /// Removes a listener added with [`Self::add_shutdown_listener`].
    pub fn remove_shutdown_listener(&self, listener: &Arc<dyn ShutdownListener>) {
        self.shared.shutdown_listeners.remove(listener);
    }

    /// Registers a listener notified when recovery cycles start, complete
    /// or fail.
    ///
    /// # Parameters
    /// * `listener` - The listener; the same `Arc` removes it again
    pub fn add_recovery_listener(&self, listener: Arc<dyn RecoveryListener>) {
        self.shared.recovery_listeners.add(listener);
    }

    /// Removes a listener added with [`Self::add_recovery_listener`].
    pub fn remove_recovery_listener(&self, listener: &Arc<dyn RecoveryListener>) {
        self.shared.recovery_listeners.remove(listener);
    }

    /// Reads the recorded topology without waiting for a recovery in progress.
    pub fn with_topology<R>(&self, f: impl FnOnce(&TopologyRegistry) -> R) -> R {
        f(&self.shared.registry.lock())
    }

    /// Snapshot of every recorded entity in replay order.
    pub fn recorded_entities(&self) -> Vec<RecordedEntity> {
        self.shared.registry.lock().entities().collect()
    }
}
