// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Recovery Orchestrator
//!
//! One recovery cycle runs per transport loss:
//!
//! ```text
//! Active -> DetectingLoss -> Reconnecting -> ReopeningChannels
//!        -> RecoveringTopology -> RecoveringConsumers -> Active
//! ```
//!
//! Any step may end in `Abandoned`, which is terminal. A cycle holds the
//! connection's cycle lock for its whole duration, so two cycles never
//! replay the same registry concurrently. Every transition re-checks whether
//! the application closed the connection meanwhile.
//!
//! Replay failures are classified with [`ErrorScope`]: retryable failures are
//! retried, entity rejections are reported and skipped together with the
//! entities that depend on them, connection-level failures abandon the cycle.

use crate::{
    channel::ChannelShared,
    connection::{timed, ConnectionShared},
    consumer::ConsumerCallback,
    errors::{AmqpError, ErrorScope},
    recorded::{BindingKind, Category, RecordedEntity},
    registry::EntityId,
    shutdown::{Listeners, ShutdownSignal},
    transport::{TransportChannel, REPLY_SUCCESS},
};
use lapin::options::{BasicQosOptions, ConfirmSelectOptions};
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};
use tracing::{debug, error, info, warn};

/// Replay attempts per entity when no reconnect budget is configured.
const DEFAULT_REPLAY_ATTEMPTS: u32 = 3;

/// Where a logical connection stands in the recovery state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryState {
    Active,
    DetectingLoss,
    Reconnecting,
    ReopeningChannels,
    RecoveringTopology,
    RecoveringConsumers,
    Abandoned,
}

impl RecoveryState {
    /// `true` while a cycle is between loss detection and completion.
    pub fn is_recovering(&self) -> bool {
        !matches!(self, RecoveryState::Active | RecoveryState::Abandoned)
    }

    pub fn is_terminal(&self) -> bool {
        *self == RecoveryState::Abandoned
    }
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecoveryState::Active => "active",
            RecoveryState::DetectingLoss => "detecting_loss",
            RecoveryState::Reconnecting => "reconnecting",
            RecoveryState::ReopeningChannels => "reopening_channels",
            RecoveryState::RecoveringTopology => "recovering_topology",
            RecoveryState::RecoveringConsumers => "recovering_consumers",
            RecoveryState::Abandoned => "abandoned",
        };
        f.write_str(name)
    }
}

/// Progress notifications for recovery cycles.
///
/// Callbacks run on the recovery task and must not block on the connection:
/// while they are invoked for a cycle in progress, channel calls wait for it.
pub trait RecoveryListener: Send + Sync {
    fn on_recovery_started(&self) {}

    /// Called once the connection is active again, with every server-assigned
    /// identity that changed (queue names and consumer tags, old to new).
    fn on_recovery_completed(&self, _renamed: &HashMap<String, String>) {}

    /// Called for each entity the broker rejected during replay, and with
    /// `None` when the whole cycle was abandoned.
    fn on_recovery_failed(&self, _entity: Option<&RecordedEntity>, _cause: &AmqpError) {}
}

impl Listeners<dyn RecoveryListener> {
    fn started(&self) {
        for listener in self.snapshot() {
            listener.on_recovery_started();
        }
    }

    fn completed(&self, renamed: &HashMap<String, String>) {
        for listener in self.snapshot() {
            listener.on_recovery_completed(renamed);
        }
    }

    fn failed(&self, entity: Option<&RecordedEntity>, cause: &AmqpError) {
        for listener in self.snapshot() {
            listener.on_recovery_failed(entity, cause);
        }
    }
}

/// Why a cycle stopped before reaching `Active`.
#[derive(Debug)]
enum Step {
    /// The new connection was lost too; reconnect again.
    Restart,
    Abandon(AmqpError),
}

/// Bookkeeping for one pass through reconnect and replay.
#[derive(Default)]
struct Replay {
    renamed: HashMap<String, String>,
    failed: HashSet<EntityId>,
    recovered_consumers: Vec<(Arc<dyn ConsumerCallback>, String)>,
    topology_channel: Option<Arc<dyn TransportChannel>>,
}

/// Recovers from the loss reported by `signal`.
///
/// The caller has already claimed the loss, so the state is `DetectingLoss`.
/// Losses claimed while another cycle holds the lock wait for it to finish.
pub(crate) async fn run(shared: Arc<ConnectionShared>, signal: ShutdownSignal) {
    let _cycle = shared.cycle.lock().await;
    let mut signal = signal;

    loop {
        if !shared.transition(RecoveryState::DetectingLoss) {
            return;
        }

        if !shared.config.automatic_recovery || !shared.policy.is_recoverable(&signal) {
            info!(cause = %signal, "connection not recoverable, abandoning");
            let cause = AmqpError::ConnectionClosed(signal.cause.clone());
            shared.abandon(&signal.cause).await;
            shared.recovery_listeners.failed(None, &cause);
            return;
        }

        info!(cause = %signal, "starting connection recovery");
        shared.recovery_listeners.started();

        if !cycle(&shared).await {
            return;
        }

        // A delegate lost before the state went back to `Active` was not
        // claimed by its shutdown watcher.
        let alive = shared.current_delegate().is_some_and(|d| d.is_open());
        if alive || !shared.claim_loss() {
            return;
        }
        warn!("connection lost right after recovery");
        signal = ShutdownSignal::transport("connection lost after recovery");
    }
}

/// Reconnects and replays until the connection is `Active` again. Returns
/// `false` when the cycle ended in `Abandoned`.
async fn cycle(shared: &Arc<ConnectionShared>) -> bool {
    let mut restarts = 0;
    loop {
        let mut replay = Replay::default();
        let outcome = attempt(shared, &mut replay).await;
        close_topology_channel(&mut replay).await;

        match outcome {
            Ok(()) => {
                if !shared.transition(RecoveryState::Active) {
                    return false;
                }
                info!(renamed = replay.renamed.len(), "connection recovery completed");

                for (callback, tag) in &replay.recovered_consumers {
                    callback.handle_recover_ok(tag).await;
                }
                shared.recovery_listeners.completed(&replay.renamed);
                return true;
            }
            Err(Step::Restart) => {
                restarts += 1;
                if shared.config.attempts_exhausted(restarts) {
                    let cause = AmqpError::ConnectionError("connection lost during recovery".into());
                    give_up(shared, cause).await;
                    return false;
                }
                warn!(restarts, "connection lost during recovery, starting over");
                shared.retire_delegate().await;
            }
            Err(Step::Abandon(cause)) => {
                give_up(shared, cause).await;
                return false;
            }
        }
    }
}

async fn give_up(shared: &ConnectionShared, cause: AmqpError) {
    if shared.is_closing() {
        info!("connection closed by application during recovery");
        shared.abandon(&cause.to_string()).await;
        return;
    }

    error!(error = cause.to_string(), "connection recovery abandoned");
    shared.abandon(&cause.to_string()).await;
    shared.recovery_listeners.failed(None, &cause);
}

fn advance(shared: &ConnectionShared, next: RecoveryState) -> Result<(), Step> {
    if shared.transition(next) {
        Ok(())
    } else {
        Err(Step::Abandon(shared.closed_error()))
    }
}

fn step_for(shared: &ConnectionShared, err: AmqpError) -> Step {
    match err.scope() {
        ErrorScope::Retryable => Step::Restart,
        ErrorScope::Closed => Step::Abandon(shared.closed_error()),
        ErrorScope::Entity | ErrorScope::Connection => Step::Abandon(err),
    }
}

async fn attempt(shared: &Arc<ConnectionShared>, replay: &mut Replay) -> Result<(), Step> {
    advance(shared, RecoveryState::Reconnecting)?;
    reconnect(shared).await?;

    advance(shared, RecoveryState::ReopeningChannels)?;
    reopen_channels(shared).await?;

    if shared.config.topology_recovery {
        advance(shared, RecoveryState::RecoveringTopology)?;
        for category in [Category::Exchange, Category::Queue, Category::Binding] {
            replay_category(shared, replay, category).await?;
        }

        advance(shared, RecoveryState::RecoveringConsumers)?;
        replay_category(shared, replay, Category::Consumer).await?;
    }

    let alive = shared.current_delegate().is_some_and(|d| d.is_open());
    if !alive {
        return Err(Step::Restart);
    }
    Ok(())
}

async fn reconnect(shared: &Arc<ConnectionShared>) -> Result<(), Step> {
    let interval = shared.config.network_recovery_interval;
    let mut attempts = 0;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shared.abandoned() => return Err(Step::Abandon(shared.closed_error())),
        }
        if shared.is_closing() {
            return Err(Step::Abandon(shared.closed_error()));
        }

        attempts += 1;
        debug!(attempt = attempts, "reconnecting...");
        let opened = timed(
            shared.config.call_timeout,
            shared.transport.open_connection(&shared.params),
        )
        .await;

        match opened {
            Ok(delegate) => {
                shared.install_delegate(delegate);
                if shared.is_closing() {
                    shared.abandon(&shared.closed_error().to_string()).await;
                    return Err(Step::Abandon(shared.closed_error()));
                }
                info!(attempt = attempts, "reconnected");
                return Ok(());
            }
            Err(err) if err.is_retryable() => {
                warn!(error = err.to_string(), attempt = attempts, "reconnect attempt failed");
                if shared.config.attempts_exhausted(attempts) {
                    return Err(Step::Abandon(err));
                }
            }
            Err(err) => {
                error!(error = err.to_string(), "broker refused the connection");
                return Err(step_for(shared, err));
            }
        }
    }
}

async fn open_channel(
    shared: &ConnectionShared,
    number: Option<u16>,
) -> Result<Arc<dyn TransportChannel>, AmqpError> {
    let delegate = shared
        .current_delegate()
        .ok_or_else(|| shared.closed_error())?;
    let channel = timed(shared.config.call_timeout, delegate.open_channel(number)).await?;

    if let Some(number) = number.filter(|n| *n != channel.number()) {
        debug!(
            requested = number,
            assigned = channel.number(),
            "channel number not preserved"
        );
    }
    Ok(channel)
}

/// Restores prefetch, confirm and transaction modes recorded for `number`.
async fn restore_modes(
    shared: &ConnectionShared,
    channel: &dyn TransportChannel,
    number: u16,
) -> Result<(), AmqpError> {
    let record = shared.registry.lock().channel(number).cloned();
    let Some(record) = record else {
        return Ok(());
    };
    let limit = shared.config.call_timeout;

    if let Some(prefetch) = record.global_prefetch {
        timed(limit, channel.basic_qos(prefetch, BasicQosOptions { global: true })).await?;
    }
    if let Some(prefetch) = record.prefetch {
        timed(limit, channel.basic_qos(prefetch, BasicQosOptions { global: false })).await?;
    }
    if record.confirm {
        timed(
            limit,
            channel.confirm_select(ConfirmSelectOptions { nowait: false }),
        )
        .await?;
    }
    if record.transactional {
        timed(limit, channel.tx_select()).await?;
    }
    Ok(())
}

async fn reopen(shared: &ConnectionShared, channel: &Arc<ChannelShared>) -> Result<(), AmqpError> {
    let delegate = open_channel(shared, Some(channel.number)).await?;
    restore_modes(shared, delegate.as_ref(), channel.number).await?;
    channel.install_delegate(delegate);
    debug!(number = channel.number, "channel reopened");
    Ok(())
}

async fn reopen_channels(shared: &Arc<ConnectionShared>) -> Result<(), Step> {
    let channels: Vec<Arc<ChannelShared>> = shared.channels.lock().values().cloned().collect();

    for channel in channels {
        reopen(shared, &channel)
            .await
            .map_err(|err| step_for(shared, err))?;
    }
    Ok(())
}

/// The live transport channel an entity recorded on `number` is replayed on.
///
/// Channels closed by the broker after an earlier rejection are reopened.
/// Entities whose channel was closed by the application use a temporary
/// topology channel.
async fn replay_channel(
    shared: &ConnectionShared,
    replay: &mut Replay,
    number: u16,
) -> Result<Arc<dyn TransportChannel>, AmqpError> {
    let handle = shared.channels.lock().get(&number).cloned();
    if let Some(handle) = handle {
        let delegate = handle.current_delegate().filter(|d| d.is_open());
        return match delegate {
            Some(delegate) => Ok(delegate),
            None => {
                reopen(shared, &handle).await?;
                handle
                    .current_delegate()
                    .ok_or(AmqpError::ChannelClosed(number))
            }
        };
    }

    if let Some(channel) = replay.topology_channel.as_ref().filter(|c| c.is_open()) {
        return Ok(channel.clone());
    }
    let channel = open_channel(shared, None).await?;
    replay.topology_channel = Some(channel.clone());
    Ok(channel)
}

async fn close_topology_channel(replay: &mut Replay) {
    if let Some(channel) = replay.topology_channel.take().filter(|c| c.is_open()) {
        if let Err(err) = channel.close(REPLY_SUCCESS, "topology recovered").await {
            debug!(error = err.to_string(), "failure closing topology channel");
        }
    }
}

fn is_kept(shared: &ConnectionShared, entity: &RecordedEntity) -> bool {
    let filter = &shared.policy.filter;
    match entity {
        RecordedEntity::Exchange(e) => filter.filter_exchange(e),
        RecordedEntity::Queue(q) => filter.filter_queue(q),
        RecordedEntity::Binding(b) => filter.filter_binding(b),
        RecordedEntity::Consumer(c) => filter.filter_consumer(c),
    }
}

/// The exchange or queue whose failure makes `entity` unrecoverable.
fn failed_dependency<'a>(entity: &RecordedEntity, failed: &'a HashSet<EntityId>) -> Option<&'a EntityId> {
    let depends_on: Vec<EntityId> = match entity {
        RecordedEntity::Exchange(_) | RecordedEntity::Queue(_) => vec![],
        RecordedEntity::Binding(b) => {
            let destination = match b.kind {
                BindingKind::Queue => EntityId::Queue(b.destination.clone()),
                BindingKind::Exchange => EntityId::Exchange(b.destination.clone()),
            };
            vec![EntityId::Exchange(b.source.clone()), destination]
        }
        RecordedEntity::Consumer(c) => vec![EntityId::Queue(c.queue.clone())],
    };
    depends_on.iter().find_map(|id| failed.get(id))
}

fn identity(entity: &RecordedEntity) -> Option<EntityId> {
    match entity {
        RecordedEntity::Exchange(e) => Some(EntityId::Exchange(e.name.clone())),
        RecordedEntity::Queue(q) => Some(EntityId::Queue(q.name.clone())),
        _ => None,
    }
}

async fn replay_category(
    shared: &ConnectionShared,
    replay: &mut Replay,
    category: Category,
) -> Result<(), Step> {
    let entities: Vec<RecordedEntity> = shared.registry.lock().entities_of(category).collect();
    debug!(?category, count = entities.len(), "replaying topology");

    for entity in entities {
        // The application may have deleted it while earlier entities replayed.
        if !shared.registry.lock().contains(&entity) {
            continue;
        }
        if !is_kept(shared, &entity) {
            debug!(entity = %entity, "excluded from recovery");
            continue;
        }
        if let Some(dependency) = failed_dependency(&entity, &replay.failed) {
            warn!(entity = %entity, ?dependency, "skipping, dependency failed to recover");
            continue;
        }

        match recover_entity(shared, replay, &entity).await {
            Ok(identity) => apply_identity(shared, replay, &entity, identity),
            Err(err) if err.scope() == ErrorScope::Entity => {
                error!(entity = %entity, error = err.to_string(), "broker rejected recovered entity");
                if let Some(id) = identity(&entity) {
                    replay.failed.insert(id);
                }
                shared.recovery_listeners.failed(Some(&entity), &err);
            }
            Err(err) => return Err(step_for(shared, err)),
        }
    }
    Ok(())
}

/// Replays one entity, retrying retryable failures while the connection
/// itself stays open.
async fn recover_entity(
    shared: &ConnectionShared,
    replay: &mut Replay,
    entity: &RecordedEntity,
) -> Result<Option<String>, AmqpError> {
    let attempts = shared.config.max_attempts.unwrap_or(DEFAULT_REPLAY_ATTEMPTS).max(1);
    let mut attempt = 0;

    loop {
        if shared.is_closing() {
            return Err(shared.closed_error());
        }
        attempt += 1;

        let channel = replay_channel(shared, replay, entity.channel()).await?;
        let result = timed(shared.config.call_timeout, entity.recover(channel.as_ref())).await;

        match result {
            Ok(identity) => {
                debug!(entity = %entity, "entity recovered");
                return Ok(identity);
            }
            Err(err) if err.is_retryable() => {
                let alive = shared.current_delegate().is_some_and(|d| d.is_open());
                if !alive || attempt >= attempts {
                    return Err(err);
                }
                warn!(entity = %entity, error = err.to_string(), attempt, "retrying entity recovery");
                tokio::time::sleep(shared.config.network_recovery_interval).await;
            }
            Err(err) => return Err(err),
        }
    }
}

fn apply_identity(
    shared: &ConnectionShared,
    replay: &mut Replay,
    entity: &RecordedEntity,
    identity: Option<String>,
) {
    let Some(current) = identity else {
        return;
    };

    match entity {
        RecordedEntity::Queue(queue) => {
            if queue.name != current {
                let rewritten = shared.registry.lock().rename_queue(&queue.name, &current);
                info!(old = queue.name, new = current, rewritten, "queue renamed by broker");
                replay.renamed.insert(queue.name.clone(), current);
            }
        }
        RecordedEntity::Consumer(consumer) => {
            if consumer.tag != current {
                shared.registry.lock().rename_consumer(&consumer.tag, &current);
                info!(old = consumer.tag, new = current, "consumer tag renamed by broker");
                replay.renamed.insert(consumer.tag.clone(), current.clone());
            }
            replay
                .recovered_consumers
                .push((consumer.callback().clone(), current));
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        consumer::{ConsumerDefinition, Delivery},
        exchange::{ExchangeBinding, ExchangeDefinition},
        queue::{QueueBinding, QueueDefinition},
        recorded::{RecordedBinding, RecordedConsumer, RecordedQueue},
    };
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl ConsumerCallback for Noop {
        async fn handle_delivery(&self, _delivery: Delivery) {}
    }

    #[test]
    fn only_intermediate_states_are_recovering() {
        assert!(!RecoveryState::Active.is_recovering());
        assert!(RecoveryState::Reconnecting.is_recovering());
        assert!(RecoveryState::RecoveringConsumers.is_recovering());
        assert!(!RecoveryState::Abandoned.is_recovering());
        assert!(RecoveryState::Abandoned.is_terminal());
        assert_eq!(RecoveryState::ReopeningChannels.to_string(), "reopening_channels");
    }

    #[test]
    fn dependents_of_failed_entities_are_skipped() {
        let failed: HashSet<EntityId> = [EntityId::Exchange("E".into())].into_iter().collect();

        let bound = RecordedEntity::Binding(RecordedBinding::queue(
            1,
            &QueueBinding::new("q").exchange("E").routing_key("k"),
        ));
        let e2e = RecordedEntity::Binding(RecordedBinding::exchange(
            1,
            &ExchangeBinding::new("E", "other"),
        ));
        let unrelated = RecordedEntity::Binding(RecordedBinding::queue(
            1,
            &QueueBinding::new("q").exchange("F"),
        ));

        assert!(failed_dependency(&bound, &failed).is_some());
        assert!(failed_dependency(&e2e, &failed).is_some());
        assert!(failed_dependency(&unrelated, &failed).is_none());
    }

    #[test]
    fn consumers_depend_on_their_queue() {
        let failed: HashSet<EntityId> = [EntityId::Queue("q".into())].into_iter().collect();
        let consumer = RecordedEntity::Consumer(RecordedConsumer::new(
            1,
            "c1",
            &ConsumerDefinition::new("q").tag("c1"),
            Arc::new(Noop),
        ));
        let queue = RecordedEntity::Queue(RecordedQueue::new(1, "q", &QueueDefinition::new("q")));

        assert_eq!(
            failed_dependency(&consumer, &failed),
            Some(&EntityId::Queue("q".into()))
        );
        assert!(failed_dependency(&queue, &failed).is_none());
        assert_eq!(
            identity(&RecordedEntity::Exchange(crate::recorded::RecordedExchange::new(
                1,
                &ExchangeDefinition::new("E")
            ))),
            Some(EntityId::Exchange("E".into()))
        );
    }
}
