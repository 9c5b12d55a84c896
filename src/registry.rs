// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Registry
//!
//! The registry holds everything the application has declared on one logical
//! connection and not yet removed: exchanges, queues, bindings, consumers,
//! and one [`ChannelRecord`] per open channel.
//!
//! Entities are keyed by identity (name, tag or binding id) for O(1) lookup
//! during identity rewrites. A dependency index maps every queue and exchange
//! to the bindings and consumers that reference it. It is maintained on each
//! `record`/`forget`, so cascading removal and renames never rescan the
//! whole topology.
//!
//! The registry is plain data. The connection wraps it in a lock and never
//! holds that lock across transport I/O.

use crate::recorded::{
    BindingKind, Category, RecordedBinding, RecordedConsumer, RecordedEntity, RecordedExchange,
    RecordedQueue,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Identity of a recorded entity within its category.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityId {
    /// Exchange name
    Exchange(String),
    /// Queue name, as currently known to the broker
    Queue(String),
    /// Registry-assigned sequence number of the binding
    Binding(u64),
    /// Current consumer tag
    Consumer(String),
}

/// Per-channel state that has to be restored before consumers are replayed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelRecord {
    /// Channel number, stable across recoveries
    pub number: u16,
    /// Publisher confirms were enabled with `confirm.select`
    pub confirm: bool,
    /// Transactions were enabled with `tx.select`
    pub transactional: bool,
    /// Per-consumer prefetch set with `basic_qos(.., global = false)`.
    pub prefetch: Option<u16>,
    /// Channel-wide prefetch set with `basic_qos(.., global = true)`.
    pub global_prefetch: Option<u16>,
    /// Tags of the consumers registered through this channel
    pub consumers: BTreeSet<String>,
}

#[derive(Debug, Clone)]
struct Slot<T> {
    seq: u64,
    entity: T,
}

/// Every exchange, queue, binding and consumer declared through the
/// connection's channels, indexed for replay and for cascading removal.
///
/// Entities replay grouped by category and, within a category, in the order
/// they were first declared.
#[derive(Debug, Default)]
pub struct TopologyRegistry {
    seq: u64,
    exchanges: HashMap<String, Slot<RecordedExchange>>,
    queues: HashMap<String, Slot<RecordedQueue>>,
    bindings: HashMap<u64, Slot<RecordedBinding>>,
    consumers: HashMap<String, Slot<RecordedConsumer>>,
    dependents: HashMap<EntityId, HashSet<EntityId>>,
    channels: BTreeMap<u16, ChannelRecord>,
    tag_aliases: HashMap<String, String>,
}

impl TopologyRegistry {
    /// Creates an empty registry.
    pub fn new() -> TopologyRegistry {
        TopologyRegistry::default()
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Records an entity and returns its identity.
    ///
    /// Re-declaring an exchange or queue replaces the previous record but
    /// keeps its original replay position. An equal binding is recorded once.
    pub fn record(&mut self, entity: RecordedEntity) -> EntityId {
        match entity {
            RecordedEntity::Exchange(exchange) => {
                let id = EntityId::Exchange(exchange.name.clone());
                let seq = match self.exchanges.get(&exchange.name).map(|slot| slot.seq) {
                    Some(seq) => seq,
                    None => self.next_seq(),
                };
                self.exchanges.insert(
                    exchange.name.clone(),
                    Slot {
                        seq,
                        entity: exchange,
                    },
                );
                id
            }
            RecordedEntity::Queue(queue) => {
                let id = EntityId::Queue(queue.name.clone());
                let seq = match self.queues.get(&queue.name).map(|slot| slot.seq) {
                    Some(seq) => seq,
                    None => self.next_seq(),
                };
                self.queues.insert(queue.name.clone(), Slot { seq, entity: queue });
                id
            }
            RecordedEntity::Binding(binding) => {
                if let Some(id) = self.find_binding(&binding) {
                    return EntityId::Binding(id);
                }

                let seq = self.next_seq();
                let id = EntityId::Binding(seq);
                self.link(Self::source_of(&binding), id.clone());
                self.link(Self::destination_of(&binding), id.clone());
                self.bindings.insert(
                    seq,
                    Slot {
                        seq,
                        entity: binding,
                    },
                );
                id
            }
            RecordedEntity::Consumer(consumer) => {
                let id = EntityId::Consumer(consumer.tag.clone());
                if self.consumers.contains_key(&consumer.tag) {
                    self.forget(&id);
                }

                let seq = self.next_seq();
                self.link(EntityId::Queue(consumer.queue.clone()), id.clone());
                self.channel_mut(consumer.channel)
                    .consumers
                    .insert(consumer.tag.clone());
                self.consumers.insert(
                    consumer.tag.clone(),
                    Slot {
                        seq,
                        entity: consumer,
                    },
                );
                id
            }
        }
    }

    /// Removes exactly one entity, leaving its dependents in place.
    pub fn forget(&mut self, id: &EntityId) -> Option<RecordedEntity> {
        match id {
            EntityId::Exchange(name) => self
                .exchanges
                .remove(name)
                .map(|slot| RecordedEntity::Exchange(slot.entity)),
            EntityId::Queue(name) => self
                .queues
                .remove(name)
                .map(|slot| RecordedEntity::Queue(slot.entity)),
            EntityId::Binding(seq) => {
                let slot = self.bindings.remove(seq)?;
                self.unlink(&Self::source_of(&slot.entity), id);
                self.unlink(&Self::destination_of(&slot.entity), id);
                Some(RecordedEntity::Binding(slot.entity))
            }
            EntityId::Consumer(tag) => {
                let slot = self.consumers.remove(tag)?;
                self.unlink(&EntityId::Queue(slot.entity.queue.clone()), id);
                if let Some(channel) = self.channels.get_mut(&slot.entity.channel) {
                    channel.consumers.remove(tag);
                }
                self.tag_aliases.retain(|_, current| current != tag);
                Some(RecordedEntity::Consumer(slot.entity))
            }
        }
    }

    /// Removes an entity and, transitively, every binding and consumer that
    /// depends on it. Returns everything removed, the entity itself first.
    pub fn cascade_remove(&mut self, id: &EntityId) -> Vec<RecordedEntity> {
        let mut removed = vec![];
        let mut pending = vec![id.clone()];

        while let Some(next) = pending.pop() {
            if let Some(dependents) = self.dependents.remove(&next) {
                let mut dependents: Vec<EntityId> = dependents.into_iter().collect();
                dependents.sort_by_key(|d| format!("{d:?}"));
                pending.extend(dependents);
            }
            if let Some(entity) = self.forget(&next) {
                removed.push(entity);
            }
        }

        removed
    }

    /// Forgets a binding equal to `binding`, then the source exchange if it is
    /// auto-delete and no other binding uses it as a source.
    pub fn unbind(&mut self, binding: &RecordedBinding) -> Vec<RecordedEntity> {
        let Some(seq) = self.find_binding(binding) else {
            return vec![];
        };

        let mut removed: Vec<RecordedEntity> =
            self.forget(&EntityId::Binding(seq)).into_iter().collect();
        removed.extend(self.maybe_forget_auto_delete_exchange(&binding.source));
        removed
    }

    /// Forgets a consumer, then its queue if the queue is auto-delete and has
    /// no other recorded consumer.
    pub fn cancel_consumer(&mut self, tag: &str) -> Vec<RecordedEntity> {
        let tag = self.resolve_tag(tag);
        let Some(RecordedEntity::Consumer(consumer)) = self.forget(&EntityId::Consumer(tag)) else {
            return vec![];
        };

        let queue = consumer.queue.clone();
        let mut removed = vec![RecordedEntity::Consumer(consumer)];

        let auto_delete = self
            .queues
            .get(&queue)
            .is_some_and(|slot| slot.entity.auto_delete);
        if auto_delete && !self.has_consumers(&queue) {
            removed.extend(self.cascade_remove(&EntityId::Queue(queue)));
        }

        removed
    }

    fn maybe_forget_auto_delete_exchange(&mut self, name: &str) -> Vec<RecordedEntity> {
        let auto_delete = self
            .exchanges
            .get(name)
            .is_some_and(|slot| slot.entity.auto_delete);
        let still_source = self
            .bindings
            .values()
            .any(|slot| slot.entity.source == name);

        if auto_delete && !still_source {
            self.cascade_remove(&EntityId::Exchange(name.to_owned()))
        } else {
            vec![]
        }
    }

    /// Entities of one category, in declaration order.
    pub fn entities_of(&self, category: Category) -> impl Iterator<Item = RecordedEntity> {
        let mut slots: Vec<(u64, RecordedEntity)> = match category {
            Category::Exchange => self
                .exchanges
                .values()
                .map(|s| (s.seq, RecordedEntity::Exchange(s.entity.clone())))
                .collect(),
            Category::Queue => self
                .queues
                .values()
                .map(|s| (s.seq, RecordedEntity::Queue(s.entity.clone())))
                .collect(),
            Category::Binding => self
                .bindings
                .values()
                .map(|s| (s.seq, RecordedEntity::Binding(s.entity.clone())))
                .collect(),
            Category::Consumer => self
                .consumers
                .values()
                .map(|s| (s.seq, RecordedEntity::Consumer(s.entity.clone())))
                .collect(),
        };
        slots.sort_by_key(|(seq, _)| *seq);
        slots.into_iter().map(|(_, entity)| entity)
    }

    /// Every entity in replay order: exchanges, queues, bindings, consumers.
    pub fn entities(&self) -> impl Iterator<Item = RecordedEntity> + '_ {
        [
            Category::Exchange,
            Category::Queue,
            Category::Binding,
            Category::Consumer,
        ]
        .into_iter()
        .flat_map(|category| self.entities_of(category))
    }

    /// Rewrites a queue's name and every binding and consumer that references it.
    /// Returns how many references were rewritten.
    pub fn rename_queue(&mut self, old: &str, new: &str) -> usize {
        if old == new {
            return 0;
        }
        let Some(mut slot) = self.queues.remove(old) else {
            return 0;
        };
        slot.entity.name = new.to_owned();
        self.queues.insert(new.to_owned(), slot);

        let old_id = EntityId::Queue(old.to_owned());
        let new_id = EntityId::Queue(new.to_owned());
        let dependents = self.dependents.remove(&old_id).unwrap_or_default();
        let mut rewritten = 0;

        for dependent in &dependents {
            match dependent {
                EntityId::Binding(seq) => {
                    if let Some(slot) = self.bindings.get_mut(seq) {
                        if slot.entity.kind == BindingKind::Queue && slot.entity.destination == old
                        {
                            slot.entity.destination = new.to_owned();
                            rewritten += 1;
                        }
                    }
                }
                EntityId::Consumer(tag) => {
                    if let Some(slot) = self.consumers.get_mut(tag) {
                        slot.entity.queue = new.to_owned();
                        rewritten += 1;
                    }
                }
                _ => {}
            }
        }

        if !dependents.is_empty() {
            self.dependents
                .entry(new_id)
                .or_default()
                .extend(dependents);
        }

        rewritten
    }

    /// Rewrites a consumer tag; the old tag stays resolvable through [`Self::resolve_tag`].
    pub fn rename_consumer(&mut self, old: &str, new: &str) -> bool {
        if old == new {
            return false;
        }
        let Some(mut slot) = self.consumers.remove(old) else {
            return false;
        };
        slot.entity.tag = new.to_owned();

        let queue_id = EntityId::Queue(slot.entity.queue.clone());
        if let Some(set) = self.dependents.get_mut(&queue_id) {
            set.remove(&EntityId::Consumer(old.to_owned()));
            set.insert(EntityId::Consumer(new.to_owned()));
        }
        if let Some(channel) = self.channels.get_mut(&slot.entity.channel) {
            channel.consumers.remove(old);
            channel.consumers.insert(new.to_owned());
        }

        for current in self.tag_aliases.values_mut() {
            if current == old {
                *current = new.to_owned();
            }
        }
        self.tag_aliases.insert(old.to_owned(), new.to_owned());
        self.consumers.insert(new.to_owned(), slot);
        true
    }

    /// Maps a possibly stale consumer tag to the current one.
    pub fn resolve_tag(&self, tag: &str) -> String {
        self.tag_aliases
            .get(tag)
            .cloned()
            .unwrap_or_else(|| tag.to_owned())
    }

    /// Gets the record of a channel, creating an empty one if needed.
    ///
    /// # Parameters
    /// * `number` - The channel number
    ///
    /// # Returns
    /// The mutable channel record
    pub fn channel_mut(&mut self, number: u16) -> &mut ChannelRecord {
        self.channels.entry(number).or_insert_with(|| ChannelRecord {
            number,
            ..Default::default()
        })
    }

    /// Gets the record of a channel, if it was ever opened.
    pub fn channel(&self, number: u16) -> Option<&ChannelRecord> {
        self.channels.get(&number)
    }

    /// Channel records ordered by channel number.
    pub fn channels(&self) -> impl Iterator<Item = &ChannelRecord> {
        self.channels.values()
    }

    /// Drops a channel record and the consumers registered through it.
    pub fn remove_channel(&mut self, number: u16) -> Vec<RecordedEntity> {
        let Some(record) = self.channels.remove(&number) else {
            return vec![];
        };
        record
            .consumers
            .iter()
            .filter_map(|tag| self.forget(&EntityId::Consumer(tag.clone())))
            .collect()
    }

    /// Looks up a recorded exchange.
    ///
    /// # Parameters
    /// * `name` - The exchange name
    ///
    /// # Returns
    /// The recorded exchange, or `None` if it was never declared or was deleted
    pub fn exchange(&self, name: &str) -> Option<&RecordedExchange> {
        self.exchanges.get(name).map(|slot| &slot.entity)
    }

    /// Looks up a recorded queue by its current name.
    ///
    /// # Parameters
    /// * `name` - The queue name; server-named queues use the latest name
    ///
    /// # Returns
    /// The recorded queue, or `None` if it is not recorded
    pub fn queue(&self, name: &str) -> Option<&RecordedQueue> {
        self.queues.get(name).map(|slot| &slot.entity)
    }

    /// Looks up a recorded consumer. Tags replaced by a recovery resolve to
    /// the current one.
    ///
    /// # Parameters
    /// * `tag` - A current or previous consumer tag
    ///
    /// # Returns
    /// The recorded consumer, or `None` if it was cancelled or never recorded
    pub fn consumer(&self, tag: &str) -> Option<&RecordedConsumer> {
        self.consumers
            .get(&self.resolve_tag(tag))
            .map(|slot| &slot.entity)
    }

    /// Every recorded binding, in declaration order.
    pub fn bindings(&self) -> impl Iterator<Item = RecordedBinding> {
        self.entities_of(Category::Binding)
            .filter_map(|entity| match entity {
                RecordedEntity::Binding(b) => Some(b),
                _ => None,
            })
    }

    /// Identities that depend on `id` according to the dependency index.
    pub fn dependents_of(&self, id: &EntityId) -> HashSet<EntityId> {
        self.dependents.get(id).cloned().unwrap_or_default()
    }

    /// Whether an entity with the same identity is still recorded.
    pub fn contains(&self, entity: &RecordedEntity) -> bool {
        match entity {
            RecordedEntity::Exchange(e) => self.exchanges.contains_key(&e.name),
            RecordedEntity::Queue(q) => self.queues.contains_key(&q.name),
            RecordedEntity::Binding(b) => self.find_binding(b).is_some(),
            RecordedEntity::Consumer(c) => self.consumers.contains_key(&c.tag),
        }
    }

    /// Number of recorded entities; channel records are not counted.
    pub fn len(&self) -> usize {
        self.exchanges.len() + self.queues.len() + self.bindings.len() + self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn has_consumers(&self, queue: &str) -> bool {
        self.dependents
            .get(&EntityId::Queue(queue.to_owned()))
            .is_some_and(|set| set.iter().any(|d| matches!(d, EntityId::Consumer(_))))
    }

    fn find_binding(&self, binding: &RecordedBinding) -> Option<u64> {
        let candidates = self.dependents.get(&Self::source_of(binding))?;
        candidates.iter().find_map(|dependent| match dependent {
            EntityId::Binding(seq) => self
                .bindings
                .get(seq)
                .filter(|slot| slot.entity == *binding)
                .map(|_| *seq),
            _ => None,
        })
    }

    fn source_of(binding: &RecordedBinding) -> EntityId {
        EntityId::Exchange(binding.source.clone())
    }

    fn destination_of(binding: &RecordedBinding) -> EntityId {
        match binding.kind {
            BindingKind::Queue => EntityId::Queue(binding.destination.clone()),
            BindingKind::Exchange => EntityId::Exchange(binding.destination.clone()),
        }
    }

    fn link(&mut self, target: EntityId, dependent: EntityId) {
        self.dependents.entry(target).or_default().insert(dependent);
    }

    fn unlink(&mut self, target: &EntityId, dependent: &EntityId) {
        if let Some(set) = self.dependents.get_mut(target) {
            set.remove(dependent);
            if set.is_empty() {
                self.dependents.remove(target);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        consumer::{ConsumerCallback, ConsumerDefinition, Delivery},
        exchange::{ExchangeBinding, ExchangeDefinition},
        queue::{QueueBinding, QueueDefinition},
    };
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Noop;

    #[async_trait]
    impl ConsumerCallback for Noop {
        async fn handle_delivery(&self, _delivery: Delivery) {}
    }

    fn exchange(name: &str) -> RecordedEntity {
        RecordedEntity::Exchange(RecordedExchange::new(
            1,
            &ExchangeDefinition::new(name).topic(),
        ))
    }

    fn queue(name: &str, def: QueueDefinition) -> RecordedEntity {
        RecordedEntity::Queue(RecordedQueue::new(1, name, &def))
    }

    fn queue_binding(queue: &str, exchange: &str, key: &str) -> RecordedBinding {
        RecordedBinding::queue(
            1,
            &QueueBinding::new(queue).exchange(exchange).routing_key(key),
        )
    }

    fn consumer(tag: &str, queue: &str, server_tag: bool) -> RecordedEntity {
        let def = if server_tag {
            ConsumerDefinition::new(queue)
        } else {
            ConsumerDefinition::new(queue).tag(tag)
        };
        RecordedEntity::Consumer(RecordedConsumer::new(1, tag, &def, Arc::new(Noop)))
    }

    fn categories(registry: &TopologyRegistry) -> Vec<Category> {
        registry.entities().map(|e| e.category()).collect()
    }

    #[test]
    fn iterates_in_dependency_order_regardless_of_declaration_order() {
        let mut registry = TopologyRegistry::new();
        registry.record(consumer("c1", "q", false));
        registry.record(RecordedEntity::Binding(queue_binding("q", "E", "k")));
        registry.record(queue("q", QueueDefinition::new("q")));
        registry.record(exchange("E"));

        assert_eq!(
            categories(&registry),
            vec![
                Category::Exchange,
                Category::Queue,
                Category::Binding,
                Category::Consumer
            ]
        );
    }

    #[test]
    fn keeps_declaration_order_within_a_category() {
        let mut registry = TopologyRegistry::new();
        for name in ["b", "a", "c"] {
            registry.record(exchange(name));
        }
        registry.record(exchange("a"));

        let names: Vec<String> = registry
            .entities_of(Category::Exchange)
            .map(|e| match e {
                RecordedEntity::Exchange(x) => x.name,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[test]
    fn records_equal_bindings_once() {
        let mut registry = TopologyRegistry::new();
        let first = registry.record(RecordedEntity::Binding(queue_binding("q", "E", "k")));
        let second = registry.record(RecordedEntity::Binding(queue_binding("q", "E", "k")));

        assert_eq!(first, second);
        assert_eq!(registry.bindings().count(), 1);
    }

    #[test]
    fn deleting_a_queue_cascades_to_bindings_and_consumers() {
        let mut registry = TopologyRegistry::new();
        registry.record(exchange("E"));
        registry.record(queue("q", QueueDefinition::new("q")));
        registry.record(queue("other", QueueDefinition::new("other")));
        registry.record(RecordedEntity::Binding(queue_binding("q", "E", "a")));
        registry.record(RecordedEntity::Binding(queue_binding("q", "E", "b")));
        registry.record(RecordedEntity::Binding(queue_binding("other", "E", "a")));
        registry.record(consumer("c1", "q", false));
        registry.record(consumer("c2", "other", false));

        let removed = registry.cascade_remove(&EntityId::Queue("q".into()));

        assert_eq!(removed.len(), 4);
        assert_eq!(removed[0].category(), Category::Queue);
        assert!(registry.queue("q").is_none());
        assert!(registry.consumer("c1").is_none());
        assert_eq!(registry.bindings().count(), 1);
        assert!(registry.consumer("c2").is_some());
        assert!(registry.exchange("E").is_some());
        assert!(!registry.channel(1).unwrap().consumers.contains("c1"));
    }

    #[test]
    fn deleting_an_exchange_removes_bindings_on_both_sides() {
        let mut registry = TopologyRegistry::new();
        registry.record(exchange("src"));
        registry.record(exchange("dst"));
        registry.record(queue("q", QueueDefinition::new("q")));
        registry.record(RecordedEntity::Binding(RecordedBinding::exchange(
            1,
            &ExchangeBinding::new("dst", "src"),
        )));
        registry.record(RecordedEntity::Binding(queue_binding("q", "dst", "k")));

        let removed = registry.cascade_remove(&EntityId::Exchange("dst".into()));

        assert_eq!(removed.len(), 3);
        assert_eq!(registry.bindings().count(), 0);
        assert!(registry.exchange("src").is_some());
        assert!(registry.queue("q").is_some());
        assert!(registry
            .dependents_of(&EntityId::Exchange("src".into()))
            .is_empty());
    }

    #[test]
    fn renaming_a_queue_rewrites_every_reference() {
        let mut registry = TopologyRegistry::new();
        registry.record(exchange("E"));
        registry.record(queue("amq.gen-X", QueueDefinition::server_named()));
        registry.record(RecordedEntity::Binding(queue_binding("amq.gen-X", "E", "k")));
        registry.record(consumer("C1", "amq.gen-X", false));

        assert_eq!(registry.rename_queue("amq.gen-X", "amq.gen-Y"), 2);

        assert!(registry.queue("amq.gen-X").is_none());
        assert_eq!(registry.queue("amq.gen-Y").unwrap().name, "amq.gen-Y");
        let binding = registry.bindings().next().unwrap();
        assert_eq!(binding.destination, "amq.gen-Y");
        assert_eq!(registry.consumer("C1").unwrap().queue, "amq.gen-Y");

        // The index follows the rename, so cascades still find the dependents.
        let removed = registry.cascade_remove(&EntityId::Queue("amq.gen-Y".into()));
        assert_eq!(removed.len(), 3);
    }

    #[test]
    fn renamed_consumer_tag_stays_resolvable() {
        let mut registry = TopologyRegistry::new();
        registry.record(queue("q", QueueDefinition::new("q")));
        registry.record(consumer("amq.ctag-1", "q", true));

        assert!(registry.rename_consumer("amq.ctag-1", "amq.ctag-2"));
        assert!(registry.rename_consumer("amq.ctag-2", "amq.ctag-3"));

        assert_eq!(registry.resolve_tag("amq.ctag-1"), "amq.ctag-3");
        assert_eq!(registry.consumer("amq.ctag-1").unwrap().tag, "amq.ctag-3");
        assert!(registry.channel(1).unwrap().consumers.contains("amq.ctag-3"));

        let removed = registry.cancel_consumer("amq.ctag-1");
        assert_eq!(removed.len(), 1);
        assert!(registry.consumer("amq.ctag-3").is_none());
    }

    #[test]
    fn cancelling_last_consumer_forgets_auto_delete_queue() {
        let mut registry = TopologyRegistry::new();
        registry.record(exchange("E"));
        registry.record(queue("q", QueueDefinition::new("q").delete()));
        registry.record(RecordedEntity::Binding(queue_binding("q", "E", "k")));
        registry.record(consumer("c1", "q", false));
        registry.record(consumer("c2", "q", false));

        assert_eq!(registry.cancel_consumer("c1").len(), 1);
        assert!(registry.queue("q").is_some());

        let removed = registry.cancel_consumer("c2");
        assert_eq!(removed.len(), 3);
        assert!(registry.queue("q").is_none());
        assert_eq!(registry.bindings().count(), 0);
    }

    #[test]
    fn unbinding_last_binding_forgets_auto_delete_exchange() {
        let mut registry = TopologyRegistry::new();
        registry.record(RecordedEntity::Exchange(RecordedExchange::new(
            1,
            &ExchangeDefinition::new("E").delete(),
        )));
        registry.record(queue("q", QueueDefinition::new("q")));
        let binding = queue_binding("q", "E", "k");
        registry.record(RecordedEntity::Binding(binding.clone()));

        let removed = registry.unbind(&binding);

        assert_eq!(removed.len(), 2);
        assert!(registry.exchange("E").is_none());
        assert!(registry.queue("q").is_some());
    }

    #[test]
    fn removing_a_channel_drops_its_consumers_only() {
        let mut registry = TopologyRegistry::new();
        registry.record(queue("q", QueueDefinition::new("q")));
        registry.record(consumer("c1", "q", false));
        registry.channel_mut(1).confirm = true;

        let removed = registry.remove_channel(1);

        assert_eq!(removed.len(), 1);
        assert!(registry.channel(1).is_none());
        assert!(registry.queue("q").is_some());
    }

    #[test]
    fn replaying_a_sequence_matches_the_final_registry() {
        let mut registry = TopologyRegistry::new();
        registry.record(exchange("E"));
        registry.record(queue("a", QueueDefinition::new("a")));
        registry.record(queue("b", QueueDefinition::new("b")));
        registry.record(RecordedEntity::Binding(queue_binding("a", "E", "k")));
        registry.record(RecordedEntity::Binding(queue_binding("b", "E", "k")));
        registry.cascade_remove(&EntityId::Queue("a".into()));

        let mut replayed = TopologyRegistry::new();
        for entity in registry.entities() {
            replayed.record(entity);
        }

        assert_eq!(
            replayed.entities().collect::<Vec<_>>(),
            registry.entities().collect::<Vec<_>>()
        );
        assert_eq!(replayed.len(), 3);
    }
}
