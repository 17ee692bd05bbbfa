//! In-memory cache of remote-owned entities.
//!
//! Entries are replaced wholesale, never merged field-by-field. An entry with
//! a pending optimistic mutation is owned by the coordinator until it settles:
//! readers see the provisional value, other writers are turned away.

use crate::{read, write};
use std::collections::HashMap;
use std::sync::RwLock;
use tickethold_core::entity::Entity;
use tickethold_core::error::{ReservationError, Result};

#[derive(Debug)]
struct Slot<E> {
    value: E,
    pending: bool,
}

/// Outcome of writing a fetched snapshot into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The snapshot replaced (or created) the entry
    Stored,
    /// The entry has a pending mutation and was left alone
    SkippedPending,
}

/// Cache of entities keyed by id.
#[derive(Debug)]
pub struct EntityCache<E: Entity> {
    entries: RwLock<HashMap<E::Id, Slot<E>>>,
}

impl<E: Entity> Default for EntityCache<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> EntityCache<E> {
    /// Creates an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns a copy of the cached entity, provisional or not.
    #[must_use]
    pub fn get(&self, id: &E::Id) -> Option<E> {
        read(&self.entries).get(id).map(|slot| slot.value.clone())
    }

    /// Whether the entity is cached
    #[must_use]
    pub fn contains(&self, id: &E::Id) -> bool {
        read(&self.entries).contains_key(id)
    }

    /// Whether the entity has an unsettled optimistic mutation
    #[must_use]
    pub fn is_pending(&self, id: &E::Id) -> bool {
        read(&self.entries).get(id).is_some_and(|slot| slot.pending)
    }

    /// Number of cached entities
    #[must_use]
    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        read(&self.entries).is_empty()
    }

    /// Copies of every cached entity matching `filter`.
    #[must_use]
    pub fn select(&self, filter: impl Fn(&E) -> bool) -> Vec<E> {
        read(&self.entries)
            .values()
            .filter(|slot| filter(&slot.value))
            .map(|slot| slot.value.clone())
            .collect()
    }

    /// Stores a snapshot received from the remote authority.
    ///
    /// # Errors
    ///
    /// Returns error if the snapshot fails [`Entity::validate`]; the cache is
    /// left unchanged.
    pub fn upsert(&self, entity: E) -> Result<UpsertOutcome> {
        entity.validate()?;
        let mut entries = write(&self.entries);
        match entries.get_mut(entity.id()) {
            Some(slot) if slot.pending => {
                tracing::debug!(
                    kind = E::KIND,
                    entity = %entity.id(),
                    "Snapshot skipped: entity has a pending mutation"
                );
                Ok(UpsertOutcome::SkippedPending)
            },
            Some(slot) => {
                slot.value = entity;
                Ok(UpsertOutcome::Stored)
            },
            None => {
                entries.insert(
                    entity.id().clone(),
                    Slot {
                        value: entity,
                        pending: false,
                    },
                );
                Ok(UpsertOutcome::Stored)
            },
        }
    }

    /// Removes an entity unless it has a pending mutation.
    ///
    /// Returns the removed value, or `None` if it was absent or pending.
    pub fn remove(&self, id: &E::Id) -> Option<E> {
        let mut entries = write(&self.entries);
        if entries.get(id).is_some_and(|slot| slot.pending) {
            return None;
        }
        entries.remove(id).map(|slot| slot.value)
    }

    /// Applies `mutate` to the cached value and marks the entry pending.
    ///
    /// The provisional value must pass [`Entity::validate`] and then `admit`,
    /// which sees `(current, provisional)`; either failing leaves the entry
    /// untouched. Returns `(previous, provisional)`. Both closures run under
    /// the cache's write lock and must not touch this cache.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::UnknownEntity`] if `id` is not cached
    /// - [`ReservationError::ConflictingMutation`] if `id` is already pending
    /// - whatever validation or `admit` returns
    pub fn begin_mutation(
        &self,
        id: &E::Id,
        mutate: impl FnOnce(&E) -> E,
        admit: impl FnOnce(&E, &E) -> Result<()>,
    ) -> Result<(E, E)> {
        let mut entries = write(&self.entries);
        let Some(slot) = entries.get_mut(id) else {
            return Err(ReservationError::UnknownEntity {
                entity: id.to_string(),
            });
        };
        if slot.pending {
            return Err(ReservationError::ConflictingMutation {
                entity: id.to_string(),
            });
        }

        let provisional = mutate(&slot.value);
        provisional.validate()?;
        admit(&slot.value, &provisional)?;
        let previous = std::mem::replace(&mut slot.value, provisional.clone());
        slot.pending = true;
        Ok((previous, provisional))
    }

    /// Writes the settled value and hands the entry back to ordinary writers.
    pub(crate) fn settle_mutation(&self, id: &E::Id, value: E) {
        let mut entries = write(&self.entries);
        match entries.get_mut(id) {
            Some(slot) => {
                slot.value = value;
                slot.pending = false;
            },
            // Pending entries cannot be removed, so this only happens if the
            // coordinator was handed a different cache.
            None => {
                entries.insert(
                    id.clone(),
                    Slot {
                        value,
                        pending: false,
                    },
                );
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tickethold_core::types::{CollectionId, InventoryItem, ItemId};

    fn item(id: &str, capacity: u32) -> InventoryItem {
        InventoryItem::new(ItemId::new(id), CollectionId::new("fest"), id, capacity)
    }

    #[test]
    fn test_upsert_replaces_wholesale() {
        let cache = EntityCache::new();
        cache.upsert(item("ga", 100).with_committed(10, 0)).unwrap();
        cache.upsert(item("ga", 100).with_committed(20, 3)).unwrap();

        let stored = cache.get(&ItemId::new("ga")).unwrap();
        assert_eq!(stored.committed_sold, 20);
        assert_eq!(stored.committed_reserved, 3);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_upsert_rejects_invalid_snapshot() {
        let cache = EntityCache::new();
        let err = cache.upsert(item("ga", 10).with_committed(9, 2)).unwrap_err();
        assert!(matches!(err, ReservationError::InvariantViolation { .. }));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_pending_entry_is_not_overwritten_or_removed() {
        let cache = EntityCache::new();
        cache.upsert(item("ga", 100)).unwrap();
        let id = ItemId::new("ga");

        let (previous, provisional) = cache
            .begin_mutation(
                &id,
                |current| InventoryItem {
                    name: "General".to_string(),
                    ..current.clone()
                },
                |_, _| Ok(()),
            )
            .unwrap();
        assert_eq!(previous.name, "ga");
        assert_eq!(provisional.name, "General");
        assert!(cache.is_pending(&id));

        assert_eq!(
            cache.upsert(item("ga", 100)).unwrap(),
            UpsertOutcome::SkippedPending
        );
        assert!(cache.remove(&id).is_none());
        assert_eq!(cache.get(&id).unwrap().name, "General");

        cache.settle_mutation(&id, previous);
        assert!(!cache.is_pending(&id));
        assert_eq!(cache.get(&id).unwrap().name, "ga");
    }

    #[test]
    fn test_second_mutation_conflicts() {
        let cache = EntityCache::new();
        cache.upsert(item("ga", 100)).unwrap();
        let id = ItemId::new("ga");

        cache.begin_mutation(&id, Clone::clone, |_, _| Ok(())).unwrap();
        let err = cache.begin_mutation(&id, Clone::clone, |_, _| Ok(())).unwrap_err();
        assert_eq!(
            err,
            ReservationError::ConflictingMutation {
                entity: "ga".to_string()
            }
        );
    }

    #[test]
    fn test_invalid_provisional_value_changes_nothing() {
        let cache = EntityCache::new();
        cache.upsert(item("ga", 10)).unwrap();
        let id = ItemId::new("ga");

        let err = cache
            .begin_mutation(&id, |current| current.clone().with_committed(11, 0), |_, _| Ok(()))
            .unwrap_err();
        assert!(matches!(err, ReservationError::InvariantViolation { .. }));
        assert!(!cache.is_pending(&id));
        assert_eq!(cache.get(&id).unwrap().committed_sold, 0);
    }

    #[test]
    fn test_unknown_entity() {
        let cache: EntityCache<InventoryItem> = EntityCache::new();
        let err = cache
            .begin_mutation(&ItemId::new("missing"), Clone::clone, |_, _| Ok(()))
            .unwrap_err();
        assert!(matches!(err, ReservationError::UnknownEntity { .. }));
    }

    #[test]
    fn test_refused_admission_changes_nothing() {
        let cache = EntityCache::new();
        cache.upsert(item("ga", 10)).unwrap();
        let id = ItemId::new("ga");

        let err = cache
            .begin_mutation(
                &id,
                |current| current.clone().with_committed(4, 0),
                |current, provisional| {
                    assert_eq!(current.committed_sold, 0);
                    assert_eq!(provisional.committed_sold, 4);
                    Err(ReservationError::ImmutableField {
                        entity: "ga".to_string(),
                        field: "committed_sold".to_string(),
                    })
                },
            )
            .unwrap_err();
        assert!(matches!(err, ReservationError::ImmutableField { .. }));
        assert!(!cache.is_pending(&id));
        assert_eq!(cache.get(&id).unwrap().committed_sold, 0);
    }
}
