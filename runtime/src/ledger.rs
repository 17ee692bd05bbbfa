//! Hold ledger.
//!
//! Tracks active holds and admits new ones against the inventory record store.
//!
//! **Concurrency strategy**: every hold operation runs inside one acquisition
//! of the hold book's mutex. The availability check and the insert are never
//! separately lockable steps, so two callers racing for the last units cannot
//! both be admitted. Lock order is hold book, then record cache.
//!
//! **Replace policy**: a holder has at most one hold per item. A new request
//! from the same holder is admitted against availability that excludes the
//! holder's current hold, and supersedes it.

use crate::cache::{EntityCache, UpsertOutcome};
use crate::lock;
use crate::metrics;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tickethold_core::availability::AvailabilityView;
use tickethold_core::environment::Clock;
use tickethold_core::error::{ReservationError, Result};
use tickethold_core::types::{
    CollectionId, Hold, HoldId, HoldKey, HolderId, InventoryItem, ItemId, ReleaseOutcome,
};

/// A hold admitted by [`HoldLedger::request_hold`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldGrant {
    /// The new hold
    pub hold: Hold,
    /// The same holder's previous hold on the item, now superseded
    pub replaced: Option<Hold>,
}

/// What a collection sync changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Items whose records were replaced or created
    pub stored: Vec<ItemId>,
    /// Items left alone because an optimistic mutation owns them
    pub skipped: Vec<ItemId>,
    /// Items no longer offered by the collection
    pub removed: Vec<ItemId>,
    /// Holds dropped together with removed items
    pub dropped_holds: Vec<Hold>,
}

#[derive(Debug, Default)]
struct HoldBook {
    by_item: HashMap<ItemId, HashMap<HolderId, Hold>>,
    next_id: u64,
}

impl HoldBook {
    fn next_hold_id(&mut self) -> HoldId {
        self.next_id += 1;
        HoldId::new(self.next_id)
    }

    fn holds(&self, item_id: &ItemId) -> impl Iterator<Item = &Hold> {
        self.by_item.get(item_id).into_iter().flat_map(HashMap::values)
    }

    fn get(&self, key: &HoldKey) -> Option<&Hold> {
        self.by_item.get(&key.item_id)?.get(&key.holder_id)
    }

    fn insert(&mut self, hold: Hold) -> Option<Hold> {
        self.by_item
            .entry(hold.item_id.clone())
            .or_default()
            .insert(hold.holder_id.clone(), hold)
    }

    fn remove(&mut self, item_id: &ItemId, holder_id: &HolderId) -> Option<Hold> {
        let holders = self.by_item.get_mut(item_id)?;
        let removed = holders.remove(holder_id);
        if holders.is_empty() {
            self.by_item.remove(item_id);
        }
        removed
    }

    fn remove_item(&mut self, item_id: &ItemId) -> Vec<Hold> {
        self.by_item
            .remove(item_id)
            .map(|holders| holders.into_values().collect())
            .unwrap_or_default()
    }

    fn len(&self) -> usize {
        self.by_item.values().map(HashMap::len).sum()
    }
}

fn admit_item_edit(current: &InventoryItem, provisional: &InventoryItem, book: &HoldBook) -> Result<()> {
    let immutable = if provisional.capacity != current.capacity {
        Some("capacity")
    } else if provisional.collection_id != current.collection_id {
        Some("collection_id")
    } else {
        None
    };
    if let Some(field) = immutable {
        return Err(ReservationError::ImmutableField {
            entity: current.id.to_string(),
            field: field.to_string(),
        });
    }

    let view = AvailabilityView::compute(provisional, book.holds(&current.id));
    if view.within_capacity() {
        Ok(())
    } else {
        Err(ReservationError::CapacityExceeded {
            item: current.id.clone(),
            committed: view.committed,
            held: view.held,
            capacity: view.capacity,
        })
    }
}

/// Ledger of active holds over the inventory record store.
///
/// The ledger is purely synchronous. Timers and gateway notifications are
/// driven by [`Reservations`](crate::reservations::Reservations) from the
/// values returned here.
pub struct HoldLedger {
    records: Arc<EntityCache<InventoryItem>>,
    book: Mutex<HoldBook>,
    clock: Arc<dyn Clock>,
    hold_ttl: chrono::Duration,
}

impl std::fmt::Debug for HoldLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HoldLedger")
            .field("records", &self.records.len())
            .field("active_holds", &self.active_hold_count())
            .field("hold_ttl", &self.hold_ttl)
            .finish_non_exhaustive()
    }
}

impl HoldLedger {
    /// Creates a ledger over `records`.
    ///
    /// A TTL too large for `chrono` saturates to its maximum duration.
    #[must_use]
    pub fn new(
        records: Arc<EntityCache<InventoryItem>>,
        clock: Arc<dyn Clock>,
        hold_ttl: std::time::Duration,
    ) -> Self {
        Self {
            records,
            book: Mutex::new(HoldBook::default()),
            clock,
            hold_ttl: chrono::Duration::from_std(hold_ttl).unwrap_or(chrono::Duration::MAX),
        }
    }

    /// The inventory record store this ledger admits holds against
    #[must_use]
    pub const fn records(&self) -> &Arc<EntityCache<InventoryItem>> {
        &self.records
    }

    // ========== Commands ==========

    /// Places a hold of `quantity` units of `item_id` for `holder_id`.
    ///
    /// The hold expires `hold_ttl` after now. Unknown items have no
    /// availability.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::InvalidQuantity`] if `quantity` is zero
    /// - [`ReservationError::OutOfStock`] if `quantity` exceeds availability;
    ///   the ledger is unchanged
    pub fn request_hold(
        &self,
        item_id: &ItemId,
        quantity: u32,
        holder_id: &HolderId,
    ) -> Result<HoldGrant> {
        if quantity == 0 {
            return Err(ReservationError::InvalidQuantity {
                item: item_id.clone(),
            });
        }

        let now = self.clock.now();
        let mut book = lock(&self.book);

        let available = self.records.get(item_id).map_or(0, |item| {
            AvailabilityView::compute(
                &item,
                book.holds(item_id).filter(|hold| hold.holder_id != *holder_id),
            )
            .available
        });

        if quantity > available {
            tracing::debug!(
                item = %item_id,
                holder = %holder_id,
                requested = quantity,
                available,
                "Hold rejected: out of stock"
            );
            metrics::record_hold_outcome("out_of_stock");
            return Err(ReservationError::OutOfStock {
                item: item_id.clone(),
                requested: quantity,
                available,
            });
        }

        let hold = Hold {
            id: book.next_hold_id(),
            item_id: item_id.clone(),
            holder_id: holder_id.clone(),
            quantity,
            placed_at: now,
            expires_at: now
                .checked_add_signed(self.hold_ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        let replaced = book.insert(hold.clone());
        metrics::set_active_holds(book.len());
        drop(book);

        tracing::debug!(
            item = %item_id,
            holder = %holder_id,
            quantity,
            hold_id = %hold.id,
            expires_at = %hold.expires_at,
            replaced = replaced.is_some(),
            "Hold placed"
        );
        metrics::record_hold_outcome(if replaced.is_some() { "replaced" } else { "placed" });

        Ok(HoldGrant { hold, replaced })
    }

    /// Releases the holder's hold on the item. Releasing nothing is a no-op.
    pub fn release(&self, item_id: &ItemId, holder_id: &HolderId) -> ReleaseOutcome {
        let mut book = lock(&self.book);
        let removed = book.remove(item_id, holder_id);
        metrics::set_active_holds(book.len());
        removed.map_or(ReleaseOutcome::NoOp, ReleaseOutcome::Released)
    }

    /// Releases the hold at `key` only if it is still the hold `hold_id`.
    ///
    /// Used by expiry timers, so a timer armed for a superseded hold cannot
    /// release its replacement.
    pub fn release_if_current(&self, key: &HoldKey, hold_id: HoldId) -> ReleaseOutcome {
        let mut book = lock(&self.book);
        if book.get(key).is_none_or(|hold| hold.id != hold_id) {
            return ReleaseOutcome::NoOp;
        }
        let removed = book.remove(&key.item_id, &key.holder_id);
        metrics::set_active_holds(book.len());
        removed.map_or(ReleaseOutcome::NoOp, ReleaseOutcome::Released)
    }

    /// Releases every hold with `expires_at <= now`.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<Hold> {
        let mut book = lock(&self.book);
        let expired: Vec<HoldKey> = book
            .by_item
            .values()
            .flat_map(HashMap::values)
            .filter(|hold| hold.is_expired(now))
            .map(Hold::key)
            .collect();

        let released: Vec<Hold> = expired
            .iter()
            .filter_map(|key| book.remove(&key.item_id, &key.holder_id))
            .collect();
        metrics::set_active_holds(book.len());
        released
    }

    /// Removes every hold. Used when the owning context shuts down.
    pub fn drain(&self) -> Vec<Hold> {
        let mut book = lock(&self.book);
        let holds = std::mem::take(&mut book.by_item)
            .into_values()
            .flat_map(HashMap::into_values)
            .collect();
        metrics::set_active_holds(0);
        holds
    }

    /// Starts an optimistic edit of an inventory record.
    ///
    /// Runs under the hold book, so no hold can be admitted between the check
    /// and the edit. Capacity and collection belong to the server; an edit
    /// may change the committed counters only while active holds still fit.
    ///
    /// Returns `(previous, provisional)` with the entry marked pending.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::ImmutableField`] if the edit changes `capacity`
    ///   or `collection_id`
    /// - [`ReservationError::CapacityExceeded`] if committed plus held units
    ///   would exceed capacity
    /// - any error of [`EntityCache::begin_mutation`]
    pub fn begin_item_edit(
        &self,
        item_id: &ItemId,
        edit: impl FnOnce(&InventoryItem) -> InventoryItem,
    ) -> Result<(InventoryItem, InventoryItem)> {
        let book = lock(&self.book);
        self.records
            .begin_mutation(item_id, edit, |current, provisional| {
                admit_item_edit(current, provisional, &book)
            })
            .inspect_err(|err| {
                tracing::debug!(item = %item_id, error = %err, "Ticket type edit refused");
            })
    }

    // ========== Record sync ==========

    /// Replaces one inventory record with a fresher server snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ReservationError::InvariantViolation`] if the snapshot's
    /// committed counters exceed its capacity.
    pub fn sync_item(&self, item: InventoryItem) -> Result<UpsertOutcome> {
        let _book = lock(&self.book);
        self.records.upsert(item)
    }

    /// Replaces the full set of inventory records for a collection.
    ///
    /// Records missing from `items` are removed together with their holds.
    /// Records with a pending optimistic mutation are neither replaced nor
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns [`ReservationError::InvariantViolation`] if any snapshot is
    /// invalid or belongs to another collection. Nothing is changed in that
    /// case.
    pub fn sync_collection(
        &self,
        collection_id: &CollectionId,
        items: Vec<InventoryItem>,
    ) -> Result<SyncReport> {
        for item in &items {
            item.check_capacity()?;
            if item.collection_id != *collection_id {
                return Err(ReservationError::InvariantViolation {
                    item: item.id.clone(),
                    sold: item.committed_sold,
                    reserved: item.committed_reserved,
                    capacity: item.capacity,
                });
            }
        }

        let mut book = lock(&self.book);
        let mut report = SyncReport::default();

        let incoming: HashSet<ItemId> = items.iter().map(|item| item.id.clone()).collect();
        let stale: Vec<ItemId> = self
            .records
            .select(|item| item.collection_id == *collection_id && !incoming.contains(&item.id))
            .into_iter()
            .map(|item| item.id)
            .collect();

        for item_id in stale {
            if self.records.remove(&item_id).is_some() {
                report.dropped_holds.extend(book.remove_item(&item_id));
                report.removed.push(item_id);
            } else {
                report.skipped.push(item_id);
            }
        }

        for item in items {
            let item_id = item.id.clone();
            match self.records.upsert(item)? {
                UpsertOutcome::Stored => report.stored.push(item_id),
                UpsertOutcome::SkippedPending => report.skipped.push(item_id),
            }
        }
        metrics::set_active_holds(book.len());
        drop(book);

        tracing::info!(
            collection = %collection_id,
            stored = report.stored.len(),
            skipped = report.skipped.len(),
            removed = report.removed.len(),
            dropped_holds = report.dropped_holds.len(),
            "Inventory collection synced"
        );
        Ok(report)
    }

    // ========== Queries ==========

    /// Units still available for `item_id`; zero for unknown items.
    #[must_use]
    pub fn available_quantity(&self, item_id: &ItemId) -> u32 {
        self.availability(item_id).map_or(0, |view| view.available)
    }

    /// Full availability breakdown for `item_id`.
    #[must_use]
    pub fn availability(&self, item_id: &ItemId) -> Option<AvailabilityView> {
        let book = lock(&self.book);
        let item = self.records.get(item_id)?;
        Some(AvailabilityView::compute(&item, book.holds(item_id)))
    }

    /// Total available units across a collection's items.
    #[must_use]
    pub fn available_in_collection(&self, collection_id: &CollectionId) -> u64 {
        let book = lock(&self.book);
        self.records
            .select(|item| item.collection_id == *collection_id)
            .iter()
            .map(|item| u64::from(AvailabilityView::compute(item, book.holds(&item.id)).available))
            .sum()
    }

    /// Active holds on `item_id`, oldest first.
    #[must_use]
    pub fn holds_for(&self, item_id: &ItemId) -> Vec<Hold> {
        let book = lock(&self.book);
        let mut holds: Vec<Hold> = book.holds(item_id).cloned().collect();
        holds.sort_by_key(|hold| hold.id);
        holds
    }

    /// The active hold at `key`, if any.
    #[must_use]
    pub fn hold(&self, key: &HoldKey) -> Option<Hold> {
        lock(&self.book).get(key).cloned()
    }

    /// Whether `hold_id` is still the active hold at `key`.
    #[must_use]
    pub fn is_current(&self, key: &HoldKey, hold_id: HoldId) -> bool {
        lock(&self.book).get(key).is_some_and(|hold| hold.id == hold_id)
    }

    /// Number of active holds across all items
    #[must_use]
    pub fn active_hold_count(&self) -> usize {
        lock(&self.book).len()
    }

    /// Every active hold, ordered by key.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Hold> {
        let book = lock(&self.book);
        let mut holds: Vec<Hold> = book
            .by_item
            .values()
            .flat_map(HashMap::values)
            .cloned()
            .collect();
        holds.sort_by_key(Hold::key);
        holds
    }
}
