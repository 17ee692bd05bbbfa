//! Hold operations with their side effects.
//!
//! [`Reservations`] wraps the synchronous [`HoldLedger`] and drives everything
//! that happens around a ledger change:
//!
//! - placing a hold arms its expiry timer and notifies the gateway
//! - releasing a hold (explicitly, by timer, or by sweep) cancels its timer and
//!   notifies the gateway
//! - a periodic sweep releases whatever the timers missed
//!
//! Timer and sweep tasks hold only a weak reference, so dropping the last
//! `Reservations` handle tears everything down.

use crate::cache::{EntityCache, UpsertOutcome};
use crate::config::ReservationConfig;
use crate::error::ContextError;
use crate::ledger::{HoldLedger, SyncReport};
use crate::metrics;
use crate::notifier::GatewayNotifier;
use crate::optimistic::{Edit, MutationGate};
use crate::scheduler::ExpiryScheduler;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tickethold_core::availability::AvailabilityView;
use tickethold_core::environment::Clock;
use tickethold_core::error::{ReservationError, Result};
use tickethold_core::gateway::{GatewayWarning, RemoteAuthority};
use tickethold_core::types::{
    CollectionId, Hold, HoldId, HoldKey, HolderId, InventoryItem, ItemId, ReleaseOutcome,
};
use tokio::runtime::Handle;
use tokio::sync::broadcast;

/// Why a hold left the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReleaseReason {
    /// The holder released it
    Explicit,
    /// Its expiry timer fired
    Expired,
    /// The periodic sweep found it past expiry
    Swept,
    /// Its item disappeared from a collection sync
    Removed,
    /// The context shut down
    Shutdown,
}

impl ReleaseReason {
    /// Metric/log label
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Expired => "expired",
            Self::Swept => "swept",
            Self::Removed => "removed",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Inner {
    ledger: HoldLedger,
    scheduler: ExpiryScheduler,
    notifier: GatewayNotifier,
    clock: Arc<dyn Clock>,
    runtime: Handle,
    closed: AtomicBool,
}

impl Inner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn arm_expiry(self: &Arc<Self>, hold: &Hold) {
        let key = hold.key();
        let hold_id = hold.id;
        let delay = (hold.expires_at - self.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let weak: Weak<Self> = Arc::downgrade(self);

        let timer_key = key.clone();
        self.scheduler
            .arm(&self.runtime, key.clone(), hold_id, delay, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.expire(&timer_key, hold_id);
                }
            });

        // A release that ran between the ledger insert and the arm found no
        // timer to cancel.
        if !self.ledger.is_current(&key, hold_id) {
            self.scheduler.cancel(&key, Some(hold_id));
        }
    }

    fn expire(&self, key: &HoldKey, hold_id: HoldId) {
        self.scheduler.disarm(key, hold_id);
        if self.is_closed() {
            return;
        }
        if let ReleaseOutcome::Released(hold) = self.ledger.release_if_current(key, hold_id) {
            self.finish_release(&hold, ReleaseReason::Expired);
        }
    }

    fn sweep(&self) -> Vec<Hold> {
        let released = self.ledger.sweep_expired(self.clock.now());
        for hold in &released {
            self.finish_release(hold, ReleaseReason::Swept);
        }
        if !released.is_empty() {
            tracing::info!(released = released.len(), "Sweep released expired holds");
        }
        released
    }

    fn finish_release(&self, hold: &Hold, reason: ReleaseReason) {
        self.scheduler.cancel(&hold.key(), Some(hold.id));
        tracing::debug!(
            item = %hold.item_id,
            holder = %hold.holder_id,
            quantity = hold.quantity,
            hold_id = %hold.id,
            reason = %reason,
            "Hold released"
        );
        metrics::record_release(reason.as_str(), 1);
        match reason {
            ReleaseReason::Explicit | ReleaseReason::Expired | ReleaseReason::Swept => {
                self.notifier.release(hold);
            },
            // The server no longer offers the item, or is going away with us
            ReleaseReason::Removed | ReleaseReason::Shutdown => {},
        }
    }
}

/// Hold ledger with expiry timers, periodic sweep and gateway notifications.
///
/// Cheap to clone; clones share one ledger.
#[derive(Clone)]
pub struct Reservations {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Reservations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservations")
            .field("ledger", &self.inner.ledger)
            .field("armed_timers", &self.inner.scheduler.armed_count())
            .field("closed", &self.inner.is_closed())
            .finish_non_exhaustive()
    }
}

/// Ticket type edits are admitted under the hold book, against active holds.
///
/// Edits always land in the ledger's own record store; the coordinator must be
/// built over [`HoldLedger::records`].
impl MutationGate<InventoryItem> for Reservations {
    fn begin(
        &self,
        _cache: &EntityCache<InventoryItem>,
        id: &ItemId,
        edit: Edit<'_, InventoryItem>,
    ) -> Result<(InventoryItem, InventoryItem)> {
        if self.inner.is_closed() {
            return Err(ReservationError::ShuttingDown);
        }
        self.inner.ledger.begin_item_edit(id, edit)
    }
}

impl Reservations {
    /// Creates the hold layer over `records` and starts the sweep.
    ///
    /// # Errors
    ///
    /// - [`ContextError::InvalidConfig`] if `config` does not validate
    /// - [`ContextError::NoRuntime`] if called outside a Tokio runtime
    pub fn new(
        records: Arc<EntityCache<InventoryItem>>,
        gateway: Arc<dyn RemoteAuthority>,
        clock: Arc<dyn Clock>,
        config: &ReservationConfig,
    ) -> std::result::Result<Self, ContextError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| ContextError::NoRuntime(e.to_string()))?;

        let inner = Arc::new(Inner {
            ledger: HoldLedger::new(records, Arc::clone(&clock), config.hold_ttl),
            scheduler: ExpiryScheduler::new(),
            notifier: GatewayNotifier::new(
                gateway,
                Arc::clone(&clock),
                runtime.clone(),
                config.warning_capacity,
            ),
            clock,
            runtime,
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        inner
            .scheduler
            .start_sweep(&inner.runtime, config.sweep_interval, move || {
                match weak.upgrade() {
                    Some(inner) if !inner.is_closed() => {
                        inner.sweep();
                        true
                    },
                    _ => false,
                }
            });

        tracing::info!(
            hold_ttl_secs = config.hold_ttl.as_secs(),
            sweep_interval_secs = config.sweep_interval.as_secs(),
            "Reservations started"
        );
        Ok(Self { inner })
    }

    // ========== Commands ==========

    /// Places (or replaces) the holder's hold on `item_id`.
    ///
    /// On success the expiry timer is armed and the gateway is notified in the
    /// background; the caller does not wait for the notification. Replacing a
    /// hold tells the gateway about the release of the old hold before the new
    /// one, in that order.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::ShuttingDown`] after [`shutdown`](Self::shutdown)
    /// - [`ReservationError::InvalidQuantity`] if `quantity` is zero
    /// - [`ReservationError::OutOfStock`] if `quantity` exceeds availability;
    ///   nothing changes, including any existing hold
    pub fn request_hold(
        &self,
        item_id: &ItemId,
        quantity: u32,
        holder_id: &HolderId,
    ) -> Result<Hold> {
        if self.inner.is_closed() {
            metrics::record_hold_outcome("rejected");
            return Err(ReservationError::ShuttingDown);
        }

        let grant = self.inner.ledger.request_hold(item_id, quantity, holder_id)?;
        self.inner.arm_expiry(&grant.hold);
        match &grant.replaced {
            Some(previous) => self.inner.notifier.replace(previous, &grant.hold),
            None => self.inner.notifier.hold(&grant.hold),
        }
        Ok(grant.hold)
    }

    /// Releases the holder's hold on `item_id`.
    ///
    /// Idempotent: releasing an absent hold returns [`ReleaseOutcome::NoOp`]
    /// and has no side effects.
    pub fn release(&self, item_id: &ItemId, holder_id: &HolderId) -> ReleaseOutcome {
        let outcome = self.inner.ledger.release(item_id, holder_id);
        if let ReleaseOutcome::Released(hold) = &outcome {
            self.inner.finish_release(hold, ReleaseReason::Explicit);
        }
        outcome
    }

    /// Runs the expiry sweep now instead of waiting for the next tick.
    ///
    /// Returns the holds it released.
    pub fn sweep_now(&self) -> Vec<Hold> {
        if self.inner.is_closed() {
            return Vec::new();
        }
        self.inner.sweep()
    }

    /// Replaces one inventory record with a fresher server snapshot.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::ShuttingDown`] after shutdown
    /// - [`ReservationError::InvariantViolation`] for an invalid snapshot
    pub fn sync_item(&self, item: InventoryItem) -> Result<UpsertOutcome> {
        if self.inner.is_closed() {
            return Err(ReservationError::ShuttingDown);
        }
        self.inner.ledger.sync_item(item)
    }

    /// Replaces the inventory records of a collection.
    ///
    /// Holds on items that disappeared are dropped and their timers cancelled.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::ShuttingDown`] after shutdown
    /// - [`ReservationError::InvariantViolation`] if any snapshot is invalid;
    ///   nothing is changed
    pub fn sync_collection(
        &self,
        collection_id: &CollectionId,
        items: Vec<InventoryItem>,
    ) -> Result<SyncReport> {
        if self.inner.is_closed() {
            return Err(ReservationError::ShuttingDown);
        }
        let report = self.inner.ledger.sync_collection(collection_id, items)?;
        for hold in &report.dropped_holds {
            self.inner.finish_release(hold, ReleaseReason::Removed);
        }
        Ok(report)
    }

    /// Stops the sweep, cancels every timer and drops every hold.
    ///
    /// Further hold requests fail with [`ReservationError::ShuttingDown`].
    /// Returns the number of holds dropped; calling it again returns zero.
    pub fn shutdown(&self) -> usize {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let cancelled = self.inner.scheduler.shutdown();
        let dropped = self.inner.ledger.drain();
        metrics::record_release(ReleaseReason::Shutdown.as_str(), dropped.len());
        tracing::info!(
            cancelled_timers = cancelled,
            dropped_holds = dropped.len(),
            "Reservations shut down"
        );
        dropped.len()
    }

    // ========== Queries ==========

    /// Units still available for `item_id`; zero for unknown items.
    #[must_use]
    pub fn available_quantity(&self, item_id: &ItemId) -> u32 {
        self.inner.ledger.available_quantity(item_id)
    }

    /// Full availability breakdown for `item_id`.
    #[must_use]
    pub fn availability(&self, item_id: &ItemId) -> Option<AvailabilityView> {
        self.inner.ledger.availability(item_id)
    }

    /// Total available units across a collection.
    #[must_use]
    pub fn available_in_collection(&self, collection_id: &CollectionId) -> u64 {
        self.inner.ledger.available_in_collection(collection_id)
    }

    /// Active holds on `item_id`, oldest first.
    #[must_use]
    pub fn holds_for(&self, item_id: &ItemId) -> Vec<Hold> {
        self.inner.ledger.holds_for(item_id)
    }

    /// The holder's active hold on `item_id`, if any.
    #[must_use]
    pub fn hold(&self, item_id: &ItemId, holder_id: &HolderId) -> Option<Hold> {
        self.inner
            .ledger
            .hold(&HoldKey::new(item_id.clone(), holder_id.clone()))
    }

    /// Number of active holds
    #[must_use]
    pub fn active_hold_count(&self) -> usize {
        self.inner.ledger.active_hold_count()
    }

    /// Number of armed expiry timers
    #[must_use]
    pub fn armed_timer_count(&self) -> usize {
        self.inner.scheduler.armed_count()
    }

    /// Every active hold, ordered by key.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Hold> {
        self.inner.ledger.snapshot()
    }

    /// The underlying ledger
    #[must_use]
    pub fn ledger(&self) -> &HoldLedger {
        &self.inner.ledger
    }

    /// Subscribes to failed gateway notifications.
    #[must_use]
    pub fn warnings(&self) -> broadcast::Receiver<GatewayWarning> {
        self.inner.notifier.subscribe()
    }

    /// Whether [`shutdown`](Self::shutdown) has run
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.is_closed()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tickethold_testing::mocks::{ScriptedAuthority, test_clock};

    fn setup(config: &ReservationConfig) -> (Reservations, Arc<ScriptedAuthority>) {
        let records = Arc::new(EntityCache::new());
        records
            .upsert(
                InventoryItem::new(ItemId::new("ga"), CollectionId::new("fest"), "GA", 10)
                    .with_committed(2, 0),
            )
            .unwrap();
        let gateway = Arc::new(ScriptedAuthority::new());
        let reservations = Reservations::new(
            records,
            Arc::clone(&gateway) as Arc<dyn RemoteAuthority>,
            Arc::new(test_clock()),
            config,
        )
        .unwrap();
        (reservations, gateway)
    }

    #[test]
    fn test_new_requires_runtime() {
        let err = Reservations::new(
            Arc::new(EntityCache::new()),
            Arc::new(ScriptedAuthority::new()),
            Arc::new(test_clock()),
            &ReservationConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ContextError::NoRuntime(_)));
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let config = ReservationConfig::builder().hold_ttl(Duration::ZERO).build();
        let err = Reservations::new(
            Arc::new(EntityCache::new()),
            Arc::new(ScriptedAuthority::new()),
            Arc::new(test_clock()),
            &config,
        )
        .unwrap_err();
        assert!(matches!(err, ContextError::InvalidConfig(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_arms_timer_and_release_cancels_it() {
        let (reservations, _gateway) = setup(&ReservationConfig::default());
        let ga = ItemId::new("ga");
        let alice = HolderId::new("alice");

        reservations.request_hold(&ga, 3, &alice).unwrap();
        assert_eq!(reservations.armed_timer_count(), 1);
        assert_eq!(reservations.available_quantity(&ga), 5);

        assert!(reservations.release(&ga, &alice).is_released());
        assert_eq!(reservations.armed_timer_count(), 0);
        assert_eq!(reservations.release(&ga, &alice), ReleaseOutcome::NoOp);
        assert_eq!(reservations.available_quantity(&ga), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacement_keeps_a_single_timer() {
        let (reservations, _gateway) = setup(&ReservationConfig::default());
        let ga = ItemId::new("ga");
        let alice = HolderId::new("alice");

        let first = reservations.request_hold(&ga, 3, &alice).unwrap();
        let second = reservations.request_hold(&ga, 5, &alice).unwrap();
        assert!(second.id > first.id);
        assert_eq!(reservations.armed_timer_count(), 1);
        assert_eq!(reservations.holds_for(&ga), vec![second]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_new_holds() {
        let (reservations, _gateway) = setup(&ReservationConfig::default());
        let ga = ItemId::new("ga");
        reservations
            .request_hold(&ga, 1, &HolderId::new("alice"))
            .unwrap();

        assert_eq!(reservations.shutdown(), 1);
        assert_eq!(reservations.shutdown(), 0);
        assert!(reservations.is_shut_down());
        assert_eq!(reservations.armed_timer_count(), 0);
        assert_eq!(reservations.active_hold_count(), 0);

        let err = reservations
            .request_hold(&ga, 1, &HolderId::new("bob"))
            .unwrap_err();
        assert_eq!(err, ReservationError::ShuttingDown);
    }

    #[test]
    fn test_release_reason_labels() {
        assert_eq!(ReleaseReason::Expired.as_str(), "expired");
        assert_eq!(ReleaseReason::Swept.to_string(), "swept");
    }
}
