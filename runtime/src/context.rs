//! The reservation context.
//!
//! One explicitly constructed object owns the inventory record store, the hold
//! layer and the optimistic coordinators. Callers receive it by reference or
//! `Arc`; there is no global instance. [`ReservationContext::shutdown`] (or
//! dropping the context) stops the sweep and cancels every pending timer.

use crate::cache::{EntityCache, UpsertOutcome};
use crate::config::ReservationConfig;
use crate::error::ContextError;
use crate::ledger::SyncReport;
use crate::optimistic::{OptimisticCoordinator, PendingMutation};
use crate::reservations::Reservations;
use std::sync::Arc;
use tickethold_core::environment::{Clock, SystemClock};
use tickethold_core::error::Result;
use tickethold_core::gateway::{GatewayWarning, RemoteAuthority};
use tickethold_core::types::{CollectionId, EventId, EventRecord, InventoryItem};
use tokio::runtime::Handle;
use tokio::sync::broadcast;

/// Owns every reservation component for one client session.
#[derive(Debug)]
pub struct ReservationContext {
    config: ReservationConfig,
    holds: Reservations,
    ticket_types: OptimisticCoordinator<InventoryItem>,
    events: OptimisticCoordinator<EventRecord>,
}

impl ReservationContext {
    /// Builds the context and starts the expiry sweep.
    ///
    /// Must be called from within a Tokio runtime; timers, the sweep and all
    /// gateway calls are spawned onto it.
    ///
    /// # Errors
    ///
    /// - [`ContextError::InvalidConfig`] if `config` does not validate
    /// - [`ContextError::NoRuntime`] outside a Tokio runtime
    pub fn new(
        config: ReservationConfig,
        gateway: Arc<dyn RemoteAuthority>,
        clock: Arc<dyn Clock>,
    ) -> std::result::Result<Self, ContextError> {
        let records = Arc::new(EntityCache::new());
        let holds = Reservations::new(Arc::clone(&records), Arc::clone(&gateway), clock, &config)?;
        let runtime = Handle::try_current().map_err(|e| ContextError::NoRuntime(e.to_string()))?;

        Ok(Self {
            ticket_types: OptimisticCoordinator::with_gate(
                records,
                Arc::new(holds.clone()),
                Arc::clone(&gateway),
                runtime.clone(),
            ),
            events: OptimisticCoordinator::new(Arc::new(EntityCache::new()), gateway, runtime),
            holds,
            config,
        })
    }

    /// Builds the context on wall-clock time.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn with_system_clock(
        config: ReservationConfig,
        gateway: Arc<dyn RemoteAuthority>,
    ) -> std::result::Result<Self, ContextError> {
        Self::new(config, gateway, Arc::new(SystemClock))
    }

    /// The configuration the context was built with
    #[must_use]
    pub const fn config(&self) -> &ReservationConfig {
        &self.config
    }

    /// Holds, availability and inventory sync
    #[must_use]
    pub const fn holds(&self) -> &Reservations {
        &self.holds
    }

    /// Optimistic edits of ticket types.
    ///
    /// Shares its cache with the ledger, which admits each edit against the
    /// active holds. Capacity cannot be edited locally.
    #[must_use]
    pub const fn ticket_types(&self) -> &OptimisticCoordinator<InventoryItem> {
        &self.ticket_types
    }

    /// Optimistic edits of dashboard events
    #[must_use]
    pub const fn events(&self) -> &OptimisticCoordinator<EventRecord> {
        &self.events
    }

    /// Subscribes to failed hold/release notifications.
    #[must_use]
    pub fn warnings(&self) -> broadcast::Receiver<GatewayWarning> {
        self.holds.warnings()
    }

    // ========== Sync ==========

    /// Replaces the ticket types of a collection with a server snapshot.
    ///
    /// # Errors
    ///
    /// See [`Reservations::sync_collection`].
    pub fn sync_collection(
        &self,
        collection_id: &CollectionId,
        items: Vec<InventoryItem>,
    ) -> Result<SyncReport> {
        self.holds.sync_collection(collection_id, items)
    }

    /// Stores fetched events; events with a pending edit are skipped.
    ///
    /// # Errors
    ///
    /// Returns error if an event fails validation. Events before it are kept.
    pub fn sync_events(&self, events: Vec<EventRecord>) -> Result<Vec<UpsertOutcome>> {
        events
            .into_iter()
            .map(|event| self.events.upsert(event))
            .collect()
    }

    // ========== Event edits ==========

    /// Optimistically renames an event.
    ///
    /// # Errors
    ///
    /// See [`OptimisticCoordinator::apply_optimistic`].
    pub fn rename_event(
        &self,
        id: &EventId,
        title: impl Into<String>,
    ) -> Result<PendingMutation<EventRecord>> {
        self.events.rename_event(id, title)
    }

    /// Optimistically publishes an event.
    ///
    /// # Errors
    ///
    /// See [`OptimisticCoordinator::apply_optimistic`].
    pub fn publish_event(&self, id: &EventId) -> Result<PendingMutation<EventRecord>> {
        self.events.publish_event(id)
    }

    /// Optimistically returns an event to draft.
    ///
    /// # Errors
    ///
    /// See [`OptimisticCoordinator::apply_optimistic`].
    pub fn unpublish_event(&self, id: &EventId) -> Result<PendingMutation<EventRecord>> {
        self.events.unpublish_event(id)
    }

    // ========== Lifecycle ==========

    /// Stops the sweep, cancels every timer, drops every hold and refuses new
    /// mutations. In-flight mutations still settle.
    ///
    /// Returns the number of holds dropped. Idempotent.
    pub fn shutdown(&self) -> usize {
        if self.holds.is_shut_down() {
            return 0;
        }
        self.ticket_types.close();
        self.events.close();
        let dropped = self.holds.shutdown();
        tracing::info!(dropped_holds = dropped, "Reservation context shut down");
        dropped
    }
}

impl Drop for ReservationContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
