//! # Tickethold Runtime
//!
//! Runtime implementation of the client-resident reservation layer.
//!
//! ## Core Components
//!
//! - **`EntityCache`**: cached entities, including the inventory record store
//! - **`HoldLedger`**: active holds with an atomic check-then-insert
//! - **`ExpiryScheduler`**: per-hold timers plus the periodic sweep
//! - **`Reservations`**: ledger + scheduler + gateway notifications wired together
//! - **`OptimisticCoordinator`**: apply locally, confirm remotely, commit or roll back
//! - **`ReservationContext`**: owns all of the above, with a defined shutdown
//!
//! ## Example
//!
//! ```ignore
//! use tickethold_runtime::{ReservationConfig, ReservationContext};
//!
//! let ctx = ReservationContext::new(ReservationConfig::from_env(), gateway, clock)?;
//! ctx.sync_collection(&event_id, ticket_types)?;
//!
//! let hold = ctx.holds().request_hold(&item_id, 2, &holder_id)?;
//! assert_eq!(ctx.holds().available_quantity(&item_id), 13);
//!
//! ctx.shutdown();
//! ```

/// Entity cache shared by the ledger and the optimistic coordinator
pub mod cache;

/// Reservation configuration
pub mod config;

/// The context object owning every component
pub mod context;

/// Hold ledger
pub mod ledger;

/// Prometheus metrics for observability
pub mod metrics;

/// Best-effort gateway notifications
pub mod notifier;

/// Optimistic mutation coordination
pub mod optimistic;

/// Hold operations with expiry and notification side effects
pub mod reservations;

/// Expiry timers and the periodic sweep
pub mod scheduler;

/// Error types for runtime construction
pub mod error {
    use thiserror::Error;

    /// Errors raised while building or starting the reservation context
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum ContextError {
        /// A configuration value is unusable
        #[error("Invalid configuration: {0}")]
        InvalidConfig(String),

        /// Construction happened outside a Tokio runtime
        ///
        /// Timers, the sweep and gateway calls all run as Tokio tasks.
        #[error("No Tokio runtime available: {0}")]
        NoRuntime(String),
    }
}

pub use cache::{EntityCache, UpsertOutcome};
pub use config::ReservationConfig;
pub use context::ReservationContext;
pub use error::ContextError;
pub use ledger::{HoldGrant, HoldLedger, SyncReport};
pub use optimistic::{
    Edit, MutationGate, MutationState, OptimisticCoordinator, OptimisticMutation, PendingMutation,
    Ungated,
};
pub use reservations::{ReleaseReason, Reservations};
pub use scheduler::ExpiryScheduler;

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// Every critical section here is synchronous and leaves state consistent
// before any call that could panic, so a poisoned lock still guards valid data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
