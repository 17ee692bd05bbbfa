//! # Tickethold Core
//!
//! Core types and traits for client-resident ticket inventory coordination.
//!
//! This crate holds everything that is pure: the data model, the availability
//! arithmetic, the error taxonomy, and the traits through which the runtime
//! reaches its environment (time and the remote inventory authority).
//!
//! ## Core Concepts
//!
//! - **Inventory item**: canonical counters as last synced from the server
//! - **Hold**: a time-boxed, non-durable reservation against an item
//! - **Availability**: `capacity - sold - reserved - held`, clamped at zero
//! - **Entity**: any cached value that can be mutated optimistically
//! - **Remote authority**: the server, consumed through [`gateway::RemoteAuthority`]
//!
//! ## Example
//!
//! ```
//! use tickethold_core::availability::AvailabilityView;
//! use tickethold_core::types::{CollectionId, InventoryItem, ItemId};
//!
//! let item = InventoryItem::new(
//!     ItemId::new("ga"),
//!     CollectionId::new("summer-fest"),
//!     "General Admission",
//!     100,
//! )
//! .with_committed(80, 5);
//!
//! let view = AvailabilityView::compute(&item, std::iter::empty());
//! assert_eq!(view.available, 15);
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod availability;
pub mod entity;
pub mod error;
pub mod gateway;
pub mod types;

pub use error::{GatewayError, ReservationError, Result};

/// Environment module - time abstraction
///
/// Hold expiry is computed against an injected [`Clock`](environment::Clock)
/// so tests can drive time explicitly.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use tickethold_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::environment::{Clock, SystemClock};

    #[test]
    fn system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
