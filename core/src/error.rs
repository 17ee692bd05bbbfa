//! Error taxonomy.
//!
//! Releasing an absent hold is not an error (see
//! [`ReleaseOutcome::NoOp`](crate::types::ReleaseOutcome::NoOp)), and a failed
//! best-effort gateway notification is a warning rather than an error (see
//! [`GatewayWarning`](crate::gateway::GatewayWarning)).

use crate::types::ItemId;
use thiserror::Error;

/// Result alias used throughout tickethold.
pub type Result<T> = std::result::Result<T, ReservationError>;

/// Errors surfaced by the reservation layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReservationError {
    /// The requested hold exceeds current availability. Nothing was changed.
    #[error("Not enough tickets available for {item}: requested {requested}, available {available}")]
    OutOfStock {
        /// Item requested
        item: ItemId,
        /// Units requested
        requested: u32,
        /// Units available at the time of the request
        available: u32,
    },

    /// Holds must be for at least one unit.
    #[error("Hold quantity for {item} must be greater than zero")]
    InvalidQuantity {
        /// Item requested
        item: ItemId,
    },

    /// A snapshot reported more committed units than capacity.
    #[error(
        "Inventory record {item} violates capacity: sold {sold} + reserved {reserved} > capacity {capacity}"
    )]
    InvariantViolation {
        /// Offending item
        item: ItemId,
        /// Reported sold units
        sold: u32,
        /// Reported reserved units
        reserved: u32,
        /// Reported capacity
        capacity: u32,
    },

    /// A local edit would leave committed plus held units above capacity.
    #[error(
        "Edit of {item} exceeds capacity: committed {committed} + held {held} > capacity {capacity}"
    )]
    CapacityExceeded {
        /// Edited item
        item: ItemId,
        /// Committed units after the edit
        committed: u64,
        /// Units held locally
        held: u64,
        /// Capacity of the item
        capacity: u32,
    },

    /// A local edit tried to change a field only the server may change.
    #[error("Field {field} of {entity} cannot be changed locally")]
    ImmutableField {
        /// Edited entity
        entity: String,
        /// Offending field
        field: String,
    },

    /// The remote authority rejected an optimistic mutation.
    ///
    /// The cached entity has already been restored when this is returned.
    #[error("Mutation of {entity} rejected by remote authority: {reason}")]
    MutationRejected {
        /// Entity that was being mutated
        entity: String,
        /// Why it was rejected
        reason: String,
    },

    /// Another mutation is still pending for this entity.
    #[error("Mutation of {entity} conflicts with a pending mutation")]
    ConflictingMutation {
        /// Entity with the pending mutation
        entity: String,
    },

    /// The entity is not in the cache.
    #[error("Entity {entity} is not cached")]
    UnknownEntity {
        /// Requested entity
        entity: String,
    },

    /// An entity could not be encoded for the gateway.
    #[error("Failed to encode entity: {0}")]
    Serialization(String),

    /// The context has been shut down.
    #[error("Reservation context is shutting down")]
    ShuttingDown,
}

impl ReservationError {
    /// Whether retrying later (or with less) can succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::OutOfStock { .. } | Self::ConflictingMutation { .. } | Self::MutationRejected { .. }
        )
    }
}

/// Errors reported by the remote authority collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The server refused the request
    #[error("Rejected by remote authority: {0}")]
    Rejected(String),
    /// The server could not be reached
    #[error("Remote authority unavailable: {0}")]
    Unavailable(String),
    /// The request timed out
    #[error("Remote authority timed out")]
    Timeout,
    /// Credentials were refused even after refresh
    #[error("Request was not authorized")]
    Unauthorized,
    /// The response could not be understood
    #[error("Malformed response: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_stock_message() {
        let err = ReservationError::OutOfStock {
            item: ItemId::new("ga"),
            requested: 10,
            available: 5,
        };
        assert_eq!(
            err.to_string(),
            "Not enough tickets available for ga: requested 10, available 5"
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn test_invalid_quantity_is_not_retryable() {
        let err = ReservationError::InvalidQuantity { item: ItemId::new("ga") };
        assert!(!err.is_retryable());
    }
}
