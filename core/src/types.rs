//! Domain types for inventory holds and cached dashboard entities.

use crate::entity::Entity;
use crate::error::ReservationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[doc = concat!("Creates a new `", stringify!($name), "`")]
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Returns the identifier as a string slice
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }
    };
}

string_id! {
    /// Identifies an inventory item (a ticket type).
    ItemId
}

string_id! {
    /// Identifies the collection an item belongs to (the event selling it).
    CollectionId
}

string_id! {
    /// Identifies whoever places a hold (a user or checkout session).
    HolderId
}

string_id! {
    /// Identifies a dashboard event.
    EventId
}

// ============================================================================
// Inventory
// ============================================================================

/// Canonical inventory counters for one ticket type.
///
/// Values are authoritative as last received from the remote side and are
/// replaced wholesale on every sync. `capacity` never changes in this layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    /// Item identifier
    pub id: ItemId,
    /// Parent collection (event) identifier
    pub collection_id: CollectionId,
    /// Display name of the ticket type
    pub name: String,
    /// Total sellable units
    pub capacity: u32,
    /// Units sold and confirmed by the server
    pub committed_sold: u32,
    /// Units reserved on the server (pending payment elsewhere)
    pub committed_reserved: u32,
}

impl InventoryItem {
    /// Creates an item with no committed units.
    #[must_use]
    pub fn new(
        id: ItemId,
        collection_id: CollectionId,
        name: impl Into<String>,
        capacity: u32,
    ) -> Self {
        Self {
            id,
            collection_id,
            name: name.into(),
            capacity,
            committed_sold: 0,
            committed_reserved: 0,
        }
    }

    /// Sets the committed counters.
    #[must_use]
    pub const fn with_committed(mut self, sold: u32, reserved: u32) -> Self {
        self.committed_sold = sold;
        self.committed_reserved = reserved;
        self
    }

    /// Units committed on the server (sold + reserved).
    #[must_use]
    pub const fn committed(&self) -> u64 {
        self.committed_sold as u64 + self.committed_reserved as u64
    }

    /// Checks `committed_sold + committed_reserved <= capacity`.
    ///
    /// # Errors
    ///
    /// Returns [`ReservationError::InvariantViolation`] if the committed
    /// counters exceed capacity.
    pub fn check_capacity(&self) -> Result<(), ReservationError> {
        if self.committed() > u64::from(self.capacity) {
            return Err(ReservationError::InvariantViolation {
                item: self.id.clone(),
                sold: self.committed_sold,
                reserved: self.committed_reserved,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}

impl Entity for InventoryItem {
    type Id = ItemId;

    const KIND: &'static str = "ticket_type";

    fn id(&self) -> &ItemId {
        &self.id
    }

    fn validate(&self) -> Result<(), ReservationError> {
        self.check_capacity()
    }
}

// ============================================================================
// Holds
// ============================================================================

/// Sequence number distinguishing successive holds for the same pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HoldId(u64);

impl HoldId {
    /// Creates a `HoldId` from its raw sequence number
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw sequence number
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HoldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hold-{}", self.0)
    }
}

/// Identity of a hold: at most one active hold exists per key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HoldKey {
    /// Item being held
    pub item_id: ItemId,
    /// Who holds it
    pub holder_id: HolderId,
}

impl HoldKey {
    /// Creates a new `HoldKey`
    #[must_use]
    pub const fn new(item_id: ItemId, holder_id: HolderId) -> Self {
        Self { item_id, holder_id }
    }
}

impl fmt::Display for HoldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.item_id, self.holder_id)
    }
}

/// A time-boxed, advisory reservation of units against an item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    /// Ledger sequence number
    pub id: HoldId,
    /// Item being held
    pub item_id: ItemId,
    /// Who holds it
    pub holder_id: HolderId,
    /// Units held (always > 0)
    pub quantity: u32,
    /// When the hold was placed
    pub placed_at: DateTime<Utc>,
    /// When the hold lapses
    pub expires_at: DateTime<Utc>,
}

impl Hold {
    /// Returns the `(item, holder)` key of this hold
    #[must_use]
    pub fn key(&self) -> HoldKey {
        HoldKey::new(self.item_id.clone(), self.holder_id.clone())
    }

    /// A hold is expired once `expires_at <= now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Result of releasing a hold.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The hold existed and is gone now
    Released(Hold),
    /// There was nothing to release
    NoOp,
}

impl ReleaseOutcome {
    /// Returns true if a hold was actually released
    #[must_use]
    pub const fn is_released(&self) -> bool {
        matches!(self, Self::Released(_))
    }
}

// ============================================================================
// Events
// ============================================================================

/// Publication status of a dashboard event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    /// Not visible to buyers
    Draft,
    /// On sale
    Published,
    /// Currently happening
    Live,
    /// Finished
    Ended,
    /// Called off
    Cancelled,
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Live => "live",
            Self::Ended => "ended",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// A dashboard event as cached on the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Event identifier
    pub id: EventId,
    /// Title shown in listings
    pub title: String,
    /// Long description
    pub description: String,
    /// Publication status
    pub status: EventStatus,
    /// Last modification time as reported by the server
    pub updated_at: DateTime<Utc>,
}

impl EventRecord {
    /// Creates a draft event
    #[must_use]
    pub fn new(id: EventId, title: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            id,
            title: title.into(),
            description: String::new(),
            status: EventStatus::Draft,
            updated_at,
        }
    }
}

impl Entity for EventRecord {
    type Id = EventId;

    const KIND: &'static str = "event";

    fn id(&self) -> &EventId {
        &self.id
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn item(capacity: u32, sold: u32, reserved: u32) -> InventoryItem {
        InventoryItem::new(ItemId::new("vip"), CollectionId::new("gala"), "VIP", capacity)
            .with_committed(sold, reserved)
    }

    #[test]
    fn test_validate_accepts_full_item() {
        assert!(item(10, 6, 4).check_capacity().is_ok());
    }

    #[test]
    fn test_validate_rejects_oversold_item() {
        let err = item(10, 8, 3).check_capacity().unwrap_err();
        assert!(matches!(err, ReservationError::InvariantViolation { capacity: 10, .. }));
    }

    #[test]
    fn test_committed_does_not_overflow() {
        assert_eq!(item(0, u32::MAX, u32::MAX).committed(), 2 * u64::from(u32::MAX));
    }

    #[test]
    fn test_event_status_serializes_lowercase() {
        let json = serde_json::to_string(&EventStatus::Published).unwrap();
        assert_eq!(json, "\"published\"");
    }

    #[test]
    fn test_ids_are_transparent_strings() {
        let json = serde_json::to_string(&ItemId::new("ga")).unwrap();
        assert_eq!(json, "\"ga\"");
    }
}
