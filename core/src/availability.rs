//! Availability arithmetic.
//!
//! ```text
//! available = capacity - committed_sold - committed_reserved - sum(active holds)
//! ```
//!
//! The result never goes negative. A server snapshot can legitimately report
//! more committed units than this client expected while local holds are still
//! outstanding; in that case availability reads zero until holds drain.

use crate::types::{Hold, InventoryItem, ItemId};
use serde::{Deserialize, Serialize};

/// Point-in-time availability of one item. Derived, never stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityView {
    /// Item this view describes
    pub item_id: ItemId,
    /// Total sellable units
    pub capacity: u32,
    /// Units committed on the server (sold + reserved)
    pub committed: u64,
    /// Units held locally by active holds
    pub held: u64,
    /// Units that can still be held
    pub available: u32,
}

impl AvailabilityView {
    /// Combines an inventory record with the item's active holds.
    ///
    /// Holds for other items are the caller's responsibility to filter out.
    #[must_use]
    pub fn compute<'a>(item: &InventoryItem, holds: impl IntoIterator<Item = &'a Hold>) -> Self {
        let held = holds
            .into_iter()
            .map(|hold| u64::from(hold.quantity))
            .fold(0u64, u64::saturating_add);
        let committed = item.committed();
        let remaining = u64::from(item.capacity)
            .saturating_sub(committed)
            .saturating_sub(held);

        Self {
            item_id: item.id.clone(),
            capacity: item.capacity,
            committed,
            held,
            // remaining <= capacity, so it always fits
            available: u32::try_from(remaining).unwrap_or(item.capacity),
        }
    }

    /// Whether a hold of `quantity` would fit.
    #[must_use]
    pub const fn admits(&self, quantity: u32) -> bool {
        quantity <= self.available
    }

    /// Whether committed plus held units stay within capacity.
    #[must_use]
    pub const fn within_capacity(&self) -> bool {
        self.committed.saturating_add(self.held) <= self.capacity as u64
    }
}

/// Available quantity for an item given its active holds.
#[must_use]
pub fn available_quantity<'a>(item: &InventoryItem, holds: impl IntoIterator<Item = &'a Hold>) -> u32 {
    AvailabilityView::compute(item, holds).available
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CollectionId, HoldId, HolderId};
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;

    fn item(capacity: u32, sold: u32, reserved: u32) -> InventoryItem {
        InventoryItem::new(ItemId::new("ga"), CollectionId::new("fest"), "GA", capacity)
            .with_committed(sold, reserved)
    }

    fn hold(seq: u64, quantity: u32) -> Hold {
        let placed_at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap_or_default();
        Hold {
            id: HoldId::new(seq),
            item_id: ItemId::new("ga"),
            holder_id: HolderId::new(format!("holder-{seq}")),
            quantity,
            placed_at,
            expires_at: placed_at + Duration::minutes(15),
        }
    }

    #[test]
    fn test_committed_counters_reduce_availability() {
        let view = AvailabilityView::compute(&item(100, 80, 5), std::iter::empty());
        assert_eq!(view.available, 15);
        assert_eq!(view.committed, 85);
        assert_eq!(view.held, 0);
    }

    #[test]
    fn test_holds_reduce_availability() {
        let holds = [hold(1, 10)];
        let view = AvailabilityView::compute(&item(100, 80, 5), &holds);
        assert_eq!(view.available, 5);
        assert!(view.admits(5));
        assert!(!view.admits(6));
    }

    #[test]
    fn test_availability_clamps_to_zero() {
        let holds = [hold(1, 10), hold(2, 10)];
        assert_eq!(available_quantity(&item(20, 15, 0), &holds), 0);
    }

    proptest! {
        #[test]
        fn prop_available_never_exceeds_capacity(
            capacity in 0u32..10_000,
            sold in 0u32..10_000,
            reserved in 0u32..10_000,
            quantities in proptest::collection::vec(1u32..500, 0..20),
        ) {
            let holds: Vec<Hold> = quantities
                .iter()
                .enumerate()
                .map(|(i, q)| hold(i as u64, *q))
                .collect();
            let view = AvailabilityView::compute(&item(capacity, sold, reserved), &holds);
            prop_assert!(view.available <= capacity);
            if view.available > 0 {
                prop_assert!(view.within_capacity());
            }
        }
    }
}
