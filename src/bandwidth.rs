//! Bandwidth accounting for concurrent downloads
//!
//! The ledger tracks per-item reservations summed against a global cap.
//! Reservations are declarative budgets, not throttles: the engine adapter
//! receives the reserved amount and configures the external tool's own rate
//! limiting. Owned by the scheduler actor; not internally synchronized.

use crate::types::{BandwidthSnapshot, ItemId};
use std::collections::HashMap;

/// Ledger of per-item bandwidth reservations
#[derive(Debug, Default)]
pub struct BandwidthLedger {
    cap_bps: Option<u64>,
    reservations: HashMap<ItemId, u64>,
}

impl BandwidthLedger {
    /// Create a ledger with the given global cap (None = unlimited)
    pub fn new(cap_bps: Option<u64>) -> Self {
        Self {
            cap_bps,
            reservations: HashMap::new(),
        }
    }

    /// Whether `amount` can be reserved for `item` without exceeding the cap
    ///
    /// An existing reservation for the same item is not double-counted, so
    /// this also answers "can the item's reservation grow to `amount`".
    pub fn can_allocate(&self, item: &ItemId, amount: u64) -> bool {
        let Some(cap) = self.cap_bps else {
            return true;
        };
        let current = self.allocated() - self.reservations.get(item).copied().unwrap_or(0);
        current + amount <= cap
    }

    /// Reserve `amount` for `item`
    ///
    /// Returns false (and leaves the ledger untouched) if the cap would be
    /// exceeded.
    pub fn allocate(&mut self, item: &ItemId, amount: u64) -> bool {
        if !self.can_allocate(item, amount) {
            return false;
        }
        self.reservations.insert(item.clone(), amount);
        true
    }

    /// Release the reservation held by `item`, returning it if present
    pub fn release(&mut self, item: &ItemId) -> Option<u64> {
        self.reservations.remove(item)
    }

    /// Sum of all active reservations
    pub fn allocated(&self) -> u64 {
        self.reservations.values().sum()
    }

    /// Reservation held by a specific item
    pub fn reservation(&self, item: &ItemId) -> Option<u64> {
        self.reservations.get(item).copied()
    }

    /// Replace the global cap; existing reservations are left untouched
    pub fn set_cap(&mut self, cap_bps: Option<u64>) {
        self.cap_bps = cap_bps;
    }

    /// Snapshot for status reporting
    pub fn snapshot(&self) -> BandwidthSnapshot {
        BandwidthSnapshot {
            allocated_bps: self.allocated(),
            cap_bps: self.cap_bps,
            active_reservations: self.reservations.len(),
        }
    }
}
