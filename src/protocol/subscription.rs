// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The per-client subscription filter with two-phase commit (C3, §4.3).
//!
//! Notification matching must keep using the *committed* filter until the
//! manager confirms a SUBSCRIBE — otherwise a notification arriving mid-
//! subscribe could be wrongly filtered against a filter nobody has agreed to
//! yet.

/// `{ filter: u32, unreliable: u32 }`, serializing to 8 bytes big-endian
/// (`filter[3..0], unreliable[3..0]`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionParams {
    pub filter: u32,
    pub unreliable: u32,
}

impl SubscriptionParams {
    pub const WIRE_LEN: usize = 8;

    pub fn to_bytes(self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[0..4].copy_from_slice(&self.filter.to_be_bytes());
        out[4..8].copy_from_slice(&self.unreliable.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::WIRE_LEN {
            return None;
        }
        Some(Self {
            filter: u32::from_be_bytes(bytes[0..4].try_into().ok()?),
            unreliable: u32::from_be_bytes(bytes[4..8].try_into().ok()?),
        })
    }

    #[inline]
    pub fn is_subscribed(&self, notif_type: u8) -> bool {
        self.filter & (1u32 << notif_type) != 0
    }

    #[inline]
    pub fn union(a: Self, b: Self) -> Self {
        Self {
            filter: a.filter | b.filter,
            unreliable: a.unreliable | b.unreliable,
        }
    }
}

/// Two-phase-commit subscription state for a single client.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscriptionFilter {
    committed: SubscriptionParams,
    proposed: Option<SubscriptionParams>,
    in_transaction: bool,
}

impl SubscriptionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The (possibly still-proposed) new filter value.
    pub fn get(&self) -> u32 {
        self.proposed.map_or(self.committed.filter, |p| p.filter)
    }

    pub fn get_unreliable(&self) -> u32 {
        self.proposed
            .map_or(self.committed.unreliable, |p| p.unreliable)
    }

    /// Matches against the *committed* filter, never the pending proposal.
    #[inline]
    pub fn is_subscribed(&self, notif_type: u8) -> bool {
        self.committed.is_subscribed(notif_type)
    }

    #[inline]
    pub fn committed(&self) -> SubscriptionParams {
        self.committed
    }

    /// Opens a transaction proposing `new` as the next committed value.
    pub fn set(&mut self, new: SubscriptionParams) {
        self.in_transaction = true;
        self.proposed = Some(new);
    }

    /// Discards the pending proposal without touching the committed value.
    pub fn reset(&mut self) {
        self.in_transaction = false;
        self.proposed = None;
    }

    /// Promotes the pending proposal to committed.
    pub fn commit(&mut self) {
        if let Some(p) = self.proposed.take() {
            self.committed = p;
        }
        self.in_transaction = false;
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        let p = SubscriptionParams {
            filter: 0x0000_0007,
            unreliable: 0xDEAD_BEEF,
        };
        let bytes = p.to_bytes();
        assert_eq!(SubscriptionParams::from_bytes(&bytes), Some(p));
    }

    #[test]
    fn notification_matches_old_filter_during_pending_subscribe() {
        let mut f = SubscriptionFilter::new();
        f.set(SubscriptionParams {
            filter: 0b10,
            unreliable: 0,
        });
        assert!(f.in_transaction());
        // Committed filter is still the all-zero default: type 1 must not
        // match yet even though the proposal already covers it.
        assert!(!f.is_subscribed(1));
        f.commit();
        assert!(f.is_subscribed(1));
    }

    #[test]
    fn reset_discards_proposal() {
        let mut f = SubscriptionFilter::new();
        f.set(SubscriptionParams {
            filter: 0xFF,
            unreliable: 0,
        });
        f.reset();
        assert_eq!(f.committed().filter, 0);
        assert!(!f.in_transaction());
    }

    #[test]
    fn union_is_bitwise_or() {
        let a = SubscriptionParams {
            filter: 0b011,
            unreliable: 0,
        };
        let b = SubscriptionParams {
            filter: 0b110,
            unreliable: 0,
        };
        assert_eq!(SubscriptionParams::union(a, b).filter, 0b111);
    }
}
