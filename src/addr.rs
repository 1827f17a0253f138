//! # Address book
//!
//! Per-peer bookkeeping the endpoint consults on admission and when
//! emitting stateless resets: live session counts, a small LRU of
//! recently validated addresses (so a returning peer can skip the retry
//! round trip), and lifetime stateless-reset counters.
//!
//! Entries key on the remote IP address, not address+port; a host
//! cycling source ports must not escape the caps.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};

use crate::types::Timestamp;

/// Capacity of the validated-address LRU.
pub const VALIDATED_ADDRESS_LRU: usize = 10;

/// How long an LRU entry counts as validated.
const VALIDATED_ADDRESS_TTL_MS: u64 = 10 * 60 * 1000;

#[derive(Debug, Default)]
pub struct AddressBook {
    session_counts: HashMap<IpAddr, usize>,
    reset_counts: HashMap<IpAddr, u64>,
    validated: VecDeque<(IpAddr, Timestamp)>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Per-host session counters
    // ------------------------------------------------------------------

    pub fn increment_sessions(&mut self, addr: &SocketAddr) {
        *self.session_counts.entry(addr.ip()).or_insert(0) += 1;
    }

    pub fn decrement_sessions(&mut self, addr: &SocketAddr) {
        if let Some(count) = self.session_counts.get_mut(&addr.ip()) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.session_counts.remove(&addr.ip());
            }
        }
    }

    pub fn session_count(&self, addr: &SocketAddr) -> usize {
        self.session_counts.get(&addr.ip()).copied().unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Stateless reset rate counters
    // ------------------------------------------------------------------

    /// Count a reset emitted toward `addr`, returning the new total.
    pub fn increment_resets(&mut self, addr: &SocketAddr) -> u64 {
        let count = self.reset_counts.entry(addr.ip()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn reset_count(&self, addr: &SocketAddr) -> u64 {
        self.reset_counts.get(&addr.ip()).copied().unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Validated-address LRU
    // ------------------------------------------------------------------

    /// Record a successful address validation.
    pub fn set_validated(&mut self, addr: &SocketAddr, now: Timestamp) {
        let ip = addr.ip();
        self.validated.retain(|(a, _)| *a != ip);
        if self.validated.len() >= VALIDATED_ADDRESS_LRU {
            self.validated.pop_front();
        }
        self.validated.push_back((ip, now));
    }

    /// Whether `addr` was validated recently. A hit refreshes recency.
    pub fn is_validated(&mut self, addr: &SocketAddr, now: Timestamp) -> bool {
        let ip = addr.ip();
        let fresh = self
            .validated
            .iter()
            .any(|(a, at)| *a == ip && now.millis_since(*at) < VALIDATED_ADDRESS_TTL_MS);
        if fresh {
            self.set_validated(addr, now);
        }
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8, port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, last], port))
    }

    #[test]
    fn session_counts_ignore_port() {
        let mut book = AddressBook::new();
        book.increment_sessions(&addr(1, 1000));
        book.increment_sessions(&addr(1, 2000));
        assert_eq!(book.session_count(&addr(1, 3000)), 2);
        book.decrement_sessions(&addr(1, 1000));
        book.decrement_sessions(&addr(1, 1000));
        assert_eq!(book.session_count(&addr(1, 1000)), 0);
        // Underflow is clamped.
        book.decrement_sessions(&addr(1, 1000));
        assert_eq!(book.session_count(&addr(1, 1000)), 0);
    }

    #[test]
    fn reset_counters_accumulate() {
        let mut book = AddressBook::new();
        assert_eq!(book.increment_resets(&addr(2, 1)), 1);
        assert_eq!(book.increment_resets(&addr(2, 9)), 2);
        assert_eq!(book.reset_count(&addr(3, 1)), 0);
    }

    #[test]
    fn validated_lru_evicts_oldest() {
        let mut book = AddressBook::new();
        let now = Timestamp::from_millis(1000);
        for i in 0..VALIDATED_ADDRESS_LRU as u8 {
            book.set_validated(&addr(i, 1), now);
        }
        assert!(book.is_validated(&addr(0, 1), now));

        // Insert one more; the least recently used entry (1) is evicted,
        // since 0 was refreshed by the lookup above.
        book.set_validated(&addr(200, 1), now);
        assert!(!book.is_validated(&addr(1, 1), now));
        assert!(book.is_validated(&addr(200, 1), now));
    }

    #[test]
    fn validation_expires() {
        let mut book = AddressBook::new();
        book.set_validated(&addr(5, 1), Timestamp::from_millis(0));
        let later = Timestamp::from_millis(VALIDATED_ADDRESS_TTL_MS + 1);
        assert!(!book.is_validated(&addr(5, 1), later));
    }
}
