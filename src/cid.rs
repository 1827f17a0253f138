//! # Connection ID generation and routing tables
//!
//! Connection IDs are generated from entropy and bound to a stateless
//! reset token derived with SipHash-1-3 under the endpoint's reset
//! secret (RFC 9000 Section 10.3.2: the token must be computable from
//! the CID without per-connection state, so a restarted endpoint can
//! still produce it).
//!
//! The [`CidTable`] is the endpoint's demux map: every CID a session is
//! reachable under resolves to its slot, and the reverse token map lets
//! an otherwise-unreadable datagram be recognized as a stateless reset.

use std::collections::HashMap;
use std::hash::Hasher;

use rand::RngCore;
use siphasher::sip::SipHasher13;

use crate::types::{ConnectionId, StatelessResetToken, LOCAL_CID_LEN, RESET_TOKEN_LEN};

// ============================================================================
// Generation
// ============================================================================

/// Generates connection IDs and their bound reset tokens.
#[derive(Debug, Clone)]
pub struct CidGenerator {
    reset_secret: [u8; 32],
}

impl CidGenerator {
    pub fn new(reset_secret: [u8; 32]) -> Self {
        Self { reset_secret }
    }

    /// A generator with a random process-local secret.
    pub fn random() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self::new(secret)
    }

    /// Generate a random CID of the local profile length.
    pub fn generate(&self) -> ConnectionId {
        self.generate_len(LOCAL_CID_LEN)
    }

    /// Generate a random CID of `len` bytes (clamped to the valid range).
    pub fn generate_len(&self, len: usize) -> ConnectionId {
        let len = len.min(crate::types::MAX_CID_LEN);
        let mut bytes = [0u8; crate::types::MAX_CID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes[..len]);
        // from_slice only fails above MAX_CID_LEN, which the clamp rules out.
        ConnectionId::from_slice(&bytes[..len]).unwrap_or_else(ConnectionId::empty)
    }

    /// Stateless reset token bound to `cid`: two SipHash-1-3 rounds under
    /// the reset secret, domain-separated by the round index.
    pub fn reset_token(&self, cid: &ConnectionId) -> StatelessResetToken {
        let mut k0b = [0u8; 8];
        let mut k1b = [0u8; 8];
        k0b.copy_from_slice(&self.reset_secret[0..8]);
        k1b.copy_from_slice(&self.reset_secret[8..16]);
        let (k0, k1) = (u64::from_le_bytes(k0b), u64::from_le_bytes(k1b));

        let mut token = [0u8; RESET_TOKEN_LEN];
        for round in 0u8..2 {
            let mut hasher = SipHasher13::new_with_keys(k0 ^ u64::from(round), k1);
            hasher.write(&self.reset_secret[16..]);
            hasher.write(cid.as_bytes());
            let half = hasher.finish().to_le_bytes();
            token[usize::from(round) * 8..usize::from(round) * 8 + 8].copy_from_slice(&half);
        }
        token
    }
}

// ============================================================================
// Routing table
// ============================================================================

/// Maps connection IDs and peer-issued stateless reset tokens to session
/// slots.
///
/// Tokens registered here are the ones the *peer* bound to the CIDs this
/// endpoint sends to (transport parameter and NEW_CONNECTION_ID frames):
/// they identify an inbound opaque datagram as a reset *of* one of our
/// sessions.
#[derive(Debug, Default)]
pub struct CidTable {
    by_cid: HashMap<ConnectionId, usize>,
    by_token: HashMap<StatelessResetToken, usize>,
}

impl CidTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn associate(&mut self, cid: ConnectionId, slot: usize) {
        self.by_cid.insert(cid, slot);
    }

    pub fn dissociate(&mut self, cid: &ConnectionId) {
        self.by_cid.remove(cid);
    }

    pub fn lookup(&self, cid: &ConnectionId) -> Option<usize> {
        self.by_cid.get(cid).copied()
    }

    pub fn associate_token(&mut self, token: StatelessResetToken, slot: usize) {
        self.by_token.insert(token, slot);
    }

    pub fn dissociate_token(&mut self, token: &StatelessResetToken) {
        self.by_token.remove(token);
    }

    /// Check the trailing 16 bytes of a datagram against known tokens.
    pub fn lookup_token(&self, datagram: &[u8]) -> Option<usize> {
        if datagram.len() < RESET_TOKEN_LEN {
            return None;
        }
        let mut tail = [0u8; RESET_TOKEN_LEN];
        tail.copy_from_slice(&datagram[datagram.len() - RESET_TOKEN_LEN..]);
        self.by_token.get(&tail).copied()
    }

    /// Remove every association pointing at `slot`. Used on session
    /// destruction so a destroyed session holds no registered CIDs.
    pub fn remove_slot(&mut self, slot: usize) {
        self.by_cid.retain(|_, s| *s != slot);
        self.by_token.retain(|_, s| *s != slot);
    }

    pub fn cid_count(&self) -> usize {
        self.by_cid.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_token_is_deterministic_per_secret() {
        let gen = CidGenerator::new([7u8; 32]);
        let cid = gen.generate();
        assert_eq!(cid.len(), LOCAL_CID_LEN);
        assert_eq!(gen.reset_token(&cid), gen.reset_token(&cid));

        let other = CidGenerator::new([8u8; 32]);
        assert_ne!(gen.reset_token(&cid), other.reset_token(&cid));
    }

    #[test]
    fn table_routes_and_unregisters() {
        let gen = CidGenerator::random();
        let mut table = CidTable::new();
        let a = gen.generate();
        let b = gen.generate();
        table.associate(a, 1);
        table.associate(b, 1);
        assert_eq!(table.lookup(&a), Some(1));
        assert_eq!(table.lookup(&b), Some(1));

        table.remove_slot(1);
        assert_eq!(table.lookup(&a), None);
        assert_eq!(table.lookup(&b), None);
        assert_eq!(table.cid_count(), 0);
    }

    #[test]
    fn token_match_uses_datagram_tail() {
        let mut table = CidTable::new();
        let token = [0xabu8; 16];
        table.associate_token(token, 4);

        let mut datagram = vec![0x41u8; 40];
        datagram[24..].copy_from_slice(&token);
        assert_eq!(table.lookup_token(&datagram), Some(4));
        assert_eq!(table.lookup_token(&datagram[..10]), None);
    }
}
