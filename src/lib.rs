//! # Meridian
//!
//! The consensus engine core of a DAG-based distributed ledger:
//! - **Block DAG** — blocks reference multiple parents (strong, weak,
//!   shallow-like) and are solidified, booked and voted on in parallel.
//! - **Slot commitments** — time is divided into fixed-length slots; each
//!   committed slot is summarized by a chained cryptographic commitment.
//! - **Weighted attestations** — validators attest to commitments; chains
//!   compete by claimed, attested and verified weight, and the node can
//!   fork a candidate engine and switch to a heavier verified chain.
//! - **Warp-sync** — a lagging engine bulk-fetches the accepted block set
//!   of a committed slot and verifies it against the commitment's roots.
//!
//! The crate is a library: the peer-to-peer transport, HTTP surfaces and
//! CLI wiring are external collaborators. See `engine::Engine` for the
//! composition root and `dispatcher::Dispatcher` for the network-facing
//! entry point.

pub mod block;
pub mod blockdag;
pub mod booker;
pub mod cache;
pub mod chains;
pub mod clock;
pub mod commitment;
pub mod committee;
pub mod config;
pub mod consensus;
pub mod dispatcher;
pub mod engine;
pub mod filter;
pub mod ledger;
pub mod mempool;
pub mod merkle;
pub mod network;
pub mod notarization;
pub mod reactive;
pub mod requester;
pub mod snapshot;
pub mod storage;
pub mod tips;
pub mod workers;

/// Protocol constants
pub mod constants {
    /// Current protocol version.
    pub const PROTOCOL_VERSION: u8 = 1;
    /// Default slot duration in milliseconds.
    pub const DEFAULT_SLOT_DURATION_MS: u64 = 10_000;
    /// Default number of slots per epoch.
    pub const DEFAULT_SLOTS_PER_EPOCH: u64 = 32;
    /// Minimum age (in slots) the acceptance clock must be ahead of a slot
    /// before that slot can be committed.
    pub const DEFAULT_MIN_COMMITTABLE_AGE: u64 = 2;
    /// Maximum age (in slots) a slot may reach before it must be committed.
    /// Also bounds the eviction window and the warp-sync batch range.
    pub const DEFAULT_MAX_COMMITTABLE_AGE: u64 = 6;
    /// Slots beyond the latest verified commitment that count as "in sync".
    pub const DEFAULT_SYNC_WINDOW: u64 = 20;
    /// Slots beyond the latest verified commitment that are warp-synced
    /// rather than processed block-by-block.
    pub const DEFAULT_WARP_SYNC_WINDOW: u64 = 8;
    /// Fraction of total committee weight required to finalize a slot.
    pub const DEFAULT_FINALIZATION_THRESHOLD: f64 = 0.67;
    /// Fraction of total committee weight required to confirm a block.
    pub const DEFAULT_CONFIRMATION_THRESHOLD: f64 = 0.67;
    /// Fraction of online committee weight required to (pre-)accept a block.
    pub const DEFAULT_ONLINE_QUORUM: f64 = 0.5;
    /// Initial reference mana cost carried by commitments.
    pub const DEFAULT_REFERENCE_MANA_COST: u64 = 1;
    /// Maximum number of parent references per relation.
    pub const MAX_PARENTS: usize = 8;
    /// Tolerated clock drift for block issuing times (milliseconds).
    pub const MAX_TIME_DRIFT_MS: u64 = 5_000;
    /// Base retry interval for missing-block request tickers.
    pub const BLOCK_REQUEST_RETRY_MS: u64 = 500;
    /// Upper bound for warp-sync request retries (1 minute).
    pub const WARP_SYNC_RETRY_MS: u64 = 60_000;
    /// Per-commitment capacity of the unsolid-commitment block buffer.
    pub const UNSOLID_BUFFER_PER_COMMITMENT: usize = 20;
    /// Global capacity of the unsolid-commitment block buffer.
    pub const UNSOLID_BUFFER_TOTAL: usize = 100;
}

/// 32-byte hash used throughout the protocol (Blake2b-256).
pub type Hash = [u8; 32];

/// Index of a slot (fixed-length time window, the unit of commitment).
pub type SlotIndex = u64;

/// Index of an epoch (a fixed number of slots, the unit of committee
/// rotation and rewards state).
pub type EpochIndex = u64;

/// Compute a domain-separated Blake2b-256 hash.
///
/// All protocol hashes go through this helper so distinct usages can never
/// collide: the domain is length-prefixed before the payload.
pub fn hash_domain(domain: &[u8], data: &[u8]) -> Hash {
    use blake2::digest::consts::U32;
    use blake2::{Blake2b, Digest};

    let mut hasher = Blake2b::<U32>::new();
    hasher.update((domain.len() as u64).to_le_bytes());
    hasher.update(domain);
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute a domain-separated Blake2b-256 hash of length-prefixed parts.
///
/// Each part is prefixed with its length as a little-endian u64, preventing
/// ambiguous concatenation (e.g., `["AB","C"]` vs `["A","BC"]`).
pub fn hash_parts(domain: &[u8], parts: &[&[u8]]) -> Hash {
    use blake2::digest::consts::U32;
    use blake2::{Blake2b, Digest};

    let mut hasher = Blake2b::<U32>::new();
    hasher.update((domain.len() as u64).to_le_bytes());
    hasher.update(domain);
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Render the first four bytes of a hash as hex, for log output.
pub fn short_hex(hash: &Hash) -> String {
    hash[..4].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_domain_separates() {
        let a = hash_domain(b"meridian.a", b"payload");
        let b = hash_domain(b"meridian.b", b"payload");
        assert_ne!(a, b);
    }

    #[test]
    fn hash_domain_deterministic() {
        assert_eq!(hash_domain(b"d", b"x"), hash_domain(b"d", b"x"));
    }

    #[test]
    fn hash_parts_length_prefixed() {
        let x = hash_parts(b"d", &[b"ab", b"c"]);
        let y = hash_parts(b"d", &[b"a", b"bc"]);
        assert_ne!(x, y);
    }

    #[test]
    fn short_hex_renders_prefix() {
        let mut h = [0u8; 32];
        h[0] = 0xab;
        h[1] = 0x01;
        assert_eq!(short_hex(&h), "ab010000");
    }
}
