//! Protocol parameters and node configuration.
//!
//! `ProtocolParameters` is the consensus-critical parameter set (slot
//! timing, committable ages, vote thresholds); every engine component takes
//! it by shared reference. `NodeConfig` is operator-facing and loaded from
//! an optional `meridian.toml` in the data directory; CLI flags of the
//! embedding binary override config file values, which override defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{constants, EpochIndex, SlotIndex};

/// Consensus-critical protocol parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolParameters {
    /// Protocol version blocks and commitments are produced with.
    pub version: u8,
    /// Unix timestamp (milliseconds) of the genesis slot boundary.
    pub genesis_unix_ms: u64,
    /// Slot duration in milliseconds.
    pub slot_duration_ms: u64,
    /// Number of slots per epoch.
    pub slots_per_epoch: u64,
    /// A slot can only be committed once the acceptance clock is more than
    /// this many slots past it.
    pub min_committable_age: u64,
    /// Upper bound on commitment lag; also the eviction delay and half the
    /// warp-sync batch range.
    pub max_committable_age: u64,
    /// Slots beyond the latest verified commitment considered "in sync".
    pub sync_window: u64,
    /// Slots beyond the latest verified commitment that are warp-synced.
    pub warp_sync_window: u64,
    /// Fraction of total committee weight finalizing a slot.
    pub finalization_threshold: f64,
    /// Fraction of total committee weight confirming a block.
    pub confirmation_threshold: f64,
    /// Fraction of online committee weight (pre-)accepting a block.
    pub online_quorum: f64,
    /// Reference mana cost carried by produced commitments.
    pub reference_mana_cost: u64,
}

impl Default for ProtocolParameters {
    fn default() -> Self {
        ProtocolParameters {
            version: constants::PROTOCOL_VERSION,
            genesis_unix_ms: 0,
            slot_duration_ms: constants::DEFAULT_SLOT_DURATION_MS,
            slots_per_epoch: constants::DEFAULT_SLOTS_PER_EPOCH,
            min_committable_age: constants::DEFAULT_MIN_COMMITTABLE_AGE,
            max_committable_age: constants::DEFAULT_MAX_COMMITTABLE_AGE,
            sync_window: constants::DEFAULT_SYNC_WINDOW,
            warp_sync_window: constants::DEFAULT_WARP_SYNC_WINDOW,
            finalization_threshold: constants::DEFAULT_FINALIZATION_THRESHOLD,
            confirmation_threshold: constants::DEFAULT_CONFIRMATION_THRESHOLD,
            online_quorum: constants::DEFAULT_ONLINE_QUORUM,
            reference_mana_cost: constants::DEFAULT_REFERENCE_MANA_COST,
        }
    }
}

impl ProtocolParameters {
    /// Slot containing the given unix-millisecond timestamp.
    ///
    /// Slot 0 is the genesis slot; times before genesis clamp to 0.
    pub fn slot_for_time(&self, unix_ms: u64) -> SlotIndex {
        if unix_ms < self.genesis_unix_ms {
            return 0;
        }
        (unix_ms - self.genesis_unix_ms) / self.slot_duration_ms + 1
    }

    /// First millisecond of the given slot.
    pub fn slot_start_time(&self, slot: SlotIndex) -> u64 {
        if slot == 0 {
            return self.genesis_unix_ms;
        }
        self.genesis_unix_ms + (slot - 1) * self.slot_duration_ms
    }

    /// Last millisecond of the given slot.
    pub fn slot_end_time(&self, slot: SlotIndex) -> u64 {
        self.slot_start_time(slot + 1) - 1
    }

    /// Epoch containing the given slot.
    pub fn epoch_of(&self, slot: SlotIndex) -> EpochIndex {
        slot / self.slots_per_epoch
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct MeridianConfig {
    pub node: NodeConfig,
    pub protocol: ProtocolParameters,
}

/// Node configuration section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: String,
    /// Base retry interval for missing-block request tickers (ms).
    pub block_request_retry_ms: u64,
    /// Upper bound for warp-sync request retries (ms).
    pub warp_sync_retry_ms: u64,
    /// Number of workers in the dispatcher's dispatch pool.
    pub dispatch_workers: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            data_dir: "./meridian-data".into(),
            block_request_retry_ms: constants::BLOCK_REQUEST_RETRY_MS,
            warp_sync_retry_ms: constants::WARP_SYNC_RETRY_MS,
            dispatch_workers: 4,
        }
    }
}

impl MeridianConfig {
    /// Load configuration from `meridian.toml` in the given directory.
    /// Returns `Default` if the file doesn't exist.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join("meridian.toml");
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}
