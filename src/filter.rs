//! The pre-solid filter: cheap checks before a block enters the DAG.
//!
//! Runs before solidification, so it can only judge the block in
//! isolation: protocol version, issuing-time drift against the accepted
//! clock, the committable range of the referenced slot commitment, and
//! the issuer's signature against the current committee. Rejected blocks
//! are dropped, never retried.

use std::sync::Arc;

use crate::block::ProtocolBlock;
use crate::committee::SeatManager;
use crate::config::ProtocolParameters;
use crate::reactive::Signal;

/// Why a block was dropped by the filter.
#[derive(Clone, Debug, thiserror::Error)]
pub enum FilterError {
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("issuing time {issuing_time_ms} is too far ahead of accepted time {accepted_time_ms}")]
    TooFarInFuture {
        issuing_time_ms: u64,
        accepted_time_ms: u64,
    },
    #[error("slot commitment {commitment_slot} outside committable range for block slot {block_slot}")]
    CommitmentOutOfRange {
        commitment_slot: u64,
        block_slot: u64,
    },
    #[error("invalid block signature")]
    InvalidSignature,
    #[error("malformed block: {0}")]
    Malformed(#[from] crate::block::BlockError),
}

pub struct PreSolidFilter {
    params: Arc<ProtocolParameters>,
    seats: Arc<SeatManager>,

    pub block_filtered: Signal<(ProtocolBlock, String)>,
}

impl PreSolidFilter {
    pub fn new(params: Arc<ProtocolParameters>, seats: Arc<SeatManager>) -> Self {
        PreSolidFilter {
            params,
            seats,
            block_filtered: Signal::new(),
        }
    }

    /// Validate a block against the stateless rules. `accepted_time_ms`
    /// is the engine's accepted-clock anchor (0 disables the drift check
    /// during bootstrap).
    pub fn check(
        &self,
        block: &ProtocolBlock,
        accepted_time_ms: u64,
    ) -> Result<(), FilterError> {
        block.validate_structure()?;

        if block.header.protocol_version != self.params.version {
            return self.reject(block, FilterError::UnsupportedVersion(block.header.protocol_version));
        }

        if accepted_time_ms != 0
            && block.header.issuing_time_ms
                > accepted_time_ms + crate::constants::MAX_TIME_DRIFT_MS
        {
            return self.reject(
                block,
                FilterError::TooFarInFuture {
                    issuing_time_ms: block.header.issuing_time_ms,
                    accepted_time_ms,
                },
            );
        }

        // A block must commit to a slot old enough to be committable and
        // recent enough to still matter.
        let block_slot = block.slot(&self.params);
        let commitment_slot = block.header.slot_commitment_id.slot;
        let min_allowed = block_slot.saturating_sub(self.params.max_committable_age);
        let max_allowed = block_slot.saturating_sub(self.params.min_committable_age);
        if commitment_slot != 0 && (commitment_slot < min_allowed || commitment_slot > max_allowed)
        {
            return self.reject(
                block,
                FilterError::CommitmentOutOfRange {
                    commitment_slot,
                    block_slot,
                },
            );
        }

        // Committee members must sign their blocks; foreign issuers pass
        // through (they carry no voting weight downstream anyway).
        if self.seats.committee().seat(&block.header.issuer).is_some() {
            let sign_data = block.sign_data()?;
            if !self.seats.committee().verify_signature(
                &block.header.issuer,
                &sign_data,
                &block.signature.0,
            ) {
                return self.reject(block, FilterError::InvalidSignature);
            }
        }

        Ok(())
    }

    fn reject(&self, block: &ProtocolBlock, error: FilterError) -> Result<(), FilterError> {
        tracing::debug!(%error, "block dropped by pre-solid filter");
        self.block_filtered
            .trigger(&(block.clone(), error.to_string()));
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockHeader, BlockId, Payload};
    use crate::commitment::CommitmentId;
    use crate::committee::{account_id, Committee, CommitteeMember, Signature};
    use ed25519_dalek::{Signer, SigningKey};

    fn setup() -> (PreSolidFilter, SigningKey, [u8; 32]) {
        let key = SigningKey::from_bytes(&[1u8; 32]);
        let key_bytes = key.verifying_key().to_bytes();
        let account = account_id(&key_bytes);
        let committee = Committee::new(vec![CommitteeMember {
            account,
            key_bytes,
            weight: 1,
        }]);
        let params = Arc::new(ProtocolParameters {
            genesis_unix_ms: 0,
            slot_duration_ms: 10,
            min_committable_age: 1,
            max_committable_age: 6,
            ..Default::default()
        });
        let filter = PreSolidFilter::new(params, Arc::new(SeatManager::new(committee)));
        (filter, key, account)
    }

    fn signed_block(
        key: &SigningKey,
        issuer: [u8; 32],
        time_ms: u64,
        commitment_slot: u64,
    ) -> ProtocolBlock {
        let mut block = ProtocolBlock {
            header: BlockHeader {
                protocol_version: 1,
                issuer,
                issuing_time_ms: time_ms,
                slot_commitment_id: CommitmentId {
                    slot: commitment_slot,
                    hash: [2u8; 32],
                },
                latest_finalized_slot: 0,
                strong_parents: vec![BlockId {
                    slot: 1,
                    hash: [3u8; 32],
                }],
                weak_parents: vec![],
                shallow_like_parents: vec![],
            },
            payload: Payload::Validation {
                highest_supported_version: 1,
            },
            signature: Signature::empty(),
        };
        block.signature = Signature(key.sign(&block.sign_data().unwrap()).to_bytes().to_vec());
        block
    }

    #[test]
    fn valid_block_passes() {
        let (filter, key, account) = setup();
        let block = signed_block(&key, account, 55, 3); // slot 6, commits 3
        assert!(filter.check(&block, 50).is_ok());
    }

    #[test]
    fn wrong_version_is_dropped() {
        let (filter, key, account) = setup();
        let mut block = signed_block(&key, account, 55, 3);
        block.header.protocol_version = 9;
        assert!(matches!(
            filter.check(&block, 50),
            Err(FilterError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn future_blocks_are_dropped() {
        let (filter, key, account) = setup();
        let block = signed_block(&key, account, 100_000, 9_996);
        assert!(matches!(
            filter.check(&block, 50),
            Err(FilterError::TooFarInFuture { .. })
        ));
        // With no accepted anchor yet the drift check is disabled.
        assert!(filter.check(&block, 0).is_ok());
    }

    #[test]
    fn commitment_age_is_bounded() {
        let (filter, key, account) = setup();
        // Block at slot 11 (time 105): committable range is [5, 10].
        let too_old = signed_block(&key, account, 105, 4);
        assert!(matches!(
            filter.check(&too_old, 0),
            Err(FilterError::CommitmentOutOfRange { .. })
        ));
        let too_new = signed_block(&key, account, 105, 11);
        assert!(matches!(
            filter.check(&too_new, 0),
            Err(FilterError::CommitmentOutOfRange { .. })
        ));
        let in_range = signed_block(&key, account, 105, 7);
        assert!(filter.check(&in_range, 0).is_ok());
    }

    #[test]
    fn bad_signature_is_dropped() {
        let (filter, key, account) = setup();
        let mut block = signed_block(&key, account, 55, 3);
        block.signature = Signature(vec![0u8; 64]);
        assert!(matches!(
            filter.check(&block, 0),
            Err(FilterError::InvalidSignature)
        ));
    }

    #[test]
    fn filtered_signal_fires() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let (filter, key, account) = setup();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = Arc::clone(&count);
            filter
                .block_filtered
                .subscribe(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .detach();
        }
        let mut block = signed_block(&key, account, 55, 3);
        block.header.protocol_version = 9;
        let _ = filter.check(&block, 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
