//! Relative-time anchors derived from the block pipeline.
//!
//! The engine's notion of time is not the wall clock: the accepted anchor
//! advances with the issuing time of accepted blocks, the confirmed anchor
//! with confirmed blocks, and both jump to the slot end when a slot
//! finalizes. Downstream consumers (notarization age checks, tip decay)
//! read these anchors instead of the system clock so a replaying or
//! warp-syncing node behaves identically to a live one.

use std::sync::Arc;

use crate::block::Block;
use crate::config::ProtocolParameters;
use crate::reactive::Variable;
use crate::SlotIndex;

/// A monotonically advancing unix-millisecond anchor.
#[derive(Clone)]
pub struct RelativeTime {
    time_ms: Variable<u64>,
}

impl Default for RelativeTime {
    fn default() -> Self {
        Self::new()
    }
}

impl RelativeTime {
    pub fn new() -> Self {
        RelativeTime {
            time_ms: Variable::with_transition(0, |current, new| (*current).max(*new)),
        }
    }

    /// Advance the anchor; earlier times are ignored.
    pub fn advance(&self, unix_ms: u64) {
        self.time_ms.set(unix_ms);
    }

    pub fn get(&self) -> u64 {
        self.time_ms.get()
    }

    pub fn on_update(
        &self,
        f: impl Fn(&u64, &u64) + Send + Sync + 'static,
    ) -> crate::reactive::Subscription {
        self.time_ms.on_update(f)
    }
}

/// Relative-time anchors for the accepted and confirmed frontiers.
pub struct Clock {
    params: Arc<ProtocolParameters>,
    accepted: RelativeTime,
    confirmed: RelativeTime,
}

impl Clock {
    pub fn new(params: Arc<ProtocolParameters>) -> Self {
        Clock {
            params,
            accepted: RelativeTime::new(),
            confirmed: RelativeTime::new(),
        }
    }

    pub fn accepted(&self) -> &RelativeTime {
        &self.accepted
    }

    pub fn confirmed(&self) -> &RelativeTime {
        &self.confirmed
    }

    /// Slot of the accepted-time anchor.
    pub fn accepted_slot(&self) -> SlotIndex {
        self.params.slot_for_time(self.accepted.get())
    }

    /// Advance the accepted anchor with an accepted block.
    pub fn advance_accepted(&self, block: &Arc<Block>) {
        if let Some(time) = block.issuing_time_ms() {
            self.accepted.advance(time);
        }
    }

    /// Advance the confirmed anchor with a confirmed block.
    pub fn advance_confirmed(&self, block: &Arc<Block>) {
        if let Some(time) = block.issuing_time_ms() {
            self.confirmed.advance(time);
        }
    }

    /// A finalized slot pulls both anchors to at least its end.
    pub fn advance_finalized(&self, slot: SlotIndex) {
        let end = self.params.slot_end_time(slot);
        self.accepted.advance(end);
        self.confirmed.advance(end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockHeader, BlockId, Payload, ProtocolBlock};
    use crate::commitment::CommitmentId;
    use crate::committee::Signature;

    fn params() -> Arc<ProtocolParameters> {
        Arc::new(ProtocolParameters {
            genesis_unix_ms: 0,
            slot_duration_ms: 10,
            ..Default::default()
        })
    }

    fn block_at(time_ms: u64) -> Arc<Block> {
        let protocol_block = ProtocolBlock {
            header: BlockHeader {
                protocol_version: 1,
                issuer: [1u8; 32],
                issuing_time_ms: time_ms,
                slot_commitment_id: CommitmentId::default(),
                latest_finalized_slot: 0,
                strong_parents: vec![BlockId::default()],
                weak_parents: vec![],
                shallow_like_parents: vec![],
            },
            payload: Payload::Validation {
                highest_supported_version: 1,
            },
            signature: Signature::empty(),
        };
        Arc::new(Block::new(
            BlockId {
                slot: 1,
                hash: [time_ms as u8; 32],
            },
            protocol_block,
        ))
    }

    #[test]
    fn relative_time_is_monotonic() {
        let time = RelativeTime::new();
        time.advance(100);
        time.advance(50);
        assert_eq!(time.get(), 100);
        time.advance(150);
        assert_eq!(time.get(), 150);
    }

    #[test]
    fn accepted_blocks_advance_the_anchor() {
        let clock = Clock::new(params());
        clock.advance_accepted(&block_at(25));
        assert_eq!(clock.accepted().get(), 25);
        assert_eq!(clock.accepted_slot(), 3);
        // An older accepted block does not move it back.
        clock.advance_accepted(&block_at(15));
        assert_eq!(clock.accepted().get(), 25);
    }

    #[test]
    fn finalized_slot_pulls_both_anchors() {
        let clock = Clock::new(params());
        clock.advance_accepted(&block_at(15));
        clock.advance_finalized(4);
        // Slot 4 ends at ms 49.
        assert_eq!(clock.accepted().get(), 49);
        assert_eq!(clock.confirmed().get(), 49);
    }
}
