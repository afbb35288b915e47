//! The block gadget: per-block acceptance and confirmation by weighted
//! voting along the DAG.
//!
//! Every booked block is a vote by its issuer's seat. Walking the strong
//! parent closure, the seat witnesses each ancestor; an ancestor is
//! pre-accepted once witness seats pass the online-committee quorum and
//! accepted as soon as its pre-acceptance persists (published directly
//! after, parents first). Pre-confirmation requires witness weight at the
//! full-committee threshold; confirmation is the ratified second round:
//! seats whose votes arrive after a block's pre-acceptance ratify it, and
//! ratifier weight at the full-committee threshold confirms. Events are
//! published in topological order: a block is never accepted before its
//! strong parents.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::block::Block;
use crate::cache::BlockCache;
use crate::committee::{is_threshold_reached, SeatManager};
use crate::config::ProtocolParameters;
use crate::reactive::{Event, Signal};

pub struct BlockGadget {
    params: Arc<ProtocolParameters>,
    cache: Arc<BlockCache>,
    seats: Arc<SeatManager>,

    pub block_pre_accepted: Signal<Arc<Block>>,
    pub block_accepted: Signal<Arc<Block>>,
    pub block_pre_confirmed: Signal<Arc<Block>>,
    pub block_confirmed: Signal<Arc<Block>>,
}

impl BlockGadget {
    pub fn new(
        params: Arc<ProtocolParameters>,
        cache: Arc<BlockCache>,
        seats: Arc<SeatManager>,
    ) -> Self {
        BlockGadget {
            params,
            cache,
            seats,
            block_pre_accepted: Signal::new(),
            block_accepted: Signal::new(),
            block_pre_confirmed: Signal::new(),
            block_confirmed: Signal::new(),
        }
    }

    pub fn seats(&self) -> &Arc<SeatManager> {
        &self.seats
    }

    /// Process a booked block as a vote (wired to the booker's
    /// `block_booked`).
    pub fn track_votes(&self, block: &Arc<Block>) {
        let Some(issuer) = block.issuer() else {
            return;
        };
        let Some(seat) = self.seats.committee().seat(&issuer) else {
            // Non-committee issuers carry no voting weight.
            return;
        };
        self.seats.mark_online(seat);

        // Ratification first: a seat only ratifies what was pre-accepted
        // before its vote, keeping confirmation a genuine second round.
        self.track_ratification(block, seat);
        self.track_witness(block, seat);
    }

    /// Walk the strong past cone adding `seat` as witness and evaluating
    /// the acceptance / pre-confirmation thresholds.
    fn track_witness(&self, voting_block: &Arc<Block>, seat: usize) {
        let mut stack = self.strong_parents(voting_block);
        let mut visited = BTreeSet::new();
        while let Some(block) = stack.pop() {
            if !visited.insert(block.id()) {
                continue;
            }
            if block.accepted.was_triggered() && block.pre_confirmed.was_triggered() {
                continue;
            }
            block.add_witness(seat);
            let witness_weight = self
                .seats
                .committee()
                .weight_of_seats(&block.witness_seats());

            if !block.accepted.was_triggered()
                && is_threshold_reached(
                    witness_weight,
                    self.seats.online_weight(),
                    self.params.online_quorum,
                )
            {
                // Acceptance directly follows pre-acceptance; both are
                // published parents-first.
                self.propagate(&block, &|b| &b.pre_accepted, &self.block_pre_accepted);
                self.propagate(&block, &|b| &b.accepted, &self.block_accepted);
            }
            if !block.pre_confirmed.was_triggered()
                && is_threshold_reached(
                    witness_weight,
                    self.seats.committee().total_weight(),
                    self.params.confirmation_threshold,
                )
            {
                self.propagate(&block, &|b| &b.pre_confirmed, &self.block_pre_confirmed);
            }
            stack.extend(self.strong_parents(&block));
        }
    }

    /// Walk the strong past cone adding `seat` as ratifier of blocks that
    /// were already pre-accepted, evaluating confirmation.
    fn track_ratification(&self, voting_block: &Arc<Block>, seat: usize) {
        let mut stack = self.strong_parents(voting_block);
        let mut visited = BTreeSet::new();
        while let Some(block) = stack.pop() {
            if !visited.insert(block.id()) {
                continue;
            }
            if block.confirmed.was_triggered() {
                continue;
            }
            if block.pre_accepted.was_triggered() {
                block.add_ratifier(seat);
            }
            let ratifier_weight = self
                .seats
                .committee()
                .weight_of_seats(&block.ratifier_seats());

            if block.pre_confirmed.was_triggered()
                && !block.confirmed.was_triggered()
                && is_threshold_reached(
                    ratifier_weight,
                    self.seats.committee().total_weight(),
                    self.params.confirmation_threshold,
                )
            {
                self.propagate(&block, &|b| &b.confirmed, &self.block_confirmed);
            }
            stack.extend(self.strong_parents(&block));
        }
    }

    /// Set a latching flag on `block` and every not-yet-flagged strong
    /// ancestor, publishing parents before children (post-order walk).
    fn propagate(
        &self,
        block: &Arc<Block>,
        flag: &dyn Fn(&Block) -> &Event,
        signal: &Signal<Arc<Block>>,
    ) {
        let mut emitted = BTreeSet::new();
        let mut stack = vec![(Arc::clone(block), false)];
        while let Some((current, expanded)) = stack.pop() {
            if emitted.contains(&current.id()) || flag(&current).was_triggered() {
                continue;
            }
            if expanded {
                emitted.insert(current.id());
                if flag(&current).trigger() {
                    signal.trigger(&current);
                }
            } else {
                stack.push((Arc::clone(&current), true));
                for parent in self.strong_parents(&current) {
                    if !flag(&parent).was_triggered() && !emitted.contains(&parent.id()) {
                        stack.push((parent, false));
                    }
                }
            }
        }
    }

    fn strong_parents(&self, block: &Arc<Block>) -> Vec<Arc<Block>> {
        block
            .strong_parent_ids()
            .iter()
            .filter_map(|id| self.cache.get(id))
            .filter(|parent| !parent.is_root_block())
            .collect()
    }
}
