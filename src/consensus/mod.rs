//! Consensus gadgets: weighted voting over the block DAG.
//!
//! Two stages share the committee's seat weights:
//!
//! 1. **Block gadget** — per-block acceptance and confirmation through
//!    witness and ratification walks along strong parents.
//! 2. **Slot gadget** — slot finalization once the weight of issuers
//!    attesting to a commitment at or past a slot crosses the
//!    finalization threshold.
//!
//! Acceptance feeds notarization (slot commitments); finalization advances
//! the root-commitment window and drives eviction and pruning.

pub mod block_gadget;
pub mod slot_gadget;

pub use block_gadget::BlockGadget;
pub use slot_gadget::SlotGadget;
