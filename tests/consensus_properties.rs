//! Consensus property tests: the structural invariants of the pipeline.
//!
//! These tests exercise the public API end to end and then check the
//! invariants that underpin safety:
//! - acceptance is topologically monotonic along strong parents;
//! - transaction acceptance implies accepted inputs, an uncontested (or
//!   won) spend and a non-zero inclusion slot;
//! - of two spenders of one state, at most one is ever accepted and the
//!   other is rejected;
//! - commitment verification implies parent verification implies
//!   solidity;
//! - finalization only happens at or above the weight threshold;
//! - warp-sync block sets verify against the commitment's tangle root;
//! - tip pools are monotonic and strong tips are eligible and unorphaned.

use std::sync::Arc;

use ed25519_dalek::{Signer, SigningKey};

use meridian::block::{BlockHeader, BlockId, Payload, ProtocolBlock};
use meridian::chains::ChainManager;
use meridian::commitment::{self, Commitment};
use meridian::committee::{account_id, AccountId, Committee, CommitteeMember, Signature};
use meridian::config::ProtocolParameters;
use meridian::engine::Engine;
use meridian::ledger::{LedgerState, Output, StateRef, Transaction};
use meridian::notarization;
use meridian::storage::Store;
use meridian::tips::{TipManager, TipPool};
use meridian::SlotIndex;

// ── Helpers ─────────────────────────────────────────────────────────────

struct Validator {
    key: SigningKey,
    account: AccountId,
}

fn make_validators(count: usize, weight: u64) -> (Vec<Validator>, Committee) {
    let mut validators = Vec::new();
    let mut members = Vec::new();
    for i in 0..count {
        let key = SigningKey::from_bytes(&[i as u8 + 1; 32]);
        let key_bytes = key.verifying_key().to_bytes();
        let account = account_id(&key_bytes);
        members.push(CommitteeMember {
            account,
            key_bytes,
            weight,
        });
        validators.push(Validator { key, account });
    }
    (validators, Committee::new(members))
}

fn test_params() -> Arc<ProtocolParameters> {
    Arc::new(ProtocolParameters {
        genesis_unix_ms: 0,
        slot_duration_ms: 10,
        min_committable_age: 1,
        max_committable_age: 6,
        ..Default::default()
    })
}

fn bootstrap_engine(
    params: &Arc<ProtocolParameters>,
    committee: Committee,
    genesis_states: Vec<LedgerState>,
) -> Arc<Engine> {
    let store = Store::open_temporary().unwrap();
    Engine::bootstrap(store, Arc::clone(params), committee, genesis_states).unwrap()
}

fn issue_block(
    engine: &Arc<Engine>,
    validator: &Validator,
    slot: SlotIndex,
    strong_parents: Vec<BlockId>,
    payload: Payload,
) -> ProtocolBlock {
    let mut block = ProtocolBlock {
        header: BlockHeader {
            protocol_version: engine.params.version,
            issuer: validator.account,
            issuing_time_ms: engine.params.slot_start_time(slot) + 5,
            slot_commitment_id: engine.latest_commitment().id(),
            latest_finalized_slot: engine.latest_finalized_slot(),
            strong_parents,
            weak_parents: vec![],
            shallow_like_parents: vec![],
        },
        payload,
        signature: Signature::empty(),
    };
    block.signature = Signature(
        validator
            .key
            .sign(&block.sign_data().unwrap())
            .to_bytes()
            .to_vec(),
    );
    block
}

fn validation_payload() -> Payload {
    Payload::Validation {
        highest_supported_version: 1,
    }
}

/// Run an alternating two-validator chain and return the issued blocks.
fn run_chain(
    engine: &Arc<Engine>,
    validators: &[Validator],
    last_slot: SlotIndex,
) -> Vec<BlockId> {
    let mut parent = BlockId::root(&engine.latest_commitment().id());
    let mut issued = Vec::new();
    for slot in 1..=last_slot {
        let validator = &validators[(slot as usize - 1) % validators.len()];
        let block = issue_block(engine, validator, slot, vec![parent], validation_payload());
        let appended = engine.process_block(block).unwrap();
        parent = appended.id();
        issued.push(appended.id());
    }
    issued
}

// ── Invariant 1: acceptance topological monotonicity ────────────────────

#[test]
fn accepted_blocks_have_accepted_strong_parents() {
    let params = test_params();
    let (validators, committee) = make_validators(2, 50);
    let engine = bootstrap_engine(&params, committee, vec![]);
    let issued = run_chain(&engine, &validators, 13);

    let mut accepted_count = 0;
    for id in &issued {
        let Some(block) = engine.cache.get(id) else {
            continue;
        };
        if !block.accepted.was_triggered() {
            continue;
        }
        accepted_count += 1;
        for parent_id in block.strong_parent_ids() {
            let parent = engine.cache.get(&parent_id).expect("parent cached");
            assert!(
                parent.accepted.was_triggered(),
                "accepted block {id} has unaccepted strong parent {parent_id}"
            );
        }
    }
    assert!(accepted_count > 0, "scenario produced no accepted blocks");
}

// ── Invariants 2 & 3: transaction acceptance and double spends ──────────

#[test]
fn accepted_transactions_satisfy_acceptance_conditions() {
    let params = test_params();
    let (validators, committee) = make_validators(2, 50);
    let genesis_output = LedgerState::new([0u8; 32], 0, Output {
        amount: 100,
        owner: [0u8; 32],
    });
    let engine = bootstrap_engine(&params, committee, vec![genesis_output.clone()]);

    let spend = |uniquifier: u64| Transaction {
        inputs: vec![StateRef {
            source_transaction: genesis_output.created_by,
            index: 0,
        }],
        outputs: vec![Output {
            amount: 100,
            owner: [uniquifier as u8; 32],
        }],
        creation_time_ms: uniquifier,
    };
    let tx_a = spend(1);
    let tx_b = spend(2);

    let anchor = BlockId::root(&engine.latest_commitment().id());
    let block_a = issue_block(
        &engine,
        &validators[0],
        1,
        vec![anchor],
        Payload::Transaction(tx_a.clone()),
    );
    let a_id = engine.process_block(block_a).unwrap().id();
    let block_b = issue_block(
        &engine,
        &validators[1],
        1,
        vec![a_id],
        Payload::Transaction(tx_b.clone()),
    );
    let mut parent = engine.process_block(block_b).unwrap().id();
    for slot in 2..=4u64 {
        let validator = &validators[(slot as usize - 1) % 2];
        let block = issue_block(&engine, validator, slot, vec![parent], validation_payload());
        parent = engine.process_block(block).unwrap().id();
    }

    let meta_a = engine.mempool.transaction(&tx_a.id()).unwrap();
    let meta_b = engine.mempool.transaction(&tx_b.id()).unwrap();

    // Invariant 2: the accepted spender satisfies all three conditions.
    assert!(meta_a.accepted.get());
    assert!(meta_a.all_inputs_accepted.get());
    assert!(meta_a.is_conflict_accepted());
    assert_ne!(meta_a.earliest_included_slot.get(), 0);

    // Invariant 3: the rival is not accepted and is rejected.
    assert!(!meta_b.accepted.get());
    assert!(meta_b.rejected.was_triggered());

    // The contested state records exactly one accepted spender.
    let input_state = engine
        .mempool
        .state(&tx_a.inputs[0].state_id())
        .expect("contested state tracked");
    assert_eq!(input_state.accepted_spender(), Some(tx_a.id()));
    assert!(input_state.is_double_spent());
}

// ── Invariant 4: verified ⇒ parent-verified ⇒ solid ─────────────────────

#[test]
fn verification_implies_parent_verification_implies_solidity() {
    let params = test_params();
    let genesis = Commitment::genesis(&params);
    let manager = ChainManager::new(Arc::clone(&params), genesis.clone());

    let mut previous = genesis;
    let mut metadata = Vec::new();
    for slot in 1..=4u64 {
        let commitment = Commitment {
            protocol_version: 1,
            slot,
            previous_commitment_id: previous.id(),
            roots_id: [slot as u8; 32],
            cumulative_weight: slot * 10,
            reference_mana_cost: 1,
        };
        metadata.push(manager.process_commitment(commitment.clone()));
        previous = commitment;
    }

    // Verify the tip: the invariant must hold for every commitment.
    metadata.last().unwrap().verified.trigger();
    for entry in &metadata {
        if entry.verified.was_triggered() {
            assert!(entry.parent_verified.was_triggered());
        }
        if entry.parent_verified.was_triggered() {
            assert!(entry.solid.was_triggered());
        }
    }
    assert!(metadata[3].verified.was_triggered());
    assert!(metadata[3].parent_verified.was_triggered());
    assert!(metadata[3].solid.was_triggered());
}

// ── Invariant 5: finalization weight threshold ──────────────────────────

#[test]
fn finalization_only_with_supermajority_votes() {
    let params = test_params();
    let (validators, committee) = make_validators(2, 50);
    let engine = bootstrap_engine(&params, committee, vec![]);
    let issued = run_chain(&engine, &validators, 13);

    let finalized = engine.latest_finalized_slot();
    assert_eq!(finalized, 5);

    // At the moment slot 5 finalized, both validators (the full committee
    // weight) had ratified-confirmed blocks attesting commitments at or
    // past slot 5.
    let mut attestor_weight = 0u64;
    for validator in &validators {
        let voted_past_threshold = issued.iter().any(|id| {
            engine
                .cache
                .get(id)
                .filter(|block| block.confirmed.was_triggered())
                .and_then(|block| {
                    let header = block.header()?;
                    Some(
                        header.issuer == validator.account
                            && header.slot_commitment_id.slot >= finalized,
                    )
                })
                .unwrap_or(false)
        });
        if voted_past_threshold {
            attestor_weight += 50;
        }
    }
    assert!(
        attestor_weight as f64 >= 100.0 * params.finalization_threshold,
        "finalized without threshold weight"
    );
}

// ── Invariant 6: warp-sync Merkle verification ──────────────────────────

#[test]
fn committed_block_sets_verify_against_tangle_root() {
    let params = test_params();
    let (validators, committee) = make_validators(2, 50);
    let engine = bootstrap_engine(&params, committee, vec![]);
    run_chain(&engine, &validators, 13);

    for slot in 1..=engine.latest_commitment().slot {
        let committed = engine.committed_slot(slot).unwrap().unwrap();
        let id_set = committed.block_ids.iter().copied().collect();
        let tangle_root = notarization::tangle_root(&id_set);

        // The recomputed root is a member of the commitment's roots.
        assert_eq!(tangle_root, committed.roots.tangle_root);
        assert!(commitment::verify_tangle_root(
            &tangle_root,
            &committed.roots.tangle_proof(),
            &committed.commitment.roots_id,
        ));

        // A tampered block set does not verify.
        let mut tampered = id_set.clone();
        tampered.insert(BlockId {
            slot,
            hash: [0xAB; 32],
        });
        assert!(!commitment::verify_tangle_root(
            &notarization::tangle_root(&tampered),
            &committed.roots.tangle_proof(),
            &committed.commitment.roots_id,
        ));
    }
}

// ── Invariant 7: tip monotonicity ───────────────────────────────────────

#[test]
fn strong_tips_are_eligible_and_unorphaned() {
    let params = test_params();
    let (validators, committee) = make_validators(2, 50);
    let engine = bootstrap_engine(&params, committee, vec![]);
    run_chain(&engine, &validators, 8);

    let strong = engine.tips.strong_tips();
    assert!(!strong.is_empty());
    for tip in strong {
        assert_eq!(tip.tip_pool.get(), TipPool::Strong);
        assert!(!tip.is_orphaned.get());
        assert!(!tip.strongly_referenced_by_tips.get());
    }

    // Selection returns at least the freshest strong tip.
    let selection = engine.tips.select_tips(2, 2);
    assert!(!selection.strong.is_empty());
}

#[test]
fn tip_pool_promotion_is_monotonic() {
    let manager = TipManager::new();
    let block = {
        let protocol_block = ProtocolBlock {
            header: BlockHeader {
                protocol_version: 1,
                issuer: [1u8; 32],
                issuing_time_ms: 15,
                slot_commitment_id: Default::default(),
                latest_finalized_slot: 0,
                strong_parents: vec![BlockId::default()],
                weak_parents: vec![],
                shallow_like_parents: vec![],
            },
            payload: validation_payload(),
            signature: Signature::empty(),
        };
        Arc::new(meridian::block::Block::new(
            BlockId {
                slot: 2,
                hash: [1u8; 32],
            },
            protocol_block,
        ))
    };
    let metadata = manager.add_block(block, TipPool::Weak);
    assert_eq!(metadata.tip_pool.get(), TipPool::Weak);

    // Promotion sticks, regression is ignored.
    metadata.set_tip_pool(TipPool::Dropped);
    assert_eq!(metadata.tip_pool.get(), TipPool::Dropped);
    metadata.set_tip_pool(TipPool::Weak);
    assert_eq!(metadata.tip_pool.get(), TipPool::Dropped);
}
