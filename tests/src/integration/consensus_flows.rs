//! Finality, execution and slashing flows.

use crate::support::*;
use hx_network::PacketType;
use shared_types::{Bytes, Transaction, Vote, VoteType, B256, U256};
use std::time::Duration;

#[test]
fn test_two_validator_consensus_liveness() {
    // 6 + 5 eligible votes: the 2t+1 threshold of 8 needs both nodes.
    let genesis = test_genesis(&[
        TestValidator { secret: 0x10, stake: 6_000 },
        TestValidator { secret: 0x20, stake: 5_000 },
    ]);
    let router = Router::new();
    let a = build_node(0x10, &genesis, &router);
    let b = build_node(0x20, &genesis, &router);
    connect(&a, &b);
    wait_until(Duration::from_secs(2), || {
        a.network.peers_state().peer_count() == 1 && b.network.peers_state().peer_count() == 1
    });

    drive_until(&[&a, &b], 3000, || a.chain.size() >= 2 && b.chain.size() >= 2);

    // Safety: both finalized the same blocks.
    for period in 1..=2u64 {
        assert_eq!(
            a.chain.get_pbft_block(period).unwrap().hash(),
            b.chain.get_pbft_block(period).unwrap().hash(),
            "diverged at period {period}"
        );
        // The certificate carries both validators' weight.
        let cert_votes = a
            .db
            .cert_votes(&a.chain.get_pbft_block(period).unwrap().hash())
            .unwrap();
        let weight: u64 = cert_votes.iter().map(|v| v.weight()).sum();
        assert!(weight >= 8, "period {period} certificate weight {weight}");
    }

    a.network.stop();
    b.network.stop();
}

#[test]
fn test_fifty_sequential_transfers_execute() {
    let genesis = test_genesis(&[TestValidator { secret: 0x10, stake: 10_000 }]);
    let router = Router::new();
    let node = build_node(0x10, &genesis, &router);

    let sender = node.keys.clone();
    let recipient = shared_types::Address::repeat_byte(0x0E);
    let mut hashes = Vec::new();
    for nonce in 0..50u64 {
        let trx = Transaction::new(
            nonce,
            U256::ZERO,
            U256::from(1u64),
            21_000,
            Some(recipient),
            Bytes::new(),
            genesis.chain_id,
            &sender,
        )
        .unwrap();
        hashes.push(trx.hash());
        node.pool.insert_transaction(trx).unwrap();
    }

    // One proposal carries all fifty; consensus finalizes it.
    let block_hash = node.proposer.try_propose().expect("should propose");
    let dag_block = node.dag.get_dag_block(&block_hash).unwrap();
    assert_eq!(dag_block.trxs().len(), 50);

    drive_until(&[&node], 500, || node.chain.size() >= 1);

    assert_eq!(node.state.nonce(1, &sender.address()).unwrap(), 50);
    for hash in &hashes {
        let receipt = node.state.receipt(hash).expect("every trx has a receipt");
        assert!(receipt.status_ok);
        assert_eq!(node.db.transaction_period(hash).unwrap(), Some(1));
    }

    node.network.stop();
}

#[test]
fn test_double_vote_proof_jails_offender() {
    // Validator (10 votes) can finalize alone; the offender (1 vote)
    // equivocates and gets jailed through the system contract.
    let genesis = test_genesis(&[
        TestValidator { secret: 0x10, stake: 10_000 },
        TestValidator { secret: 0x30, stake: 1_000 },
    ]);
    let router = Router::new();
    let node = build_node(0x10, &genesis, &router);
    let observer = build_node(0x40, &genesis, &router);
    connect(&node, &observer);
    wait_until(Duration::from_secs(2), || {
        node.network.peers_state().peer_count() == 1
    });

    // The offender's two conflicting cert votes at the same coordinates.
    let (offender_keys, offender_vrf, _) = validator_keys(0x30);
    let proof = offender_vrf
        .prove(&Vote::sortition_message(1, 1, 3))
        .unwrap();
    let vote_a = Vote::new(B256::repeat_byte(0x01), VoteType::Cert, 1, 1, 3, &proof, &offender_keys)
        .unwrap();
    let vote_b = Vote::new(B256::repeat_byte(0x02), VoteType::Cert, 1, 1, 3, &proof, &offender_keys)
        .unwrap();

    // Relayed through the network path by the observer.
    for vote in [&vote_a, &vote_b] {
        let packet = hx_network::messages::VotePacket::vote_only(vote.clone());
        node.network.receive_packet(
            observer.node_id,
            PacketType::Vote as u8,
            alloy_rlp::encode(&packet),
        );
    }

    // The slashing proof transaction lands in the pool.
    wait_until(Duration::from_secs(2), || node.pool.pool_size() == 1);
    // The relay is not the offender: still connected, not malicious.
    assert!(!node.network.peers_state().is_malicious(&observer.node_id));

    // Propose and finalize a period carrying the proof.
    node.proposer.try_propose().expect("proof gets packed");
    drive_until(&[&node], 500, || node.chain.size() >= 1);

    assert!(!node
        .state
        .dpos_is_eligible(1, &offender_keys.address())
        .unwrap());
    // The honest validator is untouched.
    assert!(node.state.dpos_is_eligible(1, &node.keys.address()).unwrap());

    node.network.stop();
    observer.network.stop();
}

#[test]
fn test_vote_from_non_validator_marks_peer_malicious() {
    let genesis = test_genesis(&[TestValidator { secret: 0x10, stake: 10_000 }]);
    let router = Router::new();
    let a = build_node(0x10, &genesis, &router);
    let b = build_node(0x40, &genesis, &router);
    connect(&a, &b);
    wait_until(Duration::from_secs(2), || {
        a.network.peers_state().peer_count() == 1
    });

    // A vote signed by a key with no stake at all: demonstrably forged.
    let (stranger_keys, stranger_vrf, _) = validator_keys(0x77);
    let proof = stranger_vrf
        .prove(&Vote::sortition_message(1, 1, 3))
        .unwrap();
    let forged = Vote::new(B256::repeat_byte(0x01), VoteType::Cert, 1, 1, 3, &proof, &stranger_keys)
        .unwrap();
    let packet = hx_network::messages::VotePacket::vote_only(forged);
    a.network.receive_packet(
        b.node_id,
        PacketType::Vote as u8,
        alloy_rlp::encode(&packet),
    );

    wait_until(Duration::from_secs(2), || {
        a.network.peers_state().is_malicious(&b.node_id)
    });
    assert_eq!(a.network.peers_state().peer_count(), 0);

    a.network.stop();
    b.network.stop();
}
