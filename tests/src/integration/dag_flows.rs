//! DAG propagation and ordering flows across wired nodes.

use crate::support::*;
use hx_network::PacketType;
use shared_crypto::vdf::VdfSortition;
use shared_types::{BlockHash, DagBlock, Level};
use std::time::Duration;

fn genesis_single_validator() -> shared_types::GenesisConfig {
    test_genesis(&[TestValidator {
        secret: 0x10,
        stake: 10_000,
    }])
}

/// A DAG block by the validator that passes full verification.
fn make_block(
    node: &TestNode,
    genesis: &shared_types::GenesisConfig,
    pivot: BlockHash,
    level: Level,
    tips: Vec<BlockHash>,
) -> DagBlock {
    let params = genesis.vdf_params();
    // All stake is the validator's: 10 votes of 10 total.
    let mut vdf = VdfSortition::new(
        &params,
        &node.vrf_keys,
        &DagBlock::vrf_input(&shared_types::B256::ZERO, level),
        10,
        10,
    )
    .unwrap();
    vdf.solve(&DagBlock::vdf_message(&pivot, &[]));
    DagBlock::new(pivot, level, level, tips, vec![], 0, vdf, &node.keys).unwrap()
}

/// The 7-vertex / 8-edge shape: pivot chain b1..b5 plus b6 referencing
/// b3 as pivot and b4, b5 as tips.
fn build_seven_block_dag(
    node: &TestNode,
    genesis: &shared_types::GenesisConfig,
) -> Vec<DagBlock> {
    let g = genesis.genesis_hash();
    let b1 = make_block(node, genesis, g, 1, vec![]);
    let b2 = make_block(node, genesis, b1.hash(), 2, vec![]);
    let b3 = make_block(node, genesis, b2.hash(), 3, vec![]);
    let b4 = make_block(node, genesis, b3.hash(), 4, vec![]);
    let b5 = make_block(node, genesis, b4.hash(), 5, vec![]);
    let b6 = make_block(node, genesis, b3.hash(), 6, vec![b4.hash(), b5.hash()]);
    vec![b1, b2, b3, b4, b5, b6]
}

#[test]
fn test_gossiped_blocks_reach_connected_peer() {
    let genesis = genesis_single_validator();
    let router = Router::new();
    let a = build_node(0x10, &genesis, &router);
    let b = build_node(0x40, &genesis, &router);
    connect(&a, &b);
    wait_until(Duration::from_secs(2), || {
        a.network.peers_state().peer_count() == 1 && b.network.peers_state().peer_count() == 1
    });

    // Insertion order on A; gossip carries each block to B as it lands.
    for block in build_seven_block_dag(&a, &genesis) {
        a.dag.add_dag_block(block, vec![], true, true).unwrap();
    }

    wait_until(Duration::from_secs(5), || b.dag.dag_size() == (7, 8));
    assert_eq!(a.dag.dag_size(), (7, 8));

    a.network.stop();
    b.network.stop();
}

#[test]
fn test_missing_parents_recovered_via_dag_sync() {
    let genesis = genesis_single_validator();
    let router = Router::new();
    let a = build_node(0x10, &genesis, &router);

    // A holds the whole DAG before B ever connects.
    let blocks = build_seven_block_dag(&a, &genesis);
    for block in &blocks {
        a.dag.add_dag_block(block.clone(), vec![], false, true).unwrap();
    }

    let b = build_node(0x40, &genesis, &router);
    connect(&a, &b);
    wait_until(Duration::from_secs(2), || {
        a.network.peers_state().peer_count() == 1 && b.network.peers_state().peer_count() == 1
    });

    // Deliver only the newest block; every parent is missing on B, which
    // must fall back to a DAG sync round with A.
    let tip = blocks.last().unwrap().clone();
    let packet = hx_network::messages::DagBlockPacket {
        block: tip,
        transactions: vec![],
    };
    b.network.receive_packet(
        a.node_id,
        PacketType::DagBlock as u8,
        alloy_rlp::encode(&packet),
    );

    wait_until(Duration::from_secs(5), || b.dag.dag_size() == (7, 8));

    a.network.stop();
    b.network.stop();
}

#[test]
fn test_converged_nodes_agree_on_anchor_order() {
    let genesis = genesis_single_validator();
    let router = Router::new();
    let a = build_node(0x10, &genesis, &router);
    let b = build_node(0x40, &genesis, &router);
    connect(&a, &b);
    wait_until(Duration::from_secs(2), || {
        a.network.peers_state().peer_count() == 1 && b.network.peers_state().peer_count() == 1
    });

    let blocks = build_seven_block_dag(&a, &genesis);
    let anchor = blocks.last().unwrap().hash();
    for block in blocks {
        a.dag.add_dag_block(block, vec![], true, true).unwrap();
    }
    wait_until(Duration::from_secs(5), || b.dag.dag_size() == (7, 8));

    let order_a = a.dag.get_dag_block_order(&anchor, 1);
    let order_b = b.dag.get_dag_block_order(&anchor, 1);
    assert_eq!(order_a.len(), 6);
    assert_eq!(order_a, order_b);

    // Idempotent on both sides.
    assert_eq!(order_a, a.dag.get_dag_block_order(&anchor, 1));

    a.network.stop();
    b.network.stop();
}

#[test]
fn test_chain_sync_from_scratch() {
    let genesis = genesis_single_validator();
    let router = Router::new();
    let a = build_node(0x10, &genesis, &router);

    // A finalizes a few periods on its own.
    drive_until(&[&a], 500, || a.chain.size() >= 3);

    // B joins with an empty database and pulls the chain.
    let b = build_node(0x40, &genesis, &router);
    connect(&a, &b);
    wait_until(Duration::from_secs(2), || {
        b.network.peers_state().peer_count() == 1
    });
    b.network.periodic();

    drive_until(&[&b], 1000, || b.chain.size() >= 3);
    assert_eq!(
        b.chain.get_pbft_block(3).unwrap().hash(),
        a.chain.get_pbft_block(3).unwrap().hash()
    );
    assert_eq!(b.state.last_block_number(), b.chain.size());

    a.network.stop();
    b.network.stop();
}
