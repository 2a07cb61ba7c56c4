//! Handshake, status and peer-policy flows.

use crate::support::*;
use hx_network::PacketType;
use std::time::Duration;

#[test]
fn test_handshake_promotes_both_sides() {
    let genesis = test_genesis(&[TestValidator { secret: 0x10, stake: 10_000 }]);
    let router = Router::new();
    let a = build_node(0x10, &genesis, &router);
    let b = build_node(0x40, &genesis, &router);

    connect(&a, &b);
    wait_until(Duration::from_secs(2), || {
        a.network.peers_state().peer_count() == 1 && b.network.peers_state().peer_count() == 1
    });

    // Status carried the remote chain view.
    let peer = a.network.peers_state().get(&b.node_id).unwrap();
    assert_eq!(
        peer.pbft_chain_size
            .load(std::sync::atomic::Ordering::Relaxed),
        0
    );

    a.network.stop();
    b.network.stop();
}

#[test]
fn test_incompatible_genesis_not_peered() {
    let genesis_a = test_genesis(&[TestValidator { secret: 0x10, stake: 10_000 }]);
    let mut genesis_b = test_genesis(&[TestValidator { secret: 0x10, stake: 10_000 }]);
    genesis_b.chain_id = 999;

    let router = Router::new();
    let a = build_node(0x10, &genesis_a, &router);
    let b = build_node(0x40, &genesis_b, &router);

    connect(&a, &b);
    std::thread::sleep(Duration::from_millis(300));

    assert_eq!(a.network.peers_state().peer_count(), 0);
    assert_eq!(b.network.peers_state().peer_count(), 0);

    a.network.stop();
    b.network.stop();
}

#[test]
fn test_garbage_payload_disconnects_peer() {
    let genesis = test_genesis(&[TestValidator { secret: 0x10, stake: 10_000 }]);
    let router = Router::new();
    let a = build_node(0x10, &genesis, &router);
    let b = build_node(0x40, &genesis, &router);
    connect(&a, &b);
    wait_until(Duration::from_secs(2), || {
        a.network.peers_state().peer_count() == 1
    });

    a.network.receive_packet(
        b.node_id,
        PacketType::Vote as u8,
        vec![0xDE, 0xAD, 0xBE, 0xEF],
    );

    wait_until(Duration::from_secs(2), || {
        a.network.peers_state().peer_count() == 0
    });
    // Bad protocol is a disconnect, not a ban.
    assert!(!a.network.peers_state().is_malicious(&b.node_id));

    a.network.stop();
    b.network.stop();
}

#[test]
fn test_unknown_packet_type_disconnects_peer() {
    let genesis = test_genesis(&[TestValidator { secret: 0x10, stake: 10_000 }]);
    let router = Router::new();
    let a = build_node(0x10, &genesis, &router);
    let b = build_node(0x40, &genesis, &router);
    connect(&a, &b);
    wait_until(Duration::from_secs(2), || {
        a.network.peers_state().peer_count() == 1
    });

    a.network.receive_packet(b.node_id, 0xEE, vec![]);

    wait_until(Duration::from_secs(2), || {
        a.network.peers_state().peer_count() == 0
    });

    a.network.stop();
    b.network.stop();
}

#[test]
fn test_transaction_gossip_reaches_peer_pool() {
    let genesis = test_genesis(&[TestValidator { secret: 0x10, stake: 10_000 }]);
    let router = Router::new();
    let a = build_node(0x10, &genesis, &router);
    let b = build_node(0x40, &genesis, &router);
    connect(&a, &b);
    wait_until(Duration::from_secs(2), || {
        a.network.peers_state().peer_count() == 1 && b.network.peers_state().peer_count() == 1
    });

    let trx = shared_types::Transaction::new(
        0,
        shared_types::U256::from(1u64),
        shared_types::U256::from(2u64),
        21_000,
        Some(shared_types::Address::repeat_byte(0x01)),
        shared_types::Bytes::new(),
        genesis.chain_id,
        &a.keys,
    )
    .unwrap();
    a.pool.insert_transaction(trx.clone()).unwrap();
    a.network.gossip_transactions(&[trx.clone()]);

    wait_until(Duration::from_secs(2), || b.pool.contains(&trx.hash()));

    a.network.stop();
    b.network.stop();
}
