//! Integration tests for gossip dissemination across an in-memory mesh.

mod common;

use common::{Delivery, Mesh, START_MS, outsider, record_gossip};
use hivemesh::{Admission, GossipOutcome, MessageData, Violation};

// =============================================================================
// Test: exactly-once delivery in a fully connected mesh
// =============================================================================

#[test]
fn four_node_mesh_delivers_exactly_once() {
    let mut mesh = Mesh::new(4);
    mesh.connect_all();
    let inboxes: Vec<_> = mesh.nodes.iter_mut().map(record_gossip).collect();

    let sent = mesh.nodes[0].broadcast("gossip", &"hello mesh".into(), Some(2)).unwrap();
    assert_eq!(sent, 3);

    let log = mesh.pump();
    assert!(inboxes[0].lock().unwrap().is_empty(), "originator must not deliver to itself");
    for inbox in &inboxes[1..] {
        let inbox = inbox.lock().unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].sender_id, mesh.id(0));
        assert_eq!(inbox[0].data, MessageData::from("hello mesh"));
    }

    let duplicates = log
        .iter()
        .filter(|(_, d)| matches!(d, Delivery::Gossip(GossipOutcome::Duplicate)))
        .count();
    assert!(duplicates > 0, "relays should have met already-seen copies");
    assert!(
        log.iter().all(|(_, d)| !matches!(d, Delivery::Gossip(GossipOutcome::Rejected(_)))),
        "honest relays must never be rejected"
    );
}

#[test]
fn hop_budget_limits_reach_on_a_line() {
    let mut mesh = Mesh::new(5);
    for i in 0..4 {
        mesh.connect(i, i + 1);
    }
    let inboxes: Vec<_> = mesh.nodes.iter_mut().map(record_gossip).collect();

    mesh.nodes[0].broadcast("gossip", &"short reach".into(), Some(2)).unwrap();
    mesh.pump();

    let received: Vec<usize> = inboxes.iter().map(|i| i.lock().unwrap().len()).collect();
    // Hops 2 at node 1, 1 at node 2, 0 at node 3 which does not forward.
    assert_eq!(received, vec![0, 1, 1, 1, 0]);
}

#[test]
fn relays_reward_honest_neighbors() {
    let mut mesh = Mesh::new(3);
    mesh.connect(0, 1);
    mesh.connect(1, 2);

    mesh.nodes[0].broadcast("peer_connected", &"joined".into(), None).unwrap();
    mesh.pump();

    assert!(mesh.nodes[1].trust_balance(&mesh.id(0)) > 0);
    assert!(mesh.nodes[2].trust_balance(&mesh.id(1)) > 0);
    assert!(mesh.nodes.iter().all(|n| n.banished_peers().is_empty()));
}

#[test]
fn expired_messages_are_not_delivered() {
    let mut mesh = Mesh::new(2);
    mesh.connect(0, 1);
    let inbox = record_gossip(&mut mesh.nodes[1]);

    mesh.nodes[0].broadcast("gossip", &"late".into(), None).unwrap();
    mesh.clock.advance(5 * 60 * 1_000);
    let log = mesh.pump();

    assert!(matches!(log[0].1, Delivery::Gossip(GossipOutcome::Expired)));
    assert!(inbox.lock().unwrap().is_empty());
}

// =============================================================================
// Test: flooding peer gets banished
// =============================================================================

#[test]
fn flooding_peer_is_banished_and_then_ignored() {
    let mut mesh = Mesh::new(1);
    let inbox = record_gossip(&mut mesh.nodes[0]);
    let flooder = outsider();
    let x = flooder.self_id().clone();

    let filler = "x".repeat(6_000);
    let outcomes: Vec<GossipOutcome> = (0..50)
        .map(|i| {
            let data = MessageData::from(format!("{i}:{filler}"));
            let frame = flooder.encode_gossip("gossip", &data, 3, &[], START_MS).unwrap();
            mesh.nodes[0].handle_incoming_gossip(&x, &frame)
        })
        .collect();

    let flood_at = outcomes
        .iter()
        .position(|o| *o == GossipOutcome::Flood)
        .expect("byte cap should be hit within 50 frames");
    assert!(flood_at > 0);
    assert!(outcomes[..flood_at].iter().all(|o| matches!(o, GossipOutcome::Delivered { .. })));
    assert!(outcomes[flood_at + 1..].iter().all(|o| *o == GossipOutcome::Banished));

    assert!(mesh.nodes[0].is_banished(&x));
    assert_eq!(mesh.nodes[0].banished_peers(), vec![x]);
    assert_eq!(inbox.lock().unwrap().len(), flood_at);
}

#[test]
fn ban_recovers_after_enough_ticks() {
    let mut mesh = Mesh::new(1);
    let flooder = outsider();
    let x = flooder.self_id().clone();
    let tampered = {
        let mut frame = flooder.encode_gossip("gossip", &"forged".into(), 3, &[], START_MS).unwrap();
        frame[20] ^= 0xff;
        frame
    };

    let outcome = mesh.nodes[0].handle_incoming_gossip(&x, &tampered);
    assert_eq!(outcome, GossipOutcome::Rejected(Admission::Rejected(Violation::InvalidSignature)));
    let balance = mesh.nodes[0].trust_balance(&x);
    assert!(balance < 0);

    let recovery = mesh.nodes[0].arbiter().config().recovery_step;
    let ticks = balance.unsigned_abs().div_ceil(recovery as u64);
    for _ in 0..ticks {
        assert!(mesh.nodes[0].is_banished(&x));
        mesh.nodes[0].tick();
    }
    assert_eq!(mesh.nodes[0].trust_balance(&x), 0);
    assert!(!mesh.nodes[0].is_banished(&x));
}
