//! Integration tests for unicast discovery, relaying and re-routing.

mod common;

use common::{Delivery, Mesh, record_unicast};
use hivemesh::{MessageData, UnicastMessage, UnicastOutcome, verify_signature};

const A: usize = 0;
const B: usize = 1;
const C: usize = 2;
const E: usize = 3;

fn unicast_outcomes(log: &[(common::Frame, Delivery)]) -> Vec<UnicastOutcome> {
    log.iter()
        .filter_map(|(_, d)| match d {
            Delivery::Unicast(outcome) => Some(outcome.clone()),
            Delivery::Gossip(_) => None,
        })
        .collect()
}

// =============================================================================
// Test: three-node chain
// =============================================================================

#[test]
fn chain_discovers_path_through_relay() {
    let mut mesh = Mesh::new(3);
    mesh.connect(A, B);
    mesh.connect(B, C);
    let inbox = record_unicast(&mut mesh.nodes[C]);

    let target = mesh.id(C);
    assert!(mesh.nodes[A].send_unicast(&target, "message", &"hi".into(), None).unwrap());

    let log = mesh.pump();
    assert_eq!(
        unicast_outcomes(&log),
        vec![UnicastOutcome::Relayed { next: mesh.id(C) }, UnicastOutcome::Delivered]
    );
    assert_eq!(log.iter().filter(|(f, _)| f.from == mesh.id(B)).count(), 1);

    let inbox = inbox.lock().unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].sender_id, mesh.id(A));
    assert_eq!(inbox[0].route, vec![mesh.id(A), mesh.id(B), mesh.id(C)]);
    assert_eq!(inbox[0].data, MessageData::from("hi"));
}

#[test]
fn typed_subscribers_only_see_their_type() {
    let mut mesh = Mesh::new(2);
    mesh.connect(A, B);
    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    mesh.nodes[B].on_type("handshake", move |m| sink.lock().unwrap().push(m.kind.clone()));

    let target = mesh.id(B);
    mesh.nodes[A].send_unicast(&target, "message", &"ignored".into(), None).unwrap();
    mesh.nodes[A].send_unicast(&target, "handshake", &MessageData::json(&[1, 2, 3]).unwrap(), None).unwrap();
    mesh.pump();

    assert_eq!(*seen.lock().unwrap(), vec!["handshake".to_string()]);
}

#[test]
fn unknown_target_goes_blind_through_a_neighbor() {
    let mut mesh = Mesh::new(3);
    // The wire link B-C exists but nobody has gossiped it yet.
    mesh.connect(A, B);
    mesh.wire.link(&mesh.id(B), &mesh.id(C));
    let inbox = record_unicast(&mut mesh.nodes[C]);

    let target = mesh.id(C);
    assert!(mesh.nodes[A].send_unicast(&target, "message", &"blind".into(), None).unwrap());
    mesh.pump();
    assert_eq!(inbox.lock().unwrap().len(), 1);
}

#[test]
fn unreachable_target_is_a_false_return() {
    let mut mesh = Mesh::new(3);
    mesh.connect(B, C);
    let target = mesh.id(C);
    assert!(!mesh.nodes[A].send_unicast(&target, "message", &"nowhere".into(), None).unwrap());
    assert_eq!(mesh.wire.pending(), 0);
}

// =============================================================================
// Test: re-routing around a dead hop
// =============================================================================

/// A-B, B-E and E-C are live. B-C is known to everyone but the link is down.
fn detour_mesh() -> Mesh {
    let mesh = Mesh::new(4);
    mesh.connect(A, B);
    mesh.connect(B, C);
    mesh.connect(B, E);
    mesh.connect(E, C);
    mesh.cut(B, C);
    mesh
}

#[test]
fn relay_reroutes_around_dead_hop_and_both_signatures_verify() {
    let mut mesh = detour_mesh();
    let inbox = record_unicast(&mut mesh.nodes[C]);

    let target = mesh.id(C);
    assert!(mesh.nodes[A].send_unicast(&target, "message", &"detour".into(), None).unwrap());
    let log = mesh.pump();

    assert_eq!(
        unicast_outcomes(&log),
        vec![
            UnicastOutcome::Rerouted { next: mesh.id(E) },
            UnicastOutcome::Relayed { next: mesh.id(C) },
            UnicastOutcome::Delivered,
        ]
    );

    let (patched, _) = log.iter().find(|(f, _)| f.to == mesh.id(C)).unwrap();
    let decoded = mesh.nodes[C].codec().decode_unicast(&patched.bytes).unwrap();
    let UnicastMessage::Rerouted { message, patch } = &decoded else {
        panic!("frame reaching C should carry a re-route patch");
    };
    assert_eq!(message.route, vec![mesh.id(A), mesh.id(B), mesh.id(C)]);
    assert_eq!(patch.rerouter_id, mesh.id(B));
    assert_eq!(patch.new_route, vec![mesh.id(B), mesh.id(E), mesh.id(C)]);

    // The sender's signature still covers only the original frame.
    let original = &patched.bytes[..message.expected_end];
    assert!(verify_signature(&message.pubkey, &original[..message.signature_start], &message.signature));
    assert!(verify_signature(
        &patch.rerouter_pubkey,
        &patched.bytes[..patch.signature_start],
        &patch.signature
    ));

    let inbox = inbox.lock().unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].sender_id, mesh.id(A));
}

#[test]
fn second_reroute_is_refused_without_penalties() {
    let mut mesh = detour_mesh();
    mesh.cut(E, C);
    let inbox = record_unicast(&mut mesh.nodes[C]);

    // The sender only learns that its first hop accepted the frame.
    let target = mesh.id(C);
    assert!(mesh.nodes[A].send_unicast(&target, "message", &"doomed".into(), None).unwrap());
    let log = mesh.pump();

    assert_eq!(
        unicast_outcomes(&log),
        vec![UnicastOutcome::Rerouted { next: mesh.id(E) }, UnicastOutcome::Undeliverable]
    );
    assert!(inbox.lock().unwrap().is_empty());
    assert!(!mesh.nodes[E].is_banished(&mesh.id(B)));
    assert!(mesh.nodes[E].trust_balance(&mesh.id(B)) > 0);
}

#[test]
fn relay_never_bounces_a_frame_back_to_its_sender() {
    let mut mesh = Mesh::new(3);
    // A only knows B. B has no link to C and no other neighbor to try.
    mesh.connect(A, B);
    let inbox = record_unicast(&mut mesh.nodes[C]);

    let target = mesh.id(C);
    assert!(mesh.nodes[A].send_unicast(&target, "message", &"lost".into(), None).unwrap());
    let log = mesh.pump();

    assert_eq!(unicast_outcomes(&log), vec![UnicastOutcome::Undeliverable]);
    assert!(log.iter().all(|(f, _)| f.to != mesh.id(A)));
    assert!(inbox.lock().unwrap().is_empty());
    assert!(!mesh.nodes[A].is_banished(&mesh.id(B)));
    assert_eq!(mesh.nodes[A].trust_balance(&mesh.id(B)), 0);
}

// =============================================================================
// Test: route integrity
// =============================================================================

#[test]
fn frame_from_off_route_peer_is_penalised() {
    let mut mesh = Mesh::new(4);
    mesh.connect(A, B);
    mesh.connect(B, C);
    mesh.connect(E, B);

    let route = vec![mesh.id(A), mesh.id(B), mesh.id(C)];
    let frame = mesh.nodes[A]
        .codec()
        .encode_unicast("message", &"spoofed path".into(), &route, &[], common::START_MS)
        .unwrap();

    // E replays A's frame to B although E is not B's predecessor on the route.
    let intruder = mesh.id(E);
    let outcome = mesh.nodes[B].handle_incoming_unicast(&intruder, &frame);
    assert_eq!(outcome, UnicastOutcome::RoutingViolation);
    assert!(mesh.nodes[B].is_banished(&intruder));

    let next = mesh.nodes[B].handle_incoming_unicast(&intruder, &frame);
    assert_eq!(next, UnicastOutcome::Banished);
}
