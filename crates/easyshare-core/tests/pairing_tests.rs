//! End-to-end pairing over loopback TCP.

mod common;

use common::{connect_pair, make_peer, wait_for_event};
use easyshare_core::connection::ConnectionStatus;
use easyshare_core::device::Platform;
use easyshare_core::events::Event;
use easyshare_core::pairing::PairingStep;
use easyshare_core::storage::Storage;

#[tokio::test]
async fn pairing_success_produces_identical_credentials() {
    let mut alice = make_peer("Alice", Platform::Desktop);
    let mut bob = make_peer("Bob", Platform::Desktop);

    connect_pair(&alice, &bob).await;

    alice
        .manager
        .start_pairing("sunflower".to_string())
        .expect("pairing must start");

    // Bob's host is prompted for the passphrase.
    let prompt = wait_for_event(&mut bob.events, "pairing request", |e| {
        matches!(e, Event::PairingRequest(_))
    })
    .await;
    match prompt {
        Event::PairingRequest(device) => assert_eq!(device.id, alice.device.id),
        _ => unreachable!(),
    }

    bob.manager
        .provide_passphrase("sunflower".to_string())
        .expect("passphrase must be deliverable");

    // Both sides settle on connected with a success step.
    wait_for_event(&mut alice.events, "alice pairing success", |e| {
        matches!(
            e,
            Event::ConnectionState(state)
                if state.status == ConnectionStatus::Connected
                    && state.pairing_step == Some(PairingStep::Success)
        )
    })
    .await;
    wait_for_event(&mut bob.events, "bob pairing success", |e| {
        matches!(
            e,
            Event::ConnectionState(state)
                if state.status == ConnectionStatus::Connected
                    && state.pairing_step == Some(PairingStep::Success)
        )
    })
    .await;

    let alice_paired = alice.storage.get_paired_devices();
    let bob_paired = bob.storage.get_paired_devices();
    assert_eq!(alice_paired.len(), 1);
    assert_eq!(bob_paired.len(), 1);
    assert_eq!(alice_paired[0].device.id, bob.device.id);
    assert_eq!(bob_paired[0].device.id, alice.device.id);
    assert_eq!(
        alice_paired[0].shared_secret, bob_paired[0].shared_secret,
        "both sides must derive the same secret"
    );
}

#[tokio::test]
async fn pairing_mismatch_rejects_and_stores_nothing() {
    let mut alice = make_peer("Alice", Platform::Desktop);
    let mut bob = make_peer("Bob", Platform::Desktop);

    connect_pair(&alice, &bob).await;

    alice
        .manager
        .start_pairing("sunflower".to_string())
        .expect("pairing must start");

    wait_for_event(&mut bob.events, "pairing request", |e| {
        matches!(e, Event::PairingRequest(_))
    })
    .await;
    bob.manager
        .provide_passphrase("tulip".to_string())
        .expect("passphrase must be deliverable");

    // The responder detects the mismatch and rejects; both ends fail.
    let bob_failed = wait_for_event(&mut bob.events, "bob pairing failure", |e| {
        matches!(
            e,
            Event::ConnectionState(state) if state.pairing_step == Some(PairingStep::Failed)
        )
    })
    .await;
    match bob_failed {
        Event::ConnectionState(state) => {
            assert_eq!(state.error.as_deref(), Some("Passphrase mismatch"));
        }
        _ => unreachable!(),
    }

    let alice_failed = wait_for_event(&mut alice.events, "alice pairing failure", |e| {
        matches!(
            e,
            Event::ConnectionState(state) if state.pairing_step == Some(PairingStep::Failed)
        )
    })
    .await;
    match alice_failed {
        Event::ConnectionState(state) => {
            assert_eq!(state.error.as_deref(), Some("Passphrase mismatch"));
            // The socket survives an auth failure.
            assert_eq!(state.status, ConnectionStatus::Connected);
        }
        _ => unreachable!(),
    }

    assert!(alice.storage.get_paired_devices().is_empty());
    assert!(bob.storage.get_paired_devices().is_empty());
    assert!(alice.manager.is_connected());
}
