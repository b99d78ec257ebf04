//! Passphrase pairing state machine.
//!
//! Pairing proves that both users typed the same passphrase without ever
//! sending it: each side derives the same 32-byte secret from the
//! passphrase and the sorted device ids, the responder issues a random
//! challenge, and the initiator answers with a truncated hash over
//! `challenge || secret`.
//!
//! The machine is pure: it owns no sockets and spawns no tasks. The
//! connection dispatch task feeds it `pair_*` payloads and executes the
//! [`PairingAction`]s it returns, which keeps all mutation on one task.
//!
//! ```text
//! idle ──► waiting ──► verifying ──► success
//!              │            └──────► failed
//!              └───────────────────► failed
//! ```
//!
//! Crossed `pair_request`s (both sides initiated) resolve naturally: a
//! side holding a passphrase answers any incoming request as a responder,
//! so each peer challenges the other with the same derived secret.

use std::time::Instant;

use base64::prelude::*;
use serde::{Deserialize, Serialize};

use crate::crypto::{self, SECRET_SIZE};
use crate::device::{DeviceInfo, PairedDevice};
use crate::protocol::Payload;

/// Coarse pairing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingStatus {
    /// No pairing in progress
    Idle,
    /// Waiting for the local user to supply a passphrase
    Waiting,
    /// Handshake in flight
    Verifying,
    /// Pairing completed; a credential was produced
    Success,
    /// Pairing terminated without a credential
    Failed,
}

/// Fine-grained step surfaced to the UI while pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingStep {
    /// Nothing happening
    Idle,
    /// TCP connect in progress
    Connecting,
    /// Sending our pair request
    SendingRequest,
    /// Remote asked to pair; local user must type the passphrase
    WaitingForPassphrase,
    /// Deriving the shared key
    DerivingKey,
    /// Sending the challenge
    SendingChallenge,
    /// Waiting for the responder's challenge
    WaitingForChallenge,
    /// Answering a received challenge
    RespondingToChallenge,
    /// Checking the peer's response
    VerifyingResponse,
    /// Sending the confirmation
    Confirming,
    /// Pairing succeeded
    Success,
    /// Pairing failed
    Failed,
}

/// Side effect requested by the state machine.
#[derive(Debug)]
pub enum PairingAction {
    /// Send this payload to the peer
    Send(Payload),
    /// Ask the host to prompt for a passphrase
    RequestPassphrase(DeviceInfo),
    /// Pairing succeeded; persist the credential
    Succeeded(Box<PairedDevice>),
    /// Pairing failed with this reason
    Failed(String),
}

/// In-memory pairing state for one connection.
#[derive(Debug)]
pub struct PairingState {
    status: PairingStatus,
    step: PairingStep,
    local: DeviceInfo,
    remote: Option<DeviceInfo>,
    passphrase: Option<String>,
    secret: Option<[u8; SECRET_SIZE]>,
    issued_challenge: Option<[u8; 32]>,
    error: Option<String>,
    last_activity: Instant,
}

impl PairingState {
    /// Create the state for an inbound pairing (born on the first
    /// received `pair_request`).
    #[must_use]
    pub fn new(local: DeviceInfo) -> Self {
        Self {
            status: PairingStatus::Idle,
            step: PairingStep::Idle,
            local,
            remote: None,
            passphrase: None,
            secret: None,
            issued_challenge: None,
            error: None,
            last_activity: Instant::now(),
        }
    }

    /// Create the state for an outbound pairing and produce the opening
    /// `pair_request`.
    #[must_use]
    pub fn initiate(
        local: DeviceInfo,
        remote: DeviceInfo,
        passphrase: String,
    ) -> (Self, Vec<PairingAction>) {
        let mut state = Self::new(local);
        state.remote = Some(remote);
        state.passphrase = Some(passphrase);
        state.status = PairingStatus::Verifying;
        state.step = PairingStep::SendingRequest;

        let request = PairingAction::Send(Payload::PairRequest {
            device_info: state.local.clone(),
        });
        state.step = PairingStep::WaitingForChallenge;

        (state, vec![request])
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> PairingStatus {
        self.status
    }

    /// Current UI step.
    #[must_use]
    pub fn step(&self) -> PairingStep {
        self.step
    }

    /// The derived session secret, once available.
    #[must_use]
    pub fn secret(&self) -> Option<&[u8; SECRET_SIZE]> {
        self.secret.as_ref()
    }

    /// The peer identity, once known.
    #[must_use]
    pub fn remote(&self) -> Option<&DeviceInfo> {
        self.remote.as_ref()
    }

    /// Failure reason, if the pairing failed.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Whether the exchange has seen no progress for the pairing timeout.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        matches!(
            self.status,
            PairingStatus::Waiting | PairingStatus::Verifying
        ) && self.last_activity.elapsed().as_secs() >= crate::PAIRING_TIMEOUT_SECS
    }

    /// The local user supplied a passphrase (responder side).
    pub fn provide_passphrase(&mut self, passphrase: String) -> Vec<PairingAction> {
        self.last_activity = Instant::now();
        self.passphrase = Some(passphrase);

        if self.remote.is_some() && self.status == PairingStatus::Waiting {
            self.begin_challenge()
        } else {
            Vec::new()
        }
    }

    /// Drive the machine with an incoming `pair_*` payload.
    ///
    /// Non-pairing payloads are ignored. Messages that make no sense in
    /// the current state are dropped with a log, mirroring the tolerant
    /// dispatch of the wire protocol.
    pub fn handle(&mut self, payload: &Payload) -> Vec<PairingAction> {
        if self.status == PairingStatus::Success || self.status == PairingStatus::Failed {
            return Vec::new();
        }
        self.last_activity = Instant::now();

        match payload {
            Payload::PairRequest { device_info } => self.on_request(device_info.clone()),
            Payload::PairChallenge { challenge, .. } => self.on_challenge(challenge),
            Payload::PairResponse {
                response,
                device_info,
            } => self.on_response(response, device_info.clone()),
            Payload::PairConfirm { device_info } => self.on_confirm(device_info.clone()),
            Payload::PairReject { reason } => self.fail(reason.clone()),
            _ => Vec::new(),
        }
    }

    fn on_request(&mut self, remote: DeviceInfo) -> Vec<PairingAction> {
        self.remote = Some(remote.clone());

        if self.passphrase.is_some() {
            // Either we are the responder with a queued passphrase, or
            // requests crossed; both resolve by challenging.
            self.begin_challenge()
        } else {
            self.status = PairingStatus::Waiting;
            self.step = PairingStep::WaitingForPassphrase;
            vec![PairingAction::RequestPassphrase(remote)]
        }
    }

    fn on_challenge(&mut self, challenge_b64: &str) -> Vec<PairingAction> {
        let Some(passphrase) = self.passphrase.clone() else {
            tracing::debug!("pair_challenge without a local passphrase, ignoring");
            return Vec::new();
        };
        let Some(remote) = self.remote.clone() else {
            return self.fail("challenge received before peer identity was known".to_string());
        };
        let Ok(challenge) = BASE64_STANDARD.decode(challenge_b64) else {
            return self.fail("malformed challenge".to_string());
        };

        self.step = PairingStep::DerivingKey;
        let secret = crypto::derive_shared_secret(&passphrase, &self.local.id, &remote.id);
        self.secret = Some(secret);
        self.status = PairingStatus::Verifying;

        self.step = PairingStep::RespondingToChallenge;
        let response = crypto::challenge_response(&challenge, &secret);

        vec![PairingAction::Send(Payload::PairResponse {
            response: BASE64_STANDARD.encode(response),
            device_info: self.local.clone(),
        })]
    }

    fn on_response(&mut self, response_b64: &str, remote: DeviceInfo) -> Vec<PairingAction> {
        self.remote = Some(remote.clone());

        let (Some(secret), Some(challenge)) = (self.secret, self.issued_challenge) else {
            tracing::debug!("pair_response without an issued challenge, ignoring");
            return Vec::new();
        };

        self.step = PairingStep::VerifyingResponse;
        let verified = BASE64_STANDARD
            .decode(response_b64)
            .map(|response| crypto::verify_response(&challenge, &secret, &response))
            .unwrap_or(false);

        if verified {
            self.step = PairingStep::Confirming;
            let confirm = PairingAction::Send(Payload::PairConfirm {
                device_info: self.local.clone(),
            });
            let credential = self.succeed(remote, &secret);
            vec![confirm, credential]
        } else {
            let reject = PairingAction::Send(Payload::PairReject {
                reason: "Passphrase mismatch".to_string(),
            });
            let mut actions = vec![reject];
            actions.extend(self.fail("Passphrase mismatch".to_string()));
            actions
        }
    }

    fn on_confirm(&mut self, remote: DeviceInfo) -> Vec<PairingAction> {
        let Some(secret) = self.secret else {
            tracing::debug!("pair_confirm without a derived secret, ignoring");
            return Vec::new();
        };
        vec![self.succeed(remote, &secret)]
    }

    fn begin_challenge(&mut self) -> Vec<PairingAction> {
        let passphrase = self.passphrase.clone().expect("checked by caller");
        let remote = self.remote.clone().expect("checked by caller");

        self.step = PairingStep::DerivingKey;
        let secret = crypto::derive_shared_secret(&passphrase, &self.local.id, &remote.id);
        self.secret = Some(secret);

        let challenge = crypto::generate_challenge();
        self.issued_challenge = Some(challenge);
        self.status = PairingStatus::Verifying;
        self.step = PairingStep::SendingChallenge;

        vec![PairingAction::Send(Payload::PairChallenge {
            challenge: BASE64_STANDARD.encode(challenge),
            timestamp: crate::epoch_ms(),
        })]
    }

    fn succeed(&mut self, remote: DeviceInfo, secret: &[u8; SECRET_SIZE]) -> PairingAction {
        self.status = PairingStatus::Success;
        self.step = PairingStep::Success;
        self.remote = Some(remote.clone());
        PairingAction::Succeeded(Box::new(PairedDevice::new(remote, secret)))
    }

    fn fail(&mut self, reason: String) -> Vec<PairingAction> {
        self.status = PairingStatus::Failed;
        self.step = PairingStep::Failed;
        self.error = Some(reason.clone());
        vec![PairingAction::Failed(reason)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Platform;

    fn device(id: &str, name: &str) -> DeviceInfo {
        DeviceInfo {
            id: id.to_string(),
            name: name.to_string(),
            platform: Platform::Desktop,
            version: "0.3.1".into(),
            host: None,
            port: None,
        }
    }

    /// Deliver `actions`' outgoing payloads into `target`, returning the
    /// actions the target produced.
    fn pump(actions: Vec<PairingAction>, target: &mut PairingState) -> Vec<PairingAction> {
        let mut produced = Vec::new();
        for action in actions {
            if let PairingAction::Send(payload) = action {
                produced.extend(target.handle(&payload));
            }
        }
        produced
    }

    #[test]
    fn test_successful_pairing_produces_matching_credentials() {
        let alice = device("alice-id", "Alice");
        let bob = device("bob-id", "Bob");

        let (mut initiator, request) =
            PairingState::initiate(alice.clone(), bob.clone(), "sunflower".into());
        let mut responder = PairingState::new(bob.clone());

        // pair_request -> responder asks its user for the passphrase
        let actions = pump(request, &mut responder);
        assert!(matches!(
            actions.as_slice(),
            [PairingAction::RequestPassphrase(d)] if d.id == "alice-id"
        ));
        assert_eq!(responder.status(), PairingStatus::Waiting);
        assert_eq!(responder.step(), PairingStep::WaitingForPassphrase);

        // passphrase supplied -> challenge -> response -> confirm
        let challenge = responder.provide_passphrase("sunflower".into());
        let response = pump(challenge, &mut initiator);
        let confirm = pump(response, &mut responder);

        let responder_credential = confirm.iter().find_map(|a| match a {
            PairingAction::Succeeded(p) => Some(p.clone()),
            _ => None,
        });
        let initiator_actions = pump(confirm, &mut initiator);
        let initiator_credential = initiator_actions.iter().find_map(|a| match a {
            PairingAction::Succeeded(p) => Some(p.clone()),
            _ => None,
        });

        let responder_credential = responder_credential.expect("responder credential");
        let initiator_credential = initiator_credential.expect("initiator credential");

        assert_eq!(initiator.status(), PairingStatus::Success);
        assert_eq!(responder.status(), PairingStatus::Success);
        assert_eq!(
            initiator_credential.shared_secret,
            responder_credential.shared_secret
        );
        assert_eq!(initiator_credential.device.id, "bob-id");
        assert_eq!(responder_credential.device.id, "alice-id");
    }

    #[test]
    fn test_passphrase_mismatch_rejects() {
        let alice = device("alice-id", "Alice");
        let bob = device("bob-id", "Bob");

        let (mut initiator, request) =
            PairingState::initiate(alice.clone(), bob.clone(), "sunflower".into());
        let mut responder = PairingState::new(bob);

        pump(request, &mut responder);
        let challenge = responder.provide_passphrase("tulip".into());
        let response = pump(challenge, &mut initiator);
        let outcome = pump(response, &mut responder);

        assert!(outcome
            .iter()
            .any(|a| matches!(a, PairingAction::Failed(reason) if reason == "Passphrase mismatch")));
        assert!(outcome.iter().any(|a| matches!(
            a,
            PairingAction::Send(Payload::PairReject { reason }) if reason == "Passphrase mismatch"
        )));
        assert_eq!(responder.status(), PairingStatus::Failed);

        // Deliver the rejection to the initiator.
        let initiator_outcome = pump(outcome, &mut initiator);
        assert!(initiator_outcome
            .iter()
            .any(|a| matches!(a, PairingAction::Failed(_))));
        assert_eq!(initiator.status(), PairingStatus::Failed);
    }

    #[test]
    fn test_crossed_requests_converge() {
        let alice = device("alice-id", "Alice");
        let bob = device("bob-id", "Bob");

        let (mut a, a_request) =
            PairingState::initiate(alice.clone(), bob.clone(), "meadow".into());
        let (mut b, b_request) = PairingState::initiate(bob, alice, "meadow".into());

        // Each side receives the other's request and answers as responder.
        let a_challenge = pump(b_request, &mut a);
        let b_challenge = pump(a_request, &mut b);

        let b_response = pump(a_challenge, &mut b);
        let a_response = pump(b_challenge, &mut a);

        let a_confirm = pump(b_response, &mut a);
        let b_confirm = pump(a_response, &mut b);

        assert!(a_confirm
            .iter()
            .any(|x| matches!(x, PairingAction::Succeeded(_))));
        assert!(b_confirm
            .iter()
            .any(|x| matches!(x, PairingAction::Succeeded(_))));
        assert_eq!(a.status(), PairingStatus::Success);
        assert_eq!(b.status(), PairingStatus::Success);
        assert_eq!(
            a.secret().expect("secret"),
            b.secret().expect("secret"),
            "both sides must derive the same key"
        );
    }

    #[test]
    fn test_terminal_states_ignore_messages() {
        let alice = device("alice-id", "Alice");
        let bob = device("bob-id", "Bob");

        let mut state = PairingState::new(alice);
        state.handle(&Payload::PairReject {
            reason: "no".into(),
        });
        assert_eq!(state.status(), PairingStatus::Failed);

        let actions = state.handle(&Payload::PairRequest { device_info: bob });
        assert!(actions.is_empty());
    }

    #[test]
    fn test_response_without_challenge_ignored() {
        let alice = device("alice-id", "Alice");
        let bob = device("bob-id", "Bob");

        let mut state = PairingState::new(alice);
        let actions = state.handle(&Payload::PairResponse {
            response: "AAAA".into(),
            device_info: bob,
        });
        assert!(actions.is_empty());
        assert_ne!(state.status(), PairingStatus::Failed);
    }
}
