//! Stateless PoL crypto operations: nonce generation, request signing,
//! response/broadcast/token verification. No I/O.
//!
//! Verification failure is a routine outcome (a forged or corrupted packet),
//! so every verify returns a bool; dalek errors never cross this boundary.

use ed25519_dalek::{Signature, Verifier};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::identity::{Keypair, PublicKey};
use crate::token::{BroadcastPayload, Nonce, PoLRequest, PoLResponse, PoLToken};

/// Fresh random challenge nonce from the OS CSPRNG.
pub fn generate_nonce() -> Nonce {
    let mut nonce = Nonce::default();
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Sign a request with the phone's key. The signature covers exactly
/// {flags, phoneId, nonce, phonePk}; an already-signed request is returned
/// unchanged (the signature is immutable once set).
pub fn sign_request(mut request: PoLRequest, keypair: &Keypair) -> PoLRequest {
    if request.signature().is_none() {
        let signature = keypair.sign(&request.signed_data());
        request.attach_signature(signature);
    }
    request
}

fn verify_raw(public_key: &PublicKey, msg: &[u8], signature: &[u8; 64]) -> bool {
    let Some(key) = public_key.verifying_key() else {
        return false;
    };
    key.verify(msg, &Signature::from_bytes(signature)).is_ok()
}

/// Verify a signed request against the public key it carries. This is the
/// beacon side of the exchange; an unsigned request never verifies.
pub fn verify_request(request: &PoLRequest) -> bool {
    match request.signature() {
        Some(signature) => verify_raw(
            &request.phone_public_key,
            &request.signed_data(),
            signature,
        ),
        None => false,
    }
}

/// Verify a beacon's answer against the request it is bound to.
///
/// The nonce comparison runs byte-for-byte before any cryptographic work;
/// a mismatch is an immediate `false`. The signature is then checked over
/// the response fields plus the bound request nonce.
pub fn verify_response(
    response: &PoLResponse,
    request: &PoLRequest,
    beacon_public_key: &PublicKey,
) -> bool {
    if response.nonce != request.nonce {
        return false;
    }
    let signed = PoLResponse::signed_data(&request.nonce, response.beacon_id, response.counter);
    verify_raw(beacon_public_key, &signed, &response.signature)
}

/// Verify a connectionless advertisement. Same pattern as a response but
/// with no nonce binding.
pub fn verify_broadcast(payload: &BroadcastPayload, beacon_public_key: &PublicKey) -> bool {
    verify_raw(beacon_public_key, &payload.signed_data(), &payload.signature)
}

/// Forensic re-verification of a stored token: both signatures must hold
/// over the projections reconstructed from the token itself.
pub fn verify_token(token: &PoLToken) -> bool {
    verify_raw(
        token.phone_public_key(),
        &token.phone_signed_data(),
        token.phone_signature(),
    ) && verify_raw(
        token.beacon_public_key(),
        &token.beacon_signed_data(),
        token.beacon_signature(),
    )
}
