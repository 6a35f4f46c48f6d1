//! Proof-of-location entities: challenge, answer, broadcast, and the durable
//! token, with their fixed binary layouts and signed-byte projections.
//!
//! The signed projections are a byte contract with the beacon firmware; the
//! field order inside them is load-bearing and must not change.

use serde::{Deserialize, Serialize};

use crate::identity::{BeaconId, Keypair, PhoneId, PublicKey};
use crate::wire::{self, DecodeError, EncodeError};

/// Protocol-defined nonce length for the challenge-response exchange.
pub const NONCE_LEN: usize = 16;

/// A challenge nonce.
pub type Nonce = [u8; NONCE_LEN];

const SIG_LEN: usize = 64;
const PK_LEN: usize = 32;

/// Bytes a phone signs: flags, phoneId, nonce, phonePk.
const REQUEST_SIGNED_LEN: usize = 1 + 8 + NONCE_LEN + PK_LEN;
/// Full request on the wire: signed bytes + signature.
pub const REQUEST_WIRE_LEN: usize = REQUEST_SIGNED_LEN + SIG_LEN;
/// Bytes a beacon signs: beaconId, counter, bound request nonce.
const RESPONSE_SIGNED_LEN: usize = 4 + 8 + NONCE_LEN;
/// Full response on the wire: beaconId, counter, echoed nonce, signature.
pub const RESPONSE_WIRE_LEN: usize = RESPONSE_SIGNED_LEN + SIG_LEN;
/// Full token: flags, phoneId, beaconId, counter, nonce, both keys, both sigs.
pub const TOKEN_WIRE_LEN: usize = 1 + 8 + 4 + 8 + NONCE_LEN + 2 * PK_LEN + 2 * SIG_LEN;

mod bytes_64 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 64], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 64], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 64 bytes"))
    }
}

/// Fixed-size field of the wrong length at entity construction. Rejected at
/// the boundary; no partially-valid entity is ever produced.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConstructionError {
    #[error("nonce must be {expected} bytes, got {actual}")]
    BadNonceLength { expected: usize, actual: usize },
    #[error("public key must be {expected} bytes, got {actual}")]
    BadKeyLength { expected: usize, actual: usize },
    #[error("signature must be {expected} bytes, got {actual}")]
    BadSignatureLength { expected: usize, actual: usize },
    #[error("request has no signature")]
    MissingSignature,
}

fn nonce_from(bytes: &[u8]) -> Result<Nonce, ConstructionError> {
    bytes
        .try_into()
        .map_err(|_| ConstructionError::BadNonceLength {
            expected: NONCE_LEN,
            actual: bytes.len(),
        })
}

fn key_from(bytes: &[u8]) -> Result<[u8; PK_LEN], ConstructionError> {
    bytes
        .try_into()
        .map_err(|_| ConstructionError::BadKeyLength {
            expected: PK_LEN,
            actual: bytes.len(),
        })
}

fn sig_from(bytes: &[u8]) -> Result<[u8; SIG_LEN], ConstructionError> {
    bytes
        .try_into()
        .map_err(|_| ConstructionError::BadSignatureLength {
            expected: SIG_LEN,
            actual: bytes.len(),
        })
}

/// Phone → beacon challenge. Created per scan attempt, signed once,
/// consumed to build a `PoLToken`, then discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoLRequest {
    pub flags: u8,
    pub phone_id: PhoneId,
    pub nonce: Nonce,
    pub phone_public_key: PublicKey,
    signature: Option<[u8; SIG_LEN]>,
}

impl PoLRequest {
    /// Build an unsigned challenge for this phone identity.
    pub fn new(flags: u8, keypair: &Keypair, nonce: Nonce) -> Self {
        PoLRequest {
            flags,
            phone_id: keypair.phone_id(),
            nonce,
            phone_public_key: keypair.public_key().clone(),
            signature: None,
        }
    }

    /// Exact bytes the phone signature covers: flags, phoneId, nonce, phonePk.
    pub fn signed_data(&self) -> [u8; REQUEST_SIGNED_LEN] {
        let mut out = [0u8; REQUEST_SIGNED_LEN];
        out[0] = self.flags;
        out[1..9].copy_from_slice(self.phone_id.as_bytes());
        out[9..9 + NONCE_LEN].copy_from_slice(&self.nonce);
        out[9 + NONCE_LEN..].copy_from_slice(self.phone_public_key.as_bytes());
        out
    }

    pub fn signature(&self) -> Option<&[u8; SIG_LEN]> {
        self.signature.as_ref()
    }

    /// Set the signature. Once set it is immutable; a second attach is a
    /// no-op returning false.
    pub(crate) fn attach_signature(&mut self, signature: [u8; SIG_LEN]) -> bool {
        if self.signature.is_some() {
            return false;
        }
        self.signature = Some(signature);
        true
    }

    /// Encode for transmission. Only a signed request travels.
    pub fn encode(&self) -> Result<Vec<u8>, ConstructionError> {
        let signature = self.signature.ok_or(ConstructionError::MissingSignature)?;
        let mut out = Vec::with_capacity(REQUEST_WIRE_LEN);
        out.extend_from_slice(&self.signed_data());
        out.extend_from_slice(&signature);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < REQUEST_WIRE_LEN {
            return Err(DecodeError::Truncated {
                expected: REQUEST_WIRE_LEN,
                actual: bytes.len(),
            });
        }
        if bytes.len() > REQUEST_WIRE_LEN {
            return Err(DecodeError::LengthMismatch {
                declared: REQUEST_WIRE_LEN,
                remaining: bytes.len(),
            });
        }
        Ok(PoLRequest {
            flags: bytes[0],
            phone_id: PhoneId::from_bytes(wire::array_at(bytes, 1)?),
            nonce: wire::array_at(bytes, 9)?,
            phone_public_key: PublicKey::from_bytes(wire::array_at(bytes, 9 + NONCE_LEN)?),
            signature: Some(wire::array_at(bytes, REQUEST_SIGNED_LEN)?),
        })
    }
}

/// Beacon → phone answer. Echoes the request nonce so the phone can check
/// the binding byte-for-byte before any signature work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoLResponse {
    pub beacon_id: BeaconId,
    pub counter: u64,
    pub nonce: Nonce,
    pub signature: [u8; SIG_LEN],
}

impl PoLResponse {
    /// Exact bytes the beacon signature covers: beaconId, counter, and the
    /// nonce of the request being answered.
    pub fn signed_data(bound_nonce: &Nonce, beacon_id: BeaconId, counter: u64) -> [u8; RESPONSE_SIGNED_LEN] {
        let mut out = [0u8; RESPONSE_SIGNED_LEN];
        out[0..4].copy_from_slice(&beacon_id.to_le_bytes());
        out[4..12].copy_from_slice(&counter.to_le_bytes());
        out[12..].copy_from_slice(bound_nonce);
        out
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RESPONSE_WIRE_LEN);
        out.extend_from_slice(&self.beacon_id.to_le_bytes());
        out.extend_from_slice(&self.counter.to_le_bytes());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < RESPONSE_WIRE_LEN {
            return Err(DecodeError::Truncated {
                expected: RESPONSE_WIRE_LEN,
                actual: bytes.len(),
            });
        }
        if bytes.len() > RESPONSE_WIRE_LEN {
            return Err(DecodeError::LengthMismatch {
                declared: RESPONSE_WIRE_LEN,
                remaining: bytes.len(),
            });
        }
        Ok(PoLResponse {
            beacon_id: BeaconId::from_le_bytes(wire::array_at(bytes, 0)?),
            counter: wire::u64_le_at(bytes, 4)?,
            nonce: wire::array_at(bytes, 12)?,
            signature: wire::array_at(bytes, RESPONSE_SIGNED_LEN)?,
        })
    }
}

/// The durable proof artifact. Immutable once created; equality and hashing
/// compare byte contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoLToken {
    flags: u8,
    phone_id: PhoneId,
    beacon_id: BeaconId,
    beacon_counter: u64,
    nonce: Nonce,
    phone_public_key: PublicKey,
    beacon_public_key: PublicKey,
    #[serde(with = "bytes_64")]
    phone_signature: [u8; SIG_LEN],
    #[serde(with = "bytes_64")]
    beacon_signature: [u8; SIG_LEN],
}

impl PoLToken {
    /// Build a token from raw parts, validating every fixed-size field.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flags: u8,
        phone_id: PhoneId,
        beacon_id: BeaconId,
        beacon_counter: u64,
        nonce: &[u8],
        phone_public_key: &[u8],
        beacon_public_key: &[u8],
        phone_signature: &[u8],
        beacon_signature: &[u8],
    ) -> Result<Self, ConstructionError> {
        Ok(PoLToken {
            flags,
            phone_id,
            beacon_id,
            beacon_counter,
            nonce: nonce_from(nonce)?,
            phone_public_key: PublicKey::from_bytes(key_from(phone_public_key)?),
            beacon_public_key: PublicKey::from_bytes(key_from(beacon_public_key)?),
            phone_signature: sig_from(phone_signature)?,
            beacon_signature: sig_from(beacon_signature)?,
        })
    }

    /// Assemble the token from a verified exchange.
    pub fn from_parts(
        request: &PoLRequest,
        response: &PoLResponse,
        beacon_public_key: &PublicKey,
    ) -> Result<Self, ConstructionError> {
        let phone_signature = *request
            .signature()
            .ok_or(ConstructionError::MissingSignature)?;
        Ok(PoLToken {
            flags: request.flags,
            phone_id: request.phone_id,
            beacon_id: response.beacon_id,
            beacon_counter: response.counter,
            nonce: request.nonce,
            phone_public_key: request.phone_public_key.clone(),
            beacon_public_key: beacon_public_key.clone(),
            phone_signature,
            beacon_signature: response.signature,
        })
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn phone_id(&self) -> PhoneId {
        self.phone_id
    }

    pub fn beacon_id(&self) -> BeaconId {
        self.beacon_id
    }

    pub fn beacon_counter(&self) -> u64 {
        self.beacon_counter
    }

    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }

    pub fn phone_public_key(&self) -> &PublicKey {
        &self.phone_public_key
    }

    pub fn beacon_public_key(&self) -> &PublicKey {
        &self.beacon_public_key
    }

    pub fn phone_signature(&self) -> &[u8; SIG_LEN] {
        &self.phone_signature
    }

    pub fn beacon_signature(&self) -> &[u8; SIG_LEN] {
        &self.beacon_signature
    }

    /// Bytes the phone signature must cover, reconstructed from the token.
    pub fn phone_signed_data(&self) -> [u8; REQUEST_SIGNED_LEN] {
        let mut out = [0u8; REQUEST_SIGNED_LEN];
        out[0] = self.flags;
        out[1..9].copy_from_slice(self.phone_id.as_bytes());
        out[9..9 + NONCE_LEN].copy_from_slice(&self.nonce);
        out[9 + NONCE_LEN..].copy_from_slice(self.phone_public_key.as_bytes());
        out
    }

    /// Bytes the beacon signature must cover, reconstructed from the token.
    pub fn beacon_signed_data(&self) -> [u8; RESPONSE_SIGNED_LEN] {
        PoLResponse::signed_data(&self.nonce, self.beacon_id, self.beacon_counter)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(TOKEN_WIRE_LEN);
        out.push(self.flags);
        out.extend_from_slice(self.phone_id.as_bytes());
        out.extend_from_slice(&self.beacon_id.to_le_bytes());
        out.extend_from_slice(&self.beacon_counter.to_le_bytes());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(self.phone_public_key.as_bytes());
        out.extend_from_slice(self.beacon_public_key.as_bytes());
        out.extend_from_slice(&self.phone_signature);
        out.extend_from_slice(&self.beacon_signature);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < TOKEN_WIRE_LEN {
            return Err(DecodeError::Truncated {
                expected: TOKEN_WIRE_LEN,
                actual: bytes.len(),
            });
        }
        if bytes.len() > TOKEN_WIRE_LEN {
            return Err(DecodeError::LengthMismatch {
                declared: TOKEN_WIRE_LEN,
                remaining: bytes.len(),
            });
        }
        let mut at = 0usize;
        let flags = bytes[at];
        at += 1;
        let phone_id = PhoneId::from_bytes(wire::array_at(bytes, at)?);
        at += 8;
        let beacon_id = BeaconId::from_le_bytes(wire::array_at(bytes, at)?);
        at += 4;
        let beacon_counter = wire::u64_le_at(bytes, at)?;
        at += 8;
        let nonce: Nonce = wire::array_at(bytes, at)?;
        at += NONCE_LEN;
        let phone_public_key = PublicKey::from_bytes(wire::array_at(bytes, at)?);
        at += PK_LEN;
        let beacon_public_key = PublicKey::from_bytes(wire::array_at(bytes, at)?);
        at += PK_LEN;
        let phone_signature: [u8; SIG_LEN] = wire::array_at(bytes, at)?;
        at += SIG_LEN;
        let beacon_signature: [u8; SIG_LEN] = wire::array_at(bytes, at)?;
        Ok(PoLToken {
            flags,
            phone_id,
            beacon_id,
            beacon_counter,
            nonce,
            phone_public_key,
            beacon_public_key,
            phone_signature,
            beacon_signature,
        })
    }
}

/// Signed advertisement a beacon emits without a connection. Verified like a
/// response but with no nonce binding; no prior request exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastPayload {
    pub beacon_id: BeaconId,
    pub body: Vec<u8>,
    pub signature: [u8; SIG_LEN],
}

impl BroadcastPayload {
    /// Bytes the beacon signature covers: beaconId, body.
    pub fn signed_data(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.body.len());
        out.extend_from_slice(&self.beacon_id.to_le_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let len = u16::try_from(self.body.len())
            .map_err(|_| EncodeError::PayloadTooLarge(self.body.len()))?;
        let mut out = Vec::with_capacity(4 + 2 + self.body.len() + SIG_LEN);
        out.extend_from_slice(&self.beacon_id.to_le_bytes());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&self.body);
        out.extend_from_slice(&self.signature);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let beacon_id = BeaconId::from_le_bytes(wire::array_at(bytes, 0)?);
        let declared = wire::u16_le_at(bytes, 4)? as usize;
        let remaining = bytes.len() - 6;
        if declared + SIG_LEN > remaining {
            return Err(DecodeError::Truncated {
                expected: 6 + declared + SIG_LEN,
                actual: bytes.len(),
            });
        }
        if declared + SIG_LEN < remaining {
            return Err(DecodeError::LengthMismatch {
                declared,
                remaining: remaining - SIG_LEN,
            });
        }
        Ok(BroadcastPayload {
            beacon_id,
            body: bytes[6..6 + declared].to_vec(),
            signature: wire::array_at(bytes, 6 + declared)?,
        })
    }
}
