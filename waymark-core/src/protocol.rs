//! Command frames: plaintext message shape and its AEAD-sealed transport wrapper.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::identity::{self, BeaconId, SealError};

/// AEAD nonce length for sealed frames (ChaCha20-Poly1305 IV).
pub const SEAL_NONCE_LEN: usize = 12;

/// Message type of a command frame. Unknown wire codes map to `Undefined`,
/// which every consumer rejects; it never round-trips as a valid frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgType {
    Undefined,
    Req,
    Ack,
    Err,
}

impl MsgType {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => MsgType::Req,
            2 => MsgType::Ack,
            3 => MsgType::Err,
            _ => MsgType::Undefined,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            MsgType::Undefined => 0,
            MsgType::Req => 1,
            MsgType::Ack => 2,
            MsgType::Err => 3,
        }
    }
}

/// Operation requested of (or reported by) a beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    Undefined,
    GenericCommand,
    Reboot,
    GetStatus,
}

impl OpType {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => OpType::GenericCommand,
            2 => OpType::Reboot,
            3 => OpType::GetStatus,
            _ => OpType::Undefined,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            OpType::Undefined => 0,
            OpType::GenericCommand => 1,
            OpType::Reboot => 2,
            OpType::GetStatus => 3,
        }
    }
}

/// Server-authored command frame (or a beacon's ack/err answer to one).
/// Wire layout: msgId:u32 LE, msgType:u8, opType:u8, beaconCounter:u32 LE,
/// payloadLen:u16 LE, payload. See the wire module for the codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaintextMessage {
    pub msg_id: u32,
    pub msg_type: MsgType,
    pub op_type: OpType,
    pub beacon_counter: u32,
    pub payload: Vec<u8>,
}

/// AEAD-protected wrapper around an encoded `PlaintextMessage`.
/// The beacon id rides in clear as associated data; tampering with it
/// fails authentication on open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedMessage {
    pub beacon_id: BeaconId,
    pub nonce: [u8; SEAL_NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl SealedMessage {
    /// Seal an encoded frame for one beacon. Draws a fresh random nonce from
    /// the OS CSPRNG per call; 96 random bits keep reuse probability
    /// negligible at command volumes.
    pub fn seal(key: &[u8; 32], beacon_id: BeaconId, frame: &[u8]) -> Result<Self, SealError> {
        let mut nonce = [0u8; SEAL_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = identity::seal_payload(key, &nonce, &beacon_id.to_le_bytes(), frame)?;
        Ok(SealedMessage {
            beacon_id,
            nonce,
            ciphertext,
        })
    }

    /// Open the sealed frame, returning the encoded `PlaintextMessage` bytes.
    pub fn unseal(&self, key: &[u8; 32]) -> Result<Vec<u8>, SealError> {
        identity::open_payload(
            key,
            &self.nonce,
            &self.beacon_id.to_le_bytes(),
            &self.ciphertext,
        )
    }
}
