//! Identity and crypto primitives: keypairs, phone/beacon ids, AEAD sealing.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Ed25519 public key (32 bytes). Serializable for persistence and registry records.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create a `PublicKey` from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }

    /// Parse into a dalek verifying key. `None` if the bytes are not a valid
    /// curve point; callers treat that as a plain verification failure.
    pub(crate) fn verifying_key(&self) -> Option<VerifyingKey> {
        VerifyingKey::from_bytes(&self.0).ok()
    }
}

/// Phone ID: deterministic 8-byte hash prefix of the phone's public key.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PhoneId([u8; 8]);

impl PhoneId {
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        PhoneId(bytes)
    }

    /// Derive a phone ID from a public key (same as Keypair does).
    pub fn from_public_key(public: &PublicKey) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(public.as_bytes());
        let digest = hasher.finalize();
        let mut id = [0u8; 8];
        id.copy_from_slice(&digest[..8]);
        PhoneId(id)
    }
}

/// Beacon ID: the fixed 4-byte device identifier burned into a beacon.
/// Little-endian on every wire format.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BeaconId(u32);

impl BeaconId {
    pub fn new(id: u32) -> Self {
        BeaconId(id)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn to_le_bytes(&self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        BeaconId(u32::from_le_bytes(bytes))
    }
}

/// Ed25519 keypair. Keep secret key private; expose only public key and id.
/// Phones and beacons use the same shape; beacons ignore the derived id.
pub struct Keypair {
    signing: SigningKey,
    public: PublicKey,
    phone_id: PhoneId,
}

impl Keypair {
    /// Generate a new random keypair and derive the id from the public key.
    pub fn generate() -> Self {
        Self::from_signing(SigningKey::generate(&mut OsRng))
    }

    /// Build a keypair from a 32-byte secret seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::from_signing(SigningKey::from_bytes(&seed))
    }

    fn from_signing(signing: SigningKey) -> Self {
        let public = PublicKey::from_bytes(signing.verifying_key().to_bytes());
        let phone_id = PhoneId::from_public_key(&public);
        Self {
            signing,
            public,
            phone_id,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn phone_id(&self) -> PhoneId {
        self.phone_id
    }

    /// Detached signature over `msg`. Returns the raw 64-byte signature.
    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        use ed25519_dalek::Signer;
        self.signing.sign(msg).to_bytes()
    }
}

/// AEAD seal: ChaCha20-Poly1305, 96-bit nonce, caller-supplied associated data.
/// Nonce must be unique per key; see `SealedMessage::seal` for generation.
pub fn seal_payload(
    key: &[u8; 32],
    nonce: &[u8; 12],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, SealError> {
    let cipher =
        chacha20poly1305::ChaCha20Poly1305::new_from_slice(key).map_err(|_| SealError::Key)?;
    let nonce_arr = chacha20poly1305::Nonce::from_slice(nonce);
    cipher
        .encrypt(
            nonce_arr,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| SealError::Seal)
}

/// AEAD open: decrypts and authenticates ciphertext-with-tag.
pub fn open_payload(
    key: &[u8; 32],
    nonce: &[u8; 12],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, SealError> {
    let cipher =
        chacha20poly1305::ChaCha20Poly1305::new_from_slice(key).map_err(|_| SealError::Key)?;
    let nonce_arr = chacha20poly1305::Nonce::from_slice(nonce);
    cipher
        .decrypt(
            nonce_arr,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| SealError::Open)
}

#[derive(Debug, thiserror::Error)]
pub enum SealError {
    #[error("invalid key")]
    Key,
    #[error("sealing failed")]
    Seal,
    #[error("unsealing failed")]
    Open,
}
