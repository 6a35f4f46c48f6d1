//! Waymark proof-of-location protocol reference implementation.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod identity;
pub mod protocol;
pub mod wire;

pub use identity::{BeaconId, Keypair, PhoneId, PublicKey, SealError};
pub use protocol::{MsgType, OpType, PlaintextMessage, SealedMessage};
pub use wire::{
    decode_plaintext, decode_sealed, encode_plaintext, encode_sealed, DecodeError, EncodeError,
};

pub mod counter;
pub mod delivery;
pub mod engine;
pub mod fragment;
pub mod session;
pub mod token;

pub use counter::CounterStore;
pub use delivery::{
    AckAttempt, AckOutcome, AckStatus, DeliveryJob, DeliveryTracker, JobId, MessageStatus,
};
pub use fragment::{fragment, FragmentError, Reassembler, DEFAULT_TRANSPORT_UNIT};
pub use session::{verify_advertisement, ScanError, ScanSession};
pub use token::{
    BroadcastPayload, ConstructionError, Nonce, PoLRequest, PoLResponse, PoLToken, NONCE_LEN,
};
