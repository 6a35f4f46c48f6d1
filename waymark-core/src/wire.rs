//! Binary codecs for command frames. All multi-byte integers little-endian;
//! the wire partner is a constrained embedded target with fixed byte order.

use crate::identity::BeaconId;
use crate::protocol::{MsgType, OpType, PlaintextMessage, SealedMessage, SEAL_NONCE_LEN};

/// Fixed header length of a plaintext command frame.
pub const PLAINTEXT_HEADER_LEN: usize = 12;
/// Fixed prefix length of a sealed frame (beacon id + AEAD nonce).
pub const SEALED_HEADER_LEN: usize = 4 + SEAL_NONCE_LEN;

/// Error encoding an entity into wire bytes.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("payload too large for u16 length prefix: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("refusing to encode undefined message/op type")]
    UndefinedType,
}

/// Error decoding wire bytes. Always recoverable; decoding never reads out
/// of bounds and never panics on malformed input.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated input: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("declared length {declared} does not match remaining {remaining} bytes")]
    LengthMismatch { declared: usize, remaining: usize },
    #[error("undefined message type code {0}")]
    UndefinedMsgType(u8),
    #[error("undefined operation type code {0}")]
    UndefinedOpType(u8),
}

/// Copy a fixed-size array out of `data` at `offset`, or fail with the
/// total length the input would have needed.
pub(crate) fn array_at<const N: usize>(
    data: &[u8],
    offset: usize,
) -> Result<[u8; N], DecodeError> {
    data.get(offset..offset + N)
        .and_then(|s| s.try_into().ok())
        .ok_or(DecodeError::Truncated {
            expected: offset + N,
            actual: data.len(),
        })
}

pub(crate) fn u16_le_at(data: &[u8], offset: usize) -> Result<u16, DecodeError> {
    Ok(u16::from_le_bytes(array_at(data, offset)?))
}

pub(crate) fn u32_le_at(data: &[u8], offset: usize) -> Result<u32, DecodeError> {
    Ok(u32::from_le_bytes(array_at(data, offset)?))
}

pub(crate) fn u64_le_at(data: &[u8], offset: usize) -> Result<u64, DecodeError> {
    Ok(u64::from_le_bytes(array_at(data, offset)?))
}

/// Encode a plaintext command frame.
pub fn encode_plaintext(msg: &PlaintextMessage) -> Result<Vec<u8>, EncodeError> {
    if msg.msg_type == MsgType::Undefined || msg.op_type == OpType::Undefined {
        return Err(EncodeError::UndefinedType);
    }
    let len = u16::try_from(msg.payload.len())
        .map_err(|_| EncodeError::PayloadTooLarge(msg.payload.len()))?;
    let mut out = Vec::with_capacity(PLAINTEXT_HEADER_LEN + msg.payload.len());
    out.extend_from_slice(&msg.msg_id.to_le_bytes());
    out.push(msg.msg_type.code());
    out.push(msg.op_type.code());
    out.extend_from_slice(&msg.beacon_counter.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&msg.payload);
    Ok(out)
}

/// Decode a plaintext command frame. The declared payload length must match
/// the remaining bytes exactly; unknown type codes are a decode failure.
pub fn decode_plaintext(bytes: &[u8]) -> Result<PlaintextMessage, DecodeError> {
    let msg_id = u32_le_at(bytes, 0)?;
    let msg_type_code = array_at::<1>(bytes, 4)?[0];
    let op_type_code = array_at::<1>(bytes, 5)?[0];
    let beacon_counter = u32_le_at(bytes, 6)?;
    let declared = u16_le_at(bytes, 10)? as usize;
    let remaining = bytes.len() - PLAINTEXT_HEADER_LEN;
    if declared > remaining {
        return Err(DecodeError::Truncated {
            expected: PLAINTEXT_HEADER_LEN + declared,
            actual: bytes.len(),
        });
    }
    if declared < remaining {
        return Err(DecodeError::LengthMismatch {
            declared,
            remaining,
        });
    }
    let msg_type = MsgType::from_code(msg_type_code);
    if msg_type == MsgType::Undefined {
        return Err(DecodeError::UndefinedMsgType(msg_type_code));
    }
    let op_type = OpType::from_code(op_type_code);
    if op_type == OpType::Undefined {
        return Err(DecodeError::UndefinedOpType(op_type_code));
    }
    Ok(PlaintextMessage {
        msg_id,
        msg_type,
        op_type,
        beacon_counter,
        payload: bytes[PLAINTEXT_HEADER_LEN..].to_vec(),
    })
}

/// Encode a sealed frame.
pub fn encode_sealed(msg: &SealedMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(SEALED_HEADER_LEN + msg.ciphertext.len());
    out.extend_from_slice(&msg.beacon_id.to_le_bytes());
    out.extend_from_slice(&msg.nonce);
    out.extend_from_slice(&msg.ciphertext);
    out
}

/// Decode a sealed frame. The ciphertext is whatever follows the header;
/// its authenticity is only established by unsealing.
pub fn decode_sealed(bytes: &[u8]) -> Result<SealedMessage, DecodeError> {
    let beacon_id = BeaconId::from_le_bytes(array_at(bytes, 0)?);
    let nonce = array_at::<SEAL_NONCE_LEN>(bytes, 4)?;
    Ok(SealedMessage {
        beacon_id,
        nonce,
        ciphertext: bytes[SEALED_HEADER_LEN..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PlaintextMessage {
        PlaintextMessage {
            msg_id: 0xA1B2C3D4,
            msg_type: MsgType::Req,
            op_type: OpType::Reboot,
            beacon_counter: 41,
            payload: vec![1, 2, 3, 4, 5],
        }
    }

    #[test]
    fn plaintext_roundtrip() {
        let msg = sample();
        let bytes = encode_plaintext(&msg).unwrap();
        assert_eq!(decode_plaintext(&bytes).unwrap(), msg);
    }

    #[test]
    fn plaintext_roundtrip_empty_payload() {
        let msg = PlaintextMessage {
            payload: vec![],
            ..sample()
        };
        let bytes = encode_plaintext(&msg).unwrap();
        assert_eq!(bytes.len(), PLAINTEXT_HEADER_LEN);
        assert_eq!(decode_plaintext(&bytes).unwrap(), msg);
    }

    #[test]
    fn plaintext_layout_is_little_endian() {
        let bytes = encode_plaintext(&sample()).unwrap();
        assert_eq!(&bytes[0..4], &[0xD4, 0xC3, 0xB2, 0xA1]);
        assert_eq!(bytes[4], 1); // REQ
        assert_eq!(bytes[5], 2); // REBOOT
        assert_eq!(&bytes[6..10], &[41, 0, 0, 0]);
        assert_eq!(&bytes[10..12], &[5, 0]);
    }

    #[test]
    fn decode_rejects_every_truncation() {
        let bytes = encode_plaintext(&sample()).unwrap();
        for n in 0..bytes.len() {
            assert!(
                decode_plaintext(&bytes[..n]).is_err(),
                "prefix of {} bytes decoded",
                n
            );
        }
    }

    #[test]
    fn decode_rejects_declared_length_beyond_buffer() {
        let mut bytes = encode_plaintext(&sample()).unwrap();
        bytes[10] = 200; // declare 200 payload bytes, provide 5
        assert!(matches!(
            decode_plaintext(&bytes),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut bytes = encode_plaintext(&sample()).unwrap();
        bytes.push(0);
        assert!(matches!(
            decode_plaintext(&bytes),
            Err(DecodeError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn decode_rejects_undefined_codes() {
        let mut bytes = encode_plaintext(&sample()).unwrap();
        bytes[4] = 0;
        assert_eq!(
            decode_plaintext(&bytes),
            Err(DecodeError::UndefinedMsgType(0))
        );

        let mut bytes = encode_plaintext(&sample()).unwrap();
        bytes[4] = 99;
        assert_eq!(
            decode_plaintext(&bytes),
            Err(DecodeError::UndefinedMsgType(99))
        );

        let mut bytes = encode_plaintext(&sample()).unwrap();
        bytes[5] = 42;
        assert_eq!(
            decode_plaintext(&bytes),
            Err(DecodeError::UndefinedOpType(42))
        );
    }

    #[test]
    fn encode_rejects_undefined_type() {
        let msg = PlaintextMessage {
            msg_type: MsgType::Undefined,
            ..sample()
        };
        assert_eq!(encode_plaintext(&msg), Err(EncodeError::UndefinedType));
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let msg = PlaintextMessage {
            payload: vec![0u8; 70_000],
            ..sample()
        };
        assert!(matches!(
            encode_plaintext(&msg),
            Err(EncodeError::PayloadTooLarge(70_000))
        ));
    }

    #[test]
    fn sealed_roundtrip() {
        let msg = SealedMessage {
            beacon_id: BeaconId::new(0xDEAD),
            nonce: [7u8; SEAL_NONCE_LEN],
            ciphertext: vec![9u8; 33],
        };
        let bytes = encode_sealed(&msg);
        assert_eq!(decode_sealed(&bytes).unwrap(), msg);
    }

    #[test]
    fn sealed_decode_rejects_short_header() {
        assert!(matches!(
            decode_sealed(&[0u8; SEALED_HEADER_LEN - 1]),
            Err(DecodeError::Truncated { .. })
        ));
    }
}
