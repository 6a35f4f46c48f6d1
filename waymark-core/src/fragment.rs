//! Fragmentation: carry an oversized message over a transport whose atomic
//! unit (one BLE write or advertisement) is a few dozen to a few hundred
//! bytes. One header byte per fragment: top 2 bits fragment type, bottom 6
//! bits a transaction id distinguishing concurrent in-flight messages.

/// Conservative BLE write length. Callers override per transport.
pub const DEFAULT_TRANSPORT_UNIT: usize = 180;

/// Highest valid transaction id (6 bits).
pub const MAX_TRANSACTION_ID: u8 = 0x3F;

const TYPE_START: u8 = 0b00 << 6;
const TYPE_MIDDLE: u8 = 0b01 << 6;
const TYPE_END: u8 = 0b10 << 6;
const TYPE_UNFRAGMENTED: u8 = 0b11 << 6;
const TYPE_MASK: u8 = 0b11 << 6;
const TXID_MASK: u8 = MAX_TRANSACTION_ID;

/// Fragment position within a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentType {
    Start,
    Middle,
    End,
    Unfragmented,
}

impl FragmentType {
    fn from_header(header: u8) -> Self {
        match header & TYPE_MASK {
            TYPE_START => FragmentType::Start,
            TYPE_MIDDLE => FragmentType::Middle,
            TYPE_END => FragmentType::End,
            _ => FragmentType::Unfragmented,
        }
    }

    fn header(self, txid: u8) -> u8 {
        let bits = match self {
            FragmentType::Start => TYPE_START,
            FragmentType::Middle => TYPE_MIDDLE,
            FragmentType::End => TYPE_END,
            FragmentType::Unfragmented => TYPE_UNFRAGMENTED,
        };
        bits | (txid & TXID_MASK)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FragmentError {
    #[error("transport unit must fit a header and at least one payload byte")]
    UnitTooSmall,
    #[error("transaction id {0} out of range (max {MAX_TRANSACTION_ID})")]
    TransactionIdOutOfRange(u8),
    #[error("empty fragment")]
    Empty,
    #[error("fragment out of sequence for transaction {txid}")]
    OutOfSequence { txid: u8 },
}

/// Split `payload` into transport-unit-sized fragments for `txid`.
///
/// A message that fits in one unit ships as a single `UNFRAGMENTED`
/// fragment; otherwise `START`, zero or more `MIDDLE`, one `END`, each
/// carrying a maximal slice.
pub fn fragment(payload: &[u8], txid: u8, unit: usize) -> Result<Vec<Vec<u8>>, FragmentError> {
    if unit < 2 {
        return Err(FragmentError::UnitTooSmall);
    }
    if txid > MAX_TRANSACTION_ID {
        return Err(FragmentError::TransactionIdOutOfRange(txid));
    }
    let slice_len = unit - 1;
    if 1 + payload.len() <= unit {
        let mut packet = Vec::with_capacity(1 + payload.len());
        packet.push(FragmentType::Unfragmented.header(txid));
        packet.extend_from_slice(payload);
        return Ok(vec![packet]);
    }
    let chunks: Vec<&[u8]> = payload.chunks(slice_len).collect();
    let last = chunks.len() - 1;
    let mut out = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.iter().enumerate() {
        let ty = if i == 0 {
            FragmentType::Start
        } else if i == last {
            FragmentType::End
        } else {
            FragmentType::Middle
        };
        let mut packet = Vec::with_capacity(1 + chunk.len());
        packet.push(ty.header(txid));
        packet.extend_from_slice(chunk);
        out.push(packet);
    }
    Ok(out)
}

/// Receiver-side reassembly: one bounded slot per transaction id.
///
/// A fresh `START` always resets its slot, so a reused id never conflates a
/// new message with an abandoned one. A `MIDDLE`/`END` with no prior
/// `START` is a protocol error that discards and resets only that slot.
/// Dropping the reassembler discards all in-flight state; always safe.
pub struct Reassembler {
    slots: Vec<Option<Vec<u8>>>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            slots: vec![None; MAX_TRANSACTION_ID as usize + 1],
        }
    }

    /// Feed one received packet. Returns the transaction id and reassembled
    /// payload when a message completes.
    pub fn submit(&mut self, packet: &[u8]) -> Result<Option<(u8, Vec<u8>)>, FragmentError> {
        let (&header, rest) = packet.split_first().ok_or(FragmentError::Empty)?;
        let txid = header & TXID_MASK;
        match FragmentType::from_header(header) {
            FragmentType::Unfragmented => Ok(Some((txid, rest.to_vec()))),
            FragmentType::Start => {
                self.slots[txid as usize] = Some(rest.to_vec());
                Ok(None)
            }
            FragmentType::Middle => match &mut self.slots[txid as usize] {
                Some(buf) => {
                    buf.extend_from_slice(rest);
                    Ok(None)
                }
                None => Err(FragmentError::OutOfSequence { txid }),
            },
            FragmentType::End => match self.slots[txid as usize].take() {
                Some(mut buf) => {
                    buf.extend_from_slice(rest);
                    Ok(Some((txid, buf)))
                }
                None => Err(FragmentError::OutOfSequence { txid }),
            },
        }
    }

    /// Discard any in-flight state for one transaction id (scan cancelled).
    pub fn reset(&mut self, txid: u8) {
        if let Some(slot) = self.slots.get_mut(txid as usize) {
            *slot = None;
        }
    }

    /// True if a transaction is mid-assembly.
    pub fn is_assembling(&self, txid: u8) -> bool {
        self.slots
            .get(txid as usize)
            .map(Option::is_some)
            .unwrap_or(false)
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}
