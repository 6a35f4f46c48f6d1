//! Client scan session: one challenge-response exchange with one beacon.
//! Host-driven: the session emits the packets to transmit and consumes the
//! packets received; the BLE transport stays outside the core. Dropping a
//! session cancels the scan and discards in-flight reassembly state.

use crate::engine;
use crate::fragment::{self, FragmentError, Reassembler};
use crate::identity::{Keypair, PublicKey};
use crate::token::{BroadcastPayload, ConstructionError, PoLRequest, PoLResponse, PoLToken};
use crate::wire::DecodeError;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ScanError {
    #[error(transparent)]
    Fragment(#[from] FragmentError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Construction(#[from] ConstructionError),
    #[error("response failed verification")]
    VerificationFailed,
    #[error("beacon counter {received} does not advance past {current}")]
    CounterReplayed { current: u64, received: u64 },
}

/// One in-flight scan. Single-threaded per logical transaction; a connection
/// to one beacon carries one request/response at a time.
pub struct ScanSession {
    request: PoLRequest,
    beacon_public_key: PublicKey,
    txid: u8,
    last_seen_counter: Option<u64>,
    reassembler: Reassembler,
}

impl ScanSession {
    /// Build and sign the challenge, fragment it for the transport, and
    /// return the session plus the packets to transmit.
    ///
    /// `last_seen_counter` is the highest counter this phone has already
    /// seen from the beacon, for the client-side replay sanity check; pass
    /// `None` on first contact.
    pub fn start(
        keypair: &Keypair,
        beacon_public_key: PublicKey,
        flags: u8,
        txid: u8,
        transport_unit: usize,
        last_seen_counter: Option<u64>,
    ) -> Result<(Self, Vec<Vec<u8>>), ScanError> {
        let request = engine::sign_request(
            PoLRequest::new(flags, keypair, engine::generate_nonce()),
            keypair,
        );
        let bytes = request.encode()?;
        let packets = fragment::fragment(&bytes, txid, transport_unit)?;
        Ok((
            Self {
                request,
                beacon_public_key,
                txid,
                last_seen_counter,
                reassembler: Reassembler::new(),
            },
            packets,
        ))
    }

    pub fn request(&self) -> &PoLRequest {
        &self.request
    }

    /// Feed one packet received on the connection. Returns the assembled,
    /// verified token once the beacon's answer is complete; `Ok(None)` while
    /// fragments are still outstanding.
    pub fn on_packet(&mut self, packet: &[u8]) -> Result<Option<PoLToken>, ScanError> {
        let Some((txid, bytes)) = self.reassembler.submit(packet)? else {
            return Ok(None);
        };
        if txid != self.txid {
            // Traffic for another transaction; the transport routes it.
            return Ok(None);
        }
        let response = PoLResponse::decode(&bytes)?;
        if !engine::verify_response(&response, &self.request, &self.beacon_public_key) {
            return Err(ScanError::VerificationFailed);
        }
        if let Some(current) = self.last_seen_counter {
            if response.counter <= current {
                return Err(ScanError::CounterReplayed {
                    current,
                    received: response.counter,
                });
            }
        }
        let token = PoLToken::from_parts(&self.request, &response, &self.beacon_public_key)?;
        Ok(Some(token))
    }
}

/// Verify a connectionless advertisement packet. `None` when the payload is
/// malformed or the signature does not check out; both are routine.
pub fn verify_advertisement(
    packet: &[u8],
    beacon_public_key: &PublicKey,
) -> Option<BroadcastPayload> {
    let payload = BroadcastPayload::decode(packet).ok()?;
    engine::verify_broadcast(&payload, beacon_public_key).then_some(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::BeaconId;

    const UNIT: usize = 40;

    fn phone() -> Keypair {
        Keypair::from_seed([1u8; 32])
    }

    fn beacon() -> Keypair {
        Keypair::from_seed([2u8; 32])
    }

    /// The beacon side of the exchange: reassemble the request, verify it,
    /// answer with a signed response at the given counter.
    fn beacon_answer(request_packets: &[Vec<u8>], counter: u64) -> Vec<Vec<u8>> {
        let mut r = Reassembler::new();
        let mut assembled = None;
        for p in request_packets {
            if let Some((txid, bytes)) = r.submit(p).unwrap() {
                assembled = Some((txid, bytes));
            }
        }
        let (txid, bytes) = assembled.expect("request should reassemble");
        let request = PoLRequest::decode(&bytes).unwrap();
        assert!(engine::verify_request(&request));

        let bkp = beacon();
        let beacon_id = BeaconId::new(11);
        let response = PoLResponse {
            beacon_id,
            counter,
            nonce: request.nonce,
            signature: bkp.sign(&PoLResponse::signed_data(&request.nonce, beacon_id, counter)),
        };
        fragment::fragment(&response.encode(), txid, UNIT).unwrap()
    }

    #[test]
    fn full_exchange_yields_verified_token() {
        let kp = phone();
        let (mut session, packets) = ScanSession::start(
            &kp,
            beacon().public_key().clone(),
            0x01,
            5,
            UNIT,
            Some(4),
        )
        .unwrap();
        // 121 request bytes over a 40-byte unit: START, MIDDLE, MIDDLE, END.
        assert_eq!(packets.len(), 4);

        let mut token = None;
        for p in beacon_answer(&packets, 5) {
            if let Some(t) = session.on_packet(&p).unwrap() {
                token = Some(t);
            }
        }
        let token = token.expect("exchange should complete");
        assert_eq!(token.beacon_id(), BeaconId::new(11));
        assert_eq!(token.beacon_counter(), 5);
        assert_eq!(token.phone_id(), kp.phone_id());
        assert_eq!(token.nonce(), &session.request().nonce);
        assert!(engine::verify_token(&token));
    }

    #[test]
    fn stale_counter_is_rejected_client_side() {
        let kp = phone();
        let (mut session, packets) = ScanSession::start(
            &kp,
            beacon().public_key().clone(),
            0,
            1,
            UNIT,
            Some(5),
        )
        .unwrap();
        let mut result = Ok(None);
        for p in beacon_answer(&packets, 5) {
            result = session.on_packet(&p);
            if result != Ok(None) {
                break;
            }
        }
        assert_eq!(
            result,
            Err(ScanError::CounterReplayed {
                current: 5,
                received: 5
            })
        );
    }

    #[test]
    fn tampered_answer_fails_verification() {
        let kp = phone();
        let (mut session, packets) =
            ScanSession::start(&kp, beacon().public_key().clone(), 0, 1, UNIT, None).unwrap();
        let mut answer = beacon_answer(&packets, 1);
        let last = answer.len() - 1;
        let tail = answer[last].len() - 1;
        answer[last][tail] ^= 0x01; // flip a signature bit
        let mut result = Ok(None);
        for p in answer {
            result = session.on_packet(&p);
            if result != Ok(None) {
                break;
            }
        }
        assert_eq!(result, Err(ScanError::VerificationFailed));
    }

    #[test]
    fn other_transactions_are_ignored() {
        let kp = phone();
        let (mut session, _) =
            ScanSession::start(&kp, beacon().public_key().clone(), 0, 1, UNIT, None).unwrap();
        // A complete unfragmented message for transaction 2 is not ours.
        let mut packet = vec![0b11 << 6 | 2];
        packet.extend_from_slice(b"noise");
        assert_eq!(session.on_packet(&packet), Ok(None));
    }

    #[test]
    fn advertisement_verification() {
        let bkp = beacon();
        let mut b = BroadcastPayload {
            beacon_id: BeaconId::new(4),
            body: b"hello".to_vec(),
            signature: [0; 64],
        };
        b.signature = bkp.sign(&b.signed_data());
        let bytes = b.encode().unwrap();

        assert_eq!(verify_advertisement(&bytes, bkp.public_key()), Some(b));
        assert_eq!(verify_advertisement(&bytes, phone().public_key()), None);
        assert_eq!(verify_advertisement(&bytes[..10], bkp.public_key()), None);
    }
}
