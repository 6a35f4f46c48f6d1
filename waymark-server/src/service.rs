//! The server-side verification and delivery pipeline: token submission,
//! command sealing and dispatch, phone check-ins, ack resolution, sweeps.
//!
//! Rejections here are routine outcomes, logged as warnings at most; nothing
//! on this path is fatal.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};
use waymark_core::engine;
use waymark_core::{
    decode_plaintext, decode_sealed, encode_plaintext, encode_sealed, AckOutcome, BeaconId,
    CounterStore, DeliveryTracker, JobId, MessageStatus, MsgType, OpType, PhoneId,
    PlaintextMessage, PoLToken, SealedMessage,
};

use crate::store::{Beacon, BeaconStore};

/// Result of a token submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenOutcome {
    Accepted,
    Malformed,
    UnknownBeacon,
    /// The token's embedded beacon key does not match the registered one.
    KeyMismatch,
    BadSignature,
    /// Counter at or below the beacon's watermark.
    Replay { current: u64 },
}

/// Result of an ack submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckSubmitOutcome {
    /// This submission resolved the job.
    Resolved(MessageStatus),
    /// The job was already terminal; attempt recorded, first result stands.
    Redundant,
    /// Recorded against the attempt (bad decryption, malformed or replayed
    /// frame); job state unchanged.
    Rejected,
    UnknownJob,
}

pub struct PolService {
    store: Arc<dyn BeaconStore>,
    counters: CounterStore,
    tracker: Mutex<DeliveryTracker>,
    next_msg_id: AtomicU32,
    redundancy: u8,
}

impl PolService {
    /// Build the service over a store, hydrating counter watermarks from the
    /// persisted beacon records.
    pub fn new(store: Arc<dyn BeaconStore>, deadline_ticks: u64, redundancy: u8) -> Self {
        let counters = CounterStore::new();
        for b in store.list() {
            counters.hydrate(b.technical_id, b.last_known_counter);
        }
        Self {
            store,
            counters,
            tracker: Mutex::new(DeliveryTracker::new(deadline_ticks)),
            next_msg_id: AtomicU32::new(1),
            redundancy: redundancy.max(1),
        }
    }

    fn tracker(&self) -> MutexGuard<'_, DeliveryTracker> {
        self.tracker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn register_beacon(&self, beacon: Beacon) {
        self.counters
            .hydrate(beacon.technical_id, beacon.last_known_counter);
        info!(
            "registered beacon {} ({})",
            beacon.technical_id.value(),
            beacon.display_name
        );
        self.store.upsert(beacon);
    }

    /// A phone submits an encoded token: decode it, re-verify both
    /// signatures against the registered beacon key, advance the counter or
    /// reject as a replay, then persist it as evidence.
    pub fn submit_token(&self, bytes: &[u8]) -> TokenOutcome {
        let token = match PoLToken::decode(bytes) {
            Ok(t) => t,
            Err(e) => {
                warn!("token rejected: {}", e);
                return TokenOutcome::Malformed;
            }
        };
        let beacon_id = token.beacon_id();
        let Some(beacon) = self.store.get(beacon_id) else {
            warn!("token for unknown beacon {}", beacon_id.value());
            return TokenOutcome::UnknownBeacon;
        };
        if beacon.public_key != *token.beacon_public_key() {
            warn!("token key mismatch for beacon {}", beacon_id.value());
            return TokenOutcome::KeyMismatch;
        }
        if !engine::verify_token(&token) {
            warn!("token signature check failed for beacon {}", beacon_id.value());
            return TokenOutcome::BadSignature;
        }
        if !self.counters.advance(beacon_id, token.beacon_counter()) {
            let current = self.counters.current(beacon_id).unwrap_or(0);
            warn!(
                "replayed token for beacon {}: counter {} <= {}",
                beacon_id.value(),
                token.beacon_counter(),
                current
            );
            return TokenOutcome::Replay { current };
        }
        self.store.set_counter(beacon_id, token.beacon_counter());
        info!(
            "token accepted: beacon {} counter {}",
            beacon_id.value(),
            token.beacon_counter()
        );
        self.store.append_token(token);
        TokenOutcome::Accepted
    }

    /// Operator queues a command for a beacon. Returns the delivery job id,
    /// or `None` for an unknown beacon or an unencodable payload.
    pub fn create_command(
        &self,
        beacon_id: BeaconId,
        op_type: OpType,
        payload: Vec<u8>,
    ) -> Option<JobId> {
        let beacon = self.store.get(beacon_id)?;
        let msg_id = self.next_msg_id.fetch_add(1, Ordering::Relaxed);
        // The command counter must move past the beacon's watermark so the
        // firmware's own replay check accepts the frame.
        let counter = self
            .counters
            .current(beacon_id)
            .unwrap_or(0)
            .saturating_add(1);
        let frame = PlaintextMessage {
            msg_id,
            msg_type: MsgType::Req,
            op_type,
            beacon_counter: counter as u32,
            payload,
        };
        let bytes = match encode_plaintext(&frame) {
            Ok(b) => b,
            Err(e) => {
                warn!("command for beacon {} not encodable: {}", beacon_id.value(), e);
                return None;
            }
        };
        let sealed = match SealedMessage::seal(&beacon.sealing_key, beacon_id, &bytes) {
            Ok(s) => s,
            Err(e) => {
                warn!("sealing failed for beacon {}: {}", beacon_id.value(), e);
                return None;
            }
        };
        let job_id =
            self.tracker()
                .create(beacon_id, msg_id, encode_sealed(&sealed), self.redundancy);
        info!(
            "command {} ({:?}) queued for beacon {}",
            msg_id,
            op_type,
            beacon_id.value()
        );
        Some(job_id)
    }

    /// Phone check-in: hand out the oldest open job this phone can carry.
    pub fn poll_work(&self, phone_id: PhoneId) -> Option<(JobId, Vec<u8>)> {
        let got = self.tracker().checkout(phone_id);
        if got.is_some() {
            debug!("job handed to phone {:02x?}", phone_id.as_bytes());
        }
        got
    }

    /// A phone returns the opaque ack blob it got from the beacon.
    pub fn submit_ack(&self, job_id: JobId, phone_id: PhoneId, blob: &[u8]) -> AckSubmitOutcome {
        let mut tracker = self.tracker();
        let Some(job) = tracker.job(job_id) else {
            warn!("ack for unknown job");
            return AckSubmitOutcome::UnknownJob;
        };
        let beacon_id = job.beacon_id();
        let Some(beacon) = self.store.get(beacon_id) else {
            warn!("ack for job whose beacon {} is gone", beacon_id.value());
            tracker.record_processing_error(job_id, phone_id);
            return AckSubmitOutcome::Rejected;
        };
        let sealed = match decode_sealed(blob) {
            Ok(s) => s,
            Err(e) => {
                warn!("ack blob undecodable: {}", e);
                tracker.record_unseal_failure(job_id, phone_id);
                return AckSubmitOutcome::Rejected;
            }
        };
        let plain = match sealed.unseal(&beacon.sealing_key) {
            Ok(p) => p,
            Err(_) => {
                warn!("ack failed decryption for beacon {}", beacon_id.value());
                tracker.record_unseal_failure(job_id, phone_id);
                return AckSubmitOutcome::Rejected;
            }
        };
        let frame = match decode_plaintext(&plain) {
            Ok(f) => f,
            Err(e) => {
                warn!("decrypted ack frame malformed: {}", e);
                tracker.record_processing_error(job_id, phone_id);
                return AckSubmitOutcome::Rejected;
            }
        };
        if !self.counters.advance(beacon_id, u64::from(frame.beacon_counter)) {
            warn!(
                "ack counter replay for beacon {}: {}",
                beacon_id.value(),
                frame.beacon_counter
            );
            tracker.record_processing_error(job_id, phone_id);
            return AckSubmitOutcome::Rejected;
        }
        self.store
            .set_counter(beacon_id, u64::from(frame.beacon_counter));
        match tracker.submit(job_id, phone_id, &frame) {
            Some(AckOutcome::Resolved(status)) => {
                info!(
                    "job resolved {:?} by ack from beacon {}",
                    status,
                    beacon_id.value()
                );
                AckSubmitOutcome::Resolved(status)
            }
            Some(AckOutcome::Redundant) => {
                info!("redundant ack for beacon {}", beacon_id.value());
                AckSubmitOutcome::Redundant
            }
            Some(AckOutcome::Unchanged) => AckSubmitOutcome::Rejected,
            None => AckSubmitOutcome::UnknownJob,
        }
    }

    /// Deadline sweep; the daemon calls this on its interval. Returns how
    /// many jobs timed out.
    pub fn sweep(&self) -> usize {
        let timed_out = self.tracker().tick();
        for id in &timed_out {
            warn!("delivery job {:02x?} timed out", id.as_bytes());
        }
        timed_out.len()
    }

    pub fn job_status(&self, job_id: JobId) -> Option<MessageStatus> {
        self.tracker().job(job_id).map(|j| j.status())
    }

    pub fn tokens_for(&self, beacon_id: BeaconId) -> Vec<PoLToken> {
        self.store.tokens_for(beacon_id)
    }
}
