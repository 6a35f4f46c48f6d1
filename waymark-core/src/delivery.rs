//! Delivery state machine: server-side lifecycle of one sealed command
//! destined for one beacon, relayed by phones. Redundant relay attempts plus
//! first-resolution-wins give at-least-once delivery without duplicate side
//! effects on the beacon.
//!
//! Tick-driven like the rest of the core: the host calls `tick()` and the
//! tracker compares job age against the deadline. No clocks, no I/O.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::identity::{BeaconId, PhoneId};
use crate::protocol::{MsgType, PlaintextMessage};

/// Delivery job identifier (random 16 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId([u8; 16]);

impl JobId {
    fn new() -> Self {
        JobId(uuid::Uuid::new_v4().into_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

/// Job lifecycle. `Acknowledged`, `Failed` and `TimedOut` are terminal;
/// a job is never deleted, only terminalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Pending,
    Delivering,
    Acknowledged,
    Failed,
    TimedOut,
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageStatus::Acknowledged | MessageStatus::Failed | MessageStatus::TimedOut
        )
    }
}

/// Resolution of a single relay attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckStatus {
    AckReceived,
    ErrReceived,
    FailedDecryption,
    ProcessingError,
    Expired,
}

/// What an ack submission did to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// This submission resolved the job into the given terminal state.
    Resolved(MessageStatus),
    /// The job was already terminal; the attempt is recorded but the first
    /// resolution stays authoritative.
    Redundant,
    /// Recorded against the attempt without touching job state.
    Unchanged,
}

/// One phone-relay attempt. `status` is `None` while the phone is still out
/// with the sealed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckAttempt {
    pub phone_id: PhoneId,
    pub accepted_tick: u64,
    pub status: Option<AckStatus>,
    /// True when the attempt resolved after the job was already terminal.
    pub redundant: bool,
}

/// One command delivery job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryJob {
    id: JobId,
    beacon_id: BeaconId,
    msg_id: u32,
    sealed: Vec<u8>,
    redundancy: u8,
    status: MessageStatus,
    created_tick: u64,
    attempts: Vec<AckAttempt>,
}

impl DeliveryJob {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn beacon_id(&self) -> BeaconId {
        self.beacon_id
    }

    pub fn msg_id(&self) -> u32 {
        self.msg_id
    }

    /// Encoded `SealedMessage` bytes handed to relays.
    pub fn sealed(&self) -> &[u8] {
        &self.sealed
    }

    pub fn redundancy(&self) -> u8 {
        self.redundancy
    }

    pub fn status(&self) -> MessageStatus {
        self.status
    }

    pub fn attempts(&self) -> &[AckAttempt] {
        &self.attempts
    }

    pub fn redundant_attempts(&self) -> usize {
        self.attempts.iter().filter(|a| a.redundant).count()
    }

    /// The open attempt slot for this phone, or a fresh record for an
    /// unsolicited submission (a phone we never handed the job to still
    /// gets its attempt logged).
    fn attempt_slot(&mut self, phone_id: PhoneId, tick: u64) -> &mut AckAttempt {
        let at = self
            .attempts
            .iter()
            .position(|a| a.phone_id == phone_id && a.status.is_none())
            .unwrap_or_else(|| {
                self.attempts.push(AckAttempt {
                    phone_id,
                    accepted_tick: tick,
                    status: None,
                    redundant: false,
                });
                self.attempts.len() - 1
            });
        &mut self.attempts[at]
    }
}

/// Tracks every delivery job. Creation, phone checkout, ack resolution and
/// the timeout sweep all go through here.
pub struct DeliveryTracker {
    jobs: HashMap<JobId, DeliveryJob>,
    order: Vec<JobId>,
    tick: u64,
    deadline_ticks: u64,
}

impl DeliveryTracker {
    /// `deadline_ticks`: how many host ticks a job may stay unresolved.
    pub fn new(deadline_ticks: u64) -> Self {
        Self {
            jobs: HashMap::new(),
            order: Vec::new(),
            tick: 0,
            deadline_ticks,
        }
    }

    /// Create a job in `Pending`. A redundancy factor of 0 is clamped to 1.
    pub fn create(
        &mut self,
        beacon_id: BeaconId,
        msg_id: u32,
        sealed: Vec<u8>,
        redundancy: u8,
    ) -> JobId {
        let id = JobId::new();
        self.jobs.insert(
            id,
            DeliveryJob {
                id,
                beacon_id,
                msg_id,
                sealed,
                redundancy: redundancy.max(1),
                status: MessageStatus::Pending,
                created_tick: self.tick,
                attempts: Vec::new(),
            },
        );
        self.order.push(id);
        id
    }

    /// A phone polls for work. Hands out the oldest open job this phone is
    /// not already carrying and that still has attempt slots; first
    /// acceptance moves `Pending → Delivering`, later acceptances (up to the
    /// redundancy factor) change nothing.
    pub fn checkout(&mut self, phone_id: PhoneId) -> Option<(JobId, Vec<u8>)> {
        let tick = self.tick;
        for id in &self.order {
            let job = self.jobs.get_mut(id)?;
            if job.status.is_terminal() {
                continue;
            }
            if job.attempts.len() >= job.redundancy as usize {
                continue;
            }
            if job.attempts.iter().any(|a| a.phone_id == phone_id) {
                continue;
            }
            job.attempts.push(AckAttempt {
                phone_id,
                accepted_tick: tick,
                status: None,
                redundant: false,
            });
            if job.status == MessageStatus::Pending {
                job.status = MessageStatus::Delivering;
            }
            return Some((*id, job.sealed.clone()));
        }
        None
    }

    /// The ack blob for this attempt failed AEAD decryption. Recorded
    /// against the attempt; job state is untouched. Returns false for an
    /// unknown job.
    pub fn record_unseal_failure(&mut self, job_id: JobId, phone_id: PhoneId) -> bool {
        let tick = self.tick;
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return false;
        };
        job.attempt_slot(phone_id, tick).status = Some(AckStatus::FailedDecryption);
        true
    }

    /// The decrypted frame could not be processed (malformed after
    /// decryption, or a counter replay). Recorded against the attempt; job
    /// state is untouched.
    pub fn record_processing_error(&mut self, job_id: JobId, phone_id: PhoneId) -> bool {
        let tick = self.tick;
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return false;
        };
        job.attempt_slot(phone_id, tick).status = Some(AckStatus::ProcessingError);
        true
    }

    /// Resolve an attempt with a successfully decrypted frame. First ACK
    /// wins (`Acknowledged`), first ERR wins (`Failed`); an attempt landing
    /// after the job is terminal keeps its normally-recorded status but is
    /// classified redundant and never re-opens the job. A frame that is
    /// well-formed but semantically unusable here (REQ) records
    /// `ProcessingError`. Returns `None` for an unknown job.
    pub fn submit(
        &mut self,
        job_id: JobId,
        phone_id: PhoneId,
        frame: &PlaintextMessage,
    ) -> Option<AckOutcome> {
        let tick = self.tick;
        let job = self.jobs.get_mut(&job_id)?;
        let terminal = job.status.is_terminal();
        let outcome = match frame.msg_type {
            MsgType::Ack | MsgType::Err => {
                let (ack_status, resolved) = if frame.msg_type == MsgType::Ack {
                    (AckStatus::AckReceived, MessageStatus::Acknowledged)
                } else {
                    (AckStatus::ErrReceived, MessageStatus::Failed)
                };
                {
                    let attempt = job.attempt_slot(phone_id, tick);
                    attempt.status = Some(ack_status);
                    attempt.redundant = terminal;
                }
                if terminal {
                    AckOutcome::Redundant
                } else {
                    job.status = resolved;
                    AckOutcome::Resolved(resolved)
                }
            }
            _ => {
                job.attempt_slot(phone_id, tick).status = Some(AckStatus::ProcessingError);
                AckOutcome::Unchanged
            }
        };
        Some(outcome)
    }

    /// Advance the host clock one tick and sweep deadlines: any job still
    /// `Pending`/`Delivering` past its deadline moves to `TimedOut` and its
    /// outstanding attempts are marked `Expired`. Returns the jobs that
    /// timed out on this tick.
    pub fn tick(&mut self) -> Vec<JobId> {
        self.tick = self.tick.saturating_add(1);
        let now = self.tick;
        let mut timed_out = Vec::new();
        for id in &self.order {
            if let Some(job) = self.jobs.get_mut(id) {
                if job.status.is_terminal() {
                    continue;
                }
                if now.saturating_sub(job.created_tick) > self.deadline_ticks {
                    job.status = MessageStatus::TimedOut;
                    for attempt in &mut job.attempts {
                        if attempt.status.is_none() {
                            attempt.status = Some(AckStatus::Expired);
                        }
                    }
                    timed_out.push(*id);
                }
            }
        }
        timed_out
    }

    pub fn job(&self, job_id: JobId) -> Option<&DeliveryJob> {
        self.jobs.get(&job_id)
    }

    /// All jobs in creation order.
    pub fn jobs(&self) -> impl Iterator<Item = &DeliveryJob> {
        self.order.iter().filter_map(|id| self.jobs.get(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OpType;

    fn phone(n: u8) -> PhoneId {
        PhoneId::from_bytes([n; 8])
    }

    fn frame(msg_type: MsgType) -> PlaintextMessage {
        PlaintextMessage {
            msg_id: 1,
            msg_type,
            op_type: OpType::GenericCommand,
            beacon_counter: 1,
            payload: vec![],
        }
    }

    fn tracker_with_job(redundancy: u8) -> (DeliveryTracker, JobId) {
        let mut t = DeliveryTracker::new(10);
        let id = t.create(BeaconId::new(1), 1, vec![0xAA; 8], redundancy);
        (t, id)
    }

    #[test]
    fn checkout_moves_pending_to_delivering_once() {
        let (mut t, id) = tracker_with_job(2);
        assert_eq!(t.job(id).unwrap().status(), MessageStatus::Pending);

        let (got, sealed) = t.checkout(phone(1)).unwrap();
        assert_eq!(got, id);
        assert_eq!(sealed, vec![0xAA; 8]);
        assert_eq!(t.job(id).unwrap().status(), MessageStatus::Delivering);

        // Second pickup: allowed by redundancy, state unchanged.
        assert!(t.checkout(phone(2)).is_some());
        assert_eq!(t.job(id).unwrap().status(), MessageStatus::Delivering);
    }

    #[test]
    fn checkout_respects_redundancy_and_phone_uniqueness() {
        let (mut t, _) = tracker_with_job(2);
        assert!(t.checkout(phone(1)).is_some());
        // Same phone cannot carry the same job twice.
        assert!(t.checkout(phone(1)).is_none());
        assert!(t.checkout(phone(2)).is_some());
        // Redundancy factor exhausted.
        assert!(t.checkout(phone(3)).is_none());
    }

    #[test]
    fn first_ack_wins_second_is_redundant() {
        let (mut t, id) = tracker_with_job(2);
        t.checkout(phone(1)).unwrap();
        t.checkout(phone(2)).unwrap();

        let outcome = t.submit(id, phone(1), &frame(MsgType::Ack)).unwrap();
        assert_eq!(outcome, AckOutcome::Resolved(MessageStatus::Acknowledged));

        let outcome = t.submit(id, phone(2), &frame(MsgType::Ack)).unwrap();
        assert_eq!(outcome, AckOutcome::Redundant);

        let job = t.job(id).unwrap();
        assert_eq!(job.status(), MessageStatus::Acknowledged);
        assert_eq!(job.redundant_attempts(), 1);
        // Both attempts carry their normally-recorded status.
        assert!(job
            .attempts()
            .iter()
            .all(|a| a.status == Some(AckStatus::AckReceived)));
    }

    #[test]
    fn err_resolves_to_failed() {
        let (mut t, id) = tracker_with_job(1);
        t.checkout(phone(1)).unwrap();
        let outcome = t.submit(id, phone(1), &frame(MsgType::Err)).unwrap();
        assert_eq!(outcome, AckOutcome::Resolved(MessageStatus::Failed));
        assert_eq!(t.job(id).unwrap().status(), MessageStatus::Failed);
        let attempt = &t.job(id).unwrap().attempts()[0];
        assert_eq!(attempt.status, Some(AckStatus::ErrReceived));
    }

    #[test]
    fn late_ack_never_reopens_a_failed_job() {
        let (mut t, id) = tracker_with_job(2);
        t.checkout(phone(1)).unwrap();
        t.checkout(phone(2)).unwrap();
        t.submit(id, phone(1), &frame(MsgType::Err)).unwrap();
        let outcome = t.submit(id, phone(2), &frame(MsgType::Ack)).unwrap();
        assert_eq!(outcome, AckOutcome::Redundant);
        assert_eq!(t.job(id).unwrap().status(), MessageStatus::Failed);
    }

    #[test]
    fn unseal_failure_leaves_job_open() {
        let (mut t, id) = tracker_with_job(1);
        t.checkout(phone(1)).unwrap();
        assert!(t.record_unseal_failure(id, phone(1)));
        let job = t.job(id).unwrap();
        assert_eq!(job.status(), MessageStatus::Delivering);
        assert_eq!(job.attempts()[0].status, Some(AckStatus::FailedDecryption));
    }

    #[test]
    fn req_frame_records_processing_error_without_state_change() {
        let (mut t, id) = tracker_with_job(1);
        t.checkout(phone(1)).unwrap();
        let outcome = t.submit(id, phone(1), &frame(MsgType::Req)).unwrap();
        assert_eq!(outcome, AckOutcome::Unchanged);
        let job = t.job(id).unwrap();
        assert_eq!(job.status(), MessageStatus::Delivering);
        assert_eq!(job.attempts()[0].status, Some(AckStatus::ProcessingError));
    }

    #[test]
    fn deadline_times_out_and_expires_attempts() {
        let mut t = DeliveryTracker::new(3);
        let id = t.create(BeaconId::new(1), 1, vec![1], 2);
        t.checkout(phone(1)).unwrap();

        for _ in 0..3 {
            assert!(t.tick().is_empty());
        }
        let timed_out = t.tick();
        assert_eq!(timed_out, vec![id]);

        let job = t.job(id).unwrap();
        assert_eq!(job.status(), MessageStatus::TimedOut);
        assert_eq!(job.attempts()[0].status, Some(AckStatus::Expired));

        // A terminal job is no longer handed out.
        assert!(t.checkout(phone(2)).is_none());
    }

    #[test]
    fn ack_after_timeout_is_redundant() {
        let mut t = DeliveryTracker::new(1);
        let id = t.create(BeaconId::new(1), 1, vec![1], 1);
        t.checkout(phone(1)).unwrap();
        t.tick();
        t.tick();
        assert_eq!(t.job(id).unwrap().status(), MessageStatus::TimedOut);

        let outcome = t.submit(id, phone(1), &frame(MsgType::Ack)).unwrap();
        assert_eq!(outcome, AckOutcome::Redundant);
        let job = t.job(id).unwrap();
        assert_eq!(job.status(), MessageStatus::TimedOut);
        assert_eq!(job.redundant_attempts(), 1);
    }

    #[test]
    fn unknown_job_is_reported() {
        let mut t = DeliveryTracker::new(10);
        let bogus = JobId(*b"0123456789abcdef");
        assert!(t.submit(bogus, phone(1), &frame(MsgType::Ack)).is_none());
        assert!(!t.record_unseal_failure(bogus, phone(1)));
    }

    #[test]
    fn checkout_skips_to_next_open_job() {
        let mut t = DeliveryTracker::new(10);
        let a = t.create(BeaconId::new(1), 1, vec![1], 1);
        let b = t.create(BeaconId::new(2), 2, vec![2], 1);
        t.checkout(phone(1)).unwrap();
        t.submit(a, phone(1), &frame(MsgType::Ack)).unwrap();

        let (got, _) = t.checkout(phone(1)).unwrap();
        assert_eq!(got, b);
    }

    #[test]
    fn zero_redundancy_is_clamped() {
        let (mut t, id) = tracker_with_job(0);
        assert!(t.checkout(phone(1)).is_some());
        assert_eq!(t.job(id).unwrap().redundancy(), 1);
    }

    #[test]
    fn unsolicited_ack_is_still_recorded() {
        let (mut t, id) = tracker_with_job(1);
        // Phone 9 never checked the job out.
        let outcome = t.submit(id, phone(9), &frame(MsgType::Ack)).unwrap();
        assert_eq!(outcome, AckOutcome::Resolved(MessageStatus::Acknowledged));
        assert_eq!(t.job(id).unwrap().attempts().len(), 1);
    }
}
