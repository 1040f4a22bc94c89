//! Reliable-circuit bookkeeping
//!
//! Tracks the acknowledgment side of a reliable UDP circuit: which inbound
//! sequence numbers were already processed, which acks still have to go out,
//! and which outbound reliable packets are waiting on the remote end. Payloads
//! are opaque bytes; framing lives with the packet codec.

use crate::networking::dedup::DedupWindow;
use crate::networking::NetworkResult;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Default number of inbound sequence numbers remembered for duplicate detection
pub const DEFAULT_RECEIVED_WINDOW: usize = 256;

/// How an outbound reliable packet finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Remote end acknowledged the packet
    Acknowledged,
    /// Gave up after the retry limit
    Expired,
}

/// Reliable packet waiting for acknowledgment
#[derive(Debug)]
struct PendingPacket {
    payload: Bytes,
    sent_at: Instant,
    retry_count: u8,
    resolve_tx: Option<oneshot::Sender<AckOutcome>>,
}

/// A packet due for retransmission
#[derive(Debug, Clone)]
pub struct Retransmit {
    pub sequence: u32,
    pub payload: Bytes,
    /// Attempt number, starting at 1 for the first resend
    pub attempt: u8,
}

/// Circuit acknowledgment manager
#[derive(Debug)]
pub struct Acknowledger {
    /// Packets waiting for acknowledgment (sequence -> packet)
    pending_reliable: HashMap<u32, PendingPacket>,
    /// Sequences we've received (for duplicate detection)
    received_sequences: DedupWindow<u32>,
    /// Acknowledgments to send to server
    pending_acks: Vec<u32>,
}

impl Acknowledger {
    /// Create an acknowledger remembering `window` inbound sequence numbers
    pub fn with_window(window: usize) -> NetworkResult<Self> {
        let received_sequences = DedupWindow::new(window)?;

        Ok(Self {
            pending_reliable: HashMap::new(),
            received_sequences,
            pending_acks: Vec::new(),
        })
    }

    /// Check if a sequence number is new (not already received).
    ///
    /// A new sequence is remembered, so a resend of it reports `false`.
    pub fn is_sequence_new(&self, sequence: u32) -> bool {
        let is_new = self.received_sequences.try_enqueue(sequence);
        if !is_new {
            debug!("♻️ Duplicate reliable sequence {}", sequence);
        }
        is_new
    }

    /// Whether `sequence` is still inside the duplicate window
    pub fn has_seen(&self, sequence: u32) -> bool {
        self.received_sequences.contains(&sequence)
    }

    /// Record an inbound reliable packet.
    ///
    /// The ack is queued even for a duplicate since our earlier ack may have
    /// been lost; the return value says whether to process the packet.
    pub fn receive_reliable(&mut self, sequence: u32) -> bool {
        self.queue_ack(sequence);
        self.is_sequence_new(sequence)
    }

    /// Queue an acknowledgment to send
    pub fn queue_ack(&mut self, sequence: u32) {
        self.pending_acks.push(sequence);
    }

    /// Get and clear pending acknowledgments
    pub fn take_pending_acks(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.pending_acks)
    }

    /// Add a reliable packet waiting for acknowledgment
    pub fn add_pending_reliable(
        &mut self,
        sequence: u32,
        payload: Bytes,
    ) -> oneshot::Receiver<AckOutcome> {
        let (resolve_tx, resolve_rx) = oneshot::channel();
        let pending = PendingPacket {
            payload,
            sent_at: Instant::now(),
            retry_count: 0,
            resolve_tx: Some(resolve_tx),
        };
        if self.pending_reliable.insert(sequence, pending).is_some() {
            warn!("Replaced pending reliable packet with reused sequence {}", sequence);
        }
        resolve_rx
    }

    /// Handle received acknowledgment
    pub fn handle_ack(&mut self, sequence: u32) -> bool {
        if let Some(mut pending) = self.pending_reliable.remove(&sequence) {
            if let Some(tx) = pending.resolve_tx.take() {
                let _ = tx.send(AckOutcome::Acknowledged);
            }
            true
        } else {
            debug!("Received ACK for unknown/expired sequence {}", sequence);
            false
        }
    }

    /// Number of outbound packets still waiting for an ack
    pub fn pending_count(&self) -> usize {
        self.pending_reliable.len()
    }

    /// Get packets that need retransmission (exponential backoff)
    pub fn get_retransmits(
        &mut self,
        base_retry_timeout: Duration,
        max_retries: u8,
    ) -> Vec<Retransmit> {
        self.get_retransmits_at(Instant::now(), base_retry_timeout, max_retries)
    }

    fn get_retransmits_at(
        &mut self,
        now: Instant,
        base_retry_timeout: Duration,
        max_retries: u8,
    ) -> Vec<Retransmit> {
        let mut retransmits = Vec::new();
        let mut to_remove = Vec::new();

        for (sequence, pending) in &mut self.pending_reliable {
            // 2^retry_count * base_timeout
            let retry_timeout = base_retry_timeout * (1u32 << pending.retry_count.min(6));

            if now.saturating_duration_since(pending.sent_at) < retry_timeout {
                continue;
            }

            if pending.retry_count >= max_retries {
                warn!("Packet sequence {} failed after {} retries", sequence, pending.retry_count);
                to_remove.push(*sequence);
                if let Some(tx) = pending.resolve_tx.take() {
                    let _ = tx.send(AckOutcome::Expired);
                }
            } else {
                pending.retry_count += 1;
                pending.sent_at = now;

                retransmits.push(Retransmit {
                    sequence: *sequence,
                    payload: pending.payload.clone(),
                    attempt: pending.retry_count,
                });

                info!("🔄 Retransmitting packet sequence {} (attempt {}/{})",
                      sequence, pending.retry_count, max_retries);
            }
        }

        for seq in to_remove {
            self.pending_reliable.remove(&seq);
        }

        retransmits.sort_by_key(|r| r.sequence);
        retransmits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::dedup::DedupError;
    use crate::networking::NetworkError;

    #[test]
    fn test_duplicate_sequences_suppressed() {
        let ack = Acknowledger::with_window(DEFAULT_RECEIVED_WINDOW).unwrap();
        assert!(ack.is_sequence_new(10));
        assert!(!ack.is_sequence_new(10));
        assert!(ack.is_sequence_new(11));
        assert!(ack.has_seen(10));
    }

    #[test]
    fn test_window_forgets_old_sequences() {
        let ack = Acknowledger::with_window(2).unwrap();
        assert!(ack.is_sequence_new(1));
        assert!(ack.is_sequence_new(2));
        assert!(ack.is_sequence_new(3));

        // 1 fell out of the window, so a late resend is processed again
        assert!(!ack.has_seen(1));
        assert!(ack.is_sequence_new(1));
    }

    #[test]
    fn test_zero_window_rejected() {
        assert!(matches!(
            Acknowledger::with_window(0),
            Err(NetworkError::Dedup(DedupError::ZeroCapacity))
        ));
    }

    #[test]
    fn test_pending_acks_drain() {
        let mut ack = Acknowledger::with_window(DEFAULT_RECEIVED_WINDOW).unwrap();
        ack.queue_ack(1);
        ack.queue_ack(2);
        assert_eq!(ack.take_pending_acks(), vec![1, 2]);
        assert!(ack.take_pending_acks().is_empty());
    }

    #[test]
    fn test_duplicates_are_still_acked() {
        let mut ack = Acknowledger::with_window(DEFAULT_RECEIVED_WINDOW).unwrap();
        assert!(ack.receive_reliable(3));
        assert!(!ack.receive_reliable(3));
        assert_eq!(ack.take_pending_acks(), vec![3, 3]);
    }

    #[tokio::test]
    async fn test_ack_resolves_pending_packet() {
        let mut ack = Acknowledger::with_window(DEFAULT_RECEIVED_WINDOW).unwrap();
        let rx = ack.add_pending_reliable(5, Bytes::from_static(b"hello"));
        assert_eq!(ack.pending_count(), 1);

        assert!(ack.handle_ack(5));
        assert!(!ack.handle_ack(5));
        assert_eq!(rx.await.unwrap(), AckOutcome::Acknowledged);
        assert_eq!(ack.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_retransmit_backoff_and_expiry() {
        let mut ack = Acknowledger::with_window(DEFAULT_RECEIVED_WINDOW).unwrap();
        let rx = ack.add_pending_reliable(7, Bytes::from_static(b"payload"));
        let base = Duration::from_millis(100);
        let start = Instant::now();

        // Not yet due
        assert!(ack.get_retransmits_at(start, base, 2).is_empty());

        let first = ack.get_retransmits_at(start + base, base, 2);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].sequence, 7);
        assert_eq!(first[0].attempt, 1);

        // Second attempt waits twice as long
        let t1 = start + base;
        assert!(ack.get_retransmits_at(t1 + base, base, 2).is_empty());
        let second = ack.get_retransmits_at(t1 + base * 2, base, 2);
        assert_eq!(second[0].attempt, 2);

        let t2 = t1 + base * 2;
        assert!(ack.get_retransmits_at(t2 + base * 4, base, 2).is_empty());
        assert_eq!(ack.pending_count(), 0);
        assert_eq!(rx.await.unwrap(), AckOutcome::Expired);
    }
}
