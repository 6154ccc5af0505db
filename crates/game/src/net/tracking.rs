use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::protocol::sequence_greater_than;

const ACK_WINDOW: u32 = 32;
const MIN_RTO: Duration = Duration::from_millis(50);
const MAX_RTO: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SentPacket {
    pub sequence: u32,
    pub send_time: Instant,
    pub acked: bool,
}

/// Outgoing packet sequences awaiting acknowledgement, with an RTT estimate
/// fed by every ack.
#[derive(Debug)]
pub struct AckTracker {
    sent: VecDeque<SentPacket>,
    max_tracked: usize,
    srtt: f32,
    rtt_var: f32,
}

impl AckTracker {
    pub fn new(max_tracked: usize) -> Self {
        Self {
            sent: VecDeque::with_capacity(max_tracked),
            max_tracked,
            srtt: 100.0,
            rtt_var: 50.0,
        }
    }

    pub fn track_packet(&mut self, sequence: u32, now: Instant) {
        while self.sent.len() >= self.max_tracked {
            self.sent.pop_front();
        }

        self.sent.push_back(SentPacket {
            sequence,
            send_time: now,
            acked: false,
        });
    }

    /// Marks every tracked packet covered by `ack`/`ack_bitfield` and returns
    /// their sequences.
    pub fn process_ack(&mut self, ack: u32, ack_bitfield: u32, now: Instant) -> Vec<u32> {
        let mut acked = Vec::new();
        let mut rtt_samples = Vec::new();

        for sent in &mut self.sent {
            if sent.acked {
                continue;
            }

            let covered = if sent.sequence == ack {
                true
            } else if sequence_greater_than(ack, sent.sequence) {
                let diff = ack.wrapping_sub(sent.sequence);
                diff <= ACK_WINDOW && (ack_bitfield & (1 << (diff - 1))) != 0
            } else {
                false
            };

            if covered {
                sent.acked = true;
                acked.push(sent.sequence);
                rtt_samples.push(now.duration_since(sent.send_time).as_secs_f32() * 1000.0);
            }
        }

        for rtt in rtt_samples {
            self.update_rtt(rtt);
        }

        while self.sent.front().is_some_and(|p| p.acked) {
            self.sent.pop_front();
        }

        acked
    }

    fn update_rtt(&mut self, rtt: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        let diff = (rtt - self.srtt).abs();
        self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
        self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
    }

    pub fn srtt(&self) -> f32 {
        self.srtt
    }

    pub fn rtt_var(&self) -> f32 {
        self.rtt_var
    }

    pub fn rto(&self) -> Duration {
        let ms = self.srtt + 4.0 * self.rtt_var;
        Duration::from_secs_f32(ms.max(0.0) / 1000.0).clamp(MIN_RTO, MAX_RTO)
    }

    pub fn unacked_count(&self) -> usize {
        self.sent.iter().filter(|p| !p.acked).count()
    }
}

/// Incoming packet sequences: duplicate filtering plus the ack/bitfield pair
/// echoed back in every outgoing header.
#[derive(Debug)]
pub struct ReceiveTracker {
    last_received: u32,
    received_bitfield: u32,
    any_received: bool,
    recent: VecDeque<u32>,
    max_recent: usize,
}

impl Default for ReceiveTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self {
            last_received: 0,
            received_bitfield: 0,
            any_received: false,
            recent: VecDeque::with_capacity(256),
            max_recent: 256,
        }
    }

    /// Returns `false` for a sequence already seen.
    pub fn record_received(&mut self, sequence: u32) -> bool {
        if self.recent.contains(&sequence) {
            return false;
        }

        if self.recent.len() >= self.max_recent {
            self.recent.pop_front();
        }
        self.recent.push_back(sequence);

        if !self.any_received {
            self.any_received = true;
            self.last_received = sequence;
            self.received_bitfield = 0;
        } else if sequence_greater_than(sequence, self.last_received) {
            let diff = sequence.wrapping_sub(self.last_received);
            self.received_bitfield = if diff <= ACK_WINDOW {
                // The previous head moves into bit `diff - 1`.
                ((self.received_bitfield as u64) << diff | 1u64 << (diff - 1)) as u32
            } else {
                0
            };
            self.last_received = sequence;
        } else {
            let diff = self.last_received.wrapping_sub(sequence);
            if diff > 0 && diff <= ACK_WINDOW {
                self.received_bitfield |= 1 << (diff - 1);
            }
        }

        true
    }

    pub fn ack_data(&self) -> (u32, u32) {
        (self.last_received, self.received_bitfield)
    }
}
