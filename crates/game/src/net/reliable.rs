use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::error::TransportError;
use super::protocol::{Channel, Fragment, MAX_FRAGMENT_SIZE, MAX_FRAGMENTS, Reliability};

pub const SEND_WINDOW: usize = 256;
pub const RECEIVE_WINDOW: u32 = 1024;

const _: () = assert!((SEND_WINDOW as u32) < RECEIVE_WINDOW);

#[derive(Debug)]
struct InFlight {
    fragment: Fragment,
    last_sent: Option<Instant>,
}

/// Outgoing half of one reliable channel: fragments wait in a backlog until
/// the send window has room, then stay in flight until acknowledged.
#[derive(Debug)]
pub struct ReliableSender {
    channel: Channel,
    next_message_id: u32,
    backlog: VecDeque<Fragment>,
    in_flight: VecDeque<InFlight>,
}

impl ReliableSender {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            next_message_id: 0,
            backlog: VecDeque::new(),
            in_flight: VecDeque::with_capacity(SEND_WINDOW),
        }
    }

    pub fn queue(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let count = data.len().div_ceil(MAX_FRAGMENT_SIZE).max(1);
        if count > MAX_FRAGMENTS {
            return Err(TransportError::PayloadTooLarge {
                size: data.len(),
                limit: MAX_FRAGMENTS * MAX_FRAGMENT_SIZE,
            });
        }

        let mut chunks = data.chunks(MAX_FRAGMENT_SIZE);
        for index in 0..count {
            let message_id = self.next_message_id;
            self.next_message_id = self.next_message_id.wrapping_add(1);
            self.backlog.push_back(Fragment {
                channel: self.channel,
                reliability: Reliability::Reliable,
                message_id,
                index: index as u16,
                count: count as u16,
                data: chunks.next().map(<[u8]>::to_vec).unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Fragments that were never sent or whose last send is older than `rto`.
    /// Returns the fragments together with the number of resends among them.
    pub fn take_due(&mut self, now: Instant, rto: Duration) -> (Vec<Fragment>, u64) {
        // The span from the oldest unacked id to the newest stays under the
        // window so the receiver never sees an id it cannot buffer.
        while let Some(next) = self.backlog.front() {
            if let Some(oldest) = self.in_flight.front() {
                let span = next.message_id.wrapping_sub(oldest.fragment.message_id);
                if span >= SEND_WINDOW as u32 {
                    break;
                }
            }
            let Some(fragment) = self.backlog.pop_front() else {
                break;
            };
            self.in_flight.push_back(InFlight {
                fragment,
                last_sent: None,
            });
        }

        let mut due = Vec::new();
        let mut resends = 0;
        for entry in &mut self.in_flight {
            let send = match entry.last_sent {
                None => true,
                Some(at) if now.duration_since(at) >= rto => {
                    resends += 1;
                    true
                }
                Some(_) => false,
            };
            if send {
                entry.last_sent = Some(now);
                due.push(entry.fragment.clone());
            }
        }
        (due, resends)
    }

    pub fn acknowledge(&mut self, message_id: u32) {
        self.in_flight
            .retain(|entry| entry.fragment.message_id != message_id);
    }

    pub fn pending(&self) -> usize {
        self.backlog.len() + self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }
}

/// Incoming half of one reliable channel. Delivers complete messages in the
/// order they were sent, whatever order the fragments arrive in.
#[derive(Debug, Default)]
pub struct ReliableReceiver {
    next_expected: u32,
    buffered: HashMap<u32, Fragment>,
    assembly: Vec<u8>,
    next_index: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    New,
    Duplicate,
    OutOfWindow,
}

impl ReliableReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn receive(&mut self, fragment: Fragment, delivered: &mut Vec<Vec<u8>>) -> Accepted {
        let offset = fragment.message_id.wrapping_sub(self.next_expected);
        if offset > u32::MAX / 2 || self.buffered.contains_key(&fragment.message_id) {
            return Accepted::Duplicate;
        }
        if offset >= RECEIVE_WINDOW {
            return Accepted::OutOfWindow;
        }

        self.buffered.insert(fragment.message_id, fragment);

        while let Some(next) = self.buffered.remove(&self.next_expected) {
            self.next_expected = self.next_expected.wrapping_add(1);

            if next.index != self.next_index {
                log::warn!(
                    "channel {:?}: fragment {} out of order (expected {}), dropping message",
                    next.channel,
                    next.index,
                    self.next_index
                );
                self.assembly.clear();
                self.next_index = 0;
                continue;
            }

            self.assembly.extend_from_slice(&next.data);
            if next.is_last() {
                delivered.push(std::mem::take(&mut self.assembly));
                self.next_index = 0;
            } else {
                self.next_index += 1;
            }
        }

        Accepted::New
    }

    pub fn buffered(&self) -> usize {
        self.buffered.len()
    }
}
