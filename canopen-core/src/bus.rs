//! The network frame bus: a single-threaded, timer-driven frame router.
//! Nothing here touches a socket — frames go out through a user-supplied
//! transmit callback and come in through [`Bus::receive`], both of which
//! the surrounding binary (outside this crate's scope) is responsible for
//! wiring to a real CAN interface.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, HashSet};

use crate::error::CanOpenError;
use crate::frame::Frame;

/// A monotonic timestamp. Only ever compared/subtracted, never read as a
/// wall-clock date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Instant {
    pub secs: u64,
    pub nanos: u32,
}

impl Instant {
    pub const ZERO: Instant = Instant { secs: 0, nanos: 0 };

    pub fn new(secs: u64, nanos: u32) -> Self {
        Instant { secs, nanos }
    }

    pub fn from_millis(millis: u64) -> Self {
        Instant {
            secs: millis / 1000,
            nanos: ((millis % 1000) * 1_000_000) as u32,
        }
    }

    pub fn checked_add_millis(self, millis: u64) -> Instant {
        let total_nanos = self.nanos as u64 + (millis % 1000) * 1_000_000;
        Instant {
            secs: self.secs + millis / 1000 + total_nanos / 1_000_000_000,
            nanos: (total_nanos % 1_000_000_000) as u32,
        }
    }

    pub fn saturating_sub_millis(self, other: Instant) -> u64 {
        if self < other {
            return 0;
        }
        let secs = self.secs - other.secs;
        let (nanos, borrow) = if self.nanos >= other.nanos {
            (self.nanos - other.nanos, 0)
        } else {
            (self.nanos + 1_000_000_000 - other.nanos, 1)
        };
        (secs - borrow) * 1000 + (nanos / 1_000_000) as u64
    }
}

/// Opaque handle to a registered timer. Deregistration is idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken(u64);

/// Opaque handle to a registered receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReceiverToken(u64);

/// A timer's configuration: an optional absolute start (defaulting to
/// "now" at registration) and an optional period (0 = one-shot).
#[derive(Debug, Clone, Copy)]
pub struct TimerSpec {
    pub start: Instant,
    pub period_millis: u64,
}

impl TimerSpec {
    pub fn one_shot(deadline: Instant) -> Self {
        TimerSpec {
            start: deadline,
            period_millis: 0,
        }
    }

    pub fn periodic(first: Instant, period_millis: u64) -> Self {
        TimerSpec {
            start: first,
            period_millis,
        }
    }
}

pub type TimerCallback = Box<dyn FnMut(&mut Bus, Instant)>;
pub type ReceiverCallback = Box<dyn FnMut(&mut Bus, &Frame)>;
pub type TransmitCallback = Box<dyn FnMut(&Frame) -> Result<(), CanOpenError>>;

struct TimerRecord {
    deadline: Instant,
    period_millis: u64,
    /// Taken out for the duration of a firing so the callback can be
    /// invoked with `&mut Bus`; the record itself stays in `timer_store`
    /// so a self-cancellation during the callback is observed afterward
    /// instead of being silently overwritten by the rearm.
    callback: Option<TimerCallback>,
    /// Set to `false` by [`Bus::cancel_timer`]; lazily dropped when popped.
    active: bool,
}

struct ReceiverRecord {
    can_id: u32,
    required_flags: u8,
    /// Taken out for the duration of a dispatch so the callback can be
    /// invoked with `&mut Bus` without aliasing this record; put back
    /// afterward unless the receiver unregistered itself meanwhile.
    callback: Option<ReceiverCallback>,
    seq: u64,
}

#[derive(PartialEq, Eq)]
struct HeapEntry {
    deadline: Instant,
    seq: u64,
    token: TimerToken,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline (then
        // earliest registration) sorts to the top.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Required flag bits a receiver can require a match on (see [`Flags`](crate::frame::Flags)).
pub mod flag_bits {
    pub const IDE: u8 = 0b0001;
    pub const RTR: u8 = 0b0010;
    pub const FDF: u8 = 0b0100;
}

fn frame_flag_bits(frame: &Frame) -> u8 {
    let mut bits = 0;
    if frame.flags.ide {
        bits |= flag_bits::IDE;
    }
    if frame.flags.rtr {
        bits |= flag_bits::RTR;
    }
    if frame.flags.fdf {
        bits |= flag_bits::FDF;
    }
    bits
}

/// The logical CAN network: current time, transmit callback, timer wheel,
/// and receiver registry.
pub struct Bus {
    time: Instant,
    transmit: Option<TransmitCallback>,
    timers: BinaryHeap<HeapEntry>,
    timer_store: BTreeMap<TimerToken, TimerRecord>,
    receivers: BTreeMap<u32, Vec<ReceiverToken>>,
    receiver_store: BTreeMap<ReceiverToken, ReceiverRecord>,
    next_timer_token: u64,
    next_receiver_token: u64,
    next_seq: u64,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub fn new() -> Self {
        Bus {
            time: Instant::ZERO,
            transmit: None,
            timers: BinaryHeap::new(),
            timer_store: BTreeMap::new(),
            receivers: BTreeMap::new(),
            receiver_store: BTreeMap::new(),
            next_timer_token: 0,
            next_receiver_token: 0,
            next_seq: 0,
        }
    }

    pub fn set_transmit(&mut self, cb: TransmitCallback) {
        self.transmit = Some(cb);
    }

    pub fn now(&self) -> Instant {
        self.time
    }

    /// Delegate `frame` to the installed transmit callback.
    pub fn send(&mut self, frame: &Frame) -> Result<(), CanOpenError> {
        match self.transmit.as_mut() {
            Some(cb) => cb(frame),
            None => {
                log::warn!("send({}) dropped: no transmit callback installed", frame);
                Ok(())
            }
        }
    }

    /// Register a receiver matching `can_id` and the flag bits in
    /// `required_flags` (see [`flag_bits`]). Coexisting receivers on the
    /// same (id, flags) all fire, in registration order.
    pub fn register_receiver(
        &mut self,
        can_id: u32,
        required_flags: u8,
        callback: ReceiverCallback,
    ) -> ReceiverToken {
        let token = ReceiverToken(self.next_receiver_token);
        self.next_receiver_token += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.receiver_store.insert(
            token,
            ReceiverRecord {
                can_id,
                required_flags,
                callback: Some(callback),
                seq,
            },
        );
        self.receivers.entry(can_id).or_default().push(token);
        token
    }

    pub fn unregister_receiver(&mut self, token: ReceiverToken) {
        if let Some(record) = self.receiver_store.remove(&token) {
            if let Some(bucket) = self.receivers.get_mut(&record.can_id) {
                bucket.retain(|t| *t != token);
            }
        }
    }

    /// Dispatch `frame` to every receiver matching its (id, flags).
    /// Callbacks may mutate the receiver set; iteration is by stable
    /// token, so removed receivers never fire and newly removed ones are
    /// never revisited.
    pub fn receive(&mut self, frame: Frame) {
        let Some(bucket) = self.receivers.get(&frame.id) else {
            return;
        };
        let frame_flags = frame_flag_bits(&frame);
        let mut matching: Vec<(u64, ReceiverToken)> = bucket
            .iter()
            .filter_map(|token| {
                let record = self.receiver_store.get(token)?;
                if record.required_flags & frame_flags == record.required_flags {
                    Some((record.seq, *token))
                } else {
                    None
                }
            })
            .collect();
        matching.sort_by_key(|(seq, _)| *seq);

        for (_, token) in matching {
            // The receiver may have been unregistered by an earlier
            // callback in this same dispatch; skip it rather than fire it.
            let Some(mut callback) = self
                .receiver_store
                .get_mut(&token)
                .and_then(|record| record.callback.take())
            else {
                continue;
            };
            callback(self, &frame);
            // Put the callback back unless the receiver unregistered
            // itself (or was unregistered by another callback) meanwhile.
            if let Some(record) = self.receiver_store.get_mut(&token) {
                record.callback = Some(callback);
            }
        }
    }

    pub fn register_timer(&mut self, spec: TimerSpec, callback: TimerCallback) -> TimerToken {
        let token = TimerToken(self.next_timer_token);
        self.next_timer_token += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.timer_store.insert(
            token,
            TimerRecord {
                deadline: spec.start,
                period_millis: spec.period_millis,
                callback: Some(callback),
                active: true,
            },
        );
        self.timers.push(HeapEntry {
            deadline: spec.start,
            seq,
            token,
        });
        token
    }

    /// Idempotent: cancelling an already-cancelled or unknown token is a
    /// no-op. Marks the record inactive rather than removing it outright,
    /// so a timer cancelling itself from within its own callback is
    /// observed once the callback returns (see [`Bus::advance_time`]).
    pub fn cancel_timer(&mut self, token: TimerToken) {
        if let Some(record) = self.timer_store.get_mut(&token) {
            record.active = false;
        }
    }

    /// Advance to `new_time`, firing every timer whose deadline has
    /// elapsed in deadline order (ties broken by registration order). A
    /// periodic timer that rearms to a deadline at or before `new_time`
    /// fires again within this same call — except a single token is never
    /// fired twice in one call, which bounds the livelock a timer that
    /// keeps rearming into the past would otherwise cause.
    pub fn advance_time(&mut self, new_time: Instant) -> Result<(), CanOpenError> {
        if new_time < self.time {
            return Err(CanOpenError::ClockWentBackward {
                last: self.time,
                given: new_time,
            });
        }
        self.time = new_time;
        let mut fired_this_tick: HashSet<TimerToken> = HashSet::new();

        loop {
            let Some(top) = self.timers.peek() else {
                break;
            };
            if top.deadline > self.time {
                break;
            }
            let entry = self.timers.pop().unwrap();
            // Lazily drop entries for cancelled/rearmed-away timers.
            let Some(record) = self.timer_store.get(&entry.token) else {
                continue;
            };
            if !record.active || record.deadline != entry.deadline {
                continue;
            }
            if fired_this_tick.contains(&entry.token) {
                // Already fired once this tick; requeue for the next call
                // rather than spin forever.
                continue;
            }
            fired_this_tick.insert(entry.token);

            let Some(mut callback) = self
                .timer_store
                .get_mut(&entry.token)
                .and_then(|record| record.callback.take())
            else {
                continue;
            };
            callback(self, self.time);

            // The callback may have cancelled this very timer (or any
            // other). Only rearm if it's still in the store and active.
            let Some(record) = self.timer_store.get_mut(&entry.token) else {
                continue;
            };
            if !record.active {
                self.timer_store.remove(&entry.token);
                continue;
            }
            record.callback = Some(callback);
            if record.period_millis > 0 {
                record.deadline = record.deadline.checked_add_millis(record.period_millis);
                let seq = self.next_seq;
                self.next_seq += 1;
                self.timers.push(HeapEntry {
                    deadline: record.deadline,
                    seq,
                    token: entry.token,
                });
            } else {
                // One-shot timers are simply not reinserted into the heap;
                // drop the now-dead record too.
                self.timer_store.remove(&entry.token);
            }
        }
        Ok(())
    }
}
