//! NMT service: node state machine, heartbeat/node-guarding producer and
//! consumer, SYNC and TIME producer/consumer, and the emergency producer.
//!
//! As with [`crate::pdo`], every piece here is a plain state machine with
//! no `Bus` dependency; [`crate::driver`] owns the timers and receivers
//! that drive it.

use std::collections::VecDeque;

use enum_display_derive::Display;
use num_enum::TryFromPrimitive;

/// The four states a node's error-control byte can carry. `Bootup` is
/// transient: it is the payload of the one-shot bootup frame, never a
/// resting state.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum NmtState {
    Bootup = 0,
    Stopped = 4,
    Operational = 5,
    PreOperational = 127,
}

/// An NMT command-specifier byte (CiA 301 table 33), received on
/// [`crate::frame::cob_id::NMT_COMMAND`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmtCommand {
    Start,
    Stop,
    EnterPreOperational,
    ResetNode,
    ResetCommunication,
}

impl NmtCommand {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(NmtCommand::Start),
            2 => Some(NmtCommand::Stop),
            128 => Some(NmtCommand::EnterPreOperational),
            129 => Some(NmtCommand::ResetNode),
            130 => Some(NmtCommand::ResetCommunication),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            NmtCommand::Start => 1,
            NmtCommand::Stop => 2,
            NmtCommand::EnterPreOperational => 128,
            NmtCommand::ResetNode => 129,
            NmtCommand::ResetCommunication => 130,
        }
    }
}

/// What applying an [`NmtCommand`] did. A reset doesn't carry a new
/// `NmtState` itself -- the driver is
/// expected to reinitialize (communication parameters, or the whole
/// dictionary) and then re-enter pre-operational, emitting a fresh
/// bootup frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmtEffect {
    StateChanged(NmtState),
    ResetNode,
    ResetCommunication,
    /// The command's target node-id didn't match ours.
    Ignored,
}

/// The local node's NMT slave state machine.
#[derive(Debug)]
pub struct NmtSlave {
    node_id: u8,
    state: NmtState,
}

impl NmtSlave {
    /// A freshly constructed slave starts in pre-operational, mirroring
    /// the initialization → pre-operational transition on power-up; the
    /// caller is expected to send [`NmtSlave::bootup_frame`] once.
    pub fn new(node_id: u8) -> Self {
        NmtSlave { node_id, state: NmtState::PreOperational }
    }

    pub fn state(&self) -> NmtState {
        self.state
    }

    pub fn bootup_frame(&self) -> [u8; 1] {
        [NmtState::Bootup as u8]
    }

    pub fn heartbeat_frame(&self) -> [u8; 1] {
        [self.state as u8]
    }

    /// Apply a received NMT command addressed to `target_node` (0 = all
    /// nodes; byte 0 = command specifier, byte 1 = target node).
    pub fn apply_command(&mut self, command: NmtCommand, target_node: u8) -> NmtEffect {
        if target_node != 0 && target_node != self.node_id {
            return NmtEffect::Ignored;
        }
        match command {
            NmtCommand::Start => {
                self.state = NmtState::Operational;
                NmtEffect::StateChanged(self.state)
            }
            NmtCommand::Stop => {
                self.state = NmtState::Stopped;
                NmtEffect::StateChanged(self.state)
            }
            NmtCommand::EnterPreOperational => {
                self.state = NmtState::PreOperational;
                NmtEffect::StateChanged(self.state)
            }
            NmtCommand::ResetNode => NmtEffect::ResetNode,
            NmtCommand::ResetCommunication => NmtEffect::ResetCommunication,
        }
    }

    /// Reinitialize communication state after a reset command; the
    /// caller still has to emit a fresh bootup frame.
    pub fn reset_to_preoperational(&mut self) {
        self.state = NmtState::PreOperational;
    }
}

/// Why a [`HeartbeatEvent`] fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatReason {
    Timeout,
    State,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatEvent {
    pub node_id: u8,
    pub reason: HeartbeatReason,
    pub state: Option<NmtState>,
}

/// Per-monitored-node heartbeat consumer.
#[derive(Debug)]
pub struct HeartbeatConsumer {
    node_id: u8,
    last_state: Option<NmtState>,
}

impl HeartbeatConsumer {
    pub fn new(node_id: u8) -> Self {
        HeartbeatConsumer { node_id, last_state: None }
    }

    /// A heartbeat (or bootup) frame arrived; fires a `State` event iff
    /// the carried state differs from the last one seen.
    pub fn on_heartbeat(&mut self, raw_state: u8) -> Option<HeartbeatEvent> {
        let state = NmtState::try_from(raw_state).ok()?;
        if self.last_state == Some(state) {
            return None;
        }
        self.last_state = Some(state);
        Some(HeartbeatEvent { node_id: self.node_id, reason: HeartbeatReason::State, state: Some(state) })
    }

    /// The monitoring timer expired with no heartbeat since it was last
    /// armed.
    pub fn on_timeout(&mut self) -> HeartbeatEvent {
        self.last_state = None;
        HeartbeatEvent { node_id: self.node_id, reason: HeartbeatReason::Timeout, state: None }
    }
}

/// A node-guarding occurrence/resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeGuardEvent {
    pub node_id: u8,
    pub occurred: bool,
}

/// Legacy RTR-based alternative to the heartbeat protocol: the master
/// polls at `guard_time_ms`; missing `life_time_factor` consecutive
/// responses fails the node.
#[derive(Debug)]
pub struct NodeGuardMonitor {
    node_id: u8,
    life_time_factor: u8,
    consecutive_misses: u8,
    failed: bool,
}

impl NodeGuardMonitor {
    pub fn new(node_id: u8, life_time_factor: u8) -> Self {
        NodeGuardMonitor { node_id, life_time_factor, consecutive_misses: 0, failed: false }
    }

    /// A guarding response arrived in time; resets the miss counter and
    /// fires a `Resolved` event if the node had previously failed.
    pub fn on_response(&mut self) -> Option<NodeGuardEvent> {
        self.consecutive_misses = 0;
        if self.failed {
            self.failed = false;
            Some(NodeGuardEvent { node_id: self.node_id, occurred: false })
        } else {
            None
        }
    }

    /// The scheduled RTR poll went unanswered before the guard interval
    /// elapsed again.
    pub fn on_missed(&mut self) -> Option<NodeGuardEvent> {
        self.consecutive_misses = self.consecutive_misses.saturating_add(1);
        if !self.failed && self.consecutive_misses >= self.life_time_factor {
            self.failed = true;
            Some(NodeGuardEvent { node_id: self.node_id, occurred: true })
        } else {
            None
        }
    }
}

/// SYNC producer: emits an optional wrapping counter (1..240), or no
/// payload at all when the configured maximum is 0.
#[derive(Debug)]
pub struct SyncProducer {
    counter_max: u8,
    counter: u8,
}

impl SyncProducer {
    pub fn new(counter_max: u8) -> Self {
        SyncProducer { counter_max, counter: 0 }
    }

    pub fn next_payload(&mut self) -> Vec<u8> {
        if self.counter_max == 0 {
            return Vec::new();
        }
        self.counter = if self.counter >= self.counter_max { 1 } else { self.counter + 1 };
        vec![self.counter]
    }
}

/// SYNC consumer: tracks the last counter value seen, if any.
#[derive(Debug, Default)]
pub struct SyncConsumer {
    last_counter: Option<u8>,
}

impl SyncConsumer {
    pub fn new() -> Self {
        SyncConsumer::default()
    }

    pub fn on_sync(&mut self, payload: &[u8]) -> Option<u8> {
        self.last_counter = payload.first().copied();
        self.last_counter
    }
}

/// TIME producer/consumer: encodes/decodes the 6-byte TIME_OF_DAY payload
/// on [`crate::frame::cob_id::TIME`].
pub struct TimeService;

impl TimeService {
    pub fn encode(days: u16, ms: u32) -> [u8; 6] {
        let bytes = crate::value::Value::TimeOfDay { days, ms }.to_bytes();
        let mut out = [0u8; 6];
        out.copy_from_slice(&bytes);
        out
    }

    pub fn decode(data: &[u8]) -> Option<(u16, u32)> {
        let (value, _) = crate::value::Value::parse(crate::value::DataType::TimeOfDay, data).ok()?;
        match value {
            crate::value::Value::TimeOfDay { days, ms } => Some((days, ms)),
            _ => None,
        }
    }
}

/// One emergency message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmergencyEvent {
    pub error_code: u16,
    pub error_register: u8,
    pub manufacturer: [u8; 5],
}

impl EmergencyEvent {
    pub fn to_payload(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0..2].copy_from_slice(&self.error_code.to_le_bytes());
        out[2] = self.error_register;
        out[3..8].copy_from_slice(&self.manufacturer);
        out
    }

    pub fn from_payload(data: &[u8; 8]) -> Self {
        EmergencyEvent {
            error_code: u16::from_le_bytes([data[0], data[1]]),
            error_register: data[2],
            manufacturer: [data[3], data[4], data[5], data[6], data[7]],
        }
    }
}

const EMERGENCY_HISTORY_CAP: usize = 16;

/// Local emergency producer: builds the frame payload and keeps a
/// recent-errors ring buffer.
#[derive(Debug)]
pub struct EmergencyProducer {
    node_id: u8,
    history: VecDeque<EmergencyEvent>,
}

impl EmergencyProducer {
    pub fn new(node_id: u8) -> Self {
        EmergencyProducer { node_id, history: VecDeque::with_capacity(EMERGENCY_HISTORY_CAP) }
    }

    /// Record `event` and return the (cob-id, payload) pair to transmit.
    pub fn raise(&mut self, error_code: u16, error_register: u8, manufacturer: [u8; 5]) -> (u32, [u8; 8]) {
        let event = EmergencyEvent { error_code, error_register, manufacturer };
        if self.history.len() >= EMERGENCY_HISTORY_CAP {
            self.history.pop_front();
        }
        self.history.push_back(event);
        (crate::frame::cob_id::emergency(self.node_id), event.to_payload())
    }

    pub fn history(&self) -> impl Iterator<Item = &EmergencyEvent> {
        self.history.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nmt_command_ignores_other_nodes() {
        let mut slave = NmtSlave::new(5);
        assert_eq!(slave.apply_command(NmtCommand::Start, 6), NmtEffect::Ignored);
        assert_eq!(slave.state(), NmtState::PreOperational);
    }

    #[test]
    fn nmt_command_broadcast_applies_to_everyone() {
        let mut slave = NmtSlave::new(5);
        assert_eq!(slave.apply_command(NmtCommand::Start, 0), NmtEffect::StateChanged(NmtState::Operational));
        assert_eq!(slave.state(), NmtState::Operational);
    }

    #[test]
    fn reset_node_does_not_change_state_directly() {
        let mut slave = NmtSlave::new(5);
        slave.apply_command(NmtCommand::Start, 5);
        assert_eq!(slave.apply_command(NmtCommand::ResetNode, 5), NmtEffect::ResetNode);
        slave.reset_to_preoperational();
        assert_eq!(slave.state(), NmtState::PreOperational);
    }

    #[test]
    fn heartbeat_frame_carries_current_state_byte() {
        let mut slave = NmtSlave::new(5);
        slave.apply_command(NmtCommand::Start, 5);
        assert_eq!(slave.heartbeat_frame(), [5]);
        assert_eq!(slave.bootup_frame(), [0]);
    }

    #[test]
    fn heartbeat_consumer_fires_state_event_once_per_change() {
        let mut consumer = HeartbeatConsumer::new(3);
        let first = consumer.on_heartbeat(127).unwrap();
        assert_eq!(first.reason, HeartbeatReason::State);
        assert!(consumer.on_heartbeat(127).is_none());
        let second = consumer.on_heartbeat(5).unwrap();
        assert_eq!(second.state, Some(NmtState::Operational));
    }

    #[test]
    fn heartbeat_consumer_timeout_resets_last_state() {
        let mut consumer = HeartbeatConsumer::new(3);
        consumer.on_heartbeat(5).unwrap();
        let event = consumer.on_timeout();
        assert_eq!(event.reason, HeartbeatReason::Timeout);
        assert!(consumer.on_heartbeat(5).is_some());
    }

    #[test]
    fn node_guard_fires_occurred_then_resolved() {
        let mut monitor = NodeGuardMonitor::new(9, 2);
        assert!(monitor.on_missed().is_none());
        let occurred = monitor.on_missed().unwrap();
        assert!(occurred.occurred);
        let resolved = monitor.on_response().unwrap();
        assert!(!resolved.occurred);
    }

    #[test]
    fn sync_producer_wraps_counter() {
        let mut producer = SyncProducer::new(3);
        assert_eq!(producer.next_payload(), vec![1]);
        assert_eq!(producer.next_payload(), vec![2]);
        assert_eq!(producer.next_payload(), vec![3]);
        assert_eq!(producer.next_payload(), vec![1]);
    }

    #[test]
    fn sync_producer_disabled_counter_sends_empty_payload() {
        let mut producer = SyncProducer::new(0);
        assert!(producer.next_payload().is_empty());
    }

    #[test]
    fn time_of_day_round_trips() {
        let encoded = TimeService::encode(100, 12345);
        assert_eq!(TimeService::decode(&encoded), Some((100, 12345)));
    }

    #[test]
    fn emergency_producer_builds_payload_and_caps_history() {
        let mut producer = EmergencyProducer::new(5);
        let (cob_id, payload) = producer.raise(0x1000, 0x01, [0, 0, 0, 0, 0]);
        assert_eq!(cob_id, 0x085);
        assert_eq!(&payload[0..2], &0x1000u16.to_le_bytes());
        for i in 0..EMERGENCY_HISTORY_CAP + 5 {
            producer.raise(i as u16, 0, [0; 5]);
        }
        assert_eq!(producer.history().count(), EMERGENCY_HISTORY_CAP);
    }
}
