//! Driver binding: lifts the protocol engine into a user-visible device
//! view, wiring a [`Dictionary`], [`SdoServer`], and [`PdoEngine`] to a
//! [`Bus`] via registered receivers and timers.
//!
//! Every other module in this crate is a plain state machine with no
//! `Bus` dependency (see their module docs); this is the one place that
//! owns timer tokens and receiver tokens and actually calls `bus.send`.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use crate::bus::{Bus, Instant, ReceiverToken, TimerSpec, TimerToken};
use crate::dictionary::Dictionary;
use crate::error::CanOpenError;
use crate::frame::{cob_id, Frame};
use crate::nmt::{
    EmergencyEvent, EmergencyProducer, HeartbeatConsumer, HeartbeatEvent, NmtCommand, NmtEffect,
    NmtSlave, NodeGuardEvent, NodeGuardMonitor, SyncConsumer,
};
use crate::pdo::PdoEngine;
use crate::sdo::SdoServer;

/// Queue of (index, sub_index) pairs written while a caller only held
/// `&mut Dictionary`, not `&mut Bus` — [`Dictionary::set_tpdo_event`]'s
/// callback has to be `Send`, so this can't be an `Rc<RefCell<_>>`. The
/// driver, which does hold `&mut Bus`, drains it after every
/// dictionary-mutating operation.
type PendingEvents = Arc<Mutex<Vec<(u16, u8)>>>;

const SDO_TIMEOUT_MS: u64 = 1000;

/// Events a [`LocalNode`] (or a [`SubDriver`] monitoring a remote one)
/// reports: NMT command application, RPDO write arrival, SYNC tick,
/// heartbeat, boot completion, a CAN-level send failure, an emergency, or
/// a node-guarding occurrence/resolution. Every method has a no-op
/// default; implement only the ones a particular device cares about.
pub trait NodeCallbacks {
    fn on_nmt_command(&mut self, _effect: NmtEffect) {}
    fn on_rpdo_write(&mut self, _rpdo_number: usize) {}
    fn on_sync_tick(&mut self, _counter: Option<u8>) {}
    fn on_heartbeat(&mut self, _event: HeartbeatEvent) {}
    fn on_boot_complete(&mut self) {}
    /// `bus.send` failed (or the frame itself couldn't be built), e.g. the
    /// installed transmit callback reported a transport fault.
    fn on_can_error(&mut self, _error: CanOpenError) {}
    /// An emergency frame was raised locally ([`LocalNode::raise_emergency`])
    /// or received from `_from_node` (a [`SubDriver`] monitoring it).
    fn on_emergency(&mut self, _from_node: u8, _event: EmergencyEvent) {}
    /// A monitored node's legacy RTR-based guarding state changed.
    fn on_node_guard(&mut self, _event: NodeGuardEvent) {}
}

fn send<C: NodeCallbacks>(bus: &mut Bus, callbacks: &Rc<RefCell<C>>, cob_id: u32, payload: &[u8]) {
    match Frame::new_std(cob_id, payload) {
        Ok(frame) => {
            if let Err(error) = bus.send(&frame) {
                callbacks.borrow_mut().on_can_error(error);
            }
        }
        Err(error) => callbacks.borrow_mut().on_can_error(error),
    }
}

/// One CANopen node bound to a [`Bus`]: the dictionary, SDO server, PDO
/// engine, and NMT slave. Construct with [`LocalNode::attach`], which
/// registers every receiver/timer this node needs and emits the initial
/// bootup frame.
pub struct LocalNode<C: NodeCallbacks + 'static> {
    node_id: u8,
    dict: Rc<RefCell<Dictionary>>,
    pdo: Rc<RefCell<PdoEngine>>,
    pending_tpdo_events: PendingEvents,
    emergency: Rc<RefCell<EmergencyProducer>>,
    sdo_rx: ReceiverToken,
    nmt_rx: ReceiverToken,
    sync_rx: ReceiverToken,
    rpdo_rx: Vec<ReceiverToken>,
    heartbeat_timer: TimerToken,
    callbacks: Rc<RefCell<C>>,
}

impl<C: NodeCallbacks + 'static> LocalNode<C> {
    /// Wire a node for `node_id` onto `bus`, registering its SDO server,
    /// NMT command, SYNC, and RPDO receivers, its heartbeat producer
    /// timer, and flushing the initial bootup frame.
    pub fn attach(
        bus: &mut Bus,
        node_id: u8,
        dict: Rc<RefCell<Dictionary>>,
        pdo: Rc<RefCell<PdoEngine>>,
        heartbeat_period_ms: u64,
        callbacks: C,
    ) -> Self {
        let callbacks = Rc::new(RefCell::new(callbacks));
        let nmt = Rc::new(RefCell::new(NmtSlave::new(node_id)));
        let sync_consumer = Rc::new(RefCell::new(SyncConsumer::new()));
        let pending_tpdo_events: PendingEvents = Arc::new(Mutex::new(Vec::new()));

        {
            let dict_cb = dict.clone();
            let pending = pending_tpdo_events.clone();
            dict_cb.borrow_mut().set_tpdo_event(Box::new(move |index, sub_index| {
                pending.lock().unwrap().push((index, sub_index));
            }));
        }

        let sdo_state = Rc::new(RefCell::new(SdoServer::new()));
        let sdo_timeout: Rc<RefCell<Option<TimerToken>>> = Rc::new(RefCell::new(None));

        let sdo_rx = {
            let dict = dict.clone();
            let pdo = pdo.clone();
            let pending = pending_tpdo_events.clone();
            let server = sdo_state.clone();
            let sdo_timeout = sdo_timeout.clone();
            let callbacks = callbacks.clone();
            bus.register_receiver(
                cob_id::sdo_rx(node_id),
                0,
                Box::new(move |bus, frame| {
                    let mut data = [0u8; 8];
                    let n = frame.data().len().min(8);
                    data[..n].copy_from_slice(&frame.data()[..n]);
                    let outcome = server.borrow_mut().on_request(&mut dict.borrow_mut(), &data);
                    if let Some(old) = sdo_timeout.borrow_mut().take() {
                        bus.cancel_timer(old);
                    }
                    if let Some(reply) = outcome.reply {
                        send(bus, &callbacks, cob_id::sdo_tx(node_id), &reply);
                    }
                    if outcome.arm_timeout {
                        let server = server.clone();
                        let sdo_timeout_inner = sdo_timeout.clone();
                        let callbacks = callbacks.clone();
                        let deadline = bus.now().checked_add_millis(SDO_TIMEOUT_MS);
                        let token = bus.register_timer(
                            TimerSpec::one_shot(deadline),
                            Box::new(move |bus, _now| {
                                let frame = server.borrow_mut().on_timeout();
                                sdo_timeout_inner.borrow_mut().take();
                                send(bus, &callbacks, cob_id::sdo_tx(node_id), &frame);
                            }),
                        );
                        *sdo_timeout.borrow_mut() = Some(token);
                    }
                    let now = bus.now();
                    flush_tpdo_events(bus, &dict, &pdo, &pending, now, &callbacks);
                }),
            )
        };

        let nmt_rx = {
            let nmt = nmt.clone();
            let callbacks = callbacks.clone();
            bus.register_receiver(
                cob_id::NMT_COMMAND,
                0,
                Box::new(move |bus, frame| {
                    let data = frame.data();
                    if data.len() < 2 {
                        return;
                    }
                    let Some(command) = NmtCommand::from_u8(data[0]) else {
                        return;
                    };
                    let effect = nmt.borrow_mut().apply_command(command, data[1]);
                    if let NmtEffect::ResetNode | NmtEffect::ResetCommunication = effect {
                        nmt.borrow_mut().reset_to_preoperational();
                        let frame = nmt.borrow().bootup_frame();
                        send(bus, &callbacks, cob_id::error_control(node_id), &frame);
                    }
                    callbacks.borrow_mut().on_nmt_command(effect);
                }),
            )
        };

        let sync_rx = {
            let sync_consumer = sync_consumer.clone();
            let pdo = pdo.clone();
            let dict = dict.clone();
            let callbacks = callbacks.clone();
            bus.register_receiver(
                cob_id::SYNC,
                0,
                Box::new(move |bus, frame| {
                    let counter = sync_consumer.borrow_mut().on_sync(frame.data());
                    callbacks.borrow_mut().on_sync_tick(counter);
                    let now = bus.now();
                    let frames = pdo.borrow_mut().on_sync(now, &mut dict.borrow_mut());
                    for (tpdo_number, payload) in frames {
                        if let Some(cob) = pdo.borrow().tpdo_cob_id(tpdo_number as usize) {
                            send(bus, &callbacks, cob, &payload);
                        }
                    }
                }),
            )
        };

        let rpdo_cob_ids: Vec<u32> = pdo.borrow().rpdos.iter().map(|r| r.comm.cob_id).collect();
        let mut rpdo_rx = Vec::new();
        for (number, cob) in rpdo_cob_ids.into_iter().enumerate() {
            let pdo = pdo.clone();
            let dict = dict.clone();
            let callbacks = callbacks.clone();
            let token = bus.register_receiver(
                cob,
                0,
                Box::new(move |_bus, frame| {
                    pdo.borrow_mut().receive(number, frame.data(), &mut dict.borrow_mut());
                    callbacks.borrow_mut().on_rpdo_write(number);
                }),
            );
            rpdo_rx.push(token);
        }

        let heartbeat_timer = {
            let nmt = nmt.clone();
            let callbacks = callbacks.clone();
            let first = bus.now().checked_add_millis(heartbeat_period_ms);
            bus.register_timer(
                TimerSpec::periodic(first, heartbeat_period_ms),
                Box::new(move |bus, _now| {
                    let frame = nmt.borrow().heartbeat_frame();
                    send(bus, &callbacks, cob_id::error_control(node_id), &frame);
                }),
            )
        };

        let emergency = Rc::new(RefCell::new(EmergencyProducer::new(node_id)));

        let bootup = nmt.borrow().bootup_frame();
        send(bus, &callbacks, cob_id::error_control(node_id), &bootup);
        callbacks.borrow_mut().on_boot_complete();

        LocalNode {
            node_id,
            dict,
            pdo,
            pending_tpdo_events,
            emergency,
            sdo_rx,
            nmt_rx,
            sync_rx,
            rpdo_rx,
            heartbeat_timer,
            callbacks,
        }
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn dictionary(&self) -> Rc<RefCell<Dictionary>> {
        self.dict.clone()
    }

    /// Fire a direct request-to-transmit for `tpdo_number`, as if an RTR
    /// had arrived.
    pub fn request_tpdo(&self, bus: &mut Bus, tpdo_number: usize) {
        let now = bus.now();
        let frame = self.pdo.borrow_mut().on_rtr(tpdo_number, now, &mut self.dict.borrow_mut());
        if let Some(payload) = frame {
            if let Some(cob) = self.pdo.borrow().tpdo_cob_id(tpdo_number) {
                send(bus, &self.callbacks, cob, &payload);
            }
        }
    }

    /// Raise a local emergency: builds the frame through this node's
    /// [`EmergencyProducer`], transmits it, and notifies
    /// [`NodeCallbacks::on_emergency`] directly, since a self-raised fault
    /// has no bus round trip to drive the callback from.
    pub fn raise_emergency(&self, bus: &mut Bus, error_code: u16, error_register: u8, manufacturer: [u8; 5]) {
        let (cob, payload) = self.emergency.borrow_mut().raise(error_code, error_register, manufacturer);
        send(bus, &self.callbacks, cob, &payload);
        let event = EmergencyEvent { error_code, error_register, manufacturer };
        self.callbacks.borrow_mut().on_emergency(self.node_id, event);
    }

    /// Emergencies raised so far, most recent last.
    pub fn emergency_history(&self) -> Vec<EmergencyEvent> {
        self.emergency.borrow().history().copied().collect()
    }

    /// Detach every receiver/timer this node registered.
    pub fn detach(self, bus: &mut Bus) {
        bus.unregister_receiver(self.sdo_rx);
        bus.unregister_receiver(self.nmt_rx);
        bus.unregister_receiver(self.sync_rx);
        for token in self.rpdo_rx {
            bus.unregister_receiver(token);
        }
        bus.cancel_timer(self.heartbeat_timer);
    }
}

/// Drain any TPDO-event-indication entries queued while the dictionary
/// was reached into (e.g. during SDO download processing) and transmit
/// the resulting frames.
fn flush_tpdo_events<C: NodeCallbacks>(
    bus: &mut Bus,
    dict: &Rc<RefCell<Dictionary>>,
    pdo: &Rc<RefCell<PdoEngine>>,
    pending: &PendingEvents,
    now: Instant,
    callbacks: &Rc<RefCell<C>>,
) {
    let events = std::mem::take(&mut *pending.lock().unwrap());
    for (index, sub_index) in events {
        let frames = pdo.borrow_mut().on_object_changed(index, sub_index, now, &mut dict.borrow_mut());
        for (tpdo_number, payload) in frames {
            if let Some(cob) = pdo.borrow().tpdo_cob_id(tpdo_number as usize) {
                send(bus, callbacks, cob, &payload);
            }
        }
    }
}

/// One logical device behind a [`Master`]: its node-id, its
/// configure/deconfigure hooks, and the heartbeat/emergency consumption
/// and optional legacy node-guarding wired onto its COB-IDs by
/// [`SubDriver::attach`].
pub struct SubDriver<C: NodeCallbacks + 'static> {
    pub node_id: u8,
    pub configure: Box<dyn FnMut(&mut Bus) -> bool>,
    pub deconfigure: Box<dyn FnMut(&mut Bus) -> bool>,
    callbacks: Rc<RefCell<C>>,
    heartbeat_rx: ReceiverToken,
    emergency_rx: ReceiverToken,
    guard: Rc<RefCell<Option<Rc<RefCell<NodeGuardMonitor>>>>>,
    guard_timer: Option<TimerToken>,
}

impl<C: NodeCallbacks + 'static> SubDriver<C> {
    /// Wire a monitored child for `node_id` onto `bus`: a receiver on its
    /// error-control COB-ID feeding a [`HeartbeatConsumer`] (and, once
    /// [`SubDriver::enable_node_guarding`] is called, the same frames also
    /// resolve a pending node-guard miss), and a receiver on its emergency
    /// COB-ID forwarding straight to [`NodeCallbacks::on_emergency`].
    pub fn attach(
        bus: &mut Bus,
        node_id: u8,
        callbacks: C,
        configure: Box<dyn FnMut(&mut Bus) -> bool>,
        deconfigure: Box<dyn FnMut(&mut Bus) -> bool>,
    ) -> Self {
        let callbacks = Rc::new(RefCell::new(callbacks));
        let heartbeat = Rc::new(RefCell::new(HeartbeatConsumer::new(node_id)));
        let guard: Rc<RefCell<Option<Rc<RefCell<NodeGuardMonitor>>>>> = Rc::new(RefCell::new(None));

        let heartbeat_rx = {
            let heartbeat = heartbeat.clone();
            let callbacks = callbacks.clone();
            let guard = guard.clone();
            bus.register_receiver(
                cob_id::error_control(node_id),
                0,
                Box::new(move |_bus, frame| {
                    if let Some(&raw) = frame.data().first() {
                        if let Some(event) = heartbeat.borrow_mut().on_heartbeat(raw) {
                            callbacks.borrow_mut().on_heartbeat(event);
                        }
                    }
                    if let Some(guard) = guard.borrow().as_ref() {
                        if let Some(event) = guard.borrow_mut().on_response() {
                            callbacks.borrow_mut().on_node_guard(event);
                        }
                    }
                }),
            )
        };

        let emergency_rx = {
            let callbacks = callbacks.clone();
            bus.register_receiver(
                cob_id::emergency(node_id),
                0,
                Box::new(move |_bus, frame| {
                    let mut data = [0u8; 8];
                    let n = frame.data().len().min(8);
                    data[..n].copy_from_slice(&frame.data()[..n]);
                    callbacks.borrow_mut().on_emergency(node_id, EmergencyEvent::from_payload(&data));
                }),
            )
        };

        SubDriver {
            node_id,
            configure,
            deconfigure,
            callbacks,
            heartbeat_rx,
            emergency_rx,
            guard,
            guard_timer: None,
        }
    }

    /// Opt into legacy RTR-based node-guarding on top of heartbeat
    /// consumption. This bus has no modeled RTR request/response round
    /// trip, so the poll timer drives [`NodeGuardMonitor::on_missed`]
    /// directly every `guard_time_ms`; any error-control frame arriving
    /// before the next poll (the real guarding reply, sharing the
    /// heartbeat COB-ID) resolves it via [`NodeGuardMonitor::on_response`].
    pub fn enable_node_guarding(&mut self, bus: &mut Bus, guard_time_ms: u64, life_time_factor: u8) {
        let monitor = Rc::new(RefCell::new(NodeGuardMonitor::new(self.node_id, life_time_factor)));
        *self.guard.borrow_mut() = Some(monitor.clone());
        let callbacks = self.callbacks.clone();
        let first = bus.now().checked_add_millis(guard_time_ms);
        let token = bus.register_timer(
            TimerSpec::periodic(first, guard_time_ms),
            Box::new(move |_bus, _now| {
                if let Some(event) = monitor.borrow_mut().on_missed() {
                    callbacks.borrow_mut().on_node_guard(event);
                }
            }),
        );
        self.guard_timer = Some(token);
    }

    pub fn detach(self, bus: &mut Bus) {
        bus.unregister_receiver(self.heartbeat_rx);
        bus.unregister_receiver(self.emergency_rx);
        if let Some(token) = self.guard_timer {
            bus.cancel_timer(token);
        }
    }
}

/// A master managing up to 8 logical devices. Since the engine is
/// single-threaded and cooperative, "parallel fan-out" means every
/// child's hook runs in turn within one call; only the aggregated AND of
/// their results is exposed, as if they had run concurrently.
pub struct Master<C: NodeCallbacks + 'static> {
    children: Vec<SubDriver<C>>,
}

impl<C: NodeCallbacks + 'static> Master<C> {
    pub fn new(children: Vec<SubDriver<C>>) -> Self {
        assert!(!children.is_empty() && children.len() <= 8, "a master manages 1..8 logical devices");
        Master { children }
    }

    /// Run every child's configure hook; `true` iff all of them succeed.
    pub fn configure_all(&mut self, bus: &mut Bus) -> bool {
        self.children.iter_mut().fold(true, |ok, child| (child.configure)(bus) && ok)
    }

    /// Run every child's deconfigure hook; `true` iff all of them
    /// succeed.
    pub fn deconfigure_all(&mut self, bus: &mut Bus) -> bool {
        self.children.iter_mut().fold(true, |ok, child| (child.deconfigure)(bus) && ok)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.children.iter().map(|c| c.node_id)
    }

    /// Detach every child's receivers/timers.
    pub fn detach_all(self, bus: &mut Bus) {
        for child in self.children {
            child.detach(bus);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::{Access, Object, ObjectKind, SubEntry};
    use crate::value::Value;
    use std::cell::RefCell as StdRefCell;

    #[derive(Default)]
    struct RecordingCallbacks {
        nmt_effects: Vec<NmtEffect>,
        booted: bool,
        heartbeats: Vec<HeartbeatEvent>,
        emergencies: Vec<(u8, EmergencyEvent)>,
        node_guard_events: Vec<NodeGuardEvent>,
        can_errors: Vec<CanOpenError>,
    }

    impl NodeCallbacks for RecordingCallbacks {
        fn on_nmt_command(&mut self, effect: NmtEffect) {
            self.nmt_effects.push(effect);
        }

        fn on_boot_complete(&mut self) {
            self.booted = true;
        }

        fn on_heartbeat(&mut self, event: HeartbeatEvent) {
            self.heartbeats.push(event);
        }

        fn on_emergency(&mut self, from_node: u8, event: EmergencyEvent) {
            self.emergencies.push((from_node, event));
        }

        fn on_node_guard(&mut self, event: NodeGuardEvent) {
            self.node_guard_events.push(event);
        }

        fn on_can_error(&mut self, error: CanOpenError) {
            self.can_errors.push(error);
        }
    }

    fn sample_dict(node_id: u8) -> Rc<RefCell<Dictionary>> {
        let mut dict = Dictionary::new(node_id, 500_000, 0x0192).unwrap();
        let mut obj = Object::new(0x2000, ObjectKind::Variable, "test");
        obj.insert_sub(SubEntry::new(0, Access::ReadWrite, Value::Unsigned16(0)).pdo_mappable(true))
            .unwrap();
        dict.insert_object(obj).unwrap();
        Rc::new(RefCell::new(dict))
    }

    #[test]
    fn attach_emits_bootup_frame_and_calls_back() {
        let mut bus = Bus::new();
        let sent: Rc<StdRefCell<Vec<Frame>>> = Rc::new(StdRefCell::new(Vec::new()));
        let sent_cb = sent.clone();
        bus.set_transmit(Box::new(move |frame| {
            sent_cb.borrow_mut().push(frame.clone());
            Ok(())
        }));

        let dict = sample_dict(5);
        let pdo = Rc::new(RefCell::new(PdoEngine::new()));
        let node = LocalNode::attach(&mut bus, 5, dict, pdo, 1000, RecordingCallbacks::default());

        assert!(node.callbacks.borrow().booted);
        let bootup = sent.borrow();
        assert_eq!(bootup.len(), 1);
        assert_eq!(bootup[0].id, cob_id::error_control(5));
        assert_eq!(bootup[0].data(), &[0]);
    }

    #[test]
    fn nmt_start_command_reaches_callback() {
        let mut bus = Bus::new();
        bus.set_transmit(Box::new(|_| Ok(())));
        let dict = sample_dict(5);
        let pdo = Rc::new(RefCell::new(PdoEngine::new()));
        let node = LocalNode::attach(&mut bus, 5, dict, pdo, 1000, RecordingCallbacks::default());

        let frame = Frame::new_std(cob_id::NMT_COMMAND, &[1, 0]).unwrap();
        bus.receive(frame);

        assert_eq!(
            node.callbacks.borrow().nmt_effects,
            vec![NmtEffect::StateChanged(crate::nmt::NmtState::Operational)]
        );
    }

    #[test]
    fn sdo_download_then_upload_round_trips_through_bus() {
        let mut bus = Bus::new();
        let sent: Rc<StdRefCell<Vec<Frame>>> = Rc::new(StdRefCell::new(Vec::new()));
        let sent_cb = sent.clone();
        bus.set_transmit(Box::new(move |frame| {
            sent_cb.borrow_mut().push(frame.clone());
            Ok(())
        }));

        let dict = sample_dict(5);
        let pdo = Rc::new(RefCell::new(PdoEngine::new()));
        let _node = LocalNode::attach(&mut bus, 5, dict, pdo, 1000, RecordingCallbacks::default());
        sent.borrow_mut().clear();

        let req = crate::sdo::wire::encode_download_initiate(true, true, 2, 0x2000, 0x00, &[0x34, 0x12, 0, 0]);
        let frame = Frame::new_std(cob_id::sdo_rx(5), &req).unwrap();
        bus.receive(frame);

        let replies = sent.borrow();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id, cob_id::sdo_tx(5));
        let reply = crate::sdo::wire::decode_server_response(&replies[0].data().try_into().unwrap()).unwrap();
        assert_eq!(reply, crate::sdo::wire::ServerResponse::DownloadInitiate { index: 0x2000, sub: 0x00 });
    }

    #[test]
    fn master_configure_all_ands_child_results() {
        let mut bus = Bus::new();
        let children = vec![
            SubDriver::attach(&mut bus, 1, RecordingCallbacks::default(), Box::new(|_| true), Box::new(|_| true)),
            SubDriver::attach(&mut bus, 2, RecordingCallbacks::default(), Box::new(|_| false), Box::new(|_| true)),
        ];
        let mut master = Master::new(children);
        assert!(!master.configure_all(&mut bus));
        assert!(master.deconfigure_all(&mut bus));
    }

    #[test]
    fn raise_emergency_sends_frame_and_calls_back_directly() {
        let mut bus = Bus::new();
        let sent: Rc<StdRefCell<Vec<Frame>>> = Rc::new(StdRefCell::new(Vec::new()));
        let sent_cb = sent.clone();
        bus.set_transmit(Box::new(move |frame| {
            sent_cb.borrow_mut().push(frame.clone());
            Ok(())
        }));

        let dict = sample_dict(5);
        let pdo = Rc::new(RefCell::new(PdoEngine::new()));
        let node = LocalNode::attach(&mut bus, 5, dict, pdo, 1000, RecordingCallbacks::default());
        sent.borrow_mut().clear();

        node.raise_emergency(&mut bus, 0x2310, 0x01, [0, 0, 0, 0, 0]);

        let frames = sent.borrow();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, cob_id::emergency(5));
        assert_eq!(
            node.callbacks.borrow().emergencies,
            vec![(5, EmergencyEvent { error_code: 0x2310, error_register: 0x01, manufacturer: [0; 5] })]
        );
        assert_eq!(node.emergency_history().len(), 1);
    }

    #[test]
    fn send_failure_reaches_on_can_error() {
        let mut bus = Bus::new();
        bus.set_transmit(Box::new(|_| Err(CanOpenError::NoMemory)));

        let dict = sample_dict(5);
        let pdo = Rc::new(RefCell::new(PdoEngine::new()));
        let node = LocalNode::attach(&mut bus, 5, dict, pdo, 1000, RecordingCallbacks::default());

        assert_eq!(node.callbacks.borrow().can_errors, vec![CanOpenError::NoMemory]);
    }

    #[test]
    fn sub_driver_forwards_heartbeat_and_emergency() {
        let mut bus = Bus::new();
        let sub = SubDriver::attach(&mut bus, 9, RecordingCallbacks::default(), Box::new(|_| true), Box::new(|_| true));

        bus.receive(Frame::new_std(cob_id::error_control(9), &[5]).unwrap());
        assert_eq!(sub.callbacks.borrow().heartbeats.len(), 1);

        let event = EmergencyEvent { error_code: 0x1000, error_register: 1, manufacturer: [0; 5] };
        bus.receive(Frame::new_std(cob_id::emergency(9), &event.to_payload()).unwrap());
        assert_eq!(sub.callbacks.borrow().emergencies, vec![(9, event)]);
    }

    #[test]
    fn sub_driver_node_guard_detects_miss_then_resolves_on_heartbeat() {
        let mut bus = Bus::new();
        let mut sub = SubDriver::attach(&mut bus, 9, RecordingCallbacks::default(), Box::new(|_| true), Box::new(|_| true));
        sub.enable_node_guarding(&mut bus, 100, 2);

        bus.advance_time(Instant::from_millis(100)).unwrap();
        bus.advance_time(Instant::from_millis(200)).unwrap();
        assert!(sub.callbacks.borrow().node_guard_events.iter().any(|e| e.occurred));

        bus.receive(Frame::new_std(cob_id::error_control(9), &[5]).unwrap());
        assert!(sub.callbacks.borrow().node_guard_events.iter().any(|e| !e.occurred));
    }
}
