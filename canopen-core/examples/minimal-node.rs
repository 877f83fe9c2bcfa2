//! A minimal CANopen node wired up with [`canopen_core::driver::LocalNode`].
//!
//! This crate stops at the `Bus` boundary (see `src/lib.rs`): it never opens
//! a socket. This example stands in for the missing hardware by logging
//! every transmitted frame and feeding the bus a short, hand-written script
//! of inbound frames instead of a real `can0`/`vcan0` interface.

use std::cell::RefCell;
use std::rc::Rc;

use canopen_core::bus::{Bus, Instant};
use canopen_core::dictionary::{Access, Dictionary, Object, ObjectKind, SubEntry};
use canopen_core::driver::{LocalNode, NodeCallbacks};
use canopen_core::frame::{cob_id, Frame};
use canopen_core::nmt::HeartbeatEvent;
use canopen_core::pdo::{PdoCommParams, PdoEngine, PdoMapping, Tpdo};
use canopen_core::value::Value;
use log::info;

const NODE_ID: u8 = 10;

struct LoggingCallbacks;

impl NodeCallbacks for LoggingCallbacks {
    fn on_nmt_command(&mut self, effect: canopen_core::nmt::NmtEffect) {
        info!("nmt command applied: {effect:?}");
    }

    fn on_rpdo_write(&mut self, rpdo_number: usize) {
        info!("rpdo{} write applied", rpdo_number + 1);
    }

    fn on_heartbeat(&mut self, event: HeartbeatEvent) {
        info!("heartbeat from node {}: {:?}", event.node_id, event.state);
    }

    fn on_boot_complete(&mut self) {
        info!("node {NODE_ID} booted");
    }
}

fn build_dictionary() -> Dictionary {
    let mut dict = Dictionary::new(NODE_ID, 500_000, 0x0192).expect("valid node-id");

    let mut device_type = Object::new(0x1000, ObjectKind::Variable, "device-type");
    device_type
        .insert_sub(SubEntry::new(0, Access::ReadOnly, Value::Unsigned32(0)))
        .unwrap();
    dict.insert_object(device_type).unwrap();

    let mut counter = Object::new(0x2000, ObjectKind::Variable, "example-counter");
    counter
        .insert_sub(SubEntry::new(0, Access::ReadWrite, Value::Unsigned32(0)).pdo_mappable(true))
        .unwrap();
    dict.insert_object(counter).unwrap();

    dict
}

fn build_pdo_engine() -> PdoEngine {
    let mut engine = PdoEngine::new();
    let comm = PdoCommParams::new(cob_id::tpdo(0, NODE_ID));
    engine.tpdos.push(Tpdo::new(comm, vec![PdoMapping::new(0x2000, 0, 32)]));
    engine
}

fn main() {
    env_logger::init();

    let dict = Rc::new(RefCell::new(build_dictionary()));
    let pdo = Rc::new(RefCell::new(build_pdo_engine()));

    let mut bus = Bus::new();
    bus.set_transmit(Box::new(|frame| {
        info!("tx {frame}");
        Ok(())
    }));

    let node = LocalNode::attach(&mut bus, NODE_ID, dict.clone(), pdo, 1000, LoggingCallbacks);

    // Put the node into operational state, as a master would on startup.
    let start = Frame::new_std(cob_id::NMT_COMMAND, &[1, 0]).unwrap();
    bus.receive(start);

    // Walk the clock forward in 100ms steps, delivering a SYNC every second,
    // to exercise the heartbeat producer and the TPDO's SYNC trigger.
    let mut now = Instant::ZERO;
    for tick in 0..30u32 {
        now = now.checked_add_millis(100);
        bus.advance_time(now).unwrap();
        if tick % 10 == 0 {
            dict.borrow_mut().set(0x2000, 0, Value::Unsigned32(tick)).unwrap();
            let sync = Frame::new_std(cob_id::SYNC, &[]).unwrap();
            bus.receive(sync);
        }
    }

    node.detach(&mut bus);
}
