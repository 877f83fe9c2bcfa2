//! End-to-end scenarios exercising the full stack (dictionary, SDO, PDO, NMT)
//! through a single in-process `Bus`.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use bdd::{new_bus, pump, run_client, Outbox};

use canopen_core::bus::{Bus, Instant, TimerSpec};
use canopen_core::dictionary::{Access, Dictionary, Object, ObjectKind, SubEntry};
use canopen_core::driver::{LocalNode, NodeCallbacks};
use canopen_core::frame::{cob_id, Frame};
use canopen_core::nmt::{HeartbeatConsumer, HeartbeatReason};
use canopen_core::pdo::{PdoCommParams, PdoEngine, PdoMapping, Tpdo};
use canopen_core::sdo::SdoClient;
use canopen_core::value::Value;

const NODE_ID: u8 = 5;

struct Recorder;

impl NodeCallbacks for Recorder {}

fn sample_dictionary() -> Dictionary {
    let mut dict = Dictionary::new(NODE_ID, 500_000, 0x0191).unwrap();

    let mut counter = Object::new(0x2000, ObjectKind::Variable, "counter");
    counter
        .insert_sub(SubEntry::new(0, Access::ReadWrite, Value::Unsigned32(0)).pdo_mappable(true))
        .unwrap();
    dict.insert_object(counter).unwrap();

    let mut short = Object::new(0x2001, ObjectKind::Variable, "short");
    short
        .insert_sub(SubEntry::new(0, Access::ReadWrite, Value::Unsigned16(0)))
        .unwrap();
    dict.insert_object(short).unwrap();

    let mut clamped = Object::new(0x2002, ObjectKind::Variable, "clamped");
    clamped
        .insert_sub(
            SubEntry::new(0, Access::ReadWrite, Value::Unsigned8(15))
                .with_limits(Value::Unsigned8(10), Value::Unsigned8(20)),
        )
        .unwrap();
    dict.insert_object(clamped).unwrap();

    let mut text = Object::new(0x2100, ObjectKind::Variable, "greeting");
    text.insert_sub(SubEntry::new(
        0,
        Access::ReadWrite,
        Value::VisibleString(vec![0; 47]),
    ))
    .unwrap();
    dict.insert_object(text).unwrap();

    // Mirrors 0x1018 sub 1 (vendor ID): read-only, per CiA 301.
    let mut identity = Object::new(0x1018, ObjectKind::Record, "identity");
    identity
        .insert_sub(SubEntry::new(1, Access::ReadOnly, Value::Unsigned32(0x1234)))
        .unwrap();
    dict.insert_object(identity).unwrap();

    dict
}

fn attach_node(bus: &mut Bus) -> (LocalNode<Recorder>, Rc<RefCell<Dictionary>>) {
    let dict = Rc::new(RefCell::new(sample_dictionary()));
    let pdo = Rc::new(RefCell::new(PdoEngine::new()));
    let node = LocalNode::attach(bus, NODE_ID, dict.clone(), pdo, 1000, Recorder);
    (node, dict)
}

#[test]
fn expedited_download_then_upload_round_trips() {
    let (mut bus, outbox) = new_bus();
    let (node, _dict) = attach_node(&mut bus);
    pump(&mut bus, &outbox);

    let result: Arc<Mutex<Option<(u32, Option<Vec<u8>>)>>> = Arc::new(Mutex::new(None));
    let r = result.clone();
    let mut client = SdoClient::new();
    let req = client.download(
        0x2001,
        0x00,
        &[0x34, 0x12],
        Box::new(move |code, bytes| *r.lock().unwrap() = Some((code, bytes))),
    );
    run_client(&mut bus, &outbox, NODE_ID, &mut client, req);
    assert_eq!(*result.lock().unwrap(), Some((0, None)));

    let result: Arc<Mutex<Option<(u32, Option<Vec<u8>>)>>> = Arc::new(Mutex::new(None));
    let r = result.clone();
    let req = client.upload(
        0x2001,
        0x00,
        Box::new(move |code, bytes| *r.lock().unwrap() = Some((code, bytes))),
    );
    run_client(&mut bus, &outbox, NODE_ID, &mut client, req);
    assert_eq!(*result.lock().unwrap(), Some((0, Some(vec![0x34, 0x12]))));

    node.detach(&mut bus);
}

#[test]
fn segmented_upload_assembles_full_string() {
    let (mut bus, outbox) = new_bus();
    let (node, dict) = attach_node(&mut bus);
    pump(&mut bus, &outbox);

    let text = b"The quick brown fox jumps over the lazy dog.XY";
    assert_eq!(text.len(), 47);
    dict.borrow_mut()
        .set(0x2100, 0x00, Value::VisibleString(text.to_vec()))
        .unwrap();

    let result: Arc<Mutex<Option<(u32, Option<Vec<u8>>)>>> = Arc::new(Mutex::new(None));
    let r = result.clone();
    let mut client = SdoClient::new();
    let req = client.upload(
        0x2100,
        0x00,
        Box::new(move |code, bytes| *r.lock().unwrap() = Some((code, bytes))),
    );
    run_client(&mut bus, &outbox, NODE_ID, &mut client, req);

    let (code, bytes) = result.lock().unwrap().clone().unwrap();
    assert_eq!(code, 0);
    assert_eq!(bytes.unwrap(), text.to_vec());

    node.detach(&mut bus);
}

#[test]
fn write_to_read_only_sub_entry_aborts_with_no_write() {
    let (mut bus, outbox) = new_bus();
    let (node, _dict) = attach_node(&mut bus);
    pump(&mut bus, &outbox);

    let result: Arc<Mutex<Option<u32>>> = Arc::new(Mutex::new(None));
    let r = result.clone();
    let mut client = SdoClient::new();
    let req = client.download(
        0x1018,
        0x01,
        &[0, 0, 0, 0],
        Box::new(move |code, _| *r.lock().unwrap() = Some(code)),
    );
    run_client(&mut bus, &outbox, NODE_ID, &mut client, req);

    assert_eq!(*result.lock().unwrap(), Some(0x0601_0002));

    node.detach(&mut bus);
}

#[test]
fn out_of_range_download_clamps_to_the_upper_limit() {
    let (mut bus, outbox) = new_bus();
    let (node, dict) = attach_node(&mut bus);
    pump(&mut bus, &outbox);

    let result: Arc<Mutex<Option<u32>>> = Arc::new(Mutex::new(None));
    let r = result.clone();
    let mut client = SdoClient::new();
    let req = client.download(
        0x2002,
        0x00,
        &[25],
        Box::new(move |code, _| *r.lock().unwrap() = Some(code)),
    );
    run_client(&mut bus, &outbox, NODE_ID, &mut client, req);

    assert_eq!(*result.lock().unwrap(), Some(0));
    assert_eq!(dict.borrow_mut().read_raw(0x2002, 0x00).unwrap(), vec![20]);

    node.detach(&mut bus);
}

fn pump_collect(bus: &mut Bus, outbox: &Outbox) -> Vec<Frame> {
    let frames = bdd::drain(outbox);
    pump(bus, outbox);
    frames
}

#[test]
fn sync_driven_tpdo_is_suppressed_by_inhibit_time() {
    let dict = Rc::new(RefCell::new(sample_dictionary()));
    let mut pdo_engine = PdoEngine::new();
    let mut comm = PdoCommParams::new(cob_id::tpdo(0, NODE_ID));
    comm.transmission_type = 1; // every SYNC
    comm.inhibit_time = 5_000; // 500ms, in 100us units
    pdo_engine
        .tpdos
        .push(Tpdo::new(comm, vec![PdoMapping::new(0x2000, 0, 32)]));
    let pdo = Rc::new(RefCell::new(pdo_engine));

    let (mut bus, outbox) = new_bus();
    let node = LocalNode::attach(&mut bus, NODE_ID, dict.clone(), pdo, 1000, Recorder);
    pump(&mut bus, &outbox);

    dict.borrow_mut()
        .set(0x2000, 0x00, Value::Unsigned32(0xDEAD_BEEF))
        .unwrap();

    bus.receive(Frame::new_std(cob_id::SYNC, &[]).unwrap());
    let frames = pump_collect(&mut bus, &outbox);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].id, cob_id::tpdo(0, NODE_ID));
    assert_eq!(frames[0].data(), &[0xEF, 0xBE, 0xAD, 0xDE]);

    // A second SYNC inside the inhibit window produces nothing.
    bus.receive(Frame::new_std(cob_id::SYNC, &[]).unwrap());
    let frames = pump_collect(&mut bus, &outbox);
    assert!(frames.is_empty());

    node.detach(&mut bus);
}

#[test]
fn heartbeat_consumer_reports_timeout_after_life_time() {
    let mut bus = Bus::new();
    bus.set_transmit(Box::new(|_| Ok(())));

    let consumer = Rc::new(RefCell::new(HeartbeatConsumer::new(NODE_ID)));
    let fired = Rc::new(RefCell::new(None));

    let fired_cb = fired.clone();
    let consumer_cb = consumer.clone();
    let _timer = bus.register_timer(
        TimerSpec::one_shot(Instant::ZERO.checked_add_millis(1000)),
        Box::new(move |_bus, _now| {
            *fired_cb.borrow_mut() = Some(consumer_cb.borrow_mut().on_timeout());
        }),
    );

    // No heartbeat frame ever arrives before the deadline.
    bus.advance_time(Instant::ZERO.checked_add_millis(1000)).unwrap();

    let event = fired.borrow().unwrap();
    assert_eq!(event.node_id, NODE_ID);
    assert_eq!(event.reason, HeartbeatReason::Timeout);
}
