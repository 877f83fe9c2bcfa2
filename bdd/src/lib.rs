//! End-to-end test harness for `canopen-core`.
//!
//! `canopen_core::bus::Bus`'s transmit callback has no way to recurse back
//! into `Bus::receive` (see its module docs), so a loopback test can't wire
//! two nodes directly into each other's transmit hook. Instead every
//! transmitted frame is pushed into an outbox, and `pump` drains it by
//! feeding each frame back into the bus, looping until nothing is left —
//! a reply may itself provoke a further reply (segmented/block transfers).

use std::cell::RefCell;
use std::rc::Rc;

use canopen_core::bus::Bus;
use canopen_core::frame::{cob_id, Frame};
use canopen_core::sdo::SdoClient;

pub type Outbox = Rc<RefCell<Vec<Frame>>>;

pub fn new_bus() -> (Bus, Outbox) {
    let mut bus = Bus::new();
    let outbox: Outbox = Rc::new(RefCell::new(Vec::new()));
    let sink = outbox.clone();
    bus.set_transmit(Box::new(move |frame| {
        sink.borrow_mut().push(frame.clone());
        Ok(())
    }));
    (bus, outbox)
}

pub fn drain(outbox: &Outbox) -> Vec<Frame> {
    outbox.borrow_mut().drain(..).collect()
}

pub fn pump(bus: &mut Bus, outbox: &Outbox) {
    loop {
        let pending = drain(outbox);
        if pending.is_empty() {
            break;
        }
        for frame in pending {
            bus.receive(frame);
        }
    }
}

fn to_array(frame: &Frame) -> [u8; 8] {
    let mut data = [0u8; 8];
    let bytes = frame.data();
    let n = bytes.len().min(8);
    data[..n].copy_from_slice(&bytes[..n]);
    data
}

/// Drives an unattached [`SdoClient`] against a node already wired to `bus`,
/// starting from the request produced by `client.download`/`client.upload`.
/// Plays the role a master's SDO engine would: deliver the request, pump the
/// outbox for the server's reply, feed it to the client, repeat until done.
pub fn run_client(bus: &mut Bus, outbox: &Outbox, node_id: u8, client: &mut SdoClient, first: [u8; 8]) {
    let mut next = Some(first);
    while let Some(request) = next.take() {
        bus.receive(Frame::new_std(cob_id::sdo_rx(node_id), &request).unwrap());
        let mut replies = drain(outbox);
        while let Some(reply) = replies.pop() {
            let outcome = client.on_response(&to_array(&reply));
            if let Some(more) = outcome.reply {
                next = Some(more);
            }
        }
    }
}
