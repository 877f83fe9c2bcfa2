//! PDO engine: mapping, packing/unpacking, and the transmit/receive
//! triggers that move mapped object values on and off the wire.
//!
//! The engine is decoupled from [`crate::bus::Bus`] the same way the SDO
//! server/client are: it knows nothing about timers or receivers, only
//! about "a SYNC/event/RTR happened at this instant" and "here is a frame
//! to send" or "here is a frame that arrived". [`crate::driver`] wires it
//! to a `Bus` and a `Dictionary`.

use log::{debug, trace};

use crate::abort::AbortCode;
use crate::bus::Instant;
use crate::dictionary::Dictionary;

/// Sub-index 0 value of a mapping record signalling a multiplexed PDO
/// variant rather than an ordinary mapping list.
pub const SAM_MPDO: u8 = 0xFE;
pub const DAM_MPDO: u8 = 0xFF;

/// One entry of a PDO mapping record: the 32-bit packed layout
/// (index:16 | sub-index:8 | bit length:8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdoMapping {
    pub index: u16,
    pub sub_index: u8,
    pub bit_length: u8,
}

impl PdoMapping {
    pub fn new(index: u16, sub_index: u8, bit_length: u8) -> Self {
        PdoMapping { index, sub_index, bit_length }
    }

    pub fn to_u32(self) -> u32 {
        (self.index as u32) << 16 | (self.sub_index as u32) << 8 | self.bit_length as u32
    }

    pub fn from_u32(raw: u32) -> Self {
        PdoMapping {
            index: (raw >> 16) as u16,
            sub_index: ((raw >> 8) & 0xFF) as u8,
            bit_length: (raw & 0xFF) as u8,
        }
    }
}

/// Transmission type (subindex 2 of a PDO communication record).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmissionType {
    /// 0: sent on SYNC, but only once an application event has fired.
    SyncAcyclic,
    /// 1..240: sent on every Nth SYNC.
    SyncEveryN(u8),
    /// 252: transmit-only-on-RTR, synchronous.
    RtrOnlySync,
    /// 253: transmit-only-on-RTR, event-driven.
    RtrOnlyEvent,
    /// 254/255: sent as soon as the mapped event fires.
    EventDriven,
}

impl TransmissionType {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TransmissionType::SyncAcyclic,
            1..=240 => TransmissionType::SyncEveryN(raw),
            252 => TransmissionType::RtrOnlySync,
            253 => TransmissionType::RtrOnlyEvent,
            _ => TransmissionType::EventDriven,
        }
    }
}

/// A PDO communication parameter record (subindices 1/2/3/5/6 of
/// 0x1400.. / 0x1800..).
#[derive(Debug, Clone, Copy)]
pub struct PdoCommParams {
    pub cob_id: u32,
    pub valid: bool,
    pub rtr_allowed: bool,
    pub extended: bool,
    pub transmission_type: u8,
    /// 100 microsecond units.
    pub inhibit_time: u16,
    /// Milliseconds; 0 means disabled.
    pub event_timer: u16,
    pub sync_start_value: u8,
}

impl PdoCommParams {
    pub fn new(cob_id: u32) -> Self {
        PdoCommParams {
            cob_id,
            valid: true,
            rtr_allowed: true,
            extended: false,
            transmission_type: 0,
            inhibit_time: 0,
            event_timer: 0,
            sync_start_value: 0,
        }
    }

    /// Decode the bit-31/30/29 flags of a COB-ID sub-entry.
    pub fn decode_cob_id(raw: u32) -> (u32, bool, bool, bool) {
        let disabled = raw & (1 << 31) != 0;
        let rtr_disabled = raw & (1 << 30) != 0;
        let extended = raw & (1 << 29) != 0;
        let mask = if extended { 0x1FFF_FFFF } else { 0x7FF };
        (raw & mask, !disabled, !rtr_disabled, extended)
    }

    pub fn encode_cob_id(cob_id: u32, valid: bool, rtr_allowed: bool, extended: bool) -> u32 {
        let mask = if extended { 0x1FFF_FFFF } else { 0x7FF };
        let mut raw = cob_id & mask;
        if !valid {
            raw |= 1 << 31;
        }
        if !rtr_allowed {
            raw |= 1 << 30;
        }
        if extended {
            raw |= 1 << 29;
        }
        raw
    }
}

/// Write `bit_length` bits from `src` (little-endian) into `out` starting
/// at `bit_pos`, LSB-first, respecting each mapping's bit length and bit
/// position rather than assuming byte alignment.
fn write_bits(out: &mut [u8], bit_pos: usize, bit_length: usize, src: &[u8]) {
    for i in 0..bit_length {
        let src_byte = i / 8;
        let src_bit = i % 8;
        let bit = if src_byte < src.len() { (src[src_byte] >> src_bit) & 1 } else { 0 };
        let dst_pos = bit_pos + i;
        let dst_byte = dst_pos / 8;
        if dst_byte >= out.len() {
            break;
        }
        if bit != 0 {
            out[dst_byte] |= 1 << (dst_pos % 8);
        }
    }
}

fn read_bits(data: &[u8], bit_pos: usize, bit_length: usize) -> Vec<u8> {
    let mut out = vec![0u8; (bit_length + 7) / 8];
    for i in 0..bit_length {
        let src_pos = bit_pos + i;
        let src_byte = src_pos / 8;
        let bit = if src_byte < data.len() { (data[src_byte] >> (src_pos % 8)) & 1 } else { 0 };
        if bit != 0 {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

fn add_100us(instant: Instant, units: u16) -> Instant {
    let micros = units as u64 * 100;
    let extra_nanos = (micros % 1_000_000) * 1000;
    let total_nanos = instant.nanos as u64 + extra_nanos;
    Instant::new(
        instant.secs + micros / 1_000_000 + total_nanos / 1_000_000_000,
        (total_nanos % 1_000_000_000) as u32,
    )
}

/// One transmit PDO: mapping plus the transmit-side trigger state
/// (sync counter, inhibit deadline, pending event).
#[derive(Debug)]
pub struct Tpdo {
    pub comm: PdoCommParams,
    pub mappings: Vec<PdoMapping>,
    sync_counter: u8,
    last_transmit: Option<Instant>,
    event_pending: bool,
}

impl Tpdo {
    pub fn new(comm: PdoCommParams, mappings: Vec<PdoMapping>) -> Self {
        Tpdo {
            comm,
            mappings,
            sync_counter: 0,
            last_transmit: None,
            event_pending: false,
        }
    }

    fn inhibited(&self, now: Instant) -> bool {
        match self.last_transmit {
            Some(last) if self.comm.inhibit_time > 0 => now < add_100us(last, self.comm.inhibit_time),
            _ => false,
        }
    }

    /// Pack the mapped objects in declared order (low sub-index first)
    /// into a frame payload.
    fn pack(&self, dict: &mut Dictionary) -> Result<([u8; 8], usize), AbortCode> {
        let mut out = [0u8; 8];
        let mut bit_pos = 0usize;
        for m in &self.mappings {
            let value = dict.get(m.index, m.sub_index)?;
            write_bits(&mut out, bit_pos, m.bit_length as usize, &value.to_bytes());
            bit_pos += m.bit_length as usize;
        }
        trace!("packed tpdo {:03X} ({} bytes)", self.comm.cob_id, (bit_pos + 7) / 8);
        Ok((out, (bit_pos + 7) / 8))
    }

    /// Emit now unless the inhibit interval hasn't elapsed -- a rejected
    /// trigger is lost, not queued.
    fn emit(&mut self, now: Instant, dict: &mut Dictionary) -> Result<Option<[u8; 8]>, AbortCode> {
        if self.inhibited(now) {
            trace!("tpdo {:03X} suppressed by inhibit time", self.comm.cob_id);
            return Ok(None);
        }
        let (frame, _len) = self.pack(dict)?;
        debug!("tpdo {:03X} transmitted", self.comm.cob_id);
        self.last_transmit = Some(now);
        Ok(Some(frame))
    }

    pub fn on_sync(&mut self, now: Instant, dict: &mut Dictionary) -> Result<Option<[u8; 8]>, AbortCode> {
        if !self.comm.valid {
            return Ok(None);
        }
        let should_send = match TransmissionType::from_u8(self.comm.transmission_type) {
            TransmissionType::SyncAcyclic => std::mem::take(&mut self.event_pending),
            TransmissionType::SyncEveryN(n) => {
                self.sync_counter += 1;
                if self.sync_counter >= n {
                    self.sync_counter = 0;
                    true
                } else {
                    false
                }
            }
            _ => false,
        };
        if should_send {
            self.emit(now, dict)
        } else {
            Ok(None)
        }
    }

    pub fn on_event(&mut self, now: Instant, dict: &mut Dictionary) -> Result<Option<[u8; 8]>, AbortCode> {
        if !self.comm.valid {
            return Ok(None);
        }
        match TransmissionType::from_u8(self.comm.transmission_type) {
            TransmissionType::SyncAcyclic => {
                self.event_pending = true;
                Ok(None)
            }
            TransmissionType::EventDriven | TransmissionType::RtrOnlyEvent => self.emit(now, dict),
            _ => Ok(None),
        }
    }

    pub fn on_rtr(&mut self, now: Instant, dict: &mut Dictionary) -> Result<Option<[u8; 8]>, AbortCode> {
        if !self.comm.valid || !self.comm.rtr_allowed {
            return Ok(None);
        }
        match TransmissionType::from_u8(self.comm.transmission_type) {
            TransmissionType::RtrOnlySync | TransmissionType::RtrOnlyEvent => self.emit(now, dict),
            _ => Ok(None),
        }
    }
}

/// One receive PDO: mapping plus the synchronous-apply buffer.
#[derive(Debug)]
pub struct Rpdo {
    pub comm: PdoCommParams,
    pub mappings: Vec<PdoMapping>,
    pending: Option<Vec<u8>>,
}

impl Rpdo {
    pub fn new(comm: PdoCommParams, mappings: Vec<PdoMapping>) -> Self {
        Rpdo { comm, mappings, pending: None }
    }

    fn is_synchronous(&self) -> bool {
        matches!(
            TransmissionType::from_u8(self.comm.transmission_type),
            TransmissionType::SyncAcyclic | TransmissionType::SyncEveryN(_)
        )
    }

    fn unpack(&self, data: &[u8], dict: &mut Dictionary) -> Result<(), AbortCode> {
        let mut bit_pos = 0usize;
        for m in &self.mappings {
            let bytes = read_bits(data, bit_pos, m.bit_length as usize);
            dict.write_raw(m.index, m.sub_index, &bytes)?;
            bit_pos += m.bit_length as usize;
        }
        trace!("unpacked rpdo {:03X}", self.comm.cob_id);
        Ok(())
    }

    fn apply_pending(&mut self, dict: &mut Dictionary) -> Result<(), AbortCode> {
        if let Some(data) = self.pending.take() {
            self.unpack(&data, dict)?;
            debug!("rpdo {:03X} applied", self.comm.cob_id);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdoDirection {
    Transmit,
    Receive,
}

/// Surfaced to the user whenever a mapping error aborts a single PDO
/// pack/unpack without terminating the engine.
#[derive(Debug, Clone, Copy)]
pub struct PdoIndication {
    pub direction: PdoDirection,
    pub pdo_number: u8,
    pub abort: AbortCode,
}

pub type PdoIndicationFn = Box<dyn FnMut(PdoIndication) + Send>;

fn indicate(cb: &mut Option<PdoIndicationFn>, direction: PdoDirection, pdo_number: u8, abort: AbortCode) {
    log::warn!("{:?} pdo {} failed: {:?}", direction, pdo_number, abort);
    if let Some(cb) = cb.as_mut() {
        cb(PdoIndication { direction, pdo_number, abort });
    }
}

/// The PDO engine: every configured transmit/receive PDO for one node,
/// plus the multiplex (MPDO) lists.
#[derive(Default)]
pub struct PdoEngine {
    pub tpdos: Vec<Tpdo>,
    pub rpdos: Vec<Rpdo>,
    pub mpdo: MpdoEngine,
    indication: Option<PdoIndicationFn>,
}

impl PdoEngine {
    pub fn new() -> Self {
        PdoEngine::default()
    }

    pub fn set_indication(&mut self, cb: PdoIndicationFn) {
        self.indication = Some(cb);
    }

    /// The COB-ID a given TPDO transmits on, for a driver to pair with
    /// the frames returned by the trigger methods below.
    pub fn tpdo_cob_id(&self, tpdo_number: usize) -> Option<u32> {
        self.tpdos.get(tpdo_number).map(|t| t.comm.cob_id)
    }

    /// Drive every TPDO's SYNC trigger and apply every synchronous RPDO's
    /// buffered value, returning `(tpdo_number, payload)` for every frame
    /// that should be transmitted.
    pub fn on_sync(&mut self, now: Instant, dict: &mut Dictionary) -> Vec<(u8, [u8; 8])> {
        let PdoEngine { tpdos, rpdos, indication, .. } = self;
        let mut frames = Vec::new();
        for (i, tpdo) in tpdos.iter_mut().enumerate() {
            match tpdo.on_sync(now, dict) {
                Ok(Some(frame)) => frames.push((i as u8, frame)),
                Ok(None) => {}
                Err(abort) => indicate(indication, PdoDirection::Transmit, i as u8, abort),
            }
        }
        for (i, rpdo) in rpdos.iter_mut().enumerate() {
            if rpdo.is_synchronous() {
                if let Err(abort) = rpdo.apply_pending(dict) {
                    indicate(indication, PdoDirection::Receive, i as u8, abort);
                }
            }
        }
        frames
    }

    /// Notify the engine that a mapped object changed (the dictionary's
    /// TPDO event indication), firing any event-triggered or
    /// SYNC-acyclic-pending TPDO that maps it.
    pub fn on_object_changed(
        &mut self,
        index: u16,
        sub_index: u8,
        now: Instant,
        dict: &mut Dictionary,
    ) -> Vec<(u8, [u8; 8])> {
        let PdoEngine { tpdos, indication, .. } = self;
        let mut frames = Vec::new();
        for (i, tpdo) in tpdos.iter_mut().enumerate() {
            if !tpdo.mappings.iter().any(|m| m.index == index && m.sub_index == sub_index) {
                continue;
            }
            match tpdo.on_event(now, dict) {
                Ok(Some(frame)) => frames.push((i as u8, frame)),
                Ok(None) => {}
                Err(abort) => indicate(indication, PdoDirection::Transmit, i as u8, abort),
            }
        }
        frames
    }

    pub fn on_rtr(&mut self, tpdo_number: usize, now: Instant, dict: &mut Dictionary) -> Option<[u8; 8]> {
        let PdoEngine { tpdos, indication, .. } = self;
        let tpdo = tpdos.get_mut(tpdo_number)?;
        match tpdo.on_rtr(now, dict) {
            Ok(frame) => frame,
            Err(abort) => {
                indicate(indication, PdoDirection::Transmit, tpdo_number as u8, abort);
                None
            }
        }
    }

    /// Deliver a received RPDO payload. Synchronous RPDOs buffer until
    /// the next [`PdoEngine::on_sync`]; everything else applies now.
    pub fn receive(&mut self, rpdo_number: usize, data: &[u8], dict: &mut Dictionary) {
        let PdoEngine { rpdos, indication, .. } = self;
        let Some(rpdo) = rpdos.get_mut(rpdo_number) else {
            return;
        };
        if !rpdo.comm.valid {
            return;
        }
        rpdo.pending = Some(data.to_vec());
        if !rpdo.is_synchronous() {
            if let Err(abort) = rpdo.apply_pending(dict) {
                indicate(indication, PdoDirection::Receive, rpdo_number as u8, abort);
            }
        }
    }
}

/// A scanner-list entry (object 0x1FA0..0x1FCF): binds one remote
/// (node, index, sub-index) SAM-MPDO source to a local sub-entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannerEntry {
    pub source_node_id: u8,
    pub source_index: u16,
    pub source_sub_index: u8,
    pub local_index: u16,
    pub local_sub_index: u8,
}

/// A dispatch-list entry (object 0x1FD0..0x1FFF): binds one local
/// (index, sub-index) to a DAM-MPDO destination node-id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchEntry {
    pub destination_node_id: u8,
    pub index: u16,
    pub sub_index: u8,
}

/// Pack a multiplex PDO frame: byte 0 = source node-id (SAM) or
/// destination index (DAM), bytes 1-2 = index (LE), byte 3 = sub-index,
/// bytes 4-7 = 4-byte value.
pub fn pack_mpdo(node_or_index: u8, index: u16, sub_index: u8, value: [u8; 4]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0] = node_or_index;
    out[1..3].copy_from_slice(&index.to_le_bytes());
    out[3] = sub_index;
    out[4..8].copy_from_slice(&value);
    out
}

pub fn unpack_mpdo(data: &[u8; 8]) -> (u8, u16, u8, [u8; 4]) {
    let index = u16::from_le_bytes([data[1], data[2]]);
    let mut value = [0u8; 4];
    value.copy_from_slice(&data[4..8]);
    (data[0], index, data[3], value)
}

/// SAM-MPDO/DAM-MPDO lists (0x1FA0..0x1FCF / 0x1FD0..0x1FFF).
#[derive(Debug, Default)]
pub struct MpdoEngine {
    pub scanner_list: Vec<ScannerEntry>,
    pub dispatch_list: Vec<DispatchEntry>,
}

impl MpdoEngine {
    pub fn new() -> Self {
        MpdoEngine::default()
    }

    /// Match an inbound SAM-MPDO against the scanner list and write the
    /// value to the bound local object.
    pub fn receive_sam(
        &self,
        source_node_id: u8,
        index: u16,
        sub_index: u8,
        value: [u8; 4],
        dict: &mut Dictionary,
    ) -> Result<(), AbortCode> {
        for entry in &self.scanner_list {
            if entry.source_node_id == source_node_id
                && entry.source_index == index
                && entry.source_sub_index == sub_index
            {
                return dict.write_raw(entry.local_index, entry.local_sub_index, &value);
            }
        }
        Ok(())
    }

    /// Build one DAM-MPDO frame per dispatch-list entry bound to
    /// `(index, sub_index)`.
    pub fn transmit_dam(
        &self,
        index: u16,
        sub_index: u8,
        dict: &mut Dictionary,
    ) -> Result<Vec<(u8, [u8; 8])>, AbortCode> {
        let mut frames = Vec::new();
        for entry in &self.dispatch_list {
            if entry.index == index && entry.sub_index == sub_index {
                let bytes = dict.read_raw(index, sub_index)?;
                let mut value = [0u8; 4];
                let n = bytes.len().min(4);
                value[..n].copy_from_slice(&bytes[..n]);
                frames.push((entry.destination_node_id, pack_mpdo(entry.destination_node_id, index, sub_index, value)));
            }
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::{Access, Dictionary, Object, ObjectKind, SubEntry};
    use crate::value::Value;

    fn dict_with(index: u16, value: Value) -> Dictionary {
        let mut dict = Dictionary::new(2, 500_000, 0x0192).unwrap();
        let mut obj = Object::new(index, ObjectKind::Variable, "mapped");
        obj.insert_sub(SubEntry::new(0, Access::ReadWrite, value).pdo_mappable(true))
            .unwrap();
        dict.insert_object(obj).unwrap();
        dict
    }

    #[test]
    fn pdo_mapping_round_trips_through_u32() {
        let mapping = PdoMapping::new(0x2000, 0x00, 32);
        assert_eq!(PdoMapping::from_u32(mapping.to_u32()), mapping);
    }

    #[test]
    fn cob_id_round_trips_valid_rtr_extended_flags() {
        let raw = PdoCommParams::encode_cob_id(0x1FF, false, false, true);
        let (cob_id, valid, rtr_allowed, extended) = PdoCommParams::decode_cob_id(raw);
        assert_eq!(cob_id, 0x1FF);
        assert!(!valid);
        assert!(!rtr_allowed);
        assert!(extended);
    }

    #[test]
    fn tpdo_packs_mapped_object_into_payload() {
        let mut dict = dict_with(0x2000, Value::Unsigned32(0xDEADBEEF));
        let comm = PdoCommParams::new(0x182);
        let mut tpdo = Tpdo::new(comm, vec![PdoMapping::new(0x2000, 0, 32)]);
        let (frame, len) = tpdo.pack(&mut dict).unwrap();
        assert_eq!(len, 4);
        assert_eq!(&frame[..4], &0xDEADBEEFu32.to_le_bytes());
    }

    #[test]
    fn sync_driven_tpdo_respects_inhibit_time() {
        let mut dict = dict_with(0x2000, Value::Unsigned32(0xDEADBEEF));
        let mut comm = PdoCommParams::new(0x182);
        comm.transmission_type = 1;
        comm.inhibit_time = 1000; // 100ms
        let mut tpdo = Tpdo::new(comm, vec![PdoMapping::new(0x2000, 0, 32)]);

        let t0 = Instant::ZERO;
        assert!(tpdo.on_sync(t0, &mut dict).unwrap().is_some());

        let t1 = t0.checked_add_millis(1);
        assert!(tpdo.on_sync(t1, &mut dict).unwrap().is_none());

        let t2 = t0.checked_add_millis(200);
        assert!(tpdo.on_sync(t2, &mut dict).unwrap().is_some());
    }

    #[test]
    fn rpdo_unpacks_and_writes_dictionary() {
        let mut dict = dict_with(0x2100, Value::Unsigned16(0));
        let mut rpdo = Rpdo::new(PdoCommParams::new(0x202), vec![PdoMapping::new(0x2100, 0, 16)]);
        rpdo.unpack(&[0x34, 0x12], &mut dict).unwrap();
        assert_eq!(dict.read_raw(0x2100, 0).unwrap(), vec![0x34, 0x12]);
    }

    #[test]
    fn synchronous_rpdo_buffers_until_next_sync() {
        let mut dict = dict_with(0x2100, Value::Unsigned16(0));
        let mut engine = PdoEngine::new();
        engine.rpdos.push(Rpdo::new(PdoCommParams::new(0x202), vec![PdoMapping::new(0x2100, 0, 16)]));

        engine.receive(0, &[0x34, 0x12], &mut dict);
        assert_eq!(dict.read_raw(0x2100, 0).unwrap(), vec![0, 0]);

        engine.on_sync(Instant::ZERO, &mut dict);
        assert_eq!(dict.read_raw(0x2100, 0).unwrap(), vec![0x34, 0x12]);
    }

    #[test]
    fn event_driven_rpdo_applies_immediately() {
        let mut dict = dict_with(0x2100, Value::Unsigned16(0));
        let mut engine = PdoEngine::new();
        let mut comm = PdoCommParams::new(0x202);
        comm.transmission_type = 254;
        engine.rpdos.push(Rpdo::new(comm, vec![PdoMapping::new(0x2100, 0, 16)]));

        engine.receive(0, &[0x34, 0x12], &mut dict);
        assert_eq!(dict.read_raw(0x2100, 0).unwrap(), vec![0x34, 0x12]);
    }

    #[test]
    fn mpdo_frame_round_trips() {
        let frame = pack_mpdo(5, 0x2000, 1, [0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(unpack_mpdo(&frame), (5, 0x2000, 1, [0xEF, 0xBE, 0xAD, 0xDE]));
    }

    #[test]
    fn sam_mpdo_writes_bound_local_object() {
        let mut dict = dict_with(0x2200, Value::Unsigned32(0));
        let mut mpdo = MpdoEngine::new();
        mpdo.scanner_list.push(ScannerEntry {
            source_node_id: 5,
            source_index: 0x2000,
            source_sub_index: 1,
            local_index: 0x2200,
            local_sub_index: 0,
        });
        mpdo.receive_sam(5, 0x2000, 1, [0xEF, 0xBE, 0xAD, 0xDE], &mut dict).unwrap();
        assert_eq!(dict.read_raw(0x2200, 0).unwrap(), vec![0xEF, 0xBE, 0xAD, 0xDE]);
    }
}
