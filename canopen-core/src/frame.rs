//! CAN frames and the well-known CANopen COB-IDs.

use std::fmt;

use enum_display_derive::Display;
use num_enum::TryFromPrimitive;

use crate::error::CanOpenError;

/// Classic CAN payload is 0..8 bytes; CAN-FD extends that to 0..64.
pub const MAX_CLASSIC_LEN: usize = 8;
pub const MAX_FD_LEN: usize = 64;

/// The flag bits that accompany a CAN-ID.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    /// 29-bit extended identifier rather than an 11-bit base one.
    pub ide: bool,
    /// Remote transmission request.
    pub rtr: bool,
    /// CAN-FD frame format.
    pub fdf: bool,
    /// CAN-FD bit rate switch.
    pub brs: bool,
    /// CAN-FD error state indicator.
    pub esi: bool,
}

/// A wire-level CAN (or CAN-FD) frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub id: u32,
    pub flags: Flags,
    len: u8,
    data: [u8; MAX_FD_LEN],
}

impl Frame {
    pub fn new(id: u32, flags: Flags, payload: &[u8]) -> Result<Self, CanOpenError> {
        let max = if flags.fdf { MAX_FD_LEN } else { MAX_CLASSIC_LEN };
        if payload.len() > max {
            return Err(CanOpenError::InvalidDataLength {
                length: payload.len(),
                max,
            });
        }
        let max_id = if flags.ide { 0x1FFF_FFFF } else { 0x7FF };
        if id > max_id {
            return Err(CanOpenError::InvalidCobId { cob_id: id });
        }
        let mut data = [0u8; MAX_FD_LEN];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Frame {
            id,
            flags,
            len: payload.len() as u8,
            data,
        })
    }

    pub fn new_std(id: u32, payload: &[u8]) -> Result<Self, CanOpenError> {
        Frame::new(id, Flags::default(), payload)
    }

    pub fn new_rtr(id: u32) -> Result<Self, CanOpenError> {
        Frame::new(
            id,
            Flags {
                rtr: true,
                ..Flags::default()
            },
            &[],
        )
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}#", self.id)?;
        for byte in self.data() {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

/// The broad category a CAN-ID falls into (the frame router demultiplexes
/// on this and the node-id before dispatching).
#[allow(non_camel_case_types)]
#[derive(Display, Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Nmt = 0b0000,
    SyncEmergency = 0b0001,
    Time = 0b0010,
    Tpdo1 = 0b0011,
    Rpdo1 = 0b0100,
    Tpdo2 = 0b0101,
    Rpdo2 = 0b0110,
    Tpdo3 = 0b0111,
    Rpdo3 = 0b1000,
    Tpdo4 = 0b1001,
    Rpdo4 = 0b1010,
    SdoTx = 0b1011,
    SdoRx = 0b1100,
    NmtErrorControl = 0b1110,
}

const TYPE_START_BIT: u32 = 7;
const TYPE_MASK: u32 = 0b1111 << TYPE_START_BIT;
const NODE_MASK: u32 = 0b111_1111;

/// Split a standard (11-bit) CANopen COB-ID into its frame type and
/// node-id, mirroring the function-based COB-ID layout.
pub fn split_cob_id(cob_id: u32) -> Result<(FrameType, u8), CanOpenError> {
    if cob_id > 0x77F {
        return Err(CanOpenError::InvalidCobId { cob_id });
    }
    let node_id = (cob_id & NODE_MASK) as u8;
    let frame_type = FrameType::try_from(((cob_id & TYPE_MASK) >> TYPE_START_BIT) as u8)
        .map_err(|_| CanOpenError::InvalidCobId { cob_id })?;
    Ok((frame_type, node_id))
}

/// Well-known COB-IDs, as functions of node-id.
pub mod cob_id {
    pub const NMT_COMMAND: u32 = 0x000;
    pub const SYNC: u32 = 0x080;

    pub fn emergency(node_id: u8) -> u32 {
        0x080 + node_id as u32
    }

    pub const TIME: u32 = 0x100;

    pub fn tpdo(k: u8, node_id: u8) -> u32 {
        0x180 + 0x100 * k as u32 + node_id as u32
    }

    pub fn rpdo(k: u8, node_id: u8) -> u32 {
        0x200 + 0x100 * k as u32 + node_id as u32
    }

    pub fn sdo_tx(node_id: u8) -> u32 {
        0x580 + node_id as u32
    }

    pub fn sdo_rx(node_id: u8) -> u32 {
        0x600 + node_id as u32
    }

    pub fn error_control(node_id: u8) -> u32 {
        0x700 + node_id as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_tpdo1_cob_id() {
        let (frame_type, node_id) = split_cob_id(cob_id::tpdo(0, 5)).unwrap();
        assert_eq!(frame_type, FrameType::Tpdo1);
        assert_eq!(node_id, 5);
    }

    #[test]
    fn rejects_oversized_payload() {
        let err = Frame::new_std(0x180, &[0; 9]).unwrap_err();
        assert_eq!(
            err,
            CanOpenError::InvalidDataLength { length: 9, max: 8 }
        );
    }

    #[test]
    fn fd_frame_allows_up_to_64_bytes() {
        let flags = Flags {
            fdf: true,
            ..Flags::default()
        };
        let frame = Frame::new(0x180, flags, &[0xAA; 64]).unwrap();
        assert_eq!(frame.len(), 64);
    }
}
