//! Crate-wide error type.
//!
//! Protocol-level failures that a remote peer needs to see travel as
//! [`crate::sdo::AbortCode`] on the wire, not as [`CanOpenError`] — this
//! type is for the Rust-level API surface (bad constructor arguments,
//! dictionary construction conflicts, timer misuse).

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum CanOpenError {
    #[error("node-id {node_id} is out of the allowed range 1..=127")]
    InvalidNodeId { node_id: u8 },

    #[error("the COB-ID 0x{cob_id:x} is not a valid CANopen COB-ID")]
    InvalidCobId { cob_id: u32 },

    #[error("data length should not exceed {max} bytes ({length} given)")]
    InvalidDataLength { length: usize, max: usize },

    #[error("object 0x{index:04X} is already registered in the dictionary")]
    DuplicateIndex { index: u16 },

    #[error("sub-index {sub_index:02X} is already registered on object 0x{index:04X}")]
    DuplicateSubIndex { index: u16, sub_index: u8 },

    #[error("object 0x{index:04X} does not exist")]
    ObjectDoesNotExist { index: u16 },

    #[error("sub-index {sub_index:02X} does not exist on object 0x{index:04X}")]
    SubIndexDoesNotExist { index: u16, sub_index: u8 },

    #[error("value type mismatch: expected {expected:?}, found {found:?}")]
    TypeMismatch {
        expected: crate::value::DataType,
        found: crate::value::DataType,
    },

    #[error("the monotonic clock must not go backward (last={last:?}, given={given:?})")]
    ClockWentBackward {
        last: crate::bus::Instant,
        given: crate::bus::Instant,
    },

    #[error("byte range too short to hold a value of this type")]
    MalformedRange,

    #[error("VISIBLE_STRING value contains a non-ASCII byte")]
    NotVisibleAscii,

    #[error("allocation failed while growing an SDO transfer buffer")]
    NoMemory,
}
