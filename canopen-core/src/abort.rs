//! SDO abort codes (CiA 301 table 23).
//!
//! Every fallible operation that originates at the protocol boundary —
//! dictionary access, SDO transfer bookkeeping, PDO mapping — reports
//! through this taxonomy rather than a bare [`crate::CanOpenError`], since
//! an abort code is wire data the peer needs to see, not a local failure.

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AbortCode {
    #[error("toggle bit not alternated")]
    Toggle = 0x0503_0000,
    #[error("SDO protocol timed out")]
    Timeout = 0x0504_0000,
    #[error("client/server command specifier not valid or unknown")]
    NoCs = 0x0504_0001,
    #[error("invalid block size")]
    BlkSize = 0x0504_0002,
    #[error("invalid sequence number")]
    BlkSeq = 0x0504_0003,
    #[error("CRC error")]
    BlkCrc = 0x0504_0004,
    #[error("out of memory")]
    NoMem = 0x0504_0005,
    #[error("unsupported access to an object")]
    Unsupported = 0x0601_0000,
    #[error("attempt to read a write-only object")]
    NoRead = 0x0601_0001,
    #[error("attempt to write a read-only object")]
    NoWrite = 0x0601_0002,
    #[error("object does not exist in the object dictionary")]
    NoObj = 0x0602_0000,
    #[error("object cannot be mapped to the PDO")]
    NoPdo = 0x0604_0041,
    #[error("the number/length of objects to be mapped exceeds PDO length")]
    PdoLen = 0x0604_0042,
    #[error("general parameter incompatibility")]
    Incompat = 0x0604_0043,
    #[error("general internal incompatibility in the device")]
    DevIncompat = 0x0604_0047,
    #[error("access failed due to a hardware error")]
    HwError = 0x0606_0000,
    #[error("data type does not match, length of service parameter does not match")]
    TypeLen = 0x0607_0010,
    #[error("data type does not match, length of service parameter too high")]
    TypeLenHigh = 0x0607_0012,
    #[error("data type does not match, length of service parameter too low")]
    TypeLenLow = 0x0607_0013,
    #[error("sub-index does not exist")]
    NoSub = 0x0609_0011,
    #[error("value range of parameter exceeded")]
    ParamValue = 0x0609_0030,
    #[error("value of parameter written too high")]
    ParamHi = 0x0609_0031,
    #[error("value of parameter written too low")]
    ParamLo = 0x0609_0032,
    #[error("maximum value is less than minimum value")]
    ParamRange = 0x0609_0036,
    #[error("general error")]
    General = 0x0800_0000,
    #[error("data cannot be transferred or stored to the application")]
    Store = 0x0800_0020,
    #[error("data cannot be transferred because of local control")]
    LocalCtrl = 0x0800_0021,
    #[error("data cannot be transferred because of the present device state")]
    DevState = 0x0800_0022,
    #[error("object dictionary dynamic generation fails, or no object dictionary present")]
    NoOd = 0x0800_0023,
    #[error("no data available")]
    NoData = 0x0800_0024,
}

impl AbortCode {
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl From<AbortCode> for u32 {
    fn from(value: AbortCode) -> Self {
        value.code()
    }
}

impl TryFrom<u32> for AbortCode {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        use AbortCode::*;
        Ok(match value {
            0x0503_0000 => Toggle,
            0x0504_0000 => Timeout,
            0x0504_0001 => NoCs,
            0x0504_0002 => BlkSize,
            0x0504_0003 => BlkSeq,
            0x0504_0004 => BlkCrc,
            0x0504_0005 => NoMem,
            0x0601_0000 => Unsupported,
            0x0601_0001 => NoRead,
            0x0601_0002 => NoWrite,
            0x0602_0000 => NoObj,
            0x0604_0041 => NoPdo,
            0x0604_0042 => PdoLen,
            0x0604_0043 => Incompat,
            0x0604_0047 => DevIncompat,
            0x0606_0000 => HwError,
            0x0607_0010 => TypeLen,
            0x0607_0012 => TypeLenHigh,
            0x0607_0013 => TypeLenLow,
            0x0609_0011 => NoSub,
            0x0609_0030 => ParamValue,
            0x0609_0031 => ParamHi,
            0x0609_0032 => ParamLo,
            0x0609_0036 => ParamRange,
            0x0800_0000 => General,
            0x0800_0020 => Store,
            0x0800_0021 => LocalCtrl,
            0x0800_0022 => DevState,
            0x0800_0023 => NoOd,
            0x0800_0024 => NoData,
            _ => return Err(()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_u32() {
        for code in [AbortCode::NoWrite, AbortCode::Timeout, AbortCode::BlkCrc] {
            let raw: u32 = code.into();
            assert_eq!(AbortCode::try_from(raw), Ok(code));
        }
    }
}
