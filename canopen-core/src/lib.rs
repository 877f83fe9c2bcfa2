//! `canopen-core` — the CiA 301 object dictionary and service protocol core.
//!
//! This crate is the engine described in the project's design documents: an
//! in-memory object dictionary plus the state machines that drive SDO,
//! PDO, NMT, SYNC, heartbeat/node-guarding and emergency traffic on top of
//! it. It does not open a CAN socket, does not run an async executor, and
//! does not parse EDS/DCF files — those are left to whatever binary wires
//! this crate to a real bus through `bus::Bus`'s transmit callback.
//!
//! The engine is single-threaded and callback-driven: advancing the clock
//! or feeding it a frame may run user callbacks synchronously, but nothing
//! in here spawns a thread or blocks.

#[macro_use]
extern crate enum_display_derive;

pub mod abort;
pub mod bus;
pub mod dictionary;
pub mod driver;
pub mod error;
pub mod frame;
pub mod nmt;
pub mod pdo;
pub mod sdo;
pub mod value;

pub use crate::abort::AbortCode;
pub use crate::error::CanOpenError;
pub use crate::value::{DataType, Value};
