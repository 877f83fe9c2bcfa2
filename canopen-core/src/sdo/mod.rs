//! SDO (Service Data Object) protocol: expedited/segmented/block transfer
//! over 8-byte CAN frames.

pub mod buffer;
pub mod client;
pub mod server;
pub mod wire;

pub use buffer::TransferBuffer;
pub use client::SdoClient;
pub use server::SdoServer;
