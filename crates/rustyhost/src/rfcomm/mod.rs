//! RFCOMM serial port emulation over L2CAP
//!
//! One multiplexer runs per peer on a single L2CAP channel (PSM 3). Each
//! emulated serial port is a DLCI on that multiplexer. Flow control is
//! either TS 07.10 (MSC FC bit) or credit based, picked by the first
//! parameter negotiation on the multiplexer.

pub mod constants;
pub mod frame;
mod manager;
mod mux;
mod port;
pub mod types;

pub use frame::{calc_fcs, check_fcs, FrameError, FrameType, MuxCommand, MuxFrame, PnParams, RfcommFrame};
pub use manager::RfcommManager;
pub use types::*;

#[cfg(test)]
mod tests;
