//! Attribute Protocol (ATT) implementation
//!
//! This module provides the client half of ATT, the foundation for the
//! GATT client: opcodes and error codes, and the PDUs a client sends and
//! receives.

pub mod constants;
pub mod error;
pub mod pdu;

// Re-export the public API
pub use self::constants::*;
pub use self::error::{AttError, AttErrorCode, AttResult};
pub use self::pdu::{ClientPdu, GroupValue, HandleRange, HandleValue, ServerPdu};
