//! RustyHost - the protocol core of a Bluetooth host stack
//!
//! This library implements the wire-level engines that sit above L2CAP:
//! the RFCOMM multiplexer and serial ports, the Security Manager pairing
//! engine, the GATT client and the LE advertising report reassembler.
//! The engines talk to the lower layer only through the [`bearer::Bearer`]
//! trait and are driven by one [`Stack`] context on a single-threaded
//! [`executor::Executor`].

pub mod adv;
pub mod att;
pub mod bearer;
pub mod codec;
pub mod config;
pub mod error;
pub mod executor;
pub mod gap;
pub mod gatt;
pub mod hci;
pub mod rfcomm;
pub mod smp;
pub mod stack;
pub mod timer;

#[cfg(test)]
pub(crate) mod testing;

// Re-export common types for convenience
pub use adv::{AdvEvent, AdvReassembler, AdvReport};
pub use att::{AttError, AttErrorCode};
pub use bearer::{Bearer, BearerDescriptor, BearerId, SendStatus};
pub use config::StackConfig;
pub use error::{Error, Result};
pub use executor::{Executor, Poster};
pub use gap::{AddressType, AddressWithType, BdAddr, Transport};
pub use gatt::{ConnId, GattClient, GattEvent, GattIf, Uuid};
pub use rfcomm::{PortHandle, RfcommManager};
pub use smp::{AuthRequirements, IoCapability, KeyDistribution, SecurityLevel, SmpEvent, SmpManager};
pub use stack::Stack;
