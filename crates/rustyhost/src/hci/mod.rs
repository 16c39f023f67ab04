//! Bluetooth HCI event ingress
//!
//! The HCI transport itself lives below the core; this module only decodes
//! the events the core consumes.

pub mod constants;
pub mod packet;


pub use packet::{HciEvent, LeMetaEvent};
