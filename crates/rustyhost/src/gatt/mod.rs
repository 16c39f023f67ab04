//! GATT (Generic Attribute Profile) client
//!
//! This module provides the client side of GATT: discovery, reads, writes
//! and server-initiated values, multiplexed for several applications over
//! the ATT and EATT bearers of each peer.

pub mod client;
pub mod types;

#[cfg(test)]
mod tests;

pub use client::{GattClient, GattEventCallback, GATT_MAX_APPS};
pub use types::*;
