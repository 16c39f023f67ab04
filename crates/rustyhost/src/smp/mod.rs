//! Security Manager Protocol (SMP) implementation
//!
//! This module implements the Bluetooth Security Manager Protocol, which is responsible for:
//! - Pairing devices over LE (legacy and Secure Connections) and BR/EDR
//! - Generating and distributing encryption, identity and signing keys
//! - Deriving keys across transports
//! - Signing ATT writes with a CSRK
//!
//! The engine never touches the controller. It asks the caller to start
//! encryption through [`SmpEvent::StartEncryption`] and learns the outcome
//! through [`SmpManager::on_encryption_changed`].

pub mod constants;
mod crypto;
mod keys;
mod manager;
mod method;
mod pdu;
mod types;

#[cfg(test)]
mod tests;

// Re-export public API
pub use self::crypto::{h7_salt, swap, EcdhKeyPair, SmpCrypto, SoftwareCrypto};
pub use self::keys::*;
pub use self::manager::SmpManager;
pub use self::method::{select_model, PairingModel, PasskeyAction};
pub use self::pdu::{SmpCommand, SmpPduError};
pub use self::types::*;
