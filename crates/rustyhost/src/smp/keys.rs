//! Key management for Security Manager Protocol
//!
//! This module handles the various types of keys used in Bluetooth security,
//! including Long Term Keys (LTK), Identity Resolving Keys (IRK), and
//! Connection Signature Resolving Keys (CSRK), and the storage interface
//! the pairing engine persists them through.
//!
//! Stored records are opaque byte strings to the [`KeyStore`]; the typed
//! records below know how to encode and decode themselves.

use super::crypto::SmpCrypto;
use super::types::*;
use crate::gap::BdAddr;
use byteorder::{ByteOrder, LittleEndian};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Named key records kept per peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// LTK the peer distributed (or the SC LTK)
    PeerEncryption,
    /// LTK we distributed (or the SC LTK)
    LocalEncryption,
    /// Peer IRK and identity address
    PeerIdentity,
    /// Local IRK handed to the peer
    LocalIdentity,
    PeerCsrk,
    LocalCsrk,
    /// BR/EDR link key, derived or used for cross-transport derivation
    LinkKey,
}

/// Bonded key storage collaborator
///
/// Reads are expected to be synchronous and cheap.
pub trait KeyStore: Send + Sync {
    fn get_bonded_key(&self, address: &BdAddr, key_type: KeyType) -> Option<Vec<u8>>;

    fn save_key(&self, address: &BdAddr, key_type: KeyType, key: &[u8]) -> SmpResult<()>;

    /// Forget every record for the peer
    fn delete(&self, address: &BdAddr) -> SmpResult<()>;

    fn bonded_devices(&self) -> Vec<BdAddr>;
}

/// Long Term Key (LTK) information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongTermKey {
    /// Key value
    pub key: [u8; 16],
    /// EDIV (Encrypted Diversifier)
    pub ediv: u16,
    /// RAND (Random number)
    pub rand: [u8; 8],
    pub key_size: u8,
    pub sec_level: SecurityLevel,
}

impl LongTermKey {
    const LEN: usize = 28;

    pub fn new(key: [u8; 16], ediv: u16, rand: [u8; 8], key_size: u8, sec_level: SecurityLevel) -> Self {
        Self {
            key,
            ediv,
            rand,
            key_size,
            sec_level,
        }
    }

    /// Create an LTK from Secure Connections pairing; EDIV and Rand are zero
    pub fn new_secure_connections(key: [u8; 16], key_size: u8, sec_level: SecurityLevel) -> Self {
        Self::new(key, 0, [0; 8], key_size, sec_level)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&self.key);
        let mut ediv = [0u8; 2];
        LittleEndian::write_u16(&mut ediv, self.ediv);
        out.extend_from_slice(&ediv);
        out.extend_from_slice(&self.rand);
        out.push(self.key_size);
        out.push(self.sec_level.to_u8());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != Self::LEN {
            return None;
        }
        let mut key = [0u8; 16];
        key.copy_from_slice(&data[0..16]);
        let mut rand = [0u8; 8];
        rand.copy_from_slice(&data[18..26]);
        Some(Self {
            key,
            ediv: LittleEndian::read_u16(&data[16..18]),
            rand,
            key_size: data[26],
            sec_level: SecurityLevel::from_u8(data[27]),
        })
    }
}

/// Identity Resolving Key (IRK)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityResolvingKey {
    /// Key value
    pub key: [u8; 16],
    /// Identity address type
    pub identity_address_type: u8,
    /// Identity address
    pub identity_address: BdAddr,
}

impl IdentityResolvingKey {
    const LEN: usize = 23;

    pub fn new(key: [u8; 16], identity_address_type: u8, identity_address: BdAddr) -> Self {
        Self {
            key,
            identity_address_type,
            identity_address,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&self.key);
        out.push(self.identity_address_type);
        out.extend_from_slice(self.identity_address.as_slice());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != Self::LEN {
            return None;
        }
        let mut key = [0u8; 16];
        key.copy_from_slice(&data[0..16]);
        Some(Self {
            key,
            identity_address_type: data[16],
            identity_address: BdAddr::from_slice(&data[17..23])?,
        })
    }
}

/// Connection Signature Resolving Key (CSRK)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSignatureResolvingKey {
    /// Key value
    pub key: [u8; 16],
    /// Counter for signed data
    pub sign_counter: u32,
    pub sec_level: SecurityLevel,
}

impl ConnectionSignatureResolvingKey {
    const LEN: usize = 21;

    pub fn new(key: [u8; 16], sec_level: SecurityLevel) -> Self {
        Self {
            key,
            sign_counter: 0,
            sec_level,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&self.key);
        let mut counter = [0u8; 4];
        LittleEndian::write_u32(&mut counter, self.sign_counter);
        out.extend_from_slice(&counter);
        out.push(self.sec_level.to_u8());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != Self::LEN {
            return None;
        }
        let mut key = [0u8; 16];
        key.copy_from_slice(&data[0..16]);
        Some(Self {
            key,
            sign_counter: LittleEndian::read_u32(&data[16..20]),
            sec_level: SecurityLevel::from_u8(data[20]),
        })
    }
}

/// BR/EDR link key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkKey {
    pub key: [u8; 16],
    pub sec_level: SecurityLevel,
}

impl LinkKey {
    const LEN: usize = 17;

    pub fn new(key: [u8; 16], sec_level: SecurityLevel) -> Self {
        Self { key, sec_level }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.key.to_vec();
        out.push(self.sec_level.to_u8());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != Self::LEN {
            return None;
        }
        let mut key = [0u8; 16];
        key.copy_from_slice(&data[0..16]);
        Some(Self {
            key,
            sec_level: SecurityLevel::from_u8(data[16]),
        })
    }
}

/// In-memory key store implementation
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    keys: RwLock<HashMap<(BdAddr, KeyType), Vec<u8>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn get_bonded_key(&self, address: &BdAddr, key_type: KeyType) -> Option<Vec<u8>> {
        let keys = self.keys.read().ok()?;
        keys.get(&(*address, key_type)).cloned()
    }

    fn save_key(&self, address: &BdAddr, key_type: KeyType, key: &[u8]) -> SmpResult<()> {
        let mut keys = self
            .keys
            .write()
            .map_err(|_| SmpError::StorageError("key store lock poisoned".to_string()))?;
        keys.insert((*address, key_type), key.to_vec());
        Ok(())
    }

    fn delete(&self, address: &BdAddr) -> SmpResult<()> {
        let mut keys = self
            .keys
            .write()
            .map_err(|_| SmpError::StorageError("key store lock poisoned".to_string()))?;
        keys.retain(|(addr, _), _| addr != address);
        Ok(())
    }

    fn bonded_devices(&self) -> Vec<BdAddr> {
        let keys = match self.keys.read() {
            Ok(keys) => keys,
            Err(_) => return Vec::new(),
        };
        let mut devices: Vec<BdAddr> = keys.keys().map(|(addr, _)| *addr).collect();
        devices.sort();
        devices.dedup();
        devices
    }
}

/// Length of an ATT signature: sign counter plus truncated MAC
pub const SIGNATURE_LEN: usize = 12;

/// Produces and checks ATT signed-write signatures with a CSRK
pub struct CsrkSigner {
    crypto: Arc<dyn SmpCrypto>,
    key: ConnectionSignatureResolvingKey,
}

impl CsrkSigner {
    pub fn new(crypto: Arc<dyn SmpCrypto>, key: ConnectionSignatureResolvingKey) -> Self {
        Self { crypto, key }
    }

    /// Counter the next signature will carry
    pub fn counter(&self) -> u32 {
        self.key.sign_counter
    }

    pub fn key(&self) -> &ConnectionSignatureResolvingKey {
        &self.key
    }

    fn mac(&self, message: &[u8], counter: u32) -> [u8; 8] {
        let mut m = message.to_vec();
        let mut tmp = [0u8; 4];
        LittleEndian::write_u32(&mut tmp, counter);
        m.extend_from_slice(&tmp);
        let full = self.crypto.cmac_le(&self.key.key, &m);
        let mut mac = [0u8; 8];
        // most significant 64 bits
        mac.copy_from_slice(&full[8..16]);
        mac
    }

    /// Sign `message` (the ATT PDU up to the signature) and advance the
    /// counter
    pub fn sign(&mut self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        let counter = self.key.sign_counter;
        let mut signature = [0u8; SIGNATURE_LEN];
        LittleEndian::write_u32(&mut signature[0..4], counter);
        signature[4..12].copy_from_slice(&self.mac(message, counter));
        self.key.sign_counter = counter.wrapping_add(1);
        signature
    }

    /// Check a peer signature; the counter must not go backwards
    pub fn verify(&mut self, message: &[u8], signature: &[u8; SIGNATURE_LEN]) -> bool {
        let counter = LittleEndian::read_u32(&signature[0..4]);
        if counter < self.key.sign_counter {
            return false;
        }
        if self.mac(message, counter) != signature[4..12] {
            return false;
        }
        self.key.sign_counter = counter.wrapping_add(1);
        true
    }
}
