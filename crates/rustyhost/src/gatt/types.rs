//! Common types for GATT operations
//!
//! This module defines the common types used for GATT client operations:
//! attribute UUIDs, discovered records, the per-app connection identifier
//! and the events an application receives.

use crate::att::AttErrorCode;
use crate::bearer::BearerId;
use crate::gap::BdAddr;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Bluetooth base UUID 00000000-0000-1000-8000-00805F9B34FB, little-endian
const BASE_UUID: [u8; 16] = [
    0xFB, 0x34, 0x9B, 0x5F, 0x80, 0x00, 0x00, 0x80, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// UUID for GATT attributes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Uuid {
    /// 16-bit UUID (actually 16-bit)
    Uuid16(u16),
    /// 32-bit UUID (actually 32-bit)
    Uuid32(u32),
    /// 128-bit UUID (full UUID)
    Uuid128([u8; 16]),
}

impl Uuid {
    /// Convert raw bytes to UUID based on length
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes.len() {
            2 => {
                let uuid = u16::from_le_bytes([bytes[0], bytes[1]]);
                Some(Uuid::Uuid16(uuid))
            }
            4 => {
                let uuid = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                Some(Uuid::Uuid32(uuid))
            }
            16 => {
                let mut uuid = [0u8; 16];
                uuid.copy_from_slice(bytes);
                Some(Uuid::Uuid128(uuid))
            }
            _ => None,
        }
    }

    /// Create a UUID from a 16-bit value
    pub fn from_u16(uuid: u16) -> Self {
        Uuid::Uuid16(uuid)
    }

    /// Create a UUID from a 32-bit value
    pub fn from_u32(uuid: u32) -> Self {
        Uuid::Uuid32(uuid)
    }

    /// Create a UUID from a 128-bit value
    pub fn from_u128(uuid: u128) -> Self {
        Uuid::Uuid128(uuid.to_le_bytes())
    }

    /// Get the bytes representation of this UUID
    pub fn as_bytes(&self) -> Vec<u8> {
        match self {
            Uuid::Uuid16(uuid) => uuid.to_le_bytes().to_vec(),
            Uuid::Uuid32(uuid) => uuid.to_le_bytes().to_vec(),
            Uuid::Uuid128(uuid) => uuid.to_vec(),
        }
    }

    /// Get the 16-bit UUID value if this is a 16-bit UUID
    pub fn as_u16(&self) -> Option<u16> {
        match self {
            Uuid::Uuid16(uuid) => Some(*uuid),
            _ => None,
        }
    }

    /// Get the 32-bit UUID value if this is a 32-bit UUID
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Uuid::Uuid32(uuid) => Some(*uuid),
            _ => None,
        }
    }

    /// Full 128-bit form, little-endian
    pub fn to_uuid128(&self) -> [u8; 16] {
        let short = match self {
            Uuid::Uuid16(uuid) => *uuid as u32,
            Uuid::Uuid32(uuid) => *uuid,
            Uuid::Uuid128(uuid) => return *uuid,
        };
        let mut bytes = BASE_UUID;
        bytes[12..16].copy_from_slice(&short.to_le_bytes());
        bytes
    }

    /// Bytes as ATT carries them
    ///
    /// ATT only knows 16-bit and 128-bit UUIDs, so a 32-bit UUID goes out in
    /// its 128-bit form.
    pub fn to_att_bytes(&self) -> Vec<u8> {
        match self {
            Uuid::Uuid16(uuid) => uuid.to_le_bytes().to_vec(),
            _ => self.to_uuid128().to_vec(),
        }
    }

    /// Compare two UUIDs regardless of their encoded width
    pub fn same_as(&self, other: &Uuid) -> bool {
        self.to_uuid128() == other.to_uuid128()
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Uuid::Uuid16(uuid) => write!(f, "{:04x}", uuid),
            Uuid::Uuid32(uuid) => write!(f, "{:08x}", uuid),
            Uuid::Uuid128(uuid) => {
                write!(
                    f,
                    "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
                    uuid[15], uuid[14], uuid[13], uuid[12],
                    uuid[11], uuid[10],
                    uuid[9], uuid[8],
                    uuid[7], uuid[6],
                    uuid[5], uuid[4], uuid[3], uuid[2], uuid[1], uuid[0]
                )
            }
        }
    }
}

/// Characteristic properties bit field of a characteristic declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicProperty(pub u8);

impl CharacteristicProperty {
    pub const BROADCAST: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const WRITE_WITHOUT_RESPONSE: u8 = 0x04;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
    pub const INDICATE: u8 = 0x20;
    pub const AUTHENTICATED_SIGNED_WRITES: u8 = 0x40;
    pub const EXTENDED_PROPERTIES: u8 = 0x80;

    pub fn can_read(&self) -> bool {
        (self.0 & Self::READ) != 0
    }

    pub fn can_write(&self) -> bool {
        (self.0 & Self::WRITE) != 0
    }

    pub fn can_write_without_response(&self) -> bool {
        (self.0 & Self::WRITE_WITHOUT_RESPONSE) != 0
    }

    pub fn can_notify(&self) -> bool {
        (self.0 & Self::NOTIFY) != 0
    }

    pub fn can_indicate(&self) -> bool {
        (self.0 & Self::INDICATE) != 0
    }

    pub fn can_sign_writes(&self) -> bool {
        (self.0 & Self::AUTHENTICATED_SIGNED_WRITES) != 0
    }
}

/// A GATT service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    /// Service UUID
    pub uuid: Uuid,
    /// Whether this is a primary or secondary service
    pub is_primary: bool,
    /// Start handle for this service
    pub start_handle: u16,
    /// End handle for this service
    pub end_handle: u16,
}

/// An include declaration inside a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludedService {
    /// Handle of the include declaration itself
    pub handle: u16,
    pub uuid: Uuid,
    pub start_handle: u16,
    pub end_handle: u16,
}

/// A GATT characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Declaration handle
    pub declaration_handle: u16,
    /// Value handle
    pub value_handle: u16,
    /// Characteristic properties
    pub properties: CharacteristicProperty,
}

/// A characteristic descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub handle: u16,
    pub uuid: Uuid,
}

/// Registered application handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GattIf(pub u8);

impl fmt::Display for GattIf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "if{}", self.0)
    }
}

/// One application's view of one peer link
///
/// The link index sits in the high byte and the app handle in the low
/// byte, so every app gets its own identifier for the same link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u16);

impl ConnId {
    pub fn new(gatt_if: GattIf, tcb_idx: u8) -> Self {
        ConnId(((tcb_idx as u16) << 8) | gatt_if.0 as u16)
    }

    pub fn gatt_if(&self) -> GattIf {
        GattIf((self.0 & 0xFF) as u8)
    }

    pub fn tcb_idx(&self) -> u8 {
        (self.0 >> 8) as u8
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn {:#06x}", self.0)
    }
}

/// What a discovery procedure looks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryType {
    AllServices,
    ServicesByUuid(Uuid),
    IncludedServices,
    /// Characteristic declarations, optionally filtered by UUID
    Characteristics(Option<Uuid>),
    Descriptors,
}

/// One record found by discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryRecord {
    Service(Service),
    IncludedService(IncludedService),
    Characteristic(Characteristic),
    Descriptor(Descriptor),
}

/// Read procedures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadType {
    /// Read a value by handle, continuing with blob reads when it is long
    ByHandle(u16),
    /// Read the first value of a type within a range
    ByUuid { start: u16, end: u16, uuid: Uuid },
    Multiple(Vec<u16>),
    MultipleVariable(Vec<u16>),
    /// A single blob read at an offset, driven by the app
    Partial { handle: u16, offset: u16 },
}

/// Write procedures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    /// Write with response; long values use queued prepare writes
    Request,
    NoResponse,
    Signed,
    /// A single prepare write at an offset, driven by the app
    Prepare { offset: u16 },
}

/// Kind of operation a completion reports on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattOperation {
    Read,
    Write,
    ExecuteWrite,
    /// MTU exchange
    Config,
}

/// Outcome reported to the app
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    /// The server answered with an Error Response
    Att(AttErrorCode),
    /// Malformed response from the server
    InvalidPdu,
    /// Generic failure: unexpected or oversize response, timeout, mismatch
    Error,
    ConnectionClosed,
}

impl GattStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, GattStatus::Success)
    }
}

/// Payload carried by a completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationData {
    None,
    Value { handle: u16, value: Vec<u8> },
    /// Concatenated Read Multiple value
    Multiple(Vec<u8>),
    /// Read Multiple Variable values in request order
    Values(Vec<Vec<u8>>),
    Handle(u16),
    Prepared { handle: u16, offset: u16, value: Vec<u8> },
    Mtu(u16),
}

/// Events delivered to registered applications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    Connected {
        conn_id: ConnId,
        peer: BdAddr,
    },
    Disconnected {
        conn_id: ConnId,
    },
    MtuChanged {
        conn_id: ConnId,
        mtu: u16,
    },
    DiscoveryResult {
        conn_id: ConnId,
        record: DiscoveryRecord,
    },
    DiscoveryComplete {
        conn_id: ConnId,
        status: GattStatus,
    },
    OperationComplete {
        conn_id: ConnId,
        op: GattOperation,
        status: GattStatus,
        data: OperationData,
    },
    Notification {
        conn_id: ConnId,
        handle: u16,
        value: Vec<u8>,
        is_indication: bool,
    },
}

/// GATT client configuration
#[derive(Debug, Clone)]
pub struct GattConfig {
    /// MTU offered in an exchange and the cap on a server-requested one
    pub local_mtu: u16,
    pub max_connections: usize,
    /// Concurrent operations across all links
    pub max_operations: usize,
    pub response_timeout: Duration,
    /// How long apps get to confirm an indication before it is confirmed
    /// on their behalf
    pub ind_ack_timeout: Duration,
}

impl Default for GattConfig {
    fn default() -> Self {
        Self {
            local_mtu: crate::att::ATT_MAX_MTU,
            max_connections: 7,
            max_operations: 24,
            response_timeout: Duration::from_secs(crate::att::ATT_TRANSACTION_TIMEOUT),
            ind_ack_timeout: Duration::from_secs(crate::att::GATT_IND_ACK_TIMEOUT),
        }
    }
}

/// GATT client errors raised at the API edge
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GattError {
    #[error("Unknown application {0}")]
    UnknownApp(GattIf),

    #[error("No connection for {0}")]
    NotConnected(ConnId),

    #[error("Bearer {0} is not an ATT bearer")]
    UnknownBearer(BearerId),

    #[error("No resources")]
    NoResources,

    #[error("Invalid handle {0:#06x}")]
    InvalidHandle(u16),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("No signing key for {0}")]
    NoSigningKey(BdAddr),
}

/// GATT Result type
pub type GattResult<T> = Result<T, GattError>;
