use crate::gap::constants::*;
use std::fmt;
use std::str::FromStr;

/// Address type tag attached to a device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressType {
    Public,
    Random,
    PublicIdentity,
    RandomIdentity,
    /// Advertiser did not include an address
    Anonymous,
}

impl From<u8> for AddressType {
    fn from(value: u8) -> Self {
        match value {
            PUBLIC_DEVICE_ADDRESS => AddressType::Public,
            RANDOM_DEVICE_ADDRESS => AddressType::Random,
            PUBLIC_IDENTITY_ADDRESS => AddressType::PublicIdentity,
            RANDOM_IDENTITY_ADDRESS => AddressType::RandomIdentity,
            ANONYMOUS_ADDRESS => AddressType::Anonymous,
            _ => AddressType::Public,
        }
    }
}

impl From<AddressType> for u8 {
    fn from(value: AddressType) -> Self {
        match value {
            AddressType::Public => PUBLIC_DEVICE_ADDRESS,
            AddressType::Random => RANDOM_DEVICE_ADDRESS,
            AddressType::PublicIdentity => PUBLIC_IDENTITY_ADDRESS,
            AddressType::RandomIdentity => RANDOM_IDENTITY_ADDRESS,
            AddressType::Anonymous => ANONYMOUS_ADDRESS,
        }
    }
}

/// Sub-kind of a random device address, taken from its two top bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RandomAddressKind {
    Static,
    Resolvable,
    NonResolvable,
}

/// Bluetooth device address, stored in wire (little-endian) order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    /// The all-zero address
    pub const ANY: BdAddr = BdAddr { bytes: [0; 6] };

    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&slice[0..6]);
            Some(Self { bytes })
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_zero(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }

    /// Classify this address assuming it is a random address
    pub fn random_kind(&self) -> Option<RandomAddressKind> {
        match self.bytes[5] & RANDOM_ADDR_TYPE_MASK {
            RANDOM_ADDR_STATIC => Some(RandomAddressKind::Static),
            RANDOM_ADDR_RESOLVABLE => Some(RandomAddressKind::Resolvable),
            RANDOM_ADDR_NON_RESOLVABLE => Some(RandomAddressKind::NonResolvable),
            _ => None,
        }
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

/// Error returned when an address string is not `XX:XX:XX:XX:XX:XX`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAddrError;

impl fmt::Display for ParseAddrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid Bluetooth address")
    }
}

impl std::error::Error for ParseAddrError {}

impl FromStr for BdAddr {
    type Err = ParseAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(ParseAddrError);
        }

        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(ParseAddrError);
            }
            // Text form is most significant byte first
            bytes[5 - i] = u8::from_str_radix(part, 16).map_err(|_| ParseAddrError)?;
        }
        Ok(Self { bytes })
    }
}

/// Device address tagged with its type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressWithType {
    pub address: BdAddr,
    pub address_type: AddressType,
}

impl AddressWithType {
    pub fn new(address: BdAddr, address_type: AddressType) -> Self {
        Self {
            address,
            address_type,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.address_type == AddressType::Anonymous
    }
}

impl fmt::Display for AddressWithType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{:?}]", self.address, self.address_type)
    }
}

/// Physical transport a link runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Le,
    BrEdr,
}
