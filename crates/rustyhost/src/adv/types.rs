//! Type definitions for LE advertising report reassembly

use super::constants::*;
use crate::gap::AddressWithType;
use bitflags::bitflags;

bitflags! {
    /// Extended advertising event properties (data status excluded)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExtendedEventType: u16 {
        const CONNECTABLE = EVT_TYPE_CONNECTABLE;
        const SCANNABLE = EVT_TYPE_SCANNABLE;
        const DIRECTED = EVT_TYPE_DIRECTED;
        const SCAN_RESPONSE = EVT_TYPE_SCAN_RESPONSE;
        const LEGACY = EVT_TYPE_LEGACY;
    }
}

impl ExtendedEventType {
    /// Split a raw 16-bit event type into its properties and data status
    pub fn from_raw(raw: u16) -> (Self, DataStatus) {
        let status = ((raw & EVT_TYPE_DATA_STATUS_MASK) >> EVT_TYPE_DATA_STATUS_SHIFT) as u8;
        (
            Self::from_bits_truncate(raw),
            DataStatus::from_u8(status),
        )
    }

    /// Map a legacy advertising PDU type onto its extended encoding
    pub fn from_legacy(pdu_type: u8) -> Option<Self> {
        let raw = match pdu_type {
            LEGACY_ADV_IND => EXT_EVT_LEGACY_ADV_IND,
            LEGACY_ADV_DIRECT_IND => EXT_EVT_LEGACY_ADV_DIRECT_IND,
            LEGACY_ADV_SCAN_IND => EXT_EVT_LEGACY_ADV_SCAN_IND,
            LEGACY_ADV_NONCONN_IND => EXT_EVT_LEGACY_ADV_NONCONN_IND,
            // Scan responses are reported against ADV_IND; the reassembler
            // restores the real connectable bit from the stored advertisement
            LEGACY_SCAN_RSP => EXT_EVT_LEGACY_SCAN_RSP_TO_ADV_IND,
            _ => return None,
        };
        Some(Self::from_bits_truncate(raw))
    }

    pub fn is_connectable(&self) -> bool {
        self.contains(Self::CONNECTABLE)
    }

    pub fn is_scannable(&self) -> bool {
        self.contains(Self::SCANNABLE)
    }

    pub fn is_scan_response(&self) -> bool {
        self.contains(Self::SCAN_RESPONSE)
    }

    pub fn is_legacy(&self) -> bool {
        self.contains(Self::LEGACY)
    }
}

/// Completeness of the data carried by one report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataStatus {
    Complete,
    More,
    Truncated,
}

impl DataStatus {
    pub fn from_u8(value: u8) -> Self {
        match value {
            DATA_STATUS_COMPLETE => DataStatus::Complete,
            DATA_STATUS_MORE => DataStatus::More,
            // Reserved value 3 is treated like truncation
            _ => DataStatus::Truncated,
        }
    }

    pub fn to_u8(&self) -> u8 {
        match self {
            DataStatus::Complete => DATA_STATUS_COMPLETE,
            DataStatus::More => DATA_STATUS_MORE,
            DataStatus::Truncated => DATA_STATUS_TRUNCATED,
        }
    }
}

/// One advertising report fragment as delivered by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvReportFragment {
    pub event_type: ExtendedEventType,
    pub data_status: DataStatus,
    pub address: AddressWithType,
    pub primary_phy: u8,
    pub secondary_phy: u8,
    /// Advertising set id, [`SID_NOT_PRESENT`] when absent
    pub sid: u8,
    pub tx_power: i8,
    pub rssi: i8,
    pub periodic_adv_interval: u16,
    pub direct_address: Option<AddressWithType>,
    pub data: Vec<u8>,
}

/// A fully reassembled advertising report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvReport {
    pub event_type: ExtendedEventType,
    pub data_status: DataStatus,
    pub address: AddressWithType,
    pub primary_phy: u8,
    pub secondary_phy: u8,
    pub sid: u8,
    pub tx_power: i8,
    pub rssi: i8,
    pub periodic_adv_interval: u16,
    pub direct_address: Option<AddressWithType>,
    pub data: Vec<u8>,
}

/// One periodic advertising report fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodicReportFragment {
    pub sync_handle: u16,
    pub tx_power: i8,
    pub rssi: i8,
    pub cte_type: u8,
    pub data_status: DataStatus,
    pub data: Vec<u8>,
}

/// A fully reassembled periodic advertising report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodicReport {
    pub sync_handle: u16,
    pub tx_power: i8,
    pub rssi: i8,
    pub cte_type: u8,
    pub data_status: DataStatus,
    pub data: Vec<u8>,
}

/// Identity of one advertising set in the fragment cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdvKey {
    /// `None` for anonymous advertisers
    pub address: Option<AddressWithType>,
    /// `None` when the report carried no ADI
    pub sid: Option<u8>,
}

impl AdvKey {
    pub fn for_fragment(fragment: &AdvReportFragment) -> Self {
        Self {
            address: if fragment.address.is_anonymous() {
                None
            } else {
                Some(fragment.address)
            },
            sid: if fragment.sid == SID_NOT_PRESENT {
                None
            } else {
                Some(fragment.sid)
            },
        }
    }
}

/// Reassembler tunables
#[derive(Debug, Clone)]
pub struct AdvConfig {
    /// Maximum partial extended reports kept
    pub cache_size: usize,
    /// Maximum partial periodic reports kept
    pub periodic_cache_size: usize,
    /// Active scanning: scannable advertisements wait for a scan response
    pub scan_responses: bool,
}

impl Default for AdvConfig {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            periodic_cache_size: DEFAULT_CACHE_SIZE,
            scan_responses: true,
        }
    }
}

/// Reassembled output delivered to the scanner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvEvent {
    Report(AdvReport),
    PeriodicReport(PeriodicReport),
    PeriodicSyncLost { sync_handle: u16 },
}
