//! Constants for LE advertising report reassembly

// Extended event type bits
pub const EVT_TYPE_CONNECTABLE: u16 = 0x0001;
pub const EVT_TYPE_SCANNABLE: u16 = 0x0002;
pub const EVT_TYPE_DIRECTED: u16 = 0x0004;
pub const EVT_TYPE_SCAN_RESPONSE: u16 = 0x0008;
pub const EVT_TYPE_LEGACY: u16 = 0x0010;

// Data status field, bits 5..6 of the extended event type
pub const EVT_TYPE_DATA_STATUS_SHIFT: u16 = 5;
pub const EVT_TYPE_DATA_STATUS_MASK: u16 = 0x0060;
pub const DATA_STATUS_COMPLETE: u8 = 0x00;
pub const DATA_STATUS_MORE: u8 = 0x01;
pub const DATA_STATUS_TRUNCATED: u8 = 0x02;

// Legacy advertising PDU types as reported in LE Advertising Report
pub const LEGACY_ADV_IND: u8 = 0x00;
pub const LEGACY_ADV_DIRECT_IND: u8 = 0x01;
pub const LEGACY_ADV_SCAN_IND: u8 = 0x02;
pub const LEGACY_ADV_NONCONN_IND: u8 = 0x03;
pub const LEGACY_SCAN_RSP: u8 = 0x04;

// Extended encodings of the legacy PDU types
pub const EXT_EVT_LEGACY_ADV_IND: u16 = 0x0013;
pub const EXT_EVT_LEGACY_ADV_DIRECT_IND: u16 = 0x0015;
pub const EXT_EVT_LEGACY_ADV_SCAN_IND: u16 = 0x0012;
pub const EXT_EVT_LEGACY_ADV_NONCONN_IND: u16 = 0x0010;
pub const EXT_EVT_LEGACY_SCAN_RSP_TO_ADV_IND: u16 = 0x001B;
pub const EXT_EVT_LEGACY_SCAN_RSP_TO_ADV_SCAN_IND: u16 = 0x001A;

/// Advertising SID value meaning "no ADI field"
pub const SID_NOT_PRESENT: u8 = 0xFF;

/// Default number of partial reports kept per cache
pub const DEFAULT_CACHE_SIZE: usize = 7;

/// Largest advertising payload a controller may report for one set
pub const MAX_ADV_DATA_LEN: usize = 1650;
