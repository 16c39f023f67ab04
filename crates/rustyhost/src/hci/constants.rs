//! HCI protocol constants
//!
//! Only the event codes the host core consumes are listed here.

// HCI packet types
pub const HCI_EVENT_PKT: u8 = 0x04;

// HCI Events
pub const EVT_LE_META_EVENT: u8 = 0x3E;

// LE Meta Events
pub const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;
pub const EVT_LE_EXTENDED_ADVERTISING_REPORT: u8 = 0x0D;
pub const EVT_LE_PERIODIC_ADVERTISING_REPORT: u8 = 0x0F;
pub const EVT_LE_PERIODIC_ADVERTISING_SYNC_LOST: u8 = 0x10;

/// Legacy reports carry no PHY information; they are always on LE 1M
pub const LE_PHY_1M: u8 = 0x01;
/// Secondary PHY value meaning "no packets on the secondary channel"
pub const LE_PHY_NONE: u8 = 0x00;
/// TX power value meaning "not available"
pub const TX_POWER_NOT_AVAILABLE: i8 = 127;
