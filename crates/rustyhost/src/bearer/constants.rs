//! Fixed channel identifiers and protocol/service multiplexers

/// Attribute protocol fixed channel (LE)
pub const ATT_CID: u16 = 0x0004;
/// Security manager fixed channel (LE)
pub const SMP_CID: u16 = 0x0006;
/// Security manager fixed channel over BR/EDR
pub const BR_SMP_CID: u16 = 0x0007;

/// First dynamically allocated channel identifier
pub const FIRST_DYNAMIC_CID: u16 = 0x0040;

/// RFCOMM protocol/service multiplexer
pub const RFCOMM_PSM: u16 = 0x0003;
/// Enhanced ATT protocol/service multiplexer
pub const EATT_PSM: u16 = 0x0027;

/// Minimum L2CAP MTU for LE fixed channels
pub const LE_MIN_MTU: u16 = 23;
/// Minimum L2CAP MTU for BR/EDR
pub const BR_EDR_MIN_MTU: u16 = 48;
