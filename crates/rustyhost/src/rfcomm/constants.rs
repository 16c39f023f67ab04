//! Constants for the RFCOMM multiplexer and ports

/// Control channel DLCI
pub const RFCOMM_MX_DLCI: u8 = 0;
/// Highest DLCI usable by a port
pub const RFCOMM_MAX_DLCI: u8 = 61;
/// Server channel numbers run 1..=30
pub const RFCOMM_MAX_SCN: u8 = 30;

// Address and length field bits
pub const RFCOMM_EA: u8 = 0x01;
pub const RFCOMM_CR_MASK: u8 = 0x02;
pub const RFCOMM_SHIFT_DLCI: u8 = 2;

// Frame control field values, P/F bit clear
pub const RFCOMM_SABME: u8 = 0x2F;
pub const RFCOMM_UA: u8 = 0x63;
pub const RFCOMM_DM: u8 = 0x0F;
pub const RFCOMM_DISC: u8 = 0x43;
pub const RFCOMM_UIH: u8 = 0xEF;
pub const RFCOMM_PF: u8 = 0x10;

// Multiplexer command types, C/R and EA bits clear
pub const RFCOMM_MX_PN: u8 = 0x80;
pub const RFCOMM_MX_PSC: u8 = 0x40;
pub const RFCOMM_MX_CLD: u8 = 0xC0;
pub const RFCOMM_MX_TEST: u8 = 0x20;
pub const RFCOMM_MX_FCON: u8 = 0xA0;
pub const RFCOMM_MX_FCOFF: u8 = 0x60;
pub const RFCOMM_MX_MSC: u8 = 0xE0;
pub const RFCOMM_MX_NSC: u8 = 0x10;
pub const RFCOMM_MX_RPN: u8 = 0x90;
pub const RFCOMM_MX_RLS: u8 = 0x50;
pub const RFCOMM_MX_TYPE_MASK: u8 = 0xFC;

// Fixed multiplexer command lengths
pub const RFCOMM_MX_PN_LEN: usize = 8;
pub const RFCOMM_MX_MSC_LEN_NO_BREAK: usize = 2;
pub const RFCOMM_MX_MSC_LEN_WITH_BREAK: usize = 3;
pub const RFCOMM_MX_RPN_REQ_LEN: usize = 1;
pub const RFCOMM_MX_RPN_LEN: usize = 8;
pub const RFCOMM_MX_RLS_LEN: usize = 2;
pub const RFCOMM_MX_NSC_LEN: usize = 1;

// PN convergence layer values (upper nibble of the second PN byte)
pub const RFCOMM_PN_CONV_LAYER_TYPE_1: u8 = 0x00;
pub const RFCOMM_PN_CONV_LAYER_CBFC_I: u8 = 0xF0;
pub const RFCOMM_PN_CONV_LAYER_CBFC_R: u8 = 0xE0;
pub const RFCOMM_PN_PRIORITY_0: u8 = 0x00;
pub const RFCOMM_K_MAX: u8 = 7;

// MSC signal bits
pub const MSC_FC: u8 = 0x02;
pub const MSC_RTC: u8 = 0x04;
pub const MSC_RTR: u8 = 0x08;
pub const MSC_IC: u8 = 0x40;
pub const MSC_DV: u8 = 0x80;
pub const MSC_BREAK: u8 = 0x02;
pub const MSC_BREAK_SHIFT: u8 = 4;

// RLS line status bits
pub const RLS_ERROR: u8 = 0x01;
pub const RLS_OVERRUN: u8 = 0x02;
pub const RLS_PARITY: u8 = 0x04;
pub const RLS_FRAMING: u8 = 0x08;

// RPN parameter mask bits
pub const RPN_PM_BIT_RATE: u16 = 0x0001;
pub const RPN_PM_DATA_BITS: u16 = 0x0002;
pub const RPN_PM_STOP_BITS: u16 = 0x0004;
pub const RPN_PM_PARITY: u16 = 0x0008;
pub const RPN_PM_PARITY_TYPE: u16 = 0x0010;
pub const RPN_PM_XON_CHAR: u16 = 0x0020;
pub const RPN_PM_XOFF_CHAR: u16 = 0x0040;
pub const RPN_PM_XONXOFF_ON_INPUT: u16 = 0x0100;
pub const RPN_PM_XONXOFF_ON_OUTPUT: u16 = 0x0200;
pub const RPN_PM_RTR_ON_INPUT: u16 = 0x0400;
pub const RPN_PM_RTR_ON_OUTPUT: u16 = 0x0800;
pub const RPN_PM_RTC_ON_INPUT: u16 = 0x1000;
pub const RPN_PM_RTC_ON_OUTPUT: u16 = 0x2000;
pub const RPN_PM_MASK: u16 = 0x3F7F;

// RPN default values
pub const RPN_BAUD_9600: u8 = 0x03;
pub const RPN_DATA_BITS_8: u8 = 0x03;
pub const RPN_STOP_BITS_1: u8 = 0x00;
pub const RPN_PARITY_NONE: u8 = 0x00;
pub const RPN_PARITY_ODD: u8 = 0x00;
pub const RPN_FLOW_OFF: u8 = 0x00;
pub const RPN_XON_CHAR: u8 = 0x11;
pub const RPN_XOFF_CHAR: u8 = 0x13;

/// Header bytes in front of the payload of the largest UIH frame:
/// address, control, two length bytes and a credit byte
pub const RFCOMM_DATA_OVERHEAD: u16 = 5;
/// Trailer byte (FCS)
pub const RFCOMM_FCS_LEN: u16 = 1;

// MTU limits
pub const RFCOMM_MIN_MTU: u16 = 23;
pub const RFCOMM_MAX_MTU: u16 = 32767;
pub const RFCOMM_DEFAULT_MTU: u16 = 127;

// Service classes that get remote port negotiation after open
pub const UUID_SERVCLASS_DIALUP_NETWORKING: u16 = 0x1103;
pub const UUID_SERVCLASS_FAX: u16 = 0x1111;
pub const UUID_SERVCLASS_SERIAL_PORT: u16 = 0x1101;

// Timeouts in seconds
pub const RFC_T1_TIMEOUT: u64 = 20;
pub const RFC_T2_TIMEOUT: u64 = 20;
pub const RFC_DISC_TIMEOUT: u64 = 3;
pub const RFC_MCB_INIT_INACT_TIMEOUT: u64 = 60;
pub const RFC_MCB_RELEASE_INACT_TIMEOUT: u64 = 2;

/// FCS value produced by a frame that checks out
pub const RFCOMM_FCS_GOOD: u8 = 0xCF;
