//! Constants for the Security Manager Protocol

// SMP command codes
pub const SMP_PAIRING_REQUEST: u8 = 0x01;
pub const SMP_PAIRING_RESPONSE: u8 = 0x02;
pub const SMP_PAIRING_CONFIRM: u8 = 0x03;
pub const SMP_PAIRING_RANDOM: u8 = 0x04;
pub const SMP_PAIRING_FAILED: u8 = 0x05;
pub const SMP_ENCRYPTION_INFORMATION: u8 = 0x06;
pub const SMP_CENTRAL_IDENTIFICATION: u8 = 0x07;
pub const SMP_IDENTITY_INFORMATION: u8 = 0x08;
pub const SMP_IDENTITY_ADDRESS_INFORMATION: u8 = 0x09;
pub const SMP_SIGNING_INFORMATION: u8 = 0x0A;
pub const SMP_SECURITY_REQUEST: u8 = 0x0B;
pub const SMP_PAIRING_PUBLIC_KEY: u8 = 0x0C;
pub const SMP_PAIRING_DHK_CHECK: u8 = 0x0D;
pub const SMP_PAIRING_KEYPRESS_NOTIFICATION: u8 = 0x0E;
pub const SMP_PAIRING_COMMITMENT: u8 = 0x0F;

pub const SMP_OPCODE_MIN: u8 = SMP_PAIRING_REQUEST;
pub const SMP_OPCODE_MAX: u8 = SMP_PAIRING_COMMITMENT;

/// Exact frame length per opcode, opcode octet included; index 0 unused
pub const SMP_FRAME_SIZES: [usize; 16] = [
    0,  // reserved
    7,  // pairing request
    7,  // pairing response
    17, // pairing confirm
    17, // pairing random
    2,  // pairing failed
    17, // encryption information
    11, // central identification
    17, // identity information
    8,  // identity address information
    17, // signing information
    2,  // security request
    65, // pairing public key
    17, // pairing dhkey check
    2,  // keypress notification
    17, // pairing commitment
];

// IO Capability values
pub const SMP_IO_CAPABILITY_DISPLAY_ONLY: u8 = 0x00;
pub const SMP_IO_CAPABILITY_DISPLAY_YES_NO: u8 = 0x01;
pub const SMP_IO_CAPABILITY_KEYBOARD_ONLY: u8 = 0x02;
pub const SMP_IO_CAPABILITY_NO_INPUT_NO_OUTPUT: u8 = 0x03;
pub const SMP_IO_CAPABILITY_KEYBOARD_DISPLAY: u8 = 0x04;
pub const SMP_IO_CAPABILITY_MAX: u8 = SMP_IO_CAPABILITY_KEYBOARD_DISPLAY;

// OOB data flag
pub const SMP_OOB_NOT_PRESENT: u8 = 0x00;
pub const SMP_OOB_PRESENT: u8 = 0x01;

// Authentication Requirements bit masks
pub const SMP_AUTH_REQ_BONDING: u8 = 0x01;
pub const SMP_AUTH_REQ_BONDING_MASK: u8 = 0x03;
pub const SMP_AUTH_REQ_MITM: u8 = 0x04;
pub const SMP_AUTH_REQ_SC: u8 = 0x08;
pub const SMP_AUTH_REQ_KEYPRESS: u8 = 0x10;
pub const SMP_AUTH_REQ_CT2: u8 = 0x20;

// Pairing Failed reason codes
pub const SMP_REASON_PASSKEY_ENTRY_FAILED: u8 = 0x01;
pub const SMP_REASON_OOB_NOT_AVAILABLE: u8 = 0x02;
pub const SMP_REASON_AUTHENTICATION_REQUIREMENTS: u8 = 0x03;
pub const SMP_REASON_CONFIRM_VALUE_FAILED: u8 = 0x04;
pub const SMP_REASON_PAIRING_NOT_SUPPORTED: u8 = 0x05;
pub const SMP_REASON_ENCRYPTION_KEY_SIZE: u8 = 0x06;
pub const SMP_REASON_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const SMP_REASON_UNSPECIFIED_REASON: u8 = 0x08;
pub const SMP_REASON_REPEATED_ATTEMPTS: u8 = 0x09;
pub const SMP_REASON_INVALID_PARAMETERS: u8 = 0x0A;
pub const SMP_REASON_DHKEY_CHECK_FAILED: u8 = 0x0B;
pub const SMP_REASON_NUMERIC_COMPARISON_FAILED: u8 = 0x0C;
pub const SMP_REASON_BR_EDR_PAIRING_IN_PROGRESS: u8 = 0x0D;
pub const SMP_REASON_CROSS_TRANSPORT_KEY_NOT_ALLOWED: u8 = 0x0E;
pub const SMP_REASON_KEY_REJECTED: u8 = 0x0F;

// SMP key distribution bit masks
pub const SMP_KEY_DIST_ENC_KEY: u8 = 0x01;
pub const SMP_KEY_DIST_ID_KEY: u8 = 0x02;
pub const SMP_KEY_DIST_SIGN_KEY: u8 = 0x04;
pub const SMP_KEY_DIST_LINK_KEY: u8 = 0x08;
pub const SMP_KEY_DIST_MASK: u8 = 0x0F;

// SMP encryption key size limits
pub const SMP_MIN_ENCRYPTION_KEY_SIZE: u8 = 7;
pub const SMP_MAX_ENCRYPTION_KEY_SIZE: u8 = 16;

// Keypress notification types
pub const SMP_KEYPRESS_ENTRY_STARTED: u8 = 0x00;
pub const SMP_KEYPRESS_DIGIT_ENTERED: u8 = 0x01;
pub const SMP_KEYPRESS_DIGIT_ERASED: u8 = 0x02;
pub const SMP_KEYPRESS_CLEARED: u8 = 0x03;
pub const SMP_KEYPRESS_ENTRY_COMPLETED: u8 = 0x04;

// SMP address types as used by c1, f5 and f6
pub const SMP_ADDR_TYPE_PUBLIC: u8 = 0x00;
pub const SMP_ADDR_TYPE_RANDOM: u8 = 0x01;

/// Largest six digit passkey
pub const SMP_PASSKEY_MAX: u32 = 999_999;
/// Rounds of commitment in Secure Connections passkey entry
pub const SMP_PASSKEY_ROUNDS: u8 = 20;

// SMP timeout values (in seconds / milliseconds)
pub const SMP_RSP_TIMEOUT: u64 = 30;
pub const SMP_DELAYED_AUTH_TIMEOUT_MS: u64 = 500;

// Key derivation identifiers, little-endian as fed to h6/h7
pub const SMP_KEYID_TMP1: [u8; 4] = *b"1pmt";
pub const SMP_KEYID_TMP2: [u8; 4] = *b"2pmt";
pub const SMP_KEYID_LEBR: [u8; 4] = *b"rbel";
pub const SMP_KEYID_BRLE: [u8; 4] = *b"elrb";
