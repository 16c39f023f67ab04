//! Type definitions for the Security Manager Protocol
use super::constants::*;
use crate::bearer::BearerId;
use crate::gap::{AddressType, AddressWithType, BdAddr, Transport};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// SMP API errors
///
/// These are returned to the caller of an API function and have no side
/// effects. Failures of an in-flight pairing are reported through
/// [`SmpEvent::PairingComplete`] instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SmpError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("No SMP link to {0}")]
    NoLink(BdAddr),

    #[error("Pairing with {0} already in progress")]
    AlreadyPairing(BdAddr),

    #[error("No pairing in progress with {0}")]
    NotPairing(BdAddr),

    #[error("Invalid state for operation")]
    InvalidState,

    #[error("Link is in the {0:?} role")]
    WrongRole(PairingRole),

    #[error("Cryptographic error: {0}")]
    CryptoError(String),

    #[error("Key storage error: {0}")]
    StorageError(String),
}

/// Result type for SMP operations
pub type SmpResult<T> = Result<T, SmpError>;

/// IO Capability types for pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCapability {
    /// Display only capability
    DisplayOnly,
    /// Display with yes/no capability
    DisplayYesNo,
    /// Keyboard only
    KeyboardOnly,
    /// No input, no output
    NoInputNoOutput,
    /// Both keyboard and display
    KeyboardDisplay,
}

impl IoCapability {
    /// Convert to u8 value for protocol
    pub fn to_u8(&self) -> u8 {
        match self {
            IoCapability::DisplayOnly => SMP_IO_CAPABILITY_DISPLAY_ONLY,
            IoCapability::DisplayYesNo => SMP_IO_CAPABILITY_DISPLAY_YES_NO,
            IoCapability::KeyboardOnly => SMP_IO_CAPABILITY_KEYBOARD_ONLY,
            IoCapability::NoInputNoOutput => SMP_IO_CAPABILITY_NO_INPUT_NO_OUTPUT,
            IoCapability::KeyboardDisplay => SMP_IO_CAPABILITY_KEYBOARD_DISPLAY,
        }
    }

    /// Convert from u8 value from protocol
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            SMP_IO_CAPABILITY_DISPLAY_ONLY => Some(IoCapability::DisplayOnly),
            SMP_IO_CAPABILITY_DISPLAY_YES_NO => Some(IoCapability::DisplayYesNo),
            SMP_IO_CAPABILITY_KEYBOARD_ONLY => Some(IoCapability::KeyboardOnly),
            SMP_IO_CAPABILITY_NO_INPUT_NO_OUTPUT => Some(IoCapability::NoInputNoOutput),
            SMP_IO_CAPABILITY_KEYBOARD_DISPLAY => Some(IoCapability::KeyboardDisplay),
            _ => None,
        }
    }
}

impl fmt::Display for IoCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoCapability::DisplayOnly => write!(f, "Display Only"),
            IoCapability::DisplayYesNo => write!(f, "Display Yes/No"),
            IoCapability::KeyboardOnly => write!(f, "Keyboard Only"),
            IoCapability::NoInputNoOutput => write!(f, "No Input No Output"),
            IoCapability::KeyboardDisplay => write!(f, "Keyboard Display"),
        }
    }
}

/// Authentication requirements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthRequirements {
    /// Whether bonding is required
    pub bonding: bool,
    /// Whether MITM protection is required
    pub mitm: bool,
    /// Whether Secure Connections is supported
    pub secure_connections: bool,
    /// Whether keypress notifications are supported
    pub keypress_notifications: bool,
    /// Whether h7 may be used for cross-transport derivation
    pub ct2: bool,
}

impl AuthRequirements {
    /// Create new authentication requirements
    pub fn new(bonding: bool, mitm: bool, secure_connections: bool) -> Self {
        Self {
            bonding,
            mitm,
            secure_connections,
            keypress_notifications: false,
            ct2: false,
        }
    }

    /// Bonding with MITM protection over Secure Connections
    pub fn secure() -> Self {
        Self {
            bonding: true,
            mitm: true,
            secure_connections: true,
            keypress_notifications: false,
            ct2: true,
        }
    }

    /// Convert to u8 value for protocol
    pub fn to_u8(&self) -> u8 {
        let mut value = 0;

        if self.bonding {
            value |= SMP_AUTH_REQ_BONDING;
        }

        if self.mitm {
            value |= SMP_AUTH_REQ_MITM;
        }

        if self.secure_connections {
            value |= SMP_AUTH_REQ_SC;
        }

        if self.keypress_notifications {
            value |= SMP_AUTH_REQ_KEYPRESS;
        }

        if self.ct2 {
            value |= SMP_AUTH_REQ_CT2;
        }

        value
    }

    /// Convert from u8 value from protocol
    pub fn from_u8(value: u8) -> Self {
        Self {
            bonding: (value & SMP_AUTH_REQ_BONDING_MASK) == SMP_AUTH_REQ_BONDING,
            mitm: (value & SMP_AUTH_REQ_MITM) != 0,
            secure_connections: (value & SMP_AUTH_REQ_SC) != 0,
            keypress_notifications: (value & SMP_AUTH_REQ_KEYPRESS) != 0,
            ct2: (value & SMP_AUTH_REQ_CT2) != 0,
        }
    }
}

impl Default for AuthRequirements {
    /// Bonding enabled, others disabled
    fn default() -> Self {
        Self::new(true, false, false)
    }
}

/// Key distribution preferences
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDistribution {
    /// Encryption key (LTK, EDIV, RAND)
    pub encryption_key: bool,
    /// Identity key (IRK, identity address)
    pub identity_key: bool,
    /// Signing key (CSRK)
    pub signing_key: bool,
    /// Link key derivation
    pub link_key: bool,
}

impl KeyDistribution {
    /// Create new key distribution preferences
    pub fn new(encryption_key: bool, identity_key: bool, signing_key: bool, link_key: bool) -> Self {
        Self {
            encryption_key,
            identity_key,
            signing_key,
            link_key,
        }
    }

    /// Every distributable LE key
    pub fn all() -> Self {
        Self::new(true, true, true, false)
    }

    /// Create with all keys disabled
    pub fn none() -> Self {
        Self::new(false, false, false, false)
    }

    /// Convert to u8 value for protocol
    pub fn to_u8(&self) -> u8 {
        let mut value = 0;

        if self.encryption_key {
            value |= SMP_KEY_DIST_ENC_KEY;
        }

        if self.identity_key {
            value |= SMP_KEY_DIST_ID_KEY;
        }

        if self.signing_key {
            value |= SMP_KEY_DIST_SIGN_KEY;
        }

        if self.link_key {
            value |= SMP_KEY_DIST_LINK_KEY;
        }

        value
    }

    /// Convert from u8 value from protocol
    pub fn from_u8(value: u8) -> Self {
        Self {
            encryption_key: (value & SMP_KEY_DIST_ENC_KEY) != 0,
            identity_key: (value & SMP_KEY_DIST_ID_KEY) != 0,
            signing_key: (value & SMP_KEY_DIST_SIGN_KEY) != 0,
            link_key: (value & SMP_KEY_DIST_LINK_KEY) != 0,
        }
    }
}

/// Out-of-band material received about the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OobData {
    /// Legacy pairing temporary key
    Legacy { tk: [u8; 16] },
    /// Secure Connections random value and its confirm value
    /// (c = f4(PKx, PKx, r, 0)), both little-endian
    SecureConnections { r: [u8; 16], c: [u8; 16] },
}

/// Contents of a Pairing Request or Pairing Response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingParams {
    pub io_capability: IoCapability,
    pub oob_data_present: bool,
    /// Raw AuthReq octet; RFU bits are kept so they reach c1 untouched
    pub auth_req: u8,
    /// Maximum encryption key size (7-16)
    pub max_key_size: u8,
    pub initiator_key_dist: u8,
    pub responder_key_dist: u8,
}

impl PairingParams {
    pub fn auth(&self) -> AuthRequirements {
        AuthRequirements::from_u8(self.auth_req)
    }

    pub fn bonding(&self) -> bool {
        self.auth().bonding
    }

    pub fn mitm(&self) -> bool {
        self.auth_req & SMP_AUTH_REQ_MITM != 0
    }

    pub fn secure_connections(&self) -> bool {
        self.auth_req & SMP_AUTH_REQ_SC != 0
    }

    pub fn keypress(&self) -> bool {
        self.auth_req & SMP_AUTH_REQ_KEYPRESS != 0
    }

    pub fn ct2(&self) -> bool {
        self.auth_req & SMP_AUTH_REQ_CT2 != 0
    }

    /// IOcap value as fed to f6: IO capability, OOB flag, AuthReq
    pub fn iocap_triplet(&self) -> [u8; 3] {
        [
            self.io_capability.to_u8(),
            if self.oob_data_present {
                SMP_OOB_PRESENT
            } else {
                SMP_OOB_NOT_PRESENT
            },
            self.auth_req,
        ]
    }
}

/// Local role on the link being paired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairingRole {
    /// Initiator of the pairing
    Central,
    /// Responder to pairing
    Peripheral,
}

/// Pairing Failed reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmpReason {
    PasskeyEntryFailed,
    OobNotAvailable,
    AuthenticationRequirements,
    ConfirmValueFailed,
    PairingNotSupported,
    EncryptionKeySize,
    CommandNotSupported,
    UnspecifiedReason,
    RepeatedAttempts,
    InvalidParameters,
    DhKeyCheckFailed,
    NumericComparisonFailed,
    BrEdrPairingInProgress,
    CrossTransportKeyNotAllowed,
    KeyRejected,
}

impl SmpReason {
    pub fn to_u8(&self) -> u8 {
        match self {
            SmpReason::PasskeyEntryFailed => SMP_REASON_PASSKEY_ENTRY_FAILED,
            SmpReason::OobNotAvailable => SMP_REASON_OOB_NOT_AVAILABLE,
            SmpReason::AuthenticationRequirements => SMP_REASON_AUTHENTICATION_REQUIREMENTS,
            SmpReason::ConfirmValueFailed => SMP_REASON_CONFIRM_VALUE_FAILED,
            SmpReason::PairingNotSupported => SMP_REASON_PAIRING_NOT_SUPPORTED,
            SmpReason::EncryptionKeySize => SMP_REASON_ENCRYPTION_KEY_SIZE,
            SmpReason::CommandNotSupported => SMP_REASON_COMMAND_NOT_SUPPORTED,
            SmpReason::UnspecifiedReason => SMP_REASON_UNSPECIFIED_REASON,
            SmpReason::RepeatedAttempts => SMP_REASON_REPEATED_ATTEMPTS,
            SmpReason::InvalidParameters => SMP_REASON_INVALID_PARAMETERS,
            SmpReason::DhKeyCheckFailed => SMP_REASON_DHKEY_CHECK_FAILED,
            SmpReason::NumericComparisonFailed => SMP_REASON_NUMERIC_COMPARISON_FAILED,
            SmpReason::BrEdrPairingInProgress => SMP_REASON_BR_EDR_PAIRING_IN_PROGRESS,
            SmpReason::CrossTransportKeyNotAllowed => SMP_REASON_CROSS_TRANSPORT_KEY_NOT_ALLOWED,
            SmpReason::KeyRejected => SMP_REASON_KEY_REJECTED,
        }
    }

    /// Unknown codes map to `UnspecifiedReason`
    pub fn from_u8(value: u8) -> Self {
        match value {
            SMP_REASON_PASSKEY_ENTRY_FAILED => SmpReason::PasskeyEntryFailed,
            SMP_REASON_OOB_NOT_AVAILABLE => SmpReason::OobNotAvailable,
            SMP_REASON_AUTHENTICATION_REQUIREMENTS => SmpReason::AuthenticationRequirements,
            SMP_REASON_CONFIRM_VALUE_FAILED => SmpReason::ConfirmValueFailed,
            SMP_REASON_PAIRING_NOT_SUPPORTED => SmpReason::PairingNotSupported,
            SMP_REASON_ENCRYPTION_KEY_SIZE => SmpReason::EncryptionKeySize,
            SMP_REASON_COMMAND_NOT_SUPPORTED => SmpReason::CommandNotSupported,
            SMP_REASON_REPEATED_ATTEMPTS => SmpReason::RepeatedAttempts,
            SMP_REASON_INVALID_PARAMETERS => SmpReason::InvalidParameters,
            SMP_REASON_DHKEY_CHECK_FAILED => SmpReason::DhKeyCheckFailed,
            SMP_REASON_NUMERIC_COMPARISON_FAILED => SmpReason::NumericComparisonFailed,
            SMP_REASON_BR_EDR_PAIRING_IN_PROGRESS => SmpReason::BrEdrPairingInProgress,
            SMP_REASON_CROSS_TRANSPORT_KEY_NOT_ALLOWED => SmpReason::CrossTransportKeyNotAllowed,
            SMP_REASON_KEY_REJECTED => SmpReason::KeyRejected,
            _ => SmpReason::UnspecifiedReason,
        }
    }
}

/// Final outcome of a pairing procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingStatus {
    Success,
    /// Failed locally or by the peer with the given reason
    Failed(SmpReason),
    /// The peer did not answer within the response timeout
    ResponseTimeout,
    /// Cancelled through the API
    UserCancelled,
}

impl PairingStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, PairingStatus::Success)
    }
}

/// Security level for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecurityLevel {
    /// No security (unencrypted)
    None = 0,
    /// Encrypted without MITM protection
    Unauthenticated = 1,
    /// Encrypted with MITM protection
    Authenticated = 2,
    /// Secure Connections with MITM protection
    AuthenticatedSc = 3,
}

impl SecurityLevel {
    /// Check if this security level includes encryption
    pub fn is_encrypted(&self) -> bool {
        *self >= SecurityLevel::Unauthenticated
    }

    /// Check if this security level includes authentication
    pub fn is_authenticated(&self) -> bool {
        *self >= SecurityLevel::Authenticated
    }

    pub fn to_u8(&self) -> u8 {
        *self as u8
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => SecurityLevel::Unauthenticated,
            2 => SecurityLevel::Authenticated,
            3 => SecurityLevel::AuthenticatedSc,
            _ => SecurityLevel::None,
        }
    }
}

/// Keypress notification type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeypressNotificationType {
    /// Entry started
    EntryStarted,
    /// Digit entered
    DigitEntered,
    /// Digit erased
    DigitErased,
    /// Cleared
    Cleared,
    /// Entry completed
    EntryCompleted,
}

impl KeypressNotificationType {
    /// Convert to u8 value for protocol
    pub fn to_u8(&self) -> u8 {
        match self {
            KeypressNotificationType::EntryStarted => SMP_KEYPRESS_ENTRY_STARTED,
            KeypressNotificationType::DigitEntered => SMP_KEYPRESS_DIGIT_ENTERED,
            KeypressNotificationType::DigitErased => SMP_KEYPRESS_DIGIT_ERASED,
            KeypressNotificationType::Cleared => SMP_KEYPRESS_CLEARED,
            KeypressNotificationType::EntryCompleted => SMP_KEYPRESS_ENTRY_COMPLETED,
        }
    }

    /// Convert from u8 value from protocol
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            SMP_KEYPRESS_ENTRY_STARTED => Some(KeypressNotificationType::EntryStarted),
            SMP_KEYPRESS_DIGIT_ENTERED => Some(KeypressNotificationType::DigitEntered),
            SMP_KEYPRESS_DIGIT_ERASED => Some(KeypressNotificationType::DigitErased),
            SMP_KEYPRESS_CLEARED => Some(KeypressNotificationType::Cleared),
            SMP_KEYPRESS_ENTRY_COMPLETED => Some(KeypressNotificationType::EntryCompleted),
            _ => None,
        }
    }
}

/// User answer to a numeric comparison or Just Works consent prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    Accept,
    Reject,
}

/// Events delivered to the upper layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmpEvent {
    /// Show this passkey to the user
    DisplayPasskey { peer: BdAddr, passkey: u32 },
    /// Ask the user for the passkey shown on the peer
    PasskeyRequest { peer: BdAddr },
    /// Ask the user whether both devices show this value
    NumericComparison { peer: BdAddr, value: u32 },
    /// Out-of-band data for the peer is required
    OobRequest { peer: BdAddr },
    /// Peer reported progress of its passkey entry
    Keypress {
        peer: BdAddr,
        notification: KeypressNotificationType,
    },
    /// Central only: enable link encryption with this key, then report
    /// back through `on_encryption_changed`
    StartEncryption {
        peer: BdAddr,
        ltk: [u8; 16],
        ediv: u16,
        rand: [u8; 8],
        key_size: u8,
    },
    /// Terminal outcome of a pairing
    PairingComplete {
        peer: BdAddr,
        status: PairingStatus,
        sec_level: SecurityLevel,
        smp_over_br: bool,
    },
}

/// Type for SMP event callback
pub type SmpEventCallback = Arc<Mutex<dyn FnMut(SmpEvent) + Send>>;

/// Pairing control block state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmpState {
    Idle,
    /// Peripheral sent Security Request and waits for Pairing Request
    SecReqSent,
    PairReqSent,
    PairReqRecvd,
    PublicKeyExchange,
    CommitmentExchange,
    NonceExchange,
    DhKeyCheck,
    EncryptionPending,
    BondPending,
    /// Pairing finished; waiting out the delayed-auth window
    Complete,
}

/// Description of the link SMP runs on, supplied by the lower layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmpLink {
    pub bearer: BearerId,
    pub transport: Transport,
    pub role: PairingRole,
    pub local: AddressWithType,
    pub peer: AddressWithType,
}

/// SMP address type octet for an address
pub fn smp_address_type(addr: &AddressWithType) -> u8 {
    match addr.address_type {
        AddressType::Random | AddressType::RandomIdentity => SMP_ADDR_TYPE_RANDOM,
        _ => SMP_ADDR_TYPE_PUBLIC,
    }
}

/// SMP configuration
#[derive(Debug, Clone)]
pub struct SmpConfig {
    pub io_capability: IoCapability,
    pub auth_req: AuthRequirements,
    /// Refuse pairings that cannot reach Secure Connections
    pub sc_only: bool,
    pub max_key_size: u8,
    pub min_key_size: u8,
    pub initiator_key_dist: KeyDistribution,
    pub responder_key_dist: KeyDistribution,
    /// Local identity resolving key distributed to bonded peers
    pub local_irk: [u8; 16],
    /// Identity address distributed with the IRK; link address when unset
    pub identity_address: Option<AddressWithType>,
    pub response_timeout: Duration,
    pub delayed_auth_timeout: Duration,
}

impl Default for SmpConfig {
    fn default() -> Self {
        Self {
            io_capability: IoCapability::NoInputNoOutput,
            auth_req: AuthRequirements::default(),
            sc_only: false,
            max_key_size: SMP_MAX_ENCRYPTION_KEY_SIZE,
            min_key_size: SMP_MIN_ENCRYPTION_KEY_SIZE,
            initiator_key_dist: KeyDistribution::all(),
            responder_key_dist: KeyDistribution::all(),
            local_irk: rand::random(),
            identity_address: None,
            response_timeout: Duration::from_secs(SMP_RSP_TIMEOUT),
            delayed_auth_timeout: Duration::from_millis(SMP_DELAYED_AUTH_TIMEOUT_MS),
        }
    }
}
