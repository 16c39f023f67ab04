//! Association model selection

use super::types::*;
use std::fmt;

/// What the local user does during passkey entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasskeyAction {
    Display,
    Input,
}

/// Association model, from the local device's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingModel {
    /// Legacy Just Works
    EncryptionOnly,
    LegacyPasskey(PasskeyAction),
    LegacyOob,
    ScJustWorks,
    ScNumericComparison,
    ScPasskey(PasskeyAction),
    ScOob,
}

impl PairingModel {
    pub fn is_secure_connections(&self) -> bool {
        matches!(
            self,
            PairingModel::ScJustWorks
                | PairingModel::ScNumericComparison
                | PairingModel::ScPasskey(_)
                | PairingModel::ScOob
        )
    }

    pub fn is_passkey(&self) -> bool {
        matches!(self, PairingModel::LegacyPasskey(_) | PairingModel::ScPasskey(_))
    }

    /// Security level a successful pairing with this model reaches
    pub fn security_level(&self) -> SecurityLevel {
        match self {
            PairingModel::EncryptionOnly | PairingModel::ScJustWorks => {
                SecurityLevel::Unauthenticated
            }
            PairingModel::LegacyPasskey(_) | PairingModel::LegacyOob => {
                SecurityLevel::Authenticated
            }
            PairingModel::ScNumericComparison | PairingModel::ScPasskey(_) | PairingModel::ScOob => {
                SecurityLevel::AuthenticatedSc
            }
        }
    }
}

impl fmt::Display for PairingModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingModel::EncryptionOnly => write!(f, "Just Works"),
            PairingModel::LegacyPasskey(PasskeyAction::Display) => write!(f, "Passkey Display"),
            PairingModel::LegacyPasskey(PasskeyAction::Input) => write!(f, "Passkey Entry"),
            PairingModel::LegacyOob => write!(f, "Out of Band"),
            PairingModel::ScJustWorks => write!(f, "SC Just Works"),
            PairingModel::ScNumericComparison => write!(f, "SC Numeric Comparison"),
            PairingModel::ScPasskey(PasskeyAction::Display) => write!(f, "SC Passkey Display"),
            PairingModel::ScPasskey(PasskeyAction::Input) => write!(f, "SC Passkey Entry"),
            PairingModel::ScOob => write!(f, "SC Out of Band"),
        }
    }
}

/// Outcome of the IO capability table, seen from the central
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IoMethod {
    JustWorks,
    /// Numeric comparison under Secure Connections, Just Works otherwise
    NumericComparison,
    /// Numeric comparison under Secure Connections, passkey otherwise
    NumericOrPasskey {
        central: PasskeyAction,
        peripheral: PasskeyAction,
    },
    Passkey {
        central: PasskeyAction,
        peripheral: PasskeyAction,
    },
}

fn io_method(central: IoCapability, peripheral: IoCapability) -> IoMethod {
    use IoCapability::*;
    use PasskeyAction::*;

    let central_inputs = IoMethod::Passkey {
        central: Input,
        peripheral: Display,
    };
    let central_displays = IoMethod::Passkey {
        central: Display,
        peripheral: Input,
    };

    match (peripheral, central) {
        (NoInputNoOutput, _) | (_, NoInputNoOutput) => IoMethod::JustWorks,
        (DisplayOnly, KeyboardOnly) | (DisplayOnly, KeyboardDisplay) => central_inputs,
        (DisplayOnly, _) => IoMethod::JustWorks,
        (DisplayYesNo, DisplayYesNo) => IoMethod::NumericComparison,
        (DisplayYesNo, KeyboardOnly) => central_inputs,
        (DisplayYesNo, KeyboardDisplay) => IoMethod::NumericOrPasskey {
            central: Input,
            peripheral: Display,
        },
        (DisplayYesNo, _) => IoMethod::JustWorks,
        (KeyboardOnly, KeyboardOnly) => IoMethod::Passkey {
            central: Input,
            peripheral: Input,
        },
        (KeyboardOnly, _) => central_displays,
        (KeyboardDisplay, KeyboardOnly) => central_inputs,
        (KeyboardDisplay, DisplayOnly) => central_displays,
        (KeyboardDisplay, _) => IoMethod::NumericOrPasskey {
            central: Display,
            peripheral: Input,
        },
    }
}

/// Select the association model from both feature sets
///
/// `central` and `peripheral` are the Pairing Request and Pairing Response
/// contents; `local_role` picks which side of a passkey model we are.
pub fn select_model(
    central: &PairingParams,
    peripheral: &PairingParams,
    local_role: PairingRole,
) -> PairingModel {
    let secure = central.secure_connections() && peripheral.secure_connections();
    let local_action = |central_action: PasskeyAction, peripheral_action: PasskeyAction| {
        match local_role {
            PairingRole::Central => central_action,
            PairingRole::Peripheral => peripheral_action,
        }
    };

    if secure {
        if central.oob_data_present || peripheral.oob_data_present {
            return PairingModel::ScOob;
        }
        if !central.mitm() && !peripheral.mitm() {
            return PairingModel::ScJustWorks;
        }
        match io_method(central.io_capability, peripheral.io_capability) {
            IoMethod::JustWorks => PairingModel::ScJustWorks,
            IoMethod::NumericComparison | IoMethod::NumericOrPasskey { .. } => {
                PairingModel::ScNumericComparison
            }
            IoMethod::Passkey {
                central,
                peripheral,
            } => PairingModel::ScPasskey(local_action(central, peripheral)),
        }
    } else {
        if central.oob_data_present || peripheral.oob_data_present {
            return PairingModel::LegacyOob;
        }
        if !central.mitm() && !peripheral.mitm() {
            return PairingModel::EncryptionOnly;
        }
        match io_method(central.io_capability, peripheral.io_capability) {
            IoMethod::JustWorks | IoMethod::NumericComparison => PairingModel::EncryptionOnly,
            IoMethod::NumericOrPasskey {
                central,
                peripheral,
            }
            | IoMethod::Passkey {
                central,
                peripheral,
            } => PairingModel::LegacyPasskey(local_action(central, peripheral)),
        }
    }
}
