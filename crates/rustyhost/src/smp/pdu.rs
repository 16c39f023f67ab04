//! SMP command encoding and validated decoding

use super::constants::*;
use super::types::*;
use crate::codec::{CodecError, PduReader, PduWriter};
use crate::gap::BdAddr;
use thiserror::Error;

/// Reasons an inbound SMP frame is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SmpPduError {
    #[error("empty SMP frame")]
    Empty,

    #[error("unknown SMP opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error("SMP opcode {opcode:#04x} with bad length {len}")]
    BadLength { opcode: u8, len: usize },

    #[error("SMP opcode {opcode:#04x} carries an out of range parameter")]
    OutOfRange { opcode: u8, reason: SmpReason },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl SmpPduError {
    /// Pairing Failed reason to answer with, if the frame deserves one
    pub fn reply_reason(&self) -> Option<SmpReason> {
        match self {
            SmpPduError::Empty | SmpPduError::UnknownOpcode(_) => None,
            SmpPduError::BadLength { .. } | SmpPduError::Codec(_) => {
                Some(SmpReason::InvalidParameters)
            }
            SmpPduError::OutOfRange { reason, .. } => Some(*reason),
        }
    }
}

/// One SMP command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmpCommand {
    PairingRequest(PairingParams),
    PairingResponse(PairingParams),
    PairingConfirm([u8; 16]),
    PairingRandom([u8; 16]),
    PairingFailed(SmpReason),
    EncryptionInformation([u8; 16]),
    CentralIdentification { ediv: u16, rand: [u8; 8] },
    IdentityInformation([u8; 16]),
    IdentityAddressInformation { addr_type: u8, address: BdAddr },
    SigningInformation([u8; 16]),
    SecurityRequest(u8),
    PairingPublicKey { x: [u8; 32], y: [u8; 32] },
    PairingDhKeyCheck([u8; 16]),
    KeypressNotification(KeypressNotificationType),
    PairingCommitment([u8; 16]),
}

impl SmpCommand {
    pub fn opcode(&self) -> u8 {
        match self {
            SmpCommand::PairingRequest(_) => SMP_PAIRING_REQUEST,
            SmpCommand::PairingResponse(_) => SMP_PAIRING_RESPONSE,
            SmpCommand::PairingConfirm(_) => SMP_PAIRING_CONFIRM,
            SmpCommand::PairingRandom(_) => SMP_PAIRING_RANDOM,
            SmpCommand::PairingFailed(_) => SMP_PAIRING_FAILED,
            SmpCommand::EncryptionInformation(_) => SMP_ENCRYPTION_INFORMATION,
            SmpCommand::CentralIdentification { .. } => SMP_CENTRAL_IDENTIFICATION,
            SmpCommand::IdentityInformation(_) => SMP_IDENTITY_INFORMATION,
            SmpCommand::IdentityAddressInformation { .. } => SMP_IDENTITY_ADDRESS_INFORMATION,
            SmpCommand::SigningInformation(_) => SMP_SIGNING_INFORMATION,
            SmpCommand::SecurityRequest(_) => SMP_SECURITY_REQUEST,
            SmpCommand::PairingPublicKey { .. } => SMP_PAIRING_PUBLIC_KEY,
            SmpCommand::PairingDhKeyCheck(_) => SMP_PAIRING_DHK_CHECK,
            SmpCommand::KeypressNotification(_) => SMP_PAIRING_KEYPRESS_NOTIFICATION,
            SmpCommand::PairingCommitment(_) => SMP_PAIRING_COMMITMENT,
        }
    }

    /// Decode one frame, checking its length against the opcode table and
    /// the ranged fields of the pairing and keypress commands
    pub fn parse(data: &[u8]) -> Result<Self, SmpPduError> {
        let opcode = *data.first().ok_or(SmpPduError::Empty)?;
        if !(SMP_OPCODE_MIN..=SMP_OPCODE_MAX).contains(&opcode) {
            return Err(SmpPduError::UnknownOpcode(opcode));
        }
        if data.len() != SMP_FRAME_SIZES[opcode as usize] {
            return Err(SmpPduError::BadLength {
                opcode,
                len: data.len(),
            });
        }

        let mut reader = PduReader::new(&data[1..]);
        let command = match opcode {
            SMP_PAIRING_REQUEST => SmpCommand::PairingRequest(parse_params(opcode, &mut reader)?),
            SMP_PAIRING_RESPONSE => SmpCommand::PairingResponse(parse_params(opcode, &mut reader)?),
            SMP_PAIRING_CONFIRM => SmpCommand::PairingConfirm(reader.read_array()?),
            SMP_PAIRING_RANDOM => SmpCommand::PairingRandom(reader.read_array()?),
            SMP_PAIRING_FAILED => SmpCommand::PairingFailed(SmpReason::from_u8(reader.read_u8()?)),
            SMP_ENCRYPTION_INFORMATION => SmpCommand::EncryptionInformation(reader.read_array()?),
            SMP_CENTRAL_IDENTIFICATION => SmpCommand::CentralIdentification {
                ediv: reader.read_u16()?,
                rand: reader.read_array()?,
            },
            SMP_IDENTITY_INFORMATION => SmpCommand::IdentityInformation(reader.read_array()?),
            SMP_IDENTITY_ADDRESS_INFORMATION => SmpCommand::IdentityAddressInformation {
                addr_type: reader.read_u8()?,
                address: BdAddr::new(reader.read_array()?),
            },
            SMP_SIGNING_INFORMATION => SmpCommand::SigningInformation(reader.read_array()?),
            SMP_SECURITY_REQUEST => SmpCommand::SecurityRequest(reader.read_u8()?),
            SMP_PAIRING_PUBLIC_KEY => SmpCommand::PairingPublicKey {
                x: reader.read_array()?,
                y: reader.read_array()?,
            },
            SMP_PAIRING_DHK_CHECK => SmpCommand::PairingDhKeyCheck(reader.read_array()?),
            SMP_PAIRING_KEYPRESS_NOTIFICATION => {
                let value = reader.read_u8()?;
                let notification = KeypressNotificationType::from_u8(value).ok_or(
                    SmpPduError::OutOfRange {
                        opcode,
                        reason: SmpReason::InvalidParameters,
                    },
                )?;
                SmpCommand::KeypressNotification(notification)
            }
            _ => SmpCommand::PairingCommitment(reader.read_array()?),
        };
        Ok(command)
    }

    /// Encode into a frame, opcode first
    pub fn to_bytes(&self) -> Vec<u8> {
        let writer = PduWriter::with_opcode(self.opcode());
        let writer = match self {
            SmpCommand::PairingRequest(params) | SmpCommand::PairingResponse(params) => writer
                .u8(params.io_capability.to_u8())
                .u8(if params.oob_data_present {
                    SMP_OOB_PRESENT
                } else {
                    SMP_OOB_NOT_PRESENT
                })
                .u8(params.auth_req)
                .u8(params.max_key_size)
                .u8(params.initiator_key_dist)
                .u8(params.responder_key_dist),
            SmpCommand::PairingConfirm(value)
            | SmpCommand::PairingRandom(value)
            | SmpCommand::EncryptionInformation(value)
            | SmpCommand::IdentityInformation(value)
            | SmpCommand::SigningInformation(value)
            | SmpCommand::PairingDhKeyCheck(value)
            | SmpCommand::PairingCommitment(value) => writer.bytes(value),
            SmpCommand::PairingFailed(reason) => writer.u8(reason.to_u8()),
            SmpCommand::CentralIdentification { ediv, rand } => writer.u16(*ediv).bytes(rand),
            SmpCommand::IdentityAddressInformation { addr_type, address } => {
                writer.u8(*addr_type).bytes(address.as_slice())
            }
            SmpCommand::SecurityRequest(auth_req) => writer.u8(*auth_req),
            SmpCommand::PairingPublicKey { x, y } => writer.bytes(x).bytes(y),
            SmpCommand::KeypressNotification(notification) => writer.u8(notification.to_u8()),
        };
        writer.finish()
    }
}

fn parse_params(opcode: u8, reader: &mut PduReader<'_>) -> Result<PairingParams, SmpPduError> {
    let invalid = SmpPduError::OutOfRange {
        opcode,
        reason: SmpReason::InvalidParameters,
    };

    let io_capability = IoCapability::from_u8(reader.read_u8()?).ok_or(invalid.clone())?;
    let oob = reader.read_u8()?;
    if oob > SMP_OOB_PRESENT {
        return Err(invalid);
    }
    let auth_req = reader.read_u8()?;
    if auth_req & SMP_AUTH_REQ_BONDING_MASK > SMP_AUTH_REQ_BONDING {
        return Err(invalid);
    }
    let max_key_size = reader.read_u8()?;
    if !(SMP_MIN_ENCRYPTION_KEY_SIZE..=SMP_MAX_ENCRYPTION_KEY_SIZE).contains(&max_key_size) {
        return Err(SmpPduError::OutOfRange {
            opcode,
            reason: SmpReason::EncryptionKeySize,
        });
    }

    Ok(PairingParams {
        io_capability,
        oob_data_present: oob == SMP_OOB_PRESENT,
        auth_req,
        max_key_size,
        initiator_key_dist: reader.read_u8()? & SMP_KEY_DIST_MASK,
        responder_key_dist: reader.read_u8()? & SMP_KEY_DIST_MASK,
    })
}
