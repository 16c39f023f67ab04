//! RFCOMM frame and multiplexer command codec
//!
//! Frames are TS 07.10 basic-option frames: address, control, one or two
//! length octets, an optional credit octet and the FCS. Multiplexer
//! commands travel as UIH payloads on DLCI 0.

use super::constants::*;
use super::types::PortSettings;
use crate::codec::{CodecError, PduReader, PduWriter};
use thiserror::Error;

/// Reasons a received frame is discarded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame too short ({0} bytes)")]
    TooShort(usize),

    #[error("address octet {0:#04x} lacks the EA bit")]
    BadAddress(u8),

    #[error("DLCI {0} out of range")]
    InvalidDlci(u8),

    #[error("unknown control field {0:#04x}")]
    UnknownControl(u8),

    #[error("declared length {declared} does not match payload of {actual} bytes")]
    BadLength { declared: usize, actual: usize },

    #[error("FCS mismatch")]
    BadFcs,

    #[error("malformed multiplexer command: {0}")]
    BadCommand(#[from] CodecError),
}

const fn build_crc_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x01 != 0 {
                (crc >> 1) ^ 0xE0
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Reflected CRC-8 (x^8 + x^2 + x + 1) lookup table
static CRC_TABLE: [u8; 256] = build_crc_table();

fn crc_fold(data: &[u8]) -> u8 {
    data.iter()
        .fold(0xFF, |fcs, b| CRC_TABLE[(fcs ^ b) as usize])
}

/// FCS to transmit after `header`
pub fn calc_fcs(header: &[u8]) -> u8 {
    0xFF - crc_fold(header)
}

/// Whether `fcs` matches `header`
pub fn check_fcs(header: &[u8], fcs: u8) -> bool {
    CRC_TABLE[(crc_fold(header) ^ fcs) as usize] == RFCOMM_FCS_GOOD
}

/// Frame kind from the control field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Sabme,
    Ua,
    Dm,
    Disc,
    Uih,
}

impl FrameType {
    pub fn to_u8(&self) -> u8 {
        match self {
            FrameType::Sabme => RFCOMM_SABME,
            FrameType::Ua => RFCOMM_UA,
            FrameType::Dm => RFCOMM_DM,
            FrameType::Disc => RFCOMM_DISC,
            FrameType::Uih => RFCOMM_UIH,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            RFCOMM_SABME => Some(FrameType::Sabme),
            RFCOMM_UA => Some(FrameType::Ua),
            RFCOMM_DM => Some(FrameType::Dm),
            RFCOMM_DISC => Some(FrameType::Disc),
            RFCOMM_UIH => Some(FrameType::Uih),
            _ => None,
        }
    }
}

/// One RFCOMM frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RfcommFrame {
    pub dlci: u8,
    /// Command/response bit of the address octet
    pub cr: bool,
    pub frame_type: FrameType,
    /// Poll/final bit
    pub pf: bool,
    /// Credits piggybacked on a UIH frame with P/F set
    pub credits: Option<u8>,
    pub info: Vec<u8>,
}

impl RfcommFrame {
    pub fn sabme(dlci: u8, cr: bool) -> Self {
        Self::control(dlci, cr, FrameType::Sabme)
    }

    pub fn ua(dlci: u8, cr: bool) -> Self {
        Self::control(dlci, cr, FrameType::Ua)
    }

    pub fn dm(dlci: u8, cr: bool) -> Self {
        Self::control(dlci, cr, FrameType::Dm)
    }

    pub fn disc(dlci: u8, cr: bool) -> Self {
        Self::control(dlci, cr, FrameType::Disc)
    }

    fn control(dlci: u8, cr: bool, frame_type: FrameType) -> Self {
        Self {
            dlci,
            cr,
            frame_type,
            pf: true,
            credits: None,
            info: Vec::new(),
        }
    }

    /// UIH frame, optionally carrying credits for the peer
    pub fn uih(dlci: u8, cr: bool, info: Vec<u8>, credits: Option<u8>) -> Self {
        Self {
            dlci,
            cr,
            frame_type: FrameType::Uih,
            pf: credits.is_some(),
            credits,
            info,
        }
    }

    /// Parse a frame received on the L2CAP channel.
    ///
    /// `credit_flow` tells whether a UIH frame with P/F set on a data DLCI
    /// carries a credit octet.
    pub fn parse(data: &[u8], credit_flow: bool) -> Result<Self, FrameError> {
        if data.len() < 4 {
            return Err(FrameError::TooShort(data.len()));
        }

        let address = data[0];
        if address & RFCOMM_EA == 0 {
            return Err(FrameError::BadAddress(address));
        }
        let dlci = address >> RFCOMM_SHIFT_DLCI;
        if dlci > RFCOMM_MAX_DLCI {
            return Err(FrameError::InvalidDlci(dlci));
        }
        let cr = address & RFCOMM_CR_MASK != 0;

        let control = data[1];
        let pf = control & RFCOMM_PF != 0;
        let frame_type =
            FrameType::from_u8(control & !RFCOMM_PF).ok_or(FrameError::UnknownControl(control))?;

        let (declared, mut offset) = if data[2] & RFCOMM_EA != 0 {
            ((data[2] >> 1) as usize, 3)
        } else {
            if data.len() < 5 {
                return Err(FrameError::TooShort(data.len()));
            }
            (((data[2] >> 1) as usize) | ((data[3] as usize) << 7), 4)
        };

        let fcs = data[data.len() - 1];
        let covered = if frame_type == FrameType::Uih {
            &data[..2]
        } else {
            &data[..offset]
        };
        if !check_fcs(covered, fcs) {
            return Err(FrameError::BadFcs);
        }

        let mut credits = None;
        if frame_type == FrameType::Uih && pf && credit_flow && dlci != RFCOMM_MX_DLCI {
            if offset >= data.len() - 1 {
                return Err(FrameError::TooShort(data.len()));
            }
            credits = Some(data[offset]);
            offset += 1;
        }

        if offset > data.len() - 1 {
            return Err(FrameError::TooShort(data.len()));
        }
        let info = &data[offset..data.len() - 1];
        if info.len() != declared {
            return Err(FrameError::BadLength {
                declared,
                actual: info.len(),
            });
        }

        Ok(Self {
            dlci,
            cr,
            frame_type,
            pf,
            credits,
            info: info.to_vec(),
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.info.len() + 6);
        let mut address = RFCOMM_EA | (self.dlci << RFCOMM_SHIFT_DLCI);
        if self.cr {
            address |= RFCOMM_CR_MASK;
        }
        out.push(address);

        let mut control = self.frame_type.to_u8();
        if self.pf {
            control |= RFCOMM_PF;
        }
        out.push(control);

        let len = self.info.len();
        if len <= 127 {
            out.push(((len as u8) << 1) | RFCOMM_EA);
        } else {
            out.push((len << 1) as u8);
            out.push((len >> 7) as u8);
        }
        let header_len = out.len();

        if let Some(credits) = self.credits {
            out.push(credits);
        }
        out.extend_from_slice(&self.info);

        let fcs = if self.frame_type == FrameType::Uih {
            calc_fcs(&out[..2])
        } else {
            calc_fcs(&out[..header_len])
        };
        out.push(fcs);
        out
    }
}

/// Parameter negotiation values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PnParams {
    pub dlci: u8,
    /// Convergence layer, upper nibble of the second octet
    pub cl: u8,
    pub priority: u8,
    pub t1: u8,
    pub mtu: u16,
    pub n2: u8,
    /// Window size, or initial credits under credit-based flow control
    pub k: u8,
}

/// Multiplexer control command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxCommand {
    Pn(PnParams),
    Psc,
    Cld,
    Test(Vec<u8>),
    Fcon,
    Fcoff,
    Msc {
        dlci: u8,
        /// Raw signal octet
        signals: u8,
        /// Break length in 200 ms units when a break is signalled
        break_duration: Option<u8>,
    },
    /// Reply to a command type the receiver does not know
    Nsc { command_type: u8 },
    Rpn {
        dlci: u8,
        /// `None` for a query
        settings: Option<(PortSettings, u16)>,
    },
    Rls { dlci: u8, status: u8 },
    /// Command type not understood here
    Unknown(u8),
}

impl MuxCommand {
    fn type_code(&self) -> u8 {
        match self {
            MuxCommand::Pn(_) => RFCOMM_MX_PN,
            MuxCommand::Psc => RFCOMM_MX_PSC,
            MuxCommand::Cld => RFCOMM_MX_CLD,
            MuxCommand::Test(_) => RFCOMM_MX_TEST,
            MuxCommand::Fcon => RFCOMM_MX_FCON,
            MuxCommand::Fcoff => RFCOMM_MX_FCOFF,
            MuxCommand::Msc { .. } => RFCOMM_MX_MSC,
            MuxCommand::Nsc { .. } => RFCOMM_MX_NSC,
            MuxCommand::Rpn { .. } => RFCOMM_MX_RPN,
            MuxCommand::Rls { .. } => RFCOMM_MX_RLS,
            MuxCommand::Unknown(code) => *code & RFCOMM_MX_TYPE_MASK,
        }
    }
}

/// A multiplexer command or response as carried on DLCI 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxFrame {
    pub is_command: bool,
    pub command: MuxCommand,
}

fn dlci_octet(dlci: u8) -> u8 {
    (dlci << RFCOMM_SHIFT_DLCI) | RFCOMM_CR_MASK | RFCOMM_EA
}

fn encode_settings(settings: &PortSettings) -> (u8, u8) {
    let format = (settings.data_bits & 0x03)
        | ((settings.stop_bits & 0x01) << 2)
        | ((settings.parity & 0x01) << 3)
        | ((settings.parity_type & 0x03) << 4);
    (settings.baud_rate, format)
}

impl MuxFrame {
    pub fn command(command: MuxCommand) -> Self {
        Self {
            is_command: true,
            command,
        }
    }

    pub fn response(command: MuxCommand) -> Self {
        Self {
            is_command: false,
            command,
        }
    }

    /// Parse the info field of a UIH frame received on DLCI 0
    pub fn parse(info: &[u8]) -> Result<Self, FrameError> {
        let mut reader = PduReader::new(info);
        let type_octet = reader.read_u8()?;
        let is_command = type_octet & RFCOMM_CR_MASK != 0;

        let first = reader.read_u8()?;
        let len = if first & RFCOMM_EA != 0 {
            (first >> 1) as usize
        } else {
            ((first >> 1) as usize) | ((reader.read_u8()? as usize) << 7)
        };
        let values = reader.read_slice(len)?;
        let mut values = PduReader::new(values);

        let command = match type_octet & RFCOMM_MX_TYPE_MASK {
            RFCOMM_MX_PN => {
                expect_len(len, RFCOMM_MX_PN_LEN)?;
                MuxCommand::Pn(PnParams {
                    dlci: values.read_u8()? & 0x3F,
                    cl: values.read_u8()? & 0xF0,
                    priority: values.read_u8()? & 0x3F,
                    t1: values.read_u8()?,
                    mtu: values.read_u16()?,
                    n2: values.read_u8()?,
                    k: values.read_u8()? & 0x07,
                })
            }
            RFCOMM_MX_MSC => {
                if len != RFCOMM_MX_MSC_LEN_NO_BREAK && len != RFCOMM_MX_MSC_LEN_WITH_BREAK {
                    return Err(FrameError::BadCommand(CodecError::Oversize {
                        len,
                        limit: RFCOMM_MX_MSC_LEN_WITH_BREAK,
                    }));
                }
                let dlci = values.read_u8()? >> RFCOMM_SHIFT_DLCI;
                let signals = values.read_u8()?;
                let mut break_duration = None;
                if len == RFCOMM_MX_MSC_LEN_WITH_BREAK {
                    let brk = values.read_u8()?;
                    if brk & MSC_BREAK != 0 {
                        break_duration = Some(brk >> MSC_BREAK_SHIFT);
                    }
                }
                MuxCommand::Msc {
                    dlci,
                    signals,
                    break_duration,
                }
            }
            RFCOMM_MX_RPN => {
                let dlci = values.read_u8()? >> RFCOMM_SHIFT_DLCI;
                if len == RFCOMM_MX_RPN_REQ_LEN {
                    MuxCommand::Rpn {
                        dlci,
                        settings: None,
                    }
                } else {
                    expect_len(len, RFCOMM_MX_RPN_LEN)?;
                    let baud_rate = values.read_u8()?;
                    let format = values.read_u8()?;
                    let fc_type = values.read_u8()? & 0x3F;
                    let xon_char = values.read_u8()?;
                    let xoff_char = values.read_u8()?;
                    let mask = values.read_u16()?;
                    let settings = PortSettings {
                        baud_rate,
                        data_bits: format & 0x03,
                        stop_bits: (format >> 2) & 0x01,
                        parity: (format >> 3) & 0x01,
                        parity_type: (format >> 4) & 0x03,
                        fc_type,
                        xon_char,
                        xoff_char,
                        rx_char1: None,
                    };
                    MuxCommand::Rpn {
                        dlci,
                        settings: Some((settings, mask)),
                    }
                }
            }
            RFCOMM_MX_RLS => {
                expect_len(len, RFCOMM_MX_RLS_LEN)?;
                MuxCommand::Rls {
                    dlci: values.read_u8()? >> RFCOMM_SHIFT_DLCI,
                    status: values.read_u8()?,
                }
            }
            RFCOMM_MX_NSC => {
                expect_len(len, RFCOMM_MX_NSC_LEN)?;
                MuxCommand::Nsc {
                    command_type: values.read_u8()?,
                }
            }
            RFCOMM_MX_TEST => MuxCommand::Test(values.rest().to_vec()),
            RFCOMM_MX_FCON => MuxCommand::Fcon,
            RFCOMM_MX_FCOFF => MuxCommand::Fcoff,
            RFCOMM_MX_PSC => MuxCommand::Psc,
            RFCOMM_MX_CLD => MuxCommand::Cld,
            _ => MuxCommand::Unknown(type_octet),
        };

        Ok(Self {
            is_command,
            command,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let values = match &self.command {
            MuxCommand::Pn(pn) => PduWriter::new()
                .u8(pn.dlci)
                .u8(pn.cl)
                .u8(pn.priority)
                .u8(pn.t1)
                .u16(pn.mtu)
                .u8(pn.n2)
                .u8(pn.k)
                .finish(),
            MuxCommand::Msc {
                dlci,
                signals,
                break_duration,
            } => {
                let writer = PduWriter::new().u8(dlci_octet(*dlci)).u8(*signals);
                match break_duration {
                    Some(duration) => writer
                        .u8(RFCOMM_EA | MSC_BREAK | (duration << MSC_BREAK_SHIFT))
                        .finish(),
                    None => writer.finish(),
                }
            }
            MuxCommand::Rpn { dlci, settings } => {
                let writer = PduWriter::new().u8(dlci_octet(*dlci));
                match settings {
                    Some((settings, mask)) => {
                        let (baud, format) = encode_settings(settings);
                        writer
                            .u8(baud)
                            .u8(format)
                            .u8(settings.fc_type)
                            .u8(settings.xon_char)
                            .u8(settings.xoff_char)
                            .u16(*mask)
                            .finish()
                    }
                    None => writer.finish(),
                }
            }
            MuxCommand::Rls { dlci, status } => {
                PduWriter::new().u8(dlci_octet(*dlci)).u8(*status).finish()
            }
            MuxCommand::Nsc { command_type } => vec![*command_type],
            MuxCommand::Test(pattern) => pattern.clone(),
            MuxCommand::Fcon
            | MuxCommand::Fcoff
            | MuxCommand::Psc
            | MuxCommand::Cld
            | MuxCommand::Unknown(_) => Vec::new(),
        };

        let mut type_octet = self.command.type_code() | RFCOMM_EA;
        if self.is_command {
            type_octet |= RFCOMM_CR_MASK;
        }

        let mut out = PduWriter::new().u8(type_octet);
        let len = values.len();
        if len <= 127 {
            out = out.u8(((len as u8) << 1) | RFCOMM_EA);
        } else {
            out = out.u8((len << 1) as u8).u8((len >> 7) as u8);
        }
        out.bytes(&values).finish()
    }
}

fn expect_len(len: usize, expected: usize) -> Result<(), FrameError> {
    if len < expected {
        return Err(FrameError::BadCommand(CodecError::ShortRead {
            needed: expected,
            remaining: len,
        }));
    }
    if len > expected {
        return Err(FrameError::BadCommand(CodecError::Oversize {
            len,
            limit: expected,
        }));
    }
    Ok(())
}
