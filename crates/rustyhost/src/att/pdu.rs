//! ATT PDUs seen from the client side
//!
//! [`ClientPdu`] is everything the client puts on the wire: requests,
//! commands and the few replies it owes a server. [`ServerPdu`] is the
//! parsed form of everything a server may send to it.

use super::constants::*;
use super::error::{AttError, AttErrorCode, AttResult};
use crate::codec::{PduReader, PduWriter};
use crate::gatt::Uuid;

/// PDUs sent by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPdu {
    ExchangeMtuRequest {
        mtu: u16,
    },
    FindInformationRequest {
        start: u16,
        end: u16,
    },
    FindByTypeValueRequest {
        start: u16,
        end: u16,
        attribute_type: u16,
        value: Vec<u8>,
    },
    ReadByTypeRequest {
        start: u16,
        end: u16,
        attribute_type: Uuid,
    },
    ReadRequest {
        handle: u16,
    },
    ReadBlobRequest {
        handle: u16,
        offset: u16,
    },
    ReadMultipleRequest {
        handles: Vec<u16>,
    },
    ReadMultipleVariableRequest {
        handles: Vec<u16>,
    },
    ReadByGroupTypeRequest {
        start: u16,
        end: u16,
        group_type: Uuid,
    },
    WriteRequest {
        handle: u16,
        value: Vec<u8>,
    },
    WriteCommand {
        handle: u16,
        value: Vec<u8>,
    },
    SignedWriteCommand {
        handle: u16,
        value: Vec<u8>,
        signature: [u8; ATT_SIGNATURE_SIZE],
    },
    PrepareWriteRequest {
        handle: u16,
        offset: u16,
        value: Vec<u8>,
    },
    ExecuteWriteRequest {
        commit: bool,
    },
    HandleValueConfirmation,
    ExchangeMtuResponse {
        mtu: u16,
    },
    ErrorResponse {
        request_opcode: u8,
        handle: u16,
        code: AttErrorCode,
    },
}

impl ClientPdu {
    pub fn opcode(&self) -> u8 {
        match self {
            ClientPdu::ExchangeMtuRequest { .. } => ATT_EXCHANGE_MTU_REQ,
            ClientPdu::FindInformationRequest { .. } => ATT_FIND_INFO_REQ,
            ClientPdu::FindByTypeValueRequest { .. } => ATT_FIND_BY_TYPE_VALUE_REQ,
            ClientPdu::ReadByTypeRequest { .. } => ATT_READ_BY_TYPE_REQ,
            ClientPdu::ReadRequest { .. } => ATT_READ_REQ,
            ClientPdu::ReadBlobRequest { .. } => ATT_READ_BLOB_REQ,
            ClientPdu::ReadMultipleRequest { .. } => ATT_READ_MULTIPLE_REQ,
            ClientPdu::ReadMultipleVariableRequest { .. } => ATT_READ_MULTIPLE_VARIABLE_REQ,
            ClientPdu::ReadByGroupTypeRequest { .. } => ATT_READ_BY_GROUP_TYPE_REQ,
            ClientPdu::WriteRequest { .. } => ATT_WRITE_REQ,
            ClientPdu::WriteCommand { .. } => ATT_WRITE_CMD,
            ClientPdu::SignedWriteCommand { .. } => ATT_SIGNED_WRITE_CMD,
            ClientPdu::PrepareWriteRequest { .. } => ATT_PREPARE_WRITE_REQ,
            ClientPdu::ExecuteWriteRequest { .. } => ATT_EXECUTE_WRITE_REQ,
            ClientPdu::HandleValueConfirmation => ATT_HANDLE_VALUE_CONF,
            ClientPdu::ExchangeMtuResponse { .. } => ATT_EXCHANGE_MTU_RSP,
            ClientPdu::ErrorResponse { .. } => ATT_ERROR_RSP,
        }
    }

    /// Opcode of the response this PDU waits for; `None` for commands,
    /// confirmations and responses
    pub fn response_opcode(&self) -> Option<u8> {
        match self {
            ClientPdu::WriteCommand { .. }
            | ClientPdu::SignedWriteCommand { .. }
            | ClientPdu::HandleValueConfirmation
            | ClientPdu::ExchangeMtuResponse { .. }
            | ClientPdu::ErrorResponse { .. } => None,
            // every request's response opcode is the next one up
            request => Some(request.opcode() + 1),
        }
    }

    /// Bytes the signature of a signed write covers
    pub fn signed_message(handle: u16, value: &[u8]) -> Vec<u8> {
        PduWriter::with_opcode(ATT_SIGNED_WRITE_CMD)
            .u16(handle)
            .bytes(value)
            .finish()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let w = PduWriter::with_opcode(self.opcode());
        let w = match self {
            ClientPdu::ExchangeMtuRequest { mtu } | ClientPdu::ExchangeMtuResponse { mtu } => {
                w.u16(*mtu)
            }
            ClientPdu::FindInformationRequest { start, end } => w.u16(*start).u16(*end),
            ClientPdu::FindByTypeValueRequest {
                start,
                end,
                attribute_type,
                value,
            } => w.u16(*start).u16(*end).u16(*attribute_type).bytes(value),
            ClientPdu::ReadByTypeRequest {
                start,
                end,
                attribute_type,
            } => w
                .u16(*start)
                .u16(*end)
                .bytes(&attribute_type.to_att_bytes()),
            ClientPdu::ReadRequest { handle } => w.u16(*handle),
            ClientPdu::ReadBlobRequest { handle, offset } => w.u16(*handle).u16(*offset),
            ClientPdu::ReadMultipleRequest { handles }
            | ClientPdu::ReadMultipleVariableRequest { handles } => {
                handles.iter().fold(w, |w, handle| w.u16(*handle))
            }
            ClientPdu::ReadByGroupTypeRequest {
                start,
                end,
                group_type,
            } => w.u16(*start).u16(*end).bytes(&group_type.to_att_bytes()),
            ClientPdu::WriteRequest { handle, value } | ClientPdu::WriteCommand { handle, value } => {
                w.u16(*handle).bytes(value)
            }
            ClientPdu::SignedWriteCommand {
                handle,
                value,
                signature,
            } => w.u16(*handle).bytes(value).bytes(signature),
            ClientPdu::PrepareWriteRequest {
                handle,
                offset,
                value,
            } => w.u16(*handle).u16(*offset).bytes(value),
            ClientPdu::ExecuteWriteRequest { commit } => w.u8(if *commit {
                ATT_EXEC_WRITE_COMMIT
            } else {
                ATT_EXEC_WRITE_CANCEL
            }),
            ClientPdu::HandleValueConfirmation => w,
            ClientPdu::ErrorResponse {
                request_opcode,
                handle,
                code,
            } => w.u8(*request_opcode).u16(*handle).u8((*code).into()),
        };
        w.finish()
    }
}

/// One Read By Type record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleValue {
    pub handle: u16,
    pub value: Vec<u8>,
}

/// One Read By Group Type record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupValue {
    pub handle: u16,
    pub end_group: u16,
    pub value: Vec<u8>,
}

/// One Find By Type Value record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleRange {
    pub found: u16,
    pub end_group: u16,
}

/// PDUs received from a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerPdu {
    /// `request_opcode` is `None` when the response was too short to carry
    /// one; the code is then the unknown reason
    ErrorResponse {
        request_opcode: Option<u8>,
        handle: u16,
        code: AttErrorCode,
    },
    ExchangeMtuResponse {
        mtu: u16,
    },
    FindInformationResponse(Vec<(u16, Uuid)>),
    FindByTypeValueResponse(Vec<HandleRange>),
    ReadByTypeResponse(Vec<HandleValue>),
    ReadResponse(Vec<u8>),
    ReadBlobResponse(Vec<u8>),
    ReadMultipleResponse(Vec<u8>),
    ReadMultipleVariableResponse(Vec<Vec<u8>>),
    ReadByGroupTypeResponse(Vec<GroupValue>),
    WriteResponse,
    PrepareWriteResponse {
        handle: u16,
        offset: u16,
        value: Vec<u8>,
    },
    ExecuteWriteResponse,
    Notification {
        handle: u16,
        value: Vec<u8>,
    },
    Indication {
        handle: u16,
        value: Vec<u8>,
    },
    /// Records that parsed before the first malformed one
    MultipleNotification(Vec<HandleValue>),
    ExchangeMtuRequest {
        mtu: u16,
    },
    /// A request the client side does not serve
    UnsupportedRequest {
        opcode: u8,
    },
    /// A command the client side ignores
    UnsupportedCommand {
        opcode: u8,
    },
}

impl ServerPdu {
    pub fn opcode(&self) -> u8 {
        match self {
            ServerPdu::ErrorResponse { .. } => ATT_ERROR_RSP,
            ServerPdu::ExchangeMtuResponse { .. } => ATT_EXCHANGE_MTU_RSP,
            ServerPdu::FindInformationResponse(_) => ATT_FIND_INFO_RSP,
            ServerPdu::FindByTypeValueResponse(_) => ATT_FIND_BY_TYPE_VALUE_RSP,
            ServerPdu::ReadByTypeResponse(_) => ATT_READ_BY_TYPE_RSP,
            ServerPdu::ReadResponse(_) => ATT_READ_RSP,
            ServerPdu::ReadBlobResponse(_) => ATT_READ_BLOB_RSP,
            ServerPdu::ReadMultipleResponse(_) => ATT_READ_MULTIPLE_RSP,
            ServerPdu::ReadMultipleVariableResponse(_) => ATT_READ_MULTIPLE_VARIABLE_RSP,
            ServerPdu::ReadByGroupTypeResponse(_) => ATT_READ_BY_GROUP_TYPE_RSP,
            ServerPdu::WriteResponse => ATT_WRITE_RSP,
            ServerPdu::PrepareWriteResponse { .. } => ATT_PREPARE_WRITE_RSP,
            ServerPdu::ExecuteWriteResponse => ATT_EXECUTE_WRITE_RSP,
            ServerPdu::Notification { .. } => ATT_HANDLE_VALUE_NTF,
            ServerPdu::Indication { .. } => ATT_HANDLE_VALUE_IND,
            ServerPdu::MultipleNotification(_) => ATT_MULTIPLE_HANDLE_VALUE_NTF,
            ServerPdu::ExchangeMtuRequest { .. } => ATT_EXCHANGE_MTU_REQ,
            ServerPdu::UnsupportedRequest { opcode } | ServerPdu::UnsupportedCommand { opcode } => {
                *opcode
            }
        }
    }

    /// Whether this PDU answers an outstanding client request
    pub fn is_response(&self) -> bool {
        !matches!(
            self,
            ServerPdu::Notification { .. }
                | ServerPdu::Indication { .. }
                | ServerPdu::MultipleNotification(_)
                | ServerPdu::ExchangeMtuRequest { .. }
                | ServerPdu::UnsupportedRequest { .. }
                | ServerPdu::UnsupportedCommand { .. }
        )
    }

    pub fn parse(data: &[u8]) -> AttResult<ServerPdu> {
        let mut r = PduReader::new(data);
        let opcode = r.read_u8()?;
        let pdu = match opcode {
            ATT_ERROR_RSP => {
                if r.remaining() < 4 {
                    ServerPdu::ErrorResponse {
                        request_opcode: None,
                        handle: 0,
                        code: AttErrorCode::unknown_reason(),
                    }
                } else {
                    ServerPdu::ErrorResponse {
                        request_opcode: Some(r.read_u8()?),
                        handle: r.read_u16()?,
                        code: AttErrorCode::from(r.read_u8()?),
                    }
                }
            }
            ATT_EXCHANGE_MTU_RSP => ServerPdu::ExchangeMtuResponse { mtu: r.read_u16()? },
            ATT_EXCHANGE_MTU_REQ => ServerPdu::ExchangeMtuRequest { mtu: r.read_u16()? },
            ATT_FIND_INFO_RSP => ServerPdu::FindInformationResponse(Self::parse_info(&mut r)?),
            ATT_FIND_BY_TYPE_VALUE_RSP => {
                let mut ranges = Vec::new();
                while r.remaining() >= 4 {
                    ranges.push(HandleRange {
                        found: r.read_u16()?,
                        end_group: r.read_u16()?,
                    });
                }
                if ranges.is_empty() {
                    return Err(AttError::InvalidPdu("empty find by type value response"));
                }
                ServerPdu::FindByTypeValueResponse(ranges)
            }
            ATT_READ_BY_TYPE_RSP => {
                let len = r.read_u8()? as usize;
                if len < 2 {
                    return Err(AttError::InvalidPdu("read by type record length"));
                }
                let mut records = Vec::new();
                while r.remaining() >= len {
                    let handle = r.read_u16()?;
                    let value = r.read_slice(len - 2)?.to_vec();
                    records.push(HandleValue { handle, value });
                }
                if records.is_empty() {
                    return Err(AttError::InvalidPdu("empty read by type response"));
                }
                ServerPdu::ReadByTypeResponse(records)
            }
            ATT_READ_BY_GROUP_TYPE_RSP => {
                let len = r.read_u8()? as usize;
                if len < 4 {
                    return Err(AttError::InvalidPdu("read by group type record length"));
                }
                let mut groups = Vec::new();
                while r.remaining() >= len {
                    let handle = r.read_u16()?;
                    let end_group = r.read_u16()?;
                    let value = r.read_slice(len - 4)?.to_vec();
                    groups.push(GroupValue {
                        handle,
                        end_group,
                        value,
                    });
                }
                if groups.is_empty() {
                    return Err(AttError::InvalidPdu("empty read by group type response"));
                }
                ServerPdu::ReadByGroupTypeResponse(groups)
            }
            ATT_READ_RSP => ServerPdu::ReadResponse(r.rest().to_vec()),
            ATT_READ_BLOB_RSP => ServerPdu::ReadBlobResponse(r.rest().to_vec()),
            ATT_READ_MULTIPLE_RSP => ServerPdu::ReadMultipleResponse(r.rest().to_vec()),
            ATT_READ_MULTIPLE_VARIABLE_RSP => {
                let mut values = Vec::new();
                while !r.is_empty() {
                    let len = r.read_u16()? as usize;
                    // a final value may be truncated to the MTU
                    let take = len.min(r.remaining());
                    values.push(r.read_slice(take)?.to_vec());
                }
                ServerPdu::ReadMultipleVariableResponse(values)
            }
            ATT_WRITE_RSP => ServerPdu::WriteResponse,
            ATT_PREPARE_WRITE_RSP => ServerPdu::PrepareWriteResponse {
                handle: r.read_u16()?,
                offset: r.read_u16()?,
                value: r.rest().to_vec(),
            },
            ATT_EXECUTE_WRITE_RSP => ServerPdu::ExecuteWriteResponse,
            ATT_HANDLE_VALUE_NTF => ServerPdu::Notification {
                handle: r.read_u16()?,
                value: r.rest().to_vec(),
            },
            ATT_HANDLE_VALUE_IND => ServerPdu::Indication {
                handle: r.read_u16()?,
                value: r.rest().to_vec(),
            },
            ATT_MULTIPLE_HANDLE_VALUE_NTF => {
                let mut records = Vec::new();
                while r.remaining() >= 4 {
                    let handle = r.read_u16()?;
                    let len = r.read_u16()? as usize;
                    if len > r.remaining() {
                        break;
                    }
                    let value = r.read_slice(len)?.to_vec();
                    records.push(HandleValue { handle, value });
                }
                ServerPdu::MultipleNotification(records)
            }
            op if op & ATT_COMMAND_FLAG != 0 => ServerPdu::UnsupportedCommand { opcode: op },
            op if Self::is_request_opcode(op) => ServerPdu::UnsupportedRequest { opcode: op },
            op => return Err(AttError::UnknownOpcode(op)),
        };
        Ok(pdu)
    }

    fn parse_info(r: &mut PduReader<'_>) -> AttResult<Vec<(u16, Uuid)>> {
        let uuid_len = match r.read_u8()? {
            ATT_FIND_INFO_RSP_FORMAT_16BIT => 2,
            ATT_FIND_INFO_RSP_FORMAT_128BIT => 16,
            _ => return Err(AttError::InvalidPdu("find information format")),
        };
        let mut info = Vec::new();
        while r.remaining() >= 2 + uuid_len {
            let handle = r.read_u16()?;
            let uuid = Uuid::from_bytes(r.read_slice(uuid_len)?)
                .ok_or(AttError::InvalidPdu("find information uuid"))?;
            info.push((handle, uuid));
        }
        if info.is_empty() {
            return Err(AttError::InvalidPdu("empty find information response"));
        }
        Ok(info)
    }

    /// Requests a server could address to us that we must answer
    fn is_request_opcode(opcode: u8) -> bool {
        matches!(
            opcode,
            ATT_FIND_INFO_REQ
                | ATT_FIND_BY_TYPE_VALUE_REQ
                | ATT_READ_BY_TYPE_REQ
                | ATT_READ_REQ
                | ATT_READ_BLOB_REQ
                | ATT_READ_MULTIPLE_REQ
                | ATT_READ_BY_GROUP_TYPE_REQ
                | ATT_WRITE_REQ
                | ATT_PREPARE_WRITE_REQ
                | ATT_EXECUTE_WRITE_REQ
                | ATT_READ_MULTIPLE_VARIABLE_REQ
        )
    }
}
