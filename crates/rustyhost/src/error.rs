//! Error types for the rustyhost library
//!
//! Each protocol module owns its error enum; this one wraps them for
//! callers that drive several engines through the [`Stack`](crate::Stack).

use crate::att::AttError;
use crate::bearer::BearerError;
use crate::codec::CodecError;
use crate::gap::BdAddr;
use crate::gatt::GattError;
use crate::rfcomm::PortError;
use crate::smp::SmpError;
use thiserror::Error;

/// Errors surfaced by the host core
#[derive(Error, Debug)]
pub enum Error {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Bearer error: {0}")]
    Bearer(#[from] BearerError),

    #[error("RFCOMM error: {0}")]
    Port(#[from] PortError),

    #[error("SMP error: {0}")]
    Smp(#[from] SmpError),

    #[error("ATT error: {0}")]
    Att(#[from] AttError),

    #[error("GATT error: {0}")]
    Gatt(#[from] GattError),

    #[error("No link to {0}")]
    NoLink(BdAddr),
}

/// Result type for stack operations
pub type Result<T> = std::result::Result<T, Error>;
