//! Bearer descriptors and the send interface consumed by the engines

use crate::gap::{BdAddr, Transport};
use std::fmt;
use thiserror::Error;

/// Error types for bearer bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BearerError {
    #[error("Unknown bearer {0}")]
    UnknownBearer(BearerId),

    #[error("Bearer {0} was invalidated and cannot be reused")]
    Invalidated(BearerId),

    #[error("Bearer {0} is already open")]
    AlreadyOpen(BearerId),

    #[error("Connect failed: {0}")]
    ConnectFailed(String),
}

/// Result type for bearer operations
pub type BearerResult<T> = std::result::Result<T, BearerError>;

/// Opaque identifier assigned by the lower layer to one logical channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BearerId(pub u32);

impl fmt::Display for BearerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outcome of handing a frame to the lower layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Frame accepted
    Ok,
    /// Frame not accepted; retry once the bearer reports uncongested
    Congested,
    /// Frame not accepted and the bearer is unusable
    Failed,
}

/// One open logical channel to a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerDescriptor {
    pub id: BearerId,
    pub peer: BdAddr,
    pub transport: Transport,
    pub local_cid: u16,
    pub remote_cid: u16,
    /// Protocol multiplexer for dynamic channels, `None` for fixed channels
    pub psm: Option<u16>,
    /// Current maximum payload size
    pub mtu: u16,
    pub congested: bool,
}

impl BearerDescriptor {
    /// Descriptor for a fixed channel, whose local and remote CIDs match
    pub fn fixed(id: BearerId, peer: BdAddr, transport: Transport, cid: u16, mtu: u16) -> Self {
        Self {
            id,
            peer,
            transport,
            local_cid: cid,
            remote_cid: cid,
            psm: None,
            mtu,
            congested: false,
        }
    }

    /// Descriptor for a dynamic (connection-oriented) channel
    pub fn dynamic(
        id: BearerId,
        peer: BdAddr,
        transport: Transport,
        psm: u16,
        local_cid: u16,
        remote_cid: u16,
        mtu: u16,
    ) -> Self {
        Self {
            id,
            peer,
            transport,
            local_cid,
            remote_cid,
            psm: Some(psm),
            mtu,
            congested: false,
        }
    }
}

/// Lower-layer channel interface the engines send through
///
/// Implementations must preserve the order of frames handed to `send`
/// for a given bearer.
pub trait Bearer: Send + Sync {
    /// Hand one frame to the channel
    fn send(&self, id: BearerId, data: &[u8]) -> SendStatus;

    /// Start opening a dynamic channel; completion arrives as a
    /// `connected` event carrying the returned id
    fn connect(&self, peer: BdAddr, psm: u16) -> BearerResult<BearerId> {
        let _ = psm;
        Err(BearerError::ConnectFailed(format!(
            "dynamic channels unsupported for {}",
            peer
        )))
    }

    /// Close a channel previously opened or accepted
    fn disconnect(&self, id: BearerId) {
        let _ = id;
    }
}
