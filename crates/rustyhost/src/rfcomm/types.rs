//! Type definitions for RFCOMM ports and multiplexers

use super::constants::*;
use crate::gap::BdAddr;
use bitflags::bitflags;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Errors returned at the RFCOMM API edge
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Bad port handle {0}")]
    BadHandle(u16),

    #[error("Port is not open")]
    NotOpened,

    #[error("Port already opened on DLCI {0}")]
    AlreadyOpened(u8),

    #[error("No free port or multiplexer slot")]
    NoResources,

    #[error("Transmit queue full")]
    TxQueueFull,

    #[error("Multiplexer could not be started: {0}")]
    StartFailed(String),
}

/// Result type for RFCOMM API calls
pub type PortResult<T> = Result<T, PortError>;

/// Lifecycle status delivered to the management callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortStatus {
    Success,
    Closed,
    StartFailed,
    PeerTimeout,
    PeerConnectionFailed,
    PortNegFailed,
}

impl fmt::Display for PortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortStatus::Success => write!(f, "success"),
            PortStatus::Closed => write!(f, "closed"),
            PortStatus::StartFailed => write!(f, "start failed"),
            PortStatus::PeerTimeout => write!(f, "peer timeout"),
            PortStatus::PeerConnectionFailed => write!(f, "peer connection failed"),
            PortStatus::PortNegFailed => write!(f, "port negotiation failed"),
        }
    }
}

/// Opaque port handle, valid until the port is released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortHandle(pub u16);

impl fmt::Display for PortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port {}", self.0)
    }
}

/// Multiplexer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxState {
    Idle,
    WaitConnCnf,
    Configured,
    SabmeWaitUa,
    Connected,
    DiscWaitUa,
}

/// Flow control scheme of a multiplexer, chosen on the first PN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowMode {
    Undefined,
    Ts710,
    Credit,
}

/// Port state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Idle,
    Opening,
    ParamNeg,
    EstablishWait,
    Opened,
    Closing,
}

bitflags! {
    /// Port events an application can subscribe to
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortEvents: u32 {
        /// Data received
        const RXCHAR = 0x0000_0001;
        /// Configured flag character received
        const RXFLAG = 0x0000_0002;
        /// Transmit queue drained
        const TXEMPTY = 0x0000_0004;
        const CTS = 0x0000_0008;
        const DSR = 0x0000_0010;
        const RLSD = 0x0000_0020;
        const BREAK = 0x0000_0040;
        /// Line status error
        const ERR = 0x0000_0080;
        const RING = 0x0000_0100;
        const CONNECTED = 0x0000_0200;
        const CLOSED = 0x0000_0400;
        const CONGESTED = 0x0000_0800;
        const UNCONGESTED = 0x0000_1000;
        /// Received data was dropped
        const OVERRUN = 0x0000_2000;
    }
}

bitflags! {
    /// RS-232 style modem signals
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ModemSignals: u8 {
        const DTR_DSR = 0x01;
        const RTS_CTS = 0x02;
        const RI = 0x04;
        const DCD = 0x08;
    }
}

impl ModemSignals {
    /// Convert to the MSC signal octet (EA bit included)
    pub fn to_msc(&self, fc: bool) -> u8 {
        let mut value = RFCOMM_EA;
        if fc {
            value |= MSC_FC;
        }
        if self.contains(ModemSignals::DTR_DSR) {
            value |= MSC_RTC;
        }
        if self.contains(ModemSignals::RTS_CTS) {
            value |= MSC_RTR;
        }
        if self.contains(ModemSignals::RI) {
            value |= MSC_IC;
        }
        if self.contains(ModemSignals::DCD) {
            value |= MSC_DV;
        }
        value
    }

    /// Parse an MSC signal octet into signals and the FC bit
    pub fn from_msc(value: u8) -> (Self, bool) {
        let mut signals = ModemSignals::empty();
        if value & MSC_RTC != 0 {
            signals |= ModemSignals::DTR_DSR;
        }
        if value & MSC_RTR != 0 {
            signals |= ModemSignals::RTS_CTS;
        }
        if value & MSC_IC != 0 {
            signals |= ModemSignals::RI;
        }
        if value & MSC_DV != 0 {
            signals |= ModemSignals::DCD;
        }
        (signals, value & MSC_FC != 0)
    }
}

bitflags! {
    /// Line status errors
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LineStatus: u8 {
        const OVERRUN = RLS_OVERRUN;
        const PARITY = RLS_PARITY;
        const FRAMING = RLS_FRAMING;
        /// Synthesized when the connection under the port fails
        const FAILED = 0x10;
    }
}

impl LineStatus {
    /// RLS octet as sent on the wire
    pub fn to_rls(&self) -> u8 {
        let errors = self.bits() & (RLS_OVERRUN | RLS_PARITY | RLS_FRAMING);
        if errors == 0 {
            0
        } else {
            errors | RLS_ERROR
        }
    }

    pub fn from_rls(value: u8) -> Self {
        if value & RLS_ERROR == 0 {
            LineStatus::empty()
        } else {
            LineStatus::from_bits_truncate(value & (RLS_OVERRUN | RLS_PARITY | RLS_FRAMING))
        }
    }
}

/// Serial port parameters carried by RPN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSettings {
    pub baud_rate: u8,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: u8,
    pub parity_type: u8,
    pub fc_type: u8,
    pub xon_char: u8,
    pub xoff_char: u8,
    /// Character that raises `RXFLAG` when received
    pub rx_char1: Option<u8>,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            baud_rate: RPN_BAUD_9600,
            data_bits: RPN_DATA_BITS_8,
            stop_bits: RPN_STOP_BITS_1,
            parity: RPN_PARITY_NONE,
            parity_type: RPN_PARITY_ODD,
            fc_type: RPN_FLOW_OFF,
            xon_char: RPN_XON_CHAR,
            xoff_char: RPN_XOFF_CHAR,
            rx_char1: None,
        }
    }
}

/// Management callback: lifecycle results
pub type PortMgmtCallback = Arc<Mutex<dyn FnMut(PortHandle, PortStatus) + Send>>;
/// Event callback: subscribed port events
pub type PortEventCallback = Arc<Mutex<dyn FnMut(PortHandle, PortEvents) + Send>>;
/// Data callback: received payloads, bypassing the receive queue
pub type PortDataCallback = Arc<Mutex<dyn FnMut(PortHandle, &[u8]) + Send>>;

/// Parameters for opening a port
#[derive(Clone)]
pub struct OpenPortParams {
    pub is_server: bool,
    /// Server channel number
    pub scn: u8,
    /// Service class of the port
    pub uuid: u16,
    /// Required for clients
    pub peer: Option<BdAddr>,
    /// L2CAP PSM to reach the peer's multiplexer on
    pub psm: u16,
    /// Requested maximum frame size, 0 for the configured default
    pub mtu: u16,
    pub security_flags: u16,
    pub event_mask: PortEvents,
    pub mgmt_callback: Option<PortMgmtCallback>,
    pub event_callback: Option<PortEventCallback>,
}

impl OpenPortParams {
    pub fn server(scn: u8, uuid: u16) -> Self {
        Self {
            is_server: true,
            scn,
            uuid,
            peer: None,
            psm: crate::bearer::RFCOMM_PSM,
            mtu: 0,
            security_flags: 0,
            event_mask: PortEvents::all(),
            mgmt_callback: None,
            event_callback: None,
        }
    }

    pub fn client(peer: BdAddr, scn: u8, uuid: u16) -> Self {
        Self {
            is_server: false,
            peer: Some(peer),
            ..Self::server(scn, uuid)
        }
    }
}

impl fmt::Debug for OpenPortParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenPortParams")
            .field("is_server", &self.is_server)
            .field("scn", &self.scn)
            .field("uuid", &self.uuid)
            .field("peer", &self.peer)
            .field("mtu", &self.mtu)
            .finish()
    }
}

/// Snapshot of a port's negotiated state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub handle: PortHandle,
    pub state: PortState,
    pub dlci: u8,
    pub is_server: bool,
    pub peer: Option<BdAddr>,
    pub psm: u16,
    /// Security requirements given at open, for the caller's access checks
    pub security_flags: u16,
    pub mtu: u16,
    pub peer_mtu: u16,
    pub credit_tx: u16,
    pub credit_rx: u16,
    pub peer_fc: bool,
    pub user_fc: bool,
    pub rx_queue_size: usize,
    pub rx_queue_frames: usize,
    pub tx_queue_size: usize,
    pub line_status: LineStatus,
    pub local_signals: ModemSignals,
    pub peer_signals: ModemSignals,
}

/// RFCOMM tunables
#[derive(Debug, Clone)]
pub struct RfcommConfig {
    pub max_ports: usize,
    pub max_muxes: usize,
    /// Port MTU used when the application asks for 0
    pub default_mtu: u16,
    /// Receive credits granted to the peer per DLC
    pub credits_rx_max: u16,
    /// Replenish credits once the peer holds this many or fewer
    pub credits_rx_low: u16,
    pub rx_high_watermark: usize,
    pub rx_low_watermark: usize,
    pub rx_critical_bytes: usize,
    pub rx_critical_frames: usize,
    pub tx_critical_bytes: usize,
    pub t1_timeout: Duration,
    pub t2_timeout: Duration,
    pub disc_timeout: Duration,
    pub mcb_init_inactivity: Duration,
    pub mcb_release_inactivity: Duration,
}

impl Default for RfcommConfig {
    fn default() -> Self {
        Self {
            max_ports: 30,
            max_muxes: 7,
            default_mtu: 990,
            credits_rx_max: RFCOMM_K_MAX as u16,
            credits_rx_low: 2,
            rx_high_watermark: 8 * 1024,
            rx_low_watermark: 2 * 1024,
            rx_critical_bytes: 16 * 1024,
            rx_critical_frames: 64,
            tx_critical_bytes: 32 * 1024,
            t1_timeout: Duration::from_secs(RFC_T1_TIMEOUT),
            t2_timeout: Duration::from_secs(RFC_T2_TIMEOUT),
            disc_timeout: Duration::from_secs(RFC_DISC_TIMEOUT),
            mcb_init_inactivity: Duration::from_secs(RFC_MCB_INIT_INACT_TIMEOUT),
            mcb_release_inactivity: Duration::from_secs(RFC_MCB_RELEASE_INACT_TIMEOUT),
        }
    }
}
