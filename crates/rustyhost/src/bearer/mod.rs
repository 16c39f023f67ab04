//! Bearer abstraction shared by the protocol engines
//!
//! A bearer is a reliable, ordered, framed channel to one peer with a known
//! maximum payload size. GATT may use several per peer (ATT plus EATT),
//! SMP uses one fixed channel per transport and RFCOMM rides one dynamic
//! channel per peer.

pub mod constants;
pub mod table;
pub mod types;

pub use constants::*;
pub use table::BearerTable;
pub use types::*;
