//! Generic Access Profile primitives shared by every protocol engine
//!
//! Only device addressing lives here: the engines identify peers by
//! [`BdAddr`] and, where the address kind matters, by [`AddressWithType`].

pub mod constants;
pub mod types;

pub use constants::*;
pub use types::*;
