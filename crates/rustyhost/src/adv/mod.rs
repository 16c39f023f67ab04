//! LE advertising report reassembly
//!
//! Turns the stream of (possibly fragmented) LE advertising reports into
//! complete per-advertiser payloads, including the scan response when
//! one is expected.

pub mod constants;
pub mod reassembler;
pub mod types;

pub use reassembler::{trim_gap_entries, AdvReassembler};
pub use types::*;
