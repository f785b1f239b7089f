//! Shared pieces of the `moe-rs` demo binaries.

pub mod logging;
