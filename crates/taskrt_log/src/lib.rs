//! Logging facade for the taskrt crates.
//!
//! A thin re-export of [`log`]'s macros so that every crate in the
//! workspace goes through a single point of entry, plus a couple of
//! timing helpers used around suspension points (lock acquisition,
//! worker shutdown) where latency is worth recording.

#[macro_use]
mod macros;

pub use log::{debug, error, info, trace, warn};
