//! IPC bridge between the master and its preforked workers.
//!
//! # Architecture
//!
//! - **protocol**: Frame payload types (WorkerHello, DispatchRequest)
//! - **codec**: Length-prefixed JSON codec (4-byte big-endian length)
//! - **transport**: Unix socket endpoint, exact-frame reads, readiness tokens,
//!   readiness multiplexing

pub mod codec;
pub mod protocol;
pub mod transport;
