//! Coverage channel between the harness and the runner inside the VM.
//!
//! Control messages are fixed-size `repr(C)` structs exchanged over a pair of byte
//! streams (the runner's stdin/stdout, forwarded by ssh). Bulk data, the candidate image
//! and the coverage record, goes through shared regions when both sides have them and
//! is streamed after the control message otherwise.

pub mod afl;
pub mod controller;
pub mod cov;
pub mod endpoint;
pub mod message;
pub mod shm;
mod util;

pub use controller::Controller;
pub use endpoint::RunnerEndpoint;
pub use message::RunStatus;
pub use shm::SharedRegion;

use thiserror::Error;

/// Size of the coverage record, part of protocol version 1.
pub const MAP_SIZE: usize = 1 << 16;
/// Size of the image region.
pub const IN_SHM_SZ: usize = 16 << 20;
/// Size of the coverage region.
pub const COVER_SHM_SZ: usize = MAP_SIZE;
/// Largest image streamed over the control pipe.
pub const MAX_STREAM_IMAGE: u64 = (1 << 30) + (1 << 20);

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer disconnected")]
    Disconnected,
    #[error("timeout")]
    Timeout,
    #[error("protocol: {0}")]
    Protocol(String),
}
