//!
//! error.rs
//! Crate-wide error type for the collage two-phase-commit protocol.
//!
//! The original teacher project gets away with `unwrap()`/`panic!()`
//! everywhere because it is a single-shot classroom simulation; a
//! crash-recovery protocol needs its failure modes named so callers can
//! tell a dropped vote from a torn write-ahead log entry.
//!
use thiserror::Error;

/// The five error kinds of the commit protocol's error handling design.
#[derive(Error, Debug)]
pub enum Error {
    /// The decoder could not parse a received frame (truncated header,
    /// truncated length-prefixed field, or a declared length exceeding
    /// the remaining bytes). The frame is dropped; the connection lives on.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A send failed or no connection to the destination could be
    /// established. Treated as a lost message; timers alone drive retry.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// A write-ahead log append, blob write, file delete, or destination
    /// publish failed at the OS level.
    #[error("local I/O error: {0}")]
    LocalIOError(#[from] std::io::Error),

    /// A vote or ack collection deadline elapsed.
    #[error("protocol timeout")]
    ProtocolTimeout,

    /// A message referenced a transaction id this node has no record of.
    #[error("unknown transaction {0}")]
    UnknownTransaction(u32),
}

pub type Result<T> = std::result::Result<T, Error>;
