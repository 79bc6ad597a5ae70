//!
//! collage_2pc
//! Crash-tolerant two-phase commit for a coordinator committing a
//! composite-image artifact ("collage") whose source files are owned by
//! multiple participant nodes. See SPEC_FULL.md for the protocol this
//! crate implements; DESIGN.md records how each module is grounded.
//!
pub mod coordinator;
pub mod error;
pub mod message;
pub mod options;
pub mod participant;
pub mod recovery;
pub mod transport;
pub mod verify;
pub mod wal;

pub use error::{Error, Result};
