//! `simbridge-core`: identifiers, error taxonomy and time helpers shared by
//! every simbridge crate.
//!
//! This crate contains no I/O.

pub mod error;
pub mod id;
pub mod time;

pub use error::{BridgeError, BridgeResult, ErrorKind};
pub use id::{EventId, JobId};
