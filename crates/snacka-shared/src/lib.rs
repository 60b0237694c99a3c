//! Identifiers, wire payloads and errors shared by the Snacka sync crates.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{ProtocolError, RequestError, RequestErrorKind};
