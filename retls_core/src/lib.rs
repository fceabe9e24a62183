#![doc=include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
#![deny(unsafe_code)]
#![deny(clippy::all)]

pub mod codec;
mod log;
pub mod payload;
mod queue;
mod record;
mod time;

pub use log::*;
pub use queue::*;
pub use record::*;
pub use time::*;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No record with the requested tag remains in the log.
    #[error("out of data while looking for {tag}")]
    DataExhausted { tag: String },

    #[error("malformed record log: {0}")]
    MalformedLog(String),

    #[error("malformed {tag} payload: {reason}")]
    MalformedPayload { tag: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns `true` if this is a [`Error::DataExhausted`].
    #[must_use]
    pub fn is_data_exhausted(&self) -> bool {
        matches!(self, Self::DataExhausted { .. })
    }
}
