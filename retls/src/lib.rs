#![doc=include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
#![deny(unsafe_code)]
#![deny(clippy::all)]

mod client;
mod config;
mod hooks;
mod recorder;
mod replayer;
mod shim;

pub use client::TlsInfo;
pub use config::{Config, WriteCheck};
pub use hooks::{Dialed, Hooks};
pub use recorder::Recorder;
pub use replayer::Replayer;

pub use retls_core as core;
pub use retls_core::{Record, RecordLog, Timestamp};

/// Errors returned by [`Recorder`] and [`Replayer`] requests.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("refusing to dial {0} without TLS")]
    NotTls(String),

    #[error("dialing {addr} failed: {source}")]
    DialFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("recorded dial to {addr} failed: {reason}")]
    RecordedDialFailure { addr: String, reason: String },

    #[error("recorded random draw is {recorded} bytes but {requested} were requested")]
    RandomLength { recorded: usize, requested: usize },

    #[error("write to {addr} does not match the recording")]
    WriteMismatch { addr: String },

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("invalid request")]
    InvalidRequest(#[from] http::Error),

    #[error(transparent)]
    Log(#[from] retls_core::Error),

    #[error("TLS error")]
    Tls(#[from] rustls::Error),

    #[error("HTTP error")]
    Http(#[from] hyper::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns `true` if replay ran out of recorded data.
    #[must_use]
    pub fn is_data_exhausted(&self) -> bool {
        matches!(self, Self::Log(err) if err.is_data_exhausted())
    }
}
