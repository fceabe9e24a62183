use std::sync::Arc;

use rustls::{RootCertStore, SupportedProtocolVersion};
use typed_builder::TypedBuilder;

/// How replayed writes are checked against the recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteCheck {
    /// Consume the recorded write without comparing it.
    #[default]
    Permissive,
    /// Fail with [`crate::Error::WriteMismatch`] unless each write starts with the recorded bytes.
    Strict,
}

/// Configuration shared by [`crate::Recorder`] and [`crate::Replayer`].
///
/// A recording must be replayed with the same root store and protocol versions it was made
/// with, otherwise certificate checks or the negotiated handshake diverge.
#[derive(Debug, Clone, TypedBuilder)]
pub struct Config {
    /// Trust anchors used to verify the server certificate
    #[builder(default = default_root_store(), setter(into))]
    pub root_store: Arc<RootCertStore>,

    /// TLS versions offered in the ClientHello
    #[builder(default = vec![&rustls::version::TLS13, &rustls::version::TLS12])]
    pub protocol_versions: Vec<&'static SupportedProtocolVersion>,

    /// `User-Agent` sent when the request does not carry one
    #[builder(default = concat!("retls/", env!("CARGO_PKG_VERSION")).to_owned(), setter(into))]
    pub user_agent: String,

    /// Write verification during replay
    #[builder(default)]
    pub write_check: WriteCheck,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(feature = "webpki-roots")]
fn default_root_store() -> Arc<RootCertStore> {
    Arc::new(RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    })
}

#[cfg(not(feature = "webpki-roots"))]
fn default_root_store() -> Arc<RootCertStore> {
    Arc::new(RootCertStore::empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.write_check, WriteCheck::Permissive);
        assert!(config.user_agent.starts_with("retls/"));
        assert_eq!(config.protocol_versions.len(), 2);
        #[cfg(feature = "webpki-roots")]
        assert!(!config.root_store.is_empty());
    }

    #[test]
    fn overrides() {
        let config = Config::builder()
            .root_store(RootCertStore::empty())
            .user_agent("custom/1.0")
            .write_check(WriteCheck::Strict)
            .protocol_versions(vec![&rustls::version::TLS13])
            .build();
        assert!(config.root_store.is_empty());
        assert_eq!(config.user_agent, "custom/1.0");
        assert_eq!(config.write_check, WriteCheck::Strict);
        assert_eq!(config.protocol_versions.len(), 1);
    }
}
