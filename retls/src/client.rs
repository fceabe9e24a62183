//! One HTTP/1.1 exchange over a hooked TLS session, shared by recording and replay.

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use http::{
    header::{CONNECTION, HOST, USER_AGENT},
    HeaderValue, Request, Response, Uri,
};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use rustls::{pki_types::ServerName, CipherSuite, ProtocolVersion};
use tokio_rustls::TlsConnector;

use crate::{hooks::Dialed, Config, Error, Hooks};

/// Details of the TLS session a response was received over, attached to every response as an
/// extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    pub protocol_version: Option<ProtocolVersion>,
    pub cipher_suite: Option<CipherSuite>,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
}

/// Where a request goes.
#[derive(Debug, Clone)]
struct Target {
    /// `host:port`, the prefix of every connection-scoped tag
    addr: String,
    server_name: ServerName<'static>,
    /// Value of the `Host` header
    authority: String,
}

impl Target {
    fn from_uri(uri: &Uri) -> Result<Self, Error> {
        let host = uri
            .host()
            .ok_or_else(|| Error::InvalidUrl(format!("{uri}: missing host")))?;
        match uri.scheme_str() {
            Some("https") => {}
            Some("http") => {
                let port = uri.port_u16().unwrap_or(80);
                return Err(Error::NotTls(format!("{host}:{port}")));
            }
            _ => return Err(Error::InvalidUrl(format!("{uri}: unsupported scheme"))),
        }

        let addr = format!("{host}:{}", uri.port_u16().unwrap_or(443));
        let bare_host = host.trim_start_matches('[').trim_end_matches(']');
        let server_name = ServerName::try_from(bare_host)
            .map_err(|err| Error::InvalidUrl(format!("{host}: {err}")))?
            .to_owned();
        let authority = match uri.port_u16() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        };

        Ok(Self {
            addr,
            server_name,
            authority,
        })
    }
}

/// Build a `GET` request for `url`.
pub(crate) fn get_request(url: &str) -> Result<Request<Bytes>, Error> {
    let uri: Uri = url
        .parse()
        .map_err(|err| Error::InvalidUrl(format!("{url}: {err}")))?;
    Ok(Request::get(uri).body(Bytes::new())?)
}

/// Rewrite `request` into origin form with the headers every exchange carries.
fn prepare(
    request: Request<Bytes>,
    target: &Target,
    user_agent: &str,
) -> Result<Request<Full<Bytes>>, Error> {
    let (mut parts, body) = request.into_parts();
    let origin = parts
        .uri
        .path_and_query()
        .map_or_else(|| "/".to_owned(), |pq| pq.as_str().to_owned());
    parts.uri = Uri::builder().path_and_query(origin).build()?;

    let headers = &mut parts.headers;
    headers.insert(
        HOST,
        HeaderValue::from_str(&target.authority).map_err(http::Error::from)?,
    );
    if !headers.contains_key(USER_AGENT) {
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(user_agent).map_err(http::Error::from)?,
        );
    }
    headers.insert(CONNECTION, HeaderValue::from_static("close"));

    Ok(Request::from_parts(parts, Full::new(body)))
}

/// Prefer the failure a hook noted over the opaque error the stack reported for it.
fn surface<H: Hooks>(hooks: &H, err: impl Into<Error>) -> Error {
    hooks.take_failure().unwrap_or_else(|| err.into())
}

/// Unwrap a rustls error carried inside an `io::Error`.
fn tls_error(err: std::io::Error) -> Error {
    match err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    {
        Some(tls) => Error::Tls(tls.clone()),
        None => Error::Io(err),
    }
}

/// Perform one request, reading the whole body before returning.
///
/// The connection is closed after the response and its driver task is joined, so nothing
/// touches the hooks once this returns.
#[tracing::instrument(skip_all, fields(method = %request.method(), uri = %request.uri()))]
pub(crate) async fn execute<H: Hooks>(
    hooks: &H,
    connector: &TlsConnector,
    config: &Config,
    request: Request<Bytes>,
) -> Result<Response<Bytes>, Error> {
    // Drop anything left over from an earlier request.
    hooks.take_failure();

    let target = Target::from_uri(request.uri())?;
    let request = prepare(request, &target, &config.user_agent)?;

    let Dialed {
        conn,
        local,
        remote,
    } = hooks.dial_tls(&target.addr).await?;
    let tls = connector
        .connect(target.server_name.clone(), conn)
        .await
        .map_err(|err| surface(hooks, tls_error(err)))?;

    let (_, session) = tls.get_ref();
    let info = TlsInfo {
        protocol_version: session.protocol_version(),
        cipher_suite: session.negotiated_cipher_suite().map(|suite| suite.suite()),
        local_addr: local,
        remote_addr: remote,
    };
    tracing::debug!(version = ?info.protocol_version, suite = ?info.cipher_suite, "handshake complete");

    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
        .await
        .map_err(|err| surface(hooks, err))?;
    let driver = tokio::spawn(connection);

    let exchange = async {
        let response = sender.send_request(request).await?;
        let (parts, mut incoming) = response.into_parts();
        let mut body = BytesMut::new();
        while let Some(frame) = incoming.frame().await {
            let Ok(chunk) = frame?.into_data() else {
                continue;
            };
            if !chunk.is_empty() {
                hooks.body_chunk(&chunk);
                body.extend_from_slice(&chunk);
            }
        }
        Ok::<_, hyper::Error>((parts, body.freeze()))
    }
    .await;
    drop(sender);

    let closed = driver.await;
    let (parts, body) = exchange.map_err(|err| surface(hooks, err))?;
    match closed {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::debug!(%err, "connection closed with an error after the response"),
        Err(err) => tracing::warn!(%err, "connection task failed"),
    }
    hooks.take_failure();

    let mut response = Response::from_parts(parts, body);
    response.extensions_mut().insert(info);
    tracing::info!(
        status = %response.status(),
        len = response.body().len(),
        "response complete"
    );
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(url: &str) -> Result<Target, Error> {
        Target::from_uri(&url.parse().unwrap())
    }

    #[test]
    fn https_targets() {
        let t = target("https://example.com/a?b=c").unwrap();
        assert_eq!(t.addr, "example.com:443");
        assert_eq!(t.authority, "example.com");

        let t = target("https://localhost:8443/").unwrap();
        assert_eq!(t.addr, "localhost:8443");
        assert_eq!(t.authority, "localhost:8443");

        let t = target("https://[::1]:9000/").unwrap();
        assert_eq!(t.addr, "[::1]:9000");
        assert_eq!(
            t.server_name,
            ServerName::IpAddress("::1".parse::<std::net::IpAddr>().unwrap().into())
        );
    }

    #[test]
    fn rejected_targets() {
        assert!(matches!(
            target("http://example.com/"),
            Err(Error::NotTls(addr)) if addr == "example.com:80"
        ));
        assert!(matches!(target("ftp://example.com/"), Err(Error::InvalidUrl(_))));
        assert!(matches!(target("/relative"), Err(Error::InvalidUrl(_))));
        assert!(matches!(get_request("not a url"), Err(Error::InvalidUrl(_))));
    }

    #[test]
    fn requests_are_sent_in_origin_form() {
        let request = Request::post("https://example.com:8443/submit?x=1")
            .header(USER_AGENT, "custom/2")
            .body(Bytes::from_static(b"payload"))
            .unwrap();
        let t = Target::from_uri(request.uri()).unwrap();
        let prepared = prepare(request, &t, "retls/test").unwrap();

        assert_eq!(prepared.uri(), "/submit?x=1");
        assert_eq!(prepared.headers()[HOST], "example.com:8443");
        assert_eq!(prepared.headers()[USER_AGENT], "custom/2");
        assert_eq!(prepared.headers()[CONNECTION], "close");

        let request = get_request("https://example.com").unwrap();
        let t = Target::from_uri(request.uri()).unwrap();
        let prepared = prepare(request, &t, "retls/test").unwrap();
        assert_eq!(prepared.uri(), "/");
        assert_eq!(prepared.headers()[USER_AGENT], "retls/test");
    }
}
