use crate::config::ClientSettings;
use crate::error::{Error, Result};
use crate::identity::IdentitySource;
use crate::peer::PeerIdentity;
use crate::policy;
use crate::prelude::{debug, info};
use crate::tls::{self, MtlsConnector};
use bytes::Bytes;
use http_body_util::{BodyExt as _, Empty};
use hyper::client::conn::http1;
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

/// What the server answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    /// HTTP status of the response.
    pub status: StatusCode,
    /// Identity the server presented.
    pub server: PeerIdentity,
    /// Response body.
    pub body: String,
}

/// Dials `address`, requires the server to present `server_id` and returns
/// the response to one `GET /`.
///
/// # Errors
///
/// * [`Error::InvalidIdentity`] if `server_id` is not a SPIFFE ID.
/// * [`Error::Connect`] if the address cannot be reached.
/// * [`Error::Unauthorized`] if the server presents another identity.
/// * [`Error::Handshake`] or [`Error::HandshakeTimeout`] for other TLS failures.
/// * [`Error::Http`] if the exchange fails after the handshake.
pub async fn fetch_greeting(
    source: &IdentitySource,
    address: &str,
    server_id: &str,
    handshake_timeout: Duration,
) -> Result<Greeting> {
    let expected = policy::allow_exact(server_id)?;
    let config = tls::mtls_client(source.clone())
        .authorize(expected)
        .with_alpn_protocols([b"http/1.1"])
        .build()?;
    let connector = MtlsConnector::new(Arc::new(config));

    let server_name = server_name(address)?;
    let tcp = TcpStream::connect(address)
        .await
        .map_err(|source| Error::Connect {
            address: address.to_owned(),
            source,
        })?;

    let (tls_stream, server) =
        tokio::time::timeout(handshake_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| Error::HandshakeTimeout(handshake_timeout))??;
    debug!("Connected to {address}: server={server}");

    let (mut sender, conn) = http1::handshake(TokioIo::new(tls_stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Client connection ended with error: {e}");
        }
    });

    let mut request = Request::new(Empty::<Bytes>::new());
    let host = HeaderValue::from_str(address)
        .map_err(|e| Error::Internal(format!("invalid host header {address}: {e}")))?;
    request.headers_mut().insert(HOST, host);

    let response = sender.send_request(request).await?;
    let status = response.status();
    let body = response.into_body().collect().await?.to_bytes();

    Ok(Greeting {
        status,
        server,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

/// TLS server name for `address` (`host:port`). Only used for SNI.
fn server_name(address: &str) -> Result<ServerName<'static>> {
    let host = address
        .rsplit_once(':')
        .map_or(address, |(host, _port)| host)
        .trim_start_matches('[')
        .trim_end_matches(']');

    ServerName::try_from(host.to_owned()).map_err(|e| Error::Connect {
        address: address.to_owned(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
    })
}

/// Runs the client role: one greeting exchange.
///
/// Opens the identity source at `settings.socket`, then behaves as
/// [`run_client_with`].
///
/// # Errors
///
/// Fails if the identity source cannot be opened or [`fetch_greeting`] fails.
pub async fn run_client(settings: ClientSettings) -> Result<Greeting> {
    let source = IdentitySource::builder()
        .endpoint(settings.socket.clone())
        .ready_timeout(settings.ready_timeout)
        .build()
        .await?;

    run_client_with(source, &settings).await
}

/// Runs one greeting exchange on an already opened `source` and closes it when
/// done.
///
/// # Errors
///
/// Fails if the source holds no document or [`fetch_greeting`] fails. The
/// source is closed in every case.
pub async fn run_client_with(source: IdentitySource, settings: &ClientSettings) -> Result<Greeting> {
    let result = exchange(&source, settings).await;
    source.close().await;
    result
}

async fn exchange(source: &IdentitySource, settings: &ClientSettings) -> Result<Greeting> {
    let local = source.current()?;
    info!("Client SPIFFE ID: {}", local.spiffe_id());

    fetch_greeting(
        source,
        &settings.address,
        &settings.server_id,
        settings.handshake_timeout,
    )
    .await
}
