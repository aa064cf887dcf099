use super::open_until_shutdown;
use crate::config::ServerSettings;
use crate::error::{Error, Result};
use crate::identity::{IdentitySource, IdentitySourceBuilder};
use crate::policy::{self, AuthorizationPolicy};
use crate::prelude::{debug, info, warn};
use crate::tls::{self, MtlsAcceptor};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Greeting server: answers every request on an authenticated connection.
///
/// Each connection runs in its own task. A failed handshake or a broken
/// connection is logged and does not affect the accept loop.
#[derive(Clone, Debug)]
pub struct Server {
    acceptor: MtlsAcceptor,
    handshake_timeout: Duration,
    grace_period: Duration,
}

impl Server {
    /// Creates a server presenting the identity of `source` and admitting the
    /// clients `policy` accepts.
    ///
    /// # Errors
    ///
    /// Fails if the source holds no document or the TLS configuration cannot
    /// be built.
    pub fn new(source: IdentitySource, policy: impl AuthorizationPolicy) -> Result<Self> {
        let config = tls::mtls_server(source)
            .authorize(policy)
            .with_alpn_protocols([b"http/1.1"])
            .build()?;
        let defaults = ServerSettings::default();
        Ok(Self {
            acceptor: MtlsAcceptor::new(Arc::new(config)),
            handshake_timeout: defaults.handshake_timeout,
            grace_period: defaults.grace_period,
        })
    }

    /// Creates a server from role settings: `AllowList` when `settings.allow`
    /// names clients, `AllowAny` otherwise.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidIdentity`] if an allow-list entry is not a
    /// SPIFFE ID, or as [`Server::new`] does.
    pub fn from_settings(source: IdentitySource, settings: &ServerSettings) -> Result<Self> {
        let server = if settings.allow.is_empty() {
            Self::new(source, policy::allow_any())?
        } else {
            let allowed = policy::allow_list(&settings.allow)?;
            info!("Accepting clients: {}", settings.allow.join(", "));
            Self::new(source, allowed)?
        };
        Ok(server
            .handshake_timeout(settings.handshake_timeout)
            .grace_period(settings.grace_period))
    }

    /// Upper bound on a single TLS handshake.
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// How long in-flight connections may finish after shutdown starts.
    #[must_use]
    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Accepts connections on `listener` until `shutdown` is cancelled, then
    /// drains in-flight connections for at most the grace period.
    ///
    /// # Errors
    ///
    /// Per-connection failures are logged, not returned; this currently always
    /// returns `Ok`.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let acceptor = self.acceptor.clone();
                        let handshake_timeout = self.handshake_timeout;
                        let shutdown = shutdown.clone();
                        connections.spawn(async move {
                            if let Err(e) =
                                handle_connection(acceptor, stream, remote, handshake_timeout, shutdown).await
                            {
                                warn!("Connection from {remote} failed: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Failed accepting connection: {e}");
                        if !pause_after_accept_error(&shutdown).await {
                            break;
                        }
                    }
                },

                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Connection task failed: {e}");
                    }
                }
            }
        }

        if !connections.is_empty() {
            info!("Draining {} connection(s)", connections.len());
        }
        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(self.grace_period, drain).await.is_err() {
            warn!(
                "Grace period of {:?} elapsed; aborting {} connection(s)",
                self.grace_period,
                connections.len()
            );
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }

        Ok(())
    }
}

/// Waits out the pause after a failed accept. Returns `false` if shutdown
/// started meanwhile.
async fn pause_after_accept_error(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        () = shutdown.cancelled() => false,
        () = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => true,
    }
}

async fn handle_connection(
    acceptor: MtlsAcceptor,
    stream: TcpStream,
    remote: SocketAddr,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let (tls_stream, peer) = tokio::time::timeout(handshake_timeout, acceptor.accept(stream))
        .await
        .map_err(|_| Error::HandshakeTimeout(handshake_timeout))??;

    debug!("Accepted connection: remote={remote}, peer={peer}");

    let peer_id: Arc<str> = Arc::from(peer.to_string());
    let service = service_fn(move |request: Request<Incoming>| {
        let peer_id = Arc::clone(&peer_id);
        async move { Ok::<_, Infallible>(greet(&peer_id, &request)) }
    });

    let conn = http1::Builder::new().serve_connection(TokioIo::new(tls_stream), service);
    tokio::pin!(conn);

    tokio::select! {
        res = conn.as_mut() => res?,
        () = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await?;
        }
    }
    Ok(())
}

fn greet(peer_id: &str, request: &Request<Incoming>) -> Response<Full<Bytes>> {
    debug!("{} {} from {peer_id}", request.method(), request.uri());

    match greeting(peer_id, OffsetDateTime::now_utc()) {
        Ok(body) => text_response(StatusCode::OK, body),
        Err(e) => {
            warn!("Failed formatting timestamp: {e}");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

/// Body returned to an authenticated peer.
pub(crate) fn greeting(
    peer_id: &str,
    now: OffsetDateTime,
) -> std::result::Result<String, time::error::Format> {
    let now = now.format(&Rfc3339)?;
    Ok(format!("Hello, {peer_id}! The current time is {now}."))
}

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Runs the server role until `shutdown` is cancelled.
///
/// Opens the identity source at `settings.socket`, binds the listen address and
/// serves. See [`run_server_from`].
///
/// # Errors
///
/// As [`run_server_from`].
pub async fn run_server(settings: ServerSettings, shutdown: CancellationToken) -> Result<()> {
    let builder = IdentitySource::builder().endpoint(settings.socket.clone());
    run_server_from(builder, &settings, shutdown).await
}

/// Runs the server role with the identity source built from `builder`.
///
/// Cancelling `shutdown` while waiting for the first document returns `Ok`
/// without binding anything.
///
/// # Errors
///
/// Fails if the identity source cannot be opened, or as [`run_server_with`].
pub async fn run_server_from(
    builder: IdentitySourceBuilder,
    settings: &ServerSettings,
    shutdown: CancellationToken,
) -> Result<()> {
    match open_until_shutdown(builder, settings.ready_timeout, &shutdown).await? {
        Some(source) => run_server_with(source, settings, shutdown).await,
        None => Ok(()),
    }
}

/// Runs the server role on an already opened `source` and closes it when done.
///
/// # Errors
///
/// Fails if the source holds no document, an allow-list entry is not a SPIFFE
/// ID, or the address cannot be bound. The source is closed in every case.
pub async fn run_server_with(
    source: IdentitySource,
    settings: &ServerSettings,
    shutdown: CancellationToken,
) -> Result<()> {
    let result = serve_with(&source, settings, shutdown).await;
    source.close().await;
    result
}

async fn serve_with(
    source: &IdentitySource,
    settings: &ServerSettings,
    shutdown: CancellationToken,
) -> Result<()> {
    let local = source.current()?;
    info!("Server SPIFFE ID: {}", local.spiffe_id());

    let server = Server::from_settings(source.clone(), settings)?;

    let listener = TcpListener::bind(&settings.address)
        .await
        .map_err(|source| Error::Bind {
            address: settings.address.clone(),
            source,
        })?;
    let addr = listener.local_addr()?;
    info!("Listening on https://{addr}");

    server.serve(listener, shutdown).await
}
