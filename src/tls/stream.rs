//! Tokio accept/connect helpers that report the peer identity.

use crate::error::{Error, Result};
use crate::peer::PeerIdentity;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{client, server};

/// Server-side handshake driver returning the verified client identity.
#[derive(Clone)]
pub struct MtlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

impl std::fmt::Debug for MtlsAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MtlsAcceptor").finish_non_exhaustive()
    }
}

impl MtlsAcceptor {
    /// Creates an acceptor from a server configuration.
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            inner: tokio_rustls::TlsAcceptor::from(config),
        }
    }

    /// Runs the server handshake on `stream`.
    ///
    /// The authorization policy has already accepted the client when this
    /// returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] or [`Error::NoBundle`] when this side's
    /// verifier refused the client, [`Error::Handshake`] for any other failure
    /// and [`Error::Peer`] if the client certificate cannot be parsed.
    pub async fn accept(
        &self,
        stream: TcpStream,
    ) -> Result<(server::TlsStream<TcpStream>, PeerIdentity)> {
        let tls_stream = self
            .inner
            .accept(stream)
            .await
            .map_err(Error::from_handshake)?;

        let (_io, conn) = tls_stream.get_ref();
        let peer = PeerIdentity::from_peer_certificates(conn.peer_certificates())?;

        Ok((tls_stream, peer))
    }
}

/// Client-side handshake driver returning the verified server identity.
#[derive(Clone)]
pub struct MtlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl std::fmt::Debug for MtlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MtlsConnector").finish_non_exhaustive()
    }
}

impl MtlsConnector {
    /// Creates a connector from a client configuration.
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self {
            inner: tokio_rustls::TlsConnector::from(config),
        }
    }

    /// Runs the client handshake on `stream`.
    ///
    /// `server_name` goes into SNI only; the server is identified by its SPIFFE ID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] if the policy rejected the server,
    /// [`Error::Handshake`] for chain or I/O failures.
    pub async fn connect(
        &self,
        server_name: ServerName<'static>,
        stream: TcpStream,
    ) -> Result<(client::TlsStream<TcpStream>, PeerIdentity)> {
        let tls_stream = self
            .inner
            .connect(server_name, stream)
            .await
            .map_err(Error::from_handshake)?;

        let (_io, conn) = tls_stream.get_ref();
        let peer = PeerIdentity::from_peer_certificates(conn.peer_certificates())?;

        Ok((tls_stream, peer))
    }
}
