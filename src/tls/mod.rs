//! rustls configurations backed by an [`IdentitySource`](crate::IdentitySource).
//!
//! [`mtls_server`] and [`mtls_client`] build configurations that present the
//! current identity document, verify peers against the trust bundle of their
//! trust domain and run an [`AuthorizationPolicy`](crate::policy::AuthorizationPolicy)
//! inside the handshake. [`MtlsAcceptor`] and [`MtlsConnector`] drive the
//! handshake over Tokio and hand back the peer identity.

mod client;
mod material;
mod server;
mod stream;
mod verifier;
mod watcher;

pub use client::{mtls_client, ClientConfigBuilder};
pub use server::{mtls_server, ServerConfigBuilder};
pub use stream::{MtlsAcceptor, MtlsConnector};
