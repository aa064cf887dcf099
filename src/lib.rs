#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

//! # spiffe-mtls-demo
//!
//! A server and a client that authenticate each other over mutual TLS using
//! SPIFFE X.509 identities fetched from the SPIFFE Workload API.
//!
//! * [`IdentitySource`] keeps this process's identity document current.
//! * [`policy`] decides which peer identities may complete a handshake.
//! * [`tls`] turns both into `rustls` configurations.
//! * [`runner`] runs the server and client roles over HTTP/1.1.
//! * [`peer`] extracts the identity URI from a certificate.
//!
//! ## Example
//!
//! ```no_run
//! use spiffe_mtls_demo::{policy, runner, IdentitySource};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let source = IdentitySource::open("unix:///tmp/agent.sock").await?;
//! let greeting = runner::fetch_greeting(
//!     &source,
//!     "localhost:8443",
//!     "spiffe://example.org/server",
//!     Duration::from_secs(10),
//! )
//! .await?;
//! println!("{}", greeting.body);
//! source.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature flags
//!
//! Exactly **one** `rustls` crypto provider must be enabled:
//!
//! * `ring` (default)
//! * `aws-lc-rs`
//!
//! Logging goes through `log` (`logging`, default) or `tracing` (`tracing`).

#[cfg(all(feature = "ring", feature = "aws-lc-rs"))]
compile_error!("Enable only one crypto provider feature: `ring` or `aws-lc-rs`.");

#[cfg(not(any(feature = "ring", feature = "aws-lc-rs")))]
compile_error!("Enable one crypto provider feature: `ring` (default) or `aws-lc-rs`.");

pub mod config;
pub mod identity;
pub mod peer;
pub mod policy;
pub mod runner;
pub mod tls;

mod crypto;
mod error;

mod observability;
mod prelude;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use identity::{IdentityDocument, IdentitySource, IdentitySourceError};
pub use peer::{PeerIdentity, PeerIdentityError};
pub use policy::{AllowAny, AllowExact, AllowList, AuthorizationPolicy, Decision};
