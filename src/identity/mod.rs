//! Identity source: the process's current identity document, kept fresh.
//!
//! An [`IdentitySource`] opens a session with an [`IdentityAgent`] (the SPIFFE
//! Workload API by default, or an in-process [`StaticAgent`]) and publishes
//! every document the agent pushes as an immutable snapshot.
//!
//! # Example
//!
//! ```no_run
//! use spiffe_mtls_demo::IdentitySource;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let source = IdentitySource::open("unix:///tmp/agent.sock").await?;
//! let document = source.current()?;
//! println!("{}", document.spiffe_id());
//!
//! let mut updates = source.updated();
//! let generation = updates.changed().await?;
//! println!("rotated to generation {generation}");
//!
//! source.close().await;
//! # Ok(())
//! # }
//! ```

mod agent;
mod builder;
mod document;
mod errors;
mod source;
mod static_agent;
mod supervisor;

pub use agent::{DocumentStream, IdentityAgent, WorkloadApiAgent};
pub use builder::{
    IdentitySourceBuilder, ReconnectConfig, DEFAULT_AGENT_SOCKET, ENDPOINT_SOCKET_ENV,
};
pub use document::IdentityDocument;
pub use errors::{AgentError, DocumentError, IdentitySourceError};
pub use source::{IdentitySource, IdentityUpdates};
pub use static_agent::StaticAgent;
