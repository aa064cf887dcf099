//! The two roles of the demo.
//!
//! Both acquire an [`IdentitySource`](crate::IdentitySource) first and never
//! touch the network before it holds a document. The source is closed on
//! every exit path.

mod client;
mod server;

pub use client::{fetch_greeting, run_client, run_client_with, Greeting};
pub use server::{run_server, run_server_from, run_server_with, Server};

use crate::error::Result;
use crate::identity::{IdentitySource, IdentitySourceBuilder};
use crate::prelude::info;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Opens a source from `builder` and waits for its first document, giving up
/// as soon as `shutdown` is cancelled.
///
/// Returns `Ok(None)` on shutdown. A session opened before that is closed.
async fn open_until_shutdown(
    builder: IdentitySourceBuilder,
    ready_timeout: Duration,
    shutdown: &CancellationToken,
) -> Result<Option<IdentitySource>> {
    let source = tokio::select! {
        () = shutdown.cancelled() => return Ok(None),
        source = builder.connect() => source?,
    };

    let ready = tokio::select! {
        () = shutdown.cancelled() => None,
        ready = source.wait_ready(ready_timeout) => Some(ready),
    };

    match ready {
        Some(Ok(document)) => {
            info!("Identity source ready: spiffe_id={}", document.spiffe_id());
            Ok(Some(source))
        }
        Some(Err(e)) => {
            source.close().await;
            Err(e.into())
        }
        None => {
            info!("Shutdown requested before the identity source was ready");
            source.close().await;
            Ok(None)
        }
    }
}
