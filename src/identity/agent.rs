//! Connections to the local identity agent.

use super::document::IdentityDocument;
use super::errors::AgentError;
use crate::prelude::debug;
use async_stream::stream;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt as _};
use rustls::pki_types::CertificateDer;
use spiffe::workload_api::x509_context::X509Context;
use spiffe::WorkloadApiClient;
use std::collections::BTreeMap;

/// Stream of identity documents pushed by an agent session.
///
/// An `Err` item or the end of the stream ends the session.
pub type DocumentStream = BoxStream<'static, Result<IdentityDocument, AgentError>>;

/// A local identity agent the [`IdentitySource`](super::IdentitySource) talks to.
///
/// `connect` opens one session. The source calls it again, with backoff, when a
/// session ends after the first document was received.
pub trait IdentityAgent: Send + Sync + 'static {
    /// Opens a session and returns the documents pushed over it.
    fn connect(&self) -> BoxFuture<'_, Result<DocumentStream, AgentError>>;
}

impl<A: IdentityAgent + ?Sized> IdentityAgent for std::sync::Arc<A> {
    fn connect(&self) -> BoxFuture<'_, Result<DocumentStream, AgentError>> {
        (**self).connect()
    }
}

/// SPIFFE Workload API agent reached over a local socket.
///
/// Each X.509 context pushed by the agent becomes one [`IdentityDocument`]
/// built from the default SVID and the bundle of its trust domain.
#[derive(Debug, Clone)]
pub struct WorkloadApiAgent {
    endpoint: String,
}

impl WorkloadApiAgent {
    /// Creates an agent for `endpoint`, e.g. `unix:///tmp/agent.sock`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    /// The configured endpoint address.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl IdentityAgent for WorkloadApiAgent {
    fn connect(&self) -> BoxFuture<'_, Result<DocumentStream, AgentError>> {
        Box::pin(async move {
            let client = WorkloadApiClient::new_from_path(&self.endpoint)
                .await
                .map_err(|e| AgentError::Connect(format!("{}: {e}", self.endpoint)))?;
            debug!("connected to Workload API at {}", self.endpoint);
            Ok(x509_documents(client).boxed())
        })
    }
}

fn x509_documents(
    mut client: WorkloadApiClient,
) -> impl Stream<Item = Result<IdentityDocument, AgentError>> + Send + 'static {
    stream! {
        let contexts = match client.stream_x509_contexts().await {
            Ok(contexts) => contexts,
            Err(e) => {
                yield Err(AgentError::Stream(e.to_string()));
                return;
            }
        };
        futures::pin_mut!(contexts);

        while let Some(item) = contexts.next().await {
            yield item
                .map_err(|e| AgentError::Stream(e.to_string()))
                .and_then(|ctx| document_from_context(&ctx));
        }
    }
}

fn document_from_context(ctx: &X509Context) -> Result<IdentityDocument, AgentError> {
    let svid = ctx
        .default_svid()
        .ok_or_else(|| AgentError::Document("X.509 context has no SVID".into()))?;

    let trust_domain = svid.spiffe_id().trust_domain().clone();
    let bundle = ctx.bundle_set().get_bundle(&trust_domain).ok_or_else(|| {
        AgentError::Document(format!("X.509 context has no bundle for {trust_domain}"))
    })?;

    let cert_chain = svid
        .cert_chain()
        .iter()
        .map(|c| CertificateDer::from(c.content().to_vec()))
        .collect();

    let roots = bundle
        .authorities()
        .iter()
        .map(|c| CertificateDer::from(c.content().to_vec()))
        .collect();

    IdentityDocument::new(
        cert_chain,
        svid.private_key().content().to_vec(),
        BTreeMap::from([(trust_domain, roots)]),
    )
    .map_err(|e| AgentError::Document(e.to_string()))
}
