#![allow(dead_code, clippy::unwrap_used)]

use rcgen::{BasicConstraints, CertificateParams, DnType, Ia5String, IsCa, KeyPair, SanType};
use spiffe::TrustDomain;
use spiffe_mtls_demo::config::ServerSettings;
use spiffe_mtls_demo::identity::StaticAgent;
use spiffe_mtls_demo::runner::Server;
use spiffe_mtls_demo::{AuthorizationPolicy, IdentityDocument, IdentitySource};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const SERVER_ID: &str = "spiffe://example.org/server";
pub const CLIENT_ID: &str = "spiffe://example.org/client";
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Root certificate authority of one trust domain.
///
/// Leaf certificates carry only the SPIFFE ID URI SAN; usage extensions are
/// left out, which webpki treats as unrestricted.
pub struct Ca {
    trust_domain: TrustDomain,
    cert: rcgen::Certificate,
    key: KeyPair,
}

fn params_named(common_name: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params
}

impl Ca {
    pub fn new(trust_domain: &str) -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = params_named(&format!("{trust_domain} root"));
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).unwrap();
        Self {
            trust_domain: TrustDomain::new(trust_domain).unwrap(),
            cert,
            key,
        }
    }

    pub fn document(&self, spiffe_id: &str) -> IdentityDocument {
        self.document_trusting(spiffe_id, self)
    }

    /// Issues `spiffe_id` from this CA with `trusted`'s root as the bundle.
    pub fn document_trusting(&self, spiffe_id: &str, trusted: &Ca) -> IdentityDocument {
        let key = KeyPair::generate().unwrap();
        let mut params = params_named("workload");
        params.subject_alt_names = vec![SanType::URI(Ia5String::try_from(spiffe_id).unwrap())];
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();

        let bundles = BTreeMap::from([(
            trusted.trust_domain.clone(),
            vec![trusted.cert.der().clone()],
        )]);
        IdentityDocument::new(vec![cert.der().clone()], key.serialize_der(), bundles).unwrap()
    }
}

/// Opens an identity source backed by an in-process agent.
pub async fn source(document: IdentityDocument) -> (IdentitySource, StaticAgent) {
    let agent = StaticAgent::with_document(document);
    let source = IdentitySource::builder()
        .agent(agent.clone())
        .ready_timeout(Duration::from_secs(5))
        .build()
        .await
        .unwrap();
    (source, agent)
}

/// A greeting server running in the background on a loopback port.
pub struct RunningServer {
    pub addr: SocketAddr,
    pub source: IdentitySource,
    pub agent: StaticAgent,
    shutdown: CancellationToken,
    task: JoinHandle<spiffe_mtls_demo::Result<()>>,
}

impl RunningServer {
    pub async fn start(document: IdentityDocument, policy: impl AuthorizationPolicy) -> Self {
        let (source, agent) = source(document).await;
        let server = Server::new(source.clone(), policy)
            .unwrap()
            .handshake_timeout(HANDSHAKE_TIMEOUT)
            .grace_period(Duration::from_secs(1));
        Self::launch(source, agent, server).await
    }

    pub async fn start_with_settings(document: IdentityDocument, settings: &ServerSettings) -> Self {
        let (source, agent) = source(document).await;
        let server = Server::from_settings(source.clone(), settings).unwrap();
        Self::launch(source, agent, server).await
    }

    async fn launch(source: IdentitySource, agent: StaticAgent, server: Server) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move { server.serve(listener, token).await });

        Self {
            addr,
            source,
            agent,
            shutdown,
            task,
        }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        self.task.await.unwrap().unwrap();
        self.source.close().await;
    }
}
