use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use std::sync::{Arc, OnceLock};

/// Installs the compiled-in rustls crypto provider as the process default.
///
/// Idempotent. When the application already installed a provider, that one wins.
pub(crate) fn ensure_crypto_provider_installed() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let _ = crypto_provider().install_default();
    });
}

/// Returns the process default provider, installing ours first if needed.
pub(crate) fn default_provider() -> Option<Arc<CryptoProvider>> {
    ensure_crypto_provider_installed();
    CryptoProvider::get_default().cloned()
}

/// Signature algorithms used to check peer chains and handshake signatures.
pub(crate) fn signature_algorithms() -> Option<WebPkiSupportedAlgorithms> {
    default_provider().map(|p| p.signature_verification_algorithms)
}

#[cfg(feature = "ring")]
fn crypto_provider() -> CryptoProvider {
    rustls::crypto::ring::default_provider()
}

#[cfg(feature = "aws-lc-rs")]
fn crypto_provider() -> CryptoProvider {
    rustls::crypto::aws_lc_rs::default_provider()
}
