//! Test PKI built with `rcgen`.

#![allow(clippy::unwrap_used)]

use crate::identity::IdentityDocument;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::CertificateDer;
use spiffe::TrustDomain;
use std::collections::BTreeMap;

/// A self-signed root acting as the trust anchor of one trust domain.
pub(crate) struct TestCa {
    trust_domain: TrustDomain,
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl TestCa {
    pub(crate) fn new(trust_domain: &str) -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, format!("{trust_domain} root"));
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let cert = params.self_signed(&key).unwrap();

        Self {
            trust_domain: TrustDomain::new(trust_domain).unwrap(),
            cert,
            key,
        }
    }

    pub(crate) fn root(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    pub(crate) fn bundles(&self) -> BTreeMap<TrustDomain, Vec<CertificateDer<'static>>> {
        BTreeMap::from([(self.trust_domain.clone(), vec![self.root()])])
    }

    pub(crate) fn issue(&self, uri: &str) -> (Vec<CertificateDer<'static>>, Vec<u8>) {
        self.issue_with_sans(vec![SanType::URI(Ia5String::try_from(uri).unwrap())])
    }

    pub(crate) fn issue_without_uri(&self) -> (Vec<CertificateDer<'static>>, Vec<u8>) {
        self.issue_with_sans(vec![SanType::DnsName(
            Ia5String::try_from("workload.example.org").unwrap(),
        )])
    }

    fn issue_with_sans(&self, sans: Vec<SanType>) -> (Vec<CertificateDer<'static>>, Vec<u8>) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "workload");
        params.distinguished_name = dn;
        params.subject_alt_names = sans;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
        (vec![cert.der().clone()], key.serialize_der())
    }

    pub(crate) fn document(&self, uri: &str) -> IdentityDocument {
        let (chain, key) = self.issue(uri);
        IdentityDocument::new(chain, key, self.bundles()).unwrap()
    }
}
