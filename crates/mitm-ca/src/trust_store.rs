use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::config::{protocol_versions, TlsVersion};
use crate::CaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamVerification {
    Verify,
    /// Accept any upstream chain and name. Handshake signatures are still checked.
    InsecureSkipVerify,
}

/// Trust policy for connections the proxy opens to origin servers.
#[derive(Debug, Clone)]
pub struct UpstreamTlsOptions {
    pub verification: UpstreamVerification,
    /// Extra trust anchors, on top of every other enabled source.
    pub trust_bundle: Vec<CertificateDer<'static>>,
    /// PEM bundle file.
    pub ca_file: Option<PathBuf>,
    /// Directory whose regular files are each a PEM bundle.
    pub ca_dir: Option<PathBuf>,
    pub system_trust: bool,
    pub bundled_roots: bool,
    pub min_tls_version: TlsVersion,
    pub max_tls_version: TlsVersion,
    pub alpn_protocols: Vec<Vec<u8>>,
}

impl Default for UpstreamTlsOptions {
    fn default() -> Self {
        Self {
            verification: UpstreamVerification::Verify,
            trust_bundle: Vec::new(),
            ca_file: None,
            ca_dir: None,
            system_trust: false,
            bundled_roots: true,
            min_tls_version: TlsVersion::Tls12,
            max_tls_version: TlsVersion::Tls13,
            alpn_protocols: vec![b"http/1.1".to_vec()],
        }
    }
}

impl UpstreamTlsOptions {
    /// Verification disabled, legacy-compatible version range.
    ///
    /// No root store is built on this path: `trust_bundle`, `ca_file`,
    /// `ca_dir`, `system_trust` and `bundled_roots` are ignored.
    pub fn insecure_skip_verify() -> Self {
        Self {
            verification: UpstreamVerification::InsecureSkipVerify,
            bundled_roots: false,
            min_tls_version: TlsVersion::Tls12,
            max_tls_version: TlsVersion::Tls12,
            ..Self::default()
        }
    }

    pub fn with_trust_bundle_pem(mut self, pem: &[u8]) -> Result<Self, CaError> {
        self.trust_bundle.extend(parse_trust_bundle(pem)?);
        Ok(self)
    }
}

pub fn build_client_config(options: &UpstreamTlsOptions) -> Result<Arc<ClientConfig>, CaError> {
    let versions = protocol_versions(options.min_tls_version, options.max_tls_version)?;
    let provider = Arc::new(default_crypto_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&versions)?;

    let mut config = match options.verification {
        UpstreamVerification::InsecureSkipVerify => {
            tracing::warn!(
                min_tls_version = options.min_tls_version.as_str(),
                max_tls_version = options.max_tls_version.as_str(),
                ignored_trust_bundle = options.trust_bundle.len(),
                ignored_ca_file = ?options.ca_file,
                ignored_ca_dir = ?options.ca_dir,
                ignored_system_trust = options.system_trust,
                ignored_bundled_roots = options.bundled_roots,
                "upstream certificate verification is disabled"
            );
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(InsecureSkipVerifyServerCertVerifier {
                    provider,
                }))
                .with_no_client_auth()
        }
        UpstreamVerification::Verify => builder
            .with_root_certificates(build_root_store(options)?)
            .with_no_client_auth(),
    };
    config.alpn_protocols = options.alpn_protocols.clone();
    Ok(Arc::new(config))
}

/// Parses every certificate in a PEM bundle; a bundle without one is rejected.
pub fn parse_trust_bundle(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, CaError> {
    let certificates = CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|error| {
            CaError::InvalidTrustBundle(format!("failed to parse PEM trust bundle: {error}"))
        })?;
    if certificates.is_empty() {
        return Err(CaError::InvalidTrustBundle(
            "trust bundle contains no certificates".to_string(),
        ));
    }
    Ok(certificates)
}

pub(crate) fn default_crypto_provider() -> CryptoProvider {
    CryptoProvider::get_default()
        .map(|provider| (**provider).clone())
        .unwrap_or_else(rustls::crypto::aws_lc_rs::default_provider)
}

fn build_root_store(options: &UpstreamTlsOptions) -> Result<RootCertStore, CaError> {
    let mut roots = RootCertStore::empty();
    if options.bundled_roots {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    if options.system_trust {
        add_system_roots(&mut roots);
    }
    if let Some(ca_file) = &options.ca_file {
        add_bundle_file(&mut roots, ca_file)?;
    }
    if let Some(ca_dir) = &options.ca_dir {
        add_bundle_dir(&mut roots, ca_dir)?;
    }
    for certificate in &options.trust_bundle {
        add_anchor(&mut roots, certificate.clone(), "trust_bundle")?;
    }

    if roots.is_empty() {
        return Err(CaError::InvalidConfiguration(
            "upstream verification is enabled but no trust anchors are configured".to_string(),
        ));
    }
    tracing::debug!(anchors = roots.len(), "built upstream root store");
    Ok(roots)
}

fn add_system_roots(roots: &mut RootCertStore) {
    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
        tracing::warn!(error = %error, "failed to load part of the system trust store");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    if ignored > 0 {
        tracing::warn!(added, ignored, "skipped unparsable system trust anchors");
    }
}

fn add_bundle_file(roots: &mut RootCertStore, path: &Path) -> Result<(), CaError> {
    let pem = fs::read(path).map_err(|error| {
        CaError::InvalidTrustBundle(format!("failed to read {}: {error}", path.display()))
    })?;
    let certificates = parse_trust_bundle(&pem).map_err(|error| {
        CaError::InvalidTrustBundle(format!("{}: {error}", path.display()))
    })?;
    let source = path.display().to_string();
    for certificate in certificates {
        add_anchor(roots, certificate, &source)?;
    }
    Ok(())
}

fn add_bundle_dir(roots: &mut RootCertStore, dir: &Path) -> Result<(), CaError> {
    let entries = fs::read_dir(dir).map_err(|error| {
        CaError::InvalidTrustBundle(format!("failed to read {}: {error}", dir.display()))
    })?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|error| {
                CaError::InvalidTrustBundle(format!("failed to read {}: {error}", dir.display()))
            })?
            .path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    for file in files {
        add_bundle_file(roots, &file)?;
    }
    Ok(())
}

fn add_anchor(
    roots: &mut RootCertStore,
    certificate: CertificateDer<'static>,
    source: &str,
) -> Result<(), CaError> {
    roots.add(certificate).map_err(|error| {
        CaError::InvalidTrustBundle(format!("unusable trust anchor from {source}: {error}"))
    })
}

#[derive(Debug)]
struct InsecureSkipVerifyServerCertVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for InsecureSkipVerifyServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
