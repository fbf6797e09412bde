use std::sync::Arc;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ServerConfig, SupportedProtocolVersion};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::LazyConfigAcceptor;

use crate::authority::RootAuthority;
use crate::cache::{CacheMetricsSnapshot, CertificateCache};
use crate::clock::{Clock, SystemClock};
use crate::config::{protocol_versions, CertificateAuthorityConfig};
use crate::host_key::{HostKey, HostName};
use crate::synthesizer::{LeafSynthesizer, SyntheticCertificate};
use crate::trust_store::default_crypto_provider;
use crate::CaError;

/// Composition root handed to the downstream handshake layer.
///
/// One instance per proxy; share it behind an `Arc` across connection tasks.
#[derive(Debug)]
pub struct MitmConfig {
    config: CertificateAuthorityConfig,
    synthesizer: Arc<LeafSynthesizer>,
    cache: CertificateCache,
    default_host: Option<HostKey>,
    protocol_versions: Vec<&'static SupportedProtocolVersion>,
}

impl MitmConfig {
    pub fn new(
        config: CertificateAuthorityConfig,
        authority: Arc<RootAuthority>,
    ) -> Result<Self, CaError> {
        Self::with_clock(config, authority, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: CertificateAuthorityConfig,
        authority: Arc<RootAuthority>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CaError> {
        config.validate()?;
        let protocol_versions = protocol_versions(config.min_tls_version, config.max_tls_version)?;
        let default_host = config
            .default_host
            .as_deref()
            .map(HostKey::single)
            .transpose()?;
        let cache = CertificateCache::new(&config, Arc::clone(&clock))?;
        let synthesizer = Arc::new(LeafSynthesizer::new(authority, &config, clock));
        Ok(Self {
            config,
            synthesizer,
            cache,
            default_host,
            protocol_versions,
        })
    }

    /// Loads the root from PEM/DER bytes and builds the whole stack.
    pub fn from_root_material(
        config: CertificateAuthorityConfig,
        cert_bytes: &[u8],
        key_bytes: &[u8],
    ) -> Result<Self, CaError> {
        let authority = Arc::new(RootAuthority::load(cert_bytes, key_bytes)?);
        Self::new(config, authority)
    }

    pub fn config(&self) -> &CertificateAuthorityConfig {
        &self.config
    }

    pub fn authority(&self) -> &Arc<RootAuthority> {
        self.synthesizer.authority()
    }

    pub fn cache_metrics(&self) -> CacheMetricsSnapshot {
        self.cache.metrics_snapshot()
    }

    /// The cache key a request for `host` is served under.
    pub fn host_key_for(&self, host: &str) -> Result<HostKey, CaError> {
        let name = HostName::parse(host)?;
        if self.config.wildcard_leaves {
            if let Some(parent) = name.wildcard_parent() {
                return Ok(HostKey::from_name(parent));
            }
        }
        Ok(HostKey::from_name(name))
    }

    pub async fn certificate_for_host(
        &self,
        host: &str,
    ) -> Result<Arc<SyntheticCertificate>, CaError> {
        let host_key = self
            .host_key_for(host)
            .map_err(|reason| self.unavailable(host, reason))?;
        self.certificate_for_key(host_key).await
    }

    /// Like [`Self::certificate_for_host`], falling back to the configured
    /// `default_host` when the ClientHello carried no SNI.
    pub async fn certificate_for_server_name(
        &self,
        server_name: Option<&str>,
    ) -> Result<Arc<SyntheticCertificate>, CaError> {
        match (server_name, &self.default_host) {
            (Some(server_name), _) => self.certificate_for_host(server_name).await,
            (None, Some(default_host)) => self.certificate_for_key(default_host.clone()).await,
            (None, None) => Err(self.unavailable(
                "<no sni>",
                CaError::InvalidHost(
                    "client sent no server name and no default_host is configured".to_string(),
                ),
            )),
        }
    }

    /// Serves a leaf covering every name in `host_key` (multi-SAN requests).
    pub async fn certificate_for_key(
        &self,
        host_key: HostKey,
    ) -> Result<Arc<SyntheticCertificate>, CaError> {
        let synthesizer = Arc::clone(&self.synthesizer);
        let display = host_key.to_string();
        self.cache
            .get_or_create(host_key, move |host_key: &HostKey| {
                synthesizer.synthesize(host_key)
            })
            .await
            .map_err(|reason| self.unavailable(&display, reason))
    }

    /// A rustls server config presenting the leaf for `server_name`.
    pub async fn server_config_for_server_name(
        &self,
        server_name: Option<&str>,
        alpn_protocols: &[Vec<u8>],
    ) -> Result<Arc<ServerConfig>, CaError> {
        let certificate = self.certificate_for_server_name(server_name).await?;
        let mut server_config =
            ServerConfig::builder_with_provider(Arc::new(default_crypto_provider()))
                .with_protocol_versions(&self.protocol_versions)?
                .with_no_client_auth()
                .with_cert_resolver(Arc::new(IssuedCertResolver(certificate.certified_key())));
        server_config.alpn_protocols = alpn_protocols.to_vec();
        Ok(Arc::new(server_config))
    }

    /// Reads the ClientHello from `io`, selects the leaf by SNI and completes
    /// the server side of the handshake.
    pub async fn accept<IO>(
        &self,
        io: IO,
        alpn_protocols: &[Vec<u8>],
    ) -> Result<tokio_rustls::server::TlsStream<IO>, CaError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), io)
            .await
            .map_err(|error| CaError::Handshake(format!("failed to read ClientHello: {error}")))?;
        let server_name = start.client_hello().server_name().map(str::to_owned);
        let server_config = self
            .server_config_for_server_name(server_name.as_deref(), alpn_protocols)
            .await?;
        start.into_stream(server_config).await.map_err(|error| {
            CaError::Handshake(format!(
                "handshake with client for {} failed: {error}",
                server_name.as_deref().unwrap_or("<no sni>")
            ))
        })
    }

    fn unavailable(&self, host: &str, reason: CaError) -> CaError {
        tracing::warn!(host, error = %reason, "leaf certificate unavailable");
        CaError::unavailable(host, reason)
    }
}

#[derive(Debug)]
struct IssuedCertResolver(Arc<CertifiedKey>);

impl ResolvesServerCert for IssuedCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}
