use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::host_key::HostKey;
use crate::CaError;

/// Upper bound for every duration-valued setting (100 years).
const MAX_DURATION_SECONDS: u64 = 100 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl TlsVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tls12 => "tls1.2",
            Self::Tls13 => "tls1.3",
        }
    }

    fn rustls_version(self) -> &'static rustls::SupportedProtocolVersion {
        match self {
            Self::Tls12 => &rustls::version::TLS12,
            Self::Tls13 => &rustls::version::TLS13,
        }
    }
}

/// Protocol versions between `min` and `max` inclusive, newest first.
pub(crate) fn protocol_versions(
    min: TlsVersion,
    max: TlsVersion,
) -> Result<Vec<&'static rustls::SupportedProtocolVersion>, CaError> {
    if min > max {
        return Err(CaError::InvalidConfiguration(format!(
            "min TLS version {} is newer than max TLS version {}",
            min.as_str(),
            max.as_str()
        )));
    }
    Ok([TlsVersion::Tls13, TlsVersion::Tls12]
        .into_iter()
        .filter(|version| *version >= min && *version <= max)
        .map(TlsVersion::rustls_version)
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAlgorithm {
    EcdsaP256,
    EcdsaP384,
    Ed25519,
    Rsa2048,
}

impl KeyAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EcdsaP256 => "ecdsa_p256",
            Self::EcdsaP384 => "ecdsa_p384",
            Self::Ed25519 => "ed25519",
            Self::Rsa2048 => "rsa2048",
        }
    }

    pub(crate) fn signature_algorithm(self) -> &'static rcgen::SignatureAlgorithm {
        match self {
            Self::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            Self::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
            Self::Ed25519 => &rcgen::PKCS_ED25519,
            Self::Rsa2048 => &rcgen::PKCS_RSA_SHA256,
        }
    }

    pub(crate) fn generate_key_pair(self) -> Result<rcgen::KeyPair, CaError> {
        rcgen::KeyPair::generate_for(self.signature_algorithm()).map_err(|error| {
            CaError::KeyGeneration(format!("{} key generation failed: {error}", self.as_str()))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateAuthorityConfig {
    pub min_tls_version: TlsVersion,
    pub max_tls_version: TlsVersion,
    pub max_leaf_validity_seconds: u64,
    pub max_cache_entries: usize,
    pub cache_entry_ttl_seconds: u64,
    pub expiry_safety_margin_seconds: u64,
    pub clock_skew_allowance_seconds: u64,
    pub synthesis_wait_timeout_ms: u64,
    pub leaf_key_algorithm: KeyAlgorithm,
    /// Host identity used when the ClientHello carries no SNI.
    pub default_host: Option<String>,
    /// Serve `a.b.example.com` with a `*.b.example.com` leaf.
    ///
    /// Collapsing has no public-suffix list: `a.co.uk` becomes `*.co.uk`,
    /// which browsers reject. Leave this off when intercepting such hosts.
    pub wildcard_leaves: bool,
}

impl Default for CertificateAuthorityConfig {
    fn default() -> Self {
        Self {
            min_tls_version: TlsVersion::Tls12,
            max_tls_version: TlsVersion::Tls13,
            max_leaf_validity_seconds: 365 * 24 * 60 * 60,
            max_cache_entries: 1024,
            cache_entry_ttl_seconds: 24 * 60 * 60,
            expiry_safety_margin_seconds: 60 * 60,
            clock_skew_allowance_seconds: 60 * 60,
            synthesis_wait_timeout_ms: 10_000,
            leaf_key_algorithm: KeyAlgorithm::EcdsaP256,
            default_host: None,
            wildcard_leaves: false,
        }
    }
}

impl CertificateAuthorityConfig {
    pub fn validate(&self) -> Result<(), CaError> {
        protocol_versions(self.min_tls_version, self.max_tls_version)?;

        for (name, seconds) in [
            ("max_leaf_validity_seconds", self.max_leaf_validity_seconds),
            ("cache_entry_ttl_seconds", self.cache_entry_ttl_seconds),
            ("expiry_safety_margin_seconds", self.expiry_safety_margin_seconds),
            ("clock_skew_allowance_seconds", self.clock_skew_allowance_seconds),
        ] {
            if seconds > MAX_DURATION_SECONDS {
                return Err(CaError::InvalidConfiguration(format!(
                    "{name} must not exceed {MAX_DURATION_SECONDS} seconds"
                )));
            }
        }

        if self.max_leaf_validity_seconds == 0 {
            return Err(CaError::InvalidConfiguration(
                "max_leaf_validity_seconds must be greater than zero".to_string(),
            ));
        }
        if self.max_cache_entries == 0 {
            return Err(CaError::InvalidConfiguration(
                "max_cache_entries must be greater than zero".to_string(),
            ));
        }
        if self.cache_entry_ttl_seconds == 0 {
            return Err(CaError::InvalidConfiguration(
                "cache_entry_ttl_seconds must be greater than zero".to_string(),
            ));
        }
        if self.synthesis_wait_timeout_ms == 0 {
            return Err(CaError::InvalidConfiguration(
                "synthesis_wait_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.expiry_safety_margin_seconds >= self.max_leaf_validity_seconds {
            return Err(CaError::InvalidConfiguration(
                "expiry_safety_margin_seconds must be shorter than max_leaf_validity_seconds"
                    .to_string(),
            ));
        }
        if let Some(default_host) = &self.default_host {
            HostKey::single(default_host).map_err(|error| {
                CaError::InvalidConfiguration(format!("default_host is unusable: {error}"))
            })?;
        }
        Ok(())
    }

    pub fn max_leaf_validity(&self) -> Duration {
        Duration::from_secs(self.max_leaf_validity_seconds)
    }

    pub fn cache_entry_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_entry_ttl_seconds)
    }

    pub fn expiry_safety_margin(&self) -> Duration {
        Duration::from_secs(self.expiry_safety_margin_seconds)
    }

    pub fn clock_skew_allowance(&self) -> Duration {
        Duration::from_secs(self.clock_skew_allowance_seconds)
    }

    pub fn synthesis_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.synthesis_wait_timeout_ms)
    }
}
