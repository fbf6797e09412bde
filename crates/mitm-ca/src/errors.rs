use thiserror::Error;

/// Every failure the certificate core can report.
///
/// The enum is `Clone` so that one synthesis result can be handed to every
/// caller that waited on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaError {
    #[error("invalid root certificate material: {0}")]
    InvalidRootMaterial(String),
    #[error("leaf key generation failed: {0}")]
    KeyGeneration(String),
    #[error("certificate signing failed: {0}")]
    Signing(String),
    #[error("timed out after {waited_ms}ms waiting for certificate synthesis for {host}")]
    SynthesisTimeout { host: String, waited_ms: u64 },
    #[error("certificate unavailable for {host}: {reason}")]
    CertificateUnavailable { host: String, reason: Box<CaError> },
    #[error("invalid host name: {0}")]
    InvalidHost(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("invalid trust bundle: {0}")]
    InvalidTrustBundle(String),
    #[error("TLS config build failed: {0}")]
    TlsConfig(String),
    #[error("TLS handshake failed: {0}")]
    Handshake(String),
    #[error("certificate worker failed: {0}")]
    WorkerFailed(String),
    #[error("certificate cache lock poisoned")]
    LockPoisoned,
}

impl CaError {
    /// Unwraps `CertificateUnavailable` layers down to the originating error.
    pub fn root_cause(&self) -> &CaError {
        match self {
            Self::CertificateUnavailable { reason, .. } => reason.root_cause(),
            other => other,
        }
    }

    pub(crate) fn unavailable(host: impl Into<String>, reason: CaError) -> Self {
        Self::CertificateUnavailable {
            host: host.into(),
            reason: Box::new(reason),
        }
    }
}

impl From<rcgen::Error> for CaError {
    fn from(value: rcgen::Error) -> Self {
        Self::Signing(value.to_string())
    }
}

impl From<rustls::Error> for CaError {
    fn from(value: rustls::Error) -> Self {
        Self::TlsConfig(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::CaError;

    #[test]
    fn root_cause_unwraps_nested_unavailable_errors() {
        let error = CaError::unavailable(
            "api.example.com",
            CaError::unavailable(
                "api.example.com",
                CaError::KeyGeneration("entropy".to_string()),
            ),
        );
        assert_eq!(
            error.root_cause(),
            &CaError::KeyGeneration("entropy".to_string())
        );
        assert!(error.to_string().contains("api.example.com"));
    }
}
