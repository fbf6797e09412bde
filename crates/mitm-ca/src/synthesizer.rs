use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use time::OffsetDateTime;
use x509_parser::parse_x509_certificate;

use crate::authority::{LeafTemplate, RootAuthority};
use crate::clock::{checked_earlier, checked_later, Clock};
use crate::config::{CertificateAuthorityConfig, KeyAlgorithm};
use crate::host_key::HostKey;
use crate::CaError;

/// A signed leaf, its chain and its private key. Immutable once built.
pub struct SyntheticCertificate {
    host_key: HostKey,
    chain: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
    certified_key: Arc<CertifiedKey>,
    serial: Vec<u8>,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

impl fmt::Debug for SyntheticCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyntheticCertificate")
            .field("host_key", &self.host_key)
            .field("serial", &hex_serial(&self.serial))
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

impl SyntheticCertificate {
    pub fn host_key(&self) -> &HostKey {
        &self.host_key
    }

    /// `[leaf, root]`, in presentation order.
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.chain[0]
    }

    pub fn private_key(&self) -> &PrivateKeyDer<'static> {
        &self.private_key
    }

    /// Chain and signing key preloaded for rustls certificate resolution.
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified_key)
    }

    pub fn serial(&self) -> &[u8] {
        &self.serial
    }

    pub fn serial_hex(&self) -> String {
        hex_serial(&self.serial)
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }
}

/// Mints leaf certificates for host keys, signed by one root.
#[derive(Debug)]
pub struct LeafSynthesizer {
    authority: Arc<RootAuthority>,
    key_algorithm: KeyAlgorithm,
    max_validity: Duration,
    clock_skew_allowance: Duration,
    clock: Arc<dyn Clock>,
}

impl LeafSynthesizer {
    pub fn new(
        authority: Arc<RootAuthority>,
        config: &CertificateAuthorityConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            authority,
            key_algorithm: config.leaf_key_algorithm,
            max_validity: config.max_leaf_validity(),
            clock_skew_allowance: config.clock_skew_allowance(),
            clock,
        }
    }

    pub fn authority(&self) -> &Arc<RootAuthority> {
        &self.authority
    }

    /// Generates a key pair and a leaf covering every name in `host_key`.
    ///
    /// CPU-bound; callers on an async runtime should run it on the blocking
    /// pool.
    pub fn synthesize(&self, host_key: &HostKey) -> Result<SyntheticCertificate, CaError> {
        let now = self.clock.now();
        let root_not_before = self.authority.not_before();
        let root_not_after = self.authority.not_after();
        if root_not_before > now {
            return Err(CaError::Signing(format!(
                "root certificate is not valid until {root_not_before}"
            )));
        }
        let not_before = checked_earlier(now, self.clock_skew_allowance)
            .map_or(root_not_before, |start| start.max(root_not_before));
        let not_after = checked_later(now, self.max_validity)
            .map_or(root_not_after, |end| end.min(root_not_after));
        if not_after <= now {
            return Err(CaError::Signing(format!(
                "root certificate expires at {} and cannot cover new leaves",
                self.authority.not_after()
            )));
        }

        let subject_alt_names = host_key
            .names()
            .iter()
            .map(|name| name.to_san())
            .collect::<Result<Vec<_>, _>>()?;
        let leaf_key = self.key_algorithm.generate_key_pair()?;

        let leaf_der = self.authority.sign(&LeafTemplate {
            common_name: host_key.primary().to_string(),
            subject_alt_names,
            not_before,
            not_after,
            public_key: &leaf_key,
        })?;
        let (serial, not_before, not_after) = read_issued_attributes(&leaf_der)?;

        let private_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        let chain = vec![leaf_der, self.authority.certificate_der().clone()];
        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&private_key)
            .map_err(|error| CaError::Signing(format!("leaf key unusable for TLS: {error}")))?;
        let certified_key = Arc::new(CertifiedKey::new(chain.clone(), signing_key));

        tracing::debug!(
            host = %host_key,
            serial = %hex_serial(&serial),
            %not_after,
            algorithm = self.key_algorithm.as_str(),
            "issued leaf certificate"
        );

        Ok(SyntheticCertificate {
            host_key: host_key.clone(),
            chain,
            private_key,
            certified_key,
            serial,
            not_before,
            not_after,
        })
    }
}

fn read_issued_attributes(
    leaf_der: &CertificateDer<'_>,
) -> Result<(Vec<u8>, OffsetDateTime, OffsetDateTime), CaError> {
    let (_, leaf) = parse_x509_certificate(leaf_der.as_ref())
        .map_err(|error| CaError::Signing(format!("issued leaf does not parse: {error}")))?;
    Ok((
        leaf.raw_serial().to_vec(),
        leaf.validity().not_before.to_datetime(),
        leaf.validity().not_after.to_datetime(),
    ))
}

fn hex_serial(serial: &[u8]) -> String {
    serial.iter().map(|byte| format!("{byte:02x}")).collect()
}
