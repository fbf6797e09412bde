use std::fmt;
use std::path::Path;
use std::time::Duration;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::crypto::SecureRandom;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use time::OffsetDateTime;
use x509_parser::parse_x509_certificate;

use crate::config::KeyAlgorithm;
use crate::CaError;

const SERIAL_NUMBER_LEN: usize = 16;

/// Identity used when minting a fresh self-signed root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootIdentity {
    pub common_name: String,
    pub organization: String,
    pub key_algorithm: KeyAlgorithm,
    pub validity: Duration,
}

impl Default for RootIdentity {
    fn default() -> Self {
        Self {
            common_name: "mitm-ca Local Root".to_string(),
            organization: "mitm-ca".to_string(),
            key_algorithm: KeyAlgorithm::EcdsaP256,
            validity: Duration::from_secs(10 * 365 * 24 * 60 * 60),
        }
    }
}

/// PEM-encoded root certificate and key, ready for [`RootAuthority::load`].
#[derive(Clone, PartialEq, Eq)]
pub struct RootMaterial {
    pub cert_pem: String,
    pub key_pem: String,
}

impl fmt::Debug for RootMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootMaterial")
            .field("cert_pem", &self.cert_pem)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

pub fn generate_root_material(identity: &RootIdentity) -> Result<RootMaterial, CaError> {
    if identity.common_name.trim().is_empty() {
        return Err(CaError::InvalidConfiguration(
            "root common_name must not be empty".to_string(),
        ));
    }

    let key = identity.key_algorithm.generate_key_pair()?;
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::from_secs(24 * 60 * 60);
    params.not_after = now + identity.validity;

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, identity.common_name.clone());
    if !identity.organization.trim().is_empty() {
        distinguished_name.push(DnType::OrganizationName, identity.organization.clone());
    }
    params.distinguished_name = distinguished_name;

    let cert = params.self_signed(&key)?;
    Ok(RootMaterial {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

/// Not-yet-signed leaf description handed to [`RootAuthority::sign`].
pub struct LeafTemplate<'a> {
    pub common_name: String,
    pub subject_alt_names: Vec<SanType>,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    pub public_key: &'a KeyPair,
}

/// The root certificate and private key every leaf is signed with.
///
/// Immutable after [`RootAuthority::load`]; `sign` takes `&self` and may run
/// concurrently from any number of threads.
pub struct RootAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
    cert_pem: Option<String>,
    subject: String,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    secure_random: &'static dyn SecureRandom,
}

impl fmt::Debug for RootAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootAuthority")
            .field("subject", &self.subject)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

impl RootAuthority {
    /// Loads a root from PEM or DER certificate and key bytes.
    ///
    /// Fails with [`CaError::InvalidRootMaterial`] unless the certificate is a
    /// CA, is still valid, and carries the public half of `key_bytes`.
    pub fn load(cert_bytes: &[u8], key_bytes: &[u8]) -> Result<Self, CaError> {
        if cert_bytes.is_empty() {
            return Err(invalid("certificate must not be empty"));
        }
        if key_bytes.is_empty() {
            return Err(invalid("private key must not be empty"));
        }

        let cert_is_pem = looks_like_pem(cert_bytes);
        let cert_der = if cert_is_pem {
            CertificateDer::from_pem_slice(cert_bytes)
                .map_err(|error| invalid(format!("failed to parse certificate PEM: {error}")))?
        } else {
            CertificateDer::from(cert_bytes.to_vec())
        };
        let key_der = if looks_like_pem(key_bytes) {
            PrivateKeyDer::from_pem_slice(key_bytes)
                .map_err(|error| invalid(format!("failed to parse private key PEM: {error}")))?
        } else {
            PrivateKeyDer::try_from(key_bytes.to_vec())
                .map_err(|error| invalid(format!("failed to parse private key DER: {error}")))?
        };
        let key_pair = KeyPair::try_from(&key_der)
            .map_err(|error| invalid(format!("unsupported private key: {error}")))?;

        let (_, parsed) = parse_x509_certificate(cert_der.as_ref())
            .map_err(|error| invalid(format!("failed to parse certificate: {error}")))?;

        let is_ca = parsed
            .basic_constraints()
            .map_err(|error| invalid(format!("malformed basicConstraints: {error}")))?
            .is_some_and(|extension| extension.value.ca);
        if !is_ca {
            return Err(invalid("certificate is not a certificate authority (CA=false)"));
        }

        if parsed.public_key().subject_public_key.data.as_ref() != key_pair.public_key_raw() {
            return Err(invalid("private key does not match certificate public key"));
        }

        let not_before = parsed.validity().not_before.to_datetime();
        let not_after = parsed.validity().not_after.to_datetime();
        if not_after <= OffsetDateTime::now_utc() {
            return Err(invalid(format!("root certificate expired at {not_after}")));
        }
        let subject = parsed.subject().to_string();
        if not_before > OffsetDateTime::now_utc() {
            tracing::warn!(
                subject = %subject,
                %not_before,
                "root certificate is not valid yet; leaves cannot be issued before then"
            );
        }

        let issuer = Issuer::from_ca_cert_der(&cert_der, key_pair)
            .map_err(|error| invalid(format!("failed to read issuer metadata: {error}")))?;
        let cert_pem = if cert_is_pem {
            String::from_utf8(cert_bytes.to_vec()).ok()
        } else {
            None
        };

        tracing::info!(subject = %subject, %not_after, "loaded root certificate authority");

        Ok(Self {
            issuer,
            cert_der,
            cert_pem,
            subject,
            not_before,
            not_after,
            secure_random: rustls::crypto::aws_lc_rs::default_provider().secure_random,
        })
    }

    pub fn load_from_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, CaError> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();
        let cert = std::fs::read(cert_path).map_err(|error| {
            invalid(format!("failed to read {}: {error}", cert_path.display()))
        })?;
        let key = std::fs::read(key_path)
            .map_err(|error| invalid(format!("failed to read {}: {error}", key_path.display())))?;
        Self::load(&cert, &key)
    }

    pub fn from_material(material: &RootMaterial) -> Result<Self, CaError> {
        Self::load(material.cert_pem.as_bytes(), material.key_pem.as_bytes())
    }

    /// Signs `template` with the root key and returns the DER certificate.
    pub fn sign(&self, template: &LeafTemplate<'_>) -> Result<CertificateDer<'static>, CaError> {
        if template.not_after <= template.not_before {
            return Err(CaError::Signing(format!(
                "empty validity window {} .. {}",
                template.not_before, template.not_after
            )));
        }

        let mut params = CertificateParams::default();
        // ExplicitNoCa makes rcgen emit basicConstraints CA=false and the
        // subject key identifier.
        params.is_ca = IsCa::ExplicitNoCa;
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.not_before = template.not_before;
        params.not_after = template.not_after;
        params.serial_number = Some(self.next_serial_number()?);
        params.subject_alt_names = template.subject_alt_names.clone();

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, template.common_name.clone());
        params.distinguished_name = distinguished_name;

        let cert = params.signed_by(template.public_key, &self.issuer)?;
        Ok(cert.der().clone())
    }

    pub fn certificate_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// The root in PEM form, when it was loaded from PEM.
    pub fn certificate_pem(&self) -> Option<&str> {
        self.cert_pem.as_deref()
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    fn next_serial_number(&self) -> Result<SerialNumber, CaError> {
        let mut bytes = [0_u8; SERIAL_NUMBER_LEN];
        self.secure_random
            .fill(&mut bytes)
            .map_err(|_| CaError::Signing("serial number entropy unavailable".to_string()))?;
        // positive, and no leading zero octet so the encoded length stays fixed
        bytes[0] &= 0x7f;
        if bytes[0] == 0 {
            bytes[0] = 0x01;
        }
        Ok(SerialNumber::from_slice(&bytes))
    }
}

fn looks_like_pem(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .is_some_and(|start| bytes[start..].starts_with(b"-----BEGIN"))
}

fn invalid(reason: impl Into<String>) -> CaError {
    CaError::InvalidRootMaterial(reason.into())
}
