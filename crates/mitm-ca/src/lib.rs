mod authority;
mod cache;
mod clock;
mod config;
mod errors;
mod host_key;
mod mitm;
mod synthesizer;
mod trust_store;

pub use authority::{
    generate_root_material, LeafTemplate, RootAuthority, RootIdentity, RootMaterial,
};
pub use cache::{CacheMetricsSnapshot, CertificateCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CertificateAuthorityConfig, KeyAlgorithm, TlsVersion};
pub use errors::CaError;
pub use host_key::{HostKey, HostName};
pub use mitm::MitmConfig;
pub use synthesizer::{LeafSynthesizer, SyntheticCertificate};
pub use trust_store::{
    build_client_config, parse_trust_bundle, UpstreamTlsOptions, UpstreamVerification,
};
