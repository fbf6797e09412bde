use std::fmt;
use std::net::IpAddr;

use rcgen::SanType;

use crate::CaError;

const MAX_DNS_NAME_LEN: usize = 253;
const MAX_DNS_LABEL_LEN: usize = 63;

/// One subject alternative name a leaf must cover.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HostName {
    Dns(String),
    Ip(IpAddr),
}

impl HostName {
    /// Parses and normalizes a host name: DNS names are lowercased with the
    /// trailing dot removed; IP literals are re-rendered canonically.
    pub fn parse(raw: &str) -> Result<Self, CaError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CaError::InvalidHost("host name must not be empty".to_string()));
        }

        if let Some(inner) = trimmed
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
        {
            return inner
                .parse::<IpAddr>()
                .map(|ip| Self::Ip(ip.to_canonical()))
                .map_err(|_| CaError::InvalidHost(format!("invalid bracketed IP literal: {raw}")));
        }
        let unrooted = trimmed.strip_suffix('.').unwrap_or(trimmed);
        if let Ok(ip) = unrooted.parse::<IpAddr>() {
            return Ok(Self::Ip(ip.to_canonical()));
        }

        let name = unrooted.to_ascii_lowercase();
        validate_dns_name(&name)?;
        Ok(Self::Dns(name))
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Dns(name) if name.starts_with("*."))
    }

    /// `a.b.example.com` -> `*.b.example.com`. Names too short to carry a
    /// wildcard (fewer than three labels), IPs and wildcards yield `None`.
    pub fn wildcard_parent(&self) -> Option<HostName> {
        let Self::Dns(name) = self else {
            return None;
        };
        if self.is_wildcard() {
            return None;
        }
        let (_, parent) = name.split_once('.')?;
        if parent.split('.').count() < 2 {
            return None;
        }
        Some(Self::Dns(format!("*.{parent}")))
    }

    pub(crate) fn to_san(&self) -> Result<SanType, CaError> {
        match self {
            Self::Ip(ip) => Ok(SanType::IpAddress(*ip)),
            Self::Dns(name) => name
                .as_str()
                .try_into()
                .map(SanType::DnsName)
                .map_err(|error| CaError::InvalidHost(format!("{name}: {error}"))),
        }
    }
}

impl fmt::Display for HostName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dns(name) => f.write_str(name),
            Self::Ip(ip) => write!(f, "{ip}"),
        }
    }
}

fn validate_dns_name(name: &str) -> Result<(), CaError> {
    if name.is_empty() {
        return Err(CaError::InvalidHost("host name must not be empty".to_string()));
    }
    if name.len() > MAX_DNS_NAME_LEN {
        return Err(CaError::InvalidHost(format!(
            "host name exceeds {MAX_DNS_NAME_LEN} bytes"
        )));
    }

    let mut labels = name.split('.').peekable();
    if labels.peek() == Some(&"*") {
        labels.next();
        if name.split('.').count() < 3 {
            return Err(CaError::InvalidHost(format!(
                "wildcard must sit above a registrable domain: {name}"
            )));
        }
    }

    for label in labels {
        if label.is_empty() || label.len() > MAX_DNS_LABEL_LEN {
            return Err(CaError::InvalidHost(format!("invalid DNS label in {name}")));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(CaError::InvalidHost(format!(
                "DNS label must not start or end with '-': {name}"
            )));
        }
        if !label
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_')
        {
            return Err(CaError::InvalidHost(format!(
                "unsupported character in DNS name: {name}"
            )));
        }
    }
    Ok(())
}

/// Cache key: the normalized set of names one leaf certificate covers.
///
/// The first name is the primary host (it becomes the subject CN); the rest
/// are deduplicated and sorted so equivalent requests produce equal keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostKey {
    names: Vec<HostName>,
}

impl HostKey {
    pub fn new<I, S>(hosts: I) -> Result<Self, CaError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = hosts
            .into_iter()
            .map(|host| HostName::parse(host.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        if parsed.is_empty() {
            return Err(CaError::InvalidHost(
                "host key needs at least one name".to_string(),
            ));
        }

        let primary = parsed.remove(0);
        parsed.retain(|name| *name != primary);
        parsed.sort();
        parsed.dedup();

        let mut names = Vec::with_capacity(parsed.len() + 1);
        names.push(primary);
        names.extend(parsed);
        Ok(Self { names })
    }

    pub fn single(host: &str) -> Result<Self, CaError> {
        Self::new([host])
    }

    pub(crate) fn from_name(name: HostName) -> Self {
        Self { names: vec![name] }
    }

    pub fn primary(&self) -> &HostName {
        &self.names[0]
    }

    pub fn names(&self) -> &[HostName] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, name) in self.names.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            write!(f, "{name}")?;
        }
        Ok(())
    }
}
