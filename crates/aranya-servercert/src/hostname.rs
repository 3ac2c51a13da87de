//! Validation and normalization of subject alternative names.
//!
//! Every requested hostname is classified as either an IP literal or a DNS
//! name. DNS names are lowercased and may carry a single wildcard, which must
//! be the entire leftmost label (`*.example.com`).
//!
//! The resulting [`SubjectAltNameSet`] is ordered and deduplicated, so two
//! requests that differ only in order or repetition compare equal.

use std::{
    collections::{btree_set, BTreeSet},
    fmt,
    net::IpAddr,
};

use rcgen::SanType;

use crate::error::ValidationError;

/// Longest DNS name we accept, in bytes, without the trailing dot.
const MAX_DNS_NAME_LEN: usize = 253;

/// Longest single DNS label, in bytes.
const MAX_LABEL_LEN: usize = 63;

/// A single subject alternative name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubjectAltName {
    /// A DNS name, possibly with a leading wildcard label.
    Dns(String),
    /// An IPv4 or IPv6 address.
    Ip(IpAddr),
}

impl SubjectAltName {
    /// Parses and normalizes one requested hostname.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::invalid_hostname(raw, "empty hostname"));
        }

        let unbracketed = trimmed
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(trimmed);
        if let Ok(ip) = unbracketed.parse::<IpAddr>() {
            return Ok(Self::Ip(ip));
        }

        let name = trimmed.strip_suffix('.').unwrap_or(trimmed);
        validate_dns_name(raw, name)?;
        Ok(Self::Dns(name.to_ascii_lowercase()))
    }

    /// Reports whether this is a wildcard DNS name.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Dns(name) if name.starts_with("*."))
    }

    fn to_san_type(&self) -> Result<SanType, rcgen::Error> {
        Ok(match self {
            Self::Dns(name) => SanType::DnsName(name.clone().try_into()?),
            Self::Ip(ip) => SanType::IpAddress(*ip),
        })
    }
}

impl fmt::Display for SubjectAltName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dns(name) => f.write_str(name),
            Self::Ip(ip) => write!(f, "{ip}"),
        }
    }
}

/// A non-empty, deduplicated set of subject alternative names.
///
/// Sets are compared by membership only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubjectAltNameSet(BTreeSet<SubjectAltName>);

impl SubjectAltNameSet {
    /// Builds a set from names read back out of an existing certificate.
    ///
    /// These are not held to the request rules; they only need to be
    /// comparable with a validated request.
    pub(crate) fn from_existing(names: impl IntoIterator<Item = SubjectAltName>) -> Self {
        Self(
            names
                .into_iter()
                .map(|name| match name {
                    SubjectAltName::Dns(dns) => {
                        let dns = dns.strip_suffix('.').unwrap_or(&dns);
                        SubjectAltName::Dns(dns.to_ascii_lowercase())
                    }
                    ip @ SubjectAltName::Ip(_) => ip,
                })
                .collect(),
        )
    }

    /// Reports whether `existing` covers every name in this set.
    ///
    /// Extra names in `existing` are fine.
    pub fn is_satisfied_by(&self, existing: &SubjectAltNameSet) -> bool {
        self.0.is_subset(&existing.0)
    }

    /// Reports whether `name` is in the set.
    pub fn contains(&self, name: &SubjectAltName) -> bool {
        self.0.contains(name)
    }

    /// Returns the number of names in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false for a validated set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the names in sorted order.
    pub fn iter(&self) -> btree_set::Iter<'_, SubjectAltName> {
        self.0.iter()
    }

    /// The name used as the leaf's common name.
    pub(crate) fn common_name(&self) -> Option<&SubjectAltName> {
        self.0.first()
    }

    pub(crate) fn to_san_types(&self) -> Result<Vec<SanType>, rcgen::Error> {
        self.0.iter().map(SubjectAltName::to_san_type).collect()
    }
}

impl<'a> IntoIterator for &'a SubjectAltNameSet {
    type Item = &'a SubjectAltName;
    type IntoIter = btree_set::Iter<'a, SubjectAltName>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for SubjectAltNameSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, name) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{name}")?;
        }
        Ok(())
    }
}

/// Validates the requested hostnames and collapses them into a set.
///
/// # Errors
///
/// - [`ValidationError::EmptyHostnameSet`] if `raw` yields nothing.
/// - [`ValidationError::InvalidHostname`] for the first entry that is neither
///   an IP literal nor a valid DNS name.
pub fn validate_hostnames<I, S>(raw: I) -> Result<SubjectAltNameSet, ValidationError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let names = raw
        .into_iter()
        .map(|s| SubjectAltName::parse(s.as_ref()))
        .collect::<Result<BTreeSet<_>, _>>()?;
    if names.is_empty() {
        return Err(ValidationError::EmptyHostnameSet);
    }
    Ok(SubjectAltNameSet(names))
}

fn validate_dns_name(raw: &str, name: &str) -> Result<(), ValidationError> {
    let invalid = |reason| ValidationError::invalid_hostname(raw, reason);

    if name.len() > MAX_DNS_NAME_LEN {
        return Err(invalid("name is longer than 253 bytes"));
    }

    let labels: Vec<&str> = name.split('.').collect();
    for (i, label) in labels.iter().enumerate() {
        if label.is_empty() {
            return Err(invalid("empty label"));
        }
        if *label == "*" {
            if i != 0 {
                return Err(invalid("wildcard is only allowed as the leftmost label"));
            }
            if labels.len() < 2 {
                return Err(invalid("wildcard must be followed by a domain"));
            }
            continue;
        }
        if label.contains('*') {
            return Err(invalid("wildcard must be an entire label"));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(invalid("label is longer than 63 bytes"));
        }
        if !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return Err(invalid("labels may only contain letters, digits and '-'"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("labels must not start or end with '-'"));
        }
    }

    // Catches malformed IP literals such as `10.0.0.256`.
    if labels
        .last()
        .is_some_and(|tld| tld.bytes().all(|b| b.is_ascii_digit()))
    {
        return Err(invalid("top-level label must not be numeric"));
    }

    Ok(())
}
