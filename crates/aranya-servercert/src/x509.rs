//! Read-only inspection of PEM/DER certificates.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use rcgen::{KeyPair, PublicKeyData};
use time::OffsetDateTime;
use x509_parser::{
    certificate::X509Certificate, extensions::GeneralName, parse_x509_certificate,
    pem::parse_x509_pem,
};

use crate::hostname::{SubjectAltName, SubjectAltNameSet};

/// The parts of a certificate the issuance decision looks at.
#[derive(Clone, Debug)]
pub(crate) struct CertInfo {
    pub sans: SubjectAltNameSet,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    /// Serial number as minimal big-endian bytes.
    pub serial: Vec<u8>,
    /// DER-encoded SubjectPublicKeyInfo.
    pub spki: Vec<u8>,
    pub is_ca: bool,
}

impl CertInfo {
    /// Parses the first PEM block of `pem`, which must be a certificate.
    pub fn from_pem(pem: &str) -> Result<Self, String> {
        let (_, pem) = parse_x509_pem(pem.as_bytes()).map_err(|e| format!("bad PEM: {e}"))?;
        if pem.label != "CERTIFICATE" {
            return Err(format!("expected a CERTIFICATE PEM block, found {}", pem.label));
        }
        let cert = pem
            .parse_x509()
            .map_err(|e| format!("bad certificate: {e}"))?;
        Self::from_cert(&cert)
    }

    /// Parses a DER-encoded certificate.
    pub fn from_der(der: &[u8]) -> Result<Self, String> {
        let (_, cert) = parse_x509_certificate(der).map_err(|e| format!("bad certificate: {e}"))?;
        Self::from_cert(&cert)
    }

    fn from_cert(cert: &X509Certificate<'_>) -> Result<Self, String> {
        let names = match cert.subject_alternative_name() {
            Ok(Some(ext)) => ext
                .value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(SubjectAltName::Dns((*dns).to_string())),
                    GeneralName::IPAddress(raw) => ip_from_bytes(raw).map(SubjectAltName::Ip),
                    _ => None,
                })
                .collect(),
            Ok(None) => Vec::new(),
            Err(e) => return Err(format!("bad subjectAltName extension: {e}")),
        };

        let validity = cert.validity();
        Ok(Self {
            sans: SubjectAltNameSet::from_existing(names),
            not_before: validity.not_before.to_datetime(),
            not_after: validity.not_after.to_datetime(),
            serial: minimal_be(cert.raw_serial()),
            spki: cert.public_key().raw.to_vec(),
            is_ca: cert.is_ca(),
        })
    }

    /// Reports whether `key` is the private half of this certificate's key.
    pub fn matches_key(&self, key: &KeyPair) -> bool {
        key.subject_public_key_info() == self.spki
    }

    /// The serial number, if it fits in 64 bits.
    pub fn serial_u64(&self) -> Option<u64> {
        serial_u64(&self.serial)
    }
}

pub(crate) fn serial_u64(serial: &[u8]) -> Option<u64> {
    if serial.len() > 8 {
        return None;
    }
    Some(serial.iter().fold(0, |acc, b| (acc << 8) | u64::from(*b)))
}

/// Formats a serial number as colon-separated hex.
pub(crate) fn serial_hex(serial: &[u8]) -> String {
    if serial.is_empty() {
        return "00".to_string();
    }
    serial
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn minimal_be(bytes: &[u8]) -> Vec<u8> {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[start..].to_vec()
}

fn ip_from_bytes(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => <[u8; 4]>::try_from(raw).ok().map(|b| Ipv4Addr::from(b).into()),
        16 => <[u8; 16]>::try_from(raw).ok().map(|b| Ipv6Addr::from(b).into()),
        _ => None,
    }
}
