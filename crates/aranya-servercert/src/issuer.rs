//! Issuing leaf certificates signed by a [`SignerCert`].

use std::{fmt, str::FromStr};

use rcgen::{
    CertificateParams, DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
    SerialNumber, SignatureAlgorithm,
};
use serde::Deserialize;
use time::{Duration, OffsetDateTime};
use tracing::debug;
use zeroize::Zeroizing;

use crate::{
    error::{ServerCertError, ValidationError},
    hostname::SubjectAltNameSet,
    signer::SignerCert,
    x509::{self, CertInfo},
};

/// How far not-before is moved into the past, to tolerate clock drift between
/// the issuing host and the hosts that verify the certificate.
pub const CLOCK_SKEW: Duration = Duration::seconds(60);

/// The current time minus [`CLOCK_SKEW`], truncated to whole seconds since
/// certificates cannot encode anything finer.
pub(crate) fn backdated_now() -> OffsetDateTime {
    truncate_to_seconds(OffsetDateTime::now_utc() - CLOCK_SKEW)
}

fn truncate_to_seconds(t: OffsetDateTime) -> OffsetDateTime {
    t.replace_nanosecond(0).unwrap_or(t)
}

/// The key type generated for a leaf certificate.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    /// ECDSA on NIST P-256 with SHA-256.
    #[default]
    P256,
    /// ECDSA on NIST P-384 with SHA-384.
    P384,
    /// Ed25519.
    Ed25519,
}

impl KeyAlgorithm {
    fn signature_algorithm(self) -> &'static SignatureAlgorithm {
        match self {
            Self::P256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            Self::P384 => &rcgen::PKCS_ECDSA_P384_SHA384,
            Self::Ed25519 => &rcgen::PKCS_ED25519,
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::P256 => "p256",
            Self::P384 => "p384",
            Self::Ed25519 => "ed25519",
        })
    }
}

impl FromStr for KeyAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "p256" => Ok(Self::P256),
            "p384" => Ok(Self::P384),
            "ed25519" => Ok(Self::Ed25519),
            _ => Err(format!(
                "unknown key algorithm '{s}', expected p256, p384 or ed25519"
            )),
        }
    }
}

/// Everything needed to issue one leaf certificate. Immutable once built.
#[derive(Clone, Debug)]
pub struct CertificateRequest {
    sans: SubjectAltNameSet,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    key_algorithm: KeyAlgorithm,
}

impl CertificateRequest {
    /// Builds a request valid from now (backdated by [`CLOCK_SKEW`]) for
    /// `expire_days` days.
    ///
    /// # Errors
    ///
    /// [`ValidationError::InvalidExpireDays`] unless `expire_days` is positive
    /// and the resulting expiry is representable.
    pub fn new(
        sans: SubjectAltNameSet,
        expire_days: i64,
        key_algorithm: KeyAlgorithm,
    ) -> Result<Self, ValidationError> {
        Self::starting_at(sans, expire_days, key_algorithm, backdated_now())
    }

    fn starting_at(
        sans: SubjectAltNameSet,
        expire_days: i64,
        key_algorithm: KeyAlgorithm,
        not_before: OffsetDateTime,
    ) -> Result<Self, ValidationError> {
        let days = validate_expire_days(expire_days)?;
        let not_after = expiry_from(not_before, days)
            .ok_or(ValidationError::InvalidExpireDays(expire_days))?;
        Ok(Self {
            sans,
            not_before,
            not_after,
            key_algorithm,
        })
    }

    /// The names the certificate will be valid for.
    pub fn sans(&self) -> &SubjectAltNameSet {
        &self.sans
    }

    /// Start of the validity window.
    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    /// End of the validity window.
    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// The key type that will be generated.
    pub fn key_algorithm(&self) -> KeyAlgorithm {
        self.key_algorithm
    }
}

/// Checks that `expire_days` is a positive number of days and that a window
/// of that length starting now can be represented.
pub(crate) fn validate_expire_days(expire_days: i64) -> Result<u32, ValidationError> {
    u32::try_from(expire_days)
        .ok()
        .filter(|days| *days > 0)
        .filter(|days| expiry_from(backdated_now(), *days).is_some())
        .ok_or(ValidationError::InvalidExpireDays(expire_days))
}

/// `start + days`, or `None` if that is out of range.
pub(crate) fn expiry_from(start: OffsetDateTime, days: u32) -> Option<OffsetDateTime> {
    start.checked_add(Duration::days(i64::from(days)))
}

/// A freshly signed leaf certificate and its private key.
// Debug intentionally not implemented to avoid risk of exposing private keys.
#[allow(missing_debug_implementations)]
pub struct IssuedCertificate {
    cert_der: Vec<u8>,
    cert_pem: String,
    key: Zeroizing<KeyPair>,
    serial: Vec<u8>,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

impl IssuedCertificate {
    /// The DER-encoded certificate.
    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// Returns the certificate as a PEM-encoded string.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Returns the private key as a PEM-encoded string.
    ///
    /// Returns [`Zeroizing<String>`] to ensure key material is zeroized when dropped.
    pub fn key_pem(&self) -> Zeroizing<String> {
        Zeroizing::new(self.key.serialize_pem())
    }

    /// The serial number as minimal big-endian bytes.
    pub fn serial(&self) -> &[u8] {
        &self.serial
    }

    /// The serial number, if it fits in 64 bits.
    pub fn serial_u64(&self) -> Option<u64> {
        x509::serial_u64(&self.serial)
    }

    /// The serial number as colon-separated hex.
    pub fn serial_hex(&self) -> String {
        x509::serial_hex(&self.serial)
    }

    /// Start of the validity window.
    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    /// End of the validity window.
    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }
}

/// Signs a new leaf certificate for `request` with `signer`.
///
/// `serial` is the value reserved from the signer's counter. Without one,
/// rcgen derives the serial from the leaf's public key, which is unique since
/// every leaf gets a fresh key.
///
/// This has no side effects; persisting the serial is the caller's job.
///
/// # Errors
///
/// - [`ServerCertError::InvalidSignerMaterial`] if the signer expires before
///   the leaf would.
/// - [`ServerCertError::SigningFailed`] on any key generation, signing or
///   encoding failure.
pub fn issue(
    signer: &SignerCert,
    request: &CertificateRequest,
    serial: Option<u64>,
) -> Result<IssuedCertificate, ServerCertError> {
    if signer.not_after() < request.not_after {
        return Err(ServerCertError::invalid_signer(
            "signer certificate",
            format!(
                "signer expires at {}, before the requested leaf expiry {}",
                signer.not_after(),
                request.not_after
            ),
        ));
    }

    let mut params = CertificateParams::default();
    if let Some(cn) = request.sans.common_name() {
        params
            .distinguished_name
            .push(DnType::CommonName, DnValue::Utf8String(cn.to_string()));
    }
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.use_authority_key_identifier_extension = true;
    params.subject_alt_names = request.sans.to_san_types()?;
    params.not_before = request.not_before;
    params.not_after = request.not_after;
    params.serial_number = serial.map(SerialNumber::from);

    let key = KeyPair::generate_for(request.key_algorithm.signature_algorithm())?;
    let issuer = signer.issuer()?;
    let cert = params.signed_by(&key, &issuer)?;

    let cert_der = cert.der().to_vec();
    let info = CertInfo::from_der(&cert_der)
        .map_err(|_| ServerCertError::SigningFailed(rcgen::Error::CouldNotParseCertificate))?;
    debug!(
        serial = %x509::serial_hex(&info.serial),
        sans = %request.sans,
        not_after = %request.not_after,
        "signed server certificate"
    );

    Ok(IssuedCertificate {
        cert_der,
        cert_pem: cert.pem(),
        key: Zeroizing::new(key),
        serial: info.serial,
        not_before: request.not_before,
        not_after: request.not_after,
    })
}
