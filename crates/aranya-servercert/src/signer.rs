//! The certificate authority that signs server certificates.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use rcgen::{
    BasicConstraints, CertificateParams, DnType, DnValue, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use time::OffsetDateTime;
use tracing::debug;
use zeroize::Zeroizing;

use crate::{
    error::{ServerCertError, ValidationError},
    issuer,
    persist::{self, CertPaths, SaveOptions},
    serial::SerialCounter,
    x509::CertInfo,
};

/// Where to find the signer's certificate, key and serial counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerOptions {
    /// The signer's PEM certificate.
    pub cert: PathBuf,
    /// The signer's PEM private key.
    pub key: PathBuf,
    /// The signer's serial counter. When absent, serials are derived from
    /// each leaf's public key instead of being counted.
    pub serial: Option<PathBuf>,
}

impl SignerOptions {
    /// Checks that the required paths are set. Does not touch the disk.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.cert.as_os_str().is_empty() {
            return Err(ValidationError::MissingOption("signer-cert"));
        }
        if self.key.as_os_str().is_empty() {
            return Err(ValidationError::MissingOption("signer-key"));
        }
        if self
            .serial
            .as_ref()
            .is_some_and(|p| p.as_os_str().is_empty())
        {
            return Err(ValidationError::MissingOption("signer-serial"));
        }
        Ok(())
    }

    fn paths(&self) -> CertPaths {
        CertPaths::new(&self.cert, &self.key)
    }
}

/// A CA certificate and the private key it signs with.
///
/// # Security
///
/// The private key is wrapped in [`Zeroizing`] and zeroized on drop. Signing
/// borrows the key through a short-lived `Issuer`; no copy is made.
// Debug intentionally not implemented to avoid risk of exposing private keys.
#[allow(missing_debug_implementations)]
pub struct SignerCert {
    cert_pem: String,
    key: Zeroizing<KeyPair>,
    not_after: OffsetDateTime,
}

impl SignerCert {
    /// Bootstraps a new self-signed CA with a P-256 ECDSA key.
    ///
    /// This belongs to the separate signer-creation workflow; issuing server
    /// certificates never creates a signer implicitly.
    ///
    /// # Errors
    ///
    /// - [`ValidationError::InvalidExpireDays`] if `days` is 0.
    /// - [`ServerCertError::SigningFailed`] if key generation or signing fails.
    pub fn new(cn: &str, days: u32) -> Result<Self, ServerCertError> {
        let invalid_days = ValidationError::InvalidExpireDays(i64::from(days));
        let not_before = issuer::backdated_now();
        let not_after = issuer::expiry_from(not_before, days)
            .filter(|_| days > 0)
            .ok_or(invalid_days)?;

        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, DnValue::Utf8String(cn.to_string()));
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        params.not_before = not_before;
        params.not_after = not_after;

        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;

        Ok(Self {
            cert_pem: cert.pem(),
            key: Zeroizing::new(key),
            not_after,
        })
    }

    /// Loads a CA certificate and its private key from PEM files.
    ///
    /// # Errors
    ///
    /// - [`ServerCertError::SignerNotFound`] if either file is missing.
    /// - [`ServerCertError::InvalidSignerMaterial`] if either file is
    ///   unreadable or malformed, the certificate is not a CA, or the key does
    ///   not belong to the certificate.
    pub fn load(paths: &CertPaths) -> Result<Self, ServerCertError> {
        let cert_pem = read_signer_file(&paths.cert)?;
        // Wrap in Zeroizing to ensure the key PEM is zeroized on drop, even if parsing fails
        let key_pem = Zeroizing::new(read_signer_file(&paths.key)?);

        let key = Zeroizing::new(
            KeyPair::from_pem(&key_pem)
                .map_err(|e| ServerCertError::invalid_signer(&paths.key, e))?,
        );

        let info = CertInfo::from_pem(&cert_pem)
            .map_err(|reason| ServerCertError::invalid_signer(&paths.cert, reason))?;
        if !info.is_ca {
            return Err(ServerCertError::invalid_signer(
                &paths.cert,
                "certificate is not a CA",
            ));
        }
        if !info.matches_key(&key) {
            return Err(ServerCertError::invalid_signer(
                &paths.key,
                "key does not match the signer certificate",
            ));
        }
        Issuer::from_ca_cert_pem(&cert_pem, &*key)
            .map_err(|e| ServerCertError::invalid_signer(&paths.cert, e))?;

        Ok(Self {
            cert_pem,
            key,
            not_after: info.not_after,
        })
    }

    /// Saves the CA certificate and private key, and initializes `serial` if
    /// given and not already present.
    ///
    /// # Errors
    ///
    /// [`ServerCertError::WriteFailed`] if a directory is missing and
    /// `create_parents` is false, if a file exists and `force` is false, or on
    /// any I/O error.
    pub fn save(
        &self,
        paths: &CertPaths,
        serial: Option<&Path>,
        options: &SaveOptions,
    ) -> Result<(), ServerCertError> {
        persist::write_pair(paths, &self.cert_pem, &self.key.serialize_pem(), options)?;
        if let Some(serial) = serial {
            SerialCounter::new(serial).initialize()?;
        }
        Ok(())
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

    /// When the CA certificate expires.
    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Creates an issuer that borrows this CA's key.
    pub(crate) fn issuer(&self) -> Result<Issuer<'_, &KeyPair>, rcgen::Error> {
        Issuer::from_ca_cert_pem(&self.cert_pem, &*self.key)
    }
}

/// A resolved signer: CA material plus its serial counter, if any.
#[allow(missing_debug_implementations)]
pub struct SignerMaterial {
    /// The CA certificate and key.
    pub cert: SignerCert,
    /// The persisted serial counter.
    pub serial: Option<SerialCounter>,
}

/// Loads the signer described by `options`.
///
/// The serial counter is read once so a corrupt counter is reported before
/// any work is done. A missing counter file is fine; it starts at 0.
pub fn resolve(options: &SignerOptions) -> Result<SignerMaterial, ServerCertError> {
    options.validate()?;

    let cert = SignerCert::load(&options.paths())?;
    let serial = options.serial.as_ref().map(SerialCounter::new);
    if let Some(counter) = &serial {
        let current = counter.read()?;
        debug!(path = %counter.path().display(), current, "resolved serial counter");
    }
    debug!(
        cert = %options.cert.display(),
        not_after = %cert.not_after(),
        "resolved signer"
    );

    Ok(SignerMaterial { cert, serial })
}

fn read_signer_file(path: &Path) -> Result<String, ServerCertError> {
    fs::read_to_string(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ServerCertError::signer_not_found(path),
        _ => ServerCertError::invalid_signer(path, e),
    })
}
