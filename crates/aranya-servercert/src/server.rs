//! Creating or keeping a server certificate.
//!
//! [`create_server_cert`] ties the pieces together:
//!
//! 1. The request is validated without touching the disk.
//! 2. The signer is loaded.
//! 3. Unless `overwrite` is set, the existing files are inspected and kept
//!    if they still satisfy the request.
//! 4. Otherwise a new certificate is issued and written.
//!
//! When the signer has a serial counter, step 4 holds the counter's lock from
//! reservation to commit. The counter is persisted only after both files have
//! been staged to disk, and before they are moved into place. A failure before
//! that point leaves the counter untouched; a failure after it can only leave
//! an unused serial behind, never a reused one.

use time::OffsetDateTime;
use tracing::{debug, info};

use crate::{
    error::{ServerCertError, ValidationError},
    hostname::{validate_hostnames, SubjectAltNameSet},
    issuer::{issue, validate_expire_days, CertificateRequest, IssuedCertificate, KeyAlgorithm},
    persist::{write_pair, CertPaths, SaveOptions, StagedPair},
    reuse::{evaluate, Decision, ExistingCertificate, ReusePolicy, Snapshot},
    signer::{self, SignerMaterial, SignerOptions},
};

/// Default validity of a server certificate: two years.
pub const DEFAULT_EXPIRE_DAYS: i64 = 730;

/// Everything needed to create a server certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCertOptions {
    /// The signing CA.
    pub signer: SignerOptions,
    /// Where to write the certificate and key.
    pub paths: CertPaths,
    /// Every hostname or IP the certificate must be valid for.
    pub hostnames: Vec<String>,
    /// Validity of the certificate in days.
    pub expire_days: i64,
    /// Always issue a new certificate, even if the existing one would do.
    pub overwrite: bool,
    /// Key type of the new certificate.
    pub key_algorithm: KeyAlgorithm,
    /// How much validity an existing certificate must have left to be kept.
    pub reuse_policy: ReusePolicy,
}

impl ServerCertOptions {
    /// Creates options with the defaults: two years, overwrite, P-256 and
    /// the full-window reuse policy.
    pub fn new(signer: SignerOptions, paths: CertPaths, hostnames: Vec<String>) -> Self {
        Self {
            signer,
            paths,
            hostnames,
            expire_days: DEFAULT_EXPIRE_DAYS,
            overwrite: true,
            key_algorithm: KeyAlgorithm::default(),
            reuse_policy: ReusePolicy::default(),
        }
    }

    /// Checks the options without touching the disk.
    ///
    /// Returns the validated names and expiry.
    pub fn validate(&self) -> Result<(SubjectAltNameSet, u32), ValidationError> {
        let days = validate_expire_days(self.expire_days)?;
        let sans = validate_hostnames(&self.hostnames)?;
        if self.paths.cert.as_os_str().is_empty() {
            return Err(ValidationError::MissingOption("cert"));
        }
        if self.paths.key.as_os_str().is_empty() {
            return Err(ValidationError::MissingOption("key"));
        }
        self.signer.validate()?;
        Ok((sans, days))
    }
}

/// The result of [`create_server_cert`].
#[allow(missing_debug_implementations)]
pub enum ServerCertOutcome {
    /// A new certificate was issued and written.
    Issued(IssuedCertificate),
    /// The existing files were kept unchanged.
    Reused(ExistingCertificate),
}

impl ServerCertOutcome {
    /// Reports whether new files were written.
    pub fn written(&self) -> bool {
        matches!(self, Self::Issued(_))
    }

    /// Returns the certificate as a PEM-encoded string.
    pub fn cert_pem(&self) -> &str {
        match self {
            Self::Issued(cert) => cert.cert_pem(),
            Self::Reused(cert) => cert.cert_pem(),
        }
    }

    /// The serial number as colon-separated hex.
    pub fn serial_hex(&self) -> String {
        match self {
            Self::Issued(cert) => cert.serial_hex(),
            Self::Reused(cert) => cert.serial_hex(),
        }
    }

    /// End of the certificate's validity window.
    pub fn not_after(&self) -> OffsetDateTime {
        match self {
            Self::Issued(cert) => cert.not_after(),
            Self::Reused(cert) => cert.not_after(),
        }
    }
}

/// Creates a server certificate valid for `options.hostnames`, or keeps the
/// existing one.
///
/// # Errors
///
/// - [`ServerCertError::Validation`] before any I/O for bad hostnames,
///   non-positive expiry or missing paths.
/// - [`ServerCertError::SignerNotFound`] / [`ServerCertError::InvalidSignerMaterial`]
///   if the signer cannot be loaded.
/// - [`ServerCertError::SerialExhausted`] / [`ServerCertError::SigningFailed`]
///   if the certificate cannot be produced.
/// - [`ServerCertError::WriteFailed`] if the files cannot be written. The
///   previous files, if any, are left in place.
pub fn create_server_cert(
    options: &ServerCertOptions,
) -> Result<ServerCertOutcome, ServerCertError> {
    let (sans, expire_days) = options.validate()?;
    debug!(
        sans = %sans,
        expire_days,
        overwrite = options.overwrite,
        cert = %options.paths.cert.display(),
        key = %options.paths.key.display(),
        "creating server certificate"
    );

    let signer = signer::resolve(&options.signer)?;

    if !options.overwrite {
        let snapshot = Snapshot::read(&options.paths);
        if let Snapshot::Unreadable(reason) = &snapshot {
            debug!(%reason, "existing certificate is unusable");
        }
        let decision = evaluate(
            &snapshot,
            &sans,
            expire_days,
            options.reuse_policy,
            OffsetDateTime::now_utc(),
        );
        debug!(%decision, policy = %options.reuse_policy, "evaluated existing certificate");
        if let (Decision::Reuse, Snapshot::Valid(existing)) = (decision, snapshot) {
            info!(
                cert = %options.paths.cert.display(),
                key = %options.paths.key.display(),
                "keeping existing server certificate"
            );
            return Ok(ServerCertOutcome::Reused(existing));
        }
    }

    let request = CertificateRequest::new(sans, i64::from(expire_days), options.key_algorithm)?;
    let issued = issue_and_write(&signer, &request, &options.paths)?;
    info!(
        cert = %options.paths.cert.display(),
        key = %options.paths.key.display(),
        serial = %issued.serial_hex(),
        "generated new server certificate"
    );
    Ok(ServerCertOutcome::Issued(issued))
}

fn issue_and_write(
    signer: &SignerMaterial,
    request: &CertificateRequest,
    paths: &CertPaths,
) -> Result<IssuedCertificate, ServerCertError> {
    let options = SaveOptions::default().create_parents().force();

    let Some(counter) = &signer.serial else {
        let issued = issue(&signer.cert, request, None)?;
        write_pair(paths, issued.cert_pem(), &issued.key_pem(), &options)?;
        return Ok(issued);
    };

    let mut lease = counter.lock()?;
    let serial = lease.reserve()?;
    let issued = issue(&signer.cert, request, Some(serial))?;
    let staged = StagedPair::stage(paths, issued.cert_pem(), &issued.key_pem(), &options)?;
    lease.commit(serial)?;
    staged.commit()?;
    Ok(issued)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::panic, clippy::unwrap_used)]

    use std::path::Path;

    use super::*;

    fn options_in(dir: &Path, hosts: &[&str]) -> ServerCertOptions {
        ServerCertOptions::new(
            SignerOptions {
                cert: dir.join("ca.crt"),
                key: dir.join("ca.key"),
                serial: Some(dir.join("ca.serial.txt")),
            },
            CertPaths::new(dir.join("server.crt"), dir.join("server.key")),
            hosts.iter().map(|h| h.to_string()).collect(),
        )
    }

    #[test]
    fn test_defaults() {
        let options = options_in(Path::new("/tmp"), &["a.example.com"]);
        assert_eq!(options.expire_days, 730);
        assert!(options.overwrite);
        assert_eq!(options.key_algorithm, KeyAlgorithm::P256);
        assert_eq!(options.reuse_policy, ReusePolicy::FullWindow);
    }

    #[test]
    fn test_validate_order() {
        let mut options = options_in(Path::new("/tmp"), &[]);
        options.expire_days = 0;
        assert_eq!(
            options.validate().unwrap_err(),
            ValidationError::InvalidExpireDays(0)
        );

        options.expire_days = 1;
        assert_eq!(
            options.validate().unwrap_err(),
            ValidationError::EmptyHostnameSet
        );

        options.hostnames = vec!["a.example.com".into()];
        options.paths.key = "".into();
        assert_eq!(
            options.validate().unwrap_err(),
            ValidationError::MissingOption("key")
        );
    }

    #[test]
    fn test_validate_rejects_unrepresentable_expiry() {
        let mut options = options_in(Path::new("/tmp"), &["a.example.com"]);
        options.expire_days = 3_000_000;
        assert_eq!(
            options.validate().unwrap_err(),
            ValidationError::InvalidExpireDays(3_000_000)
        );
    }

    #[test]
    fn test_missing_signer() {
        let dir = tempfile::tempdir().unwrap();
        let options = options_in(dir.path(), &["a.example.com"]);

        assert!(matches!(
            create_server_cert(&options),
            Err(ServerCertError::SignerNotFound { .. })
        ));
        assert!(!dir.path().join("server.crt").exists());
    }
}
