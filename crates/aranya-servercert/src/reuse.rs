//! Deciding whether existing certificate files can be kept.
//!
//! Re-running issuance with `overwrite` disabled must not replace a
//! certificate that is already serving traffic unless it has to. The files on
//! disk are read into a [`Snapshot`] and [`evaluate`] decides, without side
//! effects, whether they still satisfy the request.

use std::{fmt, fs, io, str::FromStr};

use rcgen::KeyPair;
use serde::Deserialize;
use time::{Duration, OffsetDateTime};
use zeroize::Zeroizing;

use crate::{
    hostname::SubjectAltNameSet,
    persist::CertPaths,
    x509::{self, CertInfo},
};

/// What was found at the output paths.
#[allow(missing_debug_implementations)]
pub enum Snapshot {
    /// Neither the certificate nor the key exists.
    Absent,
    /// Something exists but cannot be used. Holds the reason.
    Unreadable(String),
    /// A parsed certificate with its matching key.
    Valid(ExistingCertificate),
}

impl Snapshot {
    /// Reads the certificate and key at `paths`.
    pub fn read(paths: &CertPaths) -> Self {
        let cert_pem = read_optional(&paths.cert);
        let key_pem = read_optional(&paths.key).map(|pem| pem.map(Zeroizing::new));

        let (cert_pem, key_pem) = match (cert_pem, key_pem) {
            (Ok(None), Ok(None)) => return Self::Absent,
            (Ok(Some(cert)), Ok(Some(key))) => (cert, key),
            (Ok(None), _) => {
                return Self::Unreadable(format!("{} is missing", paths.cert.display()))
            }
            (_, Ok(None)) => {
                return Self::Unreadable(format!("{} is missing", paths.key.display()))
            }
            (Err(e), _) => {
                return Self::Unreadable(format!("{}: {e}", paths.cert.display()));
            }
            (_, Err(e)) => {
                return Self::Unreadable(format!("{}: {e}", paths.key.display()));
            }
        };

        let info = match CertInfo::from_pem(&cert_pem) {
            Ok(info) => info,
            Err(reason) => return Self::Unreadable(format!("{}: {reason}", paths.cert.display())),
        };
        let key = match KeyPair::from_pem(&key_pem) {
            Ok(key) => Zeroizing::new(key),
            Err(e) => return Self::Unreadable(format!("{}: {e}", paths.key.display())),
        };
        if !info.matches_key(&key) {
            return Self::Unreadable("key does not match the certificate".to_string());
        }

        Self::Valid(ExistingCertificate {
            cert_pem,
            key,
            info,
        })
    }
}

/// A certificate and key already on disk.
// Debug intentionally not implemented to avoid risk of exposing private keys.
#[allow(missing_debug_implementations)]
pub struct ExistingCertificate {
    cert_pem: String,
    key: Zeroizing<KeyPair>,
    info: CertInfo,
}

impl ExistingCertificate {
    /// Returns the certificate as a PEM-encoded string.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Returns the private key as a PEM-encoded string.
    pub fn key_pem(&self) -> Zeroizing<String> {
        Zeroizing::new(self.key.serialize_pem())
    }

    /// The names the certificate is valid for.
    pub fn sans(&self) -> &SubjectAltNameSet {
        &self.info.sans
    }

    /// The serial number as minimal big-endian bytes.
    pub fn serial(&self) -> &[u8] {
        &self.info.serial
    }

    /// The serial number, if it fits in 64 bits.
    pub fn serial_u64(&self) -> Option<u64> {
        self.info.serial_u64()
    }

    /// The serial number as colon-separated hex.
    pub fn serial_hex(&self) -> String {
        x509::serial_hex(&self.info.serial)
    }

    /// Start of the validity window.
    pub fn not_before(&self) -> OffsetDateTime {
        self.info.not_before
    }

    /// End of the validity window.
    pub fn not_after(&self) -> OffsetDateTime {
        self.info.not_after
    }
}

/// How much validity an existing certificate must have left to be kept.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum ReusePolicy {
    /// The certificate must still be valid for the whole requested period:
    /// `not_after >= now + expire_days`.
    #[default]
    FullWindow,
    /// The certificate must still be valid for the given percentage of the
    /// requested period.
    Fraction(u8),
}

impl ReusePolicy {
    /// The minimum remaining validity for a request of `expire_days`.
    pub fn min_remaining(self, expire_days: u32) -> Duration {
        let window = Duration::days(i64::from(expire_days));
        match self {
            Self::FullWindow => window,
            Self::Fraction(percent) => {
                Duration::seconds(window.whole_seconds() * i64::from(percent) / 100)
            }
        }
    }
}

impl fmt::Display for ReusePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FullWindow => f.write_str("full-window"),
            Self::Fraction(percent) => write!(f, "fraction:{percent}"),
        }
    }
}

impl FromStr for ReusePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "full-window" {
            return Ok(Self::FullWindow);
        }
        let percent = s.strip_prefix("fraction:").ok_or_else(|| {
            format!("unknown reuse policy '{s}', expected full-window or fraction:<percent>")
        })?;
        match percent.parse::<u8>() {
            Ok(p) if p <= 100 => Ok(Self::Fraction(p)),
            _ => Err(format!("reuse fraction must be 0-100, got '{percent}'")),
        }
    }
}

impl TryFrom<String> for ReusePolicy {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// The outcome of [`evaluate`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Keep the existing files.
    Reuse,
    /// Issue a new certificate, for the given reason.
    Reissue(&'static str),
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reuse => f.write_str("existing certificate satisfies the request"),
            Self::Reissue(reason) => f.write_str(reason),
        }
    }
}

/// Decides whether `snapshot` can be kept for a request of `requested` names
/// valid for `expire_days` days, as of `now`.
///
/// The existing certificate must cover every requested name (extra names
/// are fine), already be valid, and have at least
/// [`ReusePolicy::min_remaining`] left before it expires.
pub fn evaluate(
    snapshot: &Snapshot,
    requested: &SubjectAltNameSet,
    expire_days: u32,
    policy: ReusePolicy,
    now: OffsetDateTime,
) -> Decision {
    let existing = match snapshot {
        Snapshot::Absent => return Decision::Reissue("no existing certificate"),
        Snapshot::Unreadable(_) => return Decision::Reissue("existing certificate is unusable"),
        Snapshot::Valid(existing) => existing,
    };

    if existing.not_before() > now {
        return Decision::Reissue("existing certificate is not yet valid");
    }
    if !requested.is_satisfied_by(existing.sans()) {
        return Decision::Reissue("existing certificate does not cover the requested names");
    }
    let Some(needed) = now.checked_add(policy.min_remaining(expire_days)) else {
        return Decision::Reissue("requested validity is out of range");
    };
    if existing.not_after() < needed {
        return Decision::Reissue("existing certificate expires too soon");
    }
    Decision::Reuse
}

/// Shorthand for `evaluate(..) == Decision::Reuse`.
pub fn should_reuse(
    snapshot: &Snapshot,
    requested: &SubjectAltNameSet,
    expire_days: u32,
    policy: ReusePolicy,
    now: OffsetDateTime,
) -> bool {
    evaluate(snapshot, requested, expire_days, policy, now) == Decision::Reuse
}

fn read_optional(path: &std::path::Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::panic, clippy::unwrap_used)]

    use std::path::Path;

    use super::*;
    use crate::{
        hostname::validate_hostnames,
        issuer::{issue, CertificateRequest, KeyAlgorithm},
        persist::{write_pair, SaveOptions},
        signer::SignerCert,
    };

    fn paths_in(dir: &Path) -> CertPaths {
        CertPaths::new(dir.join("server.crt"), dir.join("server.key"))
    }

    /// Issues a certificate for `hosts` valid for `days` and writes it to `dir`.
    fn existing(dir: &Path, hosts: &[&str], days: i64) -> (CertPaths, OffsetDateTime) {
        let ca = SignerCert::new("Test CA", 3650).unwrap();
        let sans = validate_hostnames(hosts).unwrap();
        let req = CertificateRequest::new(sans, days, KeyAlgorithm::P256).unwrap();
        let issued = issue(&ca, &req, Some(1)).unwrap();
        let paths = paths_in(dir);
        write_pair(
            &paths,
            issued.cert_pem(),
            &issued.key_pem(),
            &SaveOptions::default(),
        )
        .unwrap();
        (paths, issued.not_after())
    }

    fn hosts(names: &[&str]) -> SubjectAltNameSet {
        validate_hostnames(names).unwrap()
    }

    #[test]
    fn test_absent() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = Snapshot::read(&paths_in(dir.path()));
        assert!(matches!(snapshot, Snapshot::Absent));
        assert_eq!(
            evaluate(
                &snapshot,
                &hosts(&["a.example.com"]),
                1,
                ReusePolicy::FullWindow,
                OffsetDateTime::now_utc()
            ),
            Decision::Reissue("no existing certificate")
        );
    }

    #[test]
    fn test_missing_key_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, _) = existing(dir.path(), &["a.example.com"], 30);
        fs::remove_file(&paths.key).unwrap();

        let snapshot = Snapshot::read(&paths);
        assert!(matches!(snapshot, Snapshot::Unreadable(ref r) if r.contains("missing")));
        assert!(!should_reuse(
            &snapshot,
            &hosts(&["a.example.com"]),
            1,
            ReusePolicy::FullWindow,
            OffsetDateTime::now_utc()
        ));
    }

    #[test]
    fn test_garbage_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, _) = existing(dir.path(), &["a.example.com"], 30);
        fs::write(&paths.cert, "garbage").unwrap();

        assert!(matches!(Snapshot::read(&paths), Snapshot::Unreadable(_)));
    }

    #[test]
    fn test_mismatched_key_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, _) = existing(dir.path(), &["a.example.com"], 30);
        fs::write(&paths.key, KeyPair::generate().unwrap().serialize_pem()).unwrap();

        assert!(matches!(
            Snapshot::read(&paths),
            Snapshot::Unreadable(ref r) if r.contains("does not match")
        ));
    }

    #[test]
    fn test_reuse_same_names_shorter_window() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, _) = existing(dir.path(), &["a.example.com", "b.example.com"], 730);
        let snapshot = Snapshot::read(&paths);

        assert_eq!(
            evaluate(
                &snapshot,
                &hosts(&["b.example.com", "a.example.com"]),
                30,
                ReusePolicy::FullWindow,
                OffsetDateTime::now_utc()
            ),
            Decision::Reuse
        );
    }

    #[test]
    fn test_reuse_subset_of_names() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, _) = existing(dir.path(), &["a.example.com", "10.0.0.1"], 730);
        let snapshot = Snapshot::read(&paths);

        assert!(should_reuse(
            &snapshot,
            &hosts(&["10.0.0.1"]),
            30,
            ReusePolicy::FullWindow,
            OffsetDateTime::now_utc()
        ));
    }

    #[test]
    fn test_reissue_superset_of_names() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, _) = existing(dir.path(), &["a.example.com"], 730);
        let snapshot = Snapshot::read(&paths);

        assert_eq!(
            evaluate(
                &snapshot,
                &hosts(&["a.example.com", "b.example.com"]),
                30,
                ReusePolicy::FullWindow,
                OffsetDateTime::now_utc()
            ),
            Decision::Reissue("existing certificate does not cover the requested names")
        );
    }

    #[test]
    fn test_full_window_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, not_after) = existing(dir.path(), &["a.example.com"], 100);
        let snapshot = Snapshot::read(&paths);
        let requested = hosts(&["a.example.com"]);

        // Exactly 30 days left: kept.
        let now = not_after - Duration::days(30);
        assert!(should_reuse(&snapshot, &requested, 30, ReusePolicy::FullWindow, now));

        // One second less: replaced.
        let now = now + Duration::seconds(1);
        assert_eq!(
            evaluate(&snapshot, &requested, 30, ReusePolicy::FullWindow, now),
            Decision::Reissue("existing certificate expires too soon")
        );
    }

    #[test]
    fn test_same_window_is_reissued_under_full_window() {
        // Not-before is backdated, so a certificate issued for N days has
        // slightly less than N days left once issued.
        let dir = tempfile::tempdir().unwrap();
        let (paths, _) = existing(dir.path(), &["a.example.com"], 30);
        let snapshot = Snapshot::read(&paths);

        assert!(!should_reuse(
            &snapshot,
            &hosts(&["a.example.com"]),
            30,
            ReusePolicy::FullWindow,
            OffsetDateTime::now_utc()
        ));
    }

    #[test]
    fn test_fraction_policy() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, not_after) = existing(dir.path(), &["a.example.com"], 100);
        let snapshot = Snapshot::read(&paths);
        let requested = hosts(&["a.example.com"]);

        // 60 of the requested 100 days left.
        let now = not_after - Duration::days(60);
        assert!(!should_reuse(&snapshot, &requested, 100, ReusePolicy::FullWindow, now));
        assert!(should_reuse(&snapshot, &requested, 100, ReusePolicy::Fraction(50), now));
        assert!(!should_reuse(&snapshot, &requested, 100, ReusePolicy::Fraction(75), now));
    }

    #[test]
    fn test_expired_is_reissued_under_any_policy() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, not_after) = existing(dir.path(), &["a.example.com"], 10);
        let snapshot = Snapshot::read(&paths);
        let requested = hosts(&["a.example.com"]);
        let now = not_after + Duration::seconds(1);

        assert!(!should_reuse(&snapshot, &requested, 10, ReusePolicy::Fraction(0), now));
    }

    #[test]
    fn test_unrepresentable_window_is_reissued() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, _) = existing(dir.path(), &["a.example.com"], 30);
        let snapshot = Snapshot::read(&paths);

        assert_eq!(
            evaluate(
                &snapshot,
                &hosts(&["a.example.com"]),
                u32::MAX,
                ReusePolicy::FullWindow,
                OffsetDateTime::now_utc()
            ),
            Decision::Reissue("requested validity is out of range")
        );
    }

    #[test]
    fn test_not_yet_valid_is_reissued() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, _) = existing(dir.path(), &["a.example.com"], 10);
        let snapshot = Snapshot::read(&paths);
        let long_ago = OffsetDateTime::now_utc() - Duration::days(1);

        assert_eq!(
            evaluate(
                &snapshot,
                &hosts(&["a.example.com"]),
                1,
                ReusePolicy::FullWindow,
                long_ago
            ),
            Decision::Reissue("existing certificate is not yet valid")
        );
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("full-window".parse::<ReusePolicy>(), Ok(ReusePolicy::FullWindow));
        assert_eq!("fraction:50".parse::<ReusePolicy>(), Ok(ReusePolicy::Fraction(50)));
        assert!("fraction:101".parse::<ReusePolicy>().is_err());
        assert!("half".parse::<ReusePolicy>().is_err());
        assert_eq!(ReusePolicy::Fraction(25).to_string(), "fraction:25");
    }

    #[test]
    fn test_min_remaining() {
        assert_eq!(ReusePolicy::FullWindow.min_remaining(30), Duration::days(30));
        assert_eq!(ReusePolicy::Fraction(50).min_remaining(30), Duration::days(15));
        assert_eq!(ReusePolicy::Fraction(0).min_remaining(30), Duration::ZERO);
    }
}
