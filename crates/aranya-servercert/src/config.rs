//! Server certificate configuration file.
//!
//! The file is HJSON (or plain JSON) and mirrors the `create-server-cert`
//! flags. Every field is optional so the file can be combined with flags.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize};

use crate::{
    issuer::KeyAlgorithm,
    persist::CertPaths,
    reuse::ReusePolicy,
    server::{ServerCertOptions, DEFAULT_EXPIRE_DAYS},
    signer::SignerOptions,
};

/// Options for creating a server certificate, as read from a file.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerCertConfig {
    /// Path to the signer's certificate.
    pub signer_cert: Option<PathBuf>,
    /// Path to the signer's private key.
    pub signer_key: Option<PathBuf>,
    /// Path to the signer's serial counter.
    pub signer_serial: Option<PathBuf>,
    /// Where to write the server certificate.
    pub cert: Option<PathBuf>,
    /// Where to write the server's private key.
    pub key: Option<PathBuf>,
    /// Hostnames and IPs the certificate is valid for.
    pub hostnames: Option<Vec<String>>,
    /// Validity in days.
    pub expire_days: Option<i64>,
    /// Always issue a new certificate.
    pub overwrite: Option<bool>,
    /// Key type of the server certificate.
    pub key_algorithm: Option<KeyAlgorithm>,
    /// When an existing certificate may be kept.
    pub reuse_policy: Option<ReusePolicy>,
}

impl ServerCertConfig {
    /// Reads the configuration from `path`.
    pub fn load<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let cfg: Self = read_json(path.as_ref())
            .context(format!("unable to parse config: {:?}", path.as_ref()))?;

        Ok(cfg)
    }

    /// Returns `self` with every field set in `overrides` replaced.
    pub fn merge(self, overrides: Self) -> Self {
        Self {
            signer_cert: overrides.signer_cert.or(self.signer_cert),
            signer_key: overrides.signer_key.or(self.signer_key),
            signer_serial: overrides.signer_serial.or(self.signer_serial),
            cert: overrides.cert.or(self.cert),
            key: overrides.key.or(self.key),
            hostnames: overrides.hostnames.or(self.hostnames),
            expire_days: overrides.expire_days.or(self.expire_days),
            overwrite: overrides.overwrite.or(self.overwrite),
            key_algorithm: overrides.key_algorithm.or(self.key_algorithm),
            reuse_policy: overrides.reuse_policy.or(self.reuse_policy),
        }
    }

    /// Fills in defaults and converts to [`ServerCertOptions`].
    ///
    /// Fails if a required path is missing. Hostnames and expiry are
    /// checked later by [`ServerCertOptions::validate`].
    pub fn into_options(self) -> Result<ServerCertOptions> {
        let signer = SignerOptions {
            cert: self.signer_cert.context("missing required option: signer-cert")?,
            key: self.signer_key.context("missing required option: signer-key")?,
            serial: self.signer_serial,
        };
        let paths = CertPaths::new(
            self.cert.context("missing required option: cert")?,
            self.key.context("missing required option: key")?,
        );

        Ok(ServerCertOptions {
            signer,
            paths,
            hostnames: self.hostnames.unwrap_or_default(),
            expire_days: self.expire_days.unwrap_or(DEFAULT_EXPIRE_DAYS),
            overwrite: self.overwrite.unwrap_or(true),
            key_algorithm: self.key_algorithm.unwrap_or_default(),
            reuse_policy: self.reuse_policy.unwrap_or_default(),
        })
    }
}

/// Reads JSON from `path`.
fn read_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let buf = fs::read(path.as_ref())?;
    Ok(deser_hjson::from_slice(&buf)?)
}
