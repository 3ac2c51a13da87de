//! Issue and maintain CA-signed server certificates.
//!
//! Given a signing CA, a set of hostnames and an expiry, this crate produces
//! a server certificate and private key at two paths on disk. Existing
//! material can be kept instead of reissued when it still covers the
//! requested names and has enough validity left.
//!
//! - [`hostname`]: validation of DNS names, wildcards and IP addresses.
//! - [`signer`]: loading (or bootstrapping) the CA.
//! - [`serial`]: the CA's persisted serial counter.
//! - [`issuer`]: building and signing the leaf certificate.
//! - [`reuse`]: deciding whether existing material can be kept.
//! - [`persist`]: writing the certificate and key as one unit.
//! - [`server`]: [`create_server_cert`], which ties the above together.
//!
//! # Example
//!
//! ```no_run
//! use aranya_servercert::{
//!     create_server_cert, CertPaths, ServerCertOptions, SignerOptions,
//! };
//!
//! let mut options = ServerCertOptions::new(
//!     SignerOptions {
//!         cert: "ca.crt".into(),
//!         key: "ca.key".into(),
//!         serial: Some("ca.serial.txt".into()),
//!     },
//!     CertPaths::new("server.crt", "server.key"),
//!     vec!["*.apps.example.com".into()],
//! );
//! // Keep the existing certificate if it is still good enough.
//! options.overwrite = false;
//!
//! let outcome = create_server_cert(&options)?;
//! println!("written: {}, expires: {}", outcome.written(), outcome.not_after());
//! # Ok::<(), aranya_servercert::ServerCertError>(())
//! ```
//!
//! # Bootstrapping a CA
//!
//! ```no_run
//! use std::path::Path;
//!
//! use aranya_servercert::{CertPaths, SaveOptions, SignerCert};
//!
//! let ca = SignerCert::new("My Root CA", 1825)?;
//! ca.save(
//!     &CertPaths::new("ca.crt", "ca.key"),
//!     Some(Path::new("ca.serial.txt")),
//!     &SaveOptions::default(),
//! )?;
//! # Ok::<(), aranya_servercert::ServerCertError>(())
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod error;
pub mod hostname;
pub mod issuer;
pub mod persist;
pub mod reuse;
pub mod serial;
pub mod server;
pub mod signer;

mod x509;

pub use config::ServerCertConfig;
pub use error::{ServerCertError, ValidationError};
pub use hostname::{validate_hostnames, SubjectAltName, SubjectAltNameSet};
pub use issuer::{issue, CertificateRequest, IssuedCertificate, KeyAlgorithm, CLOCK_SKEW};
pub use persist::{write_pair, CertPaths, SaveOptions, StagedPair};
pub use reuse::{should_reuse, Decision, ExistingCertificate, ReusePolicy, Snapshot};
pub use serial::{SerialCounter, SerialLease};
pub use server::{create_server_cert, ServerCertOptions, ServerCertOutcome, DEFAULT_EXPIRE_DAYS};
pub use signer::{SignerCert, SignerMaterial, SignerOptions};
