//! CLI tool for issuing CA-signed server certificates.
//!
//! # Usage
//!
//! ```bash
//! # Bootstrap a CA (creates ca.crt, ca.key and ca.serial.txt)
//! aranya-servercert create-signer-cert --cert ca.crt --key ca.key --serial ca.serial.txt
//!
//! # Issue a server certificate signed by that CA
//! aranya-servercert create-server-cert \
//!     --signer-cert ca.crt --signer-key ca.key --signer-serial ca.serial.txt \
//!     --cert server.crt --key server.key \
//!     --hostnames '*.apps.example.com,10.0.0.1'
//!
//! # Only reissue when the existing certificate no longer fits
//! aranya-servercert create-server-cert --config server.hjson --overwrite=false
//! ```

use std::{io, path::PathBuf};

use anyhow::{Context, Result};
use aranya_servercert::{
    create_server_cert, CertPaths, KeyAlgorithm, ReusePolicy, SaveOptions, ServerCertConfig,
    ServerCertOutcome, SignerCert,
};
use clap::{ArgAction, Args, Parser, Subcommand};
use time::OffsetDateTime;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

/// Command-line arguments for the server certificate tool.
#[derive(Parser, Debug)]
#[command(name = "aranya-servercert", version)]
#[command(about = "Issue and maintain CA-signed server certificates")]
struct CliArgs {
    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a server certificate signed by an existing CA.
    ///
    /// With `--overwrite=false` the existing certificate is kept if it
    /// already covers the requested hostnames and has enough validity left.
    CreateServerCert(ServerCertArgs),

    /// Create a new self-signed CA for signing server certificates.
    CreateSignerCert(SignerCertArgs),
}

#[derive(Args, Debug)]
struct ServerCertArgs {
    /// HJSON or JSON file with default values for the flags below.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the CA certificate.
    #[arg(long)]
    signer_cert: Option<PathBuf>,

    /// Path to the CA private key.
    #[arg(long)]
    signer_key: Option<PathBuf>,

    /// Path to the CA serial counter.
    #[arg(long)]
    signer_serial: Option<PathBuf>,

    /// Where to write the server certificate.
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Where to write the server private key.
    #[arg(long)]
    key: Option<PathBuf>,

    /// Hostnames and IP addresses, comma separated.
    #[arg(long, value_delimiter = ',')]
    hostnames: Vec<String>,

    /// Validity in days [default: 730]
    #[arg(long, allow_negative_numbers = true)]
    expire_days: Option<i64>,

    /// Always issue a new certificate [default: true]
    #[arg(long, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    overwrite: Option<bool>,

    /// Key type: p256, p384 or ed25519 [default: p256]
    #[arg(long)]
    key_algorithm: Option<KeyAlgorithm>,

    /// When an existing certificate may be kept: full-window or
    /// fraction:<percent> [default: full-window]
    #[arg(long)]
    reuse_policy: Option<ReusePolicy>,
}

impl ServerCertArgs {
    fn into_config(self) -> Result<ServerCertConfig> {
        let base = match &self.config {
            Some(path) => ServerCertConfig::load(path)?,
            None => ServerCertConfig::default(),
        };
        let flags = ServerCertConfig {
            signer_cert: self.signer_cert,
            signer_key: self.signer_key,
            signer_serial: self.signer_serial,
            cert: self.cert,
            key: self.key,
            hostnames: (!self.hostnames.is_empty()).then_some(self.hostnames),
            expire_days: self.expire_days,
            overwrite: self.overwrite,
            key_algorithm: self.key_algorithm,
            reuse_policy: self.reuse_policy,
        };
        Ok(base.merge(flags))
    }
}

#[derive(Args, Debug)]
struct SignerCertArgs {
    /// Where to write the CA certificate.
    #[arg(long)]
    cert: PathBuf,

    /// Where to write the CA private key.
    #[arg(long)]
    key: PathBuf,

    /// Where to create the serial counter.
    #[arg(long)]
    serial: Option<PathBuf>,

    /// Common Name (CN) of the CA [default: aranya-signer@<unix time>]
    #[arg(long)]
    name: Option<String>,

    /// Validity in days.
    #[arg(long, default_value_t = 1825)]
    expire_days: u32,

    /// Overwrite existing files.
    #[arg(short = 'f', long)]
    overwrite: bool,

    /// Create parent directories if they don't exist.
    #[arg(short = 'p')]
    create_parents: bool,
}

impl SignerCertArgs {
    fn save_options(&self) -> SaveOptions {
        let mut opts = SaveOptions::default();
        if self.create_parents {
            opts = opts.create_parents();
        }
        if self.overwrite {
            opts = opts.force();
        }
        opts
    }
}

fn main() -> Result<()> {
    let cli = CliArgs::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_file(false)
                .compact()
                .with_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
                ),
        )
        .init();

    match cli.command {
        Commands::CreateServerCert(args) => {
            let options = args.into_config()?.into_options()?;
            let outcome =
                create_server_cert(&options).context("unable to create server certificate")?;
            match &outcome {
                ServerCertOutcome::Issued(_) => println!("Generated new server certificate"),
                ServerCertOutcome::Reused(_) => println!("Keeping existing server certificate"),
            }
            println!("  Certificate: {}", options.paths.cert.display());
            println!("  Key:         {}", options.paths.key.display());
            println!("  Serial:      {}", outcome.serial_hex());
            println!("  Expires:     {}", outcome.not_after());
        }
        Commands::CreateSignerCert(args) => {
            let name = match &args.name {
                Some(name) => name.clone(),
                None => format!("aranya-signer@{}", OffsetDateTime::now_utc().unix_timestamp()),
            };
            info!(%name, expire_days = args.expire_days, "generating signer certificate");
            let ca = SignerCert::new(&name, args.expire_days)?;

            let paths = CertPaths::new(&args.cert, &args.key);
            ca.save(&paths, args.serial.as_deref(), &args.save_options())
                .context("unable to save signer certificate")?;

            println!("Generated signer certificate '{name}'");
            println!("  Certificate: {}", paths.cert.display());
            println!("  Key:         {}", paths.key.display());
            if let Some(serial) = &args.serial {
                println!("  Serial:      {}", serial.display());
            }
            println!("  Expires:     {}", ca.not_after());
        }
    }

    Ok(())
}
