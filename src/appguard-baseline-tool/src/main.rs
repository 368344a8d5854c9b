//! appguard-baseline-tool - Build-time baseline generator for AppGuard.
//!
//! Derives the identity baseline of a release build and prints it as the
//! `APPGUARD_*` variables read by the `embedded-baseline` feature.
//!
//! ## Usage
//!
//! ```bash
//! # All build variables for a release
//! appguard-baseline-tool env \
//!     --package com.example.tv \
//!     --cert release.der \
//!     --backend https://api.example.live/ \
//!     --secret-file app_key.txt \
//!     --unlock-pubkey 3b6a27bc...
//!
//! # Single values
//! appguard-baseline-tool cert-digest --cert release.der
//! appguard-baseline-tool bundle-checksum --bundle app-release.apk
//!
//! # Unlock grants
//! appguard-baseline-tool unlock-keygen --output unlock.key
//! appguard-baseline-tool sign-grant --key unlock.key --installation-id tv-01 --locked-at 1700000000000
//! ```

mod baseline;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use zeroize::Zeroizing;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build-time baseline generator for AppGuard.
///
/// Every printed value is validated with the same parsers the runtime uses.
#[derive(Parser)]
#[command(name = "appguard-baseline-tool")]
#[command(version = VERSION)]
#[command(about = "Build-time baseline generator for AppGuard")]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every APPGUARD_* build variable
    Env {
        /// Application package name
        #[arg(short, long)]
        package: String,

        /// DER signing certificate of the release key
        #[arg(short, long)]
        cert: PathBuf,

        /// Official backend URL
        #[arg(short, long)]
        backend: String,

        /// File holding the protected secret
        #[arg(short, long)]
        secret_file: PathBuf,

        /// Hex Ed25519 public key accepted for unlock grants
        #[arg(long)]
        unlock_pubkey: Option<String>,

        /// Backend SPKI SHA-256 pin (base64), repeatable
        #[arg(long = "pin")]
        pins: Vec<String>,

        /// Print a JSON object instead of shell exports
        #[arg(long)]
        json: bool,
    },

    /// Base64 SHA-256 digest of a signing certificate
    CertDigest {
        /// DER signing certificate
        #[arg(short, long)]
        cert: PathBuf,
    },

    /// Hex SHA-256 of an installed bundle
    BundleChecksum {
        /// Bundle file (APK or binary)
        #[arg(short, long)]
        bundle: PathBuf,
    },

    /// Seal a secret to a signing certificate
    SealSecret {
        /// DER signing certificate
        #[arg(short, long)]
        cert: PathBuf,

        /// File holding the secret
        #[arg(short, long)]
        secret_file: PathBuf,
    },

    /// Generate an Ed25519 key pair for unlock grants
    UnlockKeygen {
        /// Where to write the hex private key
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Sign an unlock grant for a locked installation
    SignGrant {
        /// Hex private key from unlock-keygen
        #[arg(short, long)]
        key: PathBuf,

        /// Installation identifier
        #[arg(short, long)]
        installation_id: String,

        /// Lock timestamp (Unix milliseconds) from the technical details
        #[arg(short, long)]
        locked_at: i64,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Env {
            package,
            cert,
            backend,
            secret_file,
            unlock_pubkey,
            pins,
            json,
        } => {
            let certificate = read(&cert)?;
            let secret = Zeroizing::new(read(&secret_file)?);
            let unlock_pubkey = unlock_pubkey.map(|k| parse_pubkey(&k)).transpose()?;

            let vars = baseline::build_variables(&baseline::BaselineInputs {
                package_name: &package,
                certificate: &certificate,
                backend_origin: &backend,
                secret: trim_newline(&secret),
                unlock_pubkey,
                certificate_pins: pins,
            })?;
            info!(count = vars.len(), "Baseline derived");

            if json {
                println!("{}", serde_json::to_string_pretty(&vars)?);
            } else {
                for (name, value) in &vars {
                    println!("export {name}='{value}'");
                }
            }
        },

        Commands::CertDigest { cert } => {
            let digest = baseline::certificate_digest(&read(&cert)?);
            println!("{}", digest.as_str());
        },

        Commands::BundleChecksum { bundle } => {
            println!("{}", baseline::bundle_checksum(&bundle)?);
        },

        Commands::SealSecret { cert, secret_file } => {
            let secret = Zeroizing::new(read(&secret_file)?);
            let sealed = baseline::seal_secret(trim_newline(&secret), &read(&cert)?)?;
            println!("{}", sealed.to_base64());
        },

        Commands::UnlockKeygen { output } => {
            let key = baseline::generate_unlock_key();
            let encoded = Zeroizing::new(hex::encode(key.to_bytes()));
            write_private(&output, encoded.as_bytes())?;
            info!(path = %output.display(), "Unlock private key written");
            println!("{}", hex::encode(key.verifying_key().to_bytes()));
        },

        Commands::SignGrant {
            key,
            installation_id,
            locked_at,
        } => {
            let encoded = Zeroizing::new(
                std::fs::read_to_string(&key)
                    .with_context(|| format!("reading {}", key.display()))?,
            );
            let key = baseline::parse_signing_key(&encoded)?;
            debug!(installation_id = %installation_id, locked_at, "Signing unlock grant");
            println!(
                "{}",
                baseline::sign_unlock_grant(&key, &installation_id, locked_at)
            );
        },
    }

    Ok(())
}

fn read(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// Drop one trailing newline left by editors and `echo`.
fn trim_newline(bytes: &[u8]) -> &[u8] {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    bytes.strip_suffix(b"\r").unwrap_or(bytes)
}

fn parse_pubkey(encoded: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = hex::decode(encoded.trim()).context("unlock public key is not hex")?;
    let key: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("unlock public key must be 32 bytes"))?;
    ed25519_dalek::VerifyingKey::from_bytes(&key).context("unlock public key is not a valid point")?;
    Ok(key)
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("creating {}", path.display()))?;
    file.write_all(data)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    std::fs::write(path, data).with_context(|| format!("writing {}", path.display()))
}
