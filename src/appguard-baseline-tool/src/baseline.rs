//! Baseline value derivation.
//!
//! Every value printed by the tool goes through the same types the runtime
//! parses, so a value the tool emits is one the build will accept.

use std::collections::BTreeMap;
use std::path::Path;

use appguard_core::{
    BackendOrigin, CertificateDigest, ChecksumEngine, GuardError, PackageName, SealedSecret,
    UnlockGrant,
};
use appguard_native::{ModuleIdentity, NativeError};
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

/// Error during baseline derivation.
#[derive(Debug, thiserror::Error)]
pub enum BaselineError {
    #[error("Invalid baseline value: {0}")]
    Guard(#[from] GuardError),

    #[error("Native module constants rejected: {0}")]
    Native(#[from] NativeError),

    #[error("Invalid signing key: {reason}")]
    SigningKey { reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Inputs for a full set of build variables.
pub struct BaselineInputs<'a> {
    pub package_name: &'a str,
    pub certificate: &'a [u8],
    pub backend_origin: &'a str,
    pub secret: &'a [u8],
    pub unlock_pubkey: Option<[u8; 32]>,
    pub certificate_pins: Vec<String>,
}

/// Digest of a DER signing certificate.
pub fn certificate_digest(certificate: &[u8]) -> CertificateDigest {
    CertificateDigest::of_certificate(certificate)
}

/// Hex SHA-256 of an installed bundle.
pub fn bundle_checksum(path: &Path) -> Result<String, BaselineError> {
    Ok(ChecksumEngine::digest_file(path)?.to_hex())
}

/// Seal `secret` to the certificate.
pub fn seal_secret(secret: &[u8], certificate: &[u8]) -> Result<SealedSecret, BaselineError> {
    Ok(SealedSecret::seal(secret, &certificate_digest(certificate))?)
}

/// Checksum the native module will report for these constants.
pub fn native_checksum(
    package_name: &str,
    digest: &CertificateDigest,
    sealed: &SealedSecret,
) -> Result<u64, BaselineError> {
    let identity = ModuleIdentity::new(package_name, digest.as_str(), &sealed.to_base64())?;
    Ok(identity.checksum())
}

/// Fresh Ed25519 key pair for unlock grants.
pub fn generate_unlock_key() -> SigningKey {
    let mut seed = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(&mut seed[..]);
    SigningKey::from_bytes(&seed)
}

/// Parse a hex-encoded 32-byte signing key.
pub fn parse_signing_key(encoded: &str) -> Result<SigningKey, BaselineError> {
    let bytes = Zeroizing::new(hex::decode(encoded.trim()).map_err(|e| {
        BaselineError::SigningKey {
            reason: e.to_string(),
        }
    })?);
    let seed: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| BaselineError::SigningKey {
            reason: format!("expected 32 bytes, got {}", bytes.len()),
        })?;
    Ok(SigningKey::from_bytes(&seed))
}

/// Hex signature of an unlock grant for the lock taken at `locked_at`.
pub fn sign_unlock_grant(key: &SigningKey, installation_id: &str, locked_at: i64) -> String {
    let message = UnlockGrant::message(installation_id, locked_at);
    hex::encode(key.sign(&message).to_bytes())
}

/// The `APPGUARD_*` build variables, validated and ordered.
pub fn build_variables(inputs: &BaselineInputs) -> Result<BTreeMap<&'static str, String>, BaselineError> {
    let package = PackageName::parse(inputs.package_name)?;
    let origin = BackendOrigin::parse(inputs.backend_origin)?;
    let digest = certificate_digest(inputs.certificate);
    let sealed = SealedSecret::seal(inputs.secret, &digest)?;
    let native = native_checksum(package.as_str(), &digest, &sealed)?;

    let mut vars = BTreeMap::new();
    vars.insert("APPGUARD_PACKAGE_NAME", package.as_str().to_string());
    vars.insert("APPGUARD_CERT_DIGEST", digest.as_str().to_string());
    vars.insert("APPGUARD_BACKEND_ORIGIN", origin.to_string());
    vars.insert("APPGUARD_SEALED_SECRET", sealed.to_base64());
    vars.insert("APPGUARD_NATIVE_CHECKSUM", native.to_string());
    if let Some(key) = inputs.unlock_pubkey {
        vars.insert("APPGUARD_UNLOCK_PUBKEY", hex::encode(key));
    }
    if !inputs.certificate_pins.is_empty() {
        vars.insert("APPGUARD_CERT_PINS", inputs.certificate_pins.join(","));
    }
    Ok(vars)
}
