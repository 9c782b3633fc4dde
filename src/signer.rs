//! Deterministic signing and verification over canonical capability bytes.
//!
//! Mirrors the teacher crate's own `Rcan` signing path (domain-separated
//! `postcard` encoding, `ed25519-dalek` signatures) but inserts a `blake3`
//! hash between canonicalization and signing, as spec §4.1 requires, so
//! signature cost and size are independent of how much metadata or how many
//! constraints a capability carries.

use std::fs;
use std::path::{Path, PathBuf};

use ed25519_dalek::ed25519::signature::Signer as _;
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use serde::Serialize;

use crate::error::{CoreError, CoreResult};

/// Domain separation tag for capability signatures. Distinct from any tag
/// used elsewhere so a signature can never be replayed across contexts.
pub const CAPABILITY_DST: &[u8] = b"capcore-capability-v1";

/// Name recorded in configuration and audit metadata for the algorithm in
/// use (spec §4.1: "implementations may substitute any deterministic
/// signature scheme with equivalent security properties, but the field
/// ... must name it").
pub const SIGNATURE_ALGORITHM: &str = "ed25519";

/// Produces and verifies fixed-size signatures over canonical capability
/// bytes, and owns the private key material.
#[derive(Debug)]
pub struct Signer {
    signing_key: SigningKey,
}

impl Signer {
    /// Loads a keypair from `private_key_path` if it exists; otherwise,
    /// when `auto_generate` is set, generates a fresh one and persists both
    /// halves with `0600` permissions on the private key. Any other
    /// failure aborts start-up per spec §4.1.
    pub fn load_or_generate(
        private_key_path: &Path,
        public_key_path: &Path,
        auto_generate: bool,
    ) -> CoreResult<Self> {
        if private_key_path.exists() {
            return Self::load(private_key_path);
        }
        if !auto_generate {
            return Err(CoreError::KeyMaterial(format!(
                "private key file {} does not exist and auto_generate is disabled",
                private_key_path.display()
            )));
        }
        let signer = Self::generate();
        signer.persist(private_key_path, public_key_path)?;
        Ok(signer)
    }

    pub fn generate() -> Self {
        let mut rng = getrandom::rand_core::UnwrapErr(getrandom::SysRng);
        Self {
            signing_key: SigningKey::generate(&mut rng),
        }
    }

    fn load(private_key_path: &Path) -> CoreResult<Self> {
        let bytes = fs::read(private_key_path).map_err(|e| {
            CoreError::KeyMaterial(format!(
                "failed to read private key {}: {e}",
                private_key_path.display()
            ))
        })?;
        let bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            CoreError::KeyMaterial(format!(
                "private key {} has the wrong length",
                private_key_path.display()
            ))
        })?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&bytes),
        })
    }

    fn persist(&self, private_key_path: &Path, public_key_path: &Path) -> CoreResult<()> {
        write_private_key(private_key_path, self.signing_key.to_bytes().as_slice())?;
        write_public_key(public_key_path, self.signing_key.verifying_key().as_bytes())?;
        Ok(())
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Hashes `bytes` with `blake3` and signs the 32-byte digest. Infallible
    /// given valid key material, as spec §4.1 requires.
    pub fn sign(&self, bytes: &[u8]) -> Signature {
        let digest = blake3::hash(bytes);
        self.signing_key.sign(digest.as_bytes())
    }

    /// Verifies a signature produced by [`Signer::sign`] against a supplied
    /// public key.
    pub fn verify(public_key: &VerifyingKey, bytes: &[u8], signature: &Signature) -> bool {
        let digest = blake3::hash(bytes);
        public_key.verify_strict(digest.as_bytes(), signature).is_ok()
    }

    /// Produces the stable, field-ordered canonical serialization of `value`
    /// prefixed with the capability domain separation tag. `value` must be
    /// the capability's signable payload with `signature` and `used_count`
    /// zeroed/omitted, per spec §4.1.
    pub fn canonical<T: Serialize>(value: &T) -> CoreResult<Vec<u8>> {
        postcard::to_extend(value, CAPABILITY_DST.to_vec())
            .map_err(|e| CoreError::Internal(anyhow::anyhow!("canonicalization failed: {e}")))
    }
}

fn write_private_key(path: &Path, bytes: &[u8]) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| CoreError::KeyMaterial(format!("failed to create key directory: {e}")))?;
    }
    fs::write(path, bytes)
        .map_err(|e| CoreError::KeyMaterial(format!("failed to write private key: {e}")))?;
    set_private_permissions(path)?;
    Ok(())
}

fn write_public_key(path: &Path, bytes: &[u8]) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| CoreError::KeyMaterial(format!("failed to create key directory: {e}")))?;
    }
    fs::write(path, bytes)
        .map_err(|e| CoreError::KeyMaterial(format!("failed to write public key: {e}")))
}

#[cfg(unix)]
fn set_private_permissions(path: &Path) -> CoreResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(|e| CoreError::KeyMaterial(format!("failed to chmod private key: {e}")))
}

#[cfg(not(unix))]
fn set_private_permissions(_path: &Path) -> CoreResult<()> {
    Ok(())
}

/// Paths for the two key files, used by [`Signer::load_or_generate`].
#[derive(Debug, Clone)]
pub struct KeyPaths {
    pub private_key_file: PathBuf,
    pub public_key_file: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use testresult::TestResult;

    #[derive(Serialize, Deserialize)]
    struct Payload {
        a: u32,
        b: String,
    }

    #[test]
    fn sign_and_verify_roundtrip() -> TestResult {
        let signer = Signer::generate();
        let bytes = Signer::canonical(&Payload {
            a: 7,
            b: "resource".into(),
        })?;
        let sig = signer.sign(&bytes);
        assert!(Signer::verify(&signer.public_key(), &bytes, &sig));
        Ok(())
    }

    #[test]
    fn tampering_breaks_verification() -> TestResult {
        let signer = Signer::generate();
        let bytes = Signer::canonical(&Payload {
            a: 7,
            b: "resource".into(),
        })?;
        let sig = signer.sign(&bytes);
        let tampered = Signer::canonical(&Payload {
            a: 8,
            b: "resource".into(),
        })?;
        assert!(!Signer::verify(&signer.public_key(), &tampered, &sig));
        Ok(())
    }

    #[test]
    fn load_or_generate_persists_and_reloads() -> TestResult {
        let dir = tempfile::tempdir()?;
        let priv_path = dir.path().join("agent.key");
        let pub_path = dir.path().join("agent.pub");

        let first = Signer::load_or_generate(&priv_path, &pub_path, true)?;
        assert!(priv_path.exists());
        assert!(pub_path.exists());

        let second = Signer::load_or_generate(&priv_path, &pub_path, true)?;
        assert_eq!(first.public_key_bytes(), second.public_key_bytes());
        Ok(())
    }

    #[test]
    fn missing_key_without_auto_generate_is_bootstrap_failure() {
        let dir = tempfile::tempdir().unwrap();
        let priv_path = dir.path().join("agent.key");
        let pub_path = dir.path().join("agent.pub");
        let err = Signer::load_or_generate(&priv_path, &pub_path, false).unwrap_err();
        assert_eq!(err.code(), "KEY_ERROR");
    }
}
