//! Patch verification.
//!
//! A downloaded patch must be exactly `size` bytes. When the patch record
//! carries `hashFunction = "sha256"` and `hashValue`, the SHA-256 digest is
//! checked as well, using a constant-time comparison. Signature checks are
//! delegated to an optional [`SignatureVerifier`].

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, error, info};

use crate::error::UpdateError;
use crate::record::{props, PatchRecord};

const HASH_BUFFER_SIZE: usize = 8192;

/// Pass/fail signature check on a downloaded patch.
pub trait SignatureVerifier: Send + Sync {
    /// Returns an error if the file's signature is invalid.
    fn verify(&self, path: &Path) -> Result<(), UpdateError>;
}

/// Verifies downloaded patches.
#[derive(Clone, Default)]
pub struct PatchVerifier {
    signature: Option<Arc<dyn SignatureVerifier>>,
}

impl PatchVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_signature_verifier(verifier: Arc<dyn SignatureVerifier>) -> Self {
        Self { signature: Some(verifier) }
    }

    /// Verify the file at `path` against `patch`.
    ///
    /// # Errors
    ///
    /// - [`UpdateError::SizeMismatch`] when the length differs from `size`
    /// - [`UpdateError::HashMismatch`] when a declared digest differs
    /// - whatever the signature verifier reports
    pub fn verify(&self, path: &Path, patch: &PatchRecord) -> Result<(), UpdateError> {
        verify_size(path, patch.size)?;

        if let Some(expected) = expected_digest(patch)? {
            verify_hash(path, &expected)?;
        }

        if let Some(signature) = &self.signature {
            debug!("Verifying signature of {:?}", path);
            signature.verify(path)?;
        }

        info!("Patch {:?} verified ({} bytes)", path, patch.size);
        Ok(())
    }
}

/// Returns the declared SHA-256 digest of `patch`, if any.
///
/// Patches naming another hash function are not digest-checked.
fn expected_digest(patch: &PatchRecord) -> Result<Option<[u8; 32]>, UpdateError> {
    let Some(function) = patch.properties.get(props::HASH_FUNCTION) else {
        return Ok(None);
    };
    if !function.eq_ignore_ascii_case("sha256") {
        debug!("Skipping digest check for hash function {}", function);
        return Ok(None);
    }
    let Some(value) = patch.properties.get(props::HASH_VALUE) else {
        return Ok(None);
    };

    let bytes = hex::decode(value.trim())
        .map_err(|e| UpdateError::InvalidRecord(format!("invalid hashValue: {}", e)))?;
    let digest: [u8; 32] = bytes
        .try_into()
        .map_err(|_| UpdateError::InvalidRecord("hashValue is not a SHA-256 digest".to_string()))?;
    Ok(Some(digest))
}

/// Check that the file at `path` is exactly `expected_size` bytes.
pub fn verify_size(path: &Path, expected_size: u64) -> Result<(), UpdateError> {
    let actual = std::fs::metadata(path)?.len();
    if actual != expected_size {
        error!("Patch size mismatch for {:?}: expected {}, got {}", path, expected_size, actual);
        return Err(UpdateError::SizeMismatch { expected: expected_size, actual });
    }
    Ok(())
}

/// Compute the SHA-256 digest of a file.
pub fn compute_hash(path: &Path) -> Result<[u8; 32], UpdateError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; HASH_BUFFER_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().into())
}

fn verify_hash(path: &Path, expected: &[u8; 32]) -> Result<(), UpdateError> {
    let actual = compute_hash(path)?;
    if actual.ct_eq(expected).unwrap_u8() != 1 {
        error!(
            "Patch hash mismatch for {:?}: expected {}, got {}",
            path,
            hex::encode(expected),
            hex::encode(actual)
        );
        return Err(UpdateError::HashMismatch {
            expected: hex::encode(expected),
            actual: hex::encode(actual),
        });
    }
    debug!("Patch hash verified: {}", hex::encode(actual));
    Ok(())
}
