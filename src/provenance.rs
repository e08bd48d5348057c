//! Cryptographic provenance for sealed reasoning graphs
//!
//! A seal is:
//! - SHA-256 hash of the graph's JSON
//! - Ed25519 signature over run id, content hash and the previous entry's hash
//!
//! so neither the graph nor its place in the ledger chain can be altered
//! without detection.

use anyhow::{Context, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

/// Hash content with SHA-256, hex encoded
pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// The bytes a seal signature covers
fn signing_payload(run_id: &str, content_hash: &str, previous_hash: Option<&str>) -> Vec<u8> {
    format!("{}\n{}\n{}", run_id, content_hash, previous_hash.unwrap_or("")).into_bytes()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Seal {
    pub content_hash: String,
    pub previous_hash: Option<String>,
    pub signature: String,
    pub public_key: String,
}

/// Ed25519 key used to seal ledger entries
pub struct LedgerKey {
    signing_key: SigningKey,
}

impl LedgerKey {
    /// Load the key at `key_path`, creating it on first use
    pub fn init(key_path: &Path) -> Result<Self> {
        let signing_key = if key_path.exists() {
            load_key(key_path)?
        } else {
            let key = SigningKey::generate(&mut OsRng);
            save_key(&key, key_path)?;
            tracing::info!(path = ?key_path, "generated ledger signing key");
            key
        };

        Ok(Self { signing_key })
    }

    /// Key that lives only as long as the process
    pub fn ephemeral() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().as_bytes())
    }

    /// Seal `content` as the entry following `previous_hash`
    pub fn seal(&self, run_id: &str, content: &[u8], previous_hash: Option<&str>) -> Seal {
        let hash = content_hash(content);
        let signature = self
            .signing_key
            .sign(&signing_payload(run_id, &hash, previous_hash));

        Seal {
            content_hash: hash,
            previous_hash: previous_hash.map(str::to_string),
            signature: hex::encode(signature.to_bytes()),
            public_key: self.public_key_hex(),
        }
    }
}

fn load_key(path: &Path) -> Result<SigningKey> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read key from {:?}", path))?;

    let key_bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("Invalid key length: expected 32 bytes, got {}", bytes.len()))?;

    Ok(SigningKey::from_bytes(&key_bytes))
}

fn save_key(key: &SigningKey, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::write(path, key.to_bytes()).with_context(|| format!("Failed to write key to {:?}", path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(path, perms)?;
    }

    Ok(())
}

/// Check that `seal` was produced for this run and content
///
/// `Ok(false)` means the signature does not match; malformed hex or key
/// material is an error.
pub fn verify_seal(run_id: &str, content: &[u8], seal: &Seal) -> Result<bool> {
    if content_hash(content) != seal.content_hash {
        return Ok(false);
    }

    let sig_bytes: [u8; 64] = hex::decode(&seal.signature)
        .context("Invalid signature hex")?
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("Invalid signature length"))?;
    let key_bytes: [u8; 32] = hex::decode(&seal.public_key)
        .context("Invalid public key hex")?
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("Invalid public key length"))?;

    let signature = Signature::from_bytes(&sig_bytes);
    let verifying_key = VerifyingKey::from_bytes(&key_bytes).context("Invalid public key")?;
    let payload = signing_payload(run_id, &seal.content_hash, seal.previous_hash.as_deref());

    Ok(verifying_key.verify(&payload, &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_key_persistence() {
        let dir = tempdir().unwrap();
        let key_path = dir.path().join("keys").join("ledger.key");

        let first = LedgerKey::init(&key_path).unwrap();
        let second = LedgerKey::init(&key_path).unwrap();

        assert_eq!(first.public_key_hex(), second.public_key_hex());
        assert_eq!(first.public_key_hex().len(), 64);
    }

    #[test]
    fn test_rejects_short_key_file() {
        let dir = tempdir().unwrap();
        let key_path = dir.path().join("bad.key");
        fs::write(&key_path, [0u8; 7]).unwrap();

        assert!(LedgerKey::init(&key_path).is_err());
    }

    #[test]
    fn test_seal_verifies() {
        let key = LedgerKey::ephemeral();
        let seal = key.seal("run-1", b"{\"graph\":1}", Some("abc"));

        assert_eq!(seal.signature.len(), 128);
        assert!(verify_seal("run-1", b"{\"graph\":1}", &seal).unwrap());
    }

    #[test]
    fn test_seal_detects_tampering() {
        let key = LedgerKey::ephemeral();
        let seal = key.seal("run-1", b"original", None);

        assert!(!verify_seal("run-1", b"tampered", &seal).unwrap());
        assert!(!verify_seal("run-2", b"original", &seal).unwrap());

        let relinked = Seal {
            previous_hash: Some("forged".into()),
            ..seal.clone()
        };
        assert!(!verify_seal("run-1", b"original", &relinked).unwrap());

        let garbled = Seal {
            signature: "not-hex!".into(),
            ..seal
        };
        assert!(verify_seal("run-1", b"original", &garbled).is_err());
    }

    #[test]
    fn test_content_hash_known_value() {
        assert_eq!(
            content_hash(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
