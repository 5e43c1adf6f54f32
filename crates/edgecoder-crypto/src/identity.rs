// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Node identity and the trusted-key roster.
//!
//! # Security model
//!
//! Every node owns an Ed25519 keypair. The private key is generated on first
//! boot, written to disk with mode 0o600, and **never leaves the node**. The
//! public key is distributed to peers through the trusted roster: an
//! operator-provided JSON file at boot, extended at runtime by authenticated
//! enrollment.
//!
//! Peers that are not in the roster cannot produce an acceptable signature;
//! their requests fail with `signature_untrusted_peer` before any handler
//! logic runs.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// This node's stable identifier plus its Ed25519 keypair.
pub struct NodeIdentity {
    peer_id: String,
    key: SigningKey,
}

/// On-disk format for the keypair file.
///
/// Only the 32-byte secret seed is stored (the public key is derived).
#[derive(Serialize, Deserialize)]
struct KeypairFile {
    peer_id: String,
    /// Hex-encoded 32-byte Ed25519 secret seed.
    secret_hex: String,
}

impl NodeIdentity {
    /// Generate a fresh identity with a random peer id.
    pub fn generate() -> Self {
        let key = SigningKey::generate(&mut OsRng);
        let peer_id = format!("edge-{}", uuid_like_suffix(&key.verifying_key()));
        Self { peer_id, key }
    }

    /// Generate an identity with a caller-chosen peer id (enrollment path).
    pub fn generate_with_id(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Load the keypair from `path`, or generate and persist one when the
    /// file does not exist yet. `preferred_id` is used only on first
    /// generation; an existing file's id always wins.
    pub fn load_or_generate(path: &Path, preferred_id: Option<&str>) -> anyhow::Result<Self> {
        if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading keypair file {}", path.display()))?;
            let file: KeypairFile = serde_json::from_str(&text)
                .with_context(|| format!("parsing keypair file {}", path.display()))?;
            let bytes = hex::decode(&file.secret_hex).context("decoding secret seed")?;
            let seed: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("keypair seed must be 32 bytes"))?;
            return Ok(Self {
                peer_id: file.peer_id,
                key: SigningKey::from_bytes(&seed),
            });
        }

        let identity = match preferred_id {
            Some(id) => Self::generate_with_id(id),
            None => Self::generate(),
        };
        identity.save(path)?;
        Ok(identity)
    }

    /// Persist the keypair to `path` with mode 0o600 on Unix.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating key directory {}", parent.display()))?;
        }
        let file = KeypairFile {
            peer_id: self.peer_id.clone(),
            secret_hex: hex::encode(self.key.to_bytes()),
        };
        let json = serde_json::to_string_pretty(&file).context("serializing keypair")?;
        write_secret_file(path, json.as_bytes())
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Hex-encoded public key, as published in the roster.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }

    /// Sign arbitrary bytes, returning the raw 64-byte signature.
    pub fn sign(&self, payload: &[u8]) -> Signature {
        self.key.sign(payload)
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("NodeIdentity")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

/// Derive a short stable suffix from a public key for generated peer ids.
fn uuid_like_suffix(key: &VerifyingKey) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(key.to_bytes());
    hex::encode(&digest[..8])
}

/// Write `data` to `path` with mode 0o600 on Unix (owner-read/write only).
fn write_secret_file(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("writing secret file {}", path.display()))?;
        f.write_all(data)?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, data)
            .with_context(|| format!("writing secret file {}", path.display()))?;
    }
    Ok(())
}

// ── Trusted roster ────────────────────────────────────────────────────────────

/// Peer id → verifying key map used to check inbound request signatures.
///
/// Loaded from a JSON object `{ "<peer-id>": "<hex public key>", … }`.
/// Only the enrollment path mutates it after boot.
#[derive(Debug, Default, Clone)]
pub struct TrustedKeys {
    keys: HashMap<String, VerifyingKey>,
}

impl TrustedKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading trusted keys {}", path.display()))?;
        Self::from_json(&text)
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let raw: HashMap<String, String> =
            serde_json::from_str(json).context("parsing trusted keys JSON")?;
        let mut keys = HashMap::with_capacity(raw.len());
        for (peer_id, key_hex) in raw {
            keys.insert(peer_id, parse_public_key(&key_hex)?);
        }
        Ok(Self { keys })
    }

    pub fn get(&self, peer_id: &str) -> Option<&VerifyingKey> {
        self.keys.get(peer_id)
    }

    pub fn insert(&mut self, peer_id: impl Into<String>, key: VerifyingKey) {
        self.keys.insert(peer_id.into(), key);
    }

    pub fn insert_hex(&mut self, peer_id: impl Into<String>, key_hex: &str) -> anyhow::Result<()> {
        self.keys.insert(peer_id.into(), parse_public_key(key_hex)?);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Verify `signature` over `payload` for `peer_id`.
    ///
    /// Returns `false` both for unknown peers and for bad signatures; callers
    /// that need to distinguish should check [`TrustedKeys::get`] first.
    pub fn verify(&self, peer_id: &str, payload: &[u8], signature: &Signature) -> bool {
        match self.keys.get(peer_id) {
            Some(key) => key.verify(payload, signature).is_ok(),
            None => false,
        }
    }
}

/// Parse a hex-encoded 32-byte Ed25519 public key.
pub fn parse_public_key(key_hex: &str) -> anyhow::Result<VerifyingKey> {
    let bytes = hex::decode(key_hex.trim()).context("decoding public key hex")?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("public key must be 32 bytes"))?;
    VerifyingKey::from_bytes(&arr).context("invalid Ed25519 public key")
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_identity_signs_and_verifies() {
        let id = NodeIdentity::generate();
        let sig = id.sign(b"payload");
        assert!(id.verifying_key().verify(b"payload", &sig).is_ok());
    }

    #[test]
    fn two_identities_have_distinct_peer_ids() {
        let a = NodeIdentity::generate();
        let b = NodeIdentity::generate();
        assert_ne!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn load_or_generate_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.key");
        let first = NodeIdentity::load_or_generate(&path, Some("edge-test-1")).unwrap();
        let second = NodeIdentity::load_or_generate(&path, Some("ignored")).unwrap();
        assert_eq!(first.peer_id(), "edge-test-1");
        assert_eq!(second.peer_id(), "edge-test-1", "existing file id must win");
        assert_eq!(first.public_key_hex(), second.public_key_hex());
    }

    #[cfg(unix)]
    #[test]
    fn keypair_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.key");
        NodeIdentity::load_or_generate(&path, None).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn trusted_keys_verify_known_peer() {
        let id = NodeIdentity::generate();
        let mut roster = TrustedKeys::new();
        roster.insert(id.peer_id(), id.verifying_key());
        let sig = id.sign(b"hello");
        assert!(roster.verify(id.peer_id(), b"hello", &sig));
    }

    #[test]
    fn trusted_keys_reject_unknown_peer() {
        let id = NodeIdentity::generate();
        let roster = TrustedKeys::new();
        let sig = id.sign(b"hello");
        assert!(!roster.verify(id.peer_id(), b"hello", &sig));
    }

    #[test]
    fn trusted_keys_reject_wrong_payload() {
        let id = NodeIdentity::generate();
        let mut roster = TrustedKeys::new();
        roster.insert(id.peer_id(), id.verifying_key());
        let sig = id.sign(b"hello");
        assert!(!roster.verify(id.peer_id(), b"tampered", &sig));
    }

    #[test]
    fn roster_loads_from_json() {
        let id = NodeIdentity::generate();
        let json = format!(r#"{{"{}": "{}"}}"#, id.peer_id(), id.public_key_hex());
        let roster = TrustedKeys::from_json(&json).unwrap();
        assert_eq!(roster.len(), 1);
        assert!(roster.get(id.peer_id()).is_some());
    }

    #[test]
    fn roster_rejects_malformed_key() {
        let json = r#"{"peer-a": "not-hex"}"#;
        assert!(TrustedKeys::from_json(json).is_err());
    }
}
