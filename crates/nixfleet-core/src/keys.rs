//! Nix-format ed25519 keys and signatures, plus node identities.
//!
//! Keys and signatures use the textual form Nix understands:
//! `<name>:<base64 bytes>`. A secret key carries the 64-byte keypair
//! (seed followed by public key); a public key carries 32 bytes; a
//! signature carries 64 bytes.

use std::fmt;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Split `<name>:<base64>` and decode the payload.
fn split_named(input: &str) -> Option<(&str, Vec<u8>)> {
    let (name, encoded) = input.trim().split_once(':')?;
    if name.is_empty() {
        return None;
    }
    let bytes = STANDARD.decode(encoded).ok()?;
    Some((name, bytes))
}

// ── Secret key ─────────────────────────────────────────────────────

/// Signing key used to sign narinfo fingerprints.
#[derive(Clone)]
pub struct SecretKey {
    name: String,
    signing: SigningKey,
}

impl SecretKey {
    /// Parse a key in Nix secret-key format (`name:base64(64 bytes)`).
    ///
    /// A bare 32-byte seed is accepted too.
    pub fn parse(input: &str) -> CoreResult<Self> {
        let (name, bytes) = split_named(input)
            .ok_or_else(|| CoreError::InvalidKey("expected <name>:<base64>".to_string()))?;

        let signing = match bytes.len() {
            64 => {
                let mut keypair = [0u8; 64];
                keypair.copy_from_slice(&bytes);
                SigningKey::from_keypair_bytes(&keypair)
                    .map_err(|e| CoreError::InvalidKey(e.to_string()))?
            }
            32 => {
                let mut seed = [0u8; 32];
                seed.copy_from_slice(&bytes);
                SigningKey::from_bytes(&seed)
            }
            n => {
                return Err(CoreError::InvalidKey(format!(
                    "secret key '{name}' has {n} bytes, expected 64"
                )));
            }
        };

        Ok(Self {
            name: name.to_string(),
            signing,
        })
    }

    /// Read and parse a secret key file.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Build a key from a raw 32-byte seed.
    pub fn from_seed(name: &str, seed: [u8; 32]) -> Self {
        Self {
            name: name.to_string(),
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// The signer name embedded in every signature this key produces.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            name: self.name.clone(),
            key: self.signing.verifying_key(),
        }
    }

    /// Produce a detached signature over `message`.
    pub fn sign(&self, message: &[u8]) -> NarSignature {
        let signature = self.signing.sign(message);
        NarSignature {
            name: self.name.clone(),
            bytes: signature.to_bytes().to_vec(),
        }
    }

    /// Render in Nix secret-key format.
    pub fn to_nix_string(&self) -> String {
        format!(
            "{}:{}",
            self.name,
            STANDARD.encode(self.signing.to_keypair_bytes())
        )
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKey")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

// ── Public key ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    name: String,
    key: VerifyingKey,
}

impl PublicKey {
    pub fn parse(input: &str) -> CoreResult<Self> {
        let (name, bytes) = split_named(input)
            .ok_or_else(|| CoreError::InvalidKey("expected <name>:<base64>".to_string()))?;
        let raw: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            CoreError::InvalidKey(format!("public key '{name}' must be 32 bytes"))
        })?;
        let key = VerifyingKey::from_bytes(&raw).map_err(|e| CoreError::InvalidKey(e.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            key,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.key.as_bytes()
    }

    /// True when `signature` was made by this key's name over `message`.
    pub fn verify(&self, message: &[u8], signature: &NarSignature) -> bool {
        if signature.name != self.name {
            return false;
        }
        let Ok(raw) = <[u8; 64]>::try_from(signature.bytes.as_slice()) else {
            return false;
        };
        self.key.verify(message, &Signature::from_bytes(&raw)).is_ok()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, STANDARD.encode(self.key.as_bytes()))
    }
}

// ── Signatures ─────────────────────────────────────────────────────

/// A named detached signature as it appears on a narinfo `Sig:` line.
///
/// Foreign signatures are kept byte-for-byte, so no length is enforced here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NarSignature {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl NarSignature {
    pub fn parse(input: &str) -> CoreResult<Self> {
        let (name, bytes) = split_named(input)
            .ok_or_else(|| CoreError::InvalidSignature(input.trim().to_string()))?;
        Ok(Self {
            name: name.to_string(),
            bytes,
        })
    }
}

impl fmt::Display for NarSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, STANDARD.encode(&self.bytes))
    }
}

// ── Node identity ──────────────────────────────────────────────────

/// Public-key-derived token identifying a fleet member.
///
/// Rendered as `N` followed by the upper-case hex of the ed25519 public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeIdentity(String);

impl NodeIdentity {
    pub fn from_public_key(key: &PublicKey) -> Self {
        Self(format!("N{}", hex::encode_upper(key.as_bytes())))
    }

    /// Accept an identity given by an operator. Only the character set is
    /// checked, so identities from other derivations still round-trip.
    pub fn parse(input: &str) -> CoreResult<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(CoreError::InvalidIdentity("empty".to_string()));
        }
        if !input
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(CoreError::InvalidIdentity(input.to_string()));
        }
        Ok(Self(input.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> SecretKey {
        SecretKey::from_seed("cache.example.org-1", [7u8; 32])
    }

    #[test]
    fn secret_key_roundtrips_through_nix_format() {
        let key = test_key();
        let parsed = SecretKey::parse(&key.to_nix_string()).unwrap();
        assert_eq!(parsed.name(), "cache.example.org-1");
        assert_eq!(parsed.public_key(), key.public_key());
    }

    #[test]
    fn secret_key_accepts_trailing_newline() {
        let text = format!("{}\n", test_key().to_nix_string());
        assert!(SecretKey::parse(&text).is_ok());
    }

    #[test]
    fn secret_key_rejects_garbage() {
        assert!(SecretKey::parse("no-colon-here").is_err());
        assert!(SecretKey::parse(":AAAA").is_err());
        assert!(SecretKey::parse("name:!!notbase64!!").is_err());
        assert!(SecretKey::parse("name:AAAA").is_err());
    }

    #[test]
    fn signature_verifies_with_public_key() {
        let key = test_key();
        let sig = key.sign(b"1;/nix/store/abc-foo;sha256:xyz;42;");
        assert_eq!(sig.name, key.name());
        assert_eq!(sig.bytes.len(), 64);

        let public = PublicKey::parse(&key.public_key().to_string()).unwrap();
        assert!(public.verify(b"1;/nix/store/abc-foo;sha256:xyz;42;", &sig));
        assert!(!public.verify(b"tampered", &sig));
    }

    #[test]
    fn signature_from_other_name_does_not_verify() {
        let key = test_key();
        let mut sig = key.sign(b"msg");
        sig.name = "someone-else".to_string();
        assert!(!key.public_key().verify(b"msg", &sig));
    }

    #[test]
    fn signature_text_roundtrip() {
        let sig = test_key().sign(b"hello");
        let parsed = NarSignature::parse(&sig.to_string()).unwrap();
        assert_eq!(parsed, sig);
    }

    #[test]
    fn node_identity_is_derived_from_public_key() {
        let id = NodeIdentity::from_public_key(&test_key().public_key());
        assert!(id.as_str().starts_with('N'));
        assert_eq!(id.as_str().len(), 65);
        assert_eq!(NodeIdentity::parse(id.as_str()).unwrap(), id);
    }

    #[test]
    fn node_identity_rejects_separators() {
        assert!(NodeIdentity::parse("").is_err());
        assert!(NodeIdentity::parse("a/b").is_err());
        assert!(NodeIdentity::parse("a b").is_err());
    }

    #[test]
    fn secret_key_debug_hides_material() {
        let rendered = format!("{:?}", test_key());
        assert!(rendered.contains("cache.example.org-1"));
        assert!(!rendered.contains(&test_key().to_nix_string()));
    }
}
