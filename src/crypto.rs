use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::CryptoConfig;

const MASTER_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

const CREDENTIAL_PREFIX: &str = "aic_";
const CREDENTIAL_RANDOM_BYTES: usize = 32;
const CREDENTIAL_DISPLAY_PREFIX_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("master key v{0} not loaded")]
    KeyVersionNotLoaded(u32),
    #[error("failed to read master key file {path}: {source}")]
    KeyFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("master key must be {MASTER_KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("integrity check failed: tampered ciphertext or AAD mismatch")]
    Integrity,
    #[error("malformed encrypted record: {0}")]
    Malformed(&'static str),
    #[error("crypto backend failure")]
    Backend,
}

/// One encrypted upstream secret as persisted in `upstream_key_secret`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedSecret {
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub tag: Vec<u8>,
    pub aad: Option<String>,
    pub key_version: u32,
}

/// Versioned AES-256-GCM master keys. The current version encrypts new
/// records; older versions stay loaded to decrypt what references them.
/// Versions are add-only at runtime.
pub struct MasterKeyring {
    keys: RwLock<HashMap<u32, [u8; MASTER_KEY_LEN]>>,
    current_version: u32,
}

impl MasterKeyring {
    /// A keyring with no keys loaded. Encryption and decryption fail with
    /// `KeyVersionNotLoaded` until a key is added.
    pub fn empty(current_version: u32) -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            current_version,
        }
    }

    pub fn with_key(current_version: u32, key: [u8; MASTER_KEY_LEN]) -> Self {
        let keyring = Self::empty(current_version);
        keyring.add_key(current_version, key);
        keyring
    }

    /// Load the configured current-version key from disk.
    pub fn load(config: &CryptoConfig) -> Result<Self, CryptoError> {
        let key = read_key_file(&config.master_key_path, config.current_key_version)?;
        Ok(Self::with_key(config.current_key_version, key))
    }

    pub fn add_key(&self, version: u32, key: [u8; MASTER_KEY_LEN]) {
        self.keys
            .write()
            .expect("master keyring lock poisoned")
            .insert(version, key);
    }

    pub fn is_enabled(&self) -> bool {
        !self
            .keys
            .read()
            .expect("master keyring lock poisoned")
            .is_empty()
    }

    pub fn current_version(&self) -> u32 {
        self.current_version
    }

    pub fn encrypt(
        &self,
        plaintext: &str,
        aad: Option<&str>,
    ) -> Result<EncryptedSecret, CryptoError> {
        let version = self.current_version;
        let key = self.key_bytes(version)?;

        let rng = SystemRandom::new();
        let mut iv = [0u8; NONCE_LEN];
        rng.fill(&mut iv).map_err(|_| CryptoError::Backend)?;

        let sealing = less_safe_key(&key)?;
        let mut in_out = plaintext.as_bytes().to_vec();
        let aad_bytes: &[u8] = aad.map(str::as_bytes).unwrap_or(&[]);
        sealing
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(iv),
                Aad::from(aad_bytes),
                &mut in_out,
            )
            .map_err(|_| CryptoError::Backend)?;

        let tag = in_out.split_off(in_out.len() - TAG_LEN);
        Ok(EncryptedSecret {
            iv: iv.to_vec(),
            ciphertext: in_out,
            tag,
            aad: aad.map(str::to_string),
            key_version: version,
        })
    }

    pub fn decrypt(&self, secret: &EncryptedSecret) -> Result<String, CryptoError> {
        let key = self.key_bytes(secret.key_version)?;

        let iv: [u8; NONCE_LEN] = secret
            .iv
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::Malformed("iv must be 12 bytes"))?;
        if secret.tag.len() != TAG_LEN {
            return Err(CryptoError::Malformed("tag must be 16 bytes"));
        }

        let opening = less_safe_key(&key)?;
        let mut in_out = Vec::with_capacity(secret.ciphertext.len() + TAG_LEN);
        in_out.extend_from_slice(&secret.ciphertext);
        in_out.extend_from_slice(&secret.tag);
        let aad_bytes: &[u8] = secret.aad.as_deref().map(str::as_bytes).unwrap_or(&[]);

        let plaintext = opening
            .open_in_place(
                Nonce::assume_unique_for_key(iv),
                Aad::from(aad_bytes),
                &mut in_out,
            )
            .map_err(|_| CryptoError::Integrity)?;

        String::from_utf8(plaintext.to_vec())
            .map_err(|_| CryptoError::Malformed("plaintext is not UTF-8"))
    }

    fn key_bytes(&self, version: u32) -> Result<[u8; MASTER_KEY_LEN], CryptoError> {
        self.keys
            .read()
            .expect("master keyring lock poisoned")
            .get(&version)
            .copied()
            .ok_or(CryptoError::KeyVersionNotLoaded(version))
    }
}

fn less_safe_key(key: &[u8; MASTER_KEY_LEN]) -> Result<LessSafeKey, CryptoError> {
    let unbound = UnboundKey::new(&AES_256_GCM, key).map_err(|_| CryptoError::Backend)?;
    Ok(LessSafeKey::new(unbound))
}

/// Read a master key file containing either 32 raw bytes or their base64
/// encoding. When the exact path is absent, `<path>.v<version>` is tried.
fn read_key_file(path: &Path, version: u32) -> Result<[u8; MASTER_KEY_LEN], CryptoError> {
    let mut candidate = path.to_path_buf();
    if !candidate.exists() {
        candidate = PathBuf::from(format!("{}.v{version}", path.display()));
    }

    let mut key_bytes = std::fs::read(&candidate).map_err(|source| CryptoError::KeyFile {
        path: candidate.clone(),
        source,
    })?;

    if key_bytes.len() != MASTER_KEY_LEN {
        if let Ok(text) = std::str::from_utf8(&key_bytes) {
            if let Ok(decoded) = STANDARD.decode(text.trim()) {
                key_bytes = decoded;
            }
        }
    }

    let len = key_bytes.len();
    key_bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength(len))
}

/// A freshly minted client credential. The plaintext is shown once at
/// issuance; only the hash is ever persisted.
#[derive(Clone)]
pub struct GeneratedCredential {
    pub plaintext: String,
    pub prefix: String,
    pub hash: String,
}

pub fn generate_client_credential() -> Result<GeneratedCredential, CryptoError> {
    let rng = SystemRandom::new();
    let mut random = [0u8; CREDENTIAL_RANDOM_BYTES];
    rng.fill(&mut random).map_err(|_| CryptoError::Backend)?;

    let plaintext = format!("{CREDENTIAL_PREFIX}{}", URL_SAFE_NO_PAD.encode(random));
    let prefix = plaintext[..CREDENTIAL_DISPLAY_PREFIX_LEN.min(plaintext.len())].to_string();
    let hash = sha256_hex(&plaintext);

    Ok(GeneratedCredential {
        plaintext,
        prefix,
        hash,
    })
}

/// SHA-256 over the UTF-8 bytes of `input`, as 64 lowercase hex characters.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keyring() -> MasterKeyring {
        MasterKeyring::with_key(1, [7u8; MASTER_KEY_LEN])
    }

    #[test]
    fn sha256_hex_matches_known_vectors() {
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn sha256_hex_is_64_lowercase_hex_chars() {
        let digest = sha256_hex("anything at all");
        assert_eq!(digest.len(), 64);
        assert!(digest
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn generated_credentials_have_expected_shape() {
        let generated = generate_client_credential().unwrap();
        assert!(generated.plaintext.starts_with("aic_"));
        // 4-char prefix + 43 chars of base64url for 32 bytes, no padding.
        assert_eq!(generated.plaintext.len(), 47);
        assert_eq!(generated.prefix, generated.plaintext[..12]);
        assert_eq!(generated.hash, sha256_hex(&generated.plaintext));

        let other = generate_client_credential().unwrap();
        assert_ne!(generated.plaintext, other.plaintext);
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let keyring = test_keyring();
        let secret = keyring.encrypt("sk-upstream-secret", None).unwrap();
        assert_eq!(secret.iv.len(), 12);
        assert_eq!(secret.tag.len(), 16);
        assert_eq!(secret.key_version, 1);
        assert_eq!(keyring.decrypt(&secret).unwrap(), "sk-upstream-secret");
    }

    #[test]
    fn encrypt_decrypt_round_trip_with_aad() {
        let keyring = test_keyring();
        let secret = keyring.encrypt("payload", Some("tenant:acme")).unwrap();
        assert_eq!(secret.aad.as_deref(), Some("tenant:acme"));
        assert_eq!(keyring.decrypt(&secret).unwrap(), "payload");
    }

    #[test]
    fn fresh_iv_per_encryption() {
        let keyring = test_keyring();
        let first = keyring.encrypt("same plaintext", None).unwrap();
        let second = keyring.encrypt("same plaintext", None).unwrap();
        assert_ne!(first.iv, second.iv);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn tampering_any_component_fails_decryption() {
        let keyring = test_keyring();
        let original = keyring.encrypt("payload", Some("ctx")).unwrap();

        let mut tampered = original.clone();
        tampered.iv[0] ^= 0x01;
        assert!(matches!(
            keyring.decrypt(&tampered),
            Err(CryptoError::Integrity)
        ));

        let mut tampered = original.clone();
        tampered.ciphertext[0] ^= 0x01;
        assert!(matches!(
            keyring.decrypt(&tampered),
            Err(CryptoError::Integrity)
        ));

        let mut tampered = original.clone();
        tampered.tag[0] ^= 0x01;
        assert!(matches!(
            keyring.decrypt(&tampered),
            Err(CryptoError::Integrity)
        ));

        let mut tampered = original.clone();
        tampered.aad = Some("other".to_string());
        assert!(matches!(
            keyring.decrypt(&tampered),
            Err(CryptoError::Integrity)
        ));

        let mut tampered = original;
        tampered.aad = None;
        assert!(matches!(
            keyring.decrypt(&tampered),
            Err(CryptoError::Integrity)
        ));
    }

    #[test]
    fn decrypting_with_missing_key_version_is_distinct_from_tampering() {
        let keyring = test_keyring();
        let mut secret = keyring.encrypt("payload", None).unwrap();
        secret.key_version = 9;
        assert!(matches!(
            keyring.decrypt(&secret),
            Err(CryptoError::KeyVersionNotLoaded(9))
        ));
    }

    #[test]
    fn older_key_versions_remain_usable_after_rotation() {
        let keyring = MasterKeyring::with_key(2, [9u8; MASTER_KEY_LEN]);
        keyring.add_key(1, [7u8; MASTER_KEY_LEN]);

        let old = MasterKeyring::with_key(1, [7u8; MASTER_KEY_LEN])
            .encrypt("legacy", None)
            .unwrap();
        assert_eq!(old.key_version, 1);
        assert_eq!(keyring.decrypt(&old).unwrap(), "legacy");

        let fresh = keyring.encrypt("new", None).unwrap();
        assert_eq!(fresh.key_version, 2);
    }

    #[test]
    fn key_file_accepts_raw_and_base64_contents() {
        let dir = tempfile::tempdir().unwrap();

        let raw_path = dir.path().join("raw.key");
        std::fs::write(&raw_path, [3u8; 32]).unwrap();
        assert_eq!(read_key_file(&raw_path, 1).unwrap(), [3u8; 32]);

        let b64_path = dir.path().join("b64.key");
        std::fs::write(&b64_path, format!("{}\n", STANDARD.encode([5u8; 32]))).unwrap();
        assert_eq!(read_key_file(&b64_path, 1).unwrap(), [5u8; 32]);
    }

    #[test]
    fn key_file_falls_back_to_versioned_path() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("master.key");
        std::fs::write(PathBuf::from(format!("{}.v3", base.display())), [8u8; 32]).unwrap();
        assert_eq!(read_key_file(&base, 3).unwrap(), [8u8; 32]);
    }

    #[test]
    fn key_file_rejects_wrong_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.key");
        std::fs::write(&path, [1u8; 16]).unwrap();
        assert!(matches!(
            read_key_file(&path, 1),
            Err(CryptoError::InvalidKeyLength(16))
        ));
    }

    #[test]
    fn disabled_keyring_reports_missing_version() {
        let keyring = MasterKeyring::empty(1);
        assert!(!keyring.is_enabled());
        assert!(matches!(
            keyring.encrypt("x", None),
            Err(CryptoError::KeyVersionNotLoaded(1))
        ));
    }
}
