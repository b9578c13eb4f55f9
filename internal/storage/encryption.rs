use crate::error::{Error, Result};
use crate::util::config::EncryptionConfig;
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub const MAGIC: &[u8; 4] = b"BAKT";
pub const FORMAT_VERSION: u8 = 1;
pub const ALGORITHM: &str = "aes-256-gcm";

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const WRITE_CHUNK: usize = 64 * 1024;

const KEY_SALT: &[u8] = b"baktainer-default-salt";
const PASSPHRASE_SALT: &[u8] = b"baktainer-backup-encryption-salt";
const PBKDF2_ROUNDS: u32 = 100_000;

/// Sidecar describing an encrypted artifact, written beside the ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptionSidecar {
    pub algorithm: String,
    pub original_file: String,
    pub original_size: u64,
    pub encrypted_size: u64,
    pub encrypted_at: DateTime<Utc>,
    pub key_fingerprint: String,
}

/// AES-256-GCM file encryptor. The key is derived once at startup and only
/// ever lives in memory.
#[derive(Clone)]
pub struct Encryptor {
    key: [u8; 32],
}

impl Encryptor {
    pub fn from_config(config: &EncryptionConfig) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        let key = if let Some(raw) = config.key.as_deref() {
            resolve_key_material(raw)?
        } else if let Some(path) = config.key_file.as_deref() {
            let raw = std::fs::read_to_string(path).map_err(|err| {
                Error::Encryption(format!("key file {} unreadable: {err}", path.display()))
            })?;
            resolve_key_material(raw.trim_end_matches(['\r', '\n']))?
        } else if let Some(passphrase) = config.passphrase.as_deref() {
            derive_key(passphrase.as_bytes(), PASSPHRASE_SALT)
        } else {
            return Err(Error::Encryption("no encryption key material configured".into()));
        };
        Ok(Some(Self { key }))
    }

    pub fn with_key(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// First 16 hex chars of sha256(key), for sidecar correlation.
    pub fn key_fingerprint(&self) -> String {
        let digest = Sha256::digest(self.key);
        digest
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<String>()[..16]
            .to_string()
    }

    /// Encrypt `src` into `<src>.encrypted`, write the encryption sidecar,
    /// then best-effort shred the plaintext. Returns the ciphertext path.
    pub async fn encrypt_file(&self, src: &Path) -> Result<PathBuf> {
        let dst = encrypted_path(src);
        match self.encrypt_file_inner(src, &dst).await {
            Ok(original_size) => {
                self.write_sidecar(src, &dst, original_size).await;
                shred_file(src).await;
                Ok(dst)
            }
            Err(err) => {
                let _ = fs::remove_file(&dst).await;
                Err(err)
            }
        }
    }

    async fn encrypt_file_inner(&self, src: &Path, dst: &Path) -> Result<u64> {
        let plaintext = fs::read(src)
            .await
            .map_err(|err| Error::Encryption(format!("read {} failed: {err}", src.display())))?;
        let original_size = plaintext.len() as u64;

        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_slice())
            .map_err(|_| Error::Encryption("encryption failed".into()))?;

        let mut file = fs::File::create(dst)
            .await
            .map_err(|err| Error::Encryption(format!("create {} failed: {err}", dst.display())))?;
        write_all(&mut file, &header()).await?;
        write_all(&mut file, &iv).await?;
        for chunk in ciphertext.chunks(WRITE_CHUNK) {
            write_all(&mut file, chunk).await?;
        }
        file.sync_all()
            .await
            .map_err(|err| Error::Encryption(format!("sync failed: {err}")))?;
        Ok(original_size)
    }

    async fn write_sidecar(&self, src: &Path, dst: &Path, original_size: u64) {
        let encrypted_size = fs::metadata(dst).await.map(|m| m.len()).unwrap_or(0);
        let sidecar = EncryptionSidecar {
            algorithm: ALGORITHM.to_string(),
            original_file: file_name(src),
            original_size,
            encrypted_size,
            encrypted_at: Utc::now(),
            key_fingerprint: self.key_fingerprint(),
        };
        let path = sidecar_path(dst);
        match serde_json::to_string(&sidecar) {
            Ok(body) => {
                if let Err(err) = fs::write(&path, body.as_bytes()).await {
                    tracing::warn!(path = %path.display(), error = %err, "encryption sidecar write failed");
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "encryption sidecar encode failed");
            }
        }
    }

    /// Decrypt `src` into `dst`. The authentication tag is verified before a
    /// single plaintext byte is written; failures remove `dst`.
    pub async fn decrypt_file(&self, src: &Path, dst: &Path) -> Result<()> {
        let result = self.decrypt_file_inner(src, dst).await;
        if result.is_err() {
            let _ = fs::remove_file(dst).await;
        }
        result
    }

    async fn decrypt_file_inner(&self, src: &Path, dst: &Path) -> Result<()> {
        let payload = fs::read(src)
            .await
            .map_err(|err| Error::Encryption(format!("read {} failed: {err}", src.display())))?;
        let body = parse_header(&payload)?;
        if body.len() < IV_LEN + TAG_LEN {
            return Err(Error::Encryption("ciphertext is truncated".into()));
        }
        let (iv, ciphertext) = body.split_at(IV_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| Error::Encryption("authentication failed".into()))?;
        fs::write(dst, &plaintext)
            .await
            .map_err(|err| Error::Encryption(format!("write {} failed: {err}", dst.display())))?;
        Ok(())
    }

    /// Round-trip a scratch file to prove the key actually works.
    pub async fn verify_key(&self, scratch_dir: &Path) -> Result<()> {
        let token = Uuid::new_v4();
        let plain = scratch_dir.join(format!(".bt-keycheck-{token}"));
        let restored = scratch_dir.join(format!(".bt-keycheck-{token}.out"));
        let body = format!("baktainer key check {token}");
        fs::write(&plain, body.as_bytes())
            .await
            .map_err(|err| Error::Encryption(format!("key check write failed: {err}")))?;

        let result = self.verify_key_inner(&plain, &restored, body.as_bytes()).await;
        for path in [&plain, &restored] {
            let _ = fs::remove_file(path).await;
        }
        let _ = fs::remove_file(sidecar_path(&encrypted_path(&plain))).await;
        let _ = fs::remove_file(encrypted_path(&plain)).await;
        result
    }

    async fn verify_key_inner(&self, plain: &Path, restored: &Path, expected: &[u8]) -> Result<()> {
        let encrypted = self.encrypt_file(plain).await?;
        self.decrypt_file(&encrypted, restored).await?;
        let round_trip = fs::read(restored)
            .await
            .map_err(|err| Error::Encryption(format!("key check read failed: {err}")))?;
        if round_trip != expected {
            return Err(Error::Encryption("key check round-trip mismatch".into()));
        }
        Ok(())
    }
}

pub fn encrypted_path(src: &Path) -> PathBuf {
    let mut os_string = src.as_os_str().to_owned();
    os_string.push(".encrypted");
    PathBuf::from(os_string)
}

fn sidecar_path(encrypted: &Path) -> PathBuf {
    let mut os_string = encrypted.as_os_str().to_owned();
    os_string.push(".enc.meta");
    PathBuf::from(os_string)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub fn header() -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 1 + 1 + ALGORITHM.len());
    out.extend_from_slice(MAGIC);
    out.push(FORMAT_VERSION);
    out.push(ALGORITHM.len() as u8);
    out.extend_from_slice(ALGORITHM.as_bytes());
    out
}

/// Validate the framed header and return everything after it (IV onwards).
fn parse_header(payload: &[u8]) -> Result<&[u8]> {
    if payload.len() < 6 || !payload.starts_with(MAGIC) {
        return Err(Error::Encryption("missing BAKT magic".into()));
    }
    if payload[4] != FORMAT_VERSION {
        return Err(Error::Encryption(format!(
            "unsupported format version {}",
            payload[4]
        )));
    }
    let alg_len = payload[5] as usize;
    let alg_end = 6 + alg_len;
    if payload.len() < alg_end {
        return Err(Error::Encryption("header is truncated".into()));
    }
    let algorithm = &payload[6..alg_end];
    if algorithm != ALGORITHM.as_bytes() {
        return Err(Error::Encryption(format!(
            "unsupported algorithm '{}'",
            String::from_utf8_lossy(algorithm)
        )));
    }
    Ok(&payload[alg_end..])
}

/// Raw 32 bytes, 64 hex chars, `base64:` payload, or PBKDF2 derivation.
pub fn resolve_key_material(input: &str) -> Result<[u8; 32]> {
    if input.len() == 32 {
        let mut key = [0u8; 32];
        key.copy_from_slice(input.as_bytes());
        return Ok(key);
    }
    if input.len() == 64 && input.bytes().all(|b| b.is_ascii_hexdigit()) {
        return decode_hex_key(input);
    }
    if let Some(encoded) = input.strip_prefix("base64:") {
        use base64::engine::general_purpose::STANDARD as Base64;
        use base64::Engine;
        let decoded = Base64
            .decode(encoded.as_bytes())
            .map_err(|_| Error::Encryption("base64 key payload is invalid".into()))?;
        if decoded.len() != 32 {
            return Err(Error::Encryption(format!(
                "base64 key must decode to 32 bytes (got {})",
                decoded.len()
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&decoded);
        return Ok(key);
    }
    Ok(derive_key(input.as_bytes(), KEY_SALT))
}

fn decode_hex_key(input: &str) -> Result<[u8; 32]> {
    let mut key = [0u8; 32];
    for (index, chunk) in input.as_bytes().chunks(2).enumerate() {
        let hex = std::str::from_utf8(chunk)
            .map_err(|_| Error::Encryption("hex key is not ascii".into()))?;
        key[index] = u8::from_str_radix(hex, 16)
            .map_err(|_| Error::Encryption("hex key contains invalid digits".into()))?;
    }
    Ok(key)
}

fn derive_key(input: &[u8], salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(input, salt, PBKDF2_ROUNDS, &mut key);
    key
}

async fn write_all(file: &mut fs::File, data: &[u8]) -> Result<()> {
    file.write_all(data)
        .await
        .map_err(|err| Error::Encryption(format!("write failed: {err}")))
}

/// Size-preserving random overwrite, sync, unlink. Best effort only: the
/// plaintext already left the machine-readable path once the ciphertext is
/// published, so failures log instead of failing the pipeline.
async fn shred_file(path: &Path) {
    let Ok(metadata) = fs::metadata(path).await else {
        return;
    };
    let size = metadata.len() as usize;
    let mut noise = vec![0u8; size];
    OsRng.fill_bytes(&mut noise);
    match fs::File::create(path).await {
        Ok(mut file) => {
            if file.write_all(&noise).await.is_ok() {
                let _ = file.sync_all().await;
            }
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "plaintext overwrite failed");
        }
    }
    if let Err(err) = fs::remove_file(path).await {
        tracing::warn!(path = %path.display(), error = %err, "plaintext unlink failed");
    }
}

#[cfg(test)]
mod tests {
    use super::{
        encrypted_path, header, parse_header, resolve_key_material, Encryptor, ALGORITHM,
        FORMAT_VERSION, MAGIC,
    };
    use crate::error::Error;
    use crate::util::config::EncryptionConfig;
    use std::path::PathBuf;
    use tokio::fs;
    use uuid::Uuid;

    async fn new_temp_dir() -> PathBuf {
        let path = std::env::temp_dir().join(format!("bt-encryption-{}", Uuid::new_v4()));
        fs::create_dir_all(&path).await.expect("create dir");
        path
    }

    fn zero_key_encryptor() -> Encryptor {
        Encryptor::with_key([0u8; 32])
    }

    #[test]
    fn header_is_byte_exact() {
        let bytes = header();
        assert_eq!(&bytes[..4], MAGIC);
        assert_eq!(bytes[4], FORMAT_VERSION);
        assert_eq!(bytes[5], ALGORITHM.len() as u8);
        assert_eq!(&bytes[6..], ALGORITHM.as_bytes());
        assert_eq!(bytes, b"BAKT\x01\x0baes-256-gcm");
    }

    #[test]
    fn parse_header_rejects_malformed_frames() {
        assert!(parse_header(b"BAK").is_err());
        assert!(parse_header(b"NOPE\x01\x0baes-256-gcm").is_err());
        assert!(parse_header(b"BAKT\x02\x0baes-256-gcm").is_err());
        assert!(parse_header(b"BAKT\x01\x0baes-256-gc").is_err());
        assert!(parse_header(b"BAKT\x01\x08aes-128-").is_err());
        let frame = header();
        assert_eq!(parse_header(&frame).expect("parse"), b"");
    }

    #[test]
    fn key_material_resolution_order() {
        let raw = "0123456789abcdef0123456789abcdef";
        assert_eq!(&resolve_key_material(raw).expect("raw"), raw.as_bytes());

        let hex = "00ff".repeat(16);
        let key = resolve_key_material(&hex).expect("hex");
        assert_eq!(key[0], 0x00);
        assert_eq!(key[1], 0xff);

        let b64 = format!("base64:{}", {
            use base64::engine::general_purpose::STANDARD as Base64;
            use base64::Engine;
            Base64.encode([7u8; 32])
        });
        assert_eq!(resolve_key_material(&b64).expect("base64"), [7u8; 32]);

        let derived = resolve_key_material("just a passphrase-ish string").expect("derived");
        let derived_again = resolve_key_material("just a passphrase-ish string").expect("derived");
        assert_eq!(derived, derived_again);
        assert_ne!(derived, [0u8; 32]);
    }

    #[test]
    fn base64_key_must_be_32_bytes() {
        use base64::engine::general_purpose::STANDARD as Base64;
        use base64::Engine;
        let short = format!("base64:{}", Base64.encode([1u8; 16]));
        assert!(resolve_key_material(&short).is_err());
        assert!(resolve_key_material("base64:!!!").is_err());
    }

    #[test]
    fn passphrase_and_key_derivations_use_distinct_salts() {
        let from_key = Encryptor::from_config(&EncryptionConfig {
            enabled: true,
            key: Some("shared secret".into()),
            key_file: None,
            passphrase: None,
        })
        .expect("config")
        .expect("enabled");
        let from_passphrase = Encryptor::from_config(&EncryptionConfig {
            enabled: true,
            key: None,
            key_file: None,
            passphrase: Some("shared secret".into()),
        })
        .expect("config")
        .expect("enabled");
        assert_ne!(from_key.key_fingerprint(), from_passphrase.key_fingerprint());
    }

    #[test]
    fn disabled_config_yields_no_encryptor() {
        let none = Encryptor::from_config(&EncryptionConfig {
            enabled: false,
            key: None,
            key_file: None,
            passphrase: None,
        })
        .expect("config");
        assert!(none.is_none());
    }

    #[test]
    fn key_fingerprint_is_16_hex_chars() {
        let fingerprint = zero_key_encryptor().key_fingerprint();
        assert_eq!(fingerprint.len(), 16);
        assert!(fingerprint.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn encrypt_decrypt_round_trip() {
        let dir = new_temp_dir().await;
        let plain = dir.join("app-1705338000.sql.gz");
        fs::write(&plain, b"hello").await.expect("write");

        let encryptor = zero_key_encryptor();
        let encrypted = encryptor.encrypt_file(&plain).await.expect("encrypt");
        assert_eq!(encrypted, encrypted_path(&plain));
        assert!(!plain.exists(), "plaintext must be shredded");

        let payload = fs::read(&encrypted).await.expect("read");
        assert_eq!(&payload[..6 + ALGORITHM.len()], header().as_slice());
        // header + 12-byte IV + ciphertext(5) + 16-byte tag
        assert_eq!(payload.len(), header().len() + 12 + 5 + 16);

        let restored = dir.join("restored.sql.gz");
        encryptor
            .decrypt_file(&encrypted, &restored)
            .await
            .expect("decrypt");
        assert_eq!(fs::read(&restored).await.expect("read"), b"hello");
    }

    #[tokio::test]
    async fn flipping_any_ciphertext_byte_fails_authentication() {
        let dir = new_temp_dir().await;
        let plain = dir.join("x.sql");
        fs::write(&plain, b"hello").await.expect("write");
        let encryptor = zero_key_encryptor();
        let encrypted = encryptor.encrypt_file(&plain).await.expect("encrypt");

        let original = fs::read(&encrypted).await.expect("read");
        let body_start = header().len() + 12;
        for index in body_start..original.len() {
            let mut tampered = original.clone();
            tampered[index] ^= 0x01;
            fs::write(&encrypted, &tampered).await.expect("write");
            let out = dir.join("out.sql");
            let err = encryptor.decrypt_file(&encrypted, &out).await.unwrap_err();
            assert!(
                matches!(&err, Error::Encryption(msg) if msg == "authentication failed"),
                "byte {index}: {err}"
            );
            assert!(!out.exists(), "tampered decrypt must not leave output");
        }
    }

    #[tokio::test]
    async fn decrypt_with_wrong_key_fails() {
        let dir = new_temp_dir().await;
        let plain = dir.join("x.sql");
        fs::write(&plain, b"some dump").await.expect("write");
        let encrypted = zero_key_encryptor().encrypt_file(&plain).await.expect("encrypt");

        let other = Encryptor::with_key([9u8; 32]);
        let out = dir.join("out.sql");
        let err = other.decrypt_file(&encrypted, &out).await.unwrap_err();
        assert!(err.to_string().contains("authentication failed"));
    }

    #[tokio::test]
    async fn encryption_sidecar_describes_the_artifact() {
        let dir = new_temp_dir().await;
        let plain = dir.join("app-1705338000.sql");
        fs::write(&plain, b"0123456789").await.expect("write");
        let encryptor = zero_key_encryptor();
        let encrypted = encryptor.encrypt_file(&plain).await.expect("encrypt");

        let sidecar_body = fs::read_to_string(super::sidecar_path(&encrypted))
            .await
            .expect("sidecar");
        let sidecar: super::EncryptionSidecar =
            serde_json::from_str(&sidecar_body).expect("parse");
        assert_eq!(sidecar.algorithm, ALGORITHM);
        assert_eq!(sidecar.original_file, "app-1705338000.sql");
        assert_eq!(sidecar.original_size, 10);
        assert_eq!(
            sidecar.encrypted_size,
            fs::metadata(&encrypted).await.expect("meta").len()
        );
        assert_eq!(sidecar.key_fingerprint, encryptor.key_fingerprint());
    }

    #[tokio::test]
    async fn verify_key_round_trips_on_scratch_files() {
        let dir = new_temp_dir().await;
        zero_key_encryptor().verify_key(&dir).await.expect("verify");
        let leftovers: Vec<_> = std::fs::read_dir(&dir)
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name())
            .collect();
        assert!(leftovers.is_empty(), "scratch files left behind: {leftovers:?}");
    }

    #[tokio::test]
    async fn encrypt_failure_cleans_partial_ciphertext() {
        let dir = new_temp_dir().await;
        let missing = dir.join("not-there.sql");
        let err = zero_key_encryptor().encrypt_file(&missing).await.unwrap_err();
        assert!(matches!(err, Error::Encryption(_)));
        assert!(!encrypted_path(&missing).exists());
    }
}
