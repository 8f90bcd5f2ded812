//! Password-based file encryption.
//!
//! Files are encrypted whole: the content is buffered, padded with PKCS#7,
//! encrypted with AES-256-CBC under a key derived from the shared password
//! with PBKDF2-HMAC-SHA256, and shipped as `salt ++ iv ++ ciphertext`.
//! Salt and IV are drawn from the OS RNG for every file.

use std::fs;
use std::path::{Path, PathBuf};

use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{ProtocolError, Result};
use crate::metadata::unique_path;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Salt length in bytes.
pub const SALT_LEN: usize = 16;

/// IV length in bytes (one AES block).
pub const IV_LEN: usize = 16;

/// Derived key length in bytes (AES-256).
pub const KEY_LEN: usize = 32;

/// PBKDF2 iteration count shared by every peer implementation.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Suffix appended to the name of an encrypted file on the wire and on disk.
pub const CRYPT_SUFFIX: &str = ".crypt";

/// Derive the AES key for a password and salt.
pub fn derive_key(password: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Typed view over an encrypted payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub salt: [u8; SALT_LEN],
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
}

impl EncryptedBlob {
    /// Split a wire payload into salt, IV and ciphertext.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SALT_LEN + IV_LEN {
            return Err(ProtocolError::Decryption(format!(
                "encrypted payload too short: {} bytes",
                bytes.len()
            )));
        }

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&bytes[..SALT_LEN]);
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&bytes[SALT_LEN..SALT_LEN + IV_LEN]);

        Ok(Self {
            salt,
            iv,
            ciphertext: bytes[SALT_LEN + IV_LEN..].to_vec(),
        })
    }

    /// Serialize to `salt ++ iv ++ ciphertext`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut output = Vec::with_capacity(SALT_LEN + IV_LEN + self.ciphertext.len());
        output.extend_from_slice(&self.salt);
        output.extend_from_slice(&self.iv);
        output.extend_from_slice(&self.ciphertext);
        output
    }

    /// Decrypt with the given password.
    pub fn decrypt(&self, password: &str) -> Result<Vec<u8>> {
        if self.ciphertext.is_empty() || self.ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(ProtocolError::Decryption(format!(
                "ciphertext length {} is not a positive multiple of the block size",
                self.ciphertext.len()
            )));
        }

        let key = derive_key(password, &self.salt);
        Aes256CbcDec::new(&key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&self.ciphertext)
            .map_err(|_| {
                ProtocolError::Decryption("padding check failed, wrong password?".to_string())
            })
    }
}

/// Encrypt bytes with a fresh salt and IV.
pub fn encrypt_stream(plaintext: &[u8], password: &str) -> Vec<u8> {
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut iv);

    let key = derive_key(password, &salt);
    let ciphertext =
        Aes256CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    EncryptedBlob {
        salt,
        iv,
        ciphertext,
    }
    .to_bytes()
}

/// Decrypt a `salt ++ iv ++ ciphertext` blob.
pub fn decrypt_stream(blob: &[u8], password: &str) -> Result<Vec<u8>> {
    EncryptedBlob::parse(blob)?.decrypt(password)
}

/// Returns `name.crypt` for `name`.
pub fn crypt_name(name: &str) -> String {
    format!("{}{}", name, CRYPT_SUFFIX)
}

/// Strips a trailing `.crypt`, if present.
pub fn strip_crypt_suffix(name: &str) -> &str {
    name.strip_suffix(CRYPT_SUFFIX).unwrap_or(name)
}

/// Encrypt a whole file into `temp_dir/<file name>.crypt`.
///
/// Returns the path of the encrypted copy. The caller deletes it once sent.
pub fn encrypt_file(source: &Path, temp_dir: &Path, password: &str) -> Result<PathBuf> {
    let plaintext = fs::read(source).map_err(|e| ProtocolError::filesystem(source, e))?;

    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            ProtocolError::Filesystem(format!("{} has no file name", source.display()))
        })?;

    fs::create_dir_all(temp_dir).map_err(|e| ProtocolError::filesystem(temp_dir, e))?;
    let target = unique_path(&temp_dir.join(crypt_name(&file_name)));

    fs::write(&target, encrypt_stream(&plaintext, password))
        .map_err(|e| ProtocolError::filesystem(&target, e))?;

    Ok(target)
}

/// Decrypt `<name>.crypt` into `<name>` in the same directory.
///
/// The plaintext is written only after decryption succeeded, and never over
/// an existing file. Returns the path of the decrypted file.
pub fn decrypt_file(path: &Path, password: &str) -> Result<PathBuf> {
    let blob = fs::read(path).map_err(|e| ProtocolError::filesystem(path, e))?;
    let plaintext = decrypt_stream(&blob, password)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let plain_name = strip_crypt_suffix(&file_name);
    if plain_name.is_empty() {
        return Err(ProtocolError::Filesystem(format!(
            "{} has no usable file name",
            path.display()
        )));
    }

    let target = unique_path(&path.with_file_name(plain_name));
    fs::write(&target, plaintext).map_err(|e| ProtocolError::filesystem(&target, e))?;

    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_derive_key_is_deterministic() {
        let salt = [3u8; SALT_LEN];
        assert_eq!(derive_key("hunter2", &salt), derive_key("hunter2", &salt));
        assert_ne!(derive_key("hunter2", &salt), derive_key("hunter3", &salt));
        assert_ne!(derive_key("hunter2", &salt), derive_key("hunter2", &[4u8; SALT_LEN]));
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let plaintext: Vec<u8> = (0..5000).map(|i| (i % 251) as u8).collect();
        let blob = encrypt_stream(&plaintext, "correct horse");
        assert_eq!(decrypt_stream(&blob, "correct horse").unwrap(), plaintext);
    }

    #[test]
    fn test_empty_plaintext_roundtrip() {
        let blob = encrypt_stream(b"", "pw");
        // One full block of padding.
        assert_eq!(blob.len(), SALT_LEN + IV_LEN + BLOCK_SIZE);
        assert!(decrypt_stream(&blob, "pw").unwrap().is_empty());
    }

    #[test]
    fn test_blob_layout() {
        let blob = encrypt_stream(&[0u8; 20], "pw");
        // 20 bytes pad to 32.
        assert_eq!(blob.len(), SALT_LEN + IV_LEN + 32);

        let parsed = EncryptedBlob::parse(&blob).unwrap();
        assert_eq!(&parsed.salt[..], &blob[..16]);
        assert_eq!(&parsed.iv[..], &blob[16..32]);
        assert_eq!(parsed.to_bytes(), blob);
    }

    #[test]
    fn test_salt_and_iv_are_fresh() {
        let a = EncryptedBlob::parse(&encrypt_stream(b"same", "pw")).unwrap();
        let b = EncryptedBlob::parse(&encrypt_stream(b"same", "pw")).unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_wrong_password_never_yields_plaintext() {
        let plaintext = b"the quick brown fox jumps over the lazy dog".to_vec();
        let blob = encrypt_stream(&plaintext, "right");
        match decrypt_stream(&blob, "wrong") {
            Err(err) => assert!(matches!(err, ProtocolError::Decryption(_))),
            Ok(output) => assert_ne!(output, plaintext),
        }
    }

    #[test]
    fn test_truncated_blob_is_decryption_error() {
        let err = decrypt_stream(&[0u8; 20], "pw").unwrap_err();
        assert!(matches!(err, ProtocolError::Decryption(_)));

        let mut blob = encrypt_stream(b"hello", "pw");
        blob.pop();
        let err = decrypt_stream(&blob, "pw").unwrap_err();
        assert!(matches!(err, ProtocolError::Decryption(_)));
    }

    #[test]
    fn test_crypt_names() {
        assert_eq!(crypt_name("a.txt"), "a.txt.crypt");
        assert_eq!(strip_crypt_suffix("a.txt.crypt"), "a.txt");
        assert_eq!(strip_crypt_suffix("a.txt"), "a.txt");
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let temp = dir.path().join("tmp");
        let source = dir.path().join("notes.txt");
        fs::write(&source, b"meeting at noon").unwrap();

        let encrypted = encrypt_file(&source, &temp, "pw").unwrap();
        assert_eq!(encrypted, temp.join("notes.txt.crypt"));

        // Move next to a pre-existing plaintext of the same name.
        let inbox = dir.path().join("inbox");
        fs::create_dir_all(&inbox).unwrap();
        fs::write(inbox.join("notes.txt"), b"older").unwrap();
        let received = inbox.join("notes.txt.crypt");
        fs::rename(&encrypted, &received).unwrap();

        let output = decrypt_file(&received, "pw").unwrap();
        assert_eq!(output, inbox.join("notes (1).txt"));
        assert_eq!(fs::read(&output).unwrap(), b"meeting at noon");
        assert_eq!(fs::read(inbox.join("notes.txt")).unwrap(), b"older");
    }

    #[test]
    fn test_failed_file_decryption_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin.crypt");
        fs::write(&path, [0u8; 40]).unwrap();

        assert!(decrypt_file(&path, "pw").is_err());
        assert!(!dir.path().join("data.bin").exists());
    }
}
