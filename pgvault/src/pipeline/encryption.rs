//! Per-file AES encryption. The key and IV derive from the operator's
//! master secret via the OpenSSL `EVP_BytesToKey` construction (SHA-1,
//! one iteration, no salt), so archives encrypted here interoperate with
//! `openssl enc` tooling. CBC mode pads with PKCS#7; CTR keeps the size.

use aes::cipher::{
    block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher,
};
use camino::{Utf8Path, Utf8PathBuf};
use sha1::{Digest, Sha1};
use tracing::trace;

use crate::conf::EncryptionMethod;
use crate::error::{Error, ErrorKind, Result};
use crate::pipeline::restrict_permissions;

pub const ENCRYPTED_SUFFIX: &str = ".aes";
const IV_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Cbc,
    Ctr,
}

fn method_params(method: EncryptionMethod) -> Option<(usize, Mode)> {
    match method {
        EncryptionMethod::None => None,
        EncryptionMethod::Aes128Cbc => Some((16, Mode::Cbc)),
        EncryptionMethod::Aes192Cbc => Some((24, Mode::Cbc)),
        EncryptionMethod::Aes256Cbc => Some((32, Mode::Cbc)),
        EncryptionMethod::Aes128Ctr => Some((16, Mode::Ctr)),
        EncryptionMethod::Aes192Ctr => Some((24, Mode::Ctr)),
        EncryptionMethod::Aes256Ctr => Some((32, Mode::Ctr)),
    }
}

/// `EVP_BytesToKey` with SHA-1 and a single iteration: hash rounds
/// `D_i = SHA1(D_{i-1} || secret)` concatenated until key and IV are
/// filled.
pub fn derive_key_iv(secret: &str, key_len: usize) -> (Vec<u8>, [u8; IV_LEN]) {
    let mut material = Vec::new();
    let mut previous: Vec<u8> = Vec::new();
    while material.len() < key_len + IV_LEN {
        let mut hasher = Sha1::new();
        hasher.update(&previous);
        hasher.update(secret.as_bytes());
        previous = hasher.finalize().to_vec();
        material.extend_from_slice(&previous);
    }
    let key = material[..key_len].to_vec();
    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&material[key_len..key_len + IV_LEN]);
    (key, iv)
}

fn encrypt_bytes(method: EncryptionMethod, secret: &str, data: &[u8]) -> Result<Vec<u8>> {
    let (key_len, mode) = method_params(method)
        .ok_or_else(|| Error::new(ErrorKind::ConfigInvalid, "encryption method is none"))?;
    let (key, iv) = derive_key_iv(secret, key_len);
    Ok(match (mode, key_len) {
        (Mode::Cbc, 16) => cbc::Encryptor::<aes::Aes128>::new_from_slices(&key, &iv)
            .expect("derived key/iv lengths are fixed")
            .encrypt_padded_vec_mut::<Pkcs7>(data),
        (Mode::Cbc, 24) => cbc::Encryptor::<aes::Aes192>::new_from_slices(&key, &iv)
            .expect("derived key/iv lengths are fixed")
            .encrypt_padded_vec_mut::<Pkcs7>(data),
        (Mode::Cbc, 32) => cbc::Encryptor::<aes::Aes256>::new_from_slices(&key, &iv)
            .expect("derived key/iv lengths are fixed")
            .encrypt_padded_vec_mut::<Pkcs7>(data),
        (Mode::Ctr, len) => {
            let mut out = data.to_vec();
            apply_ctr(len, &key, &iv, &mut out);
            out
        }
        _ => unreachable!(),
    })
}

fn decrypt_bytes(method: EncryptionMethod, secret: &str, data: &[u8]) -> Result<Vec<u8>> {
    let (key_len, mode) = method_params(method)
        .ok_or_else(|| Error::new(ErrorKind::ConfigInvalid, "encryption method is none"))?;
    let (key, iv) = derive_key_iv(secret, key_len);
    let bad_payload =
        || Error::new(ErrorKind::ChecksumMismatch, "decryption failed, wrong key or corrupt file");
    Ok(match (mode, key_len) {
        (Mode::Cbc, 16) => cbc::Decryptor::<aes::Aes128>::new_from_slices(&key, &iv)
            .expect("derived key/iv lengths are fixed")
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(|_| bad_payload())?,
        (Mode::Cbc, 24) => cbc::Decryptor::<aes::Aes192>::new_from_slices(&key, &iv)
            .expect("derived key/iv lengths are fixed")
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(|_| bad_payload())?,
        (Mode::Cbc, 32) => cbc::Decryptor::<aes::Aes256>::new_from_slices(&key, &iv)
            .expect("derived key/iv lengths are fixed")
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(|_| bad_payload())?,
        (Mode::Ctr, len) => {
            let mut out = data.to_vec();
            apply_ctr(len, &key, &iv, &mut out);
            out
        }
        _ => unreachable!(),
    })
}

fn apply_ctr(key_len: usize, key: &[u8], iv: &[u8; IV_LEN], data: &mut [u8]) {
    match key_len {
        16 => ctr::Ctr128BE::<aes::Aes128>::new_from_slices(key, iv)
            .expect("derived key/iv lengths are fixed")
            .apply_keystream(data),
        24 => ctr::Ctr128BE::<aes::Aes192>::new_from_slices(key, iv)
            .expect("derived key/iv lengths are fixed")
            .apply_keystream(data),
        32 => ctr::Ctr128BE::<aes::Aes256>::new_from_slices(key, iv)
            .expect("derived key/iv lengths are fixed")
            .apply_keystream(data),
        _ => unreachable!(),
    }
}

/// Encrypt one file in place: `<name>` becomes `<name>.aes`, the source
/// is deleted, the output is owner-only.
pub async fn encrypt_file(
    path: &Utf8Path,
    method: EncryptionMethod,
    secret: &str,
) -> Result<Utf8PathBuf> {
    if method.is_none() {
        return Ok(path.to_owned());
    }
    let input = tokio::fs::read(path).await?;
    let output = encrypt_bytes(method, secret, &input)?;
    let out_path = Utf8PathBuf::from(format!("{path}{ENCRYPTED_SUFFIX}"));
    tokio::fs::write(&out_path, &output).await?;
    restrict_permissions(&out_path)?;
    tokio::fs::remove_file(path).await?;
    trace!("encrypted {path} -> {out_path}");
    Ok(out_path)
}

/// Reverse [`encrypt_file`].
pub async fn decrypt_file(
    path: &Utf8Path,
    method: EncryptionMethod,
    secret: &str,
) -> Result<Utf8PathBuf> {
    let Some(stem) = path.as_str().strip_suffix(ENCRYPTED_SUFFIX) else {
        return Ok(path.to_owned());
    };
    let input = tokio::fs::read(path).await?;
    let output = decrypt_bytes(method, secret, &input)?;
    let out_path = Utf8PathBuf::from(stem.to_string());
    tokio::fs::write(&out_path, &output).await?;
    restrict_permissions(&out_path)?;
    tokio::fs::remove_file(path).await?;
    trace!("decrypted {path} -> {out_path}");
    Ok(out_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    #[test]
    fn key_derivation_is_stable_per_method() {
        let (key128, iv128) = derive_key_iv("master-secret", 16);
        let (key256, iv256) = derive_key_iv("master-secret", 32);
        assert_eq!(key128.len(), 16);
        assert_eq!(key256.len(), 32);
        // Same secret, same prefix of the hash stream.
        assert_eq!(&key256[..16], &key128[..]);
        // IV position shifts with the key length.
        assert_ne!(iv128, iv256);
        // Different secret, different material.
        let (other, _) = derive_key_iv("other", 16);
        assert_ne!(other, key128);
    }

    #[test]
    fn cbc_pads_ctr_preserves_size() {
        let data = vec![7u8; 100];
        let cbc = encrypt_bytes(EncryptionMethod::Aes256Cbc, "s", &data).unwrap();
        assert_eq!(cbc.len(), 112); // padded to the next 16-byte block
        let ctr = encrypt_bytes(EncryptionMethod::Aes256Ctr, "s", &data).unwrap();
        assert_eq!(ctr.len(), 100);
    }

    #[test]
    fn all_methods_roundtrip() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        for method in [
            EncryptionMethod::Aes128Cbc,
            EncryptionMethod::Aes192Cbc,
            EncryptionMethod::Aes256Cbc,
            EncryptionMethod::Aes128Ctr,
            EncryptionMethod::Aes192Ctr,
            EncryptionMethod::Aes256Ctr,
        ] {
            let encrypted = encrypt_bytes(method, "secret", &data).unwrap();
            assert_ne!(encrypted, data);
            let decrypted = decrypt_bytes(method, "secret", &encrypted).unwrap();
            assert_eq!(decrypted, data, "roundtrip failed for {method:?}");
        }
    }

    #[test]
    fn wrong_key_fails_cbc_padding() {
        let data = b"some relation data".to_vec();
        let encrypted = encrypt_bytes(EncryptionMethod::Aes256Cbc, "right", &data).unwrap();
        let err = decrypt_bytes(EncryptionMethod::Aes256Cbc, "wrong", &encrypted).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ChecksumMismatch);
    }

    #[tokio::test]
    async fn file_roundtrip_replaces_source() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("1259");
        tokio::fs::write(&path, b"block data").await.unwrap();

        let encrypted = encrypt_file(&path, EncryptionMethod::Aes128Ctr, "k").await.unwrap();
        assert_eq!(encrypted, dir.path().join("1259.aes"));
        assert!(!path.exists());

        let decrypted = decrypt_file(&encrypted, EncryptionMethod::Aes128Ctr, "k").await.unwrap();
        assert_eq!(decrypted, path);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"block data");
    }
}
