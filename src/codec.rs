//! Compression and encryption codec (spec §4.1, §6 "Encoded-blob format").
//!
//! Two entry points: `encode = aes(compress(x))`, `decode =
//! decompress(aes⁻¹(y))`. Snapshots are compressed only (never
//! encrypted), so a lost key cannot strand snapshot structure; chunks
//! and file-metadata blobs are both compressed and encrypted.
//!
//! Grounded on `pbs-datastore/src/data_blob.rs` (buffered streaming
//! through a fixed encrypt/decrypt buffer) and its `CryptConfig`
//! (`src/backup/crypt_config.rs`): AES-256-GCM via `openssl::symm`, zstd
//! via the `zstd` crate's single-shot helpers.

use anyhow::{bail, Context as _, Error};
use openssl::symm::{Cipher, Crypter, Mode};

const GCM_IV_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;
const STREAM_BUFFER: usize = 32 * 1024;

/// Encryption key plus the fixed cipher choice, injected by the caller
/// (the KDF that derives this key from a passphrase is out of scope per
/// spec §4.1/§1).
#[derive(Clone)]
pub struct CryptConfig {
    cipher: Cipher,
    key: [u8; 32],
}

impl CryptConfig {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            cipher: Cipher::aes_256_gcm(),
            key,
        }
    }

    fn encrypt_to(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut iv = [0u8; GCM_IV_LEN];
        openssl::rand::rand_bytes(&mut iv)?;

        let mut crypter = Crypter::new(self.cipher, Mode::Encrypt, &self.key, Some(&iv))?;

        let mut out = Vec::with_capacity(data.len() + self.cipher.block_size());
        let max_input = STREAM_BUFFER - self.cipher.block_size();
        let mut buf = vec![0u8; STREAM_BUFFER];

        let mut start = 0;
        while start < data.len() {
            let end = (start + max_input).min(data.len());
            let count = crypter.update(&data[start..end], &mut buf)?;
            out.extend_from_slice(&buf[..count]);
            start = end;
        }
        let rest = crypter.finalize(&mut buf)?;
        out.extend_from_slice(&buf[..rest]);

        let mut tag = [0u8; GCM_TAG_LEN];
        crypter.get_tag(&mut tag)?;

        // self-delimiting: iv || tag || ciphertext
        let mut framed = Vec::with_capacity(GCM_IV_LEN + GCM_TAG_LEN + out.len());
        framed.extend_from_slice(&iv);
        framed.extend_from_slice(&tag);
        framed.extend_from_slice(&out);
        Ok(framed)
    }

    fn decrypt_from(&self, framed: &[u8]) -> Result<Vec<u8>, Error> {
        if framed.len() < GCM_IV_LEN + GCM_TAG_LEN {
            bail!("encrypted blob too small ({} bytes)", framed.len());
        }
        let iv = &framed[0..GCM_IV_LEN];
        let tag = &framed[GCM_IV_LEN..GCM_IV_LEN + GCM_TAG_LEN];
        let data = &framed[GCM_IV_LEN + GCM_TAG_LEN..];

        let mut crypter = Crypter::new(self.cipher, Mode::Decrypt, &self.key, Some(iv))?;
        crypter.set_tag(tag)?;

        let mut out = Vec::with_capacity(data.len());
        let max_input = STREAM_BUFFER - self.cipher.block_size();
        let mut buf = vec![0u8; STREAM_BUFFER];

        let mut start = 0;
        while start < data.len() {
            let end = (start + max_input).min(data.len());
            let count = crypter.update(&data[start..end], &mut buf)?;
            out.extend_from_slice(&buf[..count]);
            start = end;
        }
        let rest = crypter
            .finalize(&mut buf)
            .context("AEAD tag verification failed while decrypting blob")?;
        out.extend_from_slice(&buf[..rest]);

        Ok(out)
    }
}

/// Compress `data` with zstd at the default level.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, Error> {
    Ok(zstd::bulk::compress(data, 0)?)
}

/// Decompress zstd-compressed `data`. The decoder memory ceiling is set
/// generously (spec §4.1: "decoder memory ceiling ≥ 16 GiB") since these
/// blobs can be whole-file single chunks or large indexes.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut decoder = zstd::stream::Decoder::new(data)?;
    decoder.window_log_max(31)?; // ~2 GiB window; zstd's own ceiling
    let mut out = Vec::new();
    std::io::copy(&mut decoder, &mut out)?;
    Ok(out)
}

/// `encode = aes(compress(x))`. Used for chunks and file-metadata blobs.
pub fn encode_encrypted(data: &[u8], crypt: &CryptConfig) -> Result<Vec<u8>, Error> {
    let compressed = compress(data)?;
    crypt.encrypt_to(&compressed)
}

/// `decode = decompress(aes⁻¹(y))`.
pub fn decode_encrypted(data: &[u8], crypt: &CryptConfig) -> Result<Vec<u8>, Error> {
    let compressed = crypt.decrypt_from(data)?;
    decompress(&compressed)
}

/// Snapshots are compressed only, never encrypted (spec §3 invariant 6,
/// §4.1).
pub fn encode_plain(data: &[u8]) -> Result<Vec<u8>, Error> {
    compress(data)
}

pub fn decode_plain(data: &[u8]) -> Result<Vec<u8>, Error> {
    decompress(data)
}
