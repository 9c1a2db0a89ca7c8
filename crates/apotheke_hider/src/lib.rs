//! Keyed string obfuscation with compression, used for hidden columns.
//!
//! `conceal` deflate-compresses the plaintext, applies a keystream derived
//! from the key, and base64-encodes the result so it can live in a TEXT
//! column. `reveal` is the exact inverse. This is obfuscation against casual
//! inspection of the store file, not encryption.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HideError {
    #[error("malformed hidden value: {message}")]
    Malformed { message: String },
}

impl HideError {
    fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }
}

const KEYSTREAM_BLOCK: usize = 32;

/// XOR `data` in place with a SHA-256 keystream of `key || block_index`.
fn apply_keystream(data: &mut [u8], key: &str) {
    for (block_index, block) in data.chunks_mut(KEYSTREAM_BLOCK).enumerate() {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hasher.update((block_index as u64).to_le_bytes());
        let pad = hasher.finalize();
        for (byte, pad_byte) in block.iter_mut().zip(pad.iter()) {
            *byte ^= pad_byte;
        }
    }
}

/// Obfuscate `plain` under `key`. Infallible; any string round-trips through
/// [`reveal`] with the same key.
pub fn conceal(plain: &str, key: &str) -> String {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    // Writing to a Vec cannot fail.
    let _ = encoder.write_all(plain.as_bytes());
    let mut compressed = encoder.finish().unwrap_or_default();
    apply_keystream(&mut compressed, key);
    BASE64.encode(compressed)
}

/// Recover the plaintext produced by [`conceal`] with the same key. Fails on
/// values that were not produced by `conceal`, were concealed under a
/// different key, or were corrupted in storage.
pub fn reveal(hidden: &str, key: &str) -> Result<String, HideError> {
    let mut data = BASE64
        .decode(hidden)
        .map_err(|err| HideError::malformed(format!("base64: {err}")))?;
    apply_keystream(&mut data, key);
    let mut decoder = DeflateDecoder::new(data.as_slice());
    let mut plain = Vec::new();
    decoder
        .read_to_end(&mut plain)
        .map_err(|err| HideError::malformed(format!("inflate: {err}")))?;
    String::from_utf8(plain).map_err(|err| HideError::malformed(format!("utf-8: {err}")))
}
