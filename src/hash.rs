// src/hash.rs

//! Content digests.
//!
//! Every digest in the store is a 32-byte Blake3 keyed-derivation output
//! under the fixed context string below — there is no algorithm
//! negotiation, by design.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use rand::RngCore;

/// Fixed context string for the keyed Blake3 derivation used throughout the
/// store. Changing this would silently reinterpret every existing digest.
pub const AWTFDB_CONTEXT: &str = "awtfdb Sun Mar 20 16:58:11 AM +00 2022 main hash key";

const STREAM_CHUNK_SIZE: usize = 8 * 1024;

/// Number of random bytes backing a tag core's identity.
pub const TAG_CORE_RANDOM_BYTES: usize = 128;

/// Number of random bytes backing a pool core's identity.
pub const POOL_CORE_RANDOM_BYTES: usize = 64;

/// `digest(bytes) = Blake3-KDF(key=AWTFDB_CONTEXT, input=bytes)[0..32]`.
pub fn digest(bytes: &[u8]) -> [u8; 32] {
    blake3::derive_key(AWTFDB_CONTEXT, bytes)
}

/// Hash a file's contents, streaming it in 8 KiB chunks so the buffer never
/// scales with file size.
pub fn digest_file(path: &Path) -> io::Result<[u8; 32]> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new_derive_key(AWTFDB_CONTEXT);
    let mut buf = [0u8; STREAM_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(*hasher.finalize().as_bytes())
}

/// Generate fresh randomness for a new tag core.
pub fn random_tag_core_data() -> Vec<u8> {
    random_bytes(TAG_CORE_RANDOM_BYTES)
}

/// Generate fresh randomness for a new pool core.
pub fn random_pool_core_data() -> Vec<u8> {
    random_bytes(POOL_CORE_RANDOM_BYTES)
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn digest_is_deterministic() {
        let a = digest(b"hello world");
        let b = digest(b"hello world");
        assert_eq!(a, b);
    }

    #[test]
    fn digest_differs_by_input() {
        assert_ne!(digest(b"a"), digest(b"b"));
    }

    #[test]
    fn digest_file_matches_in_memory_digest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"awooga").unwrap();
        file.flush().unwrap();
        assert_eq!(digest_file(file.path()).unwrap(), digest(b"awooga"));
    }

    #[test]
    fn tag_core_randomness_has_expected_length() {
        assert_eq!(random_tag_core_data().len(), TAG_CORE_RANDOM_BYTES);
        assert_eq!(random_pool_core_data().len(), POOL_CORE_RANDOM_BYTES);
    }
}
