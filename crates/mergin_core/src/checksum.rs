//! Content checksums and chunk planning.
//!
//! File identity on the wire is a SHA-1 hex digest of the content; the
//! algorithm is fixed by the server protocol. Transfers are chunked with two
//! different sizes: downloads stream 64 KiB ranges addressed by index,
//! uploads send 10 MiB chunks addressed by client-generated opaque ids that
//! the server echoes back during transaction accounting.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha1::{Digest, Sha1};
use uuid::Uuid;

use crate::error::{MerginError, Result};

/// Size of one download chunk in bytes.
pub const CHUNK_SIZE: u64 = 65536;

/// Size of one upload chunk in bytes. Must match the server's setting.
pub const UPLOAD_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// SHA-1 digest of a byte slice as lowercase hex.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    to_hex(&hasher.finalize())
}

/// SHA-1 digest of a file's content as lowercase hex.
///
/// The file is streamed in 64 KiB blocks so large files never have to fit
/// in memory.
pub fn file_checksum(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| MerginError::local_io(path, e))?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; CHUNK_SIZE as usize];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| MerginError::local_io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(to_hex(&hasher.finalize()))
}

/// Generate the ordered upload chunk ids for a file of the given size.
///
/// One id per started [`UPLOAD_CHUNK_SIZE`] range; a zero-byte file still
/// gets exactly one chunk so the server transaction has something to
/// account for.
pub fn generate_chunk_ids(size: u64) -> Vec<String> {
    let count = size.div_ceil(UPLOAD_CHUNK_SIZE).max(1);
    (0..count).map(|_| Uuid::new_v4().to_string()).collect()
}

/// Number of download chunk requests needed for a file of the given size.
///
/// Zero for an empty file: the engine creates it locally without issuing a
/// request.
pub fn download_chunk_count(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE)
}

fn to_hex(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_checksum_known_vectors() {
        // echo -n "" | sha1sum
        assert_eq!(
            checksum_bytes(b""),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
        // echo -n 12 | sha1sum
        assert_eq!(
            checksum_bytes(b"12"),
            "7b52009b64fd0a2a49e6d8a939753077792b0554"
        );
        // echo -n "The quick brown fox jumps over the lazy dog" | sha1sum
        assert_eq!(
            checksum_bytes(b"The quick brown fox jumps over the lazy dog"),
            "2fd4e1c67a2d28fced849ee1bb76e7391b93eb12"
        );
    }

    #[test]
    fn test_file_checksum_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let content = vec![0xABu8; (CHUNK_SIZE + 17) as usize];
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&content)
            .unwrap();

        assert_eq!(file_checksum(&path).unwrap(), checksum_bytes(&content));
    }

    #[test]
    fn test_file_checksum_missing_file() {
        let err = file_checksum(Path::new("/nonexistent/f.txt")).unwrap_err();
        assert!(matches!(err, MerginError::LocalIo { .. }));
    }

    #[test]
    fn test_chunk_ids_count() {
        assert_eq!(generate_chunk_ids(0).len(), 1);
        assert_eq!(generate_chunk_ids(1).len(), 1);
        assert_eq!(generate_chunk_ids(UPLOAD_CHUNK_SIZE).len(), 1);
        assert_eq!(generate_chunk_ids(UPLOAD_CHUNK_SIZE + 1).len(), 2);
        assert_eq!(generate_chunk_ids(25 * 1024 * 1024).len(), 3);
    }

    #[test]
    fn test_chunk_ids_unique() {
        let ids = generate_chunk_ids(3 * UPLOAD_CHUNK_SIZE);
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn test_download_chunk_count() {
        assert_eq!(download_chunk_count(0), 0);
        assert_eq!(download_chunk_count(1), 1);
        assert_eq!(download_chunk_count(CHUNK_SIZE), 1);
        assert_eq!(download_chunk_count(CHUNK_SIZE + 1), 2);
        assert_eq!(download_chunk_count(10 * 1024 * 1024 + 1), 161);
    }
}
