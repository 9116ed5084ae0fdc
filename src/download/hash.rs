//! eD2k content hashing.
//!
//! Files are split into 9 728 000-byte chunks. A file shorter than one chunk hashes to the
//! plain MD4 of its bytes; otherwise the id is the MD4 over the concatenated chunk digests.
//! Like eMule, a size that is an exact multiple of the chunk size contributes one trailing
//! empty-chunk digest.

use crate::download::types::ContentId;
use md4::{Digest, Md4};
use std::path::Path;
use tokio::io::AsyncReadExt as _;

pub const ED2K_CHUNK_SIZE: u64 = 9_728_000;

#[derive(Clone, Default)]
pub struct Ed2kHasher {
    chunk: Md4,
    chunk_len: u64,
    chunk_digests: Vec<[u8; 16]>,
}

impl Ed2kHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let room = (ED2K_CHUNK_SIZE - self.chunk_len) as usize;
            let take = room.min(data.len());
            self.chunk.update(&data[..take]);
            self.chunk_len += take as u64;
            data = &data[take..];
            if self.chunk_len == ED2K_CHUNK_SIZE {
                let done = std::mem::take(&mut self.chunk);
                self.chunk_digests.push(digest_bytes(done));
                self.chunk_len = 0;
            }
        }
    }

    pub fn finalize(mut self) -> ContentId {
        let tail = digest_bytes(self.chunk);
        if self.chunk_digests.is_empty() {
            return ContentId(tail);
        }
        self.chunk_digests.push(tail);
        let mut outer = Md4::new();
        for d in &self.chunk_digests {
            outer.update(d);
        }
        ContentId(digest_bytes(outer))
    }
}

fn digest_bytes(h: Md4) -> [u8; 16] {
    let out = h.finalize();
    let mut arr = [0u8; 16];
    arr.copy_from_slice(&out);
    arr
}

pub fn hash_bytes(data: &[u8]) -> ContentId {
    let mut h = Ed2kHasher::new();
    h.update(data);
    h.finalize()
}

pub async fn hash_file(path: &Path) -> std::io::Result<ContentId> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; 256 * 1024];
    let mut h = Ed2kHasher::new();
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        h.update(&buf[..n]);
    }
    Ok(h.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_input_is_plain_md4() {
        // RFC 1320 test vectors.
        assert_eq!(
            hash_bytes(b"").to_hex_lower(),
            "31d6cfe0d16ae931b73c59d7e0c089c0"
        );
        assert_eq!(
            hash_bytes(b"abc").to_hex_lower(),
            "a448017aaf21d8525fc10ae87aa6729d"
        );
    }

    #[test]
    fn incremental_updates_match_one_shot() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut h = Ed2kHasher::new();
        for piece in data.chunks(333) {
            h.update(piece);
        }
        assert_eq!(h.finalize(), hash_bytes(&data));
    }

    #[test]
    fn multi_chunk_input_hashes_chunk_digests() {
        let data = vec![7u8; ED2K_CHUNK_SIZE as usize + 10];
        let first = {
            let mut m = Md4::new();
            m.update(&data[..ED2K_CHUNK_SIZE as usize]);
            digest_bytes(m)
        };
        let second = {
            let mut m = Md4::new();
            m.update(&data[ED2K_CHUNK_SIZE as usize..]);
            digest_bytes(m)
        };
        let mut outer = Md4::new();
        outer.update(first);
        outer.update(second);
        assert_eq!(hash_bytes(&data), ContentId(digest_bytes(outer)));
    }

    #[tokio::test]
    async fn file_hash_matches_bytes_hash() {
        let path = std::env::temp_dir().join(format!(
            "transfer-core-hash-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        let data = b"some partial file content".repeat(1000);
        tokio::fs::write(&path, &data).await.expect("write");
        assert_eq!(hash_file(&path).await.expect("hash"), hash_bytes(&data));
        let _ = std::fs::remove_file(path);
    }
}
