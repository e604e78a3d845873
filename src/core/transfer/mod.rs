//! Chunked, resumable transfer engine.
//!
//! `record` holds the persisted types, `manager` owns them, `sender` and
//! `receiver` are the two wire-facing halves. The whole-file SHA3-256 hash
//! doubles as transfer identity and final integrity check; it is computed
//! up-front, before the descriptor is announced, so the hash in `FILE_INFO`
//! is always final.

pub mod manager;
pub mod receiver;
pub mod record;
pub mod sender;

use sha3::{Digest, Sha3_256};
use std::path::Path;
use tokio::io::AsyncReadExt;

/// Streaming SHA3-256 of a file, hex encoded.
pub async fn file_hash(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha3_256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
