//! Shared utility functions.

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::task::spawn_blocking;

use crate::{Error, Result};

pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Hex SHA-256 of a byte slice.
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Fingerprint and line count of a file, or `None` when it cannot be read.
pub async fn fingerprint_file(path: &Path) -> Option<(String, usize)> {
    let path = path.to_path_buf();
    blocking(move || {
        let bytes = std::fs::read(&path)?;
        let lines = bytes.iter().filter(|b| **b == b'\n').count();
        Ok((fingerprint_bytes(&bytes), lines))
    })
    .await
    .ok()
}

/// Replace `{target}` and `{root}` placeholders in a command argument.
pub fn expand_placeholders(arg: &str, target: Option<&Path>, root: &Path) -> String {
    let mut out = arg.replace("{root}", &root.to_string_lossy());
    if let Some(target) = target {
        out = out.replace("{target}", &target.to_string_lossy());
    }
    out
}
