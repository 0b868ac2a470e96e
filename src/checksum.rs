//! Content hashing for cache entries and integrity checks.

use crate::error::{KilnError, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::process::Command;
use tracing::debug;

/// SHA256 of a file, as lowercase hex.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0; 8192];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Fail with an integrity error unless `path` hashes to `expected`.
pub fn verify_sha256(artifact: &str, path: &Path, expected: &str) -> Result<()> {
    let actual = sha256_file(path)?;
    debug!("Calculated SHA256 for {}: {}", path.display(), actual);

    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(KilnError::Integrity {
            artifact: artifact.to_string(),
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Commit id currently checked out in a git working tree.
pub fn git_head(dir: &Path) -> Result<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(["rev-parse", "HEAD"])
        .output()
        .map_err(|e| KilnError::Process {
            command: "git rev-parse HEAD".to_string(),
            message: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(KilnError::Process {
            command: "git rev-parse HEAD".to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
