use std::path::Path;

use anyhow::{Context, Result};
use sha1::{Digest, Sha1};
use tokio::io::AsyncReadExt;

const BUF_SIZE: usize = 64 * 1024;

/// Compute the SHA-1 hash of a file, reading in 64 KB chunks.
/// Returns the hex-encoded hash string (40 chars, lowercase).
pub async fn compute_sha1(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Cannot open {}", path.display()))?;

    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; BUF_SIZE];

    loop {
        let n = file
            .read(&mut buf)
            .await
            .with_context(|| format!("Cannot read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex_encode(&hasher.finalize()))
}

/// Digest of a local file for change detection.
///
/// Unreadable files yield the empty string, which never matches any
/// digest (see [`digests_match`]), so the file gets transferred again
/// instead of being silently skipped.
pub async fn content_digest(path: &Path) -> String {
    match compute_sha1(path).await {
        Ok(h) => h,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot hash file");
            String::new()
        }
    }
}

/// Compare two digests. An empty digest means "unknown" and is unequal to everything,
/// including another empty digest.
pub fn digests_match(a: &str, b: &str) -> bool {
    !a.is_empty() && !b.is_empty() && a.eq_ignore_ascii_case(b)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn sha1_of_known_content() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"hello world").unwrap();
        f.flush().unwrap();

        let hash = compute_sha1(f.path()).await.unwrap();
        assert_eq!(hash, "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
    }

    #[tokio::test]
    async fn sha1_of_empty_file() {
        let f = NamedTempFile::new().unwrap();
        let hash = compute_sha1(f.path()).await.unwrap();
        assert_eq!(hash, "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[tokio::test]
    async fn missing_file_digest_is_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let digest = content_digest(&dir.path().join("nope")).await;
        assert_eq!(digest, "");
    }

    #[test]
    fn empty_digest_never_matches() {
        assert!(digests_match("abc", "ABC"));
        assert!(!digests_match("abc", "abd"));
        assert!(!digests_match("", ""));
        assert!(!digests_match("", "abc"));
        assert!(!digests_match("abc", ""));
    }
}
