//! Whole-file content digest used for replication change detection.

use std::path::Path;

use md5::{Digest, Md5};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, ErrorKind};

use crate::utils::IdGenError;

/// Computes the lowercase hex MD5 digest of the file at `path`. A missing
/// file digests as the empty string, which never equals a real digest.
pub async fn file_md5(path: &Path) -> Result<String, IdGenError> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(e.into()),
    };

    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 8192];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod digest_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn md5_of_files() -> Result<(), IdGenError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("abc.db");
        assert_eq!(file_md5(&path).await?, "");
        tokio::fs::write(&path, b"abc").await?;
        assert_eq!(file_md5(&path).await?, "900150983cd24fb0d6963f7d28e17f72");
        tokio::fs::write(&path, b"").await?;
        assert_eq!(file_md5(&path).await?, "d41d8cd98f00b204e9800998ecf8427e");
        Ok(())
    }
}
