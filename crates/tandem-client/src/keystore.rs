//! File-backed `SecureStore`: one owner-only file per entry.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tandem_crypto::{CryptoError, SecureStore};
use tokio::io::AsyncWriteExt;

pub struct FileSecureStore {
    dir: PathBuf,
}

impl FileSecureStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> Result<PathBuf, CryptoError> {
        let valid = !key.is_empty()
            && key != "."
            && key != ".."
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !valid {
            return Err(CryptoError::StorageUnavailable(format!(
                "invalid entry name {key:?}"
            )));
        }
        Ok(self.dir.join(key))
    }
}

fn unavailable(what: &str, path: &Path, e: std::io::Error) -> CryptoError {
    CryptoError::StorageUnavailable(format!("{what} {}: {e}", path.display()))
}

#[async_trait]
impl SecureStore for FileSecureStore {
    async fn get(&self, key: &str) -> tandem_crypto::Result<Option<String>> {
        let path = self.entry_path(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable("failed to read", &path, e)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> tandem_crypto::Result<()> {
        let path = self.entry_path(key)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| unavailable("failed to create", &self.dir, e))?;

        let tmp_path = self.dir.join(format!("{key}.tmp"));
        let mut options = tokio::fs::OpenOptions::new();
        options.create(true).truncate(true).write(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options
            .open(&tmp_path)
            .await
            .map_err(|e| unavailable("failed to create", &tmp_path, e))?;
        file.write_all(value.as_bytes())
            .await
            .map_err(|e| unavailable("failed to write", &tmp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| unavailable("failed to fsync", &tmp_path, e))?;
        drop(file);

        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| unavailable("failed to move into place", &path, e))?;
        tracing::debug!(path = %path.display(), "secure store entry written");
        Ok(())
    }
}
