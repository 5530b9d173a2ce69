//! Directory-backed session store.
//!
//! Each session lives in its own file named after the session id. Writes go to
//! a temporary file in the same directory first and are then renamed into
//! place, so readers never observe a partially written session.

use super::store::SessionStore;
use super::types::{Session, StoreError};
use crate::env;
use async_trait::async_trait;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Options for the file store
#[derive(Debug, Clone, Default)]
pub struct FileStoreConfig {
    /// Gzip session files
    pub enable_compression: bool,
}

#[derive(Debug)]
pub struct FileStore {
    directory: PathBuf,
    config: FileStoreConfig,
}

impl FileStore {
    /// Create a store rooted at `directory`, creating it if needed
    pub fn new(directory: impl Into<PathBuf>, config: FileStoreConfig) -> Result<Self, StoreError> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)?;

        Ok(Self { directory, config })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn extension(&self) -> &'static str {
        if self.config.enable_compression {
            env::store::COMPRESSED_EXTENSION
        } else {
            env::store::SESSION_EXTENSION
        }
    }

    /// Path for `id`, rejecting ids that would escape the store directory
    fn session_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        let safe = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !id.starts_with('.');
        if !safe {
            return Err(StoreError::InvalidId(id.to_string()));
        }

        Ok(self.directory.join(format!("{}.{}", id, self.extension())))
    }

    fn encode(&self, session: &Session) -> Result<Vec<u8>, StoreError> {
        let serialized = serde_json::to_vec(session)?;
        if !self.config.enable_compression {
            return Ok(serialized);
        }

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&serialized)?;
        Ok(encoder.finish()?)
    }

    fn decode(&self, data: &[u8]) -> Result<Session, StoreError> {
        if !self.config.enable_compression {
            return Ok(serde_json::from_slice(data)?);
        }

        let mut decompressed = Vec::new();
        GzDecoder::new(data).read_to_end(&mut decompressed)?;
        Ok(serde_json::from_slice(&decompressed)?)
    }

    fn is_session_file(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| {
                !name.starts_with('.') && name.ends_with(&format!(".{}", self.extension()))
            })
    }
}

#[async_trait]
impl SessionStore for FileStore {
    async fn load(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let path = self.session_path(id)?;

        let content = match async_fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let session = self.decode(&content)?;
        debug!("Loaded session {} from {}", id, path.display());
        Ok(Some(session))
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        let path = self.session_path(session.id())?;
        let data = self.encode(session)?;

        let temp_path = self.directory.join(format!(
            ".{}.{}.tmp",
            session.id(),
            uuid::Uuid::new_v4()
        ));

        let write_result = async {
            let mut file = async_fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            async_fs::rename(&temp_path, &path).await
        }
        .await;

        if let Err(e) = write_result {
            if let Err(cleanup) = async_fs::remove_file(&temp_path).await
                && cleanup.kind() != std::io::ErrorKind::NotFound
            {
                warn!("Failed to remove temp file {}: {}", temp_path.display(), cleanup);
            }
            return Err(e.into());
        }

        debug!("Saved session {} ({} bytes)", session.id(), data.len());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        let path = self.session_path(id)?;
        match async_fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Removed session file {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn len(&self) -> Result<usize, StoreError> {
        let mut count = 0;
        let mut entries = async_fs::read_dir(&self.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            if self.is_session_file(&entry.path()) {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut entries = async_fs::read_dir(&self.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if self.is_session_file(&path) {
                async_fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }

    fn store_type(&self) -> &'static str {
        "file"
    }
}
