use anyhow::Result;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

/// On-disk blob storage for shared files.
///
/// Each blob is a single flat file at `{dir}/{file_id}`. Ids are uuids
/// generated server-side, so blob names never contain caller input and
/// path traversal is structurally impossible.
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    pub async fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        info!("Blob storage directory: {}", dir.display());
        Ok(Self { dir })
    }

    pub fn blob_path(&self, file_id: Uuid) -> PathBuf {
        self.dir.join(file_id.to_string())
    }

    pub async fn write(&self, file_id: Uuid, data: &[u8]) -> Result<()> {
        let path = self.blob_path(file_id);
        let mut file = fs::File::create(&path).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    /// Opens a blob for streaming. The caller wraps it in a ReaderStream.
    pub async fn open(&self, file_id: Uuid) -> std::io::Result<fs::File> {
        fs::File::open(self.blob_path(file_id)).await
    }
}
