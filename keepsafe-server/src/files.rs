//! On-disk blob store with atomic publication.
//!
//! Blobs live at `<root>/<user_id>/<id>`. Uploads land in a uniquely
//! named temporary file in the owner's directory and become visible in
//! a single rename, so a concurrent reader sees either the old bytes in
//! full or the new bytes in full, never a mixture.

use std::path::{Path, PathBuf};

use keepsafe_core::{Error, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Blob tree rooted at the server's file root, one directory per user.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Final path of a blob. Both segments are validated so an id like
    /// `../../etc/passwd` can never escape the tree.
    pub fn blob_path(&self, user_id: &str, id: &str) -> Result<PathBuf> {
        Ok(self
            .root
            .join(checked_segment(user_id)?)
            .join(checked_segment(id)?))
    }

    /// Start an upload: create the owner's directory and a uniquely
    /// named temporary file inside it.
    pub async fn begin_upload(&self, user_id: &str, id: &str) -> Result<PendingUpload> {
        let final_path = self.blob_path(user_id, id)?;
        let dir = final_path
            .parent()
            .ok_or_else(|| Error::Internal("blob path has no parent".into()))?
            .to_path_buf();
        fs::create_dir_all(&dir).await?;

        let tmp_path = dir.join(format!(".upload-{}", Uuid::new_v4()));
        let file = fs::File::create(&tmp_path).await?;
        Ok(PendingUpload {
            file,
            tmp_path,
            final_path,
        })
    }

    /// Open a published blob for reading.
    pub async fn open_blob(&self, user_id: &str, id: &str) -> Result<fs::File> {
        let path = self.blob_path(user_id, id)?;
        fs::File::open(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::NotFound(format!("no file stored for record {id}"))
            }
            _ => Error::Transient(e.to_string()),
        })
    }
}

/// Reject path segments that could escape the blob tree.
fn checked_segment(segment: &str) -> Result<&str> {
    if segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains('/')
        || segment.contains('\\')
    {
        return Err(Error::MalformedInput(format!(
            "invalid path segment {segment:?}"
        )));
    }
    Ok(segment)
}

/// An in-progress upload; either published into place or discarded.
pub struct PendingUpload {
    file: fs::File,
    tmp_path: PathBuf,
    final_path: PathBuf,
}

impl PendingUpload {
    pub async fn write_chunk(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.write_all(bytes).await?;
        Ok(())
    }

    /// Flush to stable storage and atomically rename into place. The
    /// temporary file is removed if publication fails.
    pub async fn publish(self) -> Result<()> {
        let PendingUpload {
            mut file,
            tmp_path,
            final_path,
        } = self;

        let result: Result<()> = async {
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp_path, &final_path).await?;
            Ok(())
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&tmp_path).await;
        }
        result
    }

    /// Remove the temporary file (best-effort).
    pub async fn discard(self) {
        let PendingUpload { file, tmp_path, .. } = self;
        drop(file);
        let _ = fs::remove_file(&tmp_path).await;
    }
}
