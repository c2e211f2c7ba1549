//! Local filesystem-based content-addressed blob storage.
//!
//! Blobs live at `{root}/{key[0..2]}/{key[2..4]}/{key}` and are transparently
//! compressed with zstd.

use std::path::{Path, PathBuf};

use async_compression::Level;
use async_compression::tokio::bufread::ZstdDecoder;
use async_compression::tokio::write::ZstdEncoder;
use color_eyre::{Result, eyre::Context};
use derive_more::{Debug, Display};
use tokio::fs::{File, create_dir_all, metadata, remove_dir_all, remove_file, rename};
use tokio::io::{AsyncWriteExt, BufReader};
use tracing::{instrument, trace, warn};
use uuid::Uuid;

use crate::key::BlobKey;

/// Default buffer size for read operations.
const DEFAULT_BUF_SIZE: usize = 64 * 1024;

/// Content-addressed blob storage backed by the filesystem.
///
/// ## File structure
///
/// Each file is named by the hex-encoded blake3 hash of its uncompressed
/// content, prefixed with two levels of folders computed from the first four
/// characters of the hex hash.
///
/// ## Atomic writes
///
/// Writes go to a temp file in the target directory which is then renamed
/// into place, so a reader never observes a partially written blob.
#[derive(Clone, Eq, PartialEq, Debug, Display)]
#[debug("BlobStore(root = {})", self.root.display())]
#[display("{}", root.display())]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Create a new instance with the given root directory.
    ///
    /// The directory will be created when the first blob is written.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Get the path to the file for the given key.
    ///
    /// Example: `BlobKey("abcd1234...")` -> `root/ab/cd/abcd1234...`
    fn key_path(&self, key: &BlobKey) -> PathBuf {
        let hex = key.to_hex();
        let prefix1 = hex.chars().take(2).collect::<String>();
        let prefix2 = hex.chars().skip(2).take(2).collect::<String>();
        self.root.join(prefix1).join(prefix2).join(&hex)
    }

    /// Check if a blob exists in storage.
    #[instrument(name = "BlobStore::exists")]
    pub async fn exists(&self, key: &BlobKey) -> Result<bool> {
        let path = self.key_path(key);
        match metadata(&path).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).context(format!("check if blob exists at {path:?}")),
        }
    }

    /// Read and decompress the entire blob.
    #[instrument(name = "BlobStore::read")]
    pub async fn read(&self, key: &BlobKey) -> Result<Option<Vec<u8>>> {
        let path = self.key_path(key);
        match File::open(&path).await {
            Ok(file) => {
                let reader = BufReader::new(file);
                let decoder = ZstdDecoder::new(reader);
                let mut buffered = BufReader::with_capacity(DEFAULT_BUF_SIZE, decoder);

                let mut buffer = Vec::new();
                tokio::io::copy(&mut buffered, &mut buffer)
                    .await
                    .with_context(|| format!("decompress blob {path:?}"))?;
                Ok(Some(buffer))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context(format!("open blob file {path:?}")),
        }
    }

    /// Write content to storage.
    ///
    /// Returns the content's key and `true` if the content was newly written,
    /// `false` if an identical blob already existed.
    #[instrument(name = "BlobStore::write", skip(content), fields(bytes = content.len()))]
    pub async fn write(&self, content: &[u8]) -> Result<(BlobKey, bool)> {
        let key = BlobKey::from_buffer(content);
        let path = self.key_path(&key);

        if self.exists(&key).await? {
            trace!(%key, "blob already stored");
            return Ok((key, false));
        }

        if let Some(parent) = path.parent() {
            create_dir_all(parent)
                .await
                .with_context(|| format!("create parent directory {parent:?}"))?;
        }

        let temp = temp_path(&path);
        let file = File::create(&temp).await.context("create temporary file")?;

        let mut encoder = ZstdEncoder::with_quality(file, Level::Default);
        encoder
            .write_all(content)
            .await
            .with_context(|| format!("write content to {temp:?}"))?;
        encoder.shutdown().await.context("flush zstd encoder")?;
        let mut file = encoder.into_inner();
        file.flush().await.context("flush file")?;
        drop(file);

        match rename(&temp, &path).await {
            Ok(()) => Ok((key, true)),
            Err(err) => {
                if let Err(err) = remove_file(&temp).await {
                    warn!("failed to remove temp file {temp:?}: {err}");
                }
                if err.kind() == std::io::ErrorKind::AlreadyExists {
                    Ok((key, false))
                } else {
                    Err(err).context(format!("rename {temp:?} to {path:?}"))
                }
            }
        }
    }

    /// Remove a blob from storage.
    ///
    /// Returns `false` if the blob did not exist.
    #[instrument(name = "BlobStore::remove")]
    pub async fn remove(&self, key: &BlobKey) -> Result<bool> {
        let path = self.key_path(key);
        match remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).context(format!("remove blob {path:?}")),
        }
    }

    /// Remove every blob in storage.
    #[instrument(name = "BlobStore::clear")]
    pub async fn clear(&self) -> Result<()> {
        match remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context(format!("remove blob directory {:?}", self.root)),
        }
    }
}

/// Generate a temporary file path in the same directory as the target.
fn temp_path(target: &Path) -> PathBuf {
    let mut temp = target.as_os_str().to_owned();
    temp.push(".tmp.");
    temp.push(Uuid::new_v4().to_string());
    PathBuf::from(temp)
}
