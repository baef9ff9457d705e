use crate::error::{OdsError, Result};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Fixed transfer and verification unit: 1 MiB.
pub const CHUNK_SIZE: u64 = 1024 * 1024;

const CHUNK_EXTENSION: &str = "chunk";
const COMBINED_FILE: &str = "combined.tmp";

/// ShareStore owns the two on-disk areas of a node:
/// - `share_dir/{filename}` holds fully verified, public packages
/// - `staging_dir/{uuid}/{index:06}.chunk` holds in-flight chunk files
#[derive(Debug, Clone)]
pub struct ShareStore {
    share_dir: PathBuf,
    staging_dir: PathBuf,
}

impl ShareStore {
    pub fn new(share_dir: PathBuf, staging_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&share_dir)?;
        std::fs::create_dir_all(&staging_dir)?;
        Ok(Self {
            share_dir,
            staging_dir,
        })
    }

    pub fn share_dir(&self) -> &Path {
        &self.share_dir
    }

    /// Staging directory for one package, keyed by its uuid
    pub fn staging_path(&self, uuid: &str) -> PathBuf {
        self.staging_dir.join(uuid)
    }

    pub fn share_path(&self, filename: &str) -> Result<PathBuf> {
        validate_filename(filename)?;
        Ok(self.share_dir.join(filename))
    }

    pub async fn create_staging(&self, uuid: &str) -> Result<PathBuf> {
        validate_filename(uuid)?;
        let path = self.staging_path(uuid);
        fs::create_dir_all(&path).await?;
        Ok(path)
    }

    pub async fn remove_staging(&self, uuid: &str) -> Result<()> {
        validate_filename(uuid)?;
        let path = self.staging_path(uuid);
        if fs::try_exists(&path).await? {
            fs::remove_dir_all(&path).await?;
        }
        Ok(())
    }

    fn chunk_path(&self, uuid: &str, index: u32) -> PathBuf {
        self.staging_path(uuid)
            .join(format!("{:06}.{}", index, CHUNK_EXTENSION))
    }

    /// Persist a verified chunk. Written to a temporary file first, then
    /// renamed, so a chunk file is either complete or absent.
    pub async fn put_chunk(&self, uuid: &str, index: u32, data: &[u8]) -> Result<PathBuf> {
        let staging = self.create_staging(uuid).await?;
        let chunk_path = self.chunk_path(uuid, index);

        let temp_path = staging.join(format!("{:06}.tmp", index));
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &chunk_path).await?;

        tracing::debug!(
            "Stored chunk {} for package {} ({} bytes)",
            index,
            uuid,
            data.len()
        );
        Ok(chunk_path)
    }

    pub fn chunk_exists(&self, uuid: &str, index: u32) -> bool {
        self.chunk_path(uuid, index).is_file()
    }

    pub async fn delete_chunk(&self, uuid: &str, index: u32) -> Result<()> {
        let chunk_path = self.chunk_path(uuid, index);
        if fs::try_exists(&chunk_path).await? {
            fs::remove_file(&chunk_path).await?;
        }
        Ok(())
    }

    /// Indices of the chunk files currently in a package's staging area
    pub async fn list_chunks(&self, uuid: &str) -> Result<Vec<u32>> {
        let staging = self.staging_path(uuid);
        if !fs::try_exists(&staging).await? {
            return Ok(Vec::new());
        }

        let mut indices = Vec::new();
        let mut entries = fs::read_dir(&staging).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(CHUNK_EXTENSION) {
                continue;
            }
            if let Some(index) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u32>().ok())
            {
                indices.push(index);
            }
        }

        indices.sort_unstable();
        Ok(indices)
    }

    /// Concatenate chunk files `0..chunk_count` strictly in index order into
    /// a single file inside the staging area and return its path.
    pub async fn combine_chunks(&self, uuid: &str, chunk_count: u32) -> Result<PathBuf> {
        let staging = self.create_staging(uuid).await?;
        let combined_path = staging.join(COMBINED_FILE);
        let mut combined = fs::File::create(&combined_path).await?;

        for index in 0..chunk_count {
            let chunk_path = self.chunk_path(uuid, index);
            let data = fs::read(&chunk_path).await.map_err(|error| {
                OdsError::Internal(format!(
                    "chunk {} of {} missing during reconstruction: {}",
                    index, uuid, error
                ))
            })?;
            combined.write_all(&data).await?;
        }

        combined.sync_all().await?;
        Ok(combined_path)
    }

    /// Move a file into the public share under `filename`.
    pub async fn promote(&self, source: &Path, filename: &str) -> Result<PathBuf> {
        let target = self.share_path(filename)?;
        if fs::rename(source, &target).await.is_err() {
            // staging and share may live on different filesystems
            fs::copy(source, &target).await?;
            fs::remove_file(source).await?;
        }
        Ok(target)
    }

    pub async fn list_share_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.share_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                files.push(name.to_string());
            }
        }
        files.sort();
        Ok(files)
    }

    pub async fn delete_share_file(&self, filename: &str) -> Result<()> {
        let path = self.share_path(filename)?;
        if fs::try_exists(&path).await? {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    pub async fn share_file_len(&self, filename: &str) -> Result<u64> {
        let path = self.share_path(filename)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(meta.len()),
            Ok(_) => Err(OdsError::PackageNotFound(filename.to_string())),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(OdsError::PackageNotFound(filename.to_string()))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Read the inclusive byte range `start..=end` of a shared file, with
    /// `end` clamped to the file length.
    pub async fn read_range(&self, filename: &str, start: u64, end: u64) -> Result<Bytes> {
        let len = self.share_file_len(filename).await?;
        if start >= len || end < start {
            return Err(OdsError::InvalidRequest(format!(
                "unsatisfiable range {}-{} for {} bytes",
                start, end, len
            )));
        }
        let end = end.min(len - 1);

        let mut file = fs::File::open(self.share_path(filename)?).await?;
        file.seek(std::io::SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; (end - start + 1) as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

fn validate_filename(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(OdsError::InvalidRequest(format!(
            "invalid file name: {:?}",
            name
        )));
    }
    Ok(())
}

/// Compute SHA256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verify that data matches the expected hash
pub fn verify_hash(data: &[u8], expected_hash: &str) -> std::result::Result<(), String> {
    let actual_hash = compute_hash(data);
    if actual_hash != expected_hash {
        return Err(actual_hash);
    }
    Ok(())
}

/// Whole-file hash and the hash of every `CHUNK_SIZE` slice, computed in a
/// single read of the file.
pub async fn file_hashes(path: &Path) -> Result<(String, Vec<String>)> {
    let mut file = fs::File::open(path).await?;
    let mut whole = Sha256::new();
    let mut chunk_hashes = Vec::new();
    let mut buf = vec![0u8; CHUNK_SIZE as usize];

    loop {
        let mut filled = 0;
        while filled < buf.len() {
            let read = file.read(&mut buf[filled..]).await?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        if filled == 0 {
            break;
        }

        whole.update(&buf[..filled]);
        chunk_hashes.push(compute_hash(&buf[..filled]));

        if filled < buf.len() {
            break;
        }
    }

    Ok((hex::encode(whole.finalize()), chunk_hashes))
}
