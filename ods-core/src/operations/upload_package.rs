use crate::error::{OdsError, Result};
use crate::identity::Stage;
use crate::storage::{
    MetadataStore, NewPackage, Package, PackageChunk, PackageStatus, ShareStore, file_hashes,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Publishes a local file: hashes it in 1 MiB chunks, records it as a
/// Public package and places it in the share.
#[derive(Clone)]
pub struct UploadPackageOperation {
    metadata: Arc<MetadataStore>,
    share: Arc<ShareStore>,
}

#[derive(Debug, Clone)]
pub struct UploadPackageOperationRequest {
    pub source: PathBuf,
    /// Name in the share; defaults to the source file name.
    pub filename: Option<String>,
    pub stage: Stage,
}

impl UploadPackageOperation {
    pub fn new(metadata: Arc<MetadataStore>, share: Arc<ShareStore>) -> Self {
        Self { metadata, share }
    }

    pub async fn run(&self, request: UploadPackageOperationRequest) -> Result<Package> {
        let filename = match request.filename.clone() {
            Some(filename) => filename,
            None => request
                .source
                .file_name()
                .and_then(|name| name.to_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    OdsError::InvalidRequest(format!(
                        "cannot derive a file name from {}",
                        request.source.display()
                    ))
                })?,
        };
        // validates the name before anything is written
        self.share.share_path(&filename)?;

        let uuid = ulid::Ulid::new().to_string().to_ascii_lowercase();
        let staging = self.share.create_staging(&uuid).await?;
        let result = self.publish(&uuid, &staging.join(&filename), &filename, &request).await;

        if let Err(error) = self.share.remove_staging(&uuid).await {
            tracing::warn!(%error, uuid = %uuid, "Failed to remove staging directory");
        }
        result
    }

    async fn publish(
        &self,
        uuid: &str,
        staged: &std::path::Path,
        filename: &str,
        request: &UploadPackageOperationRequest,
    ) -> Result<Package> {
        tokio::fs::copy(&request.source, staged).await?;
        let file_size = tokio::fs::metadata(staged).await?.len();
        let (sha256, chunk_hashes) = file_hashes(staged).await?;

        let package = self.metadata.insert_package(&NewPackage {
            uuid: uuid.to_string(),
            sha256,
            filename: filename.to_string(),
            file_size,
            status: PackageStatus::Public,
            stage: request.stage,
            chunks: chunk_hashes
                .into_iter()
                .enumerate()
                .map(|(index, sha256)| PackageChunk {
                    index: index as u32,
                    sha256,
                    downloaded: true,
                })
                .collect(),
        })?;

        if let Err(error) = self.share.promote(staged, filename).await {
            self.metadata.delete_package(package.id)?;
            return Err(error);
        }

        tracing::info!(
            package_id = package.id,
            filename = %package.filename,
            file_size = package.file_size,
            "Uploaded package"
        );
        Ok(package)
    }
}
