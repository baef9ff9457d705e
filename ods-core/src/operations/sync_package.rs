use crate::client::PeerGateway;
use crate::error::{OdsError, Result};
use crate::storage::{
    CHUNK_SIZE, MetadataStore, Package, PackageChunk, PackageStatus, ShareStore, file_hashes,
    verify_hash,
};
use std::sync::Arc;
use tracing::Instrument;

/// Lifecycle of one package transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Pending,
    Downloading,
    Verifying,
    Public,
    Failed,
}

#[derive(Clone)]
pub struct SyncPackageOperation {
    metadata: Arc<MetadataStore>,
    share: Arc<ShareStore>,
    max_attempts: u32,
}

pub struct SyncPackageOperationRequest {
    pub package_id: i64,
    pub gateway: Arc<dyn PeerGateway>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPackageOperationOutcome {
    Published(Package),
    AlreadyPublic(Package),
    /// Every pass failed on a transient error; nothing was promoted.
    AttemptsExhausted { attempts: u32, last_error: String },
    /// Reconstructed file did not match; the package row was deleted.
    PackageHashMismatch { expected: String, actual: String },
    /// A non-retryable peer error, such as a rejected token.
    Rejected(String),
}

impl SyncPackageOperationOutcome {
    pub fn state(&self) -> SyncState {
        match self {
            Self::Published(_) | Self::AlreadyPublic(_) => SyncState::Public,
            _ => SyncState::Failed,
        }
    }
}

impl SyncPackageOperation {
    pub fn new(metadata: Arc<MetadataStore>, share: Arc<ShareStore>, max_attempts: u32) -> Self {
        Self {
            metadata,
            share,
            max_attempts: max_attempts.max(1),
        }
    }

    pub async fn run(
        &self,
        request: SyncPackageOperationRequest,
    ) -> Result<SyncPackageOperationOutcome> {
        let SyncPackageOperationRequest {
            package_id,
            gateway,
        } = request;

        let package = self
            .metadata
            .get_package(package_id)?
            .ok_or_else(|| OdsError::PackageNotFound(package_id.to_string()))?;

        if package.status == PackageStatus::Public {
            return Ok(SyncPackageOperationOutcome::AlreadyPublic(package));
        }

        let span = tracing::info_span!(
            "sync_package",
            package_id = package.id,
            filename = %package.filename,
            peer = %gateway.issuer(),
        );

        async {
            tracing::info!(state = ?SyncState::Pending, "Starting package download");
            let result = self.transfer(&package, gateway.as_ref()).await;

            // staging never outlives the job, whatever the result
            if let Err(error) = self.share.remove_staging(&package.uuid).await {
                tracing::warn!(%error, uuid = %package.uuid, "Failed to remove staging directory");
            }

            match &result {
                Ok(outcome) => tracing::info!(state = ?outcome.state(), "Package download finished"),
                Err(error) => tracing::error!(%error, "Package download failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn transfer(
        &self,
        package: &Package,
        gateway: &dyn PeerGateway,
    ) -> Result<SyncPackageOperationOutcome> {
        self.share.create_staging(&package.uuid).await?;

        let mut failures = 0;
        loop {
            tracing::debug!(state = ?SyncState::Downloading, attempt = failures + 1, "Starting download pass");
            match self.download_pass(package, gateway).await {
                Ok(()) => break,
                Err(error) if error.is_transient() => {
                    failures += 1;
                    tracing::warn!(attempt = failures, %error, "Download pass aborted");
                    if failures >= self.max_attempts {
                        tracing::error!(
                            attempts = failures,
                            "Too many failed download passes, giving up"
                        );
                        return Ok(SyncPackageOperationOutcome::AttemptsExhausted {
                            attempts: failures,
                            last_error: error.to_string(),
                        });
                    }
                }
                Err(OdsError::Authentication(message)) => {
                    return Ok(SyncPackageOperationOutcome::Rejected(message));
                }
                Err(error) => return Err(error),
            }
        }

        self.complete(package).await
    }

    /// Fetch every pending chunk in index order. A chunk is pending when it is
    /// not yet marked downloaded or its staging file is gone. The first
    /// failure discards every chunk file written by this pass.
    async fn download_pass(&self, package: &Package, gateway: &dyn PeerGateway) -> Result<()> {
        let pending: Vec<PackageChunk> = self
            .metadata
            .list_chunks(package.id)?
            .into_iter()
            .filter(|chunk| !chunk.downloaded || !self.share.chunk_exists(&package.uuid, chunk.index))
            .collect();

        let mut written = Vec::with_capacity(pending.len());
        for chunk in &pending {
            if let Err(error) = self.fetch_chunk(package, gateway, chunk).await {
                for index in written {
                    self.share.delete_chunk(&package.uuid, index).await?;
                }
                return Err(error);
            }
            written.push(chunk.index);
        }

        Ok(())
    }

    async fn fetch_chunk(
        &self,
        package: &Package,
        gateway: &dyn PeerGateway,
        chunk: &PackageChunk,
    ) -> Result<()> {
        let range_start = chunk.index as u64 * CHUNK_SIZE;
        let range_end = range_start + CHUNK_SIZE - 1;
        tracing::debug!(chunk_index = chunk.index, range_start, range_end, "Fetching chunk");

        let data = gateway
            .download_chunk(&package.filename, range_start, range_end)
            .await?;

        verify_hash(&data, &chunk.sha256).map_err(|actual| OdsError::ChunkHashFailure {
            index: chunk.index,
            expected: chunk.sha256.clone(),
            actual,
        })?;

        self.share.put_chunk(&package.uuid, chunk.index, &data).await?;
        self.metadata.mark_chunk_downloaded(package.id, chunk.index)?;
        Ok(())
    }

    async fn complete(&self, package: &Package) -> Result<SyncPackageOperationOutcome> {
        tracing::info!(state = ?SyncState::Verifying, "All chunks downloaded, reconstructing package");

        let chunk_count = self.metadata.list_chunks(package.id)?.len() as u32;
        let combined = self.share.combine_chunks(&package.uuid, chunk_count).await?;
        let (actual, _) = file_hashes(&combined).await?;

        if actual != package.sha256 {
            let error = OdsError::PackageHashFailure {
                filename: package.filename.clone(),
                expected: package.sha256.clone(),
                actual: actual.clone(),
            };
            tracing::error!(%error, "Removing package");
            self.metadata.delete_package(package.id)?;
            return Ok(SyncPackageOperationOutcome::PackageHashMismatch {
                expected: package.sha256.clone(),
                actual,
            });
        }

        self.share.promote(&combined, &package.filename).await?;
        self.metadata
            .set_package_status(package.id, PackageStatus::Public)?;

        let published = self
            .metadata
            .get_package(package.id)?
            .ok_or_else(|| OdsError::PackageNotFound(package.id.to_string()))?;
        Ok(SyncPackageOperationOutcome::Published(published))
    }
}
