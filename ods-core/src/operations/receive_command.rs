use crate::client::{PeerCommand, PeerGateway};
use crate::error::Result;
use crate::jobs::SyncJobRunner;
use crate::storage::{MetadataStore, NewPackage, PackageChunk, PackageStatus, ShareStore};
use std::sync::Arc;

/// Handles a command pushed by an authenticated peer.
#[derive(Clone)]
pub struct ReceiveCommandOperation {
    metadata: Arc<MetadataStore>,
    share: Arc<ShareStore>,
    jobs: SyncJobRunner,
}

pub struct ReceiveCommandOperationRequest {
    pub command: PeerCommand,
    /// Gateway back to the peer that sent the command.
    pub gateway: Arc<dyn PeerGateway>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveCommandOperationOutcome {
    /// A download job was started for this local package id.
    Dispatched(i64),
    /// A package with that filename is already public here.
    AlreadyPublic(i64),
    /// A job for that package is already running.
    AlreadyDownloading(i64),
    Ignored,
}

impl ReceiveCommandOperation {
    pub fn new(metadata: Arc<MetadataStore>, share: Arc<ShareStore>, jobs: SyncJobRunner) -> Self {
        Self {
            metadata,
            share,
            jobs,
        }
    }

    pub async fn run(
        &self,
        request: ReceiveCommandOperationRequest,
    ) -> Result<ReceiveCommandOperationOutcome> {
        let ReceiveCommandOperationRequest { command, gateway } = request;

        match command {
            PeerCommand::NewPackage { package_id } => self.new_package(package_id, gateway).await,
            PeerCommand::Unknown => {
                tracing::debug!(peer = %gateway.issuer(), "Ignoring unrecognized command");
                Ok(ReceiveCommandOperationOutcome::Ignored)
            }
        }
    }

    async fn new_package(
        &self,
        remote_id: i64,
        gateway: Arc<dyn PeerGateway>,
    ) -> Result<ReceiveCommandOperationOutcome> {
        tracing::info!(peer = %gateway.issuer(), remote_id, "New package notification received");
        let detail = gateway
            .fetch_package_metadata(&remote_id.to_string())
            .await?;
        let remote = detail.package;
        // a peer must not be able to name a file outside the share
        self.share.share_path(&remote.filename)?;

        let package = match self.metadata.find_package(&remote.filename)? {
            Some(existing) if existing.status == PackageStatus::Public => {
                tracing::info!(package_id = existing.id, filename = %existing.filename, "Package already public");
                return Ok(ReceiveCommandOperationOutcome::AlreadyPublic(existing.id));
            }
            Some(existing) => existing,
            None => self.metadata.insert_package(&NewPackage {
                uuid: ulid::Ulid::new().to_string().to_ascii_lowercase(),
                sha256: remote.sha256,
                filename: remote.filename,
                file_size: remote.file_size,
                status: PackageStatus::Downloading,
                stage: remote.stage,
                chunks: detail
                    .chunks
                    .into_iter()
                    .map(|chunk| PackageChunk {
                        downloaded: false,
                        ..chunk
                    })
                    .collect(),
            })?,
        };

        self.share.create_staging(&package.uuid).await?;
        tracing::info!(package_id = package.id, filename = %package.filename, "Queued package download");

        match self.jobs.dispatch(package.id, gateway) {
            Some(_) => Ok(ReceiveCommandOperationOutcome::Dispatched(package.id)),
            None => Ok(ReceiveCommandOperationOutcome::AlreadyDownloading(package.id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::sync_package::tests::{FakePeer, new_package_for, sample_data};
    use crate::storage::{Package, PackageDetail};

    struct Fixture {
        _temp_dir: tempfile::TempDir,
        metadata: Arc<MetadataStore>,
        share: Arc<ShareStore>,
        jobs: SyncJobRunner,
        operation: ReceiveCommandOperation,
    }

    fn fixture() -> Fixture {
        let temp_dir = tempfile::tempdir().unwrap();
        let metadata = Arc::new(MetadataStore::new(temp_dir.path().join("ods.db")).unwrap());
        let share = Arc::new(
            ShareStore::new(temp_dir.path().join("share"), temp_dir.path().join("staging"))
                .unwrap(),
        );
        let jobs = SyncJobRunner::new(metadata.clone(), share.clone(), 5);
        let operation = ReceiveCommandOperation::new(metadata.clone(), share.clone(), jobs.clone());
        Fixture {
            _temp_dir: temp_dir,
            metadata,
            share,
            jobs,
            operation,
        }
    }

    fn remote_peer(data: Vec<u8>) -> FakePeer {
        let new = new_package_for("remote.pkg", &data);
        let detail = PackageDetail {
            package: Package {
                id: 77,
                uuid: new.uuid.clone(),
                sha256: new.sha256.clone(),
                filename: new.filename.clone(),
                file_size: new.file_size,
                status: PackageStatus::Public,
                stage: new.stage,
                created_at: chrono::Utc::now(),
            },
            chunks: new
                .chunks
                .iter()
                .map(|chunk| PackageChunk {
                    downloaded: true,
                    ..chunk.clone()
                })
                .collect(),
        };
        let mut peer = FakePeer::new(data);
        peer.detail = Some(detail);
        peer
    }

    #[tokio::test]
    async fn test_new_package_creates_row_and_downloads() {
        let fx = fixture();
        let peer: Arc<dyn PeerGateway> = Arc::new(remote_peer(sample_data(2)));

        let outcome = fx
            .operation
            .run(ReceiveCommandOperationRequest {
                command: PeerCommand::NewPackage { package_id: 77 },
                gateway: peer.clone(),
            })
            .await
            .unwrap();
        let ReceiveCommandOperationOutcome::Dispatched(local_id) = outcome else {
            panic!("expected a dispatched job, got {:?}", outcome);
        };

        let pending = fx.metadata.get_package(local_id).unwrap().unwrap();
        assert_eq!(pending.status, PackageStatus::Downloading);
        assert!(fx.share.staging_path(&pending.uuid).is_dir());
        assert!(
            fx.metadata
                .list_chunks(local_id)
                .unwrap()
                .iter()
                .all(|c| !c.downloaded)
        );

        // let the background job finish
        while fx.jobs.is_running(local_id) {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let done = fx.metadata.get_package(local_id).unwrap().unwrap();
        assert_eq!(done.status, PackageStatus::Public);

        let again = fx
            .operation
            .run(ReceiveCommandOperationRequest {
                command: PeerCommand::NewPackage { package_id: 77 },
                gateway: peer,
            })
            .await
            .unwrap();
        assert_eq!(again, ReceiveCommandOperationOutcome::AlreadyPublic(local_id));
    }

    #[tokio::test]
    async fn test_unknown_command_is_ignored() {
        let fx = fixture();
        let command: PeerCommand =
            serde_json::from_str(r#"{"command": "reboot", "package_id": 1}"#).unwrap();

        let outcome = fx
            .operation
            .run(ReceiveCommandOperationRequest {
                command,
                gateway: Arc::new(FakePeer::new(Vec::new())),
            })
            .await
            .unwrap();
        assert_eq!(outcome, ReceiveCommandOperationOutcome::Ignored);
        assert!(fx.metadata.list_packages().unwrap().is_empty());
    }
}
