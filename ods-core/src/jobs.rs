use crate::client::PeerGateway;
use crate::operations::{SyncPackageOperation, SyncPackageOperationRequest};
use crate::storage::{MetadataStore, ShareStore};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

/// Runs each package download as its own background task, never more than
/// one at a time for the same package id.
#[derive(Clone)]
pub struct SyncJobRunner {
    operation: SyncPackageOperation,
    in_flight: Arc<Mutex<HashSet<i64>>>,
}

struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<i64>>>,
    package_id: i64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.in_flight).remove(&self.package_id);
    }
}

fn lock(set: &Mutex<HashSet<i64>>) -> MutexGuard<'_, HashSet<i64>> {
    match set.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SyncJobRunner {
    pub fn new(metadata: Arc<MetadataStore>, share: Arc<ShareStore>, max_attempts: u32) -> Self {
        Self {
            operation: SyncPackageOperation::new(metadata, share, max_attempts),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Start a download job. Returns `None` when one is already running for
    /// this package.
    pub fn dispatch(
        &self,
        package_id: i64,
        gateway: Arc<dyn PeerGateway>,
    ) -> Option<JoinHandle<()>> {
        if !lock(&self.in_flight).insert(package_id) {
            tracing::info!(package_id, "Download already in progress, not starting another");
            return None;
        }

        let guard = InFlightGuard {
            in_flight: self.in_flight.clone(),
            package_id,
        };
        let operation = self.operation.clone();

        Some(tokio::spawn(async move {
            let _guard = guard;
            let request = SyncPackageOperationRequest {
                package_id,
                gateway,
            };
            match operation.run(request).await {
                Ok(outcome) => {
                    tracing::info!(package_id, state = ?outcome.state(), "Sync job finished")
                }
                Err(error) => tracing::error!(package_id, %error, "Sync job failed"),
            }
        }))
    }

    pub fn is_running(&self, package_id: i64) -> bool {
        lock(&self.in_flight).contains(&package_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::sync_package::tests::{FakePeer, new_package_for, sample_data};
    use crate::storage::PackageStatus;

    #[tokio::test]
    async fn test_one_job_per_package() {
        let temp_dir = tempfile::tempdir().unwrap();
        let metadata = Arc::new(MetadataStore::new(temp_dir.path().join("ods.db")).unwrap());
        let share = Arc::new(
            ShareStore::new(temp_dir.path().join("share"), temp_dir.path().join("staging"))
                .unwrap(),
        );
        let data = sample_data(2);
        let package = metadata
            .insert_package(&new_package_for("tool.pkg", &data))
            .unwrap();

        let runner = SyncJobRunner::new(metadata.clone(), share, 5);
        let peer: Arc<dyn PeerGateway> = Arc::new(FakePeer::new(data));

        let first = runner.dispatch(package.id, peer.clone()).unwrap();
        assert!(runner.is_running(package.id));
        assert!(runner.dispatch(package.id, peer.clone()).is_none());

        first.await.unwrap();
        assert!(!runner.is_running(package.id));

        let stored = metadata.get_package(package.id).unwrap().unwrap();
        assert_eq!(stored.status, PackageStatus::Public);
    }
}
