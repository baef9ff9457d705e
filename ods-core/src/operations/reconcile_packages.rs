use crate::error::Result;
use crate::storage::{MetadataStore, Package, PackageStatus, ShareStore, file_hashes};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::Instrument;

/// Brings the package registry and the public share back in agreement.
#[derive(Clone)]
pub struct ReconcilePackagesOperation {
    metadata: Arc<MetadataStore>,
    share: Arc<ShareStore>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePackagesOperationResult {
    /// Share files with no registry row.
    pub orphan_files: Vec<String>,
    /// Public rows whose file is gone.
    pub orphan_packages: Vec<i64>,
    /// Rows whose file no longer matches the stored hashes; both were removed.
    pub corrupted_packages: Vec<i64>,
    pub verified: usize,
    /// Downloading packages left alone.
    pub skipped_in_flight: usize,
}

impl ReconcilePackagesOperation {
    pub fn new(metadata: Arc<MetadataStore>, share: Arc<ShareStore>) -> Self {
        Self { metadata, share }
    }

    pub async fn run(&self) -> Result<ReconcilePackagesOperationResult> {
        let span = tracing::info_span!("reconcile_packages");
        async {
            let result = self.reconcile().await;
            match &result {
                Ok(summary) => tracing::info!(
                    orphan_files = summary.orphan_files.len(),
                    orphan_packages = summary.orphan_packages.len(),
                    corrupted_packages = summary.corrupted_packages.len(),
                    verified = summary.verified,
                    skipped_in_flight = summary.skipped_in_flight,
                    "Reconciliation pass complete"
                ),
                Err(error) => tracing::error!(%error, "Reconciliation pass failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn reconcile(&self) -> Result<ReconcilePackagesOperationResult> {
        let packages = self.metadata.list_packages()?;
        let files: HashSet<String> = self.share.list_share_files().await?.into_iter().collect();
        let by_filename: HashMap<&str, &Package> = packages
            .iter()
            .map(|package| (package.filename.as_str(), package))
            .collect();

        let mut result = ReconcilePackagesOperationResult::default();
        let mut doomed_files = Vec::new();

        let orphan_candidates: Vec<String> = files
            .iter()
            .filter(|filename| !by_filename.contains_key(filename.as_str()))
            .cloned()
            .collect();

        for package in &packages {
            if package.status == PackageStatus::Downloading {
                result.skipped_in_flight += 1;
                continue;
            }

            if !files.contains(&package.filename) {
                tracing::warn!(package_id = package.id, filename = %package.filename, "Package file is missing");
                result.orphan_packages.push(package.id);
                continue;
            }

            if self.matches_disk(package).await? {
                result.verified += 1;
            } else {
                tracing::warn!(package_id = package.id, filename = %package.filename, "Package file is corrupted");
                result.corrupted_packages.push(package.id);
                doomed_files.push(package.filename.clone());
            }
        }

        let doomed_rows: Vec<i64> = result
            .orphan_packages
            .iter()
            .chain(result.corrupted_packages.iter())
            .copied()
            .collect();
        self.metadata.delete_packages(&doomed_rows)?;

        for filename in &doomed_files {
            self.share.delete_share_file(filename).await?;
        }

        result.orphan_files = self.remove_orphan_files(orphan_candidates).await?;
        Ok(result)
    }

    /// Delete share files that still have no package row. The registry is
    /// consulted again per file, since an upload may have registered one
    /// while the pass was hashing.
    async fn remove_orphan_files(&self, candidates: Vec<String>) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for filename in candidates {
            if self.metadata.get_package_by_filename(&filename)?.is_some() {
                tracing::debug!(filename = %filename, "Share file gained a package row, keeping it");
                continue;
            }
            tracing::warn!(filename = %filename, "Share file has no package row");
            self.share.delete_share_file(&filename).await?;
            removed.push(filename);
        }
        removed.sort();
        Ok(removed)
    }

    async fn matches_disk(&self, package: &Package) -> Result<bool> {
        let path = self.share.share_path(&package.filename)?;
        let (whole, chunk_hashes) = file_hashes(&path).await?;
        if whole != package.sha256 {
            return Ok(false);
        }

        let stored = self.metadata.list_chunks(package.id)?;
        if stored.len() != chunk_hashes.len() {
            return Ok(false);
        }

        Ok(stored
            .iter()
            .zip(chunk_hashes.iter())
            .all(|(chunk, actual)| &chunk.sha256 == actual))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::sync_package::tests::{new_package_for, sample_data};

    struct Fixture {
        _temp_dir: tempfile::TempDir,
        metadata: Arc<MetadataStore>,
        share: Arc<ShareStore>,
        operation: ReconcilePackagesOperation,
    }

    fn fixture() -> Fixture {
        let temp_dir = tempfile::tempdir().unwrap();
        let metadata = Arc::new(MetadataStore::new(temp_dir.path().join("ods.db")).unwrap());
        let share = Arc::new(
            ShareStore::new(temp_dir.path().join("share"), temp_dir.path().join("staging"))
                .unwrap(),
        );
        let operation = ReconcilePackagesOperation::new(metadata.clone(), share.clone());
        Fixture {
            _temp_dir: temp_dir,
            metadata,
            share,
            operation,
        }
    }

    async fn publish(fx: &Fixture, filename: &str, data: &[u8], status: PackageStatus) -> Package {
        let mut new = new_package_for(filename, data);
        new.status = status;
        for chunk in &mut new.chunks {
            chunk.downloaded = status == PackageStatus::Public;
        }
        tokio::fs::write(fx.share.share_path(filename).unwrap(), data)
            .await
            .unwrap();
        fx.metadata.insert_package(&new).unwrap()
    }

    async fn corrupt_second_chunk(fx: &Fixture, filename: &str, data: &[u8]) {
        let mut bytes = data.to_vec();
        bytes[crate::storage::CHUNK_SIZE as usize + 10] ^= 0x55;
        tokio::fs::write(fx.share.share_path(filename).unwrap(), bytes)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_orphans_on_both_sides_are_removed() {
        let fx = fixture();
        let kept = publish(&fx, "kept.pkg", &sample_data(1), PackageStatus::Public).await;
        let lost = publish(&fx, "lost.pkg", &sample_data(1), PackageStatus::Public).await;
        tokio::fs::remove_file(fx.share.share_path("lost.pkg").unwrap())
            .await
            .unwrap();
        tokio::fs::write(fx.share.share_path("stray.bin").unwrap(), b"stray")
            .await
            .unwrap();

        let result = fx.operation.run().await.unwrap();
        assert_eq!(result.orphan_files, vec!["stray.bin"]);
        assert_eq!(result.orphan_packages, vec![lost.id]);
        assert_eq!(result.verified, 1);

        assert_eq!(fx.share.list_share_files().await.unwrap(), vec!["kept.pkg"]);
        assert!(fx.metadata.get_package(kept.id).unwrap().is_some());
        assert!(fx.metadata.get_package(lost.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_orphan_file_registered_mid_pass_is_kept() {
        let fx = fixture();
        let data = sample_data(1);
        tokio::fs::write(fx.share.share_path("late.pkg").unwrap(), &data)
            .await
            .unwrap();
        tokio::fs::write(fx.share.share_path("stray.bin").unwrap(), b"stray")
            .await
            .unwrap();

        // the row for late.pkg lands after the share listing was taken
        let mut late = new_package_for("late.pkg", &data);
        late.status = PackageStatus::Public;
        let late = fx.metadata.insert_package(&late).unwrap();

        let removed = fx
            .operation
            .remove_orphan_files(vec!["late.pkg".to_string(), "stray.bin".to_string()])
            .await
            .unwrap();

        assert_eq!(removed, vec!["stray.bin"]);
        assert_eq!(fx.share.list_share_files().await.unwrap(), vec!["late.pkg"]);
        assert!(fx.metadata.get_package(late.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupted_chunk_removes_file_and_row() {
        let fx = fixture();
        let data = sample_data(3);
        let package = publish(&fx, "tool.pkg", &data, PackageStatus::Public).await;
        corrupt_second_chunk(&fx, "tool.pkg", &data).await;

        let result = fx.operation.run().await.unwrap();
        assert_eq!(result.corrupted_packages, vec![package.id]);
        assert!(fx.share.list_share_files().await.unwrap().is_empty());
        assert!(fx.metadata.get_package(package.id).unwrap().is_none());
        assert!(fx.metadata.list_chunks(package.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_downloading_packages_are_never_touched() {
        let fx = fixture();
        let data = sample_data(2);
        let corrupted = publish(&fx, "partial.pkg", &data, PackageStatus::Downloading).await;
        corrupt_second_chunk(&fx, "partial.pkg", &data).await;

        let missing = publish(&fx, "pending.pkg", &data, PackageStatus::Downloading).await;
        tokio::fs::remove_file(fx.share.share_path("pending.pkg").unwrap())
            .await
            .unwrap();

        let result = fx.operation.run().await.unwrap();
        assert_eq!(result.skipped_in_flight, 2);
        assert!(result.corrupted_packages.is_empty());
        assert!(result.orphan_packages.is_empty());
        assert!(fx.metadata.get_package(corrupted.id).unwrap().is_some());
        assert!(fx.metadata.get_package(missing.id).unwrap().is_some());
        assert_eq!(fx.share.list_share_files().await.unwrap(), vec!["partial.pkg"]);
    }

    #[tokio::test]
    async fn test_intact_package_is_left_alone() {
        let fx = fixture();
        let data = sample_data(2);
        let package = publish(&fx, "tool.pkg", &data, PackageStatus::Public).await;

        let result = fx.operation.run().await.unwrap();
        assert_eq!(result, ReconcilePackagesOperationResult {
            verified: 1,
            ..Default::default()
        });
        let stored = fx.metadata.get_package(package.id).unwrap().unwrap();
        assert_eq!(stored.sha256, package.sha256);
        assert_eq!(stored.status, PackageStatus::Public);
        assert_eq!(fx.share.list_share_files().await.unwrap(), vec!["tool.pkg"]);
    }
}
