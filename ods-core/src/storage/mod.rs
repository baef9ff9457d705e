//! Storage modules for ODS
//!
//! Provides the SQLite backed package registry and peer directory, and the
//! filesystem share/staging store.

pub mod metadata_store;
pub mod peer_store;
pub mod share_store;

pub use metadata_store::{
    MetadataStore, NewPackage, Package, PackageChunk, PackageDetail, PackageStatus,
};
pub use peer_store::PeerStore;
pub use share_store::{CHUNK_SIZE, ShareStore, compute_hash, file_hashes, verify_hash};

use crate::error::{OdsError, Result};
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

pub(crate) fn open_connection(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

pub(crate) fn is_constraint_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

pub(crate) fn parse_timestamp(value: &str) -> rusqlite::Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&chrono::Utc))
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

pub(crate) fn conflict_or(error: rusqlite::Error, what: &str) -> OdsError {
    if is_constraint_violation(&error) {
        OdsError::Conflict(format!("{} already exists", what))
    } else {
        OdsError::Database(error)
    }
}
