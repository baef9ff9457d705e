use super::{conflict_or, open_connection, parse_timestamp};
use crate::error::{OdsError, Result};
use crate::identity::Stage;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackageStatus {
    Downloading,
    Public,
}

impl PackageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Downloading => "Downloading",
            Self::Public => "Public",
        }
    }
}

impl FromStr for PackageStatus {
    type Err = OdsError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "Downloading" => Ok(Self::Downloading),
            "Public" => Ok(Self::Public),
            other => Err(OdsError::Internal(format!("unknown package status: {}", other))),
        }
    }
}

impl fmt::Display for PackageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Package metadata as stored in the database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub id: i64,
    pub uuid: String,
    pub sha256: String,
    pub filename: String,
    pub file_size: u64,
    pub status: PackageStatus,
    pub stage: Stage,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// One 1 MiB slice of a package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageChunk {
    pub index: u32,
    pub sha256: String,
    #[serde(default, skip_serializing)]
    pub downloaded: bool,
}

/// Package plus its chunks ordered by index, as served by `GET /packages/{id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDetail {
    #[serde(flatten)]
    pub package: Package,
    pub chunks: Vec<PackageChunk>,
}

#[derive(Debug, Clone)]
pub struct NewPackage {
    pub uuid: String,
    pub sha256: String,
    pub filename: String,
    pub file_size: u64,
    pub status: PackageStatus,
    pub stage: Stage,
    pub chunks: Vec<PackageChunk>,
}

#[derive(Debug, Clone)]
pub struct MetadataStore {
    db_path: PathBuf,
}

impl MetadataStore {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        let store = Self { db_path };
        store.init_schema()?;
        Ok(store)
    }

    fn get_conn(&self) -> Result<Connection> {
        open_connection(&self.db_path)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS packages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL UNIQUE,
                sha256 TEXT NOT NULL,
                filename TEXT NOT NULL UNIQUE,
                file_size INTEGER NOT NULL,
                status TEXT NOT NULL,
                stage TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS package_chunks (
                pk INTEGER PRIMARY KEY AUTOINCREMENT,
                package_id INTEGER NOT NULL,
                chunk_index INTEGER NOT NULL,
                sha256 TEXT NOT NULL,
                downloaded INTEGER NOT NULL DEFAULT 0,
                UNIQUE (package_id, chunk_index),
                FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE CASCADE
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_package_chunks_pending
             ON package_chunks(package_id, downloaded)",
            [],
        )?;

        Ok(())
    }

    /// Insert a package and all of its chunk rows in one transaction.
    pub fn insert_package(&self, new: &NewPackage) -> Result<Package> {
        for (position, chunk) in new.chunks.iter().enumerate() {
            if chunk.index as usize != position {
                return Err(OdsError::InvalidRequest(format!(
                    "chunk indices must be contiguous from 0: found {} at position {}",
                    chunk.index, position
                )));
            }
        }

        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let created_at = chrono::Utc::now();

        tx.execute(
            "INSERT INTO packages (uuid, sha256, filename, file_size, status, stage, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                new.uuid,
                new.sha256,
                new.filename,
                new.file_size as i64,
                new.status.as_str(),
                new.stage.as_str(),
                created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| conflict_or(e, &format!("package {}", new.filename)))?;
        let id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                "INSERT INTO package_chunks (package_id, chunk_index, sha256, downloaded)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for chunk in &new.chunks {
                stmt.execute(params![id, chunk.index, chunk.sha256, chunk.downloaded])?;
            }
        }

        tx.commit()?;

        Ok(Package {
            id,
            uuid: new.uuid.clone(),
            sha256: new.sha256.clone(),
            filename: new.filename.clone(),
            file_size: new.file_size,
            status: new.status,
            stage: new.stage,
            created_at,
        })
    }

    pub fn get_package(&self, id: i64) -> Result<Option<Package>> {
        let conn = self.get_conn()?;
        let package = conn
            .query_row(
                "SELECT id, uuid, sha256, filename, file_size, status, stage, created_at
                 FROM packages WHERE id = ?1",
                [id],
                package_from_row,
            )
            .optional()?;
        Ok(package)
    }

    /// Numeric input is treated as a package id, anything else as a filename.
    pub fn find_package(&self, id_or_name: &str) -> Result<Option<Package>> {
        if let Ok(id) = id_or_name.parse::<i64>() {
            return self.get_package(id);
        }
        self.get_package_by_filename(id_or_name)
    }

    pub fn get_package_by_filename(&self, filename: &str) -> Result<Option<Package>> {
        let conn = self.get_conn()?;
        let package = conn
            .query_row(
                "SELECT id, uuid, sha256, filename, file_size, status, stage, created_at
                 FROM packages WHERE filename = ?1",
                [filename],
                package_from_row,
            )
            .optional()?;
        Ok(package)
    }

    pub fn get_package_detail(&self, id_or_name: &str) -> Result<Option<PackageDetail>> {
        let Some(package) = self.find_package(id_or_name)? else {
            return Ok(None);
        };
        let chunks = self.list_chunks(package.id)?;
        Ok(Some(PackageDetail { package, chunks }))
    }

    pub fn list_packages(&self) -> Result<Vec<Package>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, uuid, sha256, filename, file_size, status, stage, created_at
             FROM packages ORDER BY id",
        )?;

        let rows = stmt.query_map([], package_from_row)?;

        let mut packages = Vec::new();
        for row in rows {
            packages.push(row?);
        }

        Ok(packages)
    }

    pub fn list_chunks(&self, package_id: i64) -> Result<Vec<PackageChunk>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT chunk_index, sha256, downloaded FROM package_chunks
             WHERE package_id = ?1 ORDER BY chunk_index",
        )?;

        let rows = stmt.query_map([package_id], |row| {
            Ok(PackageChunk {
                index: row.get(0)?,
                sha256: row.get(1)?,
                downloaded: row.get(2)?,
            })
        })?;

        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row?);
        }

        Ok(chunks)
    }

    /// One-way transition; a downloaded chunk is never reset.
    pub fn mark_chunk_downloaded(&self, package_id: i64, index: u32) -> Result<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE package_chunks SET downloaded = 1
             WHERE package_id = ?1 AND chunk_index = ?2",
            params![package_id, index],
        )?;

        if affected == 0 {
            return Err(OdsError::PackageNotFound(format!(
                "chunk {} of package {}",
                index, package_id
            )));
        }

        Ok(())
    }

    pub fn set_package_status(&self, id: i64, status: PackageStatus) -> Result<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE packages SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;

        if affected == 0 {
            return Err(OdsError::PackageNotFound(id.to_string()));
        }

        Ok(())
    }

    /// Delete a package; its chunk rows go with it.
    pub fn delete_package(&self, id: i64) -> Result<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute("DELETE FROM packages WHERE id = ?1", [id])?;
        Ok(affected > 0)
    }

    /// Delete several packages in a single transaction.
    pub fn delete_packages(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM packages WHERE id = ?1")?;
            for id in ids {
                deleted += stmt.execute([id])?;
            }
        }
        tx.commit()?;

        Ok(deleted)
    }
}

fn package_from_row(row: &Row<'_>) -> rusqlite::Result<Package> {
    let file_size: i64 = row.get(4)?;
    let status: String = row.get(5)?;
    let stage: String = row.get(6)?;
    let created_at: String = row.get(7)?;

    Ok(Package {
        id: row.get(0)?,
        uuid: row.get(1)?,
        sha256: row.get(2)?,
        filename: row.get(3)?,
        file_size: file_size as u64,
        status: status
            .parse()
            .map_err(|e: OdsError| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
        stage: Stage::parse_lenient(&stage),
        created_at: parse_timestamp(&created_at)?,
    })
}
