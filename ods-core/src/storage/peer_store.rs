use super::{is_constraint_violation, open_connection, parse_timestamp};
use crate::cipher::AesCipher;
use crate::error::{OdsError, Result};
use crate::identity::{IdentityDefaults, NodeIdentity, PeerNode, SecretKey, Stage};
use crate::storage::compute_hash;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::PathBuf;

/// Persists this node's identity and the directory of registered peers.
///
/// Keys are kept encrypted under the database key and are only ever handed
/// out through `node_key` / `peer_key`, never as part of the descriptive
/// records.
#[derive(Clone)]
pub struct PeerStore {
    db_path: PathBuf,
    cipher: AesCipher,
}

impl PeerStore {
    pub fn new(db_path: PathBuf, database_key: &SecretKey) -> Result<Self> {
        let store = Self {
            db_path,
            cipher: AesCipher::new(database_key.as_bytes())?,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn get_conn(&self) -> Result<Connection> {
        open_connection(&self.db_path)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS node_identity (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                issuer TEXT NOT NULL,
                key_encrypted TEXT NOT NULL,
                name TEXT NOT NULL,
                url TEXT,
                stage TEXT NOT NULL,
                firewalled_mode INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        // key_fingerprint enforces key uniqueness; the ciphertext itself is
        // salted by a random IV and can't be compared.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS peer_nodes (
                pk INTEGER PRIMARY KEY AUTOINCREMENT,
                issuer TEXT NOT NULL UNIQUE,
                key_encrypted TEXT NOT NULL,
                key_fingerprint TEXT NOT NULL UNIQUE,
                url TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                stage TEXT NOT NULL,
                firewalled_mode INTEGER NOT NULL DEFAULT 0,
                registered_on TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    /// Create the identity on first start, otherwise refresh its mutable
    /// descriptive fields. The issuer and key never change once created.
    pub fn ensure_identity(&self, defaults: &IdentityDefaults) -> Result<NodeIdentity> {
        let conn = self.get_conn()?;

        let existing = conn
            .query_row(
                "SELECT issuer FROM node_identity WHERE id = 1",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        match existing {
            Some(issuer) => {
                conn.execute(
                    "UPDATE node_identity SET name = ?1, url = ?2, stage = ?3, firewalled_mode = ?4
                     WHERE id = 1",
                    params![
                        defaults.name,
                        defaults.url,
                        defaults.stage.as_str(),
                        defaults.firewalled_mode,
                    ],
                )?;
                tracing::debug!(issuer = %issuer, "Refreshed node identity profile");
            }
            None => {
                let issuer = ulid::Ulid::new().to_string().to_ascii_lowercase();
                let key = SecretKey::generate();
                let key_encrypted = self.cipher.encrypt(key.to_base64().as_bytes())?;

                conn.execute(
                    "INSERT INTO node_identity (id, issuer, key_encrypted, name, url, stage, firewalled_mode)
                     VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        issuer,
                        key_encrypted,
                        defaults.name,
                        defaults.url,
                        defaults.stage.as_str(),
                        defaults.firewalled_mode,
                    ],
                )?;
                tracing::info!(
                    issuer = %issuer,
                    "Created node identity; provision the key to peers with `ods identity`"
                );
            }
        }

        self.identity()
    }

    pub fn identity(&self) -> Result<NodeIdentity> {
        let conn = self.get_conn()?;
        conn.query_row(
            "SELECT issuer, name, url, stage, firewalled_mode FROM node_identity WHERE id = 1",
            [],
            |row| {
                let stage: String = row.get(3)?;
                Ok(NodeIdentity {
                    issuer: row.get(0)?,
                    name: row.get(1)?,
                    url: row.get(2)?,
                    stage: Stage::parse_lenient(&stage),
                    firewalled_mode: row.get(4)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| OdsError::Config("node identity has not been initialized".to_string()))
    }

    pub fn node_key(&self) -> Result<SecretKey> {
        let conn = self.get_conn()?;
        let encrypted: String = conn
            .query_row(
                "SELECT key_encrypted FROM node_identity WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| {
                OdsError::Config("node identity has not been initialized".to_string())
            })?;
        self.decrypt_key(&encrypted)
    }

    /// Store a new peer. Duplicate issuer or key is a `RegistrationConflict`
    /// and leaves the table untouched.
    pub fn insert_peer(&self, peer: &PeerNode, key: &SecretKey) -> Result<PeerNode> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let key_encrypted = self.cipher.encrypt(key.to_base64().as_bytes())?;
        let inserted = tx.execute(
            "INSERT INTO peer_nodes (
                issuer, key_encrypted, key_fingerprint, url, name, stage, firewalled_mode, registered_on
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                peer.issuer,
                key_encrypted,
                compute_hash(key.as_bytes()),
                peer.url,
                peer.name,
                peer.stage.as_str(),
                peer.firewalled_mode,
                peer.registered_on.to_rfc3339(),
            ],
        );

        match inserted {
            Ok(_) => {
                tx.commit()?;
                Ok(peer.clone())
            }
            Err(error) if is_constraint_violation(&error) => {
                tx.rollback()?;
                Err(OdsError::RegistrationConflict(format!(
                    "peer {} or its key is already registered",
                    peer.issuer
                )))
            }
            Err(error) => Err(error.into()),
        }
    }

    pub fn get_peer(&self, issuer: &str) -> Result<Option<PeerNode>> {
        let conn = self.get_conn()?;
        let peer = conn
            .query_row(
                "SELECT issuer, url, name, stage, firewalled_mode, registered_on
                 FROM peer_nodes WHERE issuer = ?1",
                [issuer],
                peer_from_row,
            )
            .optional()?;
        Ok(peer)
    }

    pub fn peer_key(&self, issuer: &str) -> Result<SecretKey> {
        let conn = self.get_conn()?;
        let encrypted: String = conn
            .query_row(
                "SELECT key_encrypted FROM peer_nodes WHERE issuer = ?1",
                [issuer],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| OdsError::PeerNotFound(issuer.to_string()))?;
        self.decrypt_key(&encrypted)
    }

    pub fn list_peers(&self) -> Result<Vec<PeerNode>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT issuer, url, name, stage, firewalled_mode, registered_on
             FROM peer_nodes ORDER BY pk",
        )?;
        let rows = stmt.query_map([], peer_from_row)?;

        let mut peers = Vec::new();
        for row in rows {
            peers.push(row?);
        }

        Ok(peers)
    }

    /// Overwrite descriptive fields; issuer and key are left alone.
    pub fn update_peer_profile(
        &self,
        issuer: &str,
        name: &str,
        url: Option<&str>,
        stage: Stage,
        firewalled_mode: bool,
    ) -> Result<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE peer_nodes SET name = ?1, url = COALESCE(?2, url), stage = ?3, firewalled_mode = ?4
             WHERE issuer = ?5",
            params![name, url, stage.as_str(), firewalled_mode, issuer],
        )?;

        if affected == 0 {
            return Err(OdsError::PeerNotFound(issuer.to_string()));
        }

        Ok(())
    }

    pub fn remove_peer(&self, issuer: &str) -> Result<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute("DELETE FROM peer_nodes WHERE issuer = ?1", [issuer])?;
        Ok(affected > 0)
    }

    fn decrypt_key(&self, encrypted: &str) -> Result<SecretKey> {
        let encoded = self.cipher.decrypt_string(encrypted).map_err(|_| {
            OdsError::Config(
                "stored key could not be decrypted; is the database key correct?".to_string(),
            )
        })?;
        SecretKey::from_base64(&encoded)
    }
}

fn peer_from_row(row: &Row<'_>) -> rusqlite::Result<PeerNode> {
    let stage: String = row.get(3)?;
    let registered_on: String = row.get(5)?;

    Ok(PeerNode {
        issuer: row.get(0)?,
        url: row.get(1)?,
        name: row.get(2)?,
        stage: Stage::parse_lenient(&stage),
        firewalled_mode: row.get(4)?,
        registered_on: parse_timestamp(&registered_on)?,
    })
}
