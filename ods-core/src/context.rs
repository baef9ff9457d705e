use crate::client::PeerConnector;
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::identity::SecretKey;
use crate::storage::{MetadataStore, PeerStore, ShareStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Settings the core needs at runtime; loaded by the server from its config.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub database_path: PathBuf,
    pub share_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_sync_attempts: u32,
}

impl NodeSettings {
    pub const DEFAULT_SYNC_ATTEMPTS: u32 = 5;

    /// Settings with every path rooted at `data_dir`.
    pub fn under(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            database_path: data_dir.join("ods.db"),
            share_dir: data_dir.join("share"),
            staging_dir: data_dir.join("staging"),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(60),
            max_sync_attempts: Self::DEFAULT_SYNC_ATTEMPTS,
        }
    }
}

/// Explicit execution context handed to every core operation.
#[derive(Clone)]
pub struct NodeContext {
    pub settings: NodeSettings,
    pub metadata: Arc<MetadataStore>,
    pub peers: Arc<PeerStore>,
    pub share: Arc<ShareStore>,
    pub connector: PeerConnector,
    pub clock: Arc<dyn Clock>,
}

impl NodeContext {
    pub fn open(settings: NodeSettings, database_key: &SecretKey) -> Result<Self> {
        Self::open_with_clock(settings, database_key, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        settings: NodeSettings,
        database_key: &SecretKey,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let metadata = Arc::new(MetadataStore::new(settings.database_path.clone())?);
        let peers = Arc::new(PeerStore::new(settings.database_path.clone(), database_key)?);
        let share = Arc::new(ShareStore::new(
            settings.share_dir.clone(),
            settings.staging_dir.clone(),
        )?);
        let connector = PeerConnector::new(
            peers.clone(),
            clock.clone(),
            settings.connect_timeout,
            settings.request_timeout,
        )?;

        Ok(Self {
            settings,
            metadata,
            peers,
            share,
            connector,
            clock,
        })
    }
}
