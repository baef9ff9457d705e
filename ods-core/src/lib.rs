//! ODS Core - trust and synchronization between package mirroring nodes
//!
//! A federation of peer nodes that mirror software packages using:
//! - AES-256-CBC protected secrets at rest and during registration
//! - HS256 signed short-lived bearer tokens between peers
//! - SHA256 verified 1 MiB chunks with whole-pass retry
//! - SQLite for local metadata

pub mod auth;
pub mod cipher;
pub mod client;
pub mod clock;
pub mod context;
pub mod error;
pub mod identity;
pub mod jobs;
pub mod operations;
pub mod storage;

pub use auth::{
    AuthenticatedRequest, Claims, PeerLookup, TOKEN_SKEW_SECONDS, authenticate, bearer_header,
    mint_token, validate_bearer,
};
pub use cipher::AesCipher;
pub use client::{PeerClient, PeerCommand, PeerConnector, PeerGateway};
pub use clock::{Clock, FixedClock, SystemClock};
pub use context::{NodeContext, NodeSettings};
pub use error::{OdsError, Result};
pub use identity::{
    IdentityDefaults, NodeIdentity, NodeProfile, PeerNode, RegistrationPayload, SecretKey, Stage,
};
pub use jobs::SyncJobRunner;
pub use operations::*;
pub use storage::{
    CHUNK_SIZE, MetadataStore, NewPackage, Package, PackageChunk, PackageDetail, PackageStatus,
    PeerStore, ShareStore, compute_hash, file_hashes, verify_hash,
};
