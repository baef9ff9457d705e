//! Operations for ODS nodes
//!
//! Each operation is constructed from store handles taken out of a
//! `NodeContext` and exposes a single `run`.

pub mod notify_peers;
pub mod receive_command;
pub mod reconcile_packages;
pub mod register_peer;
pub mod register_with_peer;
pub mod sync_package;
pub mod upload_package;

pub use notify_peers::{NotifyPeersOperation, NotifyPeersOperationResult};
pub use receive_command::{
    ReceiveCommandOperation, ReceiveCommandOperationOutcome, ReceiveCommandOperationRequest,
};
pub use reconcile_packages::{ReconcilePackagesOperation, ReconcilePackagesOperationResult};
pub use register_peer::{RegisterPeerOperation, RegisterPeerOperationRequest};
pub use register_with_peer::{
    RegisterWithPeerOperation, RegisterWithPeerOperationRequest, normalize_url,
};
pub use sync_package::{
    SyncPackageOperation, SyncPackageOperationOutcome, SyncPackageOperationRequest, SyncState,
};
pub use upload_package::{UploadPackageOperation, UploadPackageOperationRequest};
