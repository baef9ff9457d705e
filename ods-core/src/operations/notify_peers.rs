use crate::client::{PeerCommand, PeerConnector, PeerGateway};
use crate::error::Result;
use crate::storage::PeerStore;
use std::sync::Arc;

/// Pushes a `new_package` command to every registered peer.
#[derive(Clone)]
pub struct NotifyPeersOperation {
    peers: Arc<PeerStore>,
    connector: PeerConnector,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyPeersOperationResult {
    pub notified: Vec<String>,
    /// (issuer, error) for every peer that could not be reached.
    pub failed: Vec<(String, String)>,
}

impl NotifyPeersOperation {
    pub fn new(peers: Arc<PeerStore>, connector: PeerConnector) -> Self {
        Self { peers, connector }
    }

    pub async fn run(&self, package_id: i64) -> Result<NotifyPeersOperationResult> {
        let mut gateways: Vec<Arc<dyn PeerGateway>> = Vec::new();
        let mut result = NotifyPeersOperationResult::default();

        for peer in self.peers.list_peers()? {
            match self.connector.connect(&peer.issuer) {
                Ok(client) => gateways.push(Arc::new(client)),
                Err(error) => result.failed.push((peer.issuer, error.to_string())),
            }
        }

        let sent = notify(&gateways, &PeerCommand::NewPackage { package_id }).await;
        result.notified = sent.notified;
        result.failed.extend(sent.failed);
        Ok(result)
    }
}

/// Send `command` to each gateway in turn. One peer failing does not stop
/// the others.
pub async fn notify(
    gateways: &[Arc<dyn PeerGateway>],
    command: &PeerCommand,
) -> NotifyPeersOperationResult {
    let mut result = NotifyPeersOperationResult::default();

    for gateway in gateways {
        let issuer = gateway.issuer().to_string();
        match gateway.send_command(command).await {
            Ok(()) => {
                tracing::info!(issuer = %issuer, ?command, "Notified peer");
                result.notified.push(issuer);
            }
            Err(error) => {
                tracing::warn!(issuer = %issuer, %error, "Failed to notify peer");
                result.failed.push((issuer, error.to_string()));
            }
        }
    }

    result
}
