use crate::client::{PeerConnector, PeerGateway};
use crate::clock::Clock;
use crate::error::{OdsError, Result};
use crate::identity::{PeerNode, RegistrationPayload, SecretKey, Stage};
use crate::storage::PeerStore;
use std::sync::Arc;

/// Initiator side of the registration handshake. The remote issuer and key
/// are provisioned out-of-band by an administrator.
#[derive(Clone)]
pub struct RegisterWithPeerOperation {
    peers: Arc<PeerStore>,
    connector: PeerConnector,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone)]
pub struct RegisterWithPeerOperationRequest {
    pub url: String,
    pub issuer: String,
    /// Remote node's key, base64 of 32 bytes.
    pub key: String,
}

impl RegisterWithPeerOperation {
    pub fn new(peers: Arc<PeerStore>, connector: PeerConnector, clock: Arc<dyn Clock>) -> Self {
        Self {
            peers,
            connector,
            clock,
        }
    }

    pub async fn run(&self, request: RegisterWithPeerOperationRequest) -> Result<PeerNode> {
        let url = normalize_url(&request.url)?;
        let key = SecretKey::from_base64(&request.key)?;
        let issuer = request.issuer.trim().to_string();
        if issuer.is_empty() {
            return Err(OdsError::InvalidRequest("issuer must not be empty".to_string()));
        }

        self.peers.insert_peer(
            &PeerNode {
                issuer: issuer.clone(),
                url: url.clone(),
                name: String::new(),
                stage: Stage::default(),
                firewalled_mode: false,
                registered_on: self.clock.now(),
            },
            &key,
        )?;
        tracing::info!(issuer = %issuer, url = %url, "Registering with remote node");

        let client = match self.connector.connect(&issuer) {
            Ok(client) => client,
            Err(error) => {
                self.peers.remove_peer(&issuer)?;
                return Err(error);
            }
        };

        if let Err(error) = self.handshake(&client).await {
            tracing::error!(issuer = %issuer, %error, "Registration failed, removing provisional peer");
            self.peers.remove_peer(&issuer)?;
            return Err(error);
        }

        match client.about().await {
            Ok(profile) => {
                if profile.issuer != issuer {
                    tracing::warn!(
                        expected = %issuer,
                        reported = %profile.issuer,
                        "Remote node reported a different issuer"
                    );
                }
                self.peers.update_peer_profile(
                    &issuer,
                    &profile.name,
                    profile.url.as_deref(),
                    profile.stage,
                    profile.firewalled_mode,
                )?;
            }
            Err(error) => {
                tracing::warn!(issuer = %issuer, %error, "Registered, but could not fetch remote profile");
            }
        }

        self.peers
            .get_peer(&issuer)?
            .ok_or_else(|| OdsError::PeerNotFound(issuer))
    }

    async fn handshake(&self, gateway: &dyn PeerGateway) -> Result<()> {
        let identity = self.peers.identity()?;
        let payload = RegistrationPayload {
            key: self.peers.node_key()?.to_base64(),
            name: identity.name,
            url: identity.url,
            stage: identity.stage,
            firewalled_mode: identity.firewalled_mode,
        };
        gateway.register_with(&payload).await
    }
}

/// Reduce a peer url to `scheme://host[:port]`.
pub fn normalize_url(raw: &str) -> Result<String> {
    let url = reqwest::Url::parse(raw.trim())
        .map_err(|error| OdsError::InvalidRequest(format!("invalid url {:?}: {}", raw, error)))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(OdsError::InvalidRequest(format!(
            "unsupported url scheme: {}",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| OdsError::InvalidRequest(format!("url {:?} has no host", raw)))?;

    Ok(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}
