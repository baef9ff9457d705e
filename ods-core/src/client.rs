use crate::auth::{bearer_header, mint_token};
use crate::cipher::AesCipher;
use crate::clock::Clock;
use crate::error::{OdsError, Result};
use crate::identity::{NodeProfile, RegistrationPayload, SecretKey};
use crate::storage::{Package, PackageDetail, PeerStore};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, RANGE};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Directive pushed from one node to another over `POST /command`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum PeerCommand {
    NewPackage { package_id: i64 },
    /// Any command kind this node does not understand.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct PackageList {
    items: Vec<Package>,
}

/// Outbound operations against a single peer.
#[async_trait]
pub trait PeerGateway: Send + Sync {
    fn issuer(&self) -> &str;

    async fn send_command(&self, command: &PeerCommand) -> Result<()>;

    async fn fetch_package_metadata(&self, id_or_name: &str) -> Result<PackageDetail>;

    async fn fetch_all_packages(&self) -> Result<Vec<Package>>;

    /// Fetch the inclusive byte range of a shared file. No retry.
    async fn download_chunk(&self, filename: &str, range_start: u64, range_end: u64)
    -> Result<Bytes>;

    async fn register_with(&self, payload: &RegistrationPayload) -> Result<()>;

    async fn about(&self) -> Result<NodeProfile>;
}

/// HTTP gateway to one peer. Every request carries a freshly minted token
/// signed with the key shared with that peer.
pub struct PeerClient {
    http: reqwest::Client,
    base_url: String,
    local_issuer: String,
    remote_issuer: String,
    key: SecretKey,
    clock: Arc<dyn Clock>,
}

impl PeerClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        local_issuer: impl Into<String>,
        remote_issuer: impl Into<String>,
        key: SecretKey,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            local_issuer: local_issuer.into(),
            remote_issuer: remote_issuer.into(),
            key,
            clock,
        }
    }

    fn authorization(&self, iss_data: Option<String>) -> Result<String> {
        let token = mint_token(
            &self.local_issuer,
            &self.remote_issuer,
            &self.key,
            self.clock.now(),
            iss_data,
        )?;
        Ok(bearer_header(&token))
    }

    fn endpoint(&self, segments: &[&str]) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base_url).map_err(|error| {
            OdsError::InvalidRequest(format!("invalid peer url {}: {}", self.base_url, error))
        })?;
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                OdsError::InvalidRequest(format!("peer url {} cannot be a base", self.base_url))
            })?;
            path.pop_if_empty();
            path.extend(segments);
        }
        Ok(url)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|error| OdsError::Transport(error.to_string()))?;
        check_status(&self.remote_issuer, response)
    }
}

fn check_status(remote: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = format!("{} {} from peer {}", status, response.url().path(), remote);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(OdsError::Authentication(message)),
        StatusCode::CONFLICT => Err(OdsError::RegistrationConflict(message)),
        _ => Err(OdsError::Transport(message)),
    }
}

#[async_trait]
impl PeerGateway for PeerClient {
    fn issuer(&self) -> &str {
        &self.remote_issuer
    }

    async fn send_command(&self, command: &PeerCommand) -> Result<()> {
        let request = self
            .http
            .post(self.endpoint(&["command"])?)
            .header(AUTHORIZATION, self.authorization(None)?)
            .json(command);
        self.send(request).await?;
        Ok(())
    }

    async fn fetch_package_metadata(&self, id_or_name: &str) -> Result<PackageDetail> {
        let request = self
            .http
            .get(self.endpoint(&["packages", id_or_name])?)
            .header(AUTHORIZATION, self.authorization(None)?);
        self.send(request)
            .await?
            .json::<PackageDetail>()
            .await
            .map_err(|error| OdsError::Transport(format!("invalid package metadata: {}", error)))
    }

    async fn fetch_all_packages(&self) -> Result<Vec<Package>> {
        let request = self
            .http
            .get(self.endpoint(&["packages"])?)
            .header(AUTHORIZATION, self.authorization(None)?);
        let list = self
            .send(request)
            .await?
            .json::<PackageList>()
            .await
            .map_err(|error| OdsError::Transport(format!("invalid package list: {}", error)))?;
        Ok(list.items)
    }

    async fn download_chunk(
        &self,
        filename: &str,
        range_start: u64,
        range_end: u64,
    ) -> Result<Bytes> {
        let request = self
            .http
            .get(self.endpoint(&["share", filename])?)
            .header(AUTHORIZATION, self.authorization(None)?)
            .header(RANGE, format!("bytes={}-{}", range_start, range_end));
        self.send(request)
            .await?
            .bytes()
            .await
            .map_err(|error| OdsError::Transport(error.to_string()))
    }

    async fn register_with(&self, payload: &RegistrationPayload) -> Result<()> {
        let cipher = AesCipher::new(self.key.as_bytes())?;
        let iss_data = cipher.encrypt(&serde_json::to_vec(payload)?)?;

        let request = self
            .http
            .post(self.endpoint(&["register"])?)
            .header(AUTHORIZATION, self.authorization(Some(iss_data))?);
        self.send(request).await?;
        Ok(())
    }

    async fn about(&self) -> Result<NodeProfile> {
        let request = self
            .http
            .get(self.endpoint(&["about"])?)
            .header(AUTHORIZATION, self.authorization(None)?);
        self.send(request)
            .await?
            .json::<NodeProfile>()
            .await
            .map_err(|error| OdsError::Transport(format!("invalid about response: {}", error)))
    }
}

/// Builds `PeerClient`s for registered peers from the peer directory.
#[derive(Clone)]
pub struct PeerConnector {
    http: reqwest::Client,
    peers: Arc<PeerStore>,
    clock: Arc<dyn Clock>,
}

impl PeerConnector {
    pub fn new(
        peers: Arc<PeerStore>,
        clock: Arc<dyn Clock>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|error| OdsError::Config(format!("failed to build http client: {}", error)))?;

        Ok(Self { http, peers, clock })
    }

    pub fn connect(&self, issuer: &str) -> Result<PeerClient> {
        let identity = self.peers.identity()?;
        let peer = self
            .peers
            .get_peer(issuer)?
            .ok_or_else(|| OdsError::PeerNotFound(issuer.to_string()))?;
        let key = self.peers.peer_key(issuer)?;

        Ok(PeerClient::new(
            self.http.clone(),
            peer.url,
            identity.issuer,
            peer.issuer,
            key,
            self.clock.clone(),
        ))
    }
}
