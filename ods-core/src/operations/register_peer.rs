use crate::auth::{PeerLookup, authenticate};
use crate::cipher::AesCipher;
use crate::clock::Clock;
use crate::error::{OdsError, Result};
use crate::identity::{PeerNode, RegistrationPayload, SecretKey};
use crate::storage::PeerStore;
use std::sync::Arc;

/// Responder side of the registration handshake (`POST /register`).
#[derive(Clone)]
pub struct RegisterPeerOperation {
    peers: Arc<PeerStore>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Default)]
pub struct RegisterPeerOperationRequest {
    pub authorization: Option<String>,
    /// Remote IP, used as the peer url when the payload carries none.
    pub remote_addr: Option<String>,
}

impl RegisterPeerOperation {
    pub fn new(peers: Arc<PeerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { peers, clock }
    }

    pub async fn run(&self, request: RegisterPeerOperationRequest) -> Result<PeerNode> {
        let now = self.clock.now();
        let authenticated = authenticate(
            &self.peers,
            request.authorization.as_deref(),
            now,
            PeerLookup::Optional,
        )?;
        let issuer = authenticated.claims.iss;
        tracing::info!(issuer = %issuer, "Registration request received");

        let iss_data = authenticated.claims.iss_data.ok_or_else(|| {
            OdsError::InvalidRequest("registration token carries no iss_data claim".to_string())
        })?;

        let cipher = AesCipher::new(self.peers.node_key()?.as_bytes())?;
        let decrypted = cipher.decrypt(&iss_data).map_err(|_| {
            OdsError::Authentication("registration payload could not be decrypted".to_string())
        })?;
        let payload: RegistrationPayload = serde_json::from_slice(&decrypted).map_err(|error| {
            OdsError::InvalidRequest(format!("malformed registration payload: {}", error))
        })?;

        let key = SecretKey::from_base64(&payload.key)?;

        let url = match (payload.url.filter(|url| !url.is_empty()), request.remote_addr) {
            (Some(url), _) => url,
            (None, Some(addr)) => format!("http://{}", addr),
            (None, None) => {
                return Err(OdsError::InvalidRequest(
                    "registering node supplied no url".to_string(),
                ));
            }
        };

        let peer = self.peers.insert_peer(
            &PeerNode {
                issuer,
                url,
                name: payload.name,
                stage: payload.stage,
                firewalled_mode: payload.firewalled_mode,
                registered_on: now,
            },
            &key,
        )?;

        tracing::info!(issuer = %peer.issuer, url = %peer.url, "Registered remote node");
        Ok(peer)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::{bearer_header, mint_token};
    use crate::clock::{FixedClock, SystemClock};
    use crate::context::{NodeContext, NodeSettings};
    use crate::identity::{IdentityDefaults, NodeIdentity, Stage};
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    pub(crate) fn node(dir: &std::path::Path, name: &str) -> (Arc<PeerStore>, NodeIdentity) {
        let store =
            Arc::new(PeerStore::new(dir.join(format!("{}.db", name)), &SecretKey::generate()).unwrap());
        let identity = store
            .ensure_identity(&IdentityDefaults {
                name: name.to_string(),
                url: Some(format!("http://{}.local", name)),
                stage: Stage::Test,
                firewalled_mode: false,
            })
            .unwrap();
        (store, identity)
    }

    /// Authorization header the initiator would send to `responder`.
    fn registration_header(
        initiator: &NodeIdentity,
        responder: &NodeIdentity,
        responder_key: &SecretKey,
        key_b64: &str,
    ) -> String {
        registration_header_at(
            initiator,
            responder,
            responder_key,
            key_b64,
            chrono::Utc::now(),
        )
    }

    fn registration_header_at(
        initiator: &NodeIdentity,
        responder: &NodeIdentity,
        responder_key: &SecretKey,
        key_b64: &str,
        issued_at: chrono::DateTime<chrono::Utc>,
    ) -> String {
        let payload = RegistrationPayload {
            key: key_b64.to_string(),
            name: initiator.name.clone(),
            url: initiator.url.clone(),
            stage: initiator.stage,
            firewalled_mode: false,
        };
        let iss_data = AesCipher::new(responder_key.as_bytes())
            .unwrap()
            .encrypt(&serde_json::to_vec(&payload).unwrap())
            .unwrap();
        let token = mint_token(
            &initiator.issuer,
            &responder.issuer,
            responder_key,
            issued_at,
            Some(iss_data),
        )
        .unwrap();
        bearer_header(&token)
    }

    fn request(header: String) -> RegisterPeerOperationRequest {
        RegisterPeerOperationRequest {
            authorization: Some(header),
            remote_addr: None,
        }
    }

    #[tokio::test]
    async fn test_registration_stores_initiator_key() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (a_store, a) = node(temp_dir.path(), "node-a");
        let (b_store, b) = node(temp_dir.path(), "node-b");
        let a_key = a_store.node_key().unwrap();
        let b_key = b_store.node_key().unwrap();

        let operation = RegisterPeerOperation::new(b_store.clone(), Arc::new(SystemClock));
        let header = registration_header(&a, &b, &b_key, &a_key.to_base64());
        let peer = operation.run(request(header.clone())).await.unwrap();

        assert_eq!(peer.issuer, a.issuer);
        assert_eq!(peer.url, "http://node-a.local");
        assert_eq!(peer.stage, Stage::Test);
        assert_eq!(b_store.peer_key(&a.issuer).unwrap(), a_key);

        let again = operation.run(request(header)).await;
        assert!(matches!(again, Err(OdsError::RegistrationConflict(_))));
        assert_eq!(b_store.list_peers().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_short_key_is_rejected_before_insert() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (_, a) = node(temp_dir.path(), "node-a");
        let (b_store, b) = node(temp_dir.path(), "node-b");
        let b_key = b_store.node_key().unwrap();

        let operation = RegisterPeerOperation::new(b_store.clone(), Arc::new(SystemClock));
        let short = STANDARD.encode([9u8; 16]);
        let result = operation
            .run(request(registration_header(&a, &b, &b_key, &short)))
            .await;

        assert!(matches!(result, Err(OdsError::InvalidKey(_))));
        assert!(b_store.list_peers().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_token_without_payload_or_signature_is_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (_, a) = node(temp_dir.path(), "node-a");
        let (b_store, b) = node(temp_dir.path(), "node-b");
        let b_key = b_store.node_key().unwrap();
        let operation = RegisterPeerOperation::new(b_store.clone(), Arc::new(SystemClock));

        let plain = mint_token(&a.issuer, &b.issuer, &b_key, chrono::Utc::now(), None).unwrap();
        let result = operation.run(request(bearer_header(&plain))).await;
        assert!(matches!(result, Err(OdsError::InvalidRequest(_))));

        let forged = registration_header(&a, &b, &SecretKey::generate(), &b_key.to_base64());
        let result = operation.run(request(forged)).await;
        assert!(matches!(result, Err(OdsError::Authentication(_))));

        assert!(b_store.list_peers().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_issued_at_window_follows_context_clock() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (a_store, a) = node(temp_dir.path(), "node-a");
        let a_key = a_store.node_key().unwrap();

        let issued_at = chrono::DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        let clock = Arc::new(FixedClock::new(issued_at));
        let ctx = NodeContext::open_with_clock(
            NodeSettings::under(temp_dir.path().join("node-b")),
            &SecretKey::generate(),
            clock.clone(),
        )
        .unwrap();
        let b = ctx
            .peers
            .ensure_identity(&IdentityDefaults {
                name: "node-b".to_string(),
                url: None,
                stage: Stage::Prod,
                firewalled_mode: false,
            })
            .unwrap();
        let b_key = ctx.peers.node_key().unwrap();
        let header = registration_header_at(&a, &b, &b_key, &a_key.to_base64(), issued_at);
        let operation = RegisterPeerOperation::new(ctx.peers.clone(), ctx.clock.clone());

        clock.advance(chrono::Duration::seconds(6));
        let result = operation.run(request(header.clone())).await;
        assert!(matches!(result, Err(OdsError::Authentication(_))));
        assert!(ctx.peers.list_peers().unwrap().is_empty());

        clock.set(issued_at + chrono::Duration::seconds(5));
        let peer = operation.run(request(header)).await.unwrap();
        assert_eq!(peer.issuer, a.issuer);
        assert_eq!(peer.registered_on, issued_at + chrono::Duration::seconds(5));
    }
}
