//! Bearer tokens exchanged between peers.
//!
//! Outbound tokens are HS256-signed with the key shared with the target peer
//! and carry `iss` (our issuer), `aud` (their issuer) and `iat`. Inbound
//! tokens are checked against this node's own key and issuer.

use crate::error::{OdsError, Result};
use crate::identity::{PeerNode, SecretKey};
use crate::storage::PeerStore;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Maximum distance between a token's `iat` and the verifier's clock.
pub const TOKEN_SKEW_SECONDS: i64 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    /// Encrypted registration payload, only present on `POST /register`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss_data: Option<String>,
}

/// Wire shape used for decoding, so a missing claim is reported as such
/// instead of as a generic decode failure.
#[derive(Debug, Deserialize)]
struct RawClaims {
    iss: Option<String>,
    aud: Option<String>,
    iat: Option<i64>,
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    iss_data: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerLookup {
    /// The issuer must already be a registered peer.
    Required,
    /// Used by the registration handshake, where the issuer is not yet known.
    Optional,
}

#[derive(Debug, Clone)]
pub struct AuthenticatedRequest {
    pub claims: Claims,
    pub peer: Option<PeerNode>,
}

pub fn mint_token(
    local_issuer: &str,
    audience: &str,
    key: &SecretKey,
    now: DateTime<Utc>,
    iss_data: Option<String>,
) -> Result<String> {
    let claims = Claims {
        iss: local_issuer.to_string(),
        aud: audience.to_string(),
        iat: now.timestamp(),
        iss_data,
    };

    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(key.as_bytes()),
    )
    .map_err(|error| OdsError::Internal(format!("failed to sign token: {}", error)))
}

pub fn bearer_header(token: &str) -> String {
    format!("Bearer {}", token)
}

/// Validate an `Authorization` header value against this node's issuer and key.
pub fn validate_bearer(
    header: Option<&str>,
    own_issuer: &str,
    own_key: &SecretKey,
    now: DateTime<Utc>,
) -> Result<Claims> {
    let header =
        header.ok_or_else(|| OdsError::Authentication("missing Authorization header".into()))?;

    let mut parts = header.split_whitespace();
    let (Some(scheme), Some(token), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(OdsError::Authentication(
            "malformed Authorization header".into(),
        ));
    };
    if scheme != "Bearer" {
        return Err(OdsError::Authentication(format!(
            "unsupported authorization scheme: {}",
            scheme
        )));
    }

    // Time-based claims and the audience are checked below against `now`.
    let mut validation = Validation::new(Algorithm::HS256);
    validation.required_spec_claims = HashSet::new();
    validation.validate_aud = false;
    validation.validate_exp = false;
    validation.leeway = 0;

    let raw = decode::<RawClaims>(
        token,
        &DecodingKey::from_secret(own_key.as_bytes()),
        &validation,
    )
    .map_err(|error| OdsError::Authentication(format!("invalid token: {}", error)))?
    .claims;

    let (Some(iss), Some(aud), Some(iat)) = (raw.iss, raw.aud, raw.iat) else {
        return Err(OdsError::Authentication(
            "token is missing one of the iss, aud, iat claims".into(),
        ));
    };

    let skew = iat - now.timestamp();
    if skew.abs() > TOKEN_SKEW_SECONDS {
        return Err(OdsError::Authentication(format!(
            "token issued {}s away from local time",
            skew
        )));
    }

    if let Some(exp) = raw.exp {
        if exp <= now.timestamp() {
            return Err(OdsError::Authentication(format!(
                "token expired {}s ago",
                now.timestamp() - exp
            )));
        }
    }

    if aud != own_issuer {
        return Err(OdsError::Authentication(format!(
            "token audience {} does not match this node",
            aud
        )));
    }

    Ok(Claims {
        iss,
        aud,
        iat,
        iss_data: raw.iss_data,
    })
}

/// Validate an inbound request and resolve the calling peer.
pub fn authenticate(
    peers: &PeerStore,
    header: Option<&str>,
    now: DateTime<Utc>,
    lookup: PeerLookup,
) -> Result<AuthenticatedRequest> {
    let identity = peers.identity()?;
    let key = peers.node_key()?;
    let claims = validate_bearer(header, &identity.issuer, &key, now)?;

    let peer = peers.get_peer(&claims.iss)?;
    if peer.is_none() && lookup == PeerLookup::Required {
        tracing::debug!(issuer = %claims.iss, "Rejected token from unregistered issuer");
        return Err(OdsError::Authentication(format!(
            "issuer {} is not a registered peer",
            claims.iss
        )));
    }

    Ok(AuthenticatedRequest { claims, peer })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdentityDefaults, Stage};
    use chrono::Duration;

    const NODE: &str = "01node";

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn header_for(token: &str) -> String {
        bearer_header(token)
    }

    #[test]
    fn test_valid_token_round_trip() {
        let key = SecretKey::generate();
        let token = mint_token("01peer", NODE, &key, now(), None).unwrap();

        let claims = validate_bearer(Some(&header_for(&token)), NODE, &key, now()).unwrap();
        assert_eq!(claims.iss, "01peer");
        assert_eq!(claims.aud, NODE);
        assert!(claims.iss_data.is_none());
    }

    #[test]
    fn test_issued_at_window() {
        let key = SecretKey::generate();
        for offset in [-4, 0, 4, 5, -5] {
            let token =
                mint_token("01peer", NODE, &key, now() + Duration::seconds(offset), None).unwrap();
            assert!(
                validate_bearer(Some(&header_for(&token)), NODE, &key, now()).is_ok(),
                "offset {} should be accepted",
                offset
            );
        }

        for offset in [-6, 6, -3600, 3600] {
            let token =
                mint_token("01peer", NODE, &key, now() + Duration::seconds(offset), None).unwrap();
            assert!(
                matches!(
                    validate_bearer(Some(&header_for(&token)), NODE, &key, now()),
                    Err(OdsError::Authentication(_))
                ),
                "offset {} should be rejected",
                offset
            );
        }
    }

    #[test]
    fn test_expired_token_rejected() {
        #[derive(Serialize)]
        struct WithExpiry {
            iss: String,
            aud: String,
            iat: i64,
            exp: i64,
        }

        let key = SecretKey::generate();
        let sign = |exp: DateTime<Utc>| {
            let token = encode(
                &Header::new(Algorithm::HS256),
                &WithExpiry {
                    iss: "01peer".to_string(),
                    aud: NODE.to_string(),
                    iat: now().timestamp(),
                    exp: exp.timestamp(),
                },
                &EncodingKey::from_secret(key.as_bytes()),
            )
            .unwrap();
            header_for(&token)
        };

        for expired in [now() - Duration::seconds(30), now()] {
            assert!(matches!(
                validate_bearer(Some(&sign(expired)), NODE, &key, now()),
                Err(OdsError::Authentication(_))
            ));
        }

        let claims =
            validate_bearer(Some(&sign(now() + Duration::seconds(30))), NODE, &key, now()).unwrap();
        assert_eq!(claims.iss, "01peer");
    }

    #[test]
    fn test_audience_must_match() {
        let key = SecretKey::generate();
        let token = mint_token("01peer", "01someone-else", &key, now(), None).unwrap();
        assert!(validate_bearer(Some(&header_for(&token)), NODE, &key, now()).is_err());
    }

    #[test]
    fn test_scheme_and_header_shape() {
        let key = SecretKey::generate();
        let token = mint_token("01peer", NODE, &key, now(), None).unwrap();

        assert!(validate_bearer(None, NODE, &key, now()).is_err());
        assert!(validate_bearer(Some(&token), NODE, &key, now()).is_err());
        assert!(validate_bearer(Some(&format!("Basic {}", token)), NODE, &key, now()).is_err());
        assert!(
            validate_bearer(Some(&format!("Bearer {} extra", token)), NODE, &key, now()).is_err()
        );
    }

    #[test]
    fn test_signature_must_match_own_key() {
        let token = mint_token("01peer", NODE, &SecretKey::generate(), now(), None).unwrap();
        assert!(
            validate_bearer(
                Some(&header_for(&token)),
                NODE,
                &SecretKey::generate(),
                now()
            )
            .is_err()
        );
        assert!(validate_bearer(Some("Bearer not.a.token"), NODE, &SecretKey::generate(), now()).is_err());
    }

    #[test]
    fn test_missing_claims_rejected() {
        #[derive(Serialize)]
        struct Partial {
            iss: String,
            iat: i64,
        }

        let key = SecretKey::generate();
        let token = encode(
            &Header::new(Algorithm::HS256),
            &Partial {
                iss: "01peer".to_string(),
                iat: now().timestamp(),
            },
            &EncodingKey::from_secret(key.as_bytes()),
        )
        .unwrap();

        assert!(matches!(
            validate_bearer(Some(&header_for(&token)), NODE, &key, now()),
            Err(OdsError::Authentication(_))
        ));
    }

    #[test]
    fn test_authenticate_peer_lookup() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store =
            PeerStore::new(temp_dir.path().join("ods.db"), &SecretKey::generate()).unwrap();
        let identity = store
            .ensure_identity(&IdentityDefaults {
                name: "node-a".to_string(),
                url: None,
                stage: Stage::Prod,
                firewalled_mode: false,
            })
            .unwrap();
        let own_key = store.node_key().unwrap();

        let token = mint_token("01stranger", &identity.issuer, &own_key, Utc::now(), None).unwrap();
        let header = header_for(&token);

        assert!(matches!(
            authenticate(&store, Some(&header), Utc::now(), PeerLookup::Required),
            Err(OdsError::Authentication(_))
        ));

        let request =
            authenticate(&store, Some(&header), Utc::now(), PeerLookup::Optional).unwrap();
        assert!(request.peer.is_none());
        assert_eq!(request.claims.iss, "01stranger");

        store
            .insert_peer(
                &PeerNode {
                    issuer: "01stranger".to_string(),
                    url: "http://stranger.local".to_string(),
                    name: String::new(),
                    stage: Stage::Prod,
                    firewalled_mode: false,
                    registered_on: Utc::now(),
                },
                &SecretKey::generate(),
            )
            .unwrap();
        let request =
            authenticate(&store, Some(&header), Utc::now(), PeerLookup::Required).unwrap();
        assert_eq!(request.peer.unwrap().issuer, "01stranger");
    }
}
