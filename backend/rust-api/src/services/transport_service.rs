use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};

use crate::config::Config;
use crate::errors::TransportError;
use crate::models::transport::{RoomClaims, RoomGrant, RoomTokenResponse};

pub const ROOM_TOKEN_TTL_SECONDS: i64 = 6 * 60 * 60;

struct Credentials {
    api_key: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

/// Signs room-join tokens for the audio and editor rooms.
pub struct TransportTokens {
    credentials: Option<Credentials>,
    ttl_seconds: i64,
}

impl TransportTokens {
    pub fn new(config: &Config) -> Self {
        let credentials = match (&config.transport_api_key, &config.transport_api_secret) {
            (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => {
                Some(Credentials {
                    api_key: key.clone(),
                    encoding_key: EncodingKey::from_secret(secret.as_bytes()),
                    decoding_key: DecodingKey::from_secret(secret.as_bytes()),
                })
            }
            _ => None,
        };
        Self {
            credentials,
            ttl_seconds: ROOM_TOKEN_TTL_SECONDS,
        }
    }

    fn credentials(&self) -> Result<&Credentials, TransportError> {
        self.credentials.as_ref().ok_or(TransportError::NotConfigured)
    }

    pub fn issue(
        &self,
        room: &str,
        identity: &str,
        name: &str,
    ) -> Result<RoomTokenResponse, TransportError> {
        let credentials = self.credentials()?;
        let now = Utc::now().timestamp();
        let claims = RoomClaims {
            iss: credentials.api_key.clone(),
            sub: identity.to_string(),
            name: name.to_string(),
            nbf: now,
            exp: now + self.ttl_seconds,
            video: RoomGrant {
                room: room.to_string(),
                room_join: true,
                can_publish: true,
                can_subscribe: true,
                can_publish_data: true,
            },
        };

        let token = encode(&Header::default(), &claims, &credentials.encoding_key)
            .map_err(|e| TransportError::Signing(e.to_string()))?;
        tracing::debug!("Issued room token for {} in {}", identity, room);

        Ok(RoomTokenResponse {
            token,
            room: room.to_string(),
            expires_in_seconds: self.ttl_seconds,
        })
    }

    pub fn verify(&self, token: &str) -> Result<RoomClaims, TransportError> {
        let credentials = self.credentials()?;
        decode::<RoomClaims>(token, &credentials.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| TransportError::Signing(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> TransportTokens {
        TransportTokens::new(&Config {
            transport_api_key: Some("key-1".into()),
            transport_api_secret: Some("a-long-enough-secret-for-hs256".into()),
            ..Config::default()
        })
    }

    #[test]
    fn token_carries_room_grant() {
        let tokens = configured();
        let issued = tokens
            .issue("session-42", "student-1", "Ada")
            .unwrap();
        let claims = tokens.verify(&issued.token).unwrap();

        assert_eq!(claims.iss, "key-1");
        assert_eq!(claims.sub, "student-1");
        assert_eq!(claims.video.room, "session-42");
        assert!(claims.video.room_join && claims.video.can_publish_data);
        assert_eq!(claims.exp - claims.nbf, ROOM_TOKEN_TTL_SECONDS);
    }

    #[test]
    fn missing_secret_is_not_configured() {
        let tokens = TransportTokens::new(&Config::default());
        assert!(matches!(
            tokens.issue("room", "id", "name"),
            Err(TransportError::NotConfigured)
        ));
    }
}
