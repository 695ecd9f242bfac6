// HTTP client for the relay server's REST API
//
// POST /keys/publish          {public_key, key_type}  -> UserKey
// GET  /keys/user/{id}                                -> UserKey
// GET  /keys/server                                   -> {publicKey}
// GET  /messages/offline                              -> [OfflineMessage]
// POST /messages/{id}/read
//
// Every response is wrapped in {success, data?, error?}. Binary fields are
// base64, timestamps are milliseconds since the epoch.

use super::{BacklogMessage, Directory, DirectoryError, OfflineBacklog};
use crate::identity::{KeyKind, PeerId, PeerKeyRecord};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserKeyDto {
    user_id: u64,
    public_key: String,
    signature: String,
    #[serde(default)]
    issued_at: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerKeyDto {
    public_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfflineMessageDto {
    id: u64,
    sender_id: u64,
    content: String,
    timestamp: u64,
}

impl UserKeyDto {
    fn into_record(self) -> Result<PeerKeyRecord, DirectoryError> {
        Ok(PeerKeyRecord {
            peer: PeerId(self.user_id),
            public_key: decode_field("publicKey", &self.public_key)?,
            signature: decode_field("signature", &self.signature)?,
            issued_at: self.issued_at,
            verified: false,
        })
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, DirectoryError> {
    STANDARD
        .decode(value)
        .map_err(|e| DirectoryError::Malformed(format!("{}: {}", name, e)))
}

/// Directory and backlog backed by the relay server's HTTP API.
#[derive(Clone)]
pub struct HttpDirectory {
    base_url: String,
    token: String,
    agent: ureq::Agent,
}

impl HttpDirectory {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            agent,
        }
    }

    /// Run a request on the blocking pool. `Ok(None)` means 404.
    async fn request<T>(
        &self,
        method: &'static str,
        path: String,
        body: Option<serde_json::Value>,
    ) -> Result<Option<T>, DirectoryError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let url = format!("{}{}", self.base_url, path);
        let auth = format!("Bearer {}", self.token);
        let agent = self.agent.clone();

        debug!("{} {}", method, url);

        let result = tokio::task::spawn_blocking(move || {
            let request = agent.request(method, &url).set("Authorization", &auth);
            let response = match body {
                Some(body) => request.send_json(body),
                None => request.call(),
            };

            match response {
                Ok(response) => response
                    .into_json::<ApiResponse<T>>()
                    .map(Some)
                    .map_err(|e| DirectoryError::Malformed(e.to_string())),
                Err(ureq::Error::Status(404, _)) => Ok(None),
                Err(ureq::Error::Status(code, response)) => {
                    let message = response
                        .into_json::<ApiResponse<serde_json::Value>>()
                        .ok()
                        .and_then(|r| r.error)
                        .unwrap_or_else(|| format!("HTTP {}", code));
                    Err(DirectoryError::Rejected(message))
                }
                Err(e) => Err(DirectoryError::Request(e.to_string())),
            }
        })
        .await
        .map_err(|e| DirectoryError::Request(e.to_string()))??;

        match result {
            None => Ok(None),
            Some(envelope) if envelope.success => Ok(envelope.data),
            Some(envelope) => Err(DirectoryError::Rejected(
                envelope.error.unwrap_or_else(|| "request failed".to_string()),
            )),
        }
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn publish_public_key(
        &self,
        _owner: PeerId,
        kind: KeyKind,
        public_key: &[u8],
    ) -> Result<PeerKeyRecord, DirectoryError> {
        let body = serde_json::json!({
            "public_key": STANDARD.encode(public_key),
            "key_type": kind.as_str(),
        });
        self.request::<UserKeyDto>("POST", "/keys/publish".to_string(), Some(body))
            .await?
            .ok_or_else(|| DirectoryError::Malformed("publish returned no key".to_string()))?
            .into_record()
    }

    async fn get_peer_key(&self, peer: PeerId) -> Result<Option<PeerKeyRecord>, DirectoryError> {
        self.request::<UserKeyDto>("GET", format!("/keys/user/{}", peer), None)
            .await?
            .map(UserKeyDto::into_record)
            .transpose()
    }

    async fn get_trust_anchor_key(&self) -> Result<Vec<u8>, DirectoryError> {
        let dto = self
            .request::<ServerKeyDto>("GET", "/keys/server".to_string(), None)
            .await?
            .ok_or_else(|| DirectoryError::Malformed("server key missing".to_string()))?;
        decode_field("publicKey", &dto.public_key)
    }
}

#[async_trait]
impl OfflineBacklog for HttpDirectory {
    async fn fetch_offline_messages(&self) -> Result<Vec<BacklogMessage>, DirectoryError> {
        let messages = self
            .request::<Vec<OfflineMessageDto>>("GET", "/messages/offline".to_string(), None)
            .await?
            .unwrap_or_default();

        Ok(messages
            .into_iter()
            .map(|m| BacklogMessage {
                id: m.id,
                sender: PeerId(m.sender_id),
                content: m.content,
                timestamp: m.timestamp,
            })
            .collect())
    }

    async fn mark_read(&self, message_id: u64) -> Result<(), DirectoryError> {
        self.request::<serde_json::Value>("POST", format!("/messages/{}/read", message_id), None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_key_dto_decodes() {
        let json = serde_json::json!({
            "success": true,
            "data": {
                "userId": 42,
                "publicKey": STANDARD.encode([1u8; 32]),
                "signature": STANDARD.encode([2u8; 64]),
                "createdAt": "2024-01-01T00:00:00Z",
                "issuedAt": 1700000000000u64
            }
        });
        let response: ApiResponse<UserKeyDto> = serde_json::from_value(json).unwrap();
        assert!(response.success);
        let record = response.data.unwrap().into_record().unwrap();
        assert_eq!(record.peer, PeerId(42));
        assert_eq!(record.public_key, vec![1u8; 32]);
        assert_eq!(record.signature.len(), 64);
        assert!(!record.verified);
    }

    #[test]
    fn test_bad_base64_is_malformed() {
        let dto = UserKeyDto {
            user_id: 1,
            public_key: "***".to_string(),
            signature: String::new(),
            issued_at: 0,
        };
        assert!(matches!(dto.into_record(), Err(DirectoryError::Malformed(_))));
    }

    #[test]
    fn test_error_envelope_decodes() {
        let json = r#"{"success": false, "error": "Key not found"}"#;
        let response: ApiResponse<UserKeyDto> = serde_json::from_str(json).unwrap();
        assert!(!response.success);
        assert!(response.data.is_none());
        assert_eq!(response.error.as_deref(), Some("Key not found"));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let directory = HttpDirectory::new("https://relay.example/api/", "token");
        assert_eq!(directory.base_url, "https://relay.example/api");
    }
}
