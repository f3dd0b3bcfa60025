use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;
use tracing::info;

const EXPO_PUSH_ENDPOINT: &str = "https://exp.host/--/api/v2/push/send";
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum PushError {
    InvalidToken,
    Http,
    Rejected,
}

impl Display for PushError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidToken => write!(f, "invalid push token"),
            Self::Http => write!(f, "push transport failure"),
            Self::Rejected => write!(f, "push rejected by gateway"),
        }
    }
}

impl Error for PushError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushNote {
    pub token: String,
    pub title: String,
    pub body: String,
    pub data: Value,
}

/// Delivers out-of-band alerts to a device push token. Callers treat
/// delivery as best-effort and swallow errors.
#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn deliver(&self, note: &PushNote) -> Result<(), PushError>;
}

pub struct NullPushGateway;

#[async_trait]
impl PushGateway for NullPushGateway {
    async fn deliver(&self, _note: &PushNote) -> Result<(), PushError> {
        Ok(())
    }
}

pub struct DebugPushGateway;

#[async_trait]
impl PushGateway for DebugPushGateway {
    async fn deliver(&self, note: &PushNote) -> Result<(), PushError> {
        info!(target: "peal::push", token = %note.token, title = %note.title, "push debug delivery");
        Ok(())
    }
}

#[derive(Serialize)]
struct ExpoMessage<'a> {
    to: &'a str,
    sound: &'static str,
    title: &'a str,
    body: &'a str,
    data: &'a Value,
}

pub struct ExpoPushGateway {
    client: reqwest::Client,
    endpoint: String,
}

impl ExpoPushGateway {
    /// Creates a gateway posting to the Expo push service, or to an
    /// operator-supplied compatible endpoint.
    pub fn new(endpoint: Option<String>) -> Result<Self, PushError> {
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .map_err(|_| PushError::Http)?;
        Ok(Self {
            client,
            endpoint: endpoint.unwrap_or_else(|| EXPO_PUSH_ENDPOINT.to_string()),
        })
    }
}

#[async_trait]
impl PushGateway for ExpoPushGateway {
    async fn deliver(&self, note: &PushNote) -> Result<(), PushError> {
        if !is_expo_push_token(&note.token) {
            return Err(PushError::InvalidToken);
        }
        let messages = [ExpoMessage {
            to: &note.token,
            sound: "default",
            title: &note.title,
            body: &note.body,
            data: &note.data,
        }];
        let response = self
            .client
            .post(&self.endpoint)
            .json(&messages)
            .send()
            .await
            .map_err(|_| PushError::Http)?;
        if !response.status().is_success() {
            return Err(PushError::Rejected);
        }
        Ok(())
    }
}

/// Matches the token shapes the Expo SDK hands to clients.
pub fn is_expo_push_token(token: &str) -> bool {
    (token.starts_with("ExponentPushToken[") || token.starts_with("ExpoPushToken["))
        && token.ends_with(']')
        && token.len() > "ExpoPushToken[]".len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_expo_token_shapes() {
        assert!(is_expo_push_token("ExponentPushToken[abc123]"));
        assert!(is_expo_push_token("ExpoPushToken[abc123]"));
    }

    #[test]
    fn rejects_foreign_tokens() {
        assert!(!is_expo_push_token(""));
        assert!(!is_expo_push_token("abc123"));
        assert!(!is_expo_push_token("ExpoPushToken[]"));
        assert!(!is_expo_push_token("ExponentPushToken[abc"));
        assert!(!is_expo_push_token("apns:deadbeef"));
    }

    #[test]
    fn expo_message_shape() {
        let data = json!({"call_id": "call-1", "type": "audio"});
        let message = ExpoMessage {
            to: "ExponentPushToken[abc]",
            sound: "default",
            title: "Incoming call",
            body: "alice is calling you",
            data: &data,
        };
        let encoded = serde_json::to_value([message]).expect("serialize");
        assert_eq!(encoded[0]["to"], json!("ExponentPushToken[abc]"));
        assert_eq!(encoded[0]["sound"], json!("default"));
        assert_eq!(encoded[0]["data"]["call_id"], json!("call-1"));
    }

    #[tokio::test]
    async fn null_gateway_swallows_everything() {
        let gateway = NullPushGateway;
        let note = PushNote {
            token: "anything".to_string(),
            title: "t".to_string(),
            body: "b".to_string(),
            data: json!({}),
        };
        assert!(gateway.deliver(&note).await.is_ok());
    }

    #[tokio::test]
    async fn expo_gateway_rejects_bad_token_before_io() {
        let gateway = ExpoPushGateway::new(Some("http://127.0.0.1:1/unused".to_string()))
            .expect("gateway");
        let note = PushNote {
            token: "not-a-token".to_string(),
            title: "t".to_string(),
            body: "b".to_string(),
            data: json!({}),
        };
        assert!(matches!(
            gateway.deliver(&note).await,
            Err(PushError::InvalidToken)
        ));
    }
}
