/// REST transport for the messaging endpoints
///
/// Endpoints (relative to `Config::base_url`):
///   GET   /user/me
///   GET   /user/{id}
///   GET   /messages/conversation/{counterpart}          ?since=<ms>
///   GET   /messages/conversations                       ?page=N&size=M
///   POST  /messages/send                                body: SendMessageRequest
///   PATCH /messages/conversation/{counterpart}/read
///   PATCH /messages/{id}/read
///   GET   /messages/unread-count
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::messenger_types::{
    ApiEnvelope, ConversationPage, MessageId, RawMessage, SendMessageRequest, UserId, UserProfile,
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

/// Envelope message the backend uses when the session is missing or expired
pub const LOGIN_REQUIRED_MESSAGE: &str = "请先登录";

/// Everything the synchronizer needs from the server
#[async_trait]
pub trait MessageApi: Send + Sync {
    /// Profile of the signed-in user
    async fn current_user(&self) -> Result<UserProfile>;

    /// Profile of another user, for display info
    async fn user_profile(&self, user_id: UserId) -> Result<UserProfile>;

    /// Full thread with `counterpart`
    async fn thread(&self, counterpart: UserId) -> Result<Vec<RawMessage>>;

    /// Thread messages newer than `since_ms`
    async fn thread_since(&self, counterpart: UserId, since_ms: i64) -> Result<Vec<RawMessage>>;

    /// One page of raw (ungrouped) recent messages
    async fn conversations(&self, page: u32, size: u32) -> Result<ConversationPage>;

    async fn send(&self, request: &SendMessageRequest) -> Result<RawMessage>;

    async fn mark_conversation_read(&self, counterpart: UserId) -> Result<()>;

    async fn mark_message_read(&self, message_id: MessageId) -> Result<()>;

    /// Server-side unread total
    async fn unread_count(&self) -> Result<u32>;
}

/// `MessageApi` over HTTP with bearer auth
#[derive(Debug, Clone)]
pub struct HttpMessageApi {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpMessageApi {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request and unwrap the `{code, message, data}` envelope
    async fn call<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Option<T>> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = request.send().await.map_err(map_transport)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(map_transport)?;
        decode_envelope(status, &body)
    }
}

fn map_transport(e: reqwest::Error) -> SyncError {
    if e.is_timeout() {
        SyncError::Timeout
    } else {
        SyncError::Http(e)
    }
}

/// Turn a raw HTTP response into the envelope's `data`
pub fn decode_envelope<T: DeserializeOwned>(status: u16, body: &str) -> Result<Option<T>> {
    if status == 401 || status == 403 {
        return Err(SyncError::Unauthorized(format!("HTTP {}", status)));
    }

    if !(200..300).contains(&status) {
        // The backend still wraps most failures; surface its message if present
        if let Ok(envelope) = serde_json::from_str::<ApiEnvelope<serde_json::Value>>(body) {
            if is_login_required(envelope.code, envelope.message.as_deref()) {
                return Err(SyncError::Unauthorized(envelope.message.unwrap_or_default()));
            }
        }
        return Err(SyncError::Status {
            status,
            body: body.chars().take(256).collect(),
        });
    }

    let envelope: ApiEnvelope<T> = serde_json::from_str(body)?;
    if envelope.code != 0 {
        let message = envelope.message.unwrap_or_default();
        if is_login_required(envelope.code, Some(&message)) {
            return Err(SyncError::Unauthorized(message));
        }
        return Err(SyncError::Api {
            code: envelope.code,
            message,
        });
    }
    Ok(envelope.data)
}

fn is_login_required(code: i64, message: Option<&str>) -> bool {
    code == 401 || (code == 400 && message == Some(LOGIN_REQUIRED_MESSAGE))
}

fn missing_data(what: &str) -> SyncError {
    SyncError::Api {
        code: 0,
        message: format!("response carried no {}", what),
    }
}

#[async_trait]
impl MessageApi for HttpMessageApi {
    #[instrument(skip(self))]
    async fn current_user(&self) -> Result<UserProfile> {
        self.call(self.client.get(self.url("/user/me")))
            .await?
            .ok_or_else(|| missing_data("user"))
    }

    #[instrument(skip(self))]
    async fn user_profile(&self, user_id: UserId) -> Result<UserProfile> {
        self.call(self.client.get(self.url(&format!("/user/{}", user_id))))
            .await?
            .ok_or_else(|| missing_data("user"))
    }

    async fn thread(&self, counterpart: UserId) -> Result<Vec<RawMessage>> {
        let url = self.url(&format!("/messages/conversation/{}", counterpart));
        Ok(self.call(self.client.get(url)).await?.unwrap_or_default())
    }

    async fn thread_since(&self, counterpart: UserId, since_ms: i64) -> Result<Vec<RawMessage>> {
        let url = self.url(&format!("/messages/conversation/{}", counterpart));
        let request = self.client.get(url).query(&[("since", since_ms)]);
        Ok(self.call(request).await?.unwrap_or_default())
    }

    async fn conversations(&self, page: u32, size: u32) -> Result<ConversationPage> {
        debug!("Fetching conversation page {} (size {})", page, size);
        let request = self
            .client
            .get(self.url("/messages/conversations"))
            .query(&[("page", page), ("size", size)]);
        Ok(self.call(request).await?.unwrap_or_default())
    }

    #[instrument(skip(self, request), fields(to = request.to_user_id))]
    async fn send(&self, request: &SendMessageRequest) -> Result<RawMessage> {
        let builder = self.client.post(self.url("/messages/send")).json(request);
        self.call(builder).await?.ok_or_else(|| missing_data("message"))
    }

    async fn mark_conversation_read(&self, counterpart: UserId) -> Result<()> {
        let url = self.url(&format!("/messages/conversation/{}/read", counterpart));
        self.call::<serde_json::Value>(self.client.patch(url)).await?;
        Ok(())
    }

    async fn mark_message_read(&self, message_id: MessageId) -> Result<()> {
        let url = self.url(&format!("/messages/{}/read", message_id));
        self.call::<serde_json::Value>(self.client.patch(url)).await?;
        Ok(())
    }

    async fn unread_count(&self) -> Result<u32> {
        let count: Option<i64> = self.call(self.client.get(self.url("/messages/unread-count"))).await?;
        Ok(count.unwrap_or(0).max(0) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_success() {
        let body = r#"{"code":0,"message":"ok","data":{"content":[{"id":1,"fromUser":5,"toUser":2}],"hasNext":true}}"#;
        let page: ConversationPage = decode_envelope(200, body).unwrap().unwrap();
        assert!(page.has_next);
        assert_eq!(page.content.len(), 1);
        assert_eq!(page.content[0].id, Some(1));
    }

    #[test]
    fn test_decode_null_data() {
        let data: Option<i64> = decode_envelope(200, r#"{"code":0,"data":null}"#).unwrap();
        assert_eq!(data, None);
    }

    #[test]
    fn test_decode_missing_data_without_default() {
        // Payload types need not implement Default
        #[derive(Debug, serde::Deserialize)]
        struct Receipt {
            id: i64,
        }

        let data: Option<Receipt> = decode_envelope(200, r#"{"code":0}"#).unwrap();
        assert!(data.is_none());
        let data: Option<Receipt> = decode_envelope(200, r#"{"code":0,"data":{"id":3}}"#).unwrap();
        assert_eq!(data.unwrap().id, 3);
    }

    #[test]
    fn test_decode_api_error() {
        let err = decode_envelope::<i64>(200, r#"{"code":500,"message":"boom"}"#).unwrap_err();
        assert!(matches!(err, SyncError::Api { code: 500, .. }));
    }

    #[test]
    fn test_decode_login_required() {
        let body = format!(r#"{{"code":400,"message":"{}"}}"#, LOGIN_REQUIRED_MESSAGE);
        assert!(decode_envelope::<i64>(200, &body).unwrap_err().is_auth());
        assert!(decode_envelope::<i64>(400, &body).unwrap_err().is_auth());
        assert!(decode_envelope::<i64>(401, "").unwrap_err().is_auth());
    }

    #[test]
    fn test_decode_http_status() {
        let err = decode_envelope::<i64>(502, "<html>bad gateway</html>").unwrap_err();
        assert!(matches!(err, SyncError::Status { status: 502, .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn test_decode_garbage_body() {
        let err = decode_envelope::<i64>(200, "not json").unwrap_err();
        assert!(matches!(err, SyncError::Serialization(_)));
    }

    #[test]
    fn test_url_join() {
        let config = Config {
            base_url: "http://shop.test/api/".into(),
            ..Config::default()
        };
        let api = HttpMessageApi::new(&config).unwrap();
        assert_eq!(api.url("/user/me"), "http://shop.test/api/user/me");
    }
}
