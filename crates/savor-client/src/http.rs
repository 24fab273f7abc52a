use std::sync::RwLock;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Method, RequestBuilder, StatusCode, header};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use savor_types::api::{
    AddCommentRequest, CreatePostRequest, Credentials, Envelope, FeedPage, OpenConversationRequest,
    RegisterDeviceRequest, SendMessageRequest, Session, ShareResult, ToggleResult,
    UnregisterDeviceRequest, UploadResponse,
};
use savor_types::models::{CommentNode, Conversation, DevicePlatform, Message, Post};

use crate::config::ClientConfig;
use crate::error::BackendError;
use crate::gateway::Backend;

/// [`Backend`] over the REST API.
pub struct HttpBackend {
    client: Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl HttpBackend {
    pub fn new(config: &ClientConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            token: RwLock::new(config.access_token.clone()),
        })
    }

    pub fn set_token(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = token;
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Signs in and keeps the returned token for subsequent calls.
    pub async fn login(&self, credentials: &Credentials) -> Result<Session, BackendError> {
        let session: Session = self
            .send(self.request(Method::POST, "/auth/login").json(credentials))
            .await?;
        self.set_token(Some(session.token.clone()));
        Ok(session)
    }

    pub async fn register(&self, credentials: &Credentials) -> Result<Session, BackendError> {
        let session: Session = self
            .send(self.request(Method::POST, "/auth/register").json(credentials))
            .await?;
        self.set_token(Some(session.token.clone()));
        Ok(session)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self.client.request(method, format!("{}{}", self.base_url, path));
        match self.token() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn post_json(&self, path: &str, body: &impl Serialize) -> RequestBuilder {
        self.request(Method::POST, path).json(body)
    }

    /// Sends the request and unwraps the envelope, mapping status codes to
    /// [`BackendError`] variants.
    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, BackendError> {
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;

        if status.is_success() {
            let envelope: Envelope<T> = serde_json::from_slice(&body)
                .map_err(|e| BackendError::Decode(e.to_string()))?;
            return envelope
                .data
                .ok_or_else(|| BackendError::Decode("response carried no data".to_string()));
        }

        let message = error_message(&body);
        debug!("Backend answered {}: {}", status, message);
        Err(match status {
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => BackendError::Validation(message),
            StatusCode::PAYLOAD_TOO_LARGE => BackendError::Validation("File is too large".to_string()),
            StatusCode::UNAUTHORIZED => BackendError::Unauthorized,
            StatusCode::FORBIDDEN => BackendError::Forbidden,
            StatusCode::NOT_FOUND => BackendError::NotFound(message),
            StatusCode::CONFLICT => BackendError::Duplicate,
            _ => BackendError::Server {
                status: status.as_u16(),
                message,
            },
        })
    }
}

/// The envelope's error text, or the raw body when it is not an envelope
/// (extractor rejections answer in plain text).
fn error_message(body: &[u8]) -> String {
    serde_json::from_slice::<Envelope<serde_json::Value>>(body)
        .ok()
        .and_then(|e| e.error)
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string())
}

fn cursor(before: DateTime<Utc>) -> String {
    before.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl Backend for HttpBackend {
    async fn fetch_feed(&self, before: Option<DateTime<Utc>>, limit: u32) -> Result<FeedPage, BackendError> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(before) = before {
            query.push(("before", cursor(before)));
        }
        self.send(self.request(Method::GET, "/feed").query(&query)).await
    }

    async fn fetch_post(&self, post_id: Uuid) -> Result<Post, BackendError> {
        self.send(self.request(Method::GET, &format!("/posts/{post_id}"))).await
    }

    async fn create_post(&self, caption: String, media_path: Option<String>) -> Result<Post, BackendError> {
        self.send(self.post_json("/posts", &CreatePostRequest { caption, media_path }))
            .await
    }

    async fn like_post(&self, post_id: Uuid) -> Result<ToggleResult, BackendError> {
        self.send(self.request(Method::POST, &format!("/posts/{post_id}/like")))
            .await
    }

    async fn unlike_post(&self, post_id: Uuid) -> Result<ToggleResult, BackendError> {
        self.send(self.request(Method::DELETE, &format!("/posts/{post_id}/like")))
            .await
    }

    async fn toggle_like(&self, post_id: Uuid) -> Result<ToggleResult, BackendError> {
        self.send(self.request(Method::POST, &format!("/posts/{post_id}/like/toggle")))
            .await
    }

    async fn share_post(&self, post_id: Uuid) -> Result<ShareResult, BackendError> {
        self.send(self.request(Method::POST, &format!("/posts/{post_id}/share")))
            .await
    }

    async fn fetch_comments(&self, post_id: Uuid) -> Result<Vec<CommentNode>, BackendError> {
        self.send(self.request(Method::GET, &format!("/posts/{post_id}/comments")))
            .await
    }

    async fn add_comment(
        &self,
        post_id: Uuid,
        content: String,
        parent_id: Option<Uuid>,
    ) -> Result<CommentNode, BackendError> {
        self.send(self.post_json(
            &format!("/posts/{post_id}/comments"),
            &AddCommentRequest { content, parent_id },
        ))
        .await
    }

    async fn toggle_comment_like(&self, comment_id: Uuid) -> Result<ToggleResult, BackendError> {
        self.send(self.request(Method::POST, &format!("/comments/{comment_id}/like/toggle")))
            .await
    }

    async fn delete_comment(&self, comment_id: Uuid) -> Result<Uuid, BackendError> {
        self.send(self.request(Method::DELETE, &format!("/comments/{comment_id}")))
            .await
    }

    async fn follow_user(&self, user_id: Uuid) -> Result<ToggleResult, BackendError> {
        self.send(self.request(Method::POST, &format!("/users/{user_id}/follow")))
            .await
    }

    async fn unfollow_user(&self, user_id: Uuid) -> Result<ToggleResult, BackendError> {
        self.send(self.request(Method::DELETE, &format!("/users/{user_id}/follow")))
            .await
    }

    async fn follow_status(&self, user_id: Uuid) -> Result<ToggleResult, BackendError> {
        self.send(self.request(Method::GET, &format!("/users/{user_id}/follow")))
            .await
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, BackendError> {
        self.send(self.request(Method::GET, "/conversations")).await
    }

    async fn open_conversation(&self, with_user_id: Uuid) -> Result<Conversation, BackendError> {
        self.send(self.post_json("/conversations", &OpenConversationRequest { with_user_id }))
            .await
    }

    async fn list_messages(&self, conversation_id: Uuid, limit: u32) -> Result<Vec<Message>, BackendError> {
        self.send(
            self.request(Method::GET, &format!("/conversations/{conversation_id}/messages"))
                .query(&[("limit", limit)]),
        )
        .await
    }

    async fn send_message(&self, conversation_id: Uuid, body: String) -> Result<Message, BackendError> {
        self.send(self.post_json(
            &format!("/conversations/{conversation_id}/messages"),
            &SendMessageRequest { body },
        ))
        .await
    }

    async fn mark_read(&self, conversation_id: Uuid) -> Result<usize, BackendError> {
        self.send(
            self.request(Method::POST, &format!("/conversations/{conversation_id}/read"))
                .json(&json!({})),
        )
        .await
    }

    async fn register_device(&self, token: String, platform: DevicePlatform) -> Result<bool, BackendError> {
        self.send(self.post_json("/devices", &RegisterDeviceRequest { token, platform }))
            .await
    }

    async fn unregister_device(&self, token: String) -> Result<bool, BackendError> {
        self.send(
            self.request(Method::DELETE, "/devices")
                .json(&UnregisterDeviceRequest { token }),
        )
        .await
    }

    async fn upload(
        &self,
        bucket: String,
        file_name: String,
        content_type: String,
        bytes: Bytes,
    ) -> Result<UploadResponse, BackendError> {
        self.send(
            self.request(Method::PUT, &format!("/storage/{bucket}/{file_name}"))
                .header(header::CONTENT_TYPE, content_type)
                .body(bytes),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_prefers_envelope_text() {
        let body = br#"{"success":false,"error":"Comment cannot be empty"}"#;
        assert_eq!(error_message(body), "Comment cannot be empty");
        assert_eq!(error_message(b"Failed to parse the request body "), "Failed to parse the request body");
    }

    #[test]
    fn test_token_from_config_is_used() {
        let config = ClientConfig::new("http://localhost:3000/", "ws://localhost:3000/realtime")
            .with_token("abc");
        let backend = HttpBackend::new(&config).unwrap();
        assert_eq!(backend.token().as_deref(), Some("abc"));
        assert_eq!(backend.base_url, "http://localhost:3000");
    }
}
