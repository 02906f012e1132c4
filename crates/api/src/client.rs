use std::future::Future;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use tracing::debug;

use parley_core::config::ServerConfig;
use parley_core::{Message, Session, UnreadSnapshot, WireMessage};

use crate::error::ApiError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The REST side of the chat server, as the sync engine sees it.
pub trait ChatApi: Send + Sync + 'static {
    /// Full message history between the session user and `peer_id`.
    fn fetch_history(
        &self,
        session: &Session,
        peer_id: &str,
    ) -> impl Future<Output = Result<Vec<Message>, ApiError>> + Send;

    /// Unread counts per sender for the session user.
    fn fetch_unread_counts(
        &self,
        session: &Session,
    ) -> impl Future<Output = Result<UnreadSnapshot, ApiError>> + Send;
}

#[derive(Deserialize)]
struct UnreadCountEntry {
    #[serde(rename = "_id")]
    peer_id: String,
    count: u32,
}

#[derive(Deserialize)]
struct LoginResponse {
    status: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    user: Option<LoginUser>,
}

#[derive(Deserialize)]
struct LoginUser {
    #[serde(rename = "_id")]
    id: String,
    name: String,
}

#[derive(Clone)]
pub struct HttpChatApi {
    client: Client,
    base_url: String,
}

impl HttpChatApi {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let base_url = base_url.trim().trim_end_matches('/');
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ApiError::InvalidUrl(base_url.to_string()));
        }

        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.to_string(),
        })
    }

    pub fn from_config(server: &ServerConfig) -> Result<Self, ApiError> {
        Self::new(server.api_base_url())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Exchanges credentials for a session. The server answers with
    /// `status == 1` on success.
    pub async fn login(&self, email: &str, password: &str) -> Result<Session, ApiError> {
        let url = format!("{}/api/login", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = serde_json::from_str::<LoginResponse>(&body)
                .ok()
                .and_then(|parsed| parsed.message)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            return Err(ApiError::LoginRejected(reason));
        }

        let body: LoginResponse = response.json().await?;
        let rejected = || {
            ApiError::LoginRejected(
                body.message
                    .clone()
                    .unwrap_or_else(|| "login failed".to_string()),
            )
        };
        if body.status != 1 {
            return Err(rejected());
        }
        let (Some(token), Some(user)) = (body.token.clone(), body.user.as_ref()) else {
            return Err(rejected());
        };

        debug!(user_id = %user.id, "logged in");
        Ok(Session::new(user.id.clone(), user.name.clone(), token))
    }

    fn authorized(&self, builder: RequestBuilder, session: &Session) -> RequestBuilder {
        if session.auth_token.is_empty() {
            builder
        } else {
            builder.bearer_auth(&session.auth_token)
        }
    }

    async fn get(&self, session: &Session, endpoint: &str) -> Result<Response, ApiError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let response = self
            .authorized(self.client.get(&url), session)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }
}

impl ChatApi for HttpChatApi {
    async fn fetch_history(
        &self,
        session: &Session,
        peer_id: &str,
    ) -> Result<Vec<Message>, ApiError> {
        let endpoint = format!("/api/messages/{}/{}", session.user_id, peer_id);
        let messages: Vec<WireMessage> = self.get(session, &endpoint).await?.json().await?;
        debug!(peer_id, count = messages.len(), "history fetched");
        Ok(messages.into_iter().map(Message::from).collect())
    }

    async fn fetch_unread_counts(&self, session: &Session) -> Result<UnreadSnapshot, ApiError> {
        let endpoint = format!("/api/unread-count/{}", session.user_id);
        let entries: Vec<UnreadCountEntry> = self.get(session, &endpoint).await?.json().await?;
        debug!(peers = entries.len(), "unread counts fetched");
        Ok(entries
            .into_iter()
            .map(|entry| (entry.peer_id, entry.count))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn rejects_non_http_base_url() {
        assert_matches!(
            HttpChatApi::new("ws://localhost:4545").err(),
            Some(ApiError::InvalidUrl(_))
        );
    }

    #[test]
    fn trims_trailing_slash() {
        let api = HttpChatApi::new("http://localhost:4545/").unwrap();
        assert_eq!(api.base_url(), "http://localhost:4545");
    }

    #[test]
    fn api_url_overrides_server_url() {
        let server = ServerConfig {
            url: "http://localhost:4545".to_string(),
            api_url: Some("https://api.example.com".to_string()),
        };
        let api = HttpChatApi::from_config(&server).unwrap();
        assert_eq!(api.base_url(), "https://api.example.com");
    }
}
