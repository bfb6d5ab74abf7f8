//! HTTP client for the game API (identity, lobbies, payouts).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{E2eError, Result};
use crate::types::{
    ChallengeResponse, Direction, ExecutePayoutResponse, JoinResponse, LobbyPlayerRow,
    LobbyResult, VerifyRequest, VerifyResponse,
};

const API_KEY_HEADER: &str = "x-api-key";
const CONNECT_TIMEOUT_SECS: u64 = 8;

/// Proof-of-work identity issuance.
#[async_trait]
pub trait IdentityApi: Send + Sync {
    async fn request_challenge(&self) -> Result<ChallengeResponse>;
    async fn verify(&self, request: &VerifyRequest) -> Result<VerifyResponse>;
}

/// Lobby membership, input and settlement calls.
#[async_trait]
pub trait LobbyApi: Send + Sync {
    async fn join_lobby(&self, token: &str, game_mode_id: &str) -> Result<JoinResponse>;
    async fn leave_lobby(&self, token: &str, lobby_id: &str) -> Result<()>;
    async fn send_input(&self, token: &str, lobby_id: &str, direction: Direction) -> Result<()>;
    async fn lobby_players(&self, lobby_id: &str) -> Result<Vec<LobbyPlayerRow>>;
    async fn lobby_result(&self, lobby_id: &str) -> Result<LobbyResult>;
    async fn execute_payout(&self, lobby_id: &str) -> Result<ExecutePayoutResponse>;
}

#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    http: Client,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            base_url: base_url.into(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    async fn send(&self, builder: RequestBuilder, url: &str) -> Result<reqwest::Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(E2eError::Api {
            status: status.as_u16(),
            url: url.to_string(),
            body,
        })
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder, url: &str) -> Result<T> {
        let response = self.send(builder, url).await?;
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    pub async fn health(&self) -> Result<Value> {
        let url = self.url("/health");
        self.send_json(self.http.get(&url), &url).await
    }

    /// Raw lobby state as served by the API, `None` while it is not published yet.
    pub async fn lobby_state(&self, lobby_id: &str) -> Result<Option<String>> {
        let url = self.url(&format!("/lobbies/{lobby_id}/state"));
        match self.send(self.http.get(&url), &url).await {
            Ok(response) => Ok(Some(response.text().await?)),
            Err(E2eError::Api { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }
}

#[async_trait]
impl IdentityApi for ApiClient {
    async fn request_challenge(&self) -> Result<ChallengeResponse> {
        let url = self.url("/agents/challenge");
        self.send_json(self.http.post(&url).json(&json!({})), &url)
            .await
    }

    async fn verify(&self, request: &VerifyRequest) -> Result<VerifyResponse> {
        let url = self.url("/agents/verify");
        self.send_json(self.http.post(&url).json(request), &url)
            .await
    }
}

#[async_trait]
impl LobbyApi for ApiClient {
    async fn join_lobby(&self, token: &str, game_mode_id: &str) -> Result<JoinResponse> {
        let url = self.url("/lobbies/join");
        let builder = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, token)
            .json(&json!({ "game_mode_id": game_mode_id }));
        self.send_json(builder, &url).await
    }

    async fn send_input(&self, token: &str, lobby_id: &str, direction: Direction) -> Result<()> {
        let url = self.url(&format!("/lobbies/{lobby_id}/input"));
        let builder = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, token)
            .json(&json!({ "direction": direction }));
        self.send(builder, &url).await?;
        debug!(lobby_id, direction = direction.as_str(), "input_sent");
        Ok(())
    }

    async fn lobby_players(&self, lobby_id: &str) -> Result<Vec<LobbyPlayerRow>> {
        let url = self.url(&format!("/lobbies/{lobby_id}/players"));
        self.send_json(self.http.get(&url), &url).await
    }

    async fn lobby_result(&self, lobby_id: &str) -> Result<LobbyResult> {
        let url = self.url(&format!("/lobbies/{lobby_id}/result"));
        self.send_json(self.http.get(&url), &url).await
    }

    async fn leave_lobby(&self, token: &str, lobby_id: &str) -> Result<()> {
        let url = self.url("/lobbies/leave");
        let builder = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, token)
            .json(&json!({ "lobby_id": lobby_id }));
        self.send(builder, &url).await?;
        Ok(())
    }

    async fn execute_payout(&self, lobby_id: &str) -> Result<ExecutePayoutResponse> {
        let url = self.url("/payouts/execute");
        let builder = self
            .http
            .post(&url)
            .json(&json!({ "lobby_id": lobby_id }));
        self.send_json(builder, &url).await
    }
}
