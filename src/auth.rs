//! OAuth authorization-code flow with PKCE for the model-driven backend
//!
//! Tokens live in the key store. A credential counts as present while the
//! access token is unexpired or a refresh token exists; a rejected refresh
//! wipes every auth key so the next query re-enters the consent flow.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use reqwest::Url;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::config::OAuthConfig;
use crate::error::{Error, Result};
use crate::store::{keys, KeyStore};

/// Tokens are treated as expired this long before the provider says so
const EXPIRY_SKEW_SECS: i64 = 60;

/// 32 random bytes, base64url without padding
pub fn generate_code_verifier() -> String {
    let bytes: [u8; 32] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// base64url(SHA-256(verifier)), the S256 challenge
pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    error: Option<String>,
    error_description: Option<String>,
}

impl TokenResponse {
    fn error_message(&self) -> Option<String> {
        self.error
            .as_ref()
            .map(|e| self.error_description.clone().unwrap_or_else(|| e.clone()))
    }
}

pub struct Authenticator {
    client: reqwest::Client,
    store: Arc<dyn KeyStore>,
    oauth: OAuthConfig,
}

impl Authenticator {
    pub fn new(client: reqwest::Client, store: Arc<dyn KeyStore>, oauth: OAuthConfig) -> Self {
        Self {
            client,
            store,
            oauth,
        }
    }

    pub fn store(&self) -> &Arc<dyn KeyStore> {
        &self.store
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn expires_at(&self) -> i64 {
        self.store
            .get(keys::EXPIRES_AT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    fn valid_access_token(&self) -> Option<String> {
        self.store
            .get(keys::ACCESS_TOKEN)
            .filter(|_| Self::now_ms() < self.expires_at())
    }

    /// True when a query could obtain a token without user interaction
    pub fn is_authenticated(&self) -> bool {
        self.valid_access_token().is_some() || self.store.get(keys::REFRESH_TOKEN).is_some()
    }

    /// Begin the consent flow; returns the URL the user must visit
    pub fn start(&self) -> Result<String> {
        if self.oauth.client_id.is_empty() {
            return Err(Error::Config(
                "oauth.client_id is not set; run `ntquery config set oauth.client_id <id>`".into(),
            ));
        }

        let verifier = generate_code_verifier();
        self.store.set(keys::CODE_VERIFIER, &verifier)?;
        let state = uuid::Uuid::new_v4().to_string();
        let scope = self.oauth.scopes.join(" ");
        let challenge = code_challenge(&verifier);

        let url = Url::parse_with_params(
            &self.oauth.auth_url,
            &[
                ("client_id", self.oauth.client_id.as_str()),
                ("redirect_uri", self.oauth.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", scope.as_str()),
                ("access_type", "offline"),
                ("code_challenge", challenge.as_str()),
                ("code_challenge_method", "S256"),
                ("state", state.as_str()),
            ],
        )
        .map_err(|e| Error::Config(format!("invalid auth_url: {}", e)))?;

        tracing::info!("authorization flow started");
        Ok(url.to_string())
    }

    /// Exchange the pasted authorization code for a token pair
    pub async fn exchange_code(&self, code: &str) -> Result<()> {
        let verifier = self
            .store
            .get(keys::CODE_VERIFIER)
            .ok_or_else(|| Error::AuthFailed("No pending auth flow".into()))?;

        let mut form = vec![
            ("code", code.trim().to_string()),
            ("client_id", self.oauth.client_id.clone()),
            ("redirect_uri", self.oauth.redirect_uri.clone()),
            ("grant_type", "authorization_code".to_string()),
            ("code_verifier", verifier),
        ];
        if let Some(secret) = &self.oauth.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let data = self.token_request(&form).await?;
        if let Some(message) = data.error_message() {
            return Err(Error::AuthFailed(message));
        }
        self.store_tokens(&data)?;
        self.store.remove(keys::CODE_VERIFIER)?;
        tracing::info!("authorization code exchanged");
        Ok(())
    }

    /// Use the refresh token; `None` when there is none or it was rejected
    pub async fn refresh(&self) -> Result<Option<String>> {
        let Some(refresh_token) = self.store.get(keys::REFRESH_TOKEN) else {
            return Ok(None);
        };

        let mut form = vec![
            ("client_id", self.oauth.client_id.clone()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token".to_string()),
        ];
        if let Some(secret) = &self.oauth.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let data = self.token_request(&form).await?;
        if let Some(message) = data.error_message() {
            tracing::warn!(%message, "token refresh rejected, clearing credentials");
            self.clear()?;
            return Ok(None);
        }

        self.store_tokens(&data)?;
        tracing::debug!("access token refreshed");
        Ok(data.access_token)
    }

    /// A usable access token, refreshing if needed
    pub async fn access_token(&self) -> Result<String> {
        if let Some(token) = self.valid_access_token() {
            return Ok(token);
        }
        match self.refresh().await? {
            Some(token) => Ok(token),
            None => Err(Error::AuthRequired),
        }
    }

    /// Forget every auth key, including the provisioned project
    pub fn clear(&self) -> Result<()> {
        for key in keys::AUTH {
            self.store.remove(key)?;
        }
        Ok(())
    }

    /// Drop the access token only; the refresh token gets another chance
    pub fn invalidate_access_token(&self) -> Result<()> {
        self.store.remove(keys::ACCESS_TOKEN)?;
        self.store.remove(keys::EXPIRES_AT)
    }

    async fn token_request(&self, form: &[(&str, String)]) -> Result<TokenResponse> {
        let response = self
            .client
            .post(&self.oauth.token_url)
            .form(form)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|_| Error::Http {
            status: status.as_u16(),
            message: format!("Token endpoint returned unreadable body ({})", status),
        })
    }

    fn store_tokens(&self, data: &TokenResponse) -> Result<()> {
        let access = data
            .access_token
            .as_deref()
            .ok_or_else(|| Error::AuthFailed("token response had no access_token".into()))?;
        self.store.set(keys::ACCESS_TOKEN, access)?;
        if let Some(refresh) = &data.refresh_token {
            self.store.set(keys::REFRESH_TOKEN, refresh)?;
        }
        let expires_in = data.expires_in.unwrap_or(3600);
        let expires_at = Self::now_ms() + (expires_in - EXPIRY_SKEW_SECS) * 1000;
        self.store.set(keys::EXPIRES_AT, &expires_at.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use axum::{routing::post, Form, Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;

    async fn token_server() -> String {
        async fn token(Form(form): Form<HashMap<String, String>>) -> Json<Value> {
            match form.get("grant_type").map(String::as_str) {
                Some("authorization_code") if form.get("code").map(String::as_str) == Some("good") => {
                    Json(json!({"access_token": "at-1", "refresh_token": "rt-1", "expires_in": 3600}))
                }
                Some("refresh_token") if form.get("refresh_token").map(String::as_str) == Some("rt-1") => {
                    Json(json!({"access_token": "at-2", "expires_in": 3600}))
                }
                _ => Json(json!({"error": "invalid_grant", "error_description": "Bad Request"})),
            }
        }

        let app = Router::new().route("/token", post(token));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}/token", addr)
    }

    fn authenticator(token_url: String, store: Arc<dyn KeyStore>) -> Authenticator {
        let oauth = OAuthConfig {
            client_id: "client".into(),
            token_url,
            ..OAuthConfig::default()
        };
        Authenticator::new(reqwest::Client::new(), store, oauth)
    }

    #[test]
    fn test_pkce_shapes() {
        let v = generate_code_verifier();
        assert_eq!(v.len(), 43);
        assert!(!v.contains('=') && !v.contains('+') && !v.contains('/'));
        // RFC 7636 appendix B
        assert_eq!(
            code_challenge("dBjftJeZ4CVP-mJ92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_start_requires_client_id() {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryStore::new());
        let auth = Authenticator::new(reqwest::Client::new(), store.clone(), OAuthConfig::default());
        assert!(auth.start().is_err());

        let auth = authenticator("http://127.0.0.1:1/token".into(), store.clone());
        let url = auth.start().unwrap();
        assert!(url.contains("code_challenge_method=S256"));
        assert!(store.get(keys::CODE_VERIFIER).is_some());
    }

    #[test]
    fn test_presence_rules() {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryStore::new());
        let auth = authenticator("http://127.0.0.1:1/token".into(), store.clone());
        assert!(!auth.is_authenticated());

        store.set(keys::ACCESS_TOKEN, "expired").unwrap();
        store.set(keys::EXPIRES_AT, "1").unwrap();
        assert!(!auth.is_authenticated());

        store.set(keys::REFRESH_TOKEN, "rt").unwrap();
        assert!(auth.is_authenticated());
    }

    #[tokio::test]
    async fn test_exchange_then_refresh() {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryStore::new());
        let auth = authenticator(token_server().await, store.clone());

        assert!(auth.exchange_code("good").await.is_err());
        auth.start().unwrap();
        auth.exchange_code("good").await.unwrap();
        assert_eq!(auth.access_token().await.unwrap(), "at-1");
        assert_eq!(store.get(keys::CODE_VERIFIER), None);

        let expires_at: i64 = store.get(keys::EXPIRES_AT).unwrap().parse().unwrap();
        let remaining = expires_at - chrono::Utc::now().timestamp_millis();
        assert!(remaining > 3_500_000 && remaining <= 3_540_000);

        auth.invalidate_access_token().unwrap();
        assert_eq!(auth.access_token().await.unwrap(), "at-2");
        assert_eq!(store.get(keys::REFRESH_TOKEN).as_deref(), Some("rt-1"));
    }

    #[tokio::test]
    async fn test_failed_refresh_clears_everything() {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryStore::new());
        let auth = authenticator(token_server().await, store.clone());
        store.set(keys::REFRESH_TOKEN, "revoked").unwrap();
        store.set(keys::PROJECT_ID, "proj").unwrap();

        let err = auth.access_token().await.unwrap_err();
        assert!(err.is_auth_required());
        for key in keys::AUTH {
            assert_eq!(store.get(key), None);
        }
    }
}
