//! Code Assist planning backend
//!
//! Calls `{base}:{method}` with a bearer token. The project id is provisioned
//! once per account (`loadCodeAssist`, else `onboardUser`) and cached.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::Authenticator;
use crate::error::{Error, Result};
use crate::planner::{plan_schema, PlanModel};
use crate::store::keys;

const ONBOARD_SETTLE: Duration = Duration::from_secs(2);

pub struct CodeAssist {
    client: reqwest::Client,
    auth: Arc<Authenticator>,
    base_url: String,
}

impl CodeAssist {
    pub fn new(client: reqwest::Client, auth: Arc<Authenticator>, base_url: &str) -> Self {
        Self {
            client,
            auth,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn request(&self, method: &str, body: &Value, token: &str) -> Result<Value> {
        let url = format!("{}:{}", self.base_url, method);
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        let data: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        if status == reqwest::StatusCode::UNAUTHORIZED {
            tracing::warn!(%method, "access token rejected");
            self.auth.invalidate_access_token()?;
            return Err(Error::AuthRequired);
        }
        if !status.is_success() {
            let message = data
                .pointer("/error/message")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| format!("API error ({})", status.as_u16()));
            return Err(Error::Http {
                status: status.as_u16(),
                message,
            });
        }
        Ok(data)
    }

    /// Cached project id, provisioning one on first use
    pub async fn ensure_project(&self, token: &str) -> Result<Option<String>> {
        let store = self.auth.store();
        if let Some(project) = store.get(keys::PROJECT_ID) {
            return Ok(Some(project));
        }

        let metadata = json!({
            "ideType": "IDE_UNSPECIFIED",
            "platform": "PLATFORM_UNSPECIFIED",
            "pluginType": "GEMINI",
        });

        let loaded = self
            .request("loadCodeAssist", &json!({ "metadata": metadata }), token)
            .await?;
        if let Some(project) = loaded.get("cloudaicompanionProject").and_then(Value::as_str) {
            store.set(keys::PROJECT_ID, project)?;
            return Ok(Some(project.to_string()));
        }

        let tier = loaded
            .get("allowedTiers")
            .and_then(Value::as_array)
            .and_then(|tiers| {
                tiers
                    .iter()
                    .find(|t| t.get("isDefault").and_then(Value::as_bool) == Some(true))
            })
            .and_then(|t| t.get("id").and_then(Value::as_str))
            .unwrap_or("FREE")
            .to_string();

        tracing::info!(%tier, "onboarding account");
        let onboarded = self
            .request(
                "onboardUser",
                &json!({ "tierId": tier, "metadata": metadata }),
                token,
            )
            .await?;

        let pending = onboarded.get("name").is_some()
            && onboarded.get("done").and_then(Value::as_bool) != Some(true);
        if pending {
            tokio::time::sleep(ONBOARD_SETTLE).await;
        }

        let project = onboarded
            .pointer("/response/cloudaicompanionProject/id")
            .and_then(Value::as_str)
            .map(String::from);
        if let Some(p) = &project {
            store.set(keys::PROJECT_ID, p)?;
        }
        Ok(project)
    }
}

#[async_trait]
impl PlanModel for CodeAssist {
    async fn complete(&self, prompt: &str, model: &str) -> Result<String> {
        let token = self.auth.access_token().await?;
        let project = self.ensure_project(&token).await?;

        let body = json!({
            "model": model,
            "project": project,
            "request": {
                "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
                "generationConfig": {
                    "responseMimeType": "application/json",
                    "responseSchema": plan_schema(),
                },
            },
        });

        let response = self.request("generateContent", &body, &token).await?;
        Ok(response
            .pointer("/response/candidates/0/content/parts/0/text")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string())
    }
}
