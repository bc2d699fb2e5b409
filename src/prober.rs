//! Bridge connectivity prober
//!
//! Probes `GET {endpoint}/health`, falls back to a remembered secure variant of
//! the same host, and keeps a single self-stopping auto-retry timer. Probe
//! failures never escape as errors; they only flip the connection state.

use reqwest::Url;
use serde::{Deserialize, Serialize};
#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::normalize_endpoint;
use crate::store::{keys, KeyStore};

const HEALTH_PATH: &str = "/health";
const SETUP_PATH: &str = "/setup";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelOption {
    pub value: String,
    pub label: String,
}

/// One backend as advertised by the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendCapability {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub models: Vec<ModelOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

/// Health probe body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub backends: Vec<BackendCapability>,
}

/// Process-wide connectivity record; only the prober writes it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub connected: bool,
    pub active_endpoint: Option<String>,
    pub backends: Vec<BackendCapability>,
}

/// Probe one endpoint; `None` means unreachable for any reason
pub async fn probe(client: &reqwest::Client, endpoint: &str) -> Option<Capabilities> {
    let url = format!("{}{}", normalize_endpoint(endpoint), HEALTH_PATH);
    let response = match client.get(&url).send().await {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(%url, error = %e, "health probe failed");
            return None;
        }
    };

    if !response.status().is_success() {
        tracing::debug!(%url, status = %response.status(), "health probe rejected");
        return None;
    }

    match response.json::<Capabilities>().await {
        Ok(caps) => Some(caps),
        Err(e) => {
            tracing::debug!(%url, error = %e, "health body unreadable");
            None
        }
    }
}

fn same_host(a: &str, b: &str) -> bool {
    match (Url::parse(a), Url::parse(b)) {
        (Ok(a), Ok(b)) => a.host_str().is_some() && a.host_str() == b.host_str(),
        _ => false,
    }
}

pub struct Prober {
    client: reqwest::Client,
    store: Arc<dyn KeyStore>,
    endpoint: Mutex<String>,
    interval: Duration,
    state: watch::Sender<ConnectionState>,
    retry: Mutex<Option<JoinHandle<()>>>,
    #[cfg(test)]
    timers_started: AtomicUsize,
}

impl Prober {
    pub fn new(
        client: reqwest::Client,
        store: Arc<dyn KeyStore>,
        endpoint: &str,
        interval: Duration,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::default());
        Arc::new(Self {
            client,
            store,
            endpoint: Mutex::new(normalize_endpoint(endpoint)),
            interval,
            state,
            retry: Mutex::new(None),
            #[cfg(test)]
            timers_started: AtomicUsize::new(0),
        })
    }

    pub fn endpoint(&self) -> String {
        self.endpoint.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Change the configured endpoint; a different endpoint forgets the secure variant
    pub fn set_endpoint(&self, url: &str) {
        let url = normalize_endpoint(url);
        let changed = match self.endpoint.lock() {
            Ok(mut current) => {
                let changed = *current != url;
                *current = url.clone();
                changed
            }
            Err(_) => false,
        };

        if let Err(e) = self.store.set(keys::BRIDGE_URL, &url) {
            tracing::warn!(error = %e, "could not persist bridge url");
        }
        if url.starts_with("https://") {
            self.remember_secure(&url);
        } else if changed {
            if let Err(e) = self.store.remove(keys::BRIDGE_HTTPS_URL) {
                tracing::warn!(error = %e, "could not clear secure bridge url");
            }
        }
    }

    /// Record the secure variant of the bridge (announced by its setup page)
    pub fn remember_secure(&self, url: &str) {
        if let Err(e) = self.store.set(keys::BRIDGE_HTTPS_URL, &normalize_endpoint(url)) {
            tracing::warn!(error = %e, "could not persist secure bridge url");
        }
    }

    /// Remembered secure variant, only if it belongs to the same host
    pub fn secure_variant(&self, endpoint: &str) -> Option<String> {
        self.store
            .get(keys::BRIDGE_HTTPS_URL)
            .filter(|saved| saved.as_str() != endpoint && same_host(saved, endpoint))
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }

    /// Probe the endpoint, then its secure variant; update the connection state
    pub async fn refresh(&self) -> bool {
        let connected = self.probe_candidates().await;
        if connected {
            self.stop_auto_retry();
        }
        connected
    }

    /// Ask the bridge's setup page for its secure listener and remember it
    pub async fn discover_secure(&self) -> Option<String> {
        let url = format!("{}{}", self.endpoint(), SETUP_PATH);
        let body: serde_json::Value = match self.client.get(&url).send().await {
            Ok(r) if r.status().is_success() => r.json().await.ok()?,
            Ok(r) => {
                tracing::debug!(%url, status = %r.status(), "setup page rejected");
                return None;
            }
            Err(e) => {
                tracing::debug!(%url, error = %e, "setup page unreachable");
                return None;
            }
        };
        let secure = body.get("secureUrl")?.as_str()?.to_string();
        self.remember_secure(&secure);
        Some(secure)
    }

    async fn probe_candidates(&self) -> bool {
        let endpoint = self.endpoint();
        if endpoint.is_empty() {
            self.set_disconnected();
            return false;
        }

        let mut candidates = vec![endpoint.clone()];
        if let Some(secure) = self.secure_variant(&endpoint) {
            candidates.push(secure);
        }

        for candidate in candidates {
            if let Some(caps) = probe(&self.client, &candidate).await {
                if candidate.starts_with("https://") {
                    self.remember_secure(&candidate);
                }
                tracing::debug!(endpoint = %candidate, backends = caps.backends.len(), "bridge reachable");
                self.state.send_replace(ConnectionState {
                    connected: true,
                    active_endpoint: Some(candidate),
                    backends: caps.backends,
                });
                return true;
            }
        }

        self.set_disconnected();
        false
    }

    fn set_disconnected(&self) {
        self.state.send_if_modified(|s| {
            let was = s.connected;
            s.connected = false;
            s.active_endpoint = None;
            s.backends.clear();
            was
        });
    }

    /// Start re-probing on a fixed interval until connected; no-op if running
    pub fn start_auto_retry(self: &Arc<Self>) {
        let Ok(mut slot) = self.retry.lock() else {
            return;
        };
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        #[cfg(test)]
        self.timers_started.fetch_add(1, Ordering::SeqCst);
        let weak = Arc::downgrade(self);
        let interval = self.interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(prober) = weak.upgrade() else {
                    break;
                };
                if prober.probe_candidates().await {
                    break;
                }
            }
        }));
        tracing::debug!(?interval, "connectivity auto-retry started");
    }

    pub fn stop_auto_retry(&self) {
        if let Ok(mut slot) = self.retry.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
                tracing::debug!("connectivity auto-retry stopped");
            }
        }
    }

    pub fn is_retrying(&self) -> bool {
        self.retry
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Number of repeating timers ever started
    #[cfg(test)]
    pub fn timers_started(&self) -> usize {
        self.timers_started.load(Ordering::SeqCst)
    }
}

impl Drop for Prober {
    fn drop(&mut self) {
        self.stop_auto_retry();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn prober(endpoint: &str, store: Arc<dyn KeyStore>) -> Arc<Prober> {
        Prober::new(reqwest::Client::new(), store, endpoint, Duration::from_millis(50))
    }

    #[test]
    fn test_health_body_parses_camel_case() {
        let json = r#"{"backends":[{"name":"codex","displayName":"Codex","models":[{"value":"gpt-5","label":"GPT-5"}],"defaultModel":"gpt-5"}]}"#;
        let caps: Capabilities = serde_json::from_str(json).unwrap();
        assert_eq!(caps.backends[0].display_name.as_deref(), Some("Codex"));
        assert_eq!(caps.backends[0].default_model.as_deref(), Some("gpt-5"));
    }

    #[test]
    fn test_secure_variant_requires_same_host() {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryStore::new());
        store.set(keys::BRIDGE_HTTPS_URL, "https://10.0.0.5:8788").unwrap();
        let p = prober("http://10.0.0.5:8787", store.clone());
        assert_eq!(
            p.secure_variant("http://10.0.0.5:8787").as_deref(),
            Some("https://10.0.0.5:8788")
        );
        assert_eq!(p.secure_variant("http://10.0.0.6:8787"), None);
    }

    #[test]
    fn test_endpoint_change_forgets_secure_variant() {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryStore::new());
        store.set(keys::BRIDGE_HTTPS_URL, "https://localhost:8788").unwrap();
        let p = prober("http://localhost:8787", store.clone());

        p.set_endpoint("http://localhost:8787/");
        assert!(store.get(keys::BRIDGE_HTTPS_URL).is_some());

        p.set_endpoint("http://localhost:9999");
        assert_eq!(store.get(keys::BRIDGE_HTTPS_URL), None);
        assert_eq!(store.get(keys::BRIDGE_URL).as_deref(), Some("http://localhost:9999"));

        p.set_endpoint("https://localhost:9443");
        assert_eq!(store.get(keys::BRIDGE_HTTPS_URL).as_deref(), Some("https://localhost:9443"));
    }

    #[tokio::test]
    async fn test_unreachable_never_errors() {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryStore::new());
        let p = prober("http://127.0.0.1:1", store);
        assert!(!p.refresh().await);
        assert!(!p.is_connected());
    }

    #[tokio::test]
    async fn test_auto_retry_start_is_idempotent() {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryStore::new());
        let p = prober("http://127.0.0.1:1", store);
        p.start_auto_retry();
        p.start_auto_retry();
        assert!(p.is_retrying());
        assert_eq!(p.timers_started(), 1);

        p.stop_auto_retry();
        assert!(!p.is_retrying());
        p.start_auto_retry();
        assert_eq!(p.timers_started(), 2);
        p.stop_auto_retry();
    }
}
