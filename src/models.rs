//! Model registry
//!
//! Merges the statically known catalogs with whatever the bridge advertises
//! in its health probe into one addressable list, and resolves the selected
//! `backend:model` key with a deterministic fallback.

use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::prober::{BackendCapability, ConnectionState};
use crate::store::{keys, KeyStore};

/// How a backend answers queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Plans are generated client-side by a hosted model; needs a credential
    ModelDriven,
    /// Queries are dispatched to the companion bridge; needs connectivity
    Bridge,
}

/// One selectable model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub backend: String,
    pub model: String,
    pub backend_display_name: String,
    pub label: String,
    pub available: bool,
    #[serde(default)]
    pub is_default: bool,
    pub kind: BackendKind,
}

impl ModelDescriptor {
    /// Persisted selection key: `backend:model`
    pub fn key(&self) -> String {
        format!("{}:{}", self.backend, self.model)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CatalogEntry {
    pub value: &'static str,
    pub label: &'static str,
    pub is_default: bool,
}

/// Models known without asking anyone
#[derive(Debug, Clone, Copy)]
pub struct StaticCatalog {
    pub backend: &'static str,
    pub display_name: &'static str,
    pub kind: BackendKind,
    pub models: &'static [CatalogEntry],
}

pub const GEMINI_DEFAULT_MODEL: &str = "gemini-3-flash-preview";

pub const GEMINI: StaticCatalog = StaticCatalog {
    backend: "gemini",
    display_name: "Gemini",
    kind: BackendKind::ModelDriven,
    models: &[
        CatalogEntry { value: "gemini-3-pro-preview", label: "Gemini 3 Pro", is_default: false },
        CatalogEntry { value: GEMINI_DEFAULT_MODEL, label: "Gemini 3 Flash", is_default: true },
        CatalogEntry { value: "gemini-2.5-pro", label: "Gemini 2.5 Pro", is_default: false },
        CatalogEntry { value: "gemini-2.5-flash", label: "Gemini 2.5 Flash", is_default: false },
        CatalogEntry { value: "gemini-2.0-flash", label: "Gemini 2.0 Flash", is_default: false },
    ],
};

/// Shown (unavailable) while the bridge is unreachable
pub const BRIDGE_FALLBACK: [StaticCatalog; 2] = [
    StaticCatalog {
        backend: "openrouter",
        display_name: "OpenRouter",
        kind: BackendKind::Bridge,
        models: &[
            CatalogEntry { value: "meta-llama/llama-3.3-70b-instruct:free", label: "Llama 3.3 70B", is_default: false },
            CatalogEntry { value: "deepseek/deepseek-chat-v3-0324:free", label: "DeepSeek V3", is_default: false },
        ],
    },
    StaticCatalog {
        backend: "direct",
        display_name: "Direct",
        kind: BackendKind::Bridge,
        models: &[CatalogEntry { value: "statements", label: "Run statements as typed", is_default: false }],
    },
];

/// Group order in listings; anything else follows alphabetically
pub const PREFERRED_GROUPS: [&str; 3] = ["Gemini", "OpenRouter", "Direct"];

/// The full default catalog set
pub fn default_catalogs() -> Vec<StaticCatalog> {
    let mut catalogs = vec![GEMINI];
    catalogs.extend(BRIDGE_FALLBACK);
    catalogs
}

/// Build the merged model list
///
/// Model-driven catalogs are always present and available. Bridge backends
/// come from the probe's capabilities when connected, otherwise from the
/// static fallback catalogs marked unavailable.
pub fn build_model_list(catalogs: &[StaticCatalog], connection: &ConnectionState) -> Vec<ModelDescriptor> {
    let mut models: Vec<ModelDescriptor> = Vec::new();
    let mut push = |d: ModelDescriptor| {
        if !models.iter().any(|m| m.backend == d.backend && m.model == d.model) {
            models.push(d);
        }
    };

    for catalog in catalogs.iter().filter(|c| c.kind == BackendKind::ModelDriven) {
        for entry in catalog.models {
            push(from_catalog(catalog, entry, true));
        }
    }

    if connection.connected {
        for backend in &connection.backends {
            for d in from_capability(backend) {
                push(d);
            }
        }
    } else {
        for catalog in catalogs.iter().filter(|c| c.kind == BackendKind::Bridge) {
            for entry in catalog.models {
                push(from_catalog(catalog, entry, false));
            }
        }
    }

    models
}

fn from_catalog(catalog: &StaticCatalog, entry: &CatalogEntry, available: bool) -> ModelDescriptor {
    ModelDescriptor {
        backend: catalog.backend.to_string(),
        model: entry.value.to_string(),
        backend_display_name: catalog.display_name.to_string(),
        label: entry.label.to_string(),
        available,
        is_default: entry.is_default,
        kind: catalog.kind,
    }
}

fn from_capability(backend: &BackendCapability) -> Vec<ModelDescriptor> {
    let display = backend
        .display_name
        .clone()
        .unwrap_or_else(|| backend.name.clone());
    let descriptor = |value: &str, label: &str| ModelDescriptor {
        backend: backend.name.clone(),
        model: value.to_string(),
        backend_display_name: display.clone(),
        label: label.to_string(),
        available: true,
        is_default: backend.default_model.as_deref() == Some(value),
        kind: BackendKind::Bridge,
    };

    if !backend.models.is_empty() {
        backend
            .models
            .iter()
            .map(|m| descriptor(&m.value, &m.label))
            .collect()
    } else if let Some(default) = &backend.default_model {
        vec![descriptor(default, default)]
    } else {
        vec![]
    }
}

/// Group by display name: preferred groups first, the rest alphabetically
pub fn group_models(models: &[ModelDescriptor]) -> Vec<(String, Vec<&ModelDescriptor>)> {
    let mut groups: Vec<(String, Vec<&ModelDescriptor>)> = Vec::new();
    for m in models {
        match groups.iter_mut().find(|(name, _)| *name == m.backend_display_name) {
            Some((_, members)) => members.push(m),
            None => groups.push((m.backend_display_name.clone(), vec![m])),
        }
    }

    let rank = |name: &str| {
        PREFERRED_GROUPS
            .iter()
            .position(|p| *p == name)
            .unwrap_or(PREFERRED_GROUPS.len())
    };
    groups.sort_by(|(a, _), (b, _)| rank(a).cmp(&rank(b)).then_with(|| a.cmp(b)));
    groups
}

/// Resolve a key, falling back to default-and-available, any available, first
pub fn resolve<'a>(models: &'a [ModelDescriptor], key: Option<&str>) -> Option<&'a ModelDescriptor> {
    key.and_then(|k| models.iter().find(|m| m.key() == k))
        .or_else(|| models.iter().find(|m| m.is_default && m.available))
        .or_else(|| models.iter().find(|m| m.available))
        .or_else(|| models.first())
}

/// What must happen before a selected model can run a query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prerequisite {
    Connectivity,
    Authentication,
}

/// Outcome of a selection: always a descriptor, maybe a prerequisite
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub descriptor: ModelDescriptor,
    pub prerequisite: Option<Prerequisite>,
}

/// Owns the current model list and the (persisted) selection
pub struct ModelRegistry {
    catalogs: Vec<StaticCatalog>,
    models: Vec<ModelDescriptor>,
    selected: Option<String>,
    store: Arc<dyn KeyStore>,
}

impl ModelRegistry {
    pub fn new(catalogs: Vec<StaticCatalog>, store: Arc<dyn KeyStore>) -> Self {
        let selected = store.get(keys::SELECTED_MODEL);
        let models = build_model_list(&catalogs, &ConnectionState::default());
        Self {
            catalogs,
            models,
            selected,
            store,
        }
    }

    /// Rebuild after the connection state changed
    pub fn rebuild(&mut self, connection: &ConnectionState) {
        self.models = build_model_list(&self.catalogs, connection);
        tracing::debug!(count = self.models.len(), connected = connection.connected, "model list rebuilt");
    }

    pub fn models(&self) -> &[ModelDescriptor] {
        &self.models
    }

    /// The selected descriptor after applying the fallback rule
    pub fn selected(&self) -> Option<&ModelDescriptor> {
        resolve(&self.models, self.selected.as_deref())
    }

    pub fn is_selected(&self, descriptor: &ModelDescriptor) -> bool {
        self.selected().map(|s| s.key()) == Some(descriptor.key())
    }

    /// Select a model by key
    ///
    /// A manual choice of an unavailable or not-yet-authenticated model still
    /// succeeds; the returned prerequisite tells the caller which flow to start.
    pub fn select(&mut self, key: &str, manual: bool, authenticated: bool) -> Option<Selection> {
        let descriptor = resolve(&self.models, Some(key))?.clone();
        if descriptor.key() != key {
            tracing::warn!(requested = key, resolved = %descriptor.key(), "unknown model key, using fallback");
        }

        let resolved_key = descriptor.key();
        if let Err(e) = self.store.set(keys::SELECTED_MODEL, &resolved_key) {
            tracing::warn!(error = %e, "could not persist model selection");
        }
        self.selected = Some(resolved_key);

        let prerequisite = if !manual {
            None
        } else {
            match descriptor.kind {
                BackendKind::Bridge if !descriptor.available => Some(Prerequisite::Connectivity),
                BackendKind::ModelDriven if !authenticated => Some(Prerequisite::Authentication),
                _ => None,
            }
        };

        Some(Selection {
            descriptor,
            prerequisite,
        })
    }

    /// Fuzzy lookup over keys and labels, best match first
    pub fn fuzzy_find(&self, query: &str) -> Vec<&ModelDescriptor> {
        let matcher = SkimMatcherV2::default();
        let mut scored: Vec<_> = self
            .models
            .iter()
            .filter_map(|m| {
                let by_key = matcher.fuzzy_match(&m.key(), query);
                let by_label = matcher.fuzzy_match(&m.label, query);
                by_key.max(by_label).map(|score| (m, score))
            })
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1));
        scored.into_iter().map(|(m, _)| m).collect()
    }
}
