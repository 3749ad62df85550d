// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Session manager: the exclusive owner of the `session id → live session`
//! map and of the on-disk `sessions/` tree.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use otto_config::{AgentDefaults, Config, ProviderSettings};
use otto_services::ServiceCatalog;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::{
    error::CoreError,
    session::{
        load_config, save_config, SessionConfig, SessionHandle, SessionSpec, SessionSummary,
        UpdateSpec, CONFIG_FILE,
    },
};

/// Where `ListSessions` looks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListSource {
    /// Currently live sessions only.
    Memory,
    /// All session directories on disk.
    File,
    /// Union of both, live entries preferred.
    #[default]
    All,
}

impl FromStr for ListSource {
    type Err = CoreError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Self::Memory),
            "file" => Ok(Self::File),
            "all" => Ok(Self::All),
            other => Err(CoreError::invalid(format!(
                "unknown list source '{other}' (expected memory, file, or all)"
            ))),
        }
    }
}

pub struct SessionManager {
    sessions_root: PathBuf,
    defaults: AgentDefaults,
    named_providers: HashMap<String, ProviderSettings>,
    catalog: Arc<ServiceCatalog>,
    live: RwLock<HashMap<String, Arc<SessionHandle>>>,
}

impl SessionManager {
    pub fn new(config: &Config, catalog: Arc<ServiceCatalog>) -> anyhow::Result<Self> {
        let sessions_root = config.runtime.effective_data_root().join("sessions");
        std::fs::create_dir_all(&sessions_root)?;
        Ok(Self {
            sessions_root,
            defaults: config.agent.clone(),
            named_providers: config.providers.clone(),
            catalog,
            live: RwLock::new(HashMap::new()),
        })
    }

    pub fn catalog(&self) -> &Arc<ServiceCatalog> {
        &self.catalog
    }

    pub fn sessions_root(&self) -> &PathBuf {
        &self.sessions_root
    }

    fn session_dir(&self, id: &str) -> PathBuf {
        self.sessions_root.join(id)
    }

    fn validate_id(id: &str) -> Result<(), CoreError> {
        if id.is_empty() {
            return Err(CoreError::invalid("session id must not be empty"));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(CoreError::invalid(format!(
                "session id '{id}' contains illegal characters"
            )));
        }
        Ok(())
    }

    fn resolve_provider(&self, spec: &SessionSpec) -> Result<ProviderSettings, CoreError> {
        if let Some(inline) = &spec.provider {
            return Ok(inline.clone());
        }
        if let Some(name) = &spec.model_provider {
            return self
                .named_providers
                .get(name)
                .cloned()
                .ok_or_else(|| CoreError::invalid(format!("unknown named provider '{name}'")));
        }
        Err(CoreError::invalid(
            "session spec must set either provider or model_provider",
        ))
    }

    /// Create a session: persist its config, lay out its directory, and
    /// register the (uninitialized) live handle.
    pub async fn create(&self, spec: SessionSpec) -> Result<SessionSummary, CoreError> {
        Self::validate_id(&spec.id)?;
        let provider = self.resolve_provider(&spec)?;

        let dir = self.session_dir(&spec.id);
        {
            let live = self.live.read().await;
            if live.contains_key(&spec.id) || dir.exists() {
                return Err(CoreError::AlreadyExists(spec.id));
            }
        }

        let now = Utc::now();
        let config = SessionConfig {
            id: spec.id.clone(),
            display_name: spec.display_name.unwrap_or_else(|| spec.id.clone()),
            description: spec.description.unwrap_or_default(),
            provider,
            agent: spec.agent.unwrap_or_else(|| self.defaults.clone()),
            tool_servers: spec.tool_servers,
            metadata: spec.metadata.unwrap_or_else(|| serde_json::json!({})),
            created_at: now,
            updated_at: now,
        };

        std::fs::create_dir_all(&dir).map_err(|e| CoreError::internal(e.to_string()))?;
        let handle = SessionHandle::open(config.clone(), dir.clone())
            .map_err(|e| CoreError::internal(e.to_string()))?;
        save_config(&dir, &config).map_err(|e| CoreError::internal(e.to_string()))?;

        let mut live = self.live.write().await;
        if live.contains_key(&spec.id) {
            return Err(CoreError::AlreadyExists(spec.id));
        }
        live.insert(spec.id.clone(), handle);
        info!(session = %spec.id, "session created");
        Ok(config.summary(true))
    }

    /// The live handle for a session, loading it from disk on first use.
    pub async fn handle(&self, id: &str) -> Result<Arc<SessionHandle>, CoreError> {
        if let Some(h) = self.live.read().await.get(id) {
            return Ok(Arc::clone(h));
        }
        let dir = self.session_dir(id);
        if !dir.join(CONFIG_FILE).is_file() {
            return Err(CoreError::not_found(format!("session '{id}'")));
        }
        let config = load_config(&dir).map_err(|e| CoreError::internal(e.to_string()))?;
        let handle =
            SessionHandle::open(config, dir).map_err(|e| CoreError::internal(e.to_string()))?;
        let mut live = self.live.write().await;
        let entry = live
            .entry(id.to_string())
            .or_insert_with(|| Arc::clone(&handle));
        Ok(Arc::clone(entry))
    }

    /// Initialize a session (idempotent): adapter, service manager, tool
    /// servers.
    pub async fn initialize(&self, id: &str) -> Result<Arc<SessionHandle>, CoreError> {
        let handle = self.handle(id).await?;
        handle.initialize(&self.catalog).await?;
        Ok(handle)
    }

    pub async fn get(&self, id: &str) -> Result<SessionSummary, CoreError> {
        if let Some(h) = self.live.read().await.get(id) {
            return Ok(h.config().await.summary(true));
        }
        let dir = self.session_dir(id);
        if dir.join(CONFIG_FILE).is_file() {
            let config = load_config(&dir).map_err(|e| CoreError::internal(e.to_string()))?;
            return Ok(config.summary(false));
        }
        Err(CoreError::not_found(format!("session '{id}'")))
    }

    pub async fn list(&self, source: ListSource) -> Result<Vec<SessionSummary>, CoreError> {
        let mut out: HashMap<String, SessionSummary> = HashMap::new();

        if matches!(source, ListSource::File | ListSource::All) {
            let entries = std::fs::read_dir(&self.sessions_root)
                .map_err(|e| CoreError::internal(e.to_string()))?;
            for entry in entries.flatten() {
                let dir = entry.path();
                if !dir.join(CONFIG_FILE).is_file() {
                    continue;
                }
                match load_config(&dir) {
                    Ok(config) => {
                        out.insert(config.id.clone(), config.summary(false));
                    }
                    Err(e) => {
                        warn!(dir = %dir.display(), error = %e, "skipping unreadable session dir")
                    }
                }
            }
        }

        if matches!(source, ListSource::Memory | ListSource::All) {
            for (id, handle) in self.live.read().await.iter() {
                out.insert(id.clone(), handle.config().await.summary(true));
            }
        }

        let mut list: Vec<SessionSummary> = out.into_values().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }

    /// Update mutable fields and persist the result.
    pub async fn update(&self, id: &str, update: UpdateSpec) -> Result<SessionSummary, CoreError> {
        let handle = self.handle(id).await?;
        let config = handle.apply_update(update).await;
        save_config(handle.dir(), &config).map_err(|e| CoreError::internal(e.to_string()))?;
        Ok(config.summary(true))
    }

    /// Delete a session: tear down its pool, drop the live entry, remove
    /// the directory tree.  Idempotent.
    pub async fn delete(&self, id: &str) -> Result<(), CoreError> {
        let handle = self.live.write().await.remove(id);
        if let Some(handle) = handle {
            handle.close().await;
        }
        let dir = self.session_dir(id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(|e| CoreError::internal(e.to_string()))?;
        }
        info!(session = %id, "session deleted");
        Ok(())
    }

    /// Shut down every live session (process shutdown).
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<SessionHandle>> = {
            let mut live = self.live.write().await;
            live.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.close().await;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
