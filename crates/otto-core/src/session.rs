// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Session state: persisted configuration, the on-disk layout, and the
//! live handle owning a session's context, memory, tool pool, and adapter.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use otto_config::{AgentDefaults, ProviderSettings};
use otto_mcp::{PoolTimeouts, ToolPool, ToolServerSpec};
use otto_memory::MemoryStore;
use otto_model::ModelAdapter;
use otto_services::{ServiceCatalog, ServiceContext, ServiceManager, SERVICE_MANAGER_NAME};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{info, warn};

use crate::{context::Context, error::CoreError};

pub const CONFIG_FILE: &str = "session_config.json";

/// Caller-supplied session creation spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSpec {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Inline provider settings; wins over `model_provider`.
    #[serde(default)]
    pub provider: Option<ProviderSettings>,
    /// Name of a provider configured in the runtime config.
    #[serde(default)]
    pub model_provider: Option<String>,
    #[serde(default)]
    pub agent: Option<AgentDefaults>,
    #[serde(default)]
    pub tool_servers: Vec<ToolServerSpec>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Partial update applied by `UpdateSession`.  Identity and provider
/// selection are immutable after creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSpec {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Persisted session configuration (`session_config.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    pub provider: ProviderSettings,
    #[serde(default)]
    pub agent: AgentDefaults,
    #[serde(default)]
    pub tool_servers: Vec<ToolServerSpec>,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Summary row returned by list/get operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub display_name: String,
    pub description: String,
    pub provider: String,
    pub model: String,
    pub live: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionConfig {
    pub fn summary(&self, live: bool) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            description: self.description.clone(),
            provider: self.provider.provider.clone(),
            model: self.provider.model.clone(),
            live,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// A live session: exclusive owner of its context and tool pool.
pub struct SessionHandle {
    config: RwLock<SessionConfig>,
    dir: PathBuf,
    memory: Arc<MemoryStore>,
    pool: Arc<ToolPool>,
    context: Mutex<Context>,
    adapter: OnceCell<Arc<dyn ModelAdapter>>,
    init: OnceCell<()>,
    /// Held for the duration of one turn; `try_lock` enforces
    /// at-most-one concurrent turn per session.
    turn_lock: Arc<Mutex<()>>,
}

impl SessionHandle {
    /// Build the handle from a config and its session directory, creating
    /// the directory layout when missing.
    pub fn open(config: SessionConfig, dir: PathBuf) -> anyhow::Result<Arc<Self>> {
        for sub in ["memory", "mcp", "graphs", "logs"] {
            std::fs::create_dir_all(dir.join(sub))
                .with_context(|| format!("creating {}", dir.join(sub).display()))?;
        }
        let memory = Arc::new(MemoryStore::open(
            dir.join("memory"),
            config.agent.memory_cap,
        )?);
        let pool = Arc::new(ToolPool::new(PoolTimeouts {
            tool_call: Duration::from_secs(config.agent.tool_timeout_secs),
            startup: Duration::from_secs(config.agent.server_startup_timeout_secs),
            ..PoolTimeouts::default()
        }));
        let context = Context::new(
            config.agent.system_prompt.as_deref(),
            config.agent.max_messages,
            config.agent.max_context_length,
            config.agent.memory_enabled,
            config.agent.memory_context_size,
            Arc::clone(&memory),
        );
        Ok(Arc::new(Self {
            config: RwLock::new(config),
            dir,
            memory,
            pool,
            context: Mutex::new(context),
            adapter: OnceCell::new(),
            init: OnceCell::new(),
            turn_lock: Arc::new(Mutex::new(())),
        }))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pool(&self) -> &Arc<ToolPool> {
        &self.pool
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    pub fn context(&self) -> &Mutex<Context> {
        &self.context
    }

    pub fn turn_lock(&self) -> &Arc<Mutex<()>> {
        &self.turn_lock
    }

    pub async fn config(&self) -> SessionConfig {
        self.config.read().await.clone()
    }

    pub async fn apply_update(&self, update: UpdateSpec) -> SessionConfig {
        let mut config = self.config.write().await;
        if let Some(name) = update.display_name {
            config.display_name = name;
        }
        if let Some(desc) = update.description {
            config.description = desc;
        }
        if let Some(meta) = update.metadata {
            config.metadata = meta;
        }
        config.updated_at = Utc::now();
        config.clone()
    }

    /// Bring the session up: build the model adapter, attach the service
    /// manager, start the configured tool servers.  Idempotent; later
    /// callers wait for (and share) the first initialization.
    pub async fn initialize(self: &Arc<Self>, catalog: &Arc<ServiceCatalog>) -> Result<(), CoreError> {
        let this = Arc::clone(self);
        let catalog = Arc::clone(catalog);
        self.init
            .get_or_try_init(|| async move {
                let config = this.config().await;

                let adapter = otto_model::from_settings(&config.provider)
                    .map_err(|e| CoreError::invalid(e.to_string()))?;
                let _ = this.adapter.set(adapter);

                // The service manager rides along in every pool.
                let manager: Arc<dyn otto_mcp::McpService> = Arc::new(ServiceManager::new(
                    Arc::downgrade(&this.pool),
                    Arc::clone(&catalog),
                    this.dir.join("mcp"),
                    this.dir.join("graphs"),
                    Arc::clone(&this.memory),
                ));
                this.pool
                    .add_in_process(SERVICE_MANAGER_NAME, manager)
                    .await;

                for spec in &config.tool_servers {
                    match spec {
                        ToolServerSpec::Subprocess {
                            name,
                            command,
                            args,
                            env,
                        } => {
                            this.pool
                                .add_subprocess(name.clone(), command.clone(), args.clone(), env.clone())
                                .await;
                        }
                        ToolServerSpec::InProcess {
                            name,
                            service_type,
                            config: service_config,
                        } => {
                            let service = catalog
                                .create(
                                    service_type,
                                    ServiceContext {
                                        instance_id: name.clone(),
                                        config: service_config.clone(),
                                        data_dir: this.dir.join("mcp").join(name),
                                        graphs_dir: this.dir.join("graphs"),
                                        memory: Arc::clone(&this.memory),
                                    },
                                )
                                .map_err(|e| CoreError::invalid(e.to_string()))?;
                            this.pool.add_in_process(name.clone(), service).await;
                        }
                    }
                }

                let failures = this.pool.start().await;
                for (server, error) in &failures {
                    warn!(session = %config.id, server, error, "tool server failed to start");
                }
                info!(session = %config.id, "session initialized");
                Ok(())
            })
            .await
            .map(|_| ())
    }

    /// Install a model adapter ahead of initialization.
    ///
    /// Embedders and tests use this to drive the engine with a custom
    /// adapter; `initialize` keeps a preset instead of building one from
    /// the session's provider settings.  Returns `false` when an adapter
    /// was already installed.
    pub fn preset_adapter(&self, adapter: Arc<dyn ModelAdapter>) -> bool {
        self.adapter.set(adapter).is_ok()
    }

    /// The model adapter; present once `initialize` has succeeded.
    pub fn adapter(&self) -> Result<Arc<dyn ModelAdapter>, CoreError> {
        self.adapter
            .get()
            .cloned()
            .ok_or_else(|| CoreError::internal("session adapter not initialized"))
    }

    /// Tear down the pool.  Used by delete and process shutdown.
    pub async fn close(&self) {
        self.pool.shutdown().await;
    }

    /// Append one JSONL line per event to the session's turn log.
    /// Log failures never fail the turn.
    pub fn append_turn_log(&self, events: &[crate::events::TurnEvent]) {
        let path = self.dir.join("logs").join("turns.jsonl");
        let mut lines = String::new();
        for ev in events {
            match serde_json::to_string(ev) {
                Ok(s) => {
                    lines.push_str(&s);
                    lines.push('\n');
                }
                Err(e) => warn!(error = %e, "turn event failed to serialize for log"),
            }
        }
        use std::io::Write;
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| f.write_all(lines.as_bytes()));
        if let Err(e) = result {
            warn!(error = %e, path = %path.display(), "failed to append turn log");
        }
    }
}

/// Atomically persist a session config, stripping inline secrets.
pub fn save_config(dir: &Path, config: &SessionConfig) -> anyhow::Result<()> {
    let mut on_disk = config.clone();
    // Credentials are consumed from the environment or kept in memory;
    // they never land in session_config.json.
    on_disk.provider.api_key = None;

    let path = dir.join(CONFIG_FILE);
    let tmp = dir.join(format!("{CONFIG_FILE}.tmp"));
    let text = serde_json::to_string_pretty(&on_disk)?;
    std::fs::write(&tmp, text).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, &path).with_context(|| format!("renaming to {}", path.display()))?;
    Ok(())
}

/// Load a persisted session config from its directory.
pub fn load_config(dir: &Path) -> anyhow::Result<SessionConfig> {
    let path = dir.join(CONFIG_FILE);
    let text =
        std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
