// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should default to enabled need a named
/// function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub agent: AgentDefaults,
    /// Named provider configurations.
    ///
    /// Define custom endpoints, local models, or additional accounts here and
    /// reference them by name in a session's `model_provider` field.
    ///
    /// ```yaml
    /// providers:
    ///   local_llama:
    ///     provider: local         # self-hosted chat+stream endpoint
    ///     base_url: http://localhost:8080/v1
    ///     model: llama3.2
    ///   work_anthropic:
    ///     provider: anthropic
    ///     api_key_env: WORK_ANTHROPIC_KEY
    ///     model: claude-sonnet-4-5
    /// ```
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,
}

/// HTTP listener settings for `otto serve`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8420
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Process-wide runtime limits and paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Root directory for persisted session state.  Sessions live under
    /// `<root>/sessions/<id>/`.  Defaults to `~/.local/share/otto`.
    #[serde(default)]
    pub data_root: Option<PathBuf>,
    /// Cap on concurrently running turns across all sessions.
    /// `0` means "CPU cores × 4" resolved at startup.
    #[serde(default)]
    pub worker_cap: usize,
    /// Grace period in seconds for tool-server shutdown before a force kill.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_shutdown_grace() -> u64 {
    3
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_root: None,
            worker_cap: 0,
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl RuntimeConfig {
    /// Resolve the effective worker cap.
    pub fn effective_worker_cap(&self) -> usize {
        if self.worker_cap > 0 {
            return self.worker_cap;
        }
        std::thread::available_parallelism()
            .map(|n| n.get() * 4)
            .unwrap_or(16)
    }

    /// Resolve the data root, falling back to the platform data dir.
    pub fn effective_data_root(&self) -> PathBuf {
        self.data_root.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("otto")
        })
    }
}

/// Per-session agent settings, with process-wide defaults from config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefaults {
    /// System instruction used when a session does not provide one.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Maximum model rounds per user turn.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Messages retained in the context history.
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    /// Most-recent messages included when assembling a prompt.
    #[serde(default = "default_max_context_length")]
    pub max_context_length: usize,
    /// Whether memory injection into the prompt is enabled by default.
    #[serde(default = "default_true")]
    pub memory_enabled: bool,
    /// Top-ranked memory records injected per prompt.
    #[serde(default = "default_memory_context_size")]
    pub memory_context_size: usize,
    /// Cap on stored memory records before the forgetting pass evicts.
    #[serde(default = "default_memory_cap")]
    pub memory_cap: usize,
    /// Per tool call timeout in seconds.
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,
    /// Subprocess tool-server startup timeout in seconds.
    #[serde(default = "default_startup_timeout")]
    pub server_startup_timeout_secs: u64,
}

fn default_max_iterations() -> u32 {
    10
}

fn default_max_messages() -> usize {
    200
}

fn default_max_context_length() -> usize {
    50
}

fn default_memory_context_size() -> usize {
    5
}

fn default_memory_cap() -> usize {
    1000
}

fn default_tool_timeout() -> u64 {
    30
}

fn default_startup_timeout() -> u64 {
    10
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_iterations: default_max_iterations(),
            max_messages: default_max_messages(),
            max_context_length: default_max_context_length(),
            memory_enabled: true,
            memory_context_size: default_memory_context_size(),
            memory_cap: default_memory_cap(),
            tool_timeout_secs: default_tool_timeout(),
            server_startup_timeout_secs: default_startup_timeout(),
        }
    }
}

/// Settings for one model provider endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Driver identifier: "openai" | "anthropic" | "local" | "mock",
    /// or any OpenAI-compatible gateway via `base_url`.
    pub provider: String,
    /// Model name forwarded to the provider API.
    pub model: String,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer `api_key_env` in config files to avoid
    /// secrets in version-controlled files.
    pub api_key: Option<String>,
    /// Base URL override.  Required for local servers and gateways.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion.
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0).
    pub temperature: Option<f32>,
}

impl ProviderSettings {
    /// Resolve the API key: explicit value wins, then the configured env var,
    /// then the driver's conventional env var supplied by the caller.
    pub fn resolve_api_key(&self, fallback_env: Option<&str>) -> Option<String> {
        if let Some(k) = &self.api_key {
            return Some(k.clone());
        }
        if let Some(env) = &self.api_key_env {
            if let Ok(v) = std::env::var(env) {
                return Some(v);
            }
        }
        fallback_env.and_then(|env| std::env::var(env).ok())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
