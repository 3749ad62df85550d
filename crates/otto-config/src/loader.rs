// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_yaml::Value;
use tracing::debug;

use crate::Config;

/// Candidate config layers, weakest first.  Every location that exists is
/// parsed and folded over the previous ones, so `/etc` gives site-wide
/// defaults, the user's config dir overrides those, and a workspace-local
/// file wins over both.  `$OTTO_CONFIG` tops the search list.
fn layer_paths() -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = vec![
        PathBuf::from("/etc/otto/config.yaml"),
        PathBuf::from("/etc/otto/config.yml"),
    ];

    let user_dirs = [
        dirs::home_dir().map(|home| home.join(".config/otto")),
        dirs::config_dir().map(|cfg| cfg.join("otto")),
    ];
    for dir in user_dirs.into_iter().flatten() {
        paths.push(dir.join("config.yaml"));
        paths.push(dir.join("config.yml"));
    }

    for local in [".otto/config.yaml", ".otto/config.yml", "otto.yaml", "otto.yml"] {
        paths.push(PathBuf::from(local));
    }

    if let Ok(env_path) = std::env::var("OTTO_CONFIG") {
        paths.push(PathBuf::from(env_path));
    }
    paths
}

/// Load configuration by folding every discovered YAML layer.
///
/// `explicit` (the `--config` CLI flag) must exist and becomes the
/// strongest layer.  With no layers at all the built-in defaults apply.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut paths = layer_paths();
    if let Some(p) = explicit {
        anyhow::ensure!(p.is_file(), "config file not found: {}", p.display());
        paths.push(p.to_path_buf());
    }

    let mut merged: Option<Value> = None;
    for path in paths {
        let Some(layer) = read_layer(&path)? else {
            continue;
        };
        merged = Some(match merged.take() {
            Some(acc) => overlay(acc, layer),
            None => layer,
        });
    }

    match merged {
        None => Ok(Config::default()),
        Some(doc) => Ok(serde_yaml::from_value(doc).unwrap_or_default()),
    }
}

/// Parse one layer; `None` when the path is not a readable file.
fn read_layer(path: &Path) -> anyhow::Result<Option<Value>> {
    if !path.is_file() {
        return Ok(None);
    }
    debug!(path = %path.display(), "loading config layer");
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let doc = serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(doc))
}

/// Fold `layer` over `base`.
///
/// Two mappings combine key by key, recursing into shared keys so a layer
/// can override `server.port` without clobbering `server.host`.  Any other
/// pairing (scalar, sequence, mismatched shapes) resolves to the layer's
/// value outright.
fn overlay(base: Value, layer: Value) -> Value {
    match (base, layer) {
        (Value::Mapping(mut base_map), Value::Mapping(layer_map)) => {
            for (key, layer_value) in layer_map {
                let combined = match base_map.remove(&key) {
                    Some(base_value) => overlay(base_value, layer_value),
                    None => layer_value,
                };
                base_map.insert(key, combined);
            }
            Value::Mapping(base_map)
        }
        (_, layer_value) => layer_value,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
