// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Service-type catalog.
//!
//! The catalog maps a type id (`"python"`, `"graph"`, `"memory"`) to a
//! factory producing fresh [`McpService`] instances.  It is populated from
//! a table before the runtime accepts traffic and immutable afterwards;
//! the process-wide instance lives behind a `OnceLock`.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use otto_mcp::McpService;
use otto_memory::MemoryStore;
use serde_json::Value;

use crate::{graph::GraphService, python::PythonService, memory::MemoryService};

/// Everything a factory gets to build one service instance.
///
/// `data_dir` is instance-private (under the session's `mcp/` directory);
/// `graphs_dir` and `memory` are session-shared stores.
#[derive(Clone)]
pub struct ServiceContext {
    pub instance_id: String,
    pub config: Value,
    pub data_dir: PathBuf,
    pub graphs_dir: PathBuf,
    pub memory: Arc<MemoryStore>,
}

pub type ServiceFactory =
    Arc<dyn Fn(ServiceContext) -> anyhow::Result<Arc<dyn McpService>> + Send + Sync>;

pub struct CatalogEntry {
    pub id: &'static str,
    pub description: &'static str,
    factory: ServiceFactory,
}

/// Immutable registry of instantiable service types.
pub struct ServiceCatalog {
    entries: Vec<CatalogEntry>,
}

impl ServiceCatalog {
    /// The built-in type table.
    pub fn standard() -> Self {
        Self {
            entries: vec![
                CatalogEntry {
                    id: "python",
                    description: "Sandboxed Python execution with file CRUD and persistent sandboxes",
                    factory: Arc::new(|ctx| Ok(Arc::new(PythonService::new(ctx)?) as Arc<dyn McpService>)),
                },
                CatalogEntry {
                    id: "graph",
                    description: "CRUD and execution over persisted workflow graphs",
                    factory: Arc::new(|ctx| Ok(Arc::new(GraphService::new(ctx)?) as Arc<dyn McpService>)),
                },
                CatalogEntry {
                    id: "memory",
                    description: "Session memory operations exposed as tools",
                    factory: Arc::new(|ctx| Ok(Arc::new(MemoryService::new(ctx.memory)) as Arc<dyn McpService>)),
                },
            ],
        }
    }

    /// The process-wide catalog, created on first use.
    pub fn global() -> &'static Arc<ServiceCatalog> {
        static CATALOG: OnceLock<Arc<ServiceCatalog>> = OnceLock::new();
        CATALOG.get_or_init(|| Arc::new(Self::standard()))
    }

    pub fn types(&self) -> impl Iterator<Item = (&'static str, &'static str)> + '_ {
        self.entries.iter().map(|e| (e.id, e.description))
    }

    pub fn has_type(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    /// Instantiate a service of the named type.
    pub fn create(&self, type_id: &str, ctx: ServiceContext) -> anyhow::Result<Arc<dyn McpService>> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.id == type_id)
            .ok_or_else(|| anyhow::anyhow!("unknown service type: {type_id}"))?;
        (entry.factory)(ctx)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(dir: &tempfile::TempDir) -> ServiceContext {
        ServiceContext {
            instance_id: "t1".into(),
            config: json!({}),
            data_dir: dir.path().join("data"),
            graphs_dir: dir.path().join("graphs"),
            memory: Arc::new(MemoryStore::in_memory(100)),
        }
    }

    #[test]
    fn standard_catalog_has_all_builtin_types() {
        let c = ServiceCatalog::standard();
        for t in ["python", "graph", "memory"] {
            assert!(c.has_type(t), "missing builtin service type: {t}");
        }
    }

    #[test]
    fn create_unknown_type_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let c = ServiceCatalog::standard();
        assert!(c.create("nope", ctx(&dir)).is_err());
    }

    #[test]
    fn create_builds_each_type() {
        let dir = tempfile::TempDir::new().unwrap();
        let c = ServiceCatalog::standard();
        for t in ["python", "graph", "memory"] {
            let svc = c.create(t, ctx(&dir)).unwrap();
            assert!(!svc.name().is_empty());
        }
    }

    #[test]
    fn global_returns_same_instance() {
        let a = ServiceCatalog::global() as *const _;
        let b = ServiceCatalog::global() as *const _;
        assert_eq!(a, b);
    }
}
