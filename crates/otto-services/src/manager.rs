// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The built-in service manager: an MCP service whose tools create, inspect,
//! and invoke further in-process services.
//!
//! One manager is attached to every session's pool under the fixed name
//! [`SERVICE_MANAGER_NAME`].  Instances it creates are registered in the
//! owning session's pool (as first-class tool servers) and tracked here so
//! they can be inspected and disposed.  The manager holds the pool weakly —
//! the pool owns the manager's connection, not the other way around.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use otto_mcp::{require_str, McpService, ServiceError, ToolDescriptor, ToolPool};
use otto_memory::MemoryStore;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::info;

use crate::catalog::{ServiceCatalog, ServiceContext};

/// Fixed pool name of the manager itself.
pub const SERVICE_MANAGER_NAME: &str = "mcp_service_manager";

struct Instance {
    service_type: String,
    config: Value,
    service: Arc<dyn McpService>,
}

pub struct ServiceManager {
    pool: Weak<ToolPool>,
    catalog: Arc<ServiceCatalog>,
    /// Root for instance-private data (`<session>/mcp/<instance_id>/`).
    mcp_dir: PathBuf,
    /// Session-shared graph store.
    graphs_dir: PathBuf,
    /// Session-shared memory store.
    memory: Arc<MemoryStore>,
    instances: Mutex<HashMap<String, Instance>>,
}

impl ServiceManager {
    pub fn new(
        pool: Weak<ToolPool>,
        catalog: Arc<ServiceCatalog>,
        mcp_dir: PathBuf,
        graphs_dir: PathBuf,
        memory: Arc<MemoryStore>,
    ) -> Self {
        Self {
            pool,
            catalog,
            mcp_dir,
            graphs_dir,
            memory,
            instances: Mutex::new(HashMap::new()),
        }
    }

    fn pool(&self) -> Result<Arc<ToolPool>, ServiceError> {
        self.pool
            .upgrade()
            .ok_or_else(|| ServiceError::execution("owning session pool is gone"))
    }

    async fn find(&self, id: &str) -> Result<Arc<dyn McpService>, ServiceError> {
        self.instances
            .lock()
            .await
            .get(id)
            .map(|i| Arc::clone(&i.service))
            .ok_or_else(|| ServiceError::execution(format!("no such service: {id}")))
    }
}

fn valid_instance_id(id: &str) -> bool {
    !id.is_empty()
        && id != SERVICE_MANAGER_NAME
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn object_schema(properties: Value, required: &[&str]) -> Value {
    json!({ "type": "object", "properties": properties, "required": required })
}

#[async_trait]
impl McpService for ServiceManager {
    fn name(&self) -> &str {
        SERVICE_MANAGER_NAME
    }

    async fn list_tools(&self) -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor {
                name: "service_list".into(),
                description: "List available service types and, optionally, running instances."
                    .into(),
                input_schema: object_schema(
                    json!({ "show_instances": { "type": "boolean" } }),
                    &[],
                ),
            },
            ToolDescriptor {
                name: "service_create".into(),
                description: "Instantiate a service of the named type and register it as a tool \
                              server under service_id."
                    .into(),
                input_schema: object_schema(
                    json!({
                        "service_type": { "type": "string" },
                        "service_id": { "type": "string" },
                        "config": { "type": "object" },
                    }),
                    &["service_type", "service_id"],
                ),
            },
            ToolDescriptor {
                name: "service_delete".into(),
                description: "Unregister and dispose a running service instance.".into(),
                input_schema: object_schema(
                    json!({ "service_id": { "type": "string" } }),
                    &["service_id"],
                ),
            },
            ToolDescriptor {
                name: "service_info".into(),
                description: "Type, config, and tool count of a running instance.".into(),
                input_schema: object_schema(
                    json!({ "service_id": { "type": "string" } }),
                    &["service_id"],
                ),
            },
            ToolDescriptor {
                name: "service_list_tools".into(),
                description: "Tool descriptors exposed by a running instance.".into(),
                input_schema: object_schema(
                    json!({ "service_id": { "type": "string" } }),
                    &["service_id"],
                ),
            },
            ToolDescriptor {
                name: "service_call".into(),
                description: "Invoke a tool on a running instance by name.".into(),
                input_schema: object_schema(
                    json!({
                        "service_id": { "type": "string" },
                        "tool_name": { "type": "string" },
                        "arguments": { "type": "object" },
                    }),
                    &["service_id", "tool_name"],
                ),
            },
        ]
    }

    async fn call_tool(&self, tool: &str, args: Value) -> Result<Value, ServiceError> {
        match tool {
            "service_list" => {
                let show_instances = args
                    .get("show_instances")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(true);
                let types: Vec<Value> = self
                    .catalog
                    .types()
                    .map(|(id, desc)| json!({ "type": id, "description": desc }))
                    .collect();
                let mut out = json!({ "types": types });
                if show_instances {
                    let instances = self.instances.lock().await;
                    let mut list: Vec<Value> = instances
                        .iter()
                        .map(|(id, i)| json!({ "service_id": id, "type": i.service_type }))
                        .collect();
                    list.sort_by(|a, b| {
                        a["service_id"]
                            .as_str()
                            .unwrap_or("")
                            .cmp(b["service_id"].as_str().unwrap_or(""))
                    });
                    out["instances"] = json!(list);
                }
                Ok(out)
            }
            "service_create" => {
                let service_type = require_str(&args, "service_type")?;
                let service_id = require_str(&args, "service_id")?;
                if !valid_instance_id(service_id) {
                    return Err(ServiceError::invalid(format!(
                        "illegal service id: {service_id}"
                    )));
                }
                if !self.catalog.has_type(service_type) {
                    return Err(ServiceError::invalid(format!(
                        "unknown service type: {service_type}"
                    )));
                }
                {
                    let instances = self.instances.lock().await;
                    if instances.contains_key(service_id) {
                        return Err(ServiceError::execution(format!(
                            "service already exists: {service_id}"
                        )));
                    }
                }
                let pool = self.pool()?;
                // A session-configured tool server may already hold this name.
                if pool.server_names().await.iter().any(|n| n == service_id) {
                    return Err(ServiceError::execution(format!(
                        "a tool server named '{service_id}' already exists in this session"
                    )));
                }
                let config = args.get("config").cloned().unwrap_or(json!({}));
                let service = self
                    .catalog
                    .create(
                        service_type,
                        ServiceContext {
                            instance_id: service_id.to_string(),
                            config: config.clone(),
                            data_dir: self.mcp_dir.join(service_id),
                            graphs_dir: self.graphs_dir.clone(),
                            memory: Arc::clone(&self.memory),
                        },
                    )
                    .map_err(|e| ServiceError::execution(e.to_string()))?;

                pool.add_in_process(service_id, Arc::clone(&service)).await;
                pool.start_server(service_id)
                    .await
                    .map_err(|e| ServiceError::execution(e.to_string()))?;

                let tool_count = service.list_tools().await.len();
                self.instances.lock().await.insert(
                    service_id.to_string(),
                    Instance {
                        service_type: service_type.to_string(),
                        config,
                        service,
                    },
                );
                info!(service_id, service_type, tool_count, "service instance created");
                Ok(json!({
                    "success": true,
                    "service_id": service_id,
                    "service_type": service_type,
                    "tools": tool_count,
                }))
            }
            "service_delete" => {
                let service_id = require_str(&args, "service_id")?;
                let existed = self.instances.lock().await.remove(service_id).is_some();
                if existed {
                    self.pool()?.remove(service_id).await;
                    info!(service_id, "service instance deleted");
                }
                Ok(json!({ "deleted": existed }))
            }
            "service_info" => {
                let service_id = require_str(&args, "service_id")?;
                let instances = self.instances.lock().await;
                let Some(i) = instances.get(service_id) else {
                    return Err(ServiceError::execution(format!(
                        "no such service: {service_id}"
                    )));
                };
                let tool_count = i.service.list_tools().await.len();
                Ok(json!({
                    "service_id": service_id,
                    "type": i.service_type,
                    "config": i.config,
                    "tools": tool_count,
                }))
            }
            "service_list_tools" => {
                let service_id = require_str(&args, "service_id")?;
                let service = self.find(service_id).await?;
                let tools = service.list_tools().await;
                serde_json::to_value(json!({ "tools": tools }))
                    .map_err(|e| ServiceError::execution(e.to_string()))
            }
            "service_call" => {
                let service_id = require_str(&args, "service_id")?;
                let tool_name = require_str(&args, "tool_name")?;
                let arguments = args.get("arguments").cloned().unwrap_or(json!({}));
                let service = self.find(service_id).await?;
                service.call_tool(tool_name, arguments).await
            }
            other => Err(ServiceError::UnknownTool(other.into())),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
