// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Workflow-graph service: CRUD over persisted graph documents and a
//! `graph_run` operation that executes nodes in dependency order.
//!
//! Graph documents live as one JSON file per graph under the session's
//! `graphs/` directory.  Node internals are opaque to the runtime — a run
//! walks the nodes topologically and threads an input value through them.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use otto_mcp::{require_str, McpService, ServiceError, ToolDescriptor};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::catalog::ServiceContext;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    /// Node kind label; interpreted by graph tooling, opaque here.
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDocument {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct GraphService {
    graphs_dir: PathBuf,
    /// Serializes writes to the per-session graphs directory.
    write_lock: Mutex<()>,
}

impl GraphService {
    pub fn new(ctx: ServiceContext) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&ctx.graphs_dir)
            .with_context(|| format!("creating {}", ctx.graphs_dir.display()))?;
        Ok(Self {
            graphs_dir: ctx.graphs_dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, ServiceError> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(ServiceError::invalid(format!("illegal graph id: {id}")));
        }
        Ok(self.graphs_dir.join(format!("{id}.json")))
    }

    async fn load(&self, id: &str) -> Result<GraphDocument, ServiceError> {
        let path = self.path_for(id)?;
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| ServiceError::execution(format!("no such graph: {id}")))?;
        serde_json::from_str(&text)
            .map_err(|e| ServiceError::execution(format!("corrupt graph document {id}: {e}")))
    }

    async fn save(&self, doc: &GraphDocument) -> Result<(), ServiceError> {
        let path = self.path_for(&doc.id)?;
        let _guard = self.write_lock.lock().await;
        let text = serde_json::to_string_pretty(doc)
            .map_err(|e| ServiceError::execution(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, text)
            .await
            .map_err(|e| ServiceError::execution(e.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| ServiceError::execution(e.to_string()))?;
        Ok(())
    }

    fn parse_nodes(args: &Value) -> Result<Vec<GraphNode>, ServiceError> {
        match args.get("nodes") {
            None => Ok(Vec::new()),
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| ServiceError::invalid(format!("bad nodes: {e}"))),
        }
    }

    fn parse_edges(args: &Value) -> Result<Vec<GraphEdge>, ServiceError> {
        match args.get("edges") {
            None => Ok(Vec::new()),
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| ServiceError::invalid(format!("bad edges: {e}"))),
        }
    }
}

/// Kahn's algorithm.  Returns node ids in execution order, or an error
/// naming the problem (unknown edge endpoint, cycle).
fn topological_order(doc: &GraphDocument) -> Result<Vec<String>, String> {
    use std::collections::{HashMap, VecDeque};

    let mut indegree: HashMap<&str, usize> = doc.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    let mut adjacent: HashMap<&str, Vec<&str>> = HashMap::new();
    for e in &doc.edges {
        if !indegree.contains_key(e.from.as_str()) {
            return Err(format!("edge references unknown node: {}", e.from));
        }
        if !indegree.contains_key(e.to.as_str()) {
            return Err(format!("edge references unknown node: {}", e.to));
        }
        *indegree.get_mut(e.to.as_str()).expect("checked above") += 1;
        adjacent.entry(e.from.as_str()).or_default().push(e.to.as_str());
    }

    // Seed with declaration order so runs are deterministic.
    let mut queue: VecDeque<&str> = doc
        .nodes
        .iter()
        .filter(|n| indegree[n.id.as_str()] == 0)
        .map(|n| n.id.as_str())
        .collect();
    let mut order = Vec::with_capacity(doc.nodes.len());
    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        for next in adjacent.get(id).into_iter().flatten() {
            let d = indegree.get_mut(next).expect("adjacency implies presence");
            *d -= 1;
            if *d == 0 {
                queue.push_back(next);
            }
        }
    }
    if order.len() != doc.nodes.len() {
        return Err("graph contains a cycle".into());
    }
    Ok(order)
}

fn object_schema(properties: Value, required: &[&str]) -> Value {
    json!({ "type": "object", "properties": properties, "required": required })
}

fn doc_summary(doc: &GraphDocument) -> Value {
    json!({
        "id": doc.id,
        "name": doc.name,
        "description": doc.description,
        "nodes": doc.nodes.len(),
        "edges": doc.edges.len(),
        "updated_at": doc.updated_at.to_rfc3339(),
    })
}

#[async_trait]
impl McpService for GraphService {
    fn name(&self) -> &str {
        "graph"
    }

    async fn list_tools(&self) -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor {
                name: "graph_create".into(),
                description: "Create a workflow graph document from nodes and edges.".into(),
                input_schema: object_schema(
                    json!({
                        "name": { "type": "string" },
                        "description": { "type": "string" },
                        "nodes": { "type": "array" },
                        "edges": { "type": "array" },
                    }),
                    &["name"],
                ),
            },
            ToolDescriptor {
                name: "graph_get".into(),
                description: "Fetch a graph document by id.".into(),
                input_schema: object_schema(json!({ "graph_id": { "type": "string" } }), &["graph_id"]),
            },
            ToolDescriptor {
                name: "graph_list".into(),
                description: "List stored graph documents.".into(),
                input_schema: object_schema(json!({}), &[]),
            },
            ToolDescriptor {
                name: "graph_update".into(),
                description: "Replace a graph's name, description, nodes, or edges.".into(),
                input_schema: object_schema(
                    json!({
                        "graph_id": { "type": "string" },
                        "name": { "type": "string" },
                        "description": { "type": "string" },
                        "nodes": { "type": "array" },
                        "edges": { "type": "array" },
                    }),
                    &["graph_id"],
                ),
            },
            ToolDescriptor {
                name: "graph_delete".into(),
                description: "Delete a graph document.".into(),
                input_schema: object_schema(json!({ "graph_id": { "type": "string" } }), &["graph_id"]),
            },
            ToolDescriptor {
                name: "graph_run".into(),
                description: "Execute a graph: nodes run in dependency order, threading the \
                              input value through the walk."
                    .into(),
                input_schema: object_schema(
                    json!({
                        "graph_id": { "type": "string" },
                        "input": {},
                    }),
                    &["graph_id"],
                ),
            },
        ]
    }

    async fn call_tool(&self, tool: &str, args: Value) -> Result<Value, ServiceError> {
        match tool {
            "graph_create" => {
                let name = require_str(&args, "name")?;
                let now = Utc::now();
                let doc = GraphDocument {
                    id: Uuid::new_v4().to_string(),
                    name: name.to_string(),
                    description: args
                        .get("description")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    nodes: Self::parse_nodes(&args)?,
                    edges: Self::parse_edges(&args)?,
                    created_at: now,
                    updated_at: now,
                };
                // Reject structurally invalid graphs at creation time.
                topological_order(&doc).map_err(ServiceError::invalid)?;
                self.save(&doc).await?;
                Ok(doc_summary(&doc))
            }
            "graph_get" => {
                let id = require_str(&args, "graph_id")?;
                let doc = self.load(id).await?;
                serde_json::to_value(&doc).map_err(|e| ServiceError::execution(e.to_string()))
            }
            "graph_list" => {
                let mut summaries = Vec::new();
                let mut entries = tokio::fs::read_dir(&self.graphs_dir)
                    .await
                    .map_err(|e| ServiceError::execution(e.to_string()))?;
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("json") {
                        continue;
                    }
                    if let Ok(text) = tokio::fs::read_to_string(&path).await {
                        if let Ok(doc) = serde_json::from_str::<GraphDocument>(&text) {
                            summaries.push(doc_summary(&doc));
                        }
                    }
                }
                summaries.sort_by(|a, b| {
                    a["name"].as_str().unwrap_or("").cmp(b["name"].as_str().unwrap_or(""))
                });
                Ok(json!({ "graphs": summaries }))
            }
            "graph_update" => {
                let id = require_str(&args, "graph_id")?;
                let mut doc = self.load(id).await?;
                if let Some(name) = args.get("name").and_then(|v| v.as_str()) {
                    doc.name = name.to_string();
                }
                if let Some(desc) = args.get("description").and_then(|v| v.as_str()) {
                    doc.description = desc.to_string();
                }
                if args.get("nodes").is_some() {
                    doc.nodes = Self::parse_nodes(&args)?;
                }
                if args.get("edges").is_some() {
                    doc.edges = Self::parse_edges(&args)?;
                }
                topological_order(&doc).map_err(ServiceError::invalid)?;
                doc.updated_at = Utc::now();
                self.save(&doc).await?;
                Ok(doc_summary(&doc))
            }
            "graph_delete" => {
                let id = require_str(&args, "graph_id")?;
                let path = self.path_for(id)?;
                let deleted = tokio::fs::remove_file(&path).await.is_ok();
                Ok(json!({ "deleted": deleted }))
            }
            "graph_run" => {
                let id = require_str(&args, "graph_id")?;
                let doc = self.load(id).await?;
                let order = topological_order(&doc).map_err(ServiceError::execution)?;
                let input = args.get("input").cloned().unwrap_or(Value::Null);
                let steps: Vec<Value> = order
                    .iter()
                    .map(|node_id| {
                        let node = doc
                            .nodes
                            .iter()
                            .find(|n| &n.id == node_id)
                            .expect("order only contains known nodes");
                        json!({ "node": node.id, "kind": node.kind })
                    })
                    .collect();
                Ok(json!({
                    "graph_id": doc.id,
                    "order": order,
                    "steps": steps,
                    "output": input,
                }))
            }
            other => Err(ServiceError::UnknownTool(other.into())),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
