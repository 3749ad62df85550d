// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Memory operations exposed as MCP tools against the session's store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use otto_mcp::{require_str, McpService, ServiceError, ToolDescriptor};
use otto_memory::{MemoryKind, MemoryRecord, MemoryStore, RecordUpdate};
use serde_json::{json, Value};

pub struct MemoryService {
    store: Arc<MemoryStore>,
}

impl MemoryService {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

fn record_json(r: &MemoryRecord) -> Value {
    json!({
        "id": r.id,
        "kind": r.kind.to_string(),
        "content": r.content,
        "importance": r.importance,
        "created_at": r.created_at.to_rfc3339(),
        "last_accessed_at": r.last_accessed_at.to_rfc3339(),
        "access_count": r.access_count,
        "metadata": r.metadata,
    })
}

fn object_schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

#[async_trait]
impl McpService for MemoryService {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list_tools(&self) -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor {
                name: "memory_store".into(),
                description: "Store a memory record. kind is one of short_term, long_term, episodic, semantic.".into(),
                input_schema: object_schema(
                    json!({
                        "content": { "type": "string" },
                        "kind": { "type": "string", "enum": ["short_term", "long_term", "episodic", "semantic"] },
                        "importance": { "type": "number", "minimum": 0.0, "maximum": 1.0 },
                        "metadata": { "type": "object" },
                    }),
                    &["content"],
                ),
            },
            ToolDescriptor {
                name: "memory_search".into(),
                description: "Keyword search over stored memories, ranked by relevance, importance, and recency.".into(),
                input_schema: object_schema(
                    json!({
                        "query": { "type": "string" },
                        "limit": { "type": "integer", "minimum": 1 },
                    }),
                    &["query"],
                ),
            },
            ToolDescriptor {
                name: "memory_get_recent".into(),
                description: "Most recently created memory records.".into(),
                input_schema: object_schema(json!({ "limit": { "type": "integer" } }), &[]),
            },
            ToolDescriptor {
                name: "memory_get_important".into(),
                description: "Highest-importance memory records.".into(),
                input_schema: object_schema(
                    json!({
                        "limit": { "type": "integer" },
                        "min_importance": { "type": "number" },
                    }),
                    &[],
                ),
            },
            ToolDescriptor {
                name: "memory_update".into(),
                description: "Update content, importance, or metadata of a record.".into(),
                input_schema: object_schema(
                    json!({
                        "id": { "type": "string" },
                        "content": { "type": "string" },
                        "importance": { "type": "number" },
                        "metadata": { "type": "object" },
                    }),
                    &["id"],
                ),
            },
            ToolDescriptor {
                name: "memory_delete".into(),
                description: "Delete a memory record by id.".into(),
                input_schema: object_schema(json!({ "id": { "type": "string" } }), &["id"]),
            },
            ToolDescriptor {
                name: "memory_consolidate".into(),
                description: "Promote short-term records that earned long-term status.".into(),
                input_schema: object_schema(json!({}), &[]),
            },
            ToolDescriptor {
                name: "memory_stats".into(),
                description: "Record counts and importance statistics.".into(),
                input_schema: object_schema(json!({}), &[]),
            },
        ]
    }

    async fn call_tool(&self, tool: &str, args: Value) -> Result<Value, ServiceError> {
        match tool {
            "memory_store" => {
                let content = require_str(&args, "content")?;
                let kind = match args.get("kind").and_then(|v| v.as_str()) {
                    Some(k) => k
                        .parse::<MemoryKind>()
                        .map_err(|e| ServiceError::invalid(e.to_string()))?,
                    None => MemoryKind::ShortTerm,
                };
                let importance = args.get("importance").and_then(|v| v.as_f64()).unwrap_or(0.5);
                let metadata: HashMap<String, Value> = args
                    .get("metadata")
                    .and_then(|v| v.as_object())
                    .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default();
                let record = self
                    .store
                    .store(kind, content, importance, metadata)
                    .await
                    .map_err(|e| ServiceError::execution(e.to_string()))?;
                Ok(record_json(&record))
            }
            "memory_search" => {
                let query = require_str(&args, "query")?;
                let limit = args.get("limit").and_then(|v| v.as_u64()).unwrap_or(10) as usize;
                let hits = self.store.search(query, limit).await;
                Ok(json!({
                    "hits": hits
                        .iter()
                        .map(|h| {
                            let mut v = record_json(&h.record);
                            v["score"] = json!(h.score);
                            v
                        })
                        .collect::<Vec<_>>(),
                }))
            }
            "memory_get_recent" => {
                let limit = args.get("limit").and_then(|v| v.as_u64()).unwrap_or(10) as usize;
                let records = self.store.get_recent(limit).await;
                Ok(json!({ "records": records.iter().map(record_json).collect::<Vec<_>>() }))
            }
            "memory_get_important" => {
                let limit = args.get("limit").and_then(|v| v.as_u64()).unwrap_or(10) as usize;
                let min = args
                    .get("min_importance")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0);
                let records = self.store.get_important(limit, min).await;
                Ok(json!({ "records": records.iter().map(record_json).collect::<Vec<_>>() }))
            }
            "memory_update" => {
                let id = require_str(&args, "id")?;
                let update = RecordUpdate {
                    content: args.get("content").and_then(|v| v.as_str()).map(String::from),
                    importance: args.get("importance").and_then(|v| v.as_f64()),
                    metadata: args
                        .get("metadata")
                        .and_then(|v| v.as_object())
                        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
                };
                match self
                    .store
                    .update(id, update)
                    .await
                    .map_err(|e| ServiceError::execution(e.to_string()))?
                {
                    Some(r) => Ok(record_json(&r)),
                    None => Err(ServiceError::execution(format!("no such record: {id}"))),
                }
            }
            "memory_delete" => {
                let id = require_str(&args, "id")?;
                let deleted = self
                    .store
                    .delete(id)
                    .await
                    .map_err(|e| ServiceError::execution(e.to_string()))?;
                Ok(json!({ "deleted": deleted }))
            }
            "memory_consolidate" => {
                let promoted = self
                    .store
                    .consolidate()
                    .await
                    .map_err(|e| ServiceError::execution(e.to_string()))?;
                Ok(json!({ "promoted": promoted }))
            }
            "memory_stats" => {
                let stats = self.store.stats().await;
                serde_json::to_value(&stats).map_err(|e| ServiceError::execution(e.to_string()))
            }
            other => Err(ServiceError::UnknownTool(other.into())),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
