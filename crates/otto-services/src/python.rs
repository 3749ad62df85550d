// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Sandboxed Python execution service.
//!
//! Code runs in a `python3` subprocess under a runner script that executes
//! the supplied source against a whitelisted-builtins globals dict, with a
//! wall-clock timeout and captured stdio.  Named sandboxes persist
//! variables across calls by replaying the accumulated cell history (with
//! prior output suppressed) before the new cell.
//!
//! The service also exposes file CRUD scoped to its private `files/`
//! directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use otto_mcp::{optional_str, require_str, McpService, ServiceError, ToolDescriptor};
use serde_json::{json, Value};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

use crate::catalog::ServiceContext;

/// Default wall-clock cap for one execution.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Hard byte ceiling for combined stdout + stderr returned to the model.
const OUTPUT_LIMIT_BYTES: usize = 65_536;

/// The runner executed for every call.  Arguments: `[history_file] cell_file`.
/// Only the exec'd code sees the restricted globals; the runner itself runs
/// with full builtins so it can read its input files.
const RUNNER: &str = r#"import builtins, contextlib, io, sys

ALLOWED = [
    "abs", "all", "any", "bool", "bytes", "chr", "dict", "divmod",
    "enumerate", "filter", "float", "format", "frozenset", "hash", "hex",
    "int", "isinstance", "issubclass", "iter", "len", "list", "map", "max",
    "min", "next", "oct", "ord", "pow", "print", "range", "repr",
    "reversed", "round", "set", "slice", "sorted", "str", "sum", "tuple",
    "zip", "Exception", "ValueError", "TypeError", "KeyError", "IndexError",
    "ZeroDivisionError", "StopIteration", "ArithmeticError", "RuntimeError",
]
g = {"__builtins__": {k: getattr(builtins, k) for k in ALLOWED}}

paths = sys.argv[1:]
if len(paths) == 2:
    with open(paths[0]) as f:
        history = f.read()
    if history.strip():
        with contextlib.redirect_stdout(io.StringIO()), contextlib.redirect_stderr(io.StringIO()):
            exec(compile(history, "<history>", "exec"), g)
with open(paths[-1]) as f:
    cell = f.read()
exec(compile(cell, "<cell>", "exec"), g)
"#;

pub struct PythonService {
    data_dir: PathBuf,
    files_dir: PathBuf,
    runner_path: PathBuf,
    default_timeout: Duration,
    /// Named sandboxes: accumulated cell history, replayed before each call.
    sandboxes: Mutex<HashMap<String, Vec<String>>>,
}

impl PythonService {
    pub fn new(ctx: ServiceContext) -> anyhow::Result<Self> {
        let data_dir = ctx.data_dir;
        let files_dir = data_dir.join("files");
        std::fs::create_dir_all(&files_dir)
            .with_context(|| format!("creating {}", files_dir.display()))?;
        let runner_path = data_dir.join("runner.py");
        std::fs::write(&runner_path, RUNNER)
            .with_context(|| format!("writing {}", runner_path.display()))?;
        let default_timeout = ctx.config["timeout_secs"]
            .as_u64()
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        Ok(Self {
            data_dir,
            files_dir,
            runner_path,
            default_timeout,
            sandboxes: Mutex::new(HashMap::new()),
        })
    }

    /// Resolve a user-supplied relative path inside `files/`, rejecting
    /// absolute paths and traversal.
    fn resolve_file(&self, rel: &str) -> Result<PathBuf, ServiceError> {
        let p = Path::new(rel);
        if p.is_absolute()
            || p.components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(ServiceError::invalid(format!("illegal path: {rel}")));
        }
        Ok(self.files_dir.join(p))
    }

    async fn execute(
        &self,
        code: &str,
        sandbox: Option<&str>,
        timeout: Duration,
    ) -> Result<Value, ServiceError> {
        let exec_id = uuid::Uuid::new_v4().to_string();
        let cell_path = self.data_dir.join(format!("cell-{exec_id}.py"));
        tokio::fs::write(&cell_path, code)
            .await
            .map_err(|e| ServiceError::execution(format!("writing cell: {e}")))?;

        let history_path = if let Some(name) = sandbox {
            let sandboxes = self.sandboxes.lock().await;
            let Some(cells) = sandboxes.get(name) else {
                let _ = tokio::fs::remove_file(&cell_path).await;
                return Err(ServiceError::invalid(format!("no such sandbox: {name}")));
            };
            let path = self.data_dir.join(format!("history-{exec_id}.py"));
            tokio::fs::write(&path, cells.join("\n"))
                .await
                .map_err(|e| ServiceError::execution(format!("writing history: {e}")))?;
            Some(path)
        } else {
            None
        };

        let mut cmd = Command::new("python3");
        cmd.arg(&self.runner_path);
        if let Some(h) = &history_path {
            cmd.arg(h);
        }
        cmd.arg(&cell_path)
            .current_dir(&self.data_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(sandbox = ?sandbox, timeout_secs = timeout.as_secs(), "executing python cell");
        let result = tokio::time::timeout(timeout, cmd.output()).await;

        let _ = tokio::fs::remove_file(&cell_path).await;
        if let Some(h) = &history_path {
            let _ = tokio::fs::remove_file(h).await;
        }

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ServiceError::execution(format!("spawning python3: {e}"))),
            Err(_) => {
                return Err(ServiceError::execution(format!(
                    "execution timed out after {}s",
                    timeout.as_secs()
                )))
            }
        };

        let stdout = cap_output(&String::from_utf8_lossy(&output.stdout));
        let stderr = cap_output(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(ServiceError::execution(format!(
                "python exited with {}: {stderr}",
                output.status.code().unwrap_or(-1)
            )));
        }

        // A successful cell becomes part of its sandbox's history.
        if let Some(name) = sandbox {
            self.sandboxes
                .lock()
                .await
                .entry(name.to_string())
                .or_default()
                .push(code.to_string());
        }

        Ok(json!({ "stdout": stdout, "stderr": stderr, "exit_code": 0 }))
    }
}

/// Keep head and tail of oversized output with an omission marker.
fn cap_output(s: &str) -> String {
    if s.len() <= OUTPUT_LIMIT_BYTES {
        return s.to_string();
    }
    let half = OUTPUT_LIMIT_BYTES / 2;
    let mut head_end = half;
    while !s.is_char_boundary(head_end) {
        head_end -= 1;
    }
    let mut tail_start = s.len() - half;
    while !s.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    format!(
        "{}\n... [{} bytes omitted] ...\n{}",
        &s[..head_end],
        tail_start - head_end,
        &s[tail_start..]
    )
}

fn object_schema(properties: Value, required: &[&str]) -> Value {
    json!({ "type": "object", "properties": properties, "required": required })
}

#[async_trait]
impl McpService for PythonService {
    fn name(&self) -> &str {
        "python"
    }

    async fn list_tools(&self) -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor {
                name: "execute_code".into(),
                description: "Execute Python source in the sandbox. Pass 'sandbox' to run inside a \
                              named persistent environment whose variables survive across calls."
                    .into(),
                input_schema: object_schema(
                    json!({
                        "code": { "type": "string" },
                        "sandbox": { "type": "string" },
                        "timeout_secs": { "type": "integer", "minimum": 1 },
                    }),
                    &["code"],
                ),
            },
            ToolDescriptor {
                name: "create_sandbox".into(),
                description: "Create a named persistent sandbox environment.".into(),
                input_schema: object_schema(json!({ "name": { "type": "string" } }), &["name"]),
            },
            ToolDescriptor {
                name: "list_sandboxes".into(),
                description: "List persistent sandbox environments.".into(),
                input_schema: object_schema(json!({}), &[]),
            },
            ToolDescriptor {
                name: "delete_sandbox".into(),
                description: "Delete a persistent sandbox environment.".into(),
                input_schema: object_schema(json!({ "name": { "type": "string" } }), &["name"]),
            },
            ToolDescriptor {
                name: "write_file".into(),
                description: "Write a file in the service's private files directory.".into(),
                input_schema: object_schema(
                    json!({
                        "path": { "type": "string" },
                        "content": { "type": "string" },
                    }),
                    &["path", "content"],
                ),
            },
            ToolDescriptor {
                name: "read_file".into(),
                description: "Read a file from the service's private files directory.".into(),
                input_schema: object_schema(json!({ "path": { "type": "string" } }), &["path"]),
            },
            ToolDescriptor {
                name: "list_files".into(),
                description: "List files in the service's private files directory.".into(),
                input_schema: object_schema(json!({}), &[]),
            },
            ToolDescriptor {
                name: "delete_file".into(),
                description: "Delete a file from the service's private files directory.".into(),
                input_schema: object_schema(json!({ "path": { "type": "string" } }), &["path"]),
            },
        ]
    }

    async fn call_tool(&self, tool: &str, args: Value) -> Result<Value, ServiceError> {
        match tool {
            "execute_code" => {
                let code = require_str(&args, "code")?;
                let sandbox = optional_str(&args, "sandbox");
                let timeout = args
                    .get("timeout_secs")
                    .and_then(|v| v.as_u64())
                    .map(Duration::from_secs)
                    .unwrap_or(self.default_timeout);
                self.execute(code, sandbox, timeout).await
            }
            "create_sandbox" => {
                let name = require_str(&args, "name")?;
                let mut sandboxes = self.sandboxes.lock().await;
                if sandboxes.contains_key(name) {
                    return Err(ServiceError::execution(format!(
                        "sandbox already exists: {name}"
                    )));
                }
                sandboxes.insert(name.to_string(), Vec::new());
                Ok(json!({ "created": name }))
            }
            "list_sandboxes" => {
                let sandboxes = self.sandboxes.lock().await;
                let mut names: Vec<&String> = sandboxes.keys().collect();
                names.sort();
                Ok(json!({ "sandboxes": names }))
            }
            "delete_sandbox" => {
                let name = require_str(&args, "name")?;
                let removed = self.sandboxes.lock().await.remove(name).is_some();
                Ok(json!({ "deleted": removed }))
            }
            "write_file" => {
                let path = self.resolve_file(require_str(&args, "path")?)?;
                let content = require_str(&args, "content")?;
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| ServiceError::execution(e.to_string()))?;
                }
                tokio::fs::write(&path, content)
                    .await
                    .map_err(|e| ServiceError::execution(e.to_string()))?;
                Ok(json!({ "written": true, "bytes": content.len() }))
            }
            "read_file" => {
                let path = self.resolve_file(require_str(&args, "path")?)?;
                let content = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| ServiceError::execution(format!("reading file: {e}")))?;
                Ok(json!({ "content": content }))
            }
            "list_files" => {
                let mut names = Vec::new();
                let mut entries = tokio::fs::read_dir(&self.files_dir)
                    .await
                    .map_err(|e| ServiceError::execution(e.to_string()))?;
                while let Ok(Some(entry)) = entries.next_entry().await {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
                names.sort();
                Ok(json!({ "files": names }))
            }
            "delete_file" => {
                let path = self.resolve_file(require_str(&args, "path")?)?;
                let deleted = tokio::fs::remove_file(&path).await.is_ok();
                Ok(json!({ "deleted": deleted }))
            }
            other => Err(ServiceError::UnknownTool(other.into())),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
