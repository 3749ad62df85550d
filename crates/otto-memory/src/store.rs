// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Promotion thresholds: a short-term record becomes long-term once it has
/// been accessed this often or was stored with this importance.
const PROMOTE_ACCESS_COUNT: u32 = 3;
const PROMOTE_IMPORTANCE: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    ShortTerm,
    LongTerm,
    Episodic,
    Semantic,
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ShortTerm => "short_term",
            Self::LongTerm => "long_term",
            Self::Episodic => "episodic",
            Self::Semantic => "semantic",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for MemoryKind {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "short_term" | "short-term" => Ok(Self::ShortTerm),
            "long_term" | "long-term" => Ok(Self::LongTerm),
            "episodic" => Ok(Self::Episodic),
            "semantic" => Ok(Self::Semantic),
            other => anyhow::bail!("unknown memory kind: {other}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub kind: MemoryKind,
    pub content: String,
    /// Relative importance in `[0, 1]`.
    pub importance: f64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u32,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// One search result with its ranking score.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub record: MemoryRecord,
    pub score: f64,
}

/// Partial update applied by `update`.
#[derive(Debug, Clone, Default)]
pub struct RecordUpdate {
    pub content: Option<String>,
    pub importance: Option<f64>,
    pub metadata: Option<HashMap<String, Value>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub total: usize,
    pub by_kind: HashMap<String, usize>,
    pub average_importance: f64,
    pub cap: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    records: Vec<MemoryRecord>,
}

/// The per-session memory store.
pub struct MemoryStore {
    /// `None` for a purely in-memory store (tests, memory disabled).
    path: Option<PathBuf>,
    cap: usize,
    records: RwLock<HashMap<String, MemoryRecord>>,
}

impl MemoryStore {
    /// In-memory store with the given record cap.
    pub fn in_memory(cap: usize) -> Self {
        Self {
            path: None,
            cap,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Open (or create) the store persisted at `dir/records.json`.
    pub fn open(dir: impl Into<PathBuf>, cap: usize) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating memory dir {}", dir.display()))?;
        let path = dir.join("records.json");
        let records = if path.is_file() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let file: StoreFile = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            file.records.into_iter().map(|r| (r.id.clone(), r)).collect()
        } else {
            HashMap::new()
        };
        Ok(Self {
            path: Some(path),
            cap,
            records: RwLock::new(records),
        })
    }

    /// Store a new record and return it.  Importance is clamped to `[0, 1]`.
    /// Runs the forgetting pass when the cap is exceeded.
    pub async fn store(
        &self,
        kind: MemoryKind,
        content: impl Into<String>,
        importance: f64,
        metadata: HashMap<String, Value>,
    ) -> anyhow::Result<MemoryRecord> {
        let now = Utc::now();
        let record = MemoryRecord {
            id: Uuid::new_v4().to_string(),
            kind,
            content: content.into(),
            importance: importance.clamp(0.0, 1.0),
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            metadata,
        };
        {
            let mut records = self.records.write().await;
            records.insert(record.id.clone(), record.clone());
            if records.len() > self.cap {
                forget_lowest(&mut records, self.cap);
            }
        }
        self.persist().await?;
        Ok(record)
    }

    /// Fetch one record by id, touching its access statistics.
    pub async fn get(&self, id: &str) -> Option<MemoryRecord> {
        let found = {
            let mut records = self.records.write().await;
            records.get_mut(id).map(|r| {
                r.access_count += 1;
                r.last_accessed_at = Utc::now();
                r.clone()
            })
        };
        if found.is_some() {
            if let Err(e) = self.persist().await {
                warn!(error = %e, "memory persist after access failed");
            }
        }
        found
    }

    /// Keyword search over record content.
    ///
    /// Ranking: `score = relevance × importance × recency_weight`, where
    /// relevance is the fraction of query terms found in the content and
    /// recency decays with days since last access.  Hits have their access
    /// statistics touched.
    pub async fn search(&self, query: &str, limit: usize) -> Vec<SearchHit> {
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        if terms.is_empty() || limit == 0 {
            return Vec::new();
        }

        let now = Utc::now();
        let mut hits: Vec<SearchHit> = Vec::new();
        {
            let records = self.records.read().await;
            for r in records.values() {
                let haystack = r.content.to_lowercase();
                let matched = terms.iter().filter(|t| haystack.contains(*t)).count();
                if matched == 0 {
                    continue;
                }
                let relevance = matched as f64 / terms.len() as f64;
                let score = relevance * r.importance.max(0.05) * recency_weight(now, r);
                hits.push(SearchHit {
                    record: r.clone(),
                    score,
                });
            }
        }
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);

        // Touch access statistics for the returned hits.
        {
            let mut records = self.records.write().await;
            for hit in &hits {
                if let Some(r) = records.get_mut(&hit.record.id) {
                    r.access_count += 1;
                    r.last_accessed_at = now;
                }
            }
        }
        if let Err(e) = self.persist().await {
            warn!(error = %e, "memory persist after search failed");
        }
        hits
    }

    /// Most recently created records.
    pub async fn get_recent(&self, limit: usize) -> Vec<MemoryRecord> {
        let records = self.records.read().await;
        let mut all: Vec<MemoryRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all.truncate(limit);
        all
    }

    /// Highest-importance records.
    pub async fn get_important(&self, limit: usize, min_importance: f64) -> Vec<MemoryRecord> {
        let records = self.records.read().await;
        let mut all: Vec<MemoryRecord> = records
            .values()
            .filter(|r| r.importance >= min_importance)
            .cloned()
            .collect();
        all.sort_by(|a, b| {
            b.importance
                .partial_cmp(&a.importance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        all.truncate(limit);
        all
    }

    /// Apply a partial update.  Returns the updated record or `None` when
    /// the id is unknown.
    pub async fn update(&self, id: &str, update: RecordUpdate) -> anyhow::Result<Option<MemoryRecord>> {
        let updated = {
            let mut records = self.records.write().await;
            records.get_mut(id).map(|r| {
                if let Some(content) = update.content {
                    r.content = content;
                }
                if let Some(importance) = update.importance {
                    r.importance = importance.clamp(0.0, 1.0);
                }
                if let Some(metadata) = update.metadata {
                    r.metadata.extend(metadata);
                }
                r.clone()
            })
        };
        if updated.is_some() {
            self.persist().await?;
        }
        Ok(updated)
    }

    /// Delete a record.  Returns whether it existed.
    pub async fn delete(&self, id: &str) -> anyhow::Result<bool> {
        let removed = self.records.write().await.remove(id).is_some();
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Promote short-term records that earned long-term status.
    /// Returns the number of promoted records.
    pub async fn consolidate(&self) -> anyhow::Result<usize> {
        let promoted = {
            let mut records = self.records.write().await;
            let mut promoted = 0;
            for r in records.values_mut() {
                if r.kind == MemoryKind::ShortTerm
                    && (r.access_count >= PROMOTE_ACCESS_COUNT
                        || r.importance >= PROMOTE_IMPORTANCE)
                {
                    r.kind = MemoryKind::LongTerm;
                    promoted += 1;
                }
            }
            promoted
        };
        if promoted > 0 {
            self.persist().await?;
            debug!(promoted, "memory consolidation promoted records");
        }
        Ok(promoted)
    }

    pub async fn stats(&self) -> MemoryStats {
        let records = self.records.read().await;
        let total = records.len();
        let mut by_kind: HashMap<String, usize> = HashMap::new();
        let mut importance_sum = 0.0;
        for r in records.values() {
            *by_kind.entry(r.kind.to_string()).or_default() += 1;
            importance_sum += r.importance;
        }
        MemoryStats {
            total,
            by_kind,
            average_importance: if total > 0 {
                importance_sum / total as f64
            } else {
                0.0
            },
            cap: self.cap,
        }
    }

    /// Write the store to disk (temp file + rename).  A no-op for
    /// in-memory stores.
    async fn persist(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = {
            let records = self.records.read().await;
            StoreFile {
                records: records.values().cloned().collect(),
            }
        };
        let text = serde_json::to_string_pretty(&file)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, text).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("renaming to {}", path.display()))?;
        Ok(())
    }
}

/// Decay factor based on days since last access: 1.0 when fresh, halving
/// roughly every day of inactivity.
fn recency_weight(now: DateTime<Utc>, r: &MemoryRecord) -> f64 {
    let age_days = (now - r.last_accessed_at).num_seconds().max(0) as f64 / 86_400.0;
    1.0 / (1.0 + age_days)
}

/// Evict the lowest-retention records until `cap` holds.
///
/// Retention favors importance, then usage, then freshness.  Long-term
/// records are scored the same way — a long-term record that is never
/// accessed eventually loses to fresher material.
fn forget_lowest(records: &mut HashMap<String, MemoryRecord>, cap: usize) {
    let now = Utc::now();
    let mut scored: Vec<(String, f64)> = records
        .values()
        .map(|r| {
            let usage = f64::from(r.access_count.min(10)) / 10.0;
            let score = r.importance * 0.5 + usage * 0.3 + recency_weight(now, r) * 0.2;
            (r.id.clone(), score)
        })
        .collect();
    scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    let excess = records.len().saturating_sub(cap);
    for (id, score) in scored.into_iter().take(excess) {
        debug!(%id, score, "forgetting memory record");
        records.remove(&id);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
