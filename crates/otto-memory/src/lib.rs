// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-session memory store.
//!
//! Records are kept in memory behind a read-write lock and persisted as one
//! JSON document under the session's `memory/` directory (single writer per
//! session, atomic write-temp-then-rename).  Search is keyword-based with
//! `relevance × importance × recency` ranking; a forgetting pass runs after
//! each store once the record cap is exceeded.

mod store;

pub use store::{
    MemoryKind, MemoryRecord, MemoryStats, MemoryStore, RecordUpdate, SearchHit,
};
