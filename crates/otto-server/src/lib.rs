// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! HTTP shell: maps the engine's typed operations onto the REST + SSE
//! surface.  The engine stays transport-agnostic; everything HTTP-shaped
//! lives here.

mod routes;

pub use routes::{router, serve, serve_until};
