// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! SSE line reassembly shared by the HTTP adapters.
//!
//! Provider responses arrive as a byte stream whose chunk boundaries do not
//! respect SSE record boundaries: a `data:` line can be split across TCP
//! chunks, and one chunk can carry many lines.  A carry buffer is threaded
//! through the stream so only complete lines are surfaced.

use futures::{Stream, StreamExt};

/// Turn a provider byte stream into a stream of complete SSE `data:` payloads.
///
/// Comment lines, blank separators, and non-`data:` fields are dropped.
/// A trailing unterminated fragment is held back until its newline arrives.
pub(crate) fn data_lines<B, E>(
    bytes: impl Stream<Item = Result<B, E>> + Send + 'static,
) -> impl Stream<Item = anyhow::Result<String>> + Send
where
    B: AsRef<[u8]>,
    E: std::error::Error + Send + Sync + 'static,
{
    bytes
        .scan(String::new(), |buf, chunk| {
            let mut out: Vec<anyhow::Result<String>> = Vec::new();
            match chunk {
                Ok(b) => {
                    buf.push_str(&String::from_utf8_lossy(b.as_ref()));
                    while let Some(pos) = buf.find('\n') {
                        let line = buf[..pos].trim_end_matches('\r').to_string();
                        buf.drain(..=pos);
                        if let Some(data) = line.strip_prefix("data:") {
                            // The space after the colon is optional per SSE.
                            out.push(Ok(data.trim().to_string()));
                        }
                    }
                }
                Err(e) => out.push(Err(anyhow::anyhow!(e))),
            }
            futures::future::ready(Some(out))
        })
        .flat_map(futures::stream::iter)
}
