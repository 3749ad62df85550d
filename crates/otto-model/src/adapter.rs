// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use std::fmt::Debug;
use std::pin::Pin;

use crate::{ChatRequest, ProviderEvent};

pub type ProviderStream = Pin<Box<dyn Stream<Item = anyhow::Result<ProviderEvent>> + Send>>;

/// Uniform streaming interface over upstream model providers.
///
/// Implementations convert internal [`crate::Message`] and
/// [`crate::ToolSchema`] records into their wire format and map incoming
/// stream chunks back into [`ProviderEvent`]s.  The engine never inspects
/// message text to find tool calls — structured begin/delta/end events are
/// the only channel.
#[async_trait]
pub trait ModelAdapter: Send + Sync + Debug {
    /// Driver identifier for status display and logs.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Send a chat request and return the streaming response.
    ///
    /// The stream terminates with [`ProviderEvent::Done`] on success; an
    /// `Err` item is a provider failure and ends the stream.
    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<ProviderStream>;
}
