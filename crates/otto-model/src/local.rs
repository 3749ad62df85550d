// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;

use crate::{adapter::ProviderStream, openai_compat::OpenAiCompatAdapter, ChatRequest, ModelAdapter};

/// Driver for a self-hosted chat+stream endpoint.
///
/// Local servers (llama.cpp, vLLM, text-generation-inference front ends)
/// expose the OpenAI chat-completions shape, so this wraps the compat driver
/// with no authentication and reports itself as `local`.  Servers that omit
/// optional stream fields (ids, finish_reason) are already tolerated by the
/// compat driver's chunk tracker.
#[derive(Debug)]
pub struct LocalHttpAdapter {
    inner: OpenAiCompatAdapter,
}

impl LocalHttpAdapter {
    pub fn new(
        model: impl Into<String>,
        base_url: impl Into<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Self {
        Self {
            inner: OpenAiCompatAdapter::new("local", model, None, base_url, max_tokens, temperature),
        }
    }
}

#[async_trait]
impl crate::ModelAdapter for LocalHttpAdapter {
    fn name(&self) -> &str {
        "local"
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<ProviderStream> {
        self.inner.chat_stream(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ModelAdapter;

    #[test]
    fn reports_local_driver_and_wrapped_model() {
        let a = LocalHttpAdapter::new("llama3.2", "http://localhost:8080/v1", None, None);
        assert_eq!(a.name(), "local");
        assert_eq!(a.model_name(), "llama3.2");
    }
}
