// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod registry;
mod adapter;
mod anthropic;
mod local;
mod mock;
mod openai_compat;
mod sse;
mod types;

pub use adapter::{ModelAdapter, ProviderStream};
pub use anthropic::AnthropicAdapter;
pub use local::LocalHttpAdapter;
pub use mock::{MockAdapter, ScriptedMockAdapter};
pub use openai_compat::OpenAiCompatAdapter;
pub use registry::{get_driver, list_drivers, DriverMeta};
pub use types::*;

use anyhow::bail;
use otto_config::ProviderSettings;
use std::sync::Arc;

/// Construct a shared [`ModelAdapter`] from provider settings.
///
/// Selects the driver by `settings.provider`.  Any driver registered with an
/// OpenAI-compatible default base URL routes through the compat adapter, so
/// gateways and local runners need no dedicated code.  Run
/// `otto list-providers` to see recognised ids.
pub fn from_settings(settings: &ProviderSettings) -> anyhow::Result<Arc<dyn ModelAdapter>> {
    let meta = registry::get_driver(&settings.provider);
    let key = settings.resolve_api_key(meta.and_then(|m| m.default_api_key_env));
    let base_url = settings
        .base_url
        .clone()
        .or_else(|| meta.and_then(|m| m.default_base_url.map(str::to_string)));

    match settings.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicAdapter::new(
            settings.model.clone(),
            key,
            settings.base_url.clone(),
            settings.max_tokens,
            settings.temperature,
        ))),
        "local" => {
            let Some(url) = base_url else {
                bail!("provider 'local' requires base_url");
            };
            Ok(Arc::new(LocalHttpAdapter::new(
                settings.model.clone(),
                url,
                settings.max_tokens,
                settings.temperature,
            )))
        }
        "mock" => Ok(Arc::new(MockAdapter)),
        id => {
            // Everything else speaks the OpenAI wire format.
            let Some(meta) = meta else {
                let known: Vec<&str> = registry::list_drivers().iter().map(|d| d.id).collect();
                bail!("unknown model provider '{id}' (known: {})", known.join(", "));
            };
            if meta.requires_api_key && key.is_none() {
                let env = meta.default_api_key_env.unwrap_or("the provider API key");
                bail!("provider '{id}' requires an API key; set {env} or api_key in settings");
            }
            let Some(url) = base_url else {
                bail!("provider '{id}' requires base_url");
            };
            Ok(Arc::new(OpenAiCompatAdapter::new(
                id.to_string(),
                settings.model.clone(),
                key,
                url,
                settings.max_tokens,
                settings.temperature,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(provider: &str) -> ProviderSettings {
        ProviderSettings {
            provider: provider.into(),
            model: "m".into(),
            api_key_env: None,
            api_key: Some("k".into()),
            base_url: Some("http://localhost:9/v1".into()),
            max_tokens: None,
            temperature: None,
        }
    }

    #[test]
    fn from_settings_builds_each_known_driver() {
        for id in ["openai", "anthropic", "local", "openrouter", "ollama", "mock"] {
            let a = from_settings(&settings(id)).unwrap();
            assert_eq!(a.model_name().is_empty(), false, "driver {id}");
        }
    }

    #[test]
    fn from_settings_rejects_unknown_driver() {
        let err = from_settings(&settings("frobnicator")).unwrap_err();
        assert!(err.to_string().contains("unknown model provider"));
    }

    #[test]
    fn local_requires_base_url() {
        let mut s = settings("local");
        s.base_url = None;
        assert!(from_settings(&s).is_err());
    }

    #[test]
    fn keyed_driver_without_key_is_rejected() {
        let mut s = settings("openrouter");
        s.api_key = None;
        s.api_key_env = Some("OTTO_TEST_DEFINITELY_UNSET_KEY".into());
        // The driver's own env fallback may be set in a dev environment;
        // only assert when it is absent.
        if std::env::var("OPENROUTER_API_KEY").is_err() {
            assert!(from_settings(&s).is_err());
        }
    }
}
