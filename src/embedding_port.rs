//! Adapter: wraps the existing [`crate::embedding`] provider machinery behind
//! [`EmbeddingPort`] so C6 (vector retrieval) and C11 (backlog) consume it
//! polymorphically instead of calling `embed_texts` directly.

use async_trait::async_trait;

use crate::config::EmbeddingConfig;
use crate::embedding::{self, EmbeddingProvider};
use crate::ports::EmbeddingPort;

pub struct ConfiguredEmbedder {
    provider: Box<dyn EmbeddingProvider>,
    config: EmbeddingConfig,
    model_uri: String,
}

impl ConfiguredEmbedder {
    pub fn new(config: EmbeddingConfig) -> anyhow::Result<Self> {
        let provider = embedding::create_provider(&config)?;
        let model_uri = format!("{}:{}", config.provider, provider.model_name());
        Ok(Self {
            provider,
            config,
            model_uri,
        })
    }
}

#[async_trait]
impl EmbeddingPort for ConfiguredEmbedder {
    fn dimensions(&self) -> usize {
        self.provider.dims()
    }

    fn model_uri(&self) -> &str {
        &self.model_uri
    }

    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        embedding::embed_query(self.provider.as_ref(), &self.config, text).await
    }

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        embedding::embed_texts(self.provider.as_ref(), &self.config, texts).await
    }
}
