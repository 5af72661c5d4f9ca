//! HTTP-backed [`GenerationPort`] implementation for C4/C10, grounded on the
//! embedding module's OpenAI provider: reqwest client, exponential backoff
//! retry on 429/5xx, fail-fast on other 4xx.

use std::time::Duration;

use async_trait::async_trait;

use crate::ports::{GenerationParams, GenerationPort};

pub struct OpenAiGenerator {
    model: String,
    api_key: String,
    timeout_secs: u64,
    max_retries: u32,
}

impl OpenAiGenerator {
    pub fn new(model: impl Into<String>, timeout_secs: u64, max_retries: u32) -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            model: model.into(),
            api_key,
            timeout_secs,
            max_retries,
        })
    }
}

#[async_trait]
impl GenerationPort for OpenAiGenerator {
    fn model_uri(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, params: &GenerationParams) -> anyhow::Result<String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?;

        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
            "seed": params.seed,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = client
                .post("https://api.openai.com/v1/chat/completions")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_chat_response(&json);
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!(
                            "generation API error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    anyhow::bail!("generation API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("generation failed after retries")))
    }
}

fn parse_chat_response(json: &serde_json::Value) -> anyhow::Result<String> {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("invalid chat completion response: missing choices[0].message.content"))
}
