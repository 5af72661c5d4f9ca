//! Query expansion (C4): LLM-driven lexical/semantic variants and a HyDE
//! passage, with deterministic decoding, a pluggable write-through cache,
//! and graceful degradation to `None` on any failure.

use sha2::{Digest, Sha256};

use crate::config::ExpansionConfig;
use crate::models::ExpansionResult;
use crate::ports::{ExpansionCache, GenerationParams, GenerationPort};

/// `key = SHA-256(prompt_version || '\0' || model_uri || '\0' || query || '\0' || lang)`.
/// A pure function of its inputs, as required by §8's testable property.
pub fn cache_key(prompt_version: &str, model_uri: &str, query: &str, lang: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt_version.as_bytes());
    hasher.update([0u8]);
    hasher.update(model_uri.as_bytes());
    hasher.update([0u8]);
    hasher.update(query.as_bytes());
    hasher.update([0u8]);
    hasher.update(lang.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn build_prompt(query: &str, lang: &str) -> String {
    format!(
        "You are a retrieval query rewriter. The user's prompt language is \"{lang}\". \
         Given the query below, respond with strict JSON only, matching this shape: \
         {{\"lexicalQueries\": string[], \"vectorQueries\": string[], \"hyde\": string, \"notes\": string}}. \
         Provide at most 5 entries per array. Query: {query}"
    )
}

/// Extract the first balanced `{...}` JSON object from free-form model output.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0i32;
    for (offset, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

fn cap_variants(mut result: ExpansionResult, max_variants: usize) -> ExpansionResult {
    result.lexical_queries.retain(|s| !s.trim().is_empty());
    result.lexical_queries.truncate(max_variants);
    result.vector_queries.retain(|s| !s.trim().is_empty());
    result.vector_queries.truncate(max_variants);
    result
}

fn parse_expansion(raw: &str, max_variants: usize) -> Option<ExpansionResult> {
    let json_slice = extract_json_object(raw)?;
    let parsed: ExpansionResult = serde_json::from_str(json_slice).ok()?;
    Some(cap_variants(parsed, max_variants))
}

/// Run C4. Returns `None` on any parse, schema, port, or timeout failure —
/// this is graceful degradation, not an error the orchestrator propagates.
pub async fn expand(
    generation: &dyn GenerationPort,
    cache: Option<&dyn ExpansionCache>,
    query: &str,
    lang: &str,
    config: &ExpansionConfig,
) -> Option<ExpansionResult> {
    let key = cache_key(&config.prompt_version, generation.model_uri(), query, lang);

    if config.cache_enabled {
        if let Some(cache) = cache {
            if let Ok(Some(cached)) = cache.get(&key).await {
                if let Ok(result) = serde_json::from_str::<ExpansionResult>(&cached) {
                    return Some(result);
                }
            }
        }
    }

    let prompt = build_prompt(query, lang);
    let params = GenerationParams {
        temperature: 0.0,
        max_tokens: 512,
        seed: Some(0),
    };

    let timeout = std::time::Duration::from_millis(config.timeout_ms);
    let generated = match tokio::time::timeout(timeout, generation.generate(&prompt, &params)).await
    {
        Ok(Ok(text)) => text,
        Ok(Err(_)) | Err(_) => return None,
    };

    let result = parse_expansion(&generated, config.max_variants)?;

    if config.cache_enabled {
        if let Some(cache) = cache {
            if let Ok(serialized) = serde_json::to_string(&result) {
                let _ = cache.set(&key, &serialized).await;
            }
        }
    }

    Some(result)
}

/// The strong-BM25 skip rule: top normalized score >= threshold AND the
/// top-minus-second gap >= gap_threshold. Both conditions are required.
pub fn is_bm25_strong(
    normalized_scores: &[f64],
    score_threshold: f64,
    gap_threshold: f64,
) -> bool {
    if normalized_scores.is_empty() {
        return false;
    }
    let top = normalized_scores[0];
    if top < score_threshold {
        return false;
    }
    let second = normalized_scores.get(1).copied().unwrap_or(0.0);
    (top - second) >= gap_threshold
}
