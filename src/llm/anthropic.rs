//! Anthropic Messages API client.
//!
//! Talks HTTP directly so the response status survives into `LlmError`:
//! 401/403 become `AuthFailed`, 429 `RateLimited`, 503/529 `Overloaded`.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::LlmError;
use crate::llm::provider::{GenerationRequest, GenerationResponse, LlmProvider};

const PROVIDER: &str = "anthropic";
const API_VERSION: &str = "2023-06-01";

/// Anthropic's "overloaded" status.
const STATUS_OVERLOADED: u16 = 529;

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    base_url: String,
    timeout: Duration,
}

impl AnthropicProvider {
    pub fn new(
        client: reqwest::Client,
        api_key: SecretString,
        model: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            api_key,
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn request_body(&self, request: &GenerationRequest) -> Value {
        let mut content: Vec<Value> = request
            .documents
            .iter()
            .map(|doc| {
                json!({
                    "type": "document",
                    "title": doc.name,
                    "source": {
                        "type": "base64",
                        "media_type": doc.mime_type,
                        "data": BASE64.encode(&doc.data),
                    },
                })
            })
            .collect();
        content.push(json!({ "type": "text", "text": request.prompt }));

        json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "system": request.system,
            "messages": [{ "role": "user", "content": content }],
        })
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// Map a non-success HTTP status to the matching error variant.
pub(crate) fn error_for_status(
    status: u16,
    retry_after: Option<Duration>,
    body: String,
) -> LlmError {
    match status {
        401 | 403 => LlmError::AuthFailed {
            provider: PROVIDER.to_string(),
            status,
        },
        429 => LlmError::RateLimited {
            provider: PROVIDER.to_string(),
            retry_after,
        },
        503 | STATUS_OVERLOADED => LlmError::Overloaded {
            provider: PROVIDER.to_string(),
            status,
        },
        _ => LlmError::Http {
            provider: PROVIDER.to_string(),
            status,
            body,
        },
    }
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Concatenate the text blocks of a successful response.
fn collect_text(response: MessagesResponse) -> Result<GenerationResponse, LlmError> {
    let text: String = response
        .content
        .into_iter()
        .filter(|block| block.kind == "text")
        .filter_map(|block| block.text)
        .collect::<Vec<_>>()
        .join("");

    if text.trim().is_empty() {
        return Err(LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: format!(
                "no text content (stop_reason: {})",
                response.stop_reason.as_deref().unwrap_or("none")
            ),
        });
    }

    let (input_tokens, output_tokens) = response
        .usage
        .map(|u| (u.input_tokens, u.output_tokens))
        .unwrap_or((0, 0));

    Ok(GenerationResponse {
        text,
        input_tokens,
        output_tokens,
    })
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let body = self.request_body(&request);
        debug!(
            model = %self.model,
            max_tokens = request.max_tokens,
            documents = request.documents.len(),
            "Sending generation request"
        );

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout {
                        provider: PROVIDER.to_string(),
                        timeout: self.timeout,
                    }
                } else {
                    LlmError::RequestFailed {
                        provider: PROVIDER.to_string(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            let retry = retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status(status.as_u16(), retry, body));
        }

        let parsed: MessagesResponse =
            response
                .json()
                .await
                .map_err(|e| LlmError::InvalidResponse {
                    provider: PROVIDER.to_string(),
                    reason: e.to_string(),
                })?;

        collect_text(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::Document;

    fn provider() -> AnthropicProvider {
        AnthropicProvider::new(
            reqwest::Client::new(),
            SecretString::from("test-key"),
            "claude-sonnet-4-20250514",
            "https://api.anthropic.com/",
            Duration::from_secs(30),
        )
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            error_for_status(401, None, String::new()),
            LlmError::AuthFailed { status: 401, .. }
        ));
        assert!(matches!(
            error_for_status(403, None, String::new()),
            LlmError::AuthFailed { status: 403, .. }
        ));
        assert!(matches!(
            error_for_status(429, Some(Duration::from_secs(7)), String::new()),
            LlmError::RateLimited { retry_after: Some(d), .. } if d == Duration::from_secs(7)
        ));
        assert!(matches!(
            error_for_status(529, None, String::new()),
            LlmError::Overloaded { status: 529, .. }
        ));
        assert!(matches!(
            error_for_status(500, None, "boom".into()),
            LlmError::Http { status: 500, .. }
        ));
    }

    #[test]
    fn body_puts_documents_before_prompt() {
        let request = GenerationRequest::new("sys", "the prompt", 1024).with_documents(vec![
            Document::new("deck.pdf", "application/pdf", b"%PDF".to_vec()),
        ]);
        let body = provider().request_body(&request);

        assert_eq!(body["max_tokens"], 1024);
        assert_eq!(body["system"], "sys");
        let content = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content.len(), 2);
        assert_eq!(content[0]["type"], "document");
        assert_eq!(content[0]["source"]["data"], BASE64.encode(b"%PDF"));
        assert_eq!(content[1]["text"], "the prompt");
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        assert_eq!(provider().base_url, "https://api.anthropic.com");
    }

    #[test]
    fn collect_text_joins_blocks_and_reads_usage() {
        let parsed: MessagesResponse = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "Hello "},
                {"type": "tool_use", "id": "x"},
                {"type": "text", "text": "world"}
            ],
            "usage": {"input_tokens": 12, "output_tokens": 3},
            "stop_reason": "end_turn"
        }))
        .unwrap();
        let response = collect_text(parsed).unwrap();
        assert_eq!(response.text, "Hello world");
        assert_eq!(response.input_tokens, 12);
        assert_eq!(response.output_tokens, 3);
    }

    #[test]
    fn collect_text_rejects_empty() {
        let parsed: MessagesResponse = serde_json::from_value(json!({
            "content": [],
            "stop_reason": "max_tokens"
        }))
        .unwrap();
        assert!(matches!(
            collect_text(parsed),
            Err(LlmError::InvalidResponse { .. })
        ));
    }
}
