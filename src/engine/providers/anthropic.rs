use async_trait::async_trait;

use crate::config::EngineConfig;
use crate::engine::provider::{with_backoff, LanguageModel};
use crate::engine::types::{degrade_to_text, ContentPart, Message, MessageContent, Role};
use crate::errors::{DeskPilotError, DeskPilotResult};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Messages-API adapter for Anthropic models. The system prompt travels as a
/// top-level field, not as a message.
pub struct AnthropicProvider {
    api_base: String,
    api_key: String,
    model: String,
    vision: bool,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            api_base: config.api_base.clone(),
            api_key: config.resolve_api_key(),
            model: config.model.clone(),
            vision: config.vision,
            client: reqwest::Client::new(),
        }
    }

    fn wire_body(
        &self,
        messages: &[Message],
        temperature: f32,
        max_tokens: u32,
    ) -> serde_json::Value {
        let messages = if self.vision {
            messages.to_vec()
        } else {
            degrade_to_text(messages)
        };

        let mut system = String::new();
        let mut wire = Vec::new();
        for m in &messages {
            if m.role == Role::System {
                if !system.is_empty() {
                    system.push('\n');
                }
                system.push_str(&m.text());
                continue;
            }
            let content = match &m.content {
                MessageContent::Text(t) => serde_json::json!(t),
                MessageContent::Parts(parts) => serde_json::json!(parts
                    .iter()
                    .map(|p| match p {
                        ContentPart::Text { text } => serde_json::json!({
                            "type": "text",
                            "text": text,
                        }),
                        ContentPart::Image { base64_png } => serde_json::json!({
                            "type": "image",
                            "source": {
                                "type": "base64",
                                "media_type": "image/png",
                                "data": base64_png,
                            },
                        }),
                    })
                    .collect::<Vec<_>>()),
            };
            wire.push(serde_json::json!({ "role": m.role.as_str(), "content": content }));
        }

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": wire,
            "temperature": temperature,
            "max_tokens": max_tokens,
        });
        if !system.is_empty() {
            body["system"] = serde_json::json!(system);
        }
        body
    }
}

#[async_trait]
impl LanguageModel for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn supports_vision(&self) -> bool {
        self.vision
    }

    async fn generate(
        &self,
        messages: &[Message],
        temperature: f32,
        max_tokens: u32,
    ) -> DeskPilotResult<String> {
        let body = self.wire_body(messages, temperature, max_tokens);

        tracing::debug!(model = %self.model, messages = messages.len(), "sending engine request");

        with_backoff("anthropic", || async {
            let response = self
                .client
                .post(&self.api_base)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
                .send()
                .await?;

            if !response.status().is_success() {
                let status = response.status();
                let err_body = response.text().await.unwrap_or_default();
                return Err(DeskPilotError::Engine(format!("{status}: {err_body}")));
            }

            let json: serde_json::Value = response.json().await?;
            let text = json["content"]
                .as_array()
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter_map(|b| b["text"].as_str())
                        .collect::<Vec<_>>()
                        .join("")
                })
                .unwrap_or_default();
            Ok(text)
        })
        .await
    }
}
