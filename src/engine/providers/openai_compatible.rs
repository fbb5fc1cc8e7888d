use async_trait::async_trait;
use futures_util::StreamExt;

use crate::config::EngineConfig;
use crate::engine::provider::{with_backoff, LanguageModel};
use crate::engine::sse::{parse_sse_line, SseEvent};
use crate::engine::types::{degrade_to_text, ContentPart, Message, MessageContent};
use crate::errors::{DeskPilotError, DeskPilotResult};

/// Chat-completions provider for any OpenAI-compatible endpoint.
pub struct OpenAiCompatibleProvider {
    api_base: String,
    api_key: String,
    model: String,
    stream: bool,
    vision: bool,
    client: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            api_base: config.api_base.clone(),
            api_key: config.resolve_api_key(),
            model: config.model.clone(),
            stream: config.stream,
            vision: config.vision,
            client: reqwest::Client::new(),
        }
    }

    fn wire_messages(&self, messages: &[Message]) -> Vec<serde_json::Value> {
        let messages = if self.vision {
            messages.to_vec()
        } else {
            degrade_to_text(messages)
        };
        messages
            .iter()
            .map(|m| {
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
                                "type": "image_url",
                                "image_url": {
                                    "url": format!("data:image/png;base64,{base64_png}"),
                                },
                            }),
                        })
                        .collect::<Vec<_>>()),
                };
                serde_json::json!({ "role": m.role.as_str(), "content": content })
            })
            .collect()
    }

    async fn request_once(
        &self,
        body: &serde_json::Value,
    ) -> DeskPilotResult<reqwest::Response> {
        let response = self
            .client
            .post(&self.api_base)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let err_body = response.text().await.unwrap_or_default();
            return Err(DeskPilotError::Engine(format!("{status}: {err_body}")));
        }
        Ok(response)
    }

    /// Drains an SSE stream, accumulating content deltas into one string.
    async fn collect_stream(&self, response: reqwest::Response) -> DeskPilotResult<String> {
        let mut byte_stream = response.bytes_stream();
        let mut line_buf = String::new();
        let mut content = String::new();

        'stream: while let Some(result) = byte_stream.next().await {
            let bytes = result?;
            let text = String::from_utf8_lossy(&bytes);

            for ch in text.chars() {
                if ch == '\n' {
                    let line = line_buf.trim().to_string();
                    line_buf.clear();
                    match parse_sse_line(&line) {
                        Ok(Some(SseEvent::Content(delta))) => content.push_str(&delta),
                        Ok(Some(SseEvent::Done)) => break 'stream,
                        Ok(None) => {}
                        Err(e) => tracing::debug!("SSE parse skipped: {e}"),
                    }
                } else {
                    line_buf.push(ch);
                }
            }
        }

        Ok(content)
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        "openai_compatible"
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
        let body = serde_json::json!({
            "model": self.model,
            "messages": self.wire_messages(messages),
            "stream": self.stream,
            "temperature": temperature,
            "max_tokens": max_tokens,
        });

        tracing::debug!(
            model = %self.model,
            stream = self.stream,
            messages = messages.len(),
            "sending engine request"
        );

        with_backoff("openai_compatible", || async {
            let response = self.request_once(&body).await?;
            if self.stream {
                self.collect_stream(response).await
            } else {
                let json: serde_json::Value = response.json().await?;
                Ok(json["choices"][0]["message"]["content"]
                    .as_str()
                    .unwrap_or("")
                    .to_string())
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use crate::engine::types::Role;

    fn provider(vision: bool) -> OpenAiCompatibleProvider {
        OpenAiCompatibleProvider::new(&EngineConfig {
            provider: ProviderKind::OpenaiCompatible,
            api_base: "http://localhost/v1/chat/completions".into(),
            model: "test-model".into(),
            temperature: 0.1,
            max_tokens: 256,
            stream: false,
            vision,
            api_key: Some("key".into()),
        })
    }

    #[test]
    fn image_parts_become_data_uris_for_vision_models() {
        let wire = provider(true).wire_messages(&[Message::user_with_image("look", &[0u8; 4])]);
        let parts = wire[0]["content"].as_array().unwrap();
        assert_eq!(parts[0]["type"], "text");
        assert!(parts[1]["image_url"]["url"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
    }

    #[test]
    fn non_vision_models_get_text_only_messages() {
        let wire = provider(false).wire_messages(&[
            Message::system("sys"),
            Message::user_with_image("look", &[0u8; 4]),
        ]);
        assert_eq!(wire[0]["role"], Role::System.as_str());
        assert_eq!(wire[1]["content"], "look");
    }
}
