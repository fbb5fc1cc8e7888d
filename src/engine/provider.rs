use std::time::Duration;

use async_trait::async_trait;

use crate::errors::{DeskPilotError, DeskPilotResult};
use crate::engine::types::Message;

/// Unified language-model capability. One instance serves the planner and
/// executor of a single instruction; each call is one blocking round trip.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Returns the provider's identifier (matches the config entry).
    fn name(&self) -> &str;

    /// Whether image-bearing messages are forwarded as images. When false
    /// the provider degrades them to text-only.
    fn supports_vision(&self) -> bool;

    async fn generate(
        &self,
        messages: &[Message],
        temperature: f32,
        max_tokens: u32,
    ) -> DeskPilotResult<String>;
}

const MAX_RETRIES: u32 = 5;
const BASE_DELAY_SECS: u64 = 1;
const MAX_DELAY_SECS: u64 = 60;

/// Retries `op` with exponential backoff (1s doubling, 60s cap) on transient
/// transport failures. Retries are local to one request: no control-loop
/// counter advances until a response is obtained or the budget is exhausted.
pub async fn with_backoff<T, F, Fut>(label: &str, mut op: F) -> DeskPilotResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = DeskPilotResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < MAX_RETRIES && is_transient(&e) => {
                let delay = (BASE_DELAY_SECS << attempt).min(MAX_DELAY_SECS);
                attempt += 1;
                tracing::warn!(
                    label,
                    attempt,
                    delay_secs = delay,
                    error = %e,
                    "transient engine failure, backing off"
                );
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_transient(error: &DeskPilotError) -> bool {
    match error {
        DeskPilotError::Http(e) => {
            if e.is_connect() || e.is_timeout() || e.is_request() {
                return true;
            }
            e.status()
                .map(|s| s.as_u16() == 429 || s.is_server_error())
                .unwrap_or(false)
        }
        // Rate limits and overload surface as provider errors with the
        // status code embedded.
        DeskPilotError::Engine(msg) => {
            msg.contains("429") || msg.contains("503") || msg.contains("overloaded")
        }
        _ => false,
    }
}
