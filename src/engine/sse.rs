use crate::errors::{DeskPilotError, DeskPilotResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Content(String),
    Done,
}

/// Parses a raw SSE line (OpenAI-compatible format). Returns None for
/// keep-alives, non-data lines, and deltas with nothing to accumulate.
pub fn parse_sse_line(line: &str) -> DeskPilotResult<Option<SseEvent>> {
    if line.is_empty() || line.starts_with(':') {
        return Ok(None);
    }

    let data = if let Some(d) = line.strip_prefix("data: ") {
        d.trim()
    } else {
        return Ok(None);
    };

    if data == "[DONE]" {
        return Ok(Some(SseEvent::Done));
    }

    let json: serde_json::Value =
        serde_json::from_str(data).map_err(|e| DeskPilotError::SseParsing(e.to_string()))?;

    if let Some(first) = json["choices"].as_array().and_then(|c| c.first()) {
        let delta = &first["delta"];

        if let Some(content) = delta["content"].as_str() {
            if !content.is_empty() {
                return Ok(Some(SseEvent::Content(content.to_string())));
            }
        }

        if first["finish_reason"].as_str().is_some() {
            return Ok(Some(SseEvent::Done));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_content_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":"hel"}}]}"#;
        assert_eq!(
            parse_sse_line(line).unwrap(),
            Some(SseEvent::Content("hel".into()))
        );
    }

    #[test]
    fn done_marker_and_finish_reason_end_the_stream() {
        assert_eq!(parse_sse_line("data: [DONE]").unwrap(), Some(SseEvent::Done));
        let line = r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        assert_eq!(parse_sse_line(line).unwrap(), Some(SseEvent::Done));
    }

    #[test]
    fn keepalive_and_empty_lines_are_skipped() {
        assert_eq!(parse_sse_line("").unwrap(), None);
        assert_eq!(parse_sse_line(": ping").unwrap(), None);
        assert_eq!(parse_sse_line("event: message").unwrap(), None);
    }
}
