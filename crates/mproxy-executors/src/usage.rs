use serde::Deserialize;
use tracing::debug;

use mproxy_core::redact_auth_id;

/// Token accounting extracted from OpenAI-shape responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct UsageSummary {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
}

#[derive(Debug, Deserialize)]
struct UsageEnvelope {
    usage: Option<UsageSummary>,
}

/// Extracts the `usage` object from a non-stream response body.
pub fn parse_openai_usage(body: &[u8]) -> Option<UsageSummary> {
    serde_json::from_slice::<UsageEnvelope>(body).ok()?.usage
}

/// Extracts usage from one stream line. With `stream_options.include_usage`
/// set, the upstream emits a tail chunk whose `usage` field is non-null.
pub fn parse_openai_stream_usage(line: &[u8]) -> Option<UsageSummary> {
    let text = std::str::from_utf8(line).ok()?;
    let data = text.strip_prefix("data:").unwrap_or(text).trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    serde_json::from_str::<UsageEnvelope>(data).ok()?.usage
}

pub(crate) fn log_usage(provider: &'static str, model: &str, auth_id: &str, usage: UsageSummary) {
    debug!(
        event = "upstream_usage",
        provider,
        model = %model,
        auth = %redact_auth_id(auth_id),
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        total_tokens = usage.total_tokens
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_non_stream_usage() {
        let body = br#"{"id":"1","usage":{"prompt_tokens":10,"completion_tokens":3,"total_tokens":13}}"#;
        let usage = parse_openai_usage(body).expect("usage");
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 3);
        assert_eq!(usage.total_tokens, 13);
    }

    #[test]
    fn missing_usage_yields_none() {
        assert!(parse_openai_usage(br#"{"id":"1"}"#).is_none());
        assert!(parse_openai_usage(br#"{"usage":null}"#).is_none());
    }

    #[test]
    fn parses_stream_usage_tail_chunk() {
        let line = br#"data: {"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7}}"#;
        let usage = parse_openai_stream_usage(line).expect("usage");
        assert_eq!(usage.total_tokens, 7);
    }

    #[test]
    fn ignores_done_marker_and_delta_chunks() {
        assert!(parse_openai_stream_usage(b"data: [DONE]").is_none());
        assert!(
            parse_openai_stream_usage(br#"data: {"choices":[{"delta":{"content":"x"}}]}"#)
                .is_none()
        );
    }
}
