use bytes::Bytes;
use serde::Serialize;
use serde_json::Value as JsonValue;

/// OpenAI Responses streaming error chunk.
///
/// Important: OpenAI's HTTP error bodies are shaped like `{"error":{...}}`;
/// those are valid for non-streaming responses, but streaming clients
/// validate SSE `data:` payloads against a union of chunks that requires a
/// top-level `type` field.
#[derive(Serialize)]
struct StreamErrorChunk {
    #[serde(rename = "type")]
    kind: &'static str,
    code: String,
    message: String,
    sequence_number: i64,
}

fn stream_error_code(status: u16) -> &'static str {
    match status {
        401 => "invalid_api_key",
        403 => "insufficient_quota",
        429 => "rate_limit_exceeded",
        404 => "model_not_found",
        408 => "request_timeout",
        status if status >= 500 => "internal_server_error",
        status if status >= 400 => "invalid_request_error",
        _ => "unknown_error",
    }
}

pub fn build_stream_error_chunk(status: i32, err_text: &str, sequence_number: i64) -> Bytes {
    let status: u16 = if status <= 0 {
        500
    } else {
        status.min(i32::from(u16::MAX)) as u16
    };
    let mut sequence_number = sequence_number.max(0);

    let trimmed = err_text.trim();
    let mut message = if trimmed.is_empty() {
        status_text(status).to_string()
    } else {
        trimmed.to_string()
    };
    let mut code = stream_error_code(status).to_string();

    if !trimmed.is_empty()
        && let Ok(payload) = serde_json::from_str::<JsonValue>(trimmed)
    {
        if payload.get("type").and_then(JsonValue::as_str).map(str::trim) == Some("error") {
            if let Some(value) = payload.get("message").and_then(JsonValue::as_str) {
                let value = value.trim();
                if !value.is_empty() {
                    message = value.to_string();
                }
            }
            if let Some(value) = payload.get("code").filter(|value| !value.is_null()) {
                code = coerce_code_value(value);
            }
            if sequence_number == 0
                && let Some(value) = payload.get("sequence_number").and_then(JsonValue::as_i64)
            {
                sequence_number = value.max(0);
            }
        }
        if let Some(error) = payload.get("error").filter(|value| value.is_object()) {
            if let Some(value) = error.get("message").and_then(JsonValue::as_str) {
                let value = value.trim();
                if !value.is_empty() {
                    message = value.to_string();
                }
            }
            if let Some(value) = error.get("code").filter(|value| !value.is_null()) {
                code = coerce_code_value(value);
            }
        }
    }

    if code.trim().is_empty() {
        code = "unknown_error".to_string();
    }

    let chunk = StreamErrorChunk {
        kind: "error",
        code,
        message,
        sequence_number,
    };
    match serde_json::to_vec(&chunk) {
        Ok(data) => Bytes::from(data),
        Err(_) => Bytes::from_static(
            br#"{"type":"error","code":"internal_server_error","message":"internal error","sequence_number":0}"#,
        ),
    }
}

fn status_text(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("")
}

/// Codes occasionally arrive as numbers; render non-string values the way
/// they appear in the payload. Null yields the current code unchanged.
fn coerce_code_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(text) => text.trim().to_string(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}
