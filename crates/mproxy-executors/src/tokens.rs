use serde::Serialize;
use serde_json::Value as JsonValue;
use tiktoken_rs::{CoreBPE, get_bpe_from_model, o200k_base};

use mproxy_core::ExecError;

#[derive(Serialize)]
struct InputTokenCount {
    object: &'static str,
    input_tokens: i64,
}

pub(crate) fn bpe_for_model(model: &str) -> Result<CoreBPE, ExecError> {
    if let Ok(bpe) = get_bpe_from_model(model) {
        return Ok(bpe);
    }
    o200k_base().map_err(|err| ExecError::Other(err.to_string()))
}

/// Local token count over an OpenAI chat-completions payload: message
/// contents plus top-level instructions. Tool schemas and images are not
/// counted; the result is an estimate for quota display, not billing.
pub(crate) fn count_openai_chat_tokens(bpe: &CoreBPE, body: &JsonValue) -> i64 {
    let mut total = 0i64;
    if let Some(messages) = body.get("messages").and_then(JsonValue::as_array) {
        for message in messages {
            total += count_message_content(bpe, message.get("content"));
        }
    }
    if let Some(instructions) = body.get("instructions").and_then(JsonValue::as_str) {
        total += count_text(bpe, instructions);
    }
    total
}

fn count_message_content(bpe: &CoreBPE, content: Option<&JsonValue>) -> i64 {
    match content {
        Some(JsonValue::String(text)) => count_text(bpe, text),
        Some(JsonValue::Array(parts)) => parts
            .iter()
            .map(|part| {
                part.get("text")
                    .and_then(JsonValue::as_str)
                    .map(|text| count_text(bpe, text))
                    .unwrap_or(0)
            })
            .sum(),
        _ => 0,
    }
}

fn count_text(bpe: &CoreBPE, text: &str) -> i64 {
    bpe.encode_ordinary(text).len() as i64
}

pub(crate) fn input_token_count_body(tokens: i64) -> Result<Vec<u8>, ExecError> {
    serde_json::to_vec(&InputTokenCount {
        object: "response.input_tokens",
        input_tokens: tokens,
    })
    .map_err(|err| ExecError::Other(err.to_string()))
}
