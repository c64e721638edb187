use bytes::Bytes;

/// Inbound / upstream API dialects handled by the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAI,
    OpenAIResponses,
    Gemini,
    Claude,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::OpenAI => "openai",
            Dialect::OpenAIResponses => "openai-responses",
            Dialect::Gemini => "gemini",
            Dialect::Claude => "claude",
        }
    }
}

/// Pure payload translation seam between inbound and upstream dialects.
///
/// The proxy core never interprets dialect payloads itself; executors hand
/// request bodies, response bodies and individual stream lines through this
/// trait and treat the results as opaque bytes.
pub trait PayloadTranslator: Send + Sync {
    fn translate_request(
        &self,
        from: Dialect,
        to: Dialect,
        model: &str,
        payload: &[u8],
        stream: bool,
    ) -> Bytes;

    fn translate_response(
        &self,
        from: Dialect,
        to: Dialect,
        model: &str,
        original_request: Option<&[u8]>,
        payload: &[u8],
    ) -> Bytes;

    /// Translate one upstream stream line into zero or more inbound-dialect
    /// chunks. The terminal `[DONE]` marker is passed through this hook too.
    fn translate_stream_chunk(
        &self,
        from: Dialect,
        to: Dialect,
        model: &str,
        original_request: Option<&[u8]>,
        line: &[u8],
    ) -> Vec<Bytes>;
}

/// Pass-through translator for requests whose inbound dialect already
/// matches the upstream one.
#[derive(Debug, Default)]
pub struct IdentityTranslator;

impl PayloadTranslator for IdentityTranslator {
    fn translate_request(
        &self,
        _from: Dialect,
        _to: Dialect,
        _model: &str,
        payload: &[u8],
        _stream: bool,
    ) -> Bytes {
        Bytes::copy_from_slice(payload)
    }

    fn translate_response(
        &self,
        _from: Dialect,
        _to: Dialect,
        _model: &str,
        _original_request: Option<&[u8]>,
        payload: &[u8],
    ) -> Bytes {
        Bytes::copy_from_slice(payload)
    }

    fn translate_stream_chunk(
        &self,
        _from: Dialect,
        _to: Dialect,
        _model: &str,
        _original_request: Option<&[u8]>,
        line: &[u8],
    ) -> Vec<Bytes> {
        vec![Bytes::copy_from_slice(line)]
    }
}
