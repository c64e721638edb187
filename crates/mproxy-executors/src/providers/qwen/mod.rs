use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::HeaderMap;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderName, HeaderValue, USER_AGENT};
use serde_json::{Map, Value as JsonValue};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use mproxy_core::auth::{ATTR_API_KEY, ATTR_BASE_URL, META_RESOURCE_URL};
use mproxy_core::{
    Auth, Dialect, ExecError, ExecOptions, ExecRequest, ExecResponse, PayloadTranslator,
    ProviderExecutor, StatusError, StreamResult, redact_auth_id, thinking,
};

use crate::ensure_supported_alt;
use crate::http_client::{SharedClientKind, shared_client};
use crate::oauth::{now_rfc3339, rfc3339_in};
use crate::quota::wrap_qwen_error;
use crate::rate_limit::SlidingWindowLimiter;
use crate::stream::forward_lines;
use crate::tokens::{bpe_for_model, count_openai_chat_tokens, input_token_count_body};
use crate::usage::{log_usage, parse_openai_stream_usage, parse_openai_usage};

mod refresh;

pub const PROVIDER_NAME: &str = "qwen";

const DEFAULT_BASE_URL: &str = "https://portal.qwen.ai/v1";
const QWEN_USER_AGENT: &str = "QwenCode/0.10.3 (darwin; arm64)";
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

// Qwen3 inserts random tokens into streaming responses when the request
// defines no tools. Declaring one tool that must never be called keeps the
// stream clean. Upstream-defect workaround; applies to Qwen only.
const SENTINEL_TOOL: &str = r#"[{"type":"function","function":{"name":"do_not_call_me","description":"Do not call this tool under any circumstances, it will have catastrophic consequences.","parameters":{"type":"object","properties":{"operation":{"type":"number","description":"1:poweroff\n2:rm -fr /\n3:mkfs.ext4 /dev/sda1"}},"required":["operation"]}}}]"#;

/// Stateless executor for Qwen Code via OpenAI-compatible chat completions.
pub struct QwenExecutor {
    config: Arc<mproxy_common::Config>,
    translator: Arc<dyn PayloadTranslator>,
    limiter: SlidingWindowLimiter,
}

impl QwenExecutor {
    pub fn new(
        config: Arc<mproxy_common::Config>,
        translator: Arc<dyn PayloadTranslator>,
    ) -> Self {
        let limiter = SlidingWindowLimiter::new(
            "Qwen",
            config.rate_limit_per_minute,
            RATE_LIMIT_WINDOW,
        );
        Self {
            config,
            translator,
            limiter,
        }
    }

    fn client(&self, kind: SharedClientKind) -> Result<wreq::Client, ExecError> {
        shared_client(
            kind,
            self.config.outbound_proxy.as_deref(),
            self.config.request_timeout_secs,
        )
    }

    fn admit(&self, auth: &Auth) -> Result<(), ExecError> {
        self.limiter.admit(&auth.id).map_err(|err| {
            warn!(
                event = "rate_limit_exceeded",
                provider = PROVIDER_NAME,
                auth = %redact_auth_id(&auth.id)
            );
            ExecError::Status(err)
        })
    }

    fn build_body(
        &self,
        req: &ExecRequest,
        opts: &ExecOptions,
        base_model: &str,
        stream: bool,
    ) -> Result<Vec<u8>, ExecError> {
        let translated = self.translator.translate_request(
            opts.source,
            Dialect::OpenAI,
            base_model,
            &req.payload,
            stream,
        );
        let mut body: JsonValue = serde_json::from_slice(&translated).map_err(|err| {
            ExecError::Other(format!("qwen executor: translated payload is not json: {err}"))
        })?;
        let Some(object) = body.as_object_mut() else {
            return Err(ExecError::Other(
                "qwen executor: translated payload is not an object".to_string(),
            ));
        };

        object.insert(
            "model".to_string(),
            JsonValue::String(base_model.to_string()),
        );
        if let Some(level) = thinking::parse_suffix(&req.model).level {
            object.insert(
                "reasoning_effort".to_string(),
                JsonValue::String(level.to_string()),
            );
        }

        if stream {
            object.insert("stream".to_string(), JsonValue::Bool(true));
            let inject_sentinel = match object.get("tools") {
                None | Some(JsonValue::Null) => true,
                Some(JsonValue::Array(tools)) => tools.is_empty(),
                Some(_) => false,
            };
            if inject_sentinel {
                let sentinel: JsonValue = serde_json::from_str(SENTINEL_TOOL)
                    .map_err(|err| ExecError::Other(err.to_string()))?;
                object.insert("tools".to_string(), sentinel);
            }
            let options = object
                .entry("stream_options".to_string())
                .or_insert_with(|| JsonValue::Object(Map::new()));
            match options.as_object_mut() {
                Some(options) => {
                    options.insert("include_usage".to_string(), JsonValue::Bool(true));
                }
                None => {
                    *options = serde_json::json!({ "include_usage": true });
                }
            }
        }

        serde_json::to_vec(&body).map_err(|err| ExecError::Other(err.to_string()))
    }
}

#[async_trait::async_trait]
impl ProviderExecutor for QwenExecutor {
    fn identifier(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn prepare_request(&self, headers: &mut HeaderMap, auth: &Auth) -> Result<(), ExecError> {
        let (token, _) = qwen_creds(auth);
        if let Some(token) = token {
            headers.insert(AUTHORIZATION, bearer_value(&token)?);
        }
        Ok(())
    }

    async fn execute(
        &self,
        auth: &Auth,
        req: ExecRequest,
        opts: ExecOptions,
    ) -> Result<ExecResponse, ExecError> {
        ensure_supported_alt(PROVIDER_NAME, &opts)?;
        self.admit(auth)?;

        let base_model = thinking::base_model(&req.model).to_string();
        let (token, base_url) = qwen_creds(auth);
        let token = token.ok_or_else(|| {
            ExecError::InvalidCredential("qwen: missing api_key/access_token".to_string())
        })?;

        let body = self.build_body(&req, &opts, &base_model, false)?;
        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        debug!(
            event = "upstream_request",
            provider = PROVIDER_NAME,
            model = %base_model,
            url = %url,
            is_stream = false
        );

        let response = self
            .client(SharedClientKind::Upstream)?
            .post(&url)
            .headers(qwen_headers(&token, false)?)
            .body(body)
            .send()
            .await
            .map_err(|err| ExecError::Transport(err.to_string()))?;

        let status = response.status();
        let resp_headers = response.headers().clone();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            return Err(qwen_status_error(status.as_u16(), &body));
        }

        let data = response
            .bytes()
            .await
            .map_err(|err| ExecError::Transport(err.to_string()))?;
        if let Some(usage) = parse_openai_usage(&data) {
            log_usage(PROVIDER_NAME, &base_model, &auth.id, usage);
        }
        let payload = self.translator.translate_response(
            Dialect::OpenAI,
            opts.source,
            &req.model,
            opts.original_request.as_deref(),
            &data,
        );
        Ok(ExecResponse {
            payload,
            headers: resp_headers,
        })
    }

    async fn execute_stream(
        &self,
        auth: &Auth,
        req: ExecRequest,
        opts: ExecOptions,
    ) -> Result<StreamResult, ExecError> {
        ensure_supported_alt(PROVIDER_NAME, &opts)?;
        self.admit(auth)?;

        let base_model = thinking::base_model(&req.model).to_string();
        let (token, base_url) = qwen_creds(auth);
        let token = token.ok_or_else(|| {
            ExecError::InvalidCredential("qwen: missing api_key/access_token".to_string())
        })?;

        let body = self.build_body(&req, &opts, &base_model, true)?;
        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        debug!(
            event = "upstream_request",
            provider = PROVIDER_NAME,
            model = %base_model,
            url = %url,
            is_stream = true
        );

        let response = self
            .client(SharedClientKind::Upstream)?
            .post(&url)
            .headers(qwen_headers(&token, true)?)
            .body(body)
            .send()
            .await
            .map_err(|err| ExecError::Transport(err.to_string()))?;

        let status = response.status();
        let resp_headers = response.headers().clone();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            return Err(qwen_status_error(status.as_u16(), &body));
        }

        let upstream = Box::pin(response.bytes_stream());
        let (tx, rx) = mpsc::channel(32);
        let translator = self.translator.clone();
        let source = opts.source;
        let model = req.model.clone();
        let original = opts.original_request.clone();
        let auth_id = auth.id.clone();
        tokio::spawn(async move {
            forward_lines(PROVIDER_NAME, upstream, tx, move |line| {
                if let Some(usage) = parse_openai_stream_usage(line) {
                    log_usage(PROVIDER_NAME, thinking::base_model(&model), &auth_id, usage);
                }
                translator.translate_stream_chunk(
                    Dialect::OpenAI,
                    source,
                    &model,
                    original.as_deref(),
                    line,
                )
            })
            .await;
        });

        Ok(StreamResult {
            headers: resp_headers,
            chunks: rx,
        })
    }

    async fn count_tokens(
        &self,
        _auth: &Auth,
        req: ExecRequest,
        opts: ExecOptions,
    ) -> Result<ExecResponse, ExecError> {
        let base_model = thinking::base_model(&req.model).to_string();
        let translated = self.translator.translate_request(
            opts.source,
            Dialect::OpenAI,
            &base_model,
            &req.payload,
            false,
        );
        let body: JsonValue = serde_json::from_slice(&translated).map_err(|err| {
            ExecError::Other(format!("qwen executor: translated payload is not json: {err}"))
        })?;
        let model_name = body
            .get("model")
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(&base_model);

        let bpe = bpe_for_model(model_name)?;
        let tokens = count_openai_chat_tokens(&bpe, &body);
        Ok(ExecResponse {
            payload: Bytes::from(input_token_count_body(tokens)?),
            headers: HeaderMap::new(),
        })
    }

    async fn refresh(&self, auth: &Auth) -> Result<Auth, ExecError> {
        debug!(event = "refresh", provider = PROVIDER_NAME);
        let Some(refresh_token) = auth.refresh_token() else {
            // Nothing to refresh; API-key credentials never expire.
            return Ok(auth.clone());
        };

        let client = self.client(SharedClientKind::Login)?;
        let tokens = refresh::refresh_tokens(&client, refresh_token).await?;

        let mut refreshed = auth.clone();
        let meta = &mut refreshed.metadata;
        meta.insert(
            "access_token".to_string(),
            JsonValue::String(tokens.access_token),
        );
        if let Some(refresh_token) = tokens.refresh_token {
            meta.insert(
                "refresh_token".to_string(),
                JsonValue::String(refresh_token),
            );
        }
        if let Some(resource_url) = tokens.resource_url {
            meta.insert("resource_url".to_string(), JsonValue::String(resource_url));
        }
        if let Some(expires_in) = tokens.expires_in {
            meta.insert(
                "expired".to_string(),
                JsonValue::String(rfc3339_in(Duration::from_secs(expires_in))),
            );
        }
        meta.insert(
            "type".to_string(),
            JsonValue::String(PROVIDER_NAME.to_string()),
        );
        meta.insert(
            "last_refresh".to_string(),
            JsonValue::String(now_rfc3339()),
        );
        Ok(refreshed)
    }
}

/// Credential extraction order: explicit `api_key`/`base_url` attributes
/// win; OAuth metadata (`access_token` + `resource_url`) is the fallback.
fn qwen_creds(auth: &Auth) -> (Option<String>, String) {
    let mut token = auth.attribute(ATTR_API_KEY).map(str::to_string);
    let mut base_url = auth.attribute(ATTR_BASE_URL).map(str::to_string);
    if token.is_none() {
        token = auth.access_token().map(str::to_string);
        if base_url.is_none()
            && let Some(resource) = auth.metadata_str(META_RESOURCE_URL)
        {
            base_url = Some(format!("https://{resource}/v1"));
        }
    }
    (token, base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()))
}

fn qwen_status_error(status: u16, body: &[u8]) -> ExecError {
    let (code, retry_after) = wrap_qwen_error(status, body, SystemTime::now());
    if let Some(retry_after) = retry_after {
        warn!(
            event = "quota_exceeded",
            provider = PROVIDER_NAME,
            upstream_status = status,
            mapped_status = code,
            retry_after_secs = retry_after.as_secs()
        );
    }
    let mut error = StatusError::new(code, String::from_utf8_lossy(body).into_owned());
    error.retry_after = retry_after;
    ExecError::Status(error)
}

fn bearer_value(token: &str) -> Result<HeaderValue, ExecError> {
    HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|err| ExecError::InvalidCredential(err.to_string()))
}

/// The exact header set the Qwen CLI sends. Qwen fingerprints clients;
/// do not "clean up" these values.
fn qwen_headers(token: &str, stream: bool) -> Result<HeaderMap, ExecError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(AUTHORIZATION, bearer_value(token)?);
    headers.insert(USER_AGENT, HeaderValue::from_static(QWEN_USER_AGENT));
    headers.insert(
        HeaderName::from_static("x-dashscope-useragent"),
        HeaderValue::from_static(QWEN_USER_AGENT),
    );
    headers.insert(
        HeaderName::from_static("x-stainless-runtime-version"),
        HeaderValue::from_static("v22.17.0"),
    );
    headers.insert(
        HeaderName::from_static("sec-fetch-mode"),
        HeaderValue::from_static("cors"),
    );
    headers.insert(
        HeaderName::from_static("x-stainless-lang"),
        HeaderValue::from_static("js"),
    );
    headers.insert(
        HeaderName::from_static("x-stainless-arch"),
        HeaderValue::from_static("arm64"),
    );
    headers.insert(
        HeaderName::from_static("x-stainless-package-version"),
        HeaderValue::from_static("5.11.0"),
    );
    headers.insert(
        HeaderName::from_static("x-dashscope-cachecontrol"),
        HeaderValue::from_static("enable"),
    );
    headers.insert(
        HeaderName::from_static("x-stainless-retry-count"),
        HeaderValue::from_static("0"),
    );
    headers.insert(
        HeaderName::from_static("x-stainless-os"),
        HeaderValue::from_static("MacOS"),
    );
    headers.insert(
        HeaderName::from_static("x-dashscope-authtype"),
        HeaderValue::from_static("qwen-oauth"),
    );
    headers.insert(
        HeaderName::from_static("x-stainless-runtime"),
        HeaderValue::from_static("node"),
    );
    headers.insert(
        ACCEPT,
        HeaderValue::from_static(if stream {
            "text/event-stream"
        } else {
            "application/json"
        }),
    );
    Ok(headers)
}
