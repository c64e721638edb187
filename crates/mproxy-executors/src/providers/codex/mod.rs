use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::HeaderMap;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderName, HeaderValue};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::debug;

use mproxy_core::auth::{ATTR_API_KEY, ATTR_BASE_URL};
use mproxy_core::{
    Auth, Dialect, ExecError, ExecOptions, ExecRequest, ExecResponse, PayloadTranslator,
    ProviderExecutor, StatusError, StreamResult, thinking,
};

use crate::ensure_supported_alt;
use crate::http_client::{SharedClientKind, shared_client};
use crate::oauth::{now_rfc3339, rfc3339_in};
use crate::quota::parse_codex_retry_after;
use crate::stream::forward_lines;
use crate::tokens::{bpe_for_model, count_openai_chat_tokens, input_token_count_body};

mod device;
mod oauth;

pub use device::login_with_device_flow;

pub const PROVIDER_NAME: &str = "codex";

const DEFAULT_BASE_URL: &str = "https://chatgpt.com/backend-api/codex";
const REFRESH_MAX_ATTEMPTS: u32 = 3;

/// Executor for Codex (ChatGPT backend) via the OpenAI Responses dialect.
pub struct CodexExecutor {
    config: Arc<mproxy_common::Config>,
    translator: Arc<dyn PayloadTranslator>,
}

impl CodexExecutor {
    pub fn new(
        config: Arc<mproxy_common::Config>,
        translator: Arc<dyn PayloadTranslator>,
    ) -> Self {
        Self { config, translator }
    }

    fn client(&self, kind: SharedClientKind) -> Result<wreq::Client, ExecError> {
        shared_client(
            kind,
            self.config.outbound_proxy.as_deref(),
            self.config.request_timeout_secs,
        )
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
            Dialect::OpenAIResponses,
            base_model,
            &req.payload,
            stream,
        );
        let mut body: JsonValue = serde_json::from_slice(&translated).map_err(|err| {
            ExecError::Other(format!("codex executor: translated payload is not json: {err}"))
        })?;
        let Some(object) = body.as_object_mut() else {
            return Err(ExecError::Other(
                "codex executor: translated payload is not an object".to_string(),
            ));
        };

        object.insert(
            "model".to_string(),
            JsonValue::String(base_model.to_string()),
        );
        if let Some(level) = thinking::parse_suffix(&req.model).level {
            object.insert(
                "reasoning".to_string(),
                serde_json::json!({ "effort": level }),
            );
        }
        // Codex requires non-persistent responses and rejects OpenAI
        // stream_options / max_output_tokens.
        object.insert("store".to_string(), JsonValue::Bool(false));
        object.remove("max_output_tokens");
        object.remove("stream_options");
        object.insert("stream".to_string(), JsonValue::Bool(stream));

        serde_json::to_vec(&body).map_err(|err| ExecError::Other(err.to_string()))
    }

    async fn send(
        &self,
        auth: &Auth,
        body: Vec<u8>,
        base_model: &str,
        stream: bool,
    ) -> Result<wreq::Response, ExecError> {
        let (token, account_id, base_url) = codex_creds(auth)?;
        let url = format!("{}/responses", base_url.trim_end_matches('/'));
        debug!(
            event = "upstream_request",
            provider = PROVIDER_NAME,
            model = %base_model,
            url = %url,
            is_stream = stream
        );

        let response = self
            .client(SharedClientKind::Upstream)?
            .post(&url)
            .headers(codex_headers(&token, account_id.as_deref(), stream)?)
            .body(body)
            .send()
            .await
            .map_err(|err| ExecError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            return Err(codex_status_error(status.as_u16(), &body));
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl ProviderExecutor for CodexExecutor {
    fn identifier(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn prepare_request(&self, headers: &mut HeaderMap, auth: &Auth) -> Result<(), ExecError> {
        let (token, account_id, _) = codex_creds(auth)?;
        headers.insert(AUTHORIZATION, bearer_value(&token)?);
        if let Some(account_id) = account_id {
            headers.insert(
                HeaderName::from_static("chatgpt-account-id"),
                HeaderValue::from_str(&account_id)
                    .map_err(|err| ExecError::InvalidCredential(err.to_string()))?,
            );
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
        let base_model = thinking::base_model(&req.model).to_string();
        let body = self.build_body(&req, &opts, &base_model, false)?;
        let response = self.send(auth, body, &base_model, false).await?;

        let resp_headers = response.headers().clone();
        let data = response
            .bytes()
            .await
            .map_err(|err| ExecError::Transport(err.to_string()))?;
        let payload = self.translator.translate_response(
            Dialect::OpenAIResponses,
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
        let base_model = thinking::base_model(&req.model).to_string();
        let body = self.build_body(&req, &opts, &base_model, true)?;
        let response = self.send(auth, body, &base_model, true).await?;

        let resp_headers = response.headers().clone();
        let upstream = Box::pin(response.bytes_stream());
        let (tx, rx) = mpsc::channel(32);
        let translator = self.translator.clone();
        let source = opts.source;
        let model = req.model.clone();
        let original = opts.original_request.clone();
        tokio::spawn(async move {
            forward_lines(PROVIDER_NAME, upstream, tx, move |line| {
                translator.translate_stream_chunk(
                    Dialect::OpenAIResponses,
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
            ExecError::Other(format!("codex executor: translated payload is not json: {err}"))
        })?;
        let bpe = bpe_for_model(&base_model)?;
        let tokens = count_openai_chat_tokens(&bpe, &body);
        Ok(ExecResponse {
            payload: Bytes::from(input_token_count_body(tokens)?),
            headers: HeaderMap::new(),
        })
    }

    async fn refresh(&self, auth: &Auth) -> Result<Auth, ExecError> {
        debug!(event = "refresh", provider = PROVIDER_NAME);
        let Some(refresh_token) = auth.refresh_token() else {
            return Ok(auth.clone());
        };

        let client = self.client(SharedClientKind::Login)?;
        let bundle = oauth::refresh_tokens_with_retry(
            &client,
            &oauth::token_url(oauth::DEFAULT_ISSUER),
            refresh_token,
            REFRESH_MAX_ATTEMPTS,
        )
        .await?;

        let mut refreshed = auth.clone();
        let meta = &mut refreshed.metadata;
        meta.insert(
            "access_token".to_string(),
            JsonValue::String(bundle.access_token),
        );
        if let Some(refresh_token) = bundle.refresh_token {
            meta.insert(
                "refresh_token".to_string(),
                JsonValue::String(refresh_token),
            );
        }
        if let Some(id_token) = bundle.id_token {
            let claims = oauth::parse_id_token_claims(&id_token);
            if let Some(email) = claims.email {
                meta.insert("email".to_string(), JsonValue::String(email));
            }
            if let Some(account_id) = claims.account_id {
                meta.insert("account_id".to_string(), JsonValue::String(account_id));
            }
            meta.insert("id_token".to_string(), JsonValue::String(id_token));
        }
        if let Some(expires_in) = bundle.expires_in {
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

fn codex_creds(auth: &Auth) -> Result<(String, Option<String>, String), ExecError> {
    let mut token = auth.attribute(ATTR_API_KEY).map(str::to_string);
    let base_url = auth
        .attribute(ATTR_BASE_URL)
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    if token.is_none() {
        token = auth.access_token().map(str::to_string);
    }
    let token = token.ok_or_else(|| {
        ExecError::InvalidCredential("codex: missing api_key/access_token".to_string())
    })?;
    let account_id = auth.metadata_str("account_id").map(str::to_string);
    Ok((token, account_id, base_url))
}

fn codex_status_error(status: u16, body: &[u8]) -> ExecError {
    let retry_after = parse_codex_retry_after(status, body, SystemTime::now());
    let mut error = StatusError::new(status, String::from_utf8_lossy(body).into_owned());
    error.retry_after = retry_after;
    ExecError::Status(error)
}

fn bearer_value(token: &str) -> Result<HeaderValue, ExecError> {
    HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|err| ExecError::InvalidCredential(err.to_string()))
}

fn codex_headers(
    token: &str,
    account_id: Option<&str>,
    stream: bool,
) -> Result<HeaderMap, ExecError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(AUTHORIZATION, bearer_value(token)?);
    if let Some(account_id) = account_id {
        headers.insert(
            HeaderName::from_static("chatgpt-account-id"),
            HeaderValue::from_str(account_id)
                .map_err(|err| ExecError::InvalidCredential(err.to_string()))?,
        );
    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use mproxy_core::IdentityTranslator;
    use std::collections::HashMap;

    fn executor() -> CodexExecutor {
        CodexExecutor::new(
            Arc::new(mproxy_common::Config::default()),
            Arc::new(IdentityTranslator),
        )
    }

    fn codex_auth() -> Auth {
        Auth {
            id: "codex-user.json".to_string(),
            provider: PROVIDER_NAME.to_string(),
            metadata: HashMap::from([
                ("access_token".to_string(), JsonValue::String("t".to_string())),
                ("account_id".to_string(), JsonValue::String("acc".to_string())),
            ]),
            ..Auth::default()
        }
    }

    #[test]
    fn body_forces_non_persistent_responses() {
        let exec = executor();
        let req = ExecRequest {
            model: "gpt-5(high)".to_string(),
            payload: Bytes::from_static(
                br#"{"input":"hi","max_output_tokens":5,"stream_options":{"include_usage":true}}"#,
            ),
        };
        let body = exec
            .build_body(&req, &ExecOptions::default(), "gpt-5", true)
            .expect("body");
        let value: JsonValue = serde_json::from_slice(&body).expect("json");
        assert_eq!(value["model"], "gpt-5");
        assert_eq!(value["store"], false);
        assert_eq!(value["stream"], true);
        assert_eq!(value["reasoning"]["effort"], "high");
        assert!(value.get("max_output_tokens").is_none());
        assert!(value.get("stream_options").is_none());
    }

    #[test]
    fn usage_limit_error_carries_retry_after() {
        let err = codex_status_error(
            429,
            br#"{"error":{"type":"usage_limit_reached","resets_in_seconds":120}}"#,
        );
        let status = err.status().expect("status error");
        assert_eq!(status.code, 429);
        assert_eq!(status.retry_after, Some(Duration::from_secs(120)));
    }

    #[test]
    fn other_429_has_no_retry_after() {
        let err = codex_status_error(429, br#"{"error":{"type":"server_error"}}"#);
        assert!(err.status().expect("status error").retry_after.is_none());
    }

    #[test]
    fn prepare_request_sets_auth_headers() {
        let exec = executor();
        let mut headers = HeaderMap::new();
        exec.prepare_request(&mut headers, &codex_auth())
            .expect("prepare");
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer t");
        assert_eq!(headers.get("chatgpt-account-id").unwrap(), "acc");
    }
}
