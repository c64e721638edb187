use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderValue, USER_AGENT};
use serde::Deserialize;
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
use crate::stream::forward_lines;
use crate::usage::{log_usage, parse_openai_stream_usage, parse_openai_usage};

pub const PROVIDER_NAME: &str = "iflow";

const DEFAULT_BASE_URL: &str = "https://apis.iflow.cn/v1";
const IFLOW_USER_AGENT: &str = "iflow-cli/0.4.0 (linux; x86_64)";
const TOKEN_URL: &str = "https://iflow.cn/oauth/token";
const CLIENT_ID: &str = "10009311001";

/// iFlow rides the OpenAI chat-completions dialect; the OAuth flow derives
/// a long-lived API key that is preferred over the access token.
pub struct IFlowExecutor {
    config: Arc<mproxy_common::Config>,
    translator: Arc<dyn PayloadTranslator>,
}

#[derive(Debug, Deserialize)]
struct IFlowTokenBundle {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default, rename = "apiKey")]
    api_key: Option<String>,
}

impl IFlowExecutor {
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
            Dialect::OpenAI,
            base_model,
            &req.payload,
            stream,
        );
        let mut body: JsonValue = serde_json::from_slice(&translated).map_err(|err| {
            ExecError::Other(format!("iflow executor: translated payload is not json: {err}"))
        })?;
        let Some(object) = body.as_object_mut() else {
            return Err(ExecError::Other(
                "iflow executor: translated payload is not an object".to_string(),
            ));
        };
        object.insert(
            "model".to_string(),
            JsonValue::String(base_model.to_string()),
        );
        if stream {
            object.insert("stream".to_string(), JsonValue::Bool(true));
            object.insert(
                "stream_options".to_string(),
                serde_json::json!({ "include_usage": true }),
            );
        }
        serde_json::to_vec(&body).map_err(|err| ExecError::Other(err.to_string()))
    }

    async fn send(
        &self,
        auth: &Auth,
        body: Vec<u8>,
        base_model: &str,
        stream: bool,
    ) -> Result<wreq::Response, ExecError> {
        let (key, base_url) = iflow_creds(auth);
        let key = key.ok_or_else(|| {
            ExecError::InvalidCredential("iflow: missing api_key/access_token".to_string())
        })?;
        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
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
            .headers(iflow_headers(&key, stream)?)
            .body(body)
            .send()
            .await
            .map_err(|err| ExecError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            return Err(ExecError::Status(StatusError::new(
                status.as_u16(),
                String::from_utf8_lossy(&body).into_owned(),
            )));
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl ProviderExecutor for IFlowExecutor {
    fn identifier(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn prepare_request(&self, headers: &mut HeaderMap, auth: &Auth) -> Result<(), ExecError> {
        let (key, _) = iflow_creds(auth);
        if let Some(key) = key {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {key}"))
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

    async fn refresh(&self, auth: &Auth) -> Result<Auth, ExecError> {
        debug!(event = "refresh", provider = PROVIDER_NAME);
        let Some(refresh_token) = auth.refresh_token() else {
            return Ok(auth.clone());
        };

        let client = self.client(SharedClientKind::Login)?;
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", CLIENT_ID),
        ];
        let response = client
            .post(TOKEN_URL)
            .form(&form)
            .send()
            .await
            .map_err(|err| ExecError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExecError::Status(StatusError::new(
                status.as_u16(),
                format!("iflow token refresh failed: {body}"),
            )));
        }
        let bundle = response
            .json::<IFlowTokenBundle>()
            .await
            .map_err(|err| ExecError::Other(format!("iflow token refresh: invalid response: {err}")))?;

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
        if let Some(api_key) = bundle.api_key {
            meta.insert("api_key".to_string(), JsonValue::String(api_key));
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

/// Key preference: explicit attribute, then the OAuth-derived `api_key`
/// persisted in metadata, then the raw access token.
fn iflow_creds(auth: &Auth) -> (Option<String>, String) {
    let key = auth
        .attribute(ATTR_API_KEY)
        .or_else(|| auth.metadata_str("api_key"))
        .or_else(|| auth.access_token())
        .map(str::to_string);
    let base_url = auth
        .attribute(ATTR_BASE_URL)
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    (key, base_url)
}

fn iflow_headers(key: &str, stream: bool) -> Result<HeaderMap, ExecError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {key}"))
            .map_err(|err| ExecError::InvalidCredential(err.to_string()))?,
    );
    headers.insert(USER_AGENT, HeaderValue::from_static(IFLOW_USER_AGENT));
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
