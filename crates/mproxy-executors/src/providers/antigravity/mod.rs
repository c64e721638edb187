use std::sync::{Arc, RwLock};

use bytes::Bytes;
use http::HeaderMap;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::debug;

use mproxy_core::auth::{ATTR_BASE_URL, META_RESOURCE_URL};
use mproxy_core::{
    Auth, Dialect, ExecError, ExecOptions, ExecRequest, ExecResponse, PayloadTranslator,
    ProviderExecutor, StatusError, StreamResult, thinking,
};

use crate::ensure_supported_alt;
use crate::http_client::{SharedClientKind, shared_client};
use crate::stream::forward_lines;

pub const PROVIDER_NAME: &str = "antigravity";

const DEFAULT_BASE_URL: &str = "https://server.antigravity.dev";
const ANTIGRAVITY_USER_AGENT: &str = "antigravity/1.11.5 (windows; amd64)";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThinkingSupport {
    pub levels: Vec<String>,
}

/// Model descriptor served by the primary Antigravity account and backfilled
/// onto the others.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub supported_generation_methods: Vec<String>,
    #[serde(default)]
    pub supported_parameters: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingSupport>,
}

/// Process-wide cache of the primary account's model list.
///
/// Once seeded it is monotonically non-empty: empty updates are dropped so
/// a flaky refresh can never wipe the served model set. Loads return deep
/// copies; callers can mutate what they get without poisoning the cache.
#[derive(Debug, Default)]
pub struct PrimaryModelCache {
    models: RwLock<Vec<ModelInfo>>,
}

impl PrimaryModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the cache was updated.
    pub fn store(&self, models: &[ModelInfo]) -> bool {
        if models.is_empty() {
            return false;
        }
        let mut guard = self.write_guard();
        *guard = models.to_vec();
        true
    }

    pub fn load(&self) -> Vec<ModelInfo> {
        self.read_guard().clone()
    }

    pub fn is_seeded(&self) -> bool {
        !self.read_guard().is_empty()
    }

    /// The cached list filtered by the auth's `excluded_models` attribute,
    /// mirroring how the primary account's models are backfilled onto the
    /// other registered accounts.
    pub fn models_for_auth(&self, auth: &Auth) -> Vec<ModelInfo> {
        self.read_guard()
            .iter()
            .filter(|model| !auth.is_model_excluded(model.id.trim()))
            .cloned()
            .collect()
    }

    fn read_guard(&self) -> std::sync::RwLockReadGuard<'_, Vec<ModelInfo>> {
        self.models
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_guard(&self) -> std::sync::RwLockWriteGuard<'_, Vec<ModelInfo>> {
        self.models
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Executor for the Antigravity Gemini-internal surface.
pub struct AntigravityExecutor {
    config: Arc<mproxy_common::Config>,
    translator: Arc<dyn PayloadTranslator>,
    models: Arc<PrimaryModelCache>,
}

impl AntigravityExecutor {
    pub fn new(
        config: Arc<mproxy_common::Config>,
        translator: Arc<dyn PayloadTranslator>,
        models: Arc<PrimaryModelCache>,
    ) -> Self {
        Self {
            config,
            translator,
            models,
        }
    }

    fn client(&self) -> Result<wreq::Client, ExecError> {
        shared_client(
            SharedClientKind::Upstream,
            self.config.outbound_proxy.as_deref(),
            self.config.request_timeout_secs,
        )
    }

    /// Requests for models this account excludes (or that the primary list
    /// does not carry) fail fast with 404 instead of burning an upstream
    /// call. An unseeded cache admits everything.
    fn ensure_model_admitted(&self, auth: &Auth, base_model: &str) -> Result<(), ExecError> {
        if !self.models.is_seeded() {
            return Ok(());
        }
        let admitted = self
            .models
            .models_for_auth(auth)
            .iter()
            .any(|model| model.id.eq_ignore_ascii_case(base_model));
        if admitted {
            return Ok(());
        }
        Err(ExecError::Status(StatusError::new(
            404,
            format!(r#"{{"error":{{"code":"model_not_found","message":"model {base_model} is not available for this credential"}}}}"#),
        )))
    }

    fn build_body(
        &self,
        req: &ExecRequest,
        opts: &ExecOptions,
        auth: &Auth,
        base_model: &str,
        stream: bool,
    ) -> Result<Vec<u8>, ExecError> {
        let translated = self.translator.translate_request(
            opts.source,
            Dialect::Gemini,
            base_model,
            &req.payload,
            stream,
        );
        let request: JsonValue = serde_json::from_slice(&translated).map_err(|err| {
            ExecError::Other(format!(
                "antigravity executor: translated payload is not json: {err}"
            ))
        })?;
        // The internal surface wraps the Gemini request with routing info.
        let wrapped = serde_json::json!({
            "model": base_model,
            "project": auth.metadata_str("project_id").unwrap_or_default(),
            "request": request,
        });
        serde_json::to_vec(&wrapped).map_err(|err| ExecError::Other(err.to_string()))
    }

    async fn send(
        &self,
        auth: &Auth,
        body: Vec<u8>,
        base_model: &str,
        stream: bool,
    ) -> Result<wreq::Response, ExecError> {
        let token = auth.access_token().ok_or_else(|| {
            ExecError::InvalidCredential("antigravity: missing access_token".to_string())
        })?;
        let base_url = antigravity_base_url(auth);
        let action = if stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        let url = format!("{}/v1internal:{action}", base_url.trim_end_matches('/'));
        debug!(
            event = "upstream_request",
            provider = PROVIDER_NAME,
            model = %base_model,
            url = %url,
            is_stream = stream
        );

        let response = self
            .client()?
            .post(&url)
            .headers(antigravity_headers(token, stream)?)
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
impl ProviderExecutor for AntigravityExecutor {
    fn identifier(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn prepare_request(&self, headers: &mut HeaderMap, auth: &Auth) -> Result<(), ExecError> {
        if let Some(token) = auth.access_token() {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}"))
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
        self.ensure_model_admitted(auth, &base_model)?;
        let body = self.build_body(&req, &opts, auth, &base_model, false)?;
        let response = self.send(auth, body, &base_model, false).await?;

        let resp_headers = response.headers().clone();
        let data = response
            .bytes()
            .await
            .map_err(|err| ExecError::Transport(err.to_string()))?;
        let unwrapped = unwrap_internal_response(&data);
        let payload = self.translator.translate_response(
            Dialect::Gemini,
            opts.source,
            &req.model,
            opts.original_request.as_deref(),
            &unwrapped,
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
        self.ensure_model_admitted(auth, &base_model)?;
        let body = self.build_body(&req, &opts, auth, &base_model, true)?;
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
                    Dialect::Gemini,
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
}

fn antigravity_base_url(auth: &Auth) -> String {
    auth.attribute(ATTR_BASE_URL)
        .or_else(|| auth.metadata_str(META_RESOURCE_URL))
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
}

fn antigravity_headers(token: &str, stream: bool) -> Result<HeaderMap, ExecError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|err| ExecError::InvalidCredential(err.to_string()))?,
    );
    headers.insert(
        USER_AGENT,
        HeaderValue::from_static(ANTIGRAVITY_USER_AGENT),
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

/// Non-stream responses arrive wrapped as `{"response": {...}}`; hand the
/// inner Gemini payload to the translator.
fn unwrap_internal_response(data: &[u8]) -> Bytes {
    if let Ok(value) = serde_json::from_slice::<JsonValue>(data)
        && let Some(inner) = value.get("response")
        && let Ok(bytes) = serde_json::to_vec(inner)
    {
        return Bytes::from(bytes);
    }
    Bytes::copy_from_slice(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn seed() -> Vec<ModelInfo> {
        vec![
            ModelInfo {
                id: "claude-sonnet-4-5".to_string(),
                ..ModelInfo::default()
            },
            ModelInfo {
                id: "gemini-2.5-pro".to_string(),
                ..ModelInfo::default()
            },
        ]
    }

    #[test]
    fn empty_update_does_not_overwrite_seeded_cache() {
        let cache = PrimaryModelCache::new();
        assert!(cache.store(&seed()));
        assert!(!cache.store(&[]));

        let models = cache.load();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].id, "claude-sonnet-4-5");
        assert_eq!(models[1].id, "gemini-2.5-pro");
    }

    #[test]
    fn load_returns_deep_copies() {
        let cache = PrimaryModelCache::new();
        cache.store(&[ModelInfo {
            id: "gpt-5".to_string(),
            display_name: "GPT-5".to_string(),
            supported_generation_methods: vec!["generateContent".to_string()],
            supported_parameters: vec!["temperature".to_string()],
            thinking: Some(ThinkingSupport {
                levels: vec!["high".to_string()],
            }),
        }]);

        let mut loaded = cache.load();
        loaded[0].id = "mutated-id".to_string();
        loaded[0].supported_generation_methods[0] = "mutated-method".to_string();
        loaded[0].supported_parameters[0] = "mutated-parameter".to_string();
        if let Some(thinking) = &mut loaded[0].thinking {
            thinking.levels[0] = "mutated-level".to_string();
        }

        let again = cache.load();
        assert_eq!(again[0].id, "gpt-5");
        assert_eq!(again[0].supported_generation_methods[0], "generateContent");
        assert_eq!(again[0].supported_parameters[0], "temperature");
        assert_eq!(
            again[0].thinking.as_ref().map(|t| t.levels[0].as_str()),
            Some("high")
        );
    }

    #[test]
    fn models_for_auth_respects_excluded_models() {
        let cache = PrimaryModelCache::new();
        cache.store(&seed());

        let auth = Auth {
            id: "ag-target".to_string(),
            provider: PROVIDER_NAME.to_string(),
            attributes: HashMap::from([(
                "excluded_models".to_string(),
                "gemini-2.5-pro".to_string(),
            )]),
            ..Auth::default()
        };

        let models = cache.models_for_auth(&auth);
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "claude-sonnet-4-5");
    }

    #[test]
    fn excluded_model_is_rejected_before_upstream() {
        let cache = Arc::new(PrimaryModelCache::new());
        cache.store(&seed());
        let exec = AntigravityExecutor::new(
            Arc::new(mproxy_common::Config::default()),
            Arc::new(mproxy_core::IdentityTranslator),
            cache,
        );

        let auth = Auth {
            id: "ag-target".to_string(),
            provider: PROVIDER_NAME.to_string(),
            attributes: HashMap::from([(
                "excluded_models".to_string(),
                "gemini-2.5-pro".to_string(),
            )]),
            ..Auth::default()
        };

        let err = exec
            .ensure_model_admitted(&auth, "gemini-2.5-pro")
            .expect_err("excluded model rejected");
        assert_eq!(err.status().expect("status error").code, 404);

        exec.ensure_model_admitted(&auth, "claude-sonnet-4-5")
            .expect("included model admitted");
    }

    #[test]
    fn unseeded_cache_admits_everything() {
        let exec = AntigravityExecutor::new(
            Arc::new(mproxy_common::Config::default()),
            Arc::new(mproxy_core::IdentityTranslator),
            Arc::new(PrimaryModelCache::new()),
        );
        let auth = Auth {
            id: "ag".to_string(),
            provider: PROVIDER_NAME.to_string(),
            ..Auth::default()
        };
        exec.ensure_model_admitted(&auth, "anything")
            .expect("unseeded cache admits");
    }

    #[test]
    fn internal_response_is_unwrapped() {
        let data = br#"{"response":{"candidates":[{"content":{"parts":[{"text":"hi"}]}}]}}"#;
        let inner = unwrap_internal_response(data);
        let value: JsonValue = serde_json::from_slice(&inner).expect("json");
        assert!(value.get("candidates").is_some());

        let passthrough = unwrap_internal_response(b"not json");
        assert_eq!(passthrough, Bytes::from_static(b"not json"));
    }
}
