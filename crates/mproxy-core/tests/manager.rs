use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use serde_json::Value as JsonValue;

use mproxy_core::{
    Auth, AuthStatus, CooldownReason, ExecError, ExecOptions, ExecRequest, ExecResponse,
    FillFirstSelector, ListFilter, Manager, ProviderExecutor, RoundRobinSelector, StatusError,
    StreamResult,
};

const PROVIDER: &str = "testprov";

/// Scripted executor: pops one status code per call from `failures`, then
/// succeeds. Tracks call and refresh counts.
struct ScriptedExecutor {
    failures: std::sync::Mutex<Vec<StatusError>>,
    refresh_error: Option<StatusError>,
    calls: AtomicU32,
    refreshes: AtomicU32,
}

impl ScriptedExecutor {
    fn new(failures: Vec<StatusError>) -> Self {
        Self {
            failures: std::sync::Mutex::new(failures),
            refresh_error: None,
            calls: AtomicU32::new(0),
            refreshes: AtomicU32::new(0),
        }
    }

    fn with_refresh_error(mut self, error: StatusError) -> Self {
        self.refresh_error = Some(error);
        self
    }

    fn next_failure(&self) -> Option<StatusError> {
        let mut guard = self.failures.lock().expect("failures lock");
        if guard.is_empty() {
            None
        } else {
            Some(guard.remove(0))
        }
    }
}

#[async_trait]
impl ProviderExecutor for ScriptedExecutor {
    fn identifier(&self) -> &'static str {
        PROVIDER
    }

    fn prepare_request(&self, _headers: &mut HeaderMap, _auth: &Auth) -> Result<(), ExecError> {
        Ok(())
    }

    async fn execute(
        &self,
        auth: &Auth,
        _req: ExecRequest,
        _opts: ExecOptions,
    ) -> Result<ExecResponse, ExecError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.next_failure() {
            return Err(failure.into());
        }
        Ok(ExecResponse {
            payload: Bytes::from(format!("ok:{}", auth.id)),
            headers: HeaderMap::new(),
        })
    }

    async fn execute_stream(
        &self,
        _auth: &Auth,
        _req: ExecRequest,
        _opts: ExecOptions,
    ) -> Result<StreamResult, ExecError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.next_failure() {
            return Err(failure.into());
        }
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        tx.send(Ok(Bytes::from_static(b"chunk")))
            .await
            .expect("send chunk");
        drop(tx);
        Ok(StreamResult {
            headers: HeaderMap::new(),
            chunks: rx,
        })
    }

    async fn refresh(&self, auth: &Auth) -> Result<Auth, ExecError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.refresh_error {
            return Err(error.clone().into());
        }
        let mut refreshed = auth.clone();
        refreshed.metadata.insert(
            "access_token".to_string(),
            JsonValue::String("new-token".to_string()),
        );
        refreshed.metadata.insert(
            "type".to_string(),
            JsonValue::String(PROVIDER.to_string()),
        );
        Ok(refreshed)
    }
}

fn oauth_auth(id: &str) -> Auth {
    Auth {
        id: id.to_string(),
        provider: PROVIDER.to_string(),
        metadata: HashMap::from([
            (
                "access_token".to_string(),
                JsonValue::String("old-token".to_string()),
            ),
            (
                "refresh_token".to_string(),
                JsonValue::String("rtok".to_string()),
            ),
        ]),
        ..Auth::default()
    }
}

fn request(model: &str) -> ExecRequest {
    ExecRequest {
        model: model.to_string(),
        payload: Bytes::from_static(b"{}"),
    }
}

#[tokio::test]
async fn execute_picks_and_runs_executor() {
    let executor = Arc::new(ScriptedExecutor::new(Vec::new()));
    let manager =
        Manager::new(Arc::new(FillFirstSelector::new())).with_executor(executor.clone());
    manager.register(oauth_auth("a")).await.expect("register");

    let resp = manager
        .execute(PROVIDER, request("m"), ExecOptions::default())
        .await
        .expect("execute");
    assert_eq!(resp.payload, Bytes::from_static(b"ok:a"));
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn execute_refreshes_once_on_401_and_retries() {
    let executor = Arc::new(ScriptedExecutor::new(vec![StatusError::new(
        401,
        "token expired",
    )]));
    let manager =
        Manager::new(Arc::new(FillFirstSelector::new())).with_executor(executor.clone());
    manager.register(oauth_auth("a")).await.expect("register");

    let resp = manager
        .execute(PROVIDER, request("m"), ExecOptions::default())
        .await
        .expect("execute should succeed after refresh");
    assert_eq!(resp.payload, Bytes::from_static(b"ok:a"));
    assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    assert_eq!(executor.refreshes.load(Ordering::SeqCst), 1);

    let auth = manager.get("a").await.expect("auth present");
    assert_eq!(auth.metadata_str("access_token"), Some("new-token"));
}

#[tokio::test]
async fn non_retryable_refresh_disables_auth() {
    let executor = Arc::new(
        ScriptedExecutor::new(vec![StatusError::new(401, "token expired")]).with_refresh_error(
            StatusError::new(400, r#"{"error":"invalid_grant","code":"refresh_token_reused"}"#),
        ),
    );
    let manager =
        Manager::new(Arc::new(FillFirstSelector::new())).with_executor(executor.clone());
    manager.register(oauth_auth("a")).await.expect("register");

    let err = manager
        .execute(PROVIDER, request("m"), ExecOptions::default())
        .await
        .expect_err("refresh failure should surface");
    assert!(err.to_string().contains("refresh_token_reused"));
    assert_eq!(executor.refreshes.load(Ordering::SeqCst), 1);

    let auth = manager.get("a").await.expect("auth present");
    assert_eq!(auth.status, AuthStatus::Disabled);
}

#[tokio::test]
async fn quota_429_records_cooldown_and_next_pick_avoids_auth() {
    let executor = Arc::new(ScriptedExecutor::new(vec![
        StatusError::new(429, "quota exhausted").with_retry_after(Duration::from_secs(3600)),
    ]));
    let manager =
        Manager::new(Arc::new(FillFirstSelector::new())).with_executor(executor.clone());
    manager.register(oauth_auth("a")).await.expect("register");
    manager.register(oauth_auth("b")).await.expect("register");

    let err = manager
        .execute(PROVIDER, request("m"), ExecOptions::default())
        .await
        .expect_err("first call fails with 429");
    assert_eq!(err.status().expect("status error").code, 429);

    let blocked = manager.get("a").await.expect("auth present");
    let state = blocked.model_states.get("m").expect("model state recorded");
    assert!(state.unavailable);
    assert!(state.quota.exceeded);
    assert!(state.next_retry_after.expect("next retry") > SystemTime::now());

    // Auth "a" is cooling down; the deterministic selector now lands on "b".
    let picked = manager.pick(PROVIDER, "m").await.expect("pick");
    assert_eq!(picked.id, "b");
}

#[tokio::test]
async fn upstream_5xx_records_transient_cooldown() {
    let executor = Arc::new(ScriptedExecutor::new(vec![StatusError::new(
        503,
        "upstream down",
    )]));
    let manager =
        Manager::new(Arc::new(FillFirstSelector::new())).with_executor(executor.clone());
    manager.register(oauth_auth("a")).await.expect("register");

    let _ = manager
        .execute(PROVIDER, request("m"), ExecOptions::default())
        .await
        .expect_err("5xx surfaces");
    let auth = manager.get("a").await.expect("auth present");
    let state = auth.model_states.get("m").expect("model state recorded");
    assert!(state.unavailable);
    assert!(!state.quota.exceeded);
}

#[tokio::test]
async fn cooldown_keys_use_base_model() {
    let manager = Manager::new(Arc::new(FillFirstSelector::new()));
    manager.register(oauth_auth("a")).await.expect("register");

    manager
        .mark_cooldown(
            "a",
            "test-model(high)",
            Duration::from_secs(60),
            CooldownReason::Quota,
        )
        .await
        .expect("mark cooldown");

    let auth = manager.get("a").await.expect("auth present");
    assert!(auth.model_states.contains_key("test-model"));
    assert!(!auth.model_states.contains_key("test-model(high)"));

    // The suffixed request is blocked by the base-model state.
    let err = manager
        .pick(PROVIDER, "test-model(low)")
        .await
        .expect_err("cooldown expected");
    assert_eq!(err.status_code(), 429);
}

#[tokio::test]
async fn all_cooling_down_surfaces_429_with_retry_after() {
    let executor = Arc::new(ScriptedExecutor::new(Vec::new()));
    let manager =
        Manager::new(Arc::new(RoundRobinSelector::new())).with_executor(executor.clone());
    manager.register(oauth_auth("a")).await.expect("register");
    manager
        .mark_cooldown("a", "m", Duration::from_secs(120), CooldownReason::Quota)
        .await
        .expect("mark cooldown");

    let err = manager
        .execute(PROVIDER, request("m"), ExecOptions::default())
        .await
        .expect_err("cooldown expected");
    let status = err.status().expect("status error");
    assert_eq!(status.code, 429);
    assert!(status.retry_after.expect("retry after") >= Duration::from_secs(1));
    assert!(status.message.contains("model_cooldown"));
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn execute_stream_retries_once_on_401() {
    let executor = Arc::new(ScriptedExecutor::new(vec![StatusError::new(
        401,
        "token expired",
    )]));
    let manager =
        Manager::new(Arc::new(FillFirstSelector::new())).with_executor(executor.clone());
    manager.register(oauth_auth("a")).await.expect("register");

    let mut stream = manager
        .execute_stream(PROVIDER, request("m"), ExecOptions::default())
        .await
        .expect("stream after refresh");
    let chunk = stream
        .chunks
        .recv()
        .await
        .expect("one chunk")
        .expect("chunk ok");
    assert_eq!(chunk, Bytes::from_static(b"chunk"));
    assert_eq!(executor.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn list_filters_by_provider_and_status() {
    let manager = Manager::new(Arc::new(FillFirstSelector::new()));
    manager.register(oauth_auth("a")).await.expect("register");
    let mut other = oauth_auth("b");
    other.provider = "other".to_string();
    manager.register(other).await.expect("register");
    manager
        .set_status("a", AuthStatus::Disabled)
        .await
        .expect("set status");

    let all = manager.list(&ListFilter::default()).await;
    assert_eq!(all.len(), 2);

    let active_testprov = manager
        .list(&ListFilter {
            provider: Some(PROVIDER.to_string()),
            active_only: true,
        })
        .await;
    assert!(active_testprov.is_empty());

    let mixed_active = manager
        .list(&ListFilter {
            provider: Some("mixed".to_string()),
            active_only: true,
        })
        .await;
    assert_eq!(mixed_active.len(), 1);
    assert_eq!(mixed_active[0].id, "b");
}

#[tokio::test]
async fn register_rejects_empty_id() {
    let manager = Manager::new(Arc::new(FillFirstSelector::new()));
    let err = manager
        .register(Auth::default())
        .await
        .expect_err("empty id rejected");
    assert!(err.to_string().contains("empty"));
}
