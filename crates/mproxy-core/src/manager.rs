use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::auth::{Auth, AuthStatus, redact_auth_id};
use crate::errors::{ExecError, ManagerError, StatusError};
use crate::executor::{ExecOptions, ExecRequest, ExecResponse, ProviderExecutor, StreamResult};
use crate::selector::{AuthSelector, MIXED_PROVIDER, ModelCooldownError};
use crate::storage::TokenStore;
use crate::thinking;

const RATE_LIMIT_FALLBACK: Duration = Duration::from_secs(30);
const TRANSIENT_COOLDOWN: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownReason {
    RateLimit,
    Quota,
    Timeout,
    Upstream5xx,
    Manual,
}

impl CooldownReason {
    fn as_str(&self) -> &'static str {
        match self {
            CooldownReason::RateLimit => "rate_limit",
            CooldownReason::Quota => "quota",
            CooldownReason::Timeout => "timeout",
            CooldownReason::Upstream5xx => "upstream_5xx",
            CooldownReason::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub provider: Option<String>,
    pub active_only: bool,
}

/// Thread-safe registry owning the credential set.
///
/// All auth mutation funnels through here: cooldown recording, refresh, and
/// the one-shot 401 refresh-and-retry policy live at this layer so the
/// executors stay stateless. Reads hand out `Arc<Auth>` snapshots; writers
/// clone, mutate and swap.
pub struct Manager {
    auths: RwLock<HashMap<String, Arc<Auth>>>,
    selector: Arc<dyn AuthSelector>,
    executors: HashMap<String, Arc<dyn ProviderExecutor>>,
    store: Option<Arc<dyn TokenStore>>,
}

impl Manager {
    pub fn new(selector: Arc<dyn AuthSelector>) -> Self {
        Self {
            auths: RwLock::new(HashMap::new()),
            selector,
            executors: HashMap::new(),
            store: None,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn ProviderExecutor>) -> Self {
        self.executors
            .insert(executor.identifier().to_string(), executor);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn register(&self, auth: Auth) -> Result<Arc<Auth>, ManagerError> {
        if auth.id.trim().is_empty() {
            return Err(ManagerError::EmptyAuthId);
        }
        let auth = Arc::new(auth);
        self.auths
            .write()
            .await
            .insert(auth.id.clone(), auth.clone());
        info!(
            event = "auth_registered",
            auth = %redact_auth_id(&auth.id),
            provider = %auth.provider
        );
        Ok(auth)
    }

    pub async fn unregister(&self, auth_id: &str) -> Option<Arc<Auth>> {
        let removed = self.auths.write().await.remove(auth_id);
        if removed.is_some() {
            info!(event = "auth_unregistered", auth = %redact_auth_id(auth_id));
        }
        removed
    }

    pub async fn get(&self, auth_id: &str) -> Option<Arc<Auth>> {
        self.auths.read().await.get(auth_id).cloned()
    }

    pub async fn list(&self, filter: &ListFilter) -> Vec<Arc<Auth>> {
        let guard = self.auths.read().await;
        let mut auths: Vec<Arc<Auth>> = guard
            .values()
            .filter(|auth| {
                if filter.active_only && !auth.status.is_active() {
                    return false;
                }
                match &filter.provider {
                    Some(provider) if provider.as_str() != MIXED_PROVIDER => {
                        auth.provider == *provider
                    }
                    _ => true,
                }
            })
            .cloned()
            .collect();
        auths.sort_by(|a, b| a.id.cmp(&b.id));
        auths
    }

    /// Delegates to the configured selector over the active snapshot for
    /// `provider` (`"mixed"` spans every provider).
    pub async fn pick(
        &self,
        provider: &str,
        model: &str,
    ) -> Result<Arc<Auth>, ModelCooldownError> {
        let auths = self
            .list(&ListFilter {
                provider: Some(provider.to_string()),
                active_only: true,
            })
            .await;
        self.selector.pick(provider, model, &auths)
    }

    pub async fn mark_cooldown(
        &self,
        auth_id: &str,
        model: &str,
        retry_after: Duration,
        reason: CooldownReason,
    ) -> Result<Arc<Auth>, ManagerError> {
        let base = thinking::base_model(model).to_string();
        let until = SystemTime::now() + retry_after;
        let updated = self
            .update_auth(auth_id, |auth| {
                let state = auth.model_states.entry(base.clone()).or_default();
                state.unavailable = true;
                state.next_retry_after = Some(until);
                if reason == CooldownReason::Quota {
                    state.quota.exceeded = true;
                    state.quota.next_recover_at = Some(until);
                }
            })
            .await?;
        info!(
            event = "model_cooldown_start",
            auth = %redact_auth_id(auth_id),
            model = %base,
            reason = reason.as_str(),
            retry_after_secs = retry_after.as_secs()
        );
        Ok(updated)
    }

    pub async fn clear_cooldown(
        &self,
        auth_id: &str,
        model: &str,
    ) -> Result<Arc<Auth>, ManagerError> {
        let base = thinking::base_model(model).to_string();
        self.update_auth(auth_id, |auth| {
            if let Some(state) = auth.model_states.get_mut(&base) {
                state.unavailable = false;
                state.next_retry_after = None;
                state.quota.exceeded = false;
                state.quota.next_recover_at = None;
            }
        })
        .await
    }

    pub async fn set_status(
        &self,
        auth_id: &str,
        status: AuthStatus,
    ) -> Result<Arc<Auth>, ManagerError> {
        self.update_auth(auth_id, |auth| auth.status = status).await
    }

    /// Runs the provider refresh for one auth and swaps in the result.
    ///
    /// A non-retryable refresh failure (reused/invalid refresh token)
    /// disables the auth: its tokens cannot recover without a new login.
    pub async fn refresh(&self, auth_id: &str) -> Result<Arc<Auth>, ExecError> {
        let auth = self
            .get(auth_id)
            .await
            .ok_or_else(|| ExecError::Other(ManagerError::AuthNotFound(auth_id.into()).to_string()))?;
        let executor = self.executor_for(&auth.provider)?;

        match executor.refresh(&auth).await {
            Ok(refreshed) => {
                let refreshed = Arc::new(refreshed);
                self.auths
                    .write()
                    .await
                    .insert(auth_id.to_string(), refreshed.clone());
                self.persist(&refreshed);
                info!(
                    event = "auth_refreshed",
                    auth = %redact_auth_id(auth_id),
                    provider = %refreshed.provider
                );
                Ok(refreshed)
            }
            Err(err) => {
                if err
                    .status()
                    .is_some_and(StatusError::is_non_retryable_refresh)
                {
                    warn!(
                        event = "auth_disabled",
                        auth = %redact_auth_id(auth_id),
                        reason = "refresh_non_retryable"
                    );
                    let _ = self.set_status(auth_id, AuthStatus::Disabled).await;
                }
                Err(err)
            }
        }
    }

    pub async fn execute(
        &self,
        provider: &str,
        req: ExecRequest,
        opts: ExecOptions,
    ) -> Result<ExecResponse, ExecError> {
        let (auth, executor) = self.pick_with_executor(provider, &req.model).await?;
        let model = req.model.clone();
        match executor.execute(&auth, req.clone(), opts.clone()).await {
            Err(ExecError::Status(status))
                if status.code == 401 && auth.refresh_token().is_some() =>
            {
                let refreshed = self.refresh_for_retry(&auth, &status).await?;
                self.settle(
                    &refreshed.id,
                    &model,
                    executor.execute(&refreshed, req, opts).await,
                )
                .await
            }
            outcome => self.settle(&auth.id, &model, outcome).await,
        }
    }

    pub async fn execute_stream(
        &self,
        provider: &str,
        req: ExecRequest,
        opts: ExecOptions,
    ) -> Result<StreamResult, ExecError> {
        let (auth, executor) = self.pick_with_executor(provider, &req.model).await?;
        let model = req.model.clone();
        match executor
            .execute_stream(&auth, req.clone(), opts.clone())
            .await
        {
            Err(ExecError::Status(status))
                if status.code == 401 && auth.refresh_token().is_some() =>
            {
                let refreshed = self.refresh_for_retry(&auth, &status).await?;
                self.settle(
                    &refreshed.id,
                    &model,
                    executor.execute_stream(&refreshed, req, opts).await,
                )
                .await
            }
            outcome => self.settle(&auth.id, &model, outcome).await,
        }
    }

    pub async fn count_tokens(
        &self,
        provider: &str,
        req: ExecRequest,
        opts: ExecOptions,
    ) -> Result<ExecResponse, ExecError> {
        let (auth, executor) = self.pick_with_executor(provider, &req.model).await?;
        executor.count_tokens(&auth, req, opts).await
    }

    async fn pick_with_executor(
        &self,
        provider: &str,
        model: &str,
    ) -> Result<(Arc<Auth>, Arc<dyn ProviderExecutor>), ExecError> {
        let auth = self
            .pick(provider, model)
            .await
            .map_err(cooldown_to_status)?;
        let executor = self.executor_for(&auth.provider)?;
        Ok((auth, executor))
    }

    fn executor_for(&self, provider: &str) -> Result<Arc<dyn ProviderExecutor>, ExecError> {
        self.executors
            .get(provider)
            .cloned()
            .ok_or_else(|| ExecError::Other(ManagerError::NoExecutor(provider.into()).to_string()))
    }

    async fn refresh_for_retry(
        &self,
        auth: &Arc<Auth>,
        status: &StatusError,
    ) -> Result<Arc<Auth>, ExecError> {
        debug!(
            event = "auth_refresh_on_401",
            auth = %redact_auth_id(&auth.id),
            upstream_status = status.code
        );
        self.refresh(&auth.id).await
    }

    /// Records a terminal status error into model state before returning it.
    async fn settle<T>(
        &self,
        auth_id: &str,
        model: &str,
        outcome: Result<T, ExecError>,
    ) -> Result<T, ExecError> {
        if let Err(ExecError::Status(status)) = &outcome {
            self.observe_status_error(auth_id, model, status).await;
        }
        outcome
    }

    async fn observe_status_error(&self, auth_id: &str, model: &str, status: &StatusError) {
        let (retry_after, reason) = match status.code {
            429 => match status.retry_after {
                Some(retry_after) => (retry_after, CooldownReason::Quota),
                None => (RATE_LIMIT_FALLBACK, CooldownReason::RateLimit),
            },
            408 => (TRANSIENT_COOLDOWN, CooldownReason::Timeout),
            code if (500..600).contains(&code) => (TRANSIENT_COOLDOWN, CooldownReason::Upstream5xx),
            _ => return,
        };
        if let Err(err) = self.mark_cooldown(auth_id, model, retry_after, reason).await {
            warn!(
                event = "cooldown_record_failed",
                auth = %redact_auth_id(auth_id),
                error = %err
            );
        }
    }

    async fn update_auth<F>(&self, auth_id: &str, mutate: F) -> Result<Arc<Auth>, ManagerError>
    where
        F: FnOnce(&mut Auth),
    {
        let mut guard = self.auths.write().await;
        let current = guard
            .get(auth_id)
            .ok_or_else(|| ManagerError::AuthNotFound(auth_id.to_string()))?;
        let mut next = (**current).clone();
        mutate(&mut next);
        let next = Arc::new(next);
        guard.insert(auth_id.to_string(), next.clone());
        Ok(next)
    }

    fn persist(&self, auth: &Auth) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(err) = store.save(auth) {
            warn!(
                event = "auth_persist_failed",
                auth = %redact_auth_id(&auth.id),
                error = %err
            );
        }
    }
}

fn cooldown_to_status(err: ModelCooldownError) -> ExecError {
    let mut status = StatusError::new(err.status_code(), err.body_json());
    status.retry_after = Some(err.retry_after());
    ExecError::Status(status)
}
