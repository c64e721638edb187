mod fill_first;
mod round_robin;

pub use fill_first::FillFirstSelector;
pub use round_robin::{DEFAULT_MAX_CURSOR_KEYS, RoundRobinSelector};

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::auth::Auth;
use crate::thinking;

/// Sentinel provider tag meaning the inbound request did not bind a
/// specific provider. Selector errors redact the provider field for it so
/// the arbitrarily-chosen provider of the last blocked auth does not leak.
pub const MIXED_PROVIDER: &str = "mixed";

/// Picks one usable auth for `(provider, model)` from a snapshot of
/// candidates, or reports that every candidate is cooling down.
///
/// Implementations never mutate auths; any cursor state they keep must be
/// safe for concurrent callers.
pub trait AuthSelector: Send + Sync {
    fn name(&self) -> &'static str;

    fn pick(
        &self,
        provider: &str,
        model: &str,
        auths: &[Arc<Auth>],
    ) -> Result<Arc<Auth>, ModelCooldownError>;
}

/// All candidates for a model are blocked. Surfaces as HTTP 429 with an
/// aggregate `Retry-After` derived from the earliest recovery instant.
/// Its display form is the JSON error body handlers send downstream.
#[derive(Debug, Clone)]
pub struct ModelCooldownError {
    provider: String,
    model: String,
    retry_after: Duration,
    until: SystemTime,
}

impl std::fmt::Display for ModelCooldownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.body_json())
    }
}

impl std::error::Error for ModelCooldownError {}

impl ModelCooldownError {
    const MIN_RETRY_AFTER: Duration = Duration::from_secs(1);

    fn new(provider: &str, model: &str, earliest: Option<SystemTime>, now: SystemTime) -> Self {
        let until = earliest.unwrap_or(now + Self::MIN_RETRY_AFTER);
        let retry_after = until
            .duration_since(now)
            .unwrap_or(Self::MIN_RETRY_AFTER)
            .max(Self::MIN_RETRY_AFTER);
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            retry_after,
            until,
        }
    }

    pub fn status_code(&self) -> u16 {
        429
    }

    pub fn retry_after(&self) -> Duration {
        self.retry_after
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn headers(&self) -> Vec<(String, String)> {
        vec![(
            "Retry-After".to_string(),
            self.retry_after.as_secs().max(1).to_string(),
        )]
    }

    pub fn body_json(&self) -> String {
        let until = OffsetDateTime::from(self.until)
            .format(&Rfc3339)
            .unwrap_or_default();
        let mut error = serde_json::json!({
            "code": "model_cooldown",
            "message": format!("all credentials cooling down until {until}"),
        });
        if self.provider != MIXED_PROVIDER {
            error["provider"] = serde_json::Value::String(self.provider.clone());
        }
        serde_json::json!({ "error": error }).to_string()
    }
}

/// Shared filtering stage: drop blocked and per-model-disabled candidates,
/// then keep only the highest surviving priority bucket, sorted by id.
///
/// Filtering happens before bucketing, so when a high-priority bucket is
/// entirely cooling down selection degrades to the next bucket that still
/// has a usable auth.
pub(crate) fn usable_candidates(
    provider: &str,
    model: &str,
    auths: &[Arc<Auth>],
    now: SystemTime,
) -> Result<Vec<Arc<Auth>>, ModelCooldownError> {
    let base = thinking::base_model(model);
    let mut earliest: Option<SystemTime> = None;
    let mut usable: Vec<Arc<Auth>> = Vec::with_capacity(auths.len());

    for auth in auths {
        if !auth.status.is_active() || auth.model_state_disabled(base) {
            continue;
        }
        if let Some(until) = auth.blocked_until(base, now) {
            earliest = Some(match earliest {
                Some(current) if current <= until => current,
                _ => until,
            });
            continue;
        }
        usable.push(auth.clone());
    }

    if usable.is_empty() {
        return Err(ModelCooldownError::new(provider, model, earliest, now));
    }

    let top = usable.iter().map(|auth| auth.priority()).max().unwrap_or(0);
    usable.retain(|auth| auth.priority() == top);
    usable.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(usable)
}
