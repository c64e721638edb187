use std::collections::HashMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const ATTR_PRIORITY: &str = "priority";
pub const ATTR_API_KEY: &str = "api_key";
pub const ATTR_BASE_URL: &str = "base_url";
pub const ATTR_VIRTUAL_PARENT: &str = "gemini_virtual_parent";
pub const ATTR_EXCLUDED_MODELS: &str = "excluded_models";

pub const META_ACCESS_TOKEN: &str = "access_token";
pub const META_REFRESH_TOKEN: &str = "refresh_token";
pub const META_RESOURCE_URL: &str = "resource_url";
pub const META_TYPE: &str = "type";
pub const META_LAST_REFRESH: &str = "last_refresh";
pub const META_EXPIRED: &str = "expired";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthStatus {
    #[default]
    Active,
    Disabled,
}

impl AuthStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, AuthStatus::Active)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaState {
    pub exceeded: bool,
    pub next_recover_at: Option<SystemTime>,
}

/// Per-(auth, model) health. Keys in `Auth::model_states` are always the
/// base model name; thinking suffixes never reach the state map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelState {
    pub status: AuthStatus,
    pub unavailable: bool,
    pub next_retry_after: Option<SystemTime>,
    pub quota: QuotaState,
}

/// One upstream credential: OAuth material or a plain API key plus the
/// per-model health states the selector consults.
///
/// Auths are only mutated through the [`Manager`](crate::Manager); everything
/// else reads `Arc<Auth>` snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Auth {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, JsonValue>,
    /// Opaque provider-specific credential blob used when persisting to disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<JsonValue>,
    #[serde(default)]
    pub status: AuthStatus,
    #[serde(default)]
    pub model_states: HashMap<String, ModelState>,
}

impl Auth {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(|value| value.as_str())
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    /// Scheduling priority from the `priority` attribute; higher wins.
    /// Malformed or missing values count as 0.
    pub fn priority(&self) -> i64 {
        self.attribute(ATTR_PRIORITY)
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }

    pub fn virtual_parent(&self) -> Option<&str> {
        self.attribute(ATTR_VIRTUAL_PARENT)
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.metadata_str(META_REFRESH_TOKEN)
    }

    pub fn access_token(&self) -> Option<&str> {
        self.metadata_str(META_ACCESS_TOKEN)
    }

    pub fn is_model_excluded(&self, model: &str) -> bool {
        let Some(raw) = self.attribute(ATTR_EXCLUDED_MODELS) else {
            return false;
        };
        raw.split(',')
            .map(|entry| entry.trim())
            .filter(|entry| !entry.is_empty())
            .any(|entry| entry.eq_ignore_ascii_case(model))
    }

    /// Returns the instant this auth stops being blocked for `base_model`,
    /// or `None` when it is usable now. An `unavailable` flag without a
    /// future `next_retry_after` is a stale marker and does not block.
    pub fn blocked_until(&self, base_model: &str, now: SystemTime) -> Option<SystemTime> {
        let state = self.model_states.get(base_model)?;
        if !state.unavailable {
            return None;
        }
        match state.next_retry_after {
            Some(next) if next > now => Some(next),
            _ => None,
        }
    }

    pub fn model_state_disabled(&self, base_model: &str) -> bool {
        self.model_states
            .get(base_model)
            .map(|state| !state.status.is_active())
            .unwrap_or(false)
    }
}

/// Redacted form of an auth ID for logging: keeps a short prefix/suffix so
/// events can still be correlated.
pub fn redact_auth_id(id: &str) -> String {
    if id.len() <= 8 {
        return id.to_string();
    }
    format!("{}...{}", &id[..4], &id[id.len() - 4..])
}
