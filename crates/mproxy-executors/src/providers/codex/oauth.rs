use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::time::sleep;
use tracing::{debug, warn};

use mproxy_core::{ExecError, StatusError};

pub(crate) const CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";
pub(crate) const DEFAULT_ISSUER: &str = "https://auth.openai.com";

const REFRESH_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CodexTokenBundle {
    pub(crate) access_token: String,
    #[serde(default)]
    pub(crate) refresh_token: Option<String>,
    #[serde(default)]
    pub(crate) id_token: Option<String>,
    #[serde(default)]
    pub(crate) expires_in: Option<u64>,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    client_id: &'a str,
    grant_type: &'a str,
    refresh_token: &'a str,
    scope: &'a str,
}

#[derive(Serialize)]
struct ExchangeRequest<'a> {
    grant_type: &'a str,
    code: &'a str,
    redirect_uri: &'a str,
    client_id: &'a str,
    code_verifier: &'a str,
}

#[derive(Debug, Clone)]
pub(crate) struct PkceCodes {
    pub(crate) code_verifier: String,
    pub(crate) code_challenge: String,
}

pub(crate) fn token_url(issuer: &str) -> String {
    format!("{}/oauth/token", issuer.trim_end_matches('/'))
}

enum RefreshAttemptError {
    Retryable(ExecError),
    NonRetryable(ExecError),
}

/// Refresh with bounded retry. A response whose body marks the grant as
/// dead (`refresh_token_reused`, `invalid_grant`) aborts after the first
/// attempt: retrying a burned token family can only make things worse.
pub(crate) async fn refresh_tokens_with_retry(
    client: &wreq::Client,
    token_url: &str,
    refresh_token: &str,
    max_attempts: u32,
) -> Result<CodexTokenBundle, ExecError> {
    let max_attempts = max_attempts.max(1);
    let mut last_error: Option<ExecError> = None;

    for attempt in 1..=max_attempts {
        match try_refresh(client, token_url, refresh_token).await {
            Ok(bundle) => return Ok(bundle),
            Err(RefreshAttemptError::NonRetryable(err)) => {
                warn!(
                    event = "token_refresh_aborted",
                    provider = "codex",
                    attempt,
                    error = %err
                );
                return Err(err);
            }
            Err(RefreshAttemptError::Retryable(err)) => {
                warn!(
                    event = "token_refresh_retry",
                    provider = "codex",
                    attempt,
                    error = %err
                );
                last_error = Some(err);
                if attempt < max_attempts {
                    sleep(REFRESH_BACKOFF * attempt).await;
                }
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| ExecError::Other("codex token refresh failed".to_string())))
}

async fn try_refresh(
    client: &wreq::Client,
    token_url: &str,
    refresh_token: &str,
) -> Result<CodexTokenBundle, RefreshAttemptError> {
    debug!(event = "token_refresh", provider = "codex");
    let response = client
        .post(token_url)
        .json(&RefreshRequest {
            client_id: CLIENT_ID,
            grant_type: "refresh_token",
            refresh_token,
            scope: "openid profile email",
        })
        .send()
        .await
        .map_err(|err| RefreshAttemptError::Retryable(ExecError::Transport(err.to_string())))?;

    let status = response.status();
    if status.is_success() {
        return response.json::<CodexTokenBundle>().await.map_err(|err| {
            RefreshAttemptError::Retryable(ExecError::Other(format!(
                "codex token refresh: invalid response: {err}"
            )))
        });
    }

    let body = response.text().await.unwrap_or_default();
    let error = StatusError::new(
        status.as_u16(),
        format!("codex token refresh failed: {body}"),
    );
    if error.is_non_retryable_refresh() {
        Err(RefreshAttemptError::NonRetryable(error.into()))
    } else {
        Err(RefreshAttemptError::Retryable(error.into()))
    }
}

/// Authorization-code exchange used by both the callback and device flows.
pub(crate) async fn exchange_code_for_tokens(
    client: &wreq::Client,
    issuer: &str,
    redirect_uri: &str,
    code: &str,
    pkce: &PkceCodes,
) -> Result<CodexTokenBundle, ExecError> {
    let response = client
        .post(token_url(issuer))
        .form(&ExchangeRequest {
            grant_type: "authorization_code",
            code,
            redirect_uri,
            client_id: CLIENT_ID,
            code_verifier: &pkce.code_verifier,
        })
        .send()
        .await
        .map_err(|err| ExecError::Transport(err.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ExecError::Status(StatusError::new(
            status.as_u16(),
            format!("codex code exchange failed: {body}"),
        )));
    }

    response
        .json::<CodexTokenBundle>()
        .await
        .map_err(|err| ExecError::Other(format!("codex code exchange: invalid response: {err}")))
}

#[derive(Debug, Default)]
pub(crate) struct IdTokenClaims {
    pub(crate) email: Option<String>,
    pub(crate) plan: Option<String>,
    pub(crate) account_id: Option<String>,
}

/// Best-effort JWT payload decode; the token is already trusted because it
/// came straight from the issuer over TLS, so no signature check here.
pub(crate) fn parse_id_token_claims(id_token: &str) -> IdTokenClaims {
    let mut claims = IdTokenClaims::default();
    let mut parts = id_token.split('.');
    let payload_b64 = match (parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(s)) if !h.is_empty() && !p.is_empty() && !s.is_empty() => p,
        _ => return claims,
    };
    let Ok(payload_bytes) = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(payload_b64)
    else {
        return claims;
    };
    let Ok(payload) = serde_json::from_slice::<JsonValue>(&payload_bytes) else {
        return claims;
    };

    claims.email = payload
        .get("email")
        .and_then(JsonValue::as_str)
        .or_else(|| {
            payload
                .get("https://api.openai.com/profile")
                .and_then(|profile| profile.get("email"))
                .and_then(JsonValue::as_str)
        })
        .map(str::to_string);

    if let Some(auth) = payload.get("https://api.openai.com/auth") {
        claims.plan = auth
            .get("chatgpt_plan_type")
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        claims.account_id = auth
            .get("chatgpt_account_id")
            .and_then(JsonValue::as_str)
            .map(str::to_string);
    }
    claims
}

/// Persisted filename: email + plan type + short account hash, so multiple
/// workspaces of one user stay distinguishable on disk.
pub(crate) fn credential_file_name(email: &str, plan: &str, account_hash: &str) -> String {
    let mut parts = vec!["codex".to_string()];
    for part in [email, plan, account_hash] {
        let cleaned = sanitize_file_part(part);
        if !cleaned.is_empty() {
            parts.push(cleaned);
        }
    }
    format!("{}.json", parts.join("-"))
}

fn sanitize_file_part(part: &str) -> String {
    part.trim()
        .to_ascii_lowercase()
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '-' })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}
