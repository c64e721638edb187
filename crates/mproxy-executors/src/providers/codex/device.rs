use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use mproxy_core::{Auth, ExecError};

use crate::http_client::{SharedClientKind, shared_client};
use crate::oauth::now_rfc3339;

use super::PROVIDER_NAME;
use super::oauth::{
    CLIENT_ID, DEFAULT_ISSUER, PkceCodes, credential_file_name, exchange_code_for_tokens,
    parse_id_token_claims,
};

const DEVICE_USER_CODE_URL: &str = "https://auth.openai.com/api/accounts/deviceauth/usercode";
const DEVICE_TOKEN_URL: &str = "https://auth.openai.com/api/accounts/deviceauth/token";
const DEVICE_VERIFICATION_URL: &str = "https://auth.openai.com/codex/device";
const DEVICE_TOKEN_EXCHANGE_REDIRECT_URI: &str = "https://auth.openai.com/deviceauth/callback";
const DEVICE_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct UserCodeRequest<'a> {
    client_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct UserCodeResponse {
    #[serde(default)]
    device_auth_id: String,
    #[serde(default)]
    user_code: String,
    /// Some deployments spell the field without the underscore.
    #[serde(default, rename = "usercode")]
    user_code_alt: String,
    #[serde(default)]
    interval: Option<JsonValue>,
}

#[derive(Serialize)]
struct TokenPollRequest<'a> {
    device_auth_id: &'a str,
    user_code: &'a str,
}

#[derive(Debug, Deserialize)]
struct DeviceTokenResponse {
    #[serde(default)]
    authorization_code: String,
    #[serde(default)]
    code_verifier: String,
    #[serde(default)]
    code_challenge: String,
}

/// Runs the Codex device-code flow end to end and returns a registrable
/// auth record. The caller is responsible for opening the verification URL
/// (or telling the user to); this function only logs it and polls.
pub async fn login_with_device_flow(config: &mproxy_common::Config) -> Result<Auth, ExecError> {
    let client = shared_client(
        SharedClientKind::Login,
        config.outbound_proxy.as_deref(),
        config.request_timeout_secs,
    )?;

    let user_code = request_user_code(&client).await?;
    let device_code = pick_non_empty(&user_code.user_code, &user_code.user_code_alt)
        .ok_or_else(|| {
            ExecError::Other("codex device flow did not return required fields".to_string())
        })?
        .to_string();
    let device_auth_id = user_code.device_auth_id.trim().to_string();
    if device_auth_id.is_empty() {
        return Err(ExecError::Other(
            "codex device flow did not return required fields".to_string(),
        ));
    }

    let interval = parse_poll_interval(user_code.interval.as_ref());
    info!(
        event = "device_login_start",
        provider = PROVIDER_NAME,
        verification_url = DEVICE_VERIFICATION_URL,
        user_code = %device_code,
        poll_interval_secs = interval.as_secs()
    );

    let token = poll_device_token(&client, &device_auth_id, &device_code, interval).await?;
    let authorization_code = token.authorization_code.trim().to_string();
    let code_verifier = token.code_verifier.trim().to_string();
    let code_challenge = token.code_challenge.trim().to_string();
    if authorization_code.is_empty() || code_verifier.is_empty() || code_challenge.is_empty() {
        return Err(ExecError::Other(
            "codex device token response missing required fields".to_string(),
        ));
    }

    let bundle = exchange_code_for_tokens(
        &client,
        DEFAULT_ISSUER,
        DEVICE_TOKEN_EXCHANGE_REDIRECT_URI,
        &authorization_code,
        &PkceCodes {
            code_verifier,
            code_challenge,
        },
    )
    .await?;

    let claims = bundle
        .id_token
        .as_deref()
        .map(parse_id_token_claims)
        .unwrap_or_default();
    let email = claims.email.clone().unwrap_or_default();
    if email.is_empty() {
        return Err(ExecError::Other(
            "codex token storage missing account information".to_string(),
        ));
    }
    let account_hash = claims
        .account_id
        .as_deref()
        .map(short_account_hash)
        .unwrap_or_default();
    let file_name =
        credential_file_name(&email, claims.plan.as_deref().unwrap_or_default(), &account_hash);

    let mut metadata: HashMap<String, JsonValue> = HashMap::from([
        (
            "access_token".to_string(),
            JsonValue::String(bundle.access_token.clone()),
        ),
        ("email".to_string(), JsonValue::String(email)),
        (
            "type".to_string(),
            JsonValue::String(PROVIDER_NAME.to_string()),
        ),
        ("last_refresh".to_string(), JsonValue::String(now_rfc3339())),
    ]);
    if let Some(refresh_token) = &bundle.refresh_token {
        metadata.insert(
            "refresh_token".to_string(),
            JsonValue::String(refresh_token.clone()),
        );
    }
    if let Some(id_token) = &bundle.id_token {
        metadata.insert("id_token".to_string(), JsonValue::String(id_token.clone()));
    }
    if let Some(account_id) = &claims.account_id {
        metadata.insert(
            "account_id".to_string(),
            JsonValue::String(account_id.clone()),
        );
    }

    info!(event = "device_login_success", provider = PROVIDER_NAME);
    Ok(Auth {
        id: file_name.clone(),
        provider: PROVIDER_NAME.to_string(),
        file_name,
        metadata,
        ..Auth::default()
    })
}

async fn request_user_code(client: &wreq::Client) -> Result<UserCodeResponse, ExecError> {
    let response = client
        .post(DEVICE_USER_CODE_URL)
        .json(&UserCodeRequest {
            client_id: CLIENT_ID,
        })
        .send()
        .await
        .map_err(|err| ExecError::Transport(format!("codex device code request: {err}")))?;

    let status = response.status();
    if !status.is_success() {
        if status.as_u16() == 404 {
            return Err(ExecError::Other(format!(
                "codex device endpoint is unavailable (status {status})"
            )));
        }
        let body = non_empty_body(response.text().await.unwrap_or_default());
        return Err(ExecError::Other(format!(
            "codex device code request failed with status {status}: {body}"
        )));
    }

    response
        .json::<UserCodeResponse>()
        .await
        .map_err(|err| ExecError::Other(format!("codex device code response: {err}")))
}

async fn poll_device_token(
    client: &wreq::Client,
    device_auth_id: &str,
    user_code: &str,
    interval: Duration,
) -> Result<DeviceTokenResponse, ExecError> {
    let deadline = Instant::now() + DEVICE_TIMEOUT;

    loop {
        if Instant::now() > deadline {
            return Err(ExecError::Other(
                "codex device authentication timed out after 15 minutes".to_string(),
            ));
        }

        let response = client
            .post(DEVICE_TOKEN_URL)
            .json(&TokenPollRequest {
                device_auth_id,
                user_code,
            })
            .send()
            .await
            .map_err(|err| ExecError::Transport(format!("codex device poll: {err}")))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<DeviceTokenResponse>()
                .await
                .map_err(|err| ExecError::Other(format!("codex device token response: {err}")));
        }

        // 403/404 while the user has not approved yet means "pending".
        if status.as_u16() == 403 || status.as_u16() == 404 {
            sleep(interval).await;
            continue;
        }

        let body = non_empty_body(response.text().await.unwrap_or_default());
        warn!(
            event = "device_login_poll_failed",
            provider = PROVIDER_NAME,
            status = status.as_u16()
        );
        return Err(ExecError::Other(format!(
            "codex device token polling failed with status {status}: {body}"
        )));
    }
}

/// The poll-interval hint arrives either as a JSON number or as a numeric
/// string depending on server version; anything unusable falls back to the
/// default.
fn parse_poll_interval(raw: Option<&JsonValue>) -> Duration {
    match raw {
        Some(JsonValue::Number(number)) => number
            .as_i64()
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(secs as u64))
            .unwrap_or(DEFAULT_POLL_INTERVAL),
        Some(JsonValue::String(text)) => text
            .trim()
            .parse::<i64>()
            .ok()
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(secs as u64))
            .unwrap_or(DEFAULT_POLL_INTERVAL),
        _ => DEFAULT_POLL_INTERVAL,
    }
}

fn short_account_hash(account_id: &str) -> String {
    let account_id = account_id.trim();
    if account_id.is_empty() {
        return String::new();
    }
    let digest = Sha256::digest(account_id.as_bytes());
    let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
    hex[..8].to_string()
}

fn pick_non_empty<'a>(first: &'a str, second: &'a str) -> Option<&'a str> {
    let first = first.trim();
    if !first.is_empty() {
        return Some(first);
    }
    let second = second.trim();
    if second.is_empty() { None } else { Some(second) }
}

fn non_empty_body(body: String) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "empty response body".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_interval_accepts_number_and_string() {
        assert_eq!(
            parse_poll_interval(Some(&serde_json::json!(7))),
            Duration::from_secs(7)
        );
        assert_eq!(
            parse_poll_interval(Some(&serde_json::json!("9"))),
            Duration::from_secs(9)
        );
    }

    #[test]
    fn poll_interval_falls_back_on_garbage() {
        assert_eq!(parse_poll_interval(None), DEFAULT_POLL_INTERVAL);
        assert_eq!(
            parse_poll_interval(Some(&serde_json::json!(0))),
            DEFAULT_POLL_INTERVAL
        );
        assert_eq!(
            parse_poll_interval(Some(&serde_json::json!(-3))),
            DEFAULT_POLL_INTERVAL
        );
        assert_eq!(
            parse_poll_interval(Some(&serde_json::json!("soon"))),
            DEFAULT_POLL_INTERVAL
        );
        assert_eq!(
            parse_poll_interval(Some(&serde_json::json!({"seconds": 5}))),
            DEFAULT_POLL_INTERVAL
        );
    }

    #[test]
    fn account_hash_is_eight_hex_chars() {
        let hash = short_account_hash("acc-123");
        assert_eq!(hash.len(), 8);
        assert!(hash.chars().all(|ch| ch.is_ascii_hexdigit()));
        assert_eq!(hash, short_account_hash("acc-123"));
        assert_ne!(hash, short_account_hash("acc-124"));
        assert_eq!(short_account_hash("  "), "");
    }

    #[test]
    fn user_code_fallback_field() {
        assert_eq!(pick_non_empty("", "ALT-CODE"), Some("ALT-CODE"));
        assert_eq!(pick_non_empty("MAIN", "ALT"), Some("MAIN"));
        assert_eq!(pick_non_empty(" ", ""), None);
    }
}
