use serde::Deserialize;
use tracing::debug;

use mproxy_core::{ExecError, StatusError};

const TOKEN_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/token";
const CLIENT_ID: &str = "f0304373b74a44d2b584a3fb70ca9e56";

#[derive(Debug, Deserialize)]
pub(super) struct QwenTokenBundle {
    pub(super) access_token: String,
    #[serde(default)]
    pub(super) refresh_token: Option<String>,
    #[serde(default)]
    pub(super) resource_url: Option<String>,
    #[serde(default)]
    pub(super) expires_in: Option<u64>,
}

/// Exchanges a refresh token for a fresh Qwen bundle. Qwen rotates the
/// refresh token on some responses; callers must persist the rotation.
pub(super) async fn refresh_tokens(
    client: &wreq::Client,
    refresh_token: &str,
) -> Result<QwenTokenBundle, ExecError> {
    debug!(event = "token_refresh", provider = "qwen");
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
            format!("qwen token refresh failed: {body}"),
        )));
    }

    response
        .json::<QwenTokenBundle>()
        .await
        .map_err(|err| ExecError::Other(format!("qwen token refresh: invalid response: {err}")))
}
