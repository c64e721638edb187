use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use mproxy_core::ExecError;

/// Upstream traffic and login flows get separate connection pools; some
/// upstreams fingerprint clients and must not see login-flow connections
/// reused for inference calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum SharedClientKind {
    Upstream,
    Login,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    kind: SharedClientKind,
    proxy: Option<String>,
    timeout_secs: u64,
}

static CLIENT_CACHE: OnceLock<Mutex<HashMap<ClientKey, wreq::Client>>> = OnceLock::new();

pub(crate) fn shared_client(
    kind: SharedClientKind,
    proxy: Option<&str>,
    timeout_secs: u64,
) -> Result<wreq::Client, ExecError> {
    let key = ClientKey {
        kind,
        proxy: normalize_proxy(proxy),
        timeout_secs,
    };

    let cache = CLIENT_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache
        .lock()
        .map_err(|_| ExecError::Other("http client cache lock failed".to_string()))?;

    if let Some(client) = guard.get(&key) {
        return Ok(client.clone());
    }

    let client = build_client(key.proxy.as_deref(), key.timeout_secs)?;
    guard.insert(key, client.clone());
    Ok(client)
}

fn build_client(proxy: Option<&str>, timeout_secs: u64) -> Result<wreq::Client, ExecError> {
    let mut builder = wreq::Client::builder();
    if let Some(proxy_url) = proxy {
        builder = builder
            .proxy(wreq::Proxy::all(proxy_url).map_err(|err| ExecError::Other(err.to_string()))?);
    }
    if timeout_secs > 0 {
        builder = builder.timeout(Duration::from_secs(timeout_secs));
    }
    builder
        .build()
        .map_err(|err| ExecError::Other(err.to_string()))
}

fn normalize_proxy(value: Option<&str>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}
