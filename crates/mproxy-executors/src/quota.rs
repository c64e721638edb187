use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value as JsonValue;
use time::OffsetDateTime;
use time::macros::offset;

const QWEN_QUOTA_CODES: [&str; 2] = ["insufficient_quota", "quota_exceeded"];
const QWEN_QUOTA_MESSAGES: [&str; 3] = [
    "insufficient_quota",
    "quota exceeded",
    "free allocated quota exceeded",
];

/// Qwen signals daily-quota exhaustion as HTTP 403 with
/// `error.code = "insufficient_quota"`; some deployments use 429 or only
/// mention the quota in the message text.
pub fn is_qwen_quota_error(body: &[u8]) -> bool {
    let Ok(payload) = serde_json::from_slice::<JsonValue>(body) else {
        return false;
    };
    let error = &payload["error"];
    let code = lower_str(error.get("code"));
    let kind = lower_str(error.get("type"));
    // Exact code/type matches are the reliable signal.
    if QWEN_QUOTA_CODES.contains(&code.as_str()) || QWEN_QUOTA_CODES.contains(&kind.as_str()) {
        return true;
    }
    let message = lower_str(error.get("message"));
    QWEN_QUOTA_MESSAGES
        .iter()
        .any(|needle| message.contains(needle))
}

/// Remaps a Qwen quota failure to 429 with a cooldown lasting until the
/// next daily reset. Only 403/429 are inspected; other statuses pass
/// through untouched so unrelated errors never trigger quota logic.
pub fn wrap_qwen_error(status: u16, body: &[u8], now: SystemTime) -> (u16, Option<Duration>) {
    if (status == 403 || status == 429) && is_qwen_quota_error(body) {
        return (429, Some(time_until_next_day_utc8(now)));
    }
    (status, None)
}

/// Duration until the next midnight in UTC+8. Qwen's daily quota resets at
/// 00:00 Beijing time; the offset is fixed (no DST).
pub fn time_until_next_day_utc8(now: SystemTime) -> Duration {
    let local = OffsetDateTime::from(now).to_offset(offset!(+8));
    let Some(tomorrow) = local.date().next_day() else {
        return Duration::from_secs(1);
    };
    let midnight = tomorrow.midnight().assume_offset(offset!(+8));
    Duration::try_from(midnight - local).unwrap_or(Duration::from_secs(1))
}

/// Codex rate-limit responses carry their own reset hints. `resets_at`
/// (epoch seconds) wins when it is in the future; `resets_in_seconds` is
/// the fallback. Anything but a 429 `usage_limit_reached` yields `None`.
pub fn parse_codex_retry_after(status: u16, body: &[u8], now: SystemTime) -> Option<Duration> {
    if status != 429 {
        return None;
    }
    let payload: JsonValue = serde_json::from_slice(body).ok()?;
    let error = payload.get("error")?;
    if error.get("type").and_then(JsonValue::as_str) != Some("usage_limit_reached") {
        return None;
    }

    if let Some(resets_at) = error.get("resets_at").and_then(JsonValue::as_i64)
        && resets_at > 0
    {
        let resets = UNIX_EPOCH + Duration::from_secs(resets_at as u64);
        if let Ok(delta) = resets.duration_since(now)
            && !delta.is_zero()
        {
            return Some(delta);
        }
    }

    error
        .get("resets_in_seconds")
        .and_then(JsonValue::as_i64)
        .filter(|secs| *secs > 0)
        .map(|secs| Duration::from_secs(secs as u64))
}

fn lower_str(value: Option<&JsonValue>) -> String {
    value
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_ascii_lowercase()
}
