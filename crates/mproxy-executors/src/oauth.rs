use std::time::Duration;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

/// RFC3339 timestamp `duration` from now; used for the `expired` metadata
/// field the credential files round-trip.
pub(crate) fn rfc3339_in(duration: Duration) -> String {
    (OffsetDateTime::now_utc() + duration)
        .format(&Rfc3339)
        .unwrap_or_default()
}
