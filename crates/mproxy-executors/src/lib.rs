//! Concrete per-provider executors for mproxy, plus the shared machinery
//! they lean on: the sliding-window rate limiter, the quota classifiers,
//! the stream-error chunk builder and the keyed HTTP client cache.

mod http_client;
mod oauth;
mod stream;
mod tokens;

pub mod providers;
pub mod quota;
pub mod rate_limit;
pub mod stream_error;
pub mod usage;

pub use providers::register_builtin_executors;
pub use stream_error::build_stream_error_chunk;

use mproxy_core::{ExecError, ExecOptions, StatusError};

/// Executors support exactly one operation shape each; any `alt` selector
/// is an inbound surface they do not implement.
pub(crate) fn ensure_supported_alt(
    provider: &'static str,
    opts: &ExecOptions,
) -> Result<(), ExecError> {
    match opts.alt.as_deref() {
        None | Some("") => Ok(()),
        Some(alt) => Err(ExecError::Status(StatusError::not_implemented(format!(
            "{provider}: {alt} not supported"
        )))),
    }
}
