use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use tokio::sync::mpsc;

use crate::auth::Auth;
use crate::errors::ExecError;
use crate::translate::Dialect;

/// One inbound call after classification: the requested model (possibly
/// carrying a thinking suffix) and the raw inbound-dialect payload.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub model: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Alternate operation selector (e.g. `responses/compact`); executors
    /// reject values they do not support with HTTP 501.
    pub alt: Option<String>,
    /// Dialect the inbound payload is written in.
    pub source: Dialect,
    /// The untranslated inbound payload, when the handler kept a copy.
    pub original_request: Option<Bytes>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            alt: None,
            source: Dialect::OpenAI,
            original_request: None,
        }
    }
}

#[derive(Debug)]
pub struct ExecResponse {
    pub payload: Bytes,
    pub headers: HeaderMap,
}

pub type ChunkReceiver = mpsc::Receiver<Result<Bytes, ExecError>>;

/// A live upstream stream: response headers plus translated chunks in
/// upstream order. An `Err` item is terminal; the channel closes after it.
#[derive(Debug)]
pub struct StreamResult {
    pub headers: HeaderMap,
    pub chunks: ChunkReceiver,
}

/// Stateless driver for one upstream provider.
///
/// Executors perform IO and classification only; credential health updates
/// happen at the [`Manager`](crate::Manager), which observes the returned
/// [`StatusError`](crate::StatusError)s. Dropping a returned future or
/// stream receiver cancels the upstream call.
#[async_trait]
pub trait ProviderExecutor: Send + Sync {
    fn identifier(&self) -> &'static str;

    /// Inject this provider's credential material into an outgoing header
    /// map (used for pass-through requests built elsewhere).
    fn prepare_request(&self, headers: &mut HeaderMap, auth: &Auth) -> Result<(), ExecError>;

    async fn execute(
        &self,
        auth: &Auth,
        req: ExecRequest,
        opts: ExecOptions,
    ) -> Result<ExecResponse, ExecError>;

    async fn execute_stream(
        &self,
        auth: &Auth,
        req: ExecRequest,
        opts: ExecOptions,
    ) -> Result<StreamResult, ExecError>;

    async fn count_tokens(
        &self,
        _auth: &Auth,
        _req: ExecRequest,
        _opts: ExecOptions,
    ) -> Result<ExecResponse, ExecError> {
        Err(ExecError::Other(format!(
            "{}: count_tokens not supported",
            self.identifier()
        )))
    }

    /// Refresh OAuth material and return the updated auth. Providers whose
    /// credentials never expire return the input unchanged.
    async fn refresh(&self, auth: &Auth) -> Result<Auth, ExecError> {
        Ok(auth.clone())
    }
}
