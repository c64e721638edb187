//! Core credential-scheduling abstractions for mproxy.
//!
//! This crate intentionally does **not** depend on any concrete HTTP
//! client. Provider executors implement [`ProviderExecutor`] in a sibling
//! crate and perform the IO; everything here is the data model, the
//! selector machinery and the manager that owns credential health.

pub mod auth;
pub mod errors;
pub mod executor;
pub mod manager;
pub mod selector;
pub mod storage;
pub mod thinking;
pub mod translate;

pub use auth::{Auth, AuthStatus, ModelState, QuotaState, redact_auth_id};
pub use errors::{ExecError, ManagerError, StatusError};
pub use executor::{
    ChunkReceiver, ExecOptions, ExecRequest, ExecResponse, ProviderExecutor, StreamResult,
};
pub use manager::{CooldownReason, ListFilter, Manager};
pub use selector::{
    AuthSelector, FillFirstSelector, MIXED_PROVIDER, ModelCooldownError, RoundRobinSelector,
};
pub use storage::{FileTokenStore, TokenStorage, TokenStore};
pub use translate::{Dialect, IdentityTranslator, PayloadTranslator};
