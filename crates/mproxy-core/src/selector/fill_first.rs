use std::sync::Arc;
use std::time::SystemTime;

use crate::auth::Auth;

use super::{AuthSelector, ModelCooldownError, usable_candidates};

/// Deterministic selector: always the alphabetically smallest id in the
/// highest usable priority bucket. The same candidate set yields the same
/// pick, which keeps one credential "filled" before the next is touched.
#[derive(Debug, Default)]
pub struct FillFirstSelector;

impl FillFirstSelector {
    pub fn new() -> Self {
        Self
    }
}

impl AuthSelector for FillFirstSelector {
    fn name(&self) -> &'static str {
        "fill-first"
    }

    fn pick(
        &self,
        provider: &str,
        model: &str,
        auths: &[Arc<Auth>],
    ) -> Result<Arc<Auth>, ModelCooldownError> {
        let candidates = usable_candidates(provider, model, auths, SystemTime::now())?;
        Ok(candidates[0].clone())
    }
}
