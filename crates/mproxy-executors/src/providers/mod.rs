pub mod antigravity;
pub mod codex;
pub mod iflow;
pub mod qwen;

use std::sync::Arc;

use mproxy_core::{Manager, PayloadTranslator};

use antigravity::{AntigravityExecutor, PrimaryModelCache};
use codex::CodexExecutor;
use iflow::IFlowExecutor;
use qwen::QwenExecutor;

/// Wires every built-in executor into a manager under construction.
pub fn register_builtin_executors(
    manager: Manager,
    config: Arc<mproxy_common::Config>,
    translator: Arc<dyn PayloadTranslator>,
    antigravity_models: Arc<PrimaryModelCache>,
) -> Manager {
    manager
        .with_executor(Arc::new(QwenExecutor::new(
            config.clone(),
            translator.clone(),
        )))
        .with_executor(Arc::new(CodexExecutor::new(
            config.clone(),
            translator.clone(),
        )))
        .with_executor(Arc::new(IFlowExecutor::new(
            config.clone(),
            translator.clone(),
        )))
        .with_executor(Arc::new(AntigravityExecutor::new(
            config,
            translator,
            antigravity_models,
        )))
}
