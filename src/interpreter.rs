use std::sync::Arc;

use crate::config::InterpreterConfig;
use crate::error::KernelError;
use crate::execution::{ExecutionRequest, append_solution_call, restore_plot_style, submit};
use crate::execution_result::ExecutionResult;
use crate::session_registry::KernelRegistry;

/// Entry point for callers: one persistent kernel per owner id, one request at a time per
/// kernel.
#[derive(Clone)]
pub struct CodeInterpreter {
    config: Arc<InterpreterConfig>,
    registry: Arc<KernelRegistry>,
}

impl CodeInterpreter {
    pub fn new(config: InterpreterConfig) -> Self {
        let config = Arc::new(config);
        Self {
            registry: Arc::new(KernelRegistry::new(Arc::clone(&config))),
            config,
        }
    }

    pub fn config(&self) -> &InterpreterConfig {
        &self.config
    }

    /// Only a failed kernel launch surfaces as `Err`; anything that goes wrong while the code
    /// runs is part of the returned result.
    pub async fn run(
        &self,
        owner_id: &str,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, KernelError> {
        if request.is_blank() {
            return Ok(ExecutionResult::default());
        }
        let request = ExecutionRequest {
            code: append_solution_call(&restore_plot_style(&request.code)),
            ..request
        };

        let session = self.registry.get_or_create(owner_id).await?;
        let mut session = session.lock().await;
        Ok(submit(&mut session, &request, &self.config).await)
    }

    pub async fn shutdown(&self) {
        self.registry.shutdown_all().await;
    }
}
