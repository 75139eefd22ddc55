use serde_json::json;

use crate::artifacts::ArtifactStore;
use crate::config::InterpreterConfig;
use crate::execution_result::{ExecutionResult, OutputKind};
use crate::kernel_launcher::KernelSession;
use crate::output_capture::{UNEXPECTED_ERROR_MESSAGE, drain};
use crate::timeouts::DrainWait;

/// Library imports, the timeout helper and plotting setup run in every fresh namespace.
pub const BOOTSTRAP_PREAMBLE: &str = include_str!("../python/bootstrap.py");

const RESET_NAMESPACE: &str = "get_ipython().run_line_magic('reset', '-f')";
const CANCEL_TIMER: &str = "_CodeInterpreterTimer.cancel()";
const SOLUTION_DEFINITION: &str = "def solution()";
const SEABORN_THEME_CALL: &str = "sns.set_theme(";
const PLOT_STYLE_CALL: &str = "_code_interpreter_plot_style()";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub code: String,
    /// Seconds before the in-kernel alarm fires. `None` leaves the code unbounded.
    pub timeout_secs: Option<u64>,
    /// Wipe the namespace and rerun the bootstrap before the code.
    pub reset: bool,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            timeout_secs: None,
            reset: false,
        }
    }

    pub fn with_timeout(mut self, timeout_secs: Option<u64>) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_reset(mut self, reset: bool) -> Self {
        self.reset = reset;
        self
    }

    pub fn is_blank(&self) -> bool {
        self.code.trim().is_empty()
    }
}

/// Code that defines `solution()` without calling it gets a trailing call.
pub fn append_solution_call(code: &str) -> String {
    if code.contains(SOLUTION_DEFINITION) {
        format!("{code}\nsolution()")
    } else {
        code.to_string()
    }
}

/// `sns.set_theme(...)` overwrites the minus-sign and font settings from the preamble, so they
/// are applied again right after each single-line call at the top level.
pub fn restore_plot_style(code: &str) -> String {
    let mut lines = Vec::new();
    for line in code.split('\n') {
        lines.push(line);
        if line.starts_with(SEABORN_THEME_CALL) && line.trim_end().ends_with(')') {
            lines.push(PLOT_STYLE_CALL);
        }
    }
    lines.join("\n")
}

/// Reset directive and preamble first, then the timer arm, then the code and a blank line so
/// the final statement is terminated.
pub fn prepare_code(request: &ExecutionRequest) -> String {
    let mut code = String::new();
    if request.reset {
        code.push_str(RESET_NAMESPACE);
        code.push('\n');
        code.push_str(BOOTSTRAP_PREAMBLE);
        if !BOOTSTRAP_PREAMBLE.ends_with('\n') {
            code.push('\n');
        }
    }
    if let Some(secs) = request.timeout_secs {
        code.push_str(&format!("_CodeInterpreterTimer.start({secs})\n"));
    }
    code.push_str(&request.code);
    code.push_str("\n\n");
    code
}

/// Runs one request on `session` and collects everything it produced. Blank code returns an
/// empty result without touching the kernel. Failures are reported inside the result.
pub async fn submit(
    session: &mut KernelSession,
    request: &ExecutionRequest,
    config: &InterpreterConfig,
) -> ExecutionResult {
    if request.is_blank() {
        return ExecutionResult::default();
    }

    let code = prepare_code(request);
    let workspace = session.workspace().to_path_buf();
    let client = session.client_mut();
    let msg_id = match client.execute(&code) {
        Ok(msg_id) => msg_id,
        Err(err) => {
            tracing::error!("failed to submit execute_request: {err}");
            let mut result = ExecutionResult::default();
            result.push_text(OutputKind::Error, UNEXPECTED_ERROR_MESSAGE);
            return result;
        }
    };
    crate::event_log::log_lazy("execute_begin", || {
        json!({
            "msg_id": msg_id.clone(),
            "timeout_secs": request.timeout_secs,
            "reset": request.reset,
            "code_len": request.code.len(),
        })
    });

    let wait = DrainWait::for_timeout(request.timeout_secs, config.drain_wait);
    let mut artifacts = ArtifactStore::new(&workspace, config.static_url.as_deref());
    let result = drain(&mut *client, &msg_id, wait, &mut artifacts).await;

    if request.timeout_secs.is_some()
        && let Err(err) = client.execute_detached(CANCEL_TIMER)
    {
        tracing::warn!("failed to disarm kernel timer: {err}");
    }
    crate::event_log::log_lazy("execute_end", || {
        json!({
            "msg_id": msg_id.clone(),
            "items": result.items.len(),
            "images": result.images().count(),
        })
    });
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_request_gets_trailing_blank_line() {
        let request = ExecutionRequest::new("print(1)");
        assert_eq!(prepare_code(&request), "print(1)\n\n");
    }

    #[test]
    fn timeout_arms_timer_before_code() {
        let request = ExecutionRequest::new("x = 1").with_timeout(Some(30));
        assert_eq!(
            prepare_code(&request),
            "_CodeInterpreterTimer.start(30)\nx = 1\n\n"
        );
    }

    #[test]
    fn reset_runs_preamble_before_timer_and_code() {
        let request = ExecutionRequest::new("x")
            .with_timeout(Some(5))
            .with_reset(true);
        let code = prepare_code(&request);

        assert!(code.starts_with(RESET_NAMESPACE));
        let preamble_at = code.find("class _CodeInterpreterTimer").expect("preamble");
        let arm_at = code.find("_CodeInterpreterTimer.start(5)").expect("arm");
        assert!(preamble_at < arm_at);
        assert!(code.ends_with("_CodeInterpreterTimer.start(5)\nx\n\n"));
    }

    #[test]
    fn preamble_installs_sentinel_and_timer() {
        assert!(BOOTSTRAP_PREAMBLE.contains(crate::output_capture::TIMEOUT_SENTINEL));
        assert!(BOOTSTRAP_PREAMBLE.contains("class _CodeInterpreterTimer"));
        assert!(BOOTSTRAP_PREAMBLE.contains("def input("));
        assert!(BOOTSTRAP_PREAMBLE.contains("upload_file"));
    }

    #[test]
    fn solution_definition_gets_called() {
        assert_eq!(
            append_solution_call("def solution():\n    return 42"),
            "def solution():\n    return 42\nsolution()"
        );
        assert_eq!(append_solution_call("print(2)"), "print(2)");
        assert_eq!(
            append_solution_call("def solution(x):\n    pass"),
            "def solution(x):\n    pass"
        );
    }

    #[test]
    fn seaborn_theme_calls_are_followed_by_plot_style() {
        assert_eq!(
            restore_plot_style("import seaborn as sns\nsns.set_theme(style='dark')\nplt.plot([1])"),
            "import seaborn as sns\nsns.set_theme(style='dark')\n_code_interpreter_plot_style()\nplt.plot([1])"
        );
        // Indented or multi-line calls are left alone.
        let untouched = "if True:\n    sns.set_theme()\nsns.set_theme(\n    style='dark')";
        assert_eq!(restore_plot_style(untouched), untouched);
        assert!(BOOTSTRAP_PREAMBLE.contains("def _code_interpreter_plot_style("));
    }

    #[test]
    fn whitespace_only_code_is_blank() {
        assert!(ExecutionRequest::new("  \n\t").is_blank());
        assert!(!ExecutionRequest::new("1").is_blank());
    }
}
