use std::time::Instant;

use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{
    CallToolResult, Content, ErrorData as McpError, ProtocolVersion, ServerCapabilities,
    ServerInfo,
};
use rmcp::{ServerHandler, tool, tool_handler, tool_router};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;

mod response;

use self::response::{execution_result_to_contents, finalize_contents};

use crate::config::InterpreterConfig;
use crate::execution::ExecutionRequest;
use crate::interpreter::CodeInterpreter;

#[cfg(test)]
fn code_interpreter_tool_description() -> &'static str {
    include_str!("../docs/tool-descriptions/code_interpreter_tool.md")
}

#[derive(Clone)]
struct CodeInterpreterServer {
    interpreter: CodeInterpreter,
    /// Kernel used when a call names no session: `{instance uuid}_{pid}`.
    default_session: String,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl CodeInterpreterServer {
    fn new(interpreter: CodeInterpreter) -> Self {
        Self {
            interpreter,
            default_session: default_session_id(),
            tool_router: Self::tool_router(),
        }
    }

    fn get_info(&self) -> ServerInfo {
        server_info()
    }

    #[doc = include_str!("../docs/tool-descriptions/code_interpreter_tool.md")]
    #[tool(name = "code_interpreter")]
    async fn code_interpreter(
        &self,
        params: Parameters<CodeInterpreterArgs>,
    ) -> Result<CallToolResult, McpError> {
        let CodeInterpreterArgs {
            code,
            timeout,
            reset,
            session,
        } = params.0;
        let owner_id = session
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| self.default_session.clone());
        let timeout_secs = resolve_timeout(timeout, self.interpreter.config().default_timeout_secs);
        let request = ExecutionRequest::new(code)
            .with_timeout(timeout_secs)
            .with_reset(reset);
        self.run_code(owner_id, request).await
    }
}

impl CodeInterpreterServer {
    async fn run_code(
        &self,
        owner_id: String,
        request: ExecutionRequest,
    ) -> Result<CallToolResult, McpError> {
        crate::event_log::log_lazy("tool_call_begin", || {
            json!({
                "tool": "code_interpreter",
                "session": owner_id.clone(),
                "code": request.code.clone(),
                "timeout_secs": request.timeout_secs,
                "reset": request.reset,
            })
        });
        let started = Instant::now();
        let blank = request.is_blank();

        let contents = match self.interpreter.run(&owner_id, request).await {
            Ok(result) => execution_result_to_contents(&result, blank).await,
            Err(err) => {
                tracing::error!(session = %owner_id, "code interpreter unavailable: {err}");
                crate::event_log::log_lazy("tool_call_error", || {
                    json!({
                        "tool": "code_interpreter",
                        "error": err.to_string(),
                    })
                });
                vec![Content::text(format!("code interpreter error: {err}"))]
            }
        };
        let result = finalize_contents(contents);
        crate::event_log::log_lazy("tool_call_end", || {
            let serialized = serde_json::to_value(&result)
                .unwrap_or_else(|err| json!({"serialize_error": err.to_string()}));
            json!({
                "tool": "code_interpreter",
                "elapsed_ms": crate::diagnostics::elapsed_ms(started),
                "result": serialized,
            })
        });
        Ok(result)
    }
}

#[tool_handler]
impl ServerHandler for CodeInterpreterServer {
    fn get_info(&self) -> ServerInfo {
        CodeInterpreterServer::get_info(self)
    }
}

#[derive(Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct CodeInterpreterArgs {
    code: String,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    reset: bool,
    #[serde(default)]
    session: Option<String>,
}

fn server_info() -> ServerInfo {
    ServerInfo {
        protocol_version: ProtocolVersion::V_2025_06_18,
        capabilities: ServerCapabilities::builder().enable_tools().build(),
        ..ServerInfo::default()
    }
}

/// An explicit `0` disables the limit; a missing value falls back to the configured default.
fn resolve_timeout(requested: Option<u64>, default: Option<u64>) -> Option<u64> {
    match requested {
        Some(0) => None,
        Some(secs) => Some(secs),
        None => default,
    }
}

fn default_session_id() -> String {
    format!("{}_{}", uuid::Uuid::new_v4(), std::process::id())
}

pub async fn run(config: InterpreterConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(
        workspace = %config.workspace_root.display(),
        python = %config.python_program.display(),
        "starting code interpreter server"
    );
    crate::event_log::log(
        "server_run_begin",
        json!({
            "workspace": config.workspace_root.to_string_lossy(),
        }),
    );
    let interpreter = CodeInterpreter::new(config);
    let service = CodeInterpreterServer::new(interpreter.clone());

    crate::event_log::log("server_listen_begin", json!({}));
    let result: Result<(), Box<dyn std::error::Error>> = async {
        let running = rmcp::serve_server(service, rmcp::transport::stdio()).await?;
        running
            .waiting()
            .await
            .map(|_| ())
            .map_err(|err| err.into())
    }
    .await;

    interpreter.shutdown().await;
    match &result {
        Ok(()) => crate::event_log::log("server_listen_end", json!({"status": "ok"})),
        Err(err) => crate::event_log::log(
            "server_listen_end",
            json!({
                "status": "error",
                "error": err.to_string(),
            }),
        ),
    }
    result
}
