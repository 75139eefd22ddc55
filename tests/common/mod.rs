#![allow(dead_code)]

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use rmcp::ServiceExt;
use rmcp::handler::client::ClientHandler;
use rmcp::model::{CallToolRequestParam, CallToolResult, RawContent};
use rmcp::service::ServiceError;
use rmcp::transport::{ConfigureCommandExt, TokioChildProcess};
use serde_json::{Value, json};
use tokio::process::Command;

pub type TestResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

#[derive(Clone)]
struct TestClient;

impl ClientHandler for TestClient {}

pub struct McpTestSession {
    service: rmcp::service::RunningService<rmcp::service::RoleClient, TestClient>,
    server_pid: Option<u32>,
}

impl McpTestSession {
    pub fn server_info(&self) -> Option<&rmcp::model::ServerInfo> {
        self.service.peer_info()
    }

    pub async fn tool_names(&self) -> Result<Vec<String>, ServiceError> {
        let tools = self.service.list_all_tools().await?;
        Ok(tools.into_iter().map(|tool| tool.name.to_string()).collect())
    }

    pub async fn run_code(&self, code: &str) -> Result<CallToolResult, ServiceError> {
        self.call_code(json!({ "code": code })).await
    }

    pub async fn call_code(&self, arguments: Value) -> Result<CallToolResult, ServiceError> {
        let arguments = match arguments {
            Value::Object(map) => Some(map),
            _ => None,
        };
        self.service
            .call_tool(CallToolRequestParam {
                name: "code_interpreter".into(),
                arguments,
            })
            .await
    }

    pub async fn cancel(self) -> TestResult<()> {
        self.service.cancel().await?;
        if let Some(pid) = self.server_pid {
            terminate_process_tree(pid);
        }
        Ok(())
    }
}

pub fn result_text(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .filter_map(|item| match &item.raw {
            RawContent::Text(text) => Some(text.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

pub fn image_count(result: &CallToolResult) -> usize {
    result
        .content
        .iter()
        .filter(|item| matches!(item.raw, RawContent::Image(_)))
        .count()
}

/// A python that can import ipykernel, or `None` when kernel tests must be skipped.
pub fn kernel_python() -> Option<&'static str> {
    static PYTHON: OnceLock<Option<&'static str>> = OnceLock::new();
    *PYTHON.get_or_init(|| {
        ["python3", "python"]
            .into_iter()
            .find(|program| python_can_import(program, "ipykernel"))
    })
}

pub fn python_can_import(program: &str, module: &str) -> bool {
    std::process::Command::new(program)
        .args(["-c", &format!("import {module}")])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Starts a server backed by a real kernel, or returns `None` (and says why) when none is
/// available.
pub async fn spawn_kernel_server(workspace: &Path) -> TestResult<Option<McpTestSession>> {
    let Some(python) = kernel_python() else {
        eprintln!("python with ipykernel not available; skipping");
        return Ok(None);
    };
    let session = spawn_server(vec![
        "--workspace".to_string(),
        workspace.to_string_lossy().to_string(),
        "--python".to_string(),
        python.to_string(),
    ])
    .await?;
    Ok(Some(session))
}

pub async fn spawn_server(args: Vec<String>) -> TestResult<McpTestSession> {
    spawn_server_with_env_vars(args, Vec::new()).await
}

pub async fn spawn_server_with_env_vars(
    args: Vec<String>,
    env_vars: Vec<(String, String)>,
) -> TestResult<McpTestSession> {
    let exe = resolve_server_path()?;
    let transport = TokioChildProcess::new(Command::new(exe).configure(|cmd| {
        cmd.env_remove("CODE_INTERPRETER_WORK_DIR");
        cmd.env_remove("CODE_INTERPRETER_PYTHON");
        cmd.env_remove("CODE_INTERPRETER_TIMEOUT");
        cmd.env_remove("CODE_INTERPRETER_STATIC_URL");
        cmd.env_remove("CODE_INTERPRETER_DEBUG_EVENTS_DIR");
        cmd.args(&args);
        for (key, value) in &env_vars {
            cmd.env(key, value);
        }
    }))?;

    let server_pid = transport.id();
    let service = TestClient.serve(transport).await?;
    Ok(McpTestSession {
        service,
        server_pid,
    })
}

fn resolve_server_path() -> TestResult<PathBuf> {
    if let Some(path) = option_env!("CARGO_BIN_EXE_mcp-interpreter") {
        return Ok(PathBuf::from(path));
    }

    let mut path = std::env::current_exe()?;
    path.pop();
    path.pop();
    path.push("mcp-interpreter");
    if cfg!(windows) {
        path.set_extension("exe");
    }

    if path.exists() {
        Ok(path)
    } else {
        Err("unable to locate mcp-interpreter test binary".into())
    }
}

#[cfg(unix)]
fn terminate_process_tree(pid: u32) {
    let pid_str = pid.to_string();
    let _ = std::process::Command::new("pkill")
        .args(["-TERM", "-P", &pid_str])
        .status();
    unsafe {
        let _ = libc::kill(pid as i32, libc::SIGTERM);
    }
    std::thread::sleep(std::time::Duration::from_millis(200));
    let alive = unsafe { libc::kill(pid as i32, 0) == 0 };
    if alive {
        unsafe {
            let _ = libc::kill(pid as i32, libc::SIGKILL);
        }
    }
}

#[cfg(windows)]
fn terminate_process_tree(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();
}
