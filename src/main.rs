mod artifacts;
mod config;
mod connection_file;
mod debug_repl;
mod diagnostics;
mod error;
mod event_log;
mod execution;
mod execution_result;
mod interpreter;
mod kernel_client;
mod kernel_launcher;
mod kernel_protocol;
mod output_capture;
mod server;
mod session_registry;
mod timeouts;

use std::path::PathBuf;

use crate::config::{InterpreterConfig, parse_timeout_secs};

#[derive(Debug, Default)]
struct CliOptions {
    debug_repl: bool,
    debug_events_dir: Option<PathBuf>,
    workspace: Option<PathBuf>,
    python: Option<PathBuf>,
    /// Outer `None` means "not given"; inner `None` means the timer is disabled.
    timeout_secs: Option<Option<u64>>,
}

impl CliOptions {
    fn apply(&self, mut config: InterpreterConfig) -> InterpreterConfig {
        if let Some(workspace) = &self.workspace {
            config = config.with_workspace_root(workspace);
        }
        if let Some(python) = &self.python {
            config.python_program = python.clone();
        }
        if let Some(timeout_secs) = self.timeout_secs {
            config.default_timeout_secs = timeout_secs;
        }
        config
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(target_family = "unix")]
    // Kernel stderr and our own logs share the terminal; a closed reader must not kill us.
    ignore_sigpipe();
    diagnostics::init_tracing();

    let options = parse_cli_args(&mut ArgParser::new())?;
    let config = options.apply(InterpreterConfig::from_env()?);
    event_log::initialize(
        options.debug_events_dir.clone(),
        event_log::StartupContext {
            mode: if options.debug_repl {
                "debug_repl".to_string()
            } else {
                "server".to_string()
            },
            workspace: config.workspace_root.clone(),
            python: config.python_program.clone(),
            default_timeout_secs: config.default_timeout_secs,
        },
    )?;

    if options.debug_repl {
        return debug_repl::run(config).await;
    }
    server::run(config).await
}

#[cfg(target_family = "unix")]
fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn parse_cli_args(parser: &mut ArgParser) -> Result<CliOptions, Box<dyn std::error::Error>> {
    let mut options = CliOptions::default();
    while let Some(arg) = parser.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) if flag.starts_with("--") => (flag.to_string(), Some(value.to_string())),
            _ => (arg.clone(), None),
        };
        match flag.as_str() {
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            "--debug-repl" => {
                options.debug_repl = true;
            }
            "--debug-events-dir" => {
                options.debug_events_dir = Some(PathBuf::from(parser.value_for(&flag, inline)?));
            }
            "--workspace" => {
                options.workspace = Some(PathBuf::from(parser.value_for(&flag, inline)?));
            }
            "--python" => {
                options.python = Some(PathBuf::from(parser.value_for(&flag, inline)?));
            }
            "--timeout" => {
                let value = parser.value_for(&flag, inline)?;
                options.timeout_secs = Some(parse_timeout_secs(&value)?);
            }
            _ => return Err(format!("unknown argument: {arg}").into()),
        }
    }
    Ok(options)
}

struct ArgParser {
    args: Vec<String>,
    index: usize,
}

impl ArgParser {
    fn new() -> Self {
        Self {
            args: std::env::args().skip(1).collect(),
            index: 0,
        }
    }

    fn next(&mut self) -> Option<String> {
        let value = self.args.get(self.index)?.clone();
        self.index += 1;
        Some(value)
    }

    fn next_value(&mut self, flag: &str) -> Result<String, Box<dyn std::error::Error>> {
        self.next()
            .ok_or_else(|| format!("missing value for {flag}").into())
    }

    /// Accepts both `--flag value` and `--flag=value`.
    fn value_for(
        &mut self,
        flag: &str,
        inline: Option<String>,
    ) -> Result<String, Box<dyn std::error::Error>> {
        let value = match inline {
            Some(value) => value,
            None => self.next_value(flag)?,
        };
        if value.trim().is_empty() {
            return Err(format!("missing value for {flag}").into());
        }
        Ok(value)
    }
}

fn print_usage() {
    println!(
        "Usage:\n\
mcp-interpreter [--debug-repl] [--workspace <dir>] [--python <path>] [--timeout <secs>] [--debug-events-dir <dir>]\n\n\
--debug-repl: read code from stdin (end each chunk with END, RESET resets the next chunk) instead of serving MCP\n\
--workspace: kernel working directory and figure store (env: CODE_INTERPRETER_WORK_DIR)\n\
--python: interpreter with ipykernel installed (env: CODE_INTERPRETER_PYTHON; default: ./.venv, then python3)\n\
--timeout: default per-call timeout in seconds, 0 disables it (env: CODE_INTERPRETER_TIMEOUT; default: 30)\n\
--debug-events-dir: optional directory for per-startup JSONL debug event logs (env: CODE_INTERPRETER_DEBUG_EVENTS_DIR)\n\
figures link to $CODE_INTERPRETER_STATIC_URL/<file> when that variable is set; CODE_INTERPRETER_LOG sets the log filter"
    );
}
