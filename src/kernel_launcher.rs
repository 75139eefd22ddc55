use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use serde_json::json;

use crate::config::InterpreterConfig;
use crate::connection_file::{CONNECTION_POLL_INTERVAL, wait_for_connection_file};
use crate::error::{KernelError, LaunchError};
use crate::kernel_client::KernelClient;

const LAUNCH_KERNEL_SCRIPT: &str = include_str!("../python/launch_kernel.py");
const INSECURE_WRITES_ENV: &str = "JUPYTER_ALLOW_INSECURE_WRITES";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One running kernel process and the client connected to it.
pub struct KernelSession {
    owner_id: String,
    workspace: PathBuf,
    connection_file: PathBuf,
    launch_script: PathBuf,
    process: Child,
    client: KernelClient,
}

impl KernelSession {
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn pid(&self) -> u32 {
        self.process.id()
    }

    pub fn client_mut(&mut self) -> &mut KernelClient {
        &mut self.client
    }

    /// Asks the kernel to exit, then kills its process group if it is still around after the
    /// grace period. Descriptor and launch script are removed.
    pub async fn shutdown(&mut self) {
        self.client.shutdown().await;
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        loop {
            match self.process.try_wait() {
                Ok(Some(status)) => {
                    tracing::debug!(owner_id = %self.owner_id, %status, "kernel exited");
                    break;
                }
                Ok(None) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(EXIT_POLL_INTERVAL).await;
                }
                Ok(None) => {
                    tracing::warn!(
                        owner_id = %self.owner_id,
                        pid = self.process.id(),
                        "kernel ignored shutdown_request; killing process group"
                    );
                    kill_process_tree(&mut self.process);
                    break;
                }
                Err(err) => {
                    tracing::warn!(owner_id = %self.owner_id, "failed to poll kernel process: {err}");
                    kill_process_tree(&mut self.process);
                    break;
                }
            }
        }
        for path in [&self.connection_file, &self.launch_script] {
            let _ = std::fs::remove_file(path);
        }
        crate::event_log::log(
            "kernel_shutdown",
            json!({
                "owner_id": self.owner_id,
                "pid": self.process.id(),
            }),
        );
    }
}

impl Drop for KernelSession {
    fn drop(&mut self) {
        if matches!(self.process.try_wait(), Ok(None)) {
            kill_process_tree(&mut self.process);
        }
    }
}

/// Starts an ipykernel for `owner_id` inside the configured workspace and waits until its
/// channels answer.
pub async fn launch(owner_id: &str, config: &InterpreterConfig) -> Result<KernelSession, KernelError> {
    let workspace = std::path::absolute(&config.workspace_root)?;
    tokio::fs::create_dir_all(&workspace).await?;

    let key = sanitize_owner_id(owner_id);
    let connection_file = workspace.join(format!("kernel_connection_file_{key}.json"));
    let launch_script = workspace.join(format!("launch_kernel_{key}.py"));
    for path in [&connection_file, &launch_script] {
        remove_stale_file(path).await?;
    }
    tokio::fs::write(&launch_script, LAUNCH_KERNEL_SCRIPT).await?;

    let mut command = kernel_command(
        &config.python_program,
        &launch_script,
        &connection_file,
        &workspace,
    );
    if !honours_private_file_mode(&workspace)? {
        tracing::info!(
            workspace = %workspace.display(),
            "workspace ignores 0600 file modes; allowing insecure kernel writes"
        );
        command.env(INSECURE_WRITES_ENV, "1");
    }
    let mut process = command.spawn().map_err(|source| LaunchError::Spawn {
        program: config.python_program.clone(),
        source,
    })?;
    tracing::info!(owner_id, pid = process.id(), "kernel process started");
    crate::event_log::log(
        "kernel_launch_begin",
        json!({
            "owner_id": owner_id,
            "pid": process.id(),
            "python": config.python_program.to_string_lossy(),
            "connection_file": connection_file.to_string_lossy(),
        }),
    );

    let connected = connect_client(&connection_file, &mut process, config.ready_timeout).await;
    let client = match connected {
        Ok(client) => client,
        Err(err) => {
            tracing::error!(owner_id, "kernel launch failed: {err}");
            crate::event_log::log(
                "kernel_launch_error",
                json!({
                    "owner_id": owner_id,
                    "error": err.to_string(),
                }),
            );
            if matches!(process.try_wait(), Ok(None)) {
                kill_process_tree(&mut process);
            }
            return Err(err);
        }
    };
    crate::event_log::log(
        "kernel_launch_end",
        json!({
            "owner_id": owner_id,
            "pid": process.id(),
        }),
    );

    Ok(KernelSession {
        owner_id: owner_id.to_string(),
        workspace,
        connection_file,
        launch_script,
        process,
        client,
    })
}

async fn connect_client(
    connection_file: &Path,
    process: &mut Child,
    ready_timeout: Duration,
) -> Result<KernelClient, KernelError> {
    let info = wait_for_connection_file(connection_file, CONNECTION_POLL_INTERVAL, process).await?;
    let mut client = KernelClient::connect(&info).await?;
    client.wait_for_ready(ready_timeout).await?;
    Ok(client)
}

/// Owner ids end up in file names.
pub fn sanitize_owner_id(owner_id: &str) -> String {
    let sanitized: String = owner_id
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() {
        "default".to_string()
    } else {
        sanitized
    }
}

async fn remove_stale_file(path: &Path) -> Result<(), KernelError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            tracing::warn!(path = %path.display(), "removed stale kernel file");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn kernel_command(
    python: &Path,
    launch_script: &Path,
    connection_file: &Path,
    workspace: &Path,
) -> Command {
    let mut command = Command::new(python);
    command
        .arg(launch_script)
        .arg("--IPKernelApp.connection_file")
        .arg(connection_file)
        .arg("--matplotlib=inline")
        .arg("--quiet")
        .current_dir(workspace)
        .stdin(Stdio::null())
        // stdout carries MCP frames.
        .stdout(Stdio::null())
        .stderr(Stdio::inherit());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // SAFETY: setpgid is async-signal-safe and touches only the child.
        unsafe {
            command.pre_exec(|| {
                if libc::setpgid(0, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
    command
}

/// Filesystems such as some network mounts report 0600 files as group/world readable, and
/// ipykernel refuses to write its descriptor there.
#[cfg(unix)]
fn honours_private_file_mode(workspace: &Path) -> Result<bool, KernelError> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    // Launches for different owners probe the same workspace concurrently.
    let probe = workspace.join(format!("test_file_permission_{}.txt", uuid::Uuid::new_v4()));
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(&probe)?;
    file.write_all(b"test")?;
    drop(file);
    let mode = std::fs::metadata(&probe)?.permissions().mode() & 0o6677;
    let _ = std::fs::remove_file(&probe);
    Ok(mode == 0o600)
}

#[cfg(not(unix))]
fn honours_private_file_mode(_workspace: &Path) -> Result<bool, KernelError> {
    Ok(true)
}

fn kill_process_tree(process: &mut Child) {
    #[cfg(unix)]
    {
        let pid = process.id() as libc::pid_t;
        // SAFETY: plain syscall on a process group we created.
        let rc = unsafe { libc::killpg(pid, libc::SIGKILL) };
        if rc == -1 {
            let _ = process.kill();
        }
    }
    #[cfg(not(unix))]
    {
        let _ = process.kill();
    }
    let _ = process.wait();
}
