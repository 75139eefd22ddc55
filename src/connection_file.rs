use std::path::Path;
use std::process::Child;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{KernelError, LaunchError};

pub const CONNECTION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Endpoint description written by the kernel at startup (`--IPKernelApp.connection_file`).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ConnectionInfo {
    #[serde(default = "default_transport")]
    pub transport: String,
    pub ip: String,
    pub shell_port: u16,
    pub iopub_port: u16,
    pub stdin_port: u16,
    pub control_port: u16,
    pub hb_port: u16,
    #[serde(default)]
    pub key: String,
    #[serde(default = "default_signature_scheme")]
    pub signature_scheme: String,
    #[serde(default)]
    pub kernel_name: String,
}

fn default_transport() -> String {
    "tcp".to_string()
}

fn default_signature_scheme() -> String {
    "hmac-sha256".to_string()
}

impl ConnectionInfo {
    pub fn endpoint(&self, port: u16) -> String {
        match self.transport.as_str() {
            "ipc" => format!("ipc://{}-{port}", self.ip),
            transport => format!("{transport}://{}:{port}", self.ip),
        }
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Blocks until the descriptor exists and decodes. The kernel may still be writing it, so
/// decode failures are retried without bound; only a dead child ends the wait early.
pub async fn wait_for_connection_file(
    path: &Path,
    poll: Duration,
    child: &mut Child,
) -> Result<ConnectionInfo, KernelError> {
    let mut attempts: u64 = 0;
    loop {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => match ConnectionInfo::parse(&text) {
                Ok(info) => {
                    tracing::debug!(
                        path = %path.display(),
                        attempts,
                        "connection file ready"
                    );
                    return Ok(info);
                }
                Err(err) => {
                    tracing::trace!(path = %path.display(), "connection file incomplete: {err}");
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(KernelError::Io(err)),
        }

        if let Some(status) = child.try_wait()? {
            return Err(LaunchError::KernelExited {
                path: path.to_path_buf(),
                status,
            }
            .into());
        }
        attempts = attempts.saturating_add(1);
        tokio::time::sleep(poll).await;
    }
}
