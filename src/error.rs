use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("kernel io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("kernel protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("kernel transport error: {0}")]
    Transport(#[from] zeromq::ZmqError),
    #[error("kernel {0} channel closed")]
    ChannelClosed(&'static str),
    #[error("image artifact error: {0}")]
    Artifact(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to spawn kernel with {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("kernel process exited before writing {path}: {status}")]
    KernelExited {
        path: PathBuf,
        status: std::process::ExitStatus,
    },
    #[error("kernel did not report ready within {} ms", .0.as_millis())]
    NotReady(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("missing <IDS|MSG> delimiter")]
    MissingDelimiter,
    #[error("expected at least {expected} frames after delimiter, got {actual}")]
    TooFewFrames { expected: usize, actual: usize },
    #[error("message signature mismatch")]
    BadSignature,
    #[error("unsupported signature scheme: {0}")]
    UnsupportedScheme(String),
    #[error("invalid {part}: {source}")]
    Json {
        part: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid timeout: {0} (expected whole seconds)")]
    InvalidTimeout(String),
}
