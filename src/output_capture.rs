//! Drains a request's IOPub events into an [`ExecutionResult`].

use std::sync::LazyLock;

use regex::Regex;

use crate::artifacts::{ArtifactStore, ImageArtifact};
use crate::error::KernelError;
use crate::execution_result::{ExecutionResult, OutputKind};
use crate::kernel_client::{IopubPoll, IopubSource};
use crate::kernel_protocol::{ExecutionState, IopubEvent, MimeBundle};
use crate::timeouts::DrainWait;

/// Raised inside the kernel by the SIGALRM handler the bootstrap installs.
pub const TIMEOUT_SENTINEL: &str = "CODE_INTERPRETER_TIMEOUT";
pub const UNEXPECTED_ERROR_MESSAGE: &str = "The code interpreter encountered an unexpected error.";

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\x1B[@-_]|[\x{80}-\x{9F}])[0-?]*[ -/]*[@-~]").expect("valid ansi regex")
});

pub fn timeout_message(secs: u64) -> String {
    format!("Timeout. No response after {secs} seconds.")
}

pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Running,
    Finished,
}

/// What one event contributed.
#[derive(Default)]
struct Step {
    text: Option<(OutputKind, String)>,
    image: Option<ImageArtifact>,
    finished: bool,
}

impl Step {
    fn text(kind: OutputKind, text: String) -> Self {
        Self {
            text: Some((kind, text)),
            ..Self::default()
        }
    }

    fn terminal(text: String) -> Self {
        Self {
            text: Some((OutputKind::Error, text)),
            image: None,
            finished: true,
        }
    }
}

/// Reads events parented to `parent_msg_id` until the kernel reports idle, the bounded wait
/// expires, or reading fails. Failures end up in the result text, never as an `Err`.
pub async fn drain<S: IopubSource>(
    source: &mut S,
    parent_msg_id: &str,
    wait: DrainWait,
    artifacts: &mut ArtifactStore<'_>,
) -> ExecutionResult {
    let mut result = ExecutionResult::default();
    let mut state = LoopState::Running;
    while state == LoopState::Running {
        let step = match source.poll_event(parent_msg_id, wait.per_event).await {
            Ok(IopubPoll::Event(event)) => match handle_event(event, wait, artifacts).await {
                Ok(step) => step,
                Err(err) => unexpected(err),
            },
            Ok(IopubPoll::TimedOut) => {
                tracing::warn!(
                    parent_msg_id,
                    wait_ms = wait.per_event.as_millis() as u64,
                    "no kernel event within bounded wait"
                );
                Step::terminal(timeout_message(wait.reported_secs))
            }
            Err(err) => unexpected(err),
        };

        if let Some((kind, text)) = step.text {
            result.push_text(kind, text);
        }
        if let Some(image) = step.image {
            result.push_image(image);
        }
        if step.finished {
            state = LoopState::Finished;
        }
    }
    result
}

async fn handle_event(
    event: IopubEvent,
    wait: DrainWait,
    artifacts: &mut ArtifactStore<'_>,
) -> Result<Step, KernelError> {
    let step = match event {
        IopubEvent::Status(ExecutionState::Idle) => Step {
            finished: true,
            ..Step::default()
        },
        IopubEvent::Status(_) | IopubEvent::Other(_) => Step::default(),
        IopubEvent::ExecuteResult(MimeBundle {
            text_plain,
            image_png,
        }) => {
            let image = match image_png {
                Some(payload) => Some(artifacts.extract(&payload).await?),
                None => None,
            };
            Step {
                text: text_plain.map(|text| (OutputKind::ExecuteResult, text)),
                image,
                finished: false,
            }
        }
        IopubEvent::DisplayData(MimeBundle {
            text_plain,
            image_png,
        }) => match image_png {
            Some(payload) => Step {
                image: Some(artifacts.extract(&payload).await?),
                ..Step::default()
            },
            None => Step {
                text: text_plain.map(|text| (OutputKind::DisplayData, text)),
                ..Step::default()
            },
        },
        IopubEvent::Stream { name, text } => Step::text(name.into(), text),
        IopubEvent::Error { traceback } => {
            let text = strip_ansi(&traceback.join("\n"));
            if text.contains(TIMEOUT_SENTINEL) {
                Step::text(OutputKind::Error, timeout_message(wait.reported_secs))
            } else {
                Step::text(OutputKind::Error, text)
            }
        }
    };
    Ok(step)
}

fn unexpected(err: KernelError) -> Step {
    tracing::error!(error = ?err, "code interpreter failed while reading kernel output: {err}");
    Step::terminal(UNEXPECTED_ERROR_MESSAGE.to_string())
}
