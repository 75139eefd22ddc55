use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use zeromq::{DealerSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqMessage};

use crate::connection_file::ConnectionInfo;
use crate::error::{KernelError, LaunchError};
use crate::kernel_protocol::{
    IopubEvent, KernelMessage, MessageBuilder, OutboundMessage, Signer,
};

const READY_ATTEMPT_WAIT: Duration = Duration::from_secs(1);
const SHUTDOWN_REPLY_WAIT: Duration = Duration::from_secs(1);

type Inbound = Result<KernelMessage, KernelError>;

/// Outcome of one bounded wait on the IOPub channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IopubPoll {
    Event(IopubEvent),
    TimedOut,
}

/// Where the consumption loop reads events from; the kernel client in production.
pub trait IopubSource {
    /// Waits up to `wait` for the next event parented to `parent_msg_id`.
    fn poll_event(
        &mut self,
        parent_msg_id: &str,
        wait: Duration,
    ) -> impl Future<Output = Result<IopubPoll, KernelError>> + Send;
}

/// Shell, control and IOPub channels to one running kernel.
pub struct KernelClient {
    builder: MessageBuilder,
    shell_tx: mpsc::UnboundedSender<Vec<Bytes>>,
    shell_rx: mpsc::UnboundedReceiver<Inbound>,
    control_tx: mpsc::UnboundedSender<Vec<Bytes>>,
    control_rx: mpsc::UnboundedReceiver<Inbound>,
    iopub_rx: mpsc::UnboundedReceiver<Inbound>,
    tasks: Vec<JoinHandle<()>>,
}

impl KernelClient {
    pub async fn connect(info: &ConnectionInfo) -> Result<Self, KernelError> {
        let signer = Signer::new(&info.key, &info.signature_scheme)?;
        tracing::debug!(
            kernel_name = %info.kernel_name,
            shell = info.shell_port,
            iopub = info.iopub_port,
            control = info.control_port,
            stdin = info.stdin_port,
            hb = info.hb_port,
            "connecting to kernel"
        );

        let mut shell = DealerSocket::new();
        shell.connect(&info.endpoint(info.shell_port)).await?;
        let mut control = DealerSocket::new();
        control.connect(&info.endpoint(info.control_port)).await?;
        let mut iopub = SubSocket::new();
        iopub.connect(&info.endpoint(info.iopub_port)).await?;
        iopub.subscribe("").await?;

        let (shell_tx, shell_rx, shell_task) = spawn_dealer("shell", shell, signer.clone());
        let (control_tx, control_rx, control_task) =
            spawn_dealer("control", control, signer.clone());
        let (iopub_rx, iopub_task) = spawn_subscriber(iopub, signer.clone());

        Ok(Self {
            builder: MessageBuilder::new(signer),
            shell_tx,
            shell_rx,
            control_tx,
            control_rx,
            iopub_rx,
            tasks: vec![shell_task, control_task, iopub_task],
        })
    }

    /// Round-trips `kernel_info_request` until both the shell reply and an IOPub message
    /// parented to it arrive; the latter proves the subscription is live.
    pub async fn wait_for_ready(&mut self, timeout: Duration) -> Result<(), KernelError> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let request = self.builder.kernel_info_request();
            let msg_id = request.msg_id.clone();
            self.send_shell(request)?;

            let attempt_deadline = (Instant::now() + READY_ATTEMPT_WAIT).min(deadline);
            let mut replied = false;
            let mut published = false;
            while !(replied && published) {
                tokio::select! {
                    reply = self.shell_rx.recv() => match reply {
                        Some(Ok(message)) => {
                            replied |= message.is_reply_to(&msg_id)
                                && message.msg_type() == "kernel_info_reply";
                        }
                        Some(Err(err)) => tracing::debug!("shell message ignored while waiting for ready: {err}"),
                        None => return Err(KernelError::ChannelClosed("shell")),
                    },
                    event = self.iopub_rx.recv() => match event {
                        Some(Ok(message)) => published |= message.is_reply_to(&msg_id),
                        Some(Err(err)) => tracing::debug!("iopub message ignored while waiting for ready: {err}"),
                        None => return Err(KernelError::ChannelClosed("iopub")),
                    },
                    _ = tokio::time::sleep_until(attempt_deadline) => break,
                }
            }
            if replied && published {
                return Ok(());
            }
            tracing::debug!(replied, published, "kernel not ready yet; retrying kernel_info");
        }
        Err(LaunchError::NotReady(timeout).into())
    }

    /// Sends an `execute_request` and returns its message id.
    pub fn execute(&mut self, code: &str) -> Result<String, KernelError> {
        self.discard_shell_replies();
        let request = self.builder.execute_request(code, false, true);
        let msg_id = request.msg_id.clone();
        self.send_shell(request)?;
        Ok(msg_id)
    }

    /// Silent execution nobody waits for; its events are skipped by `poll_event`.
    pub fn execute_detached(&mut self, code: &str) -> Result<(), KernelError> {
        let request = self.builder.execute_request(code, true, false);
        self.send_shell(request)
    }

    pub async fn shutdown(&mut self) {
        let request = self.builder.shutdown_request();
        let msg_id = request.msg_id.clone();
        if self.control_tx.send(request.frames).is_ok() {
            let waited = tokio::time::timeout(SHUTDOWN_REPLY_WAIT, async {
                while let Some(reply) = self.control_rx.recv().await {
                    if let Ok(message) = reply
                        && message.is_reply_to(&msg_id)
                    {
                        return;
                    }
                }
            })
            .await;
            if waited.is_err() {
                tracing::debug!("no shutdown_reply from kernel");
            }
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    fn send_shell(&self, request: OutboundMessage) -> Result<(), KernelError> {
        self.shell_tx
            .send(request.frames)
            .map_err(|_| KernelError::ChannelClosed("shell"))
    }

    /// Execute replies carry nothing the result needs; completion is read from IOPub.
    fn discard_shell_replies(&mut self) {
        while let Ok(reply) = self.shell_rx.try_recv() {
            if let Err(err) = reply {
                tracing::debug!("discarding shell error: {err}");
            }
        }
    }
}

impl IopubSource for KernelClient {
    async fn poll_event(
        &mut self,
        parent_msg_id: &str,
        wait: Duration,
    ) -> Result<IopubPoll, KernelError> {
        let deadline = Instant::now() + wait;
        loop {
            let message = match tokio::time::timeout_at(deadline, self.iopub_rx.recv()).await {
                Err(_) => return Ok(IopubPoll::TimedOut),
                Ok(None) => return Err(KernelError::ChannelClosed("iopub")),
                Ok(Some(received)) => received?,
            };
            if !message.is_reply_to(parent_msg_id) {
                tracing::trace!(
                    msg_type = message.msg_type(),
                    "skipping iopub message for another request"
                );
                continue;
            }
            return Ok(IopubPoll::Event(IopubEvent::from_message(&message)?));
        }
    }
}

impl Drop for KernelClient {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

fn zmq_message(frames: Vec<Bytes>) -> ZmqMessage {
    let mut frames = frames.into_iter();
    let mut message = ZmqMessage::from(frames.next().unwrap_or_default());
    for frame in frames {
        message.push_back(frame);
    }
    message
}

fn spawn_dealer(
    name: &'static str,
    mut socket: DealerSocket,
    signer: Signer,
) -> (
    mpsc::UnboundedSender<Vec<Bytes>>,
    mpsc::UnboundedReceiver<Inbound>,
    JoinHandle<()>,
) {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<Bytes>>();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                outgoing = out_rx.recv() => {
                    let Some(frames) = outgoing else {
                        break;
                    };
                    if let Err(err) = socket.send(zmq_message(frames)).await {
                        tracing::warn!(channel = name, "send failed: {err}");
                        let _ = in_tx.send(Err(err.into()));
                        break;
                    }
                }
                incoming = socket.recv() => {
                    let message = match incoming {
                        Ok(message) => message,
                        Err(err) => {
                            tracing::warn!(channel = name, "receive failed: {err}");
                            let _ = in_tx.send(Err(err.into()));
                            break;
                        }
                    };
                    let decoded = KernelMessage::decode(&message.into_vec(), &signer)
                        .map_err(KernelError::from);
                    if in_tx.send(decoded).is_err() {
                        break;
                    }
                }
            }
        }
    });
    (out_tx, in_rx, task)
}

fn spawn_subscriber(
    mut socket: SubSocket,
    signer: Signer,
) -> (mpsc::UnboundedReceiver<Inbound>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        loop {
            let message = match socket.recv().await {
                Ok(message) => message,
                Err(err) => {
                    tracing::warn!(channel = "iopub", "receive failed: {err}");
                    let _ = tx.send(Err(err.into()));
                    break;
                }
            };
            let decoded =
                KernelMessage::decode(&message.into_vec(), &signer).map_err(KernelError::from);
            if tx.send(decoded).is_err() {
                break;
            }
        }
    });
    (rx, task)
}
