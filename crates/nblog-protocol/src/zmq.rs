//! ZeroMQ implementation of the kernel channels.
//!
//! Broadcast output is received on a SUB socket subscribed to every
//! topic; the control and input channels use DEALER sockets, matching
//! what a Jupyter frontend opens. Each socket is drained by its own
//! reader task into a bounded queue, which keeps `recv_timeout`
//! cancel-safe.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use zeromq::{DealerSocket, Socket, SocketRecv, SubSocket};

use nblog_core::{ChannelKind, RawMessage};

use crate::client::{
    ChannelError, ClientError, KernelBundle, KernelChannel, KernelChannels, KernelConnector,
};
use crate::connection::ConnectionInfo;
use crate::wire::{decode_frames, MessageSigner};

/// Default time allowed for each socket to connect.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Messages buffered per channel between the reader task and the poller.
const CHANNEL_QUEUE: usize = 256;

/// Connects to kernels described by on-disk connection files.
#[derive(Debug, Clone)]
pub struct ZmqConnector {
    connect_timeout: Duration,
}

impl ZmqConnector {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn connect_socket<S: Socket>(
        &self,
        socket: &mut S,
        channel: ChannelKind,
        endpoint: &str,
    ) -> Result<(), ClientError> {
        let connect_error = |message: String| ClientError::Connect {
            channel,
            endpoint: endpoint.to_string(),
            message,
        };
        match tokio::time::timeout(self.connect_timeout, socket.connect(endpoint)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(connect_error(e.to_string())),
            Err(_) => Err(connect_error(format!(
                "timed out after {}ms",
                self.connect_timeout.as_millis()
            ))),
        }
    }
}

impl Default for ZmqConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KernelConnector for ZmqConnector {
    async fn connect(&self, kernel: &KernelBundle) -> Result<KernelChannels, ClientError> {
        let info = ConnectionInfo::load(&kernel.connection_file).await?;
        let signer = Arc::new(MessageSigner::new(&info.key, &info.signature_scheme)?);

        let iopub_endpoint = info.endpoint(info.iopub_port);
        let mut iopub = SubSocket::new();
        self.connect_socket(&mut iopub, ChannelKind::Broadcast, &iopub_endpoint)
            .await?;
        iopub
            .subscribe("")
            .await
            .map_err(|e| ClientError::Connect {
                channel: ChannelKind::Broadcast,
                endpoint: iopub_endpoint.clone(),
                message: e.to_string(),
            })?;

        let mut shell = DealerSocket::new();
        self.connect_socket(&mut shell, ChannelKind::Control, &info.endpoint(info.shell_port))
            .await?;

        let mut stdin = DealerSocket::new();
        self.connect_socket(&mut stdin, ChannelKind::Input, &info.endpoint(info.stdin_port))
            .await?;

        debug!(
            session_id = %kernel.id,
            kernel_name = info.kernel_name.as_deref().unwrap_or("unknown"),
            iopub = %iopub_endpoint,
            signed = signer.is_enabled(),
            "Connected to kernel channels"
        );

        Ok(KernelChannels {
            broadcast: Box::new(ZmqChannel::spawn(ChannelKind::Broadcast, iopub, signer.clone())),
            control: Box::new(ZmqChannel::spawn(ChannelKind::Control, shell, signer.clone())),
            input: Box::new(ZmqChannel::spawn(ChannelKind::Input, stdin, signer)),
        })
    }
}

/// One ZeroMQ-backed channel.
pub struct ZmqChannel {
    kind: ChannelKind,
    queue: mpsc::Receiver<Result<RawMessage, ChannelError>>,
    cancel: CancellationToken,
    reader: Option<JoinHandle<()>>,
}

impl ZmqChannel {
    fn spawn<S>(kind: ChannelKind, socket: S, signer: Arc<MessageSigner>) -> Self
    where
        S: SocketRecv + Send + 'static,
    {
        let (tx, queue) = mpsc::channel(CHANNEL_QUEUE);
        let cancel = CancellationToken::new();
        let reader = tokio::spawn(read_socket(kind, socket, signer, tx, cancel.clone()));
        Self {
            kind,
            queue,
            cancel,
            reader: Some(reader),
        }
    }
}

/// Reader task: decodes every multipart message and queues the result.
async fn read_socket<S>(
    kind: ChannelKind,
    mut socket: S,
    signer: Arc<MessageSigner>,
    tx: mpsc::Sender<Result<RawMessage, ChannelError>>,
    cancel: CancellationToken,
) where
    S: SocketRecv + Send + 'static,
{
    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = socket.recv() => received,
        };

        match received {
            Ok(message) => {
                let frames = message.into_vec();
                trace!(channel = %kind, frames = frames.len(), "Received multipart message");
                let item = decode_frames(&frames, &signer).map_err(ChannelError::from);
                if tx.send(item).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(ChannelError::Transport(e.to_string()))).await;
                break;
            }
        }
    }
    debug!(channel = %kind, "Socket reader stopped");
}

#[async_trait]
impl KernelChannel for ZmqChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<RawMessage>, ChannelError> {
        match tokio::time::timeout(timeout, self.queue.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(item)) => item.map(Some),
            Ok(None) => Err(ChannelError::Closed),
        }
    }

    async fn close(&mut self) {
        self.cancel.cancel();
        self.queue.close();
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
    }
}

impl Drop for ZmqChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_connection_file_is_a_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = KernelBundle::new("abc", dir.path().join("kernel-abc.json"));

        let result = ZmqConnector::new().connect(&kernel).await;
        assert!(matches!(result, Err(ClientError::Connection(_))));
    }

    #[tokio::test]
    async fn test_unsupported_scheme_is_rejected_before_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel-abc.json");
        std::fs::write(
            &path,
            r#"{"shell_port": 1, "iopub_port": 2, "stdin_port": 3,
                "key": "k", "signature_scheme": "hmac-md5"}"#,
        )
        .unwrap();

        let result = ZmqConnector::new()
            .connect(&KernelBundle::new("abc", path))
            .await;
        assert!(matches!(result, Err(ClientError::Signing(_))));
    }
}
