//! In-process kernel channels.
//!
//! [`MemoryConnector`] stands in for real kernels: messages are pushed
//! into a session's channels from the outside and delivered to whoever
//! connected. Each `connect` opens a fresh set of channels.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use nblog_core::{ChannelKind, RawMessage, SessionId};

use crate::client::{
    ChannelError, ClientError, KernelBundle, KernelChannel, KernelChannels, KernelConnector,
};

type Feed = mpsc::UnboundedSender<RawMessage>;

#[derive(Default)]
struct Endpoints {
    /// Senders of the most recent connection, by session and channel.
    feeds: HashMap<SessionId, HashMap<ChannelKind, Feed>>,
    /// Number of successful connects per session.
    connects: HashMap<SessionId, usize>,
    refused: HashSet<SessionId>,
}

/// Loopback connector for tests and dry runs.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    inner: Arc<Mutex<Endpoints>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Endpoints> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes future connects to `id` fail until [`Self::accept`] is called.
    pub fn refuse(&self, id: impl Into<SessionId>) {
        self.lock().refused.insert(id.into());
    }

    /// Allows connects to `id` again.
    pub fn accept(&self, id: impl Into<SessionId>) {
        self.lock().refused.remove(&id.into());
    }

    /// Delivers a message on the session's current connection.
    ///
    /// Returns false if the session is not connected on that channel.
    pub fn push(&self, id: &SessionId, channel: ChannelKind, msg: RawMessage) -> bool {
        self.lock()
            .feeds
            .get(id)
            .and_then(|feeds| feeds.get(&channel))
            .is_some_and(|feed| feed.send(msg).is_ok())
    }

    /// Closes every channel of the session's current connection.
    pub fn sever(&self, id: &SessionId) {
        self.lock().feeds.remove(id);
    }

    /// Returns true if a live connection exists for the session.
    #[must_use]
    pub fn is_connected(&self, id: &SessionId) -> bool {
        self.lock()
            .feeds
            .get(id)
            .is_some_and(|feeds| feeds.values().any(|feed| !feed.is_closed()))
    }

    /// Number of successful connects made to the session so far.
    #[must_use]
    pub fn connect_count(&self, id: &SessionId) -> usize {
        self.lock().connects.get(id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl KernelConnector for MemoryConnector {
    async fn connect(&self, kernel: &KernelBundle) -> Result<KernelChannels, ClientError> {
        let mut endpoints = self.lock();
        if endpoints.refused.contains(&kernel.id) {
            return Err(ClientError::Refused(kernel.id.clone()));
        }

        let mut feeds = HashMap::new();
        let [broadcast, control, input] = ChannelKind::ALL.map(|kind| {
            let (tx, rx) = mpsc::unbounded_channel();
            feeds.insert(kind, tx);
            MemoryChannel { kind, rx }
        });

        endpoints.feeds.insert(kernel.id.clone(), feeds);
        *endpoints.connects.entry(kernel.id.clone()).or_insert(0) += 1;

        Ok(KernelChannels {
            broadcast: Box::new(broadcast),
            control: Box::new(control),
            input: Box::new(input),
        })
    }
}

/// Receiving end of an in-process channel.
pub struct MemoryChannel {
    kind: ChannelKind,
    rx: mpsc::UnboundedReceiver<RawMessage>,
}

#[async_trait]
impl KernelChannel for MemoryChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<RawMessage>, ChannelError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(msg)) => Ok(Some(msg)),
            Ok(None) => Err(ChannelError::Closed),
        }
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}
