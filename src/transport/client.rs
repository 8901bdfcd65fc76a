use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use futures::StreamExt;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::{mpsc, oneshot},
};

use super::protocol::{self, ClientMessage, ServerMessage};
use crate::error::TransportError;

/// Messages waiting for the socket. Kept tiny so a stalled link shows up as
/// backpressure instead of latency.
const OUTBOUND_CAPACITY: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(30),
        }
    }
}

/// Persistent connection to the pose consumer, driven by a current-thread
/// tokio runtime on its own thread. Reconnects with exponential backoff.
///
/// Sends never block: they fail with [`TransportError::Disconnected`] while
/// the link is down and with [`TransportError::Backpressure`] while the
/// outbound queue is full. Nothing queued before a disconnect is replayed.
pub struct TransportClient {
    outbound: mpsc::Sender<ClientMessage>,
    connected: Arc<AtomicBool>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TransportClient {
    /// Starts connecting to `addr` in the background. Server messages are
    /// offered to `inbound` and dropped if the owner falls behind.
    pub fn connect(
        addr: impl Into<String>,
        inbound: crossbeam_channel::Sender<ServerMessage>,
    ) -> Result<Self, TransportError> {
        Self::with_backoff(addr, inbound, Backoff::default())
    }

    pub fn with_backoff(
        addr: impl Into<String>,
        inbound: crossbeam_channel::Sender<ServerMessage>,
        backoff: Backoff,
    ) -> Result<Self, TransportError> {
        let addr = addr.into();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let connected = Arc::new(AtomicBool::new(false));

        let link = Link {
            addr,
            backoff,
            outbound: outbound_rx,
            inbound,
            connected: connected.clone(),
        };
        let handle = thread::Builder::new()
            .name("transport".to_string())
            .spawn(move || runtime.block_on(link.run(shutdown_rx)))?;

        Ok(Self {
            outbound,
            connected,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn send(&self, msg: ClientMessage) -> Result<(), TransportError> {
        if self.shutdown_tx.is_none() {
            return Err(TransportError::Closed);
        }
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.outbound.try_send(msg).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => TransportError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("transport thread panicked");
            }
        }
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Link {
    addr: String,
    backoff: Backoff,
    outbound: mpsc::Receiver<ClientMessage>,
    inbound: crossbeam_channel::Sender<ServerMessage>,
    connected: Arc<AtomicBool>,
}

impl Link {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let mut delay = self.backoff.initial;

        loop {
            log::info!("[transport] connecting to {}...", self.addr);
            let attempt = tokio::select! {
                _ = &mut shutdown => break,
                attempt = TcpStream::connect(self.addr.as_str()) => attempt,
            };

            match attempt {
                Ok(stream) => {
                    log::info!("[transport] connected to {}", self.addr);
                    delay = self.backoff.initial;
                    if let Err(err) = stream.set_nodelay(true) {
                        log::debug!("[transport] failed to set TCP_NODELAY: {err}");
                    }

                    self.discard_queued();
                    self.connected.store(true, Ordering::Release);
                    let ended = tokio::select! {
                        _ = &mut shutdown => None,
                        ended = session(stream, &mut self.outbound, &self.inbound) => Some(ended),
                    };
                    self.connected.store(false, Ordering::Release);
                    self.discard_queued();

                    match ended {
                        None => break,
                        Some(Ok(())) => log::warn!("[transport] server closed the connection"),
                        Some(Err(err)) => log::warn!("[transport] connection lost: {err}"),
                    }
                }
                Err(err) => log::warn!("[transport] connection failed: {err}"),
            }

            log::info!("[transport] reconnecting in {delay:?}");
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.backoff.max);
        }

        self.connected.store(false, Ordering::Release);
        log::info!("[transport] stopped");
    }

    fn discard_queued(&mut self) {
        let mut dropped = 0usize;
        while self.outbound.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            log::debug!("[transport] discarded {dropped} queued messages");
        }
    }
}

/// Pumps one connection until the peer closes or an I/O error occurs.
async fn session<T>(
    stream: T,
    outbound: &mut mpsc::Receiver<ClientMessage>,
    inbound: &crossbeam_channel::Sender<ServerMessage>,
) -> Result<(), TransportError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (mut writer, mut reader) = protocol::message_stream(stream).split();

    loop {
        tokio::select! {
            msg = outbound.recv() => match msg {
                Some(msg) => protocol::send_message(&mut writer, &msg).await?,
                None => return Ok(()),
            },
            received = protocol::recv_message::<_, ServerMessage>(&mut reader) => match received? {
                Some(msg) => {
                    if let Err(crossbeam_channel::TrySendError::Full(msg)) = inbound.try_send(msg) {
                        log::debug!("[transport] inbound queue full, dropping {msg:?}");
                    }
                }
                None => return Ok(()),
            },
        }
    }
}
