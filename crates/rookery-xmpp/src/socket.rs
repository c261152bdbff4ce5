//! TCP socket wrapper tied to an owning process.
//!
//! A [`Socket`] owns both halves of an accepted connection. Inbound bytes
//! become [`SocketEvent::Data`] messages in the owner's mailbox and EOF or an
//! I/O error becomes [`SocketEvent::Closed`]. Outbound sends go through a
//! single dedicated writer task: it drains queued writes in order, completes
//! each waiting sender exactly once, and on an I/O error closes the
//! connection and reports the failure to every queued waiter.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::process::Pid;
use crate::XmppError;

/// Size of one socket read.
const READ_CHUNK: usize = 4096;

/// Messages a socket posts to its owning process.
#[derive(Debug)]
pub enum SocketEvent {
    /// Bytes read from the peer
    Data(Vec<u8>),
    /// The peer closed the connection, or it failed
    Closed,
}

/// Socket tuning knobs.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// How long a completing `send` may take before the socket is closed.
    /// `None` waits indefinitely.
    pub send_timeout: Option<Duration>,
    /// Outbound byte count above which `send_async` force-closes the
    /// connection. Zero disables the limit.
    pub buffer_limit: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            send_timeout: Some(Duration::from_secs(15)),
            buffer_limit: 1024 * 1024,
        }
    }
}

enum WriterCmd {
    Write {
        data: Vec<u8>,
        ack: Option<oneshot::Sender<Result<(), std::io::Error>>>,
    },
    Shutdown,
}

/// A full-duplex buffered byte pipe owned by one process.
pub struct Socket<M: From<SocketEvent> + Send + 'static> {
    owner: Pid<M>,
    cmd_tx: mpsc::UnboundedSender<WriterCmd>,
    buffered: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    config: SocketConfig,
    read_half: Arc<tokio::sync::Mutex<OwnedReadHalf>>,
    writer_task: JoinHandle<()>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl<M: From<SocketEvent> + Send + 'static> Socket<M> {
    /// Wrap an accepted connection and spawn its writer task.
    pub fn from_stream(stream: TcpStream, owner: Pid<M>, config: SocketConfig) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));

        let writer_task = tokio::spawn(writer_loop(
            write_half,
            cmd_rx,
            owner.clone(),
            Arc::clone(&buffered),
            Arc::clone(&closed),
        ));

        Self {
            owner,
            cmd_tx,
            buffered,
            closed,
            config,
            read_half: Arc::new(tokio::sync::Mutex::new(read_half)),
            writer_task,
            reader_task: Mutex::new(None),
        }
    }

    /// Launch one read of up to 4096 bytes. The result is posted to the
    /// owning process; the owner re-activates after handling it, which keeps
    /// at most one read outstanding and gives natural flow control.
    pub fn activate(&self) {
        let read_half = Arc::clone(&self.read_half);
        let closed = Arc::clone(&self.closed);
        let owner = self.owner.clone();

        let handle = tokio::spawn(async move {
            let mut buf = [0u8; READ_CHUNK];
            let result = {
                let mut half = read_half.lock().await;
                half.read(&mut buf).await
            };
            match result {
                Ok(0) => {
                    closed.store(true, Ordering::Relaxed);
                    let _ = owner.send_wait(M::from(SocketEvent::Closed)).await;
                }
                Ok(n) => {
                    let _ = owner
                        .send_wait(M::from(SocketEvent::Data(buf[..n].to_vec())))
                        .await;
                }
                Err(e) => {
                    debug!(error = %e, "socket read failed");
                    closed.store(true, Ordering::Relaxed);
                    let _ = owner.send_wait(M::from(SocketEvent::Closed)).await;
                }
            }
        });

        *self.reader_task.lock().expect("reader task lock") = Some(handle);
    }

    /// Queue bytes and wait for the writer to put them on the wire.
    ///
    /// With a send timeout configured, expiry force-closes the socket and the
    /// send fails with [`XmppError::Timeout`].
    pub async fn send(&self, data: impl Into<Vec<u8>>) -> Result<(), XmppError> {
        let data = data.into();
        if self.closed.load(Ordering::Relaxed) {
            return Err(XmppError::Closed);
        }
        self.buffered.fetch_add(data.len(), Ordering::Relaxed);

        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(WriterCmd::Write {
                data,
                ack: Some(ack_tx),
            })
            .map_err(|_| XmppError::Closed)?;

        let completion = async {
            match ack_rx.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(XmppError::Io(e)),
                Err(_) => Err(XmppError::Closed),
            }
        };

        match self.config.send_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, completion).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("socket send timed out, closing");
                    self.close_force();
                    Err(XmppError::Timeout)
                }
            },
            None => completion.await,
        }
    }

    /// Queue bytes without waiting for completion.
    ///
    /// When a buffer limit is configured and already exceeded, the socket is
    /// force-closed instead of queueing more.
    pub fn send_async(&self, data: impl Into<Vec<u8>>) {
        let data = data.into();
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        let limit = self.config.buffer_limit;
        if limit > 0 && self.buffered.load(Ordering::Relaxed) > limit {
            warn!(limit, "outbound buffer over limit, force-closing socket");
            self.close_force();
            return;
        }
        self.buffered.fetch_add(data.len(), Ordering::Relaxed);
        let _ = self.cmd_tx.send(WriterCmd::Write { data, ack: None });
    }

    /// Orderly close: the writer drains already-queued writes, then shuts
    /// the connection down. The peer's EOF surfaces as a `Closed` event.
    pub fn close(&self) {
        self.buffered.store(0, Ordering::Relaxed);
        let _ = self.cmd_tx.send(WriterCmd::Shutdown);
    }

    /// Forceful close: abort the writer and any outstanding read.
    pub fn close_force(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.buffered.store(0, Ordering::Relaxed);
        self.writer_task.abort();
        if let Some(task) = self.reader_task.lock().expect("reader task lock").take() {
            task.abort();
        }
    }

    /// Whether the socket has been closed locally or by the peer.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

/// The single writer task for one socket.
async fn writer_loop<M: From<SocketEvent> + Send + 'static>(
    mut write_half: OwnedWriteHalf,
    mut cmd_rx: mpsc::UnboundedReceiver<WriterCmd>,
    owner: Pid<M>,
    buffered: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            WriterCmd::Write { data, ack } => {
                let len = data.len();
                match write_half.write_all(&data).await {
                    Ok(()) => {
                        let _ = buffered.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                            Some(v.saturating_sub(len))
                        });
                        if let Some(ack) = ack {
                            let _ = ack.send(Ok(()));
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "socket write failed, closing");
                        closed.store(true, Ordering::Relaxed);
                        buffered.store(0, Ordering::Relaxed);
                        if let Some(ack) = ack {
                            let _ = ack.send(Err(e));
                        }
                        // Every still-queued waiter learns about the failure.
                        cmd_rx.close();
                        while let Ok(cmd) = cmd_rx.try_recv() {
                            if let WriterCmd::Write { ack: Some(ack), .. } = cmd {
                                let _ = ack.send(Err(std::io::Error::new(
                                    std::io::ErrorKind::BrokenPipe,
                                    "socket closed after write error",
                                )));
                            }
                        }
                        let _ = owner.send_wait(M::from(SocketEvent::Closed)).await;
                        return;
                    }
                }
            }
            WriterCmd::Shutdown => {
                let _ = write_half.shutdown().await;
                return;
            }
        }
    }
    // All senders dropped: the socket handle is gone, shut down quietly.
    let _ = write_half.shutdown().await;
}
