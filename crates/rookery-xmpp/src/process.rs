//! Lightweight process runtime: tasks with private bounded mailboxes.
//!
//! Every concurrent unit of the endpoint (a client connection, the local
//! delivery loop of a served host) runs as a tokio task owning the receive
//! side of a bounded mpsc channel. The send side plus an opaque identity is
//! the process handle that other components hold. Communication is
//! exclusively by message passing; delivery is FIFO per sender, interleaving
//! across senders is unspecified.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::error;

use crate::XmppError;

/// Cap on undelivered messages per mailbox. A process that keeps receiving
/// never observes the cap; a stalled process makes senders fail with
/// [`XmppError::QueueLimit`] instead of blocking them.
pub const MAILBOX_LIMIT: usize = 10_000;

static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of a spawned process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sending handle for a process mailbox.
pub struct Pid<M> {
    id: ProcessId,
    tx: mpsc::Sender<M>,
}

impl<M> Clone for Pid<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tx: self.tx.clone(),
        }
    }
}

impl<M> fmt::Debug for Pid<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pid({})", self.id)
    }
}

impl<M> Pid<M> {
    /// The identity of the process this handle addresses.
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Enqueue a message without blocking.
    ///
    /// Fails with [`XmppError::QueueLimit`] when the mailbox holds
    /// [`MAILBOX_LIMIT`] undelivered messages and no receive is draining it,
    /// and with [`XmppError::Closed`] when the process has terminated.
    pub fn send(&self, msg: M) -> Result<(), XmppError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => XmppError::QueueLimit,
            mpsc::error::TrySendError::Closed(_) => XmppError::Closed,
        })
    }

    /// Enqueue a message, suspending while the mailbox is at capacity.
    ///
    /// Used by I/O adapters (socket reader) that prefer backpressure over a
    /// delivery failure.
    pub async fn send_wait(&self, msg: M) -> Result<(), XmppError> {
        self.tx.send(msg).await.map_err(|_| XmppError::Closed)
    }

    /// Whether the owning process is still alive.
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Receiving side of a process mailbox; owned by exactly one process.
pub struct Mailbox<M> {
    rx: mpsc::Receiver<M>,
}

impl<M> Mailbox<M> {
    /// Remove and return the oldest message, suspending while the mailbox is
    /// empty. Returns `None` once every sending handle is gone.
    pub async fn receive(&mut self) -> Option<M> {
        self.rx.recv().await
    }

    /// Stop accepting new messages; already-queued messages stay receivable.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Spawn a process. The body receives its own handle and its mailbox and
/// runs concurrently; an error return is reported and terminates only that
/// process.
pub fn spawn<M, F, Fut>(body: F) -> Pid<M>
where
    M: Send + 'static,
    F: FnOnce(Pid<M>, Mailbox<M>) -> Fut,
    Fut: Future<Output = Result<(), XmppError>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(MAILBOX_LIMIT);
    let id = ProcessId(NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed));
    let pid = Pid { id, tx };
    let fut = body(pid.clone(), Mailbox { rx });
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            error!(process = %id, error = %e, "process terminated with error");
        }
    });
    pid
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn delivery_is_fifo_per_sender() {
        let (done_tx, done_rx) = oneshot::channel();
        let pid = spawn(move |_, mut mailbox: Mailbox<u32>| async move {
            let mut got = Vec::new();
            while let Some(n) = mailbox.receive().await {
                got.push(n);
                if got.len() == 3 {
                    break;
                }
            }
            let _ = done_tx.send(got);
            Ok(())
        });

        for n in [1, 2, 3] {
            pid.send(n).unwrap();
        }
        assert_eq!(done_rx.await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn queue_limit_when_mailbox_is_full_and_idle() {
        let (hold_tx, hold_rx) = oneshot::channel::<()>();
        let pid = spawn(move |_, mut mailbox: Mailbox<usize>| async move {
            // Do not receive until told to.
            let _ = hold_rx.await;
            while mailbox.receive().await.is_some() {}
            Ok(())
        });

        for n in 0..MAILBOX_LIMIT {
            pid.send(n).unwrap();
        }
        assert!(matches!(pid.send(0), Err(XmppError::QueueLimit)));

        // Once the process drains, sends succeed again.
        hold_tx.send(()).unwrap();
        let mut sent = false;
        for _ in 0..100 {
            if pid.send(1).is_ok() {
                sent = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(sent);
    }

    #[tokio::test]
    async fn send_to_terminated_process_fails_closed() {
        let pid = spawn(|_, mut mailbox: Mailbox<()>| async move {
            mailbox.close();
            Ok(())
        });
        // Wait for the process to finish.
        for _ in 0..100 {
            if !pid.is_alive() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(matches!(pid.send(()), Err(XmppError::Closed)));
    }

    #[tokio::test]
    async fn process_ids_are_unique() {
        let a = spawn(|_, _mailbox: Mailbox<()>| async { Ok(()) });
        let b = spawn(|_, _mailbox: Mailbox<()>| async { Ok(()) });
        assert_ne!(a.id(), b.id());
    }
}
