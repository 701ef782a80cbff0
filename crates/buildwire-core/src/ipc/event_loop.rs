//! Single-threaded event loop plumbing.
//!
//! Transport tasks, OS signal listeners and native file watchers never touch
//! server state directly. They post [`LoopEvent`]s through a
//! [`LoopNotifier`], and the loop thread handles each event in receipt order.
//!
//! # Thread Safety
//!
//! `LoopNotifier` may be cloned into any thread. Sending after the loop has
//! begun shutting down is a silent no-op: the sender slot is guarded by a
//! mutex and cleared exactly once by [`LoopNotifier::close`].

use crate::watch::FileChange;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tracing::debug;

/// Index of a connection in the server's active set.
///
/// Events carry the id rather than a reference, so a callback queued for a
/// connection that has since been evicted resolves to nothing and is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    /// Raw numeric value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Termination-style OS signals the server reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsSignal {
    Interrupt,
    HangUp,
}

/// Work posted to the loop thread.
#[derive(Debug)]
pub enum LoopEvent {
    /// A transport finished its accept/open sequence.
    Connected(ConnectionId),
    /// Bytes arrived on a transport.
    Data(ConnectionId, Bytes),
    /// The peer closed the transport or an I/O error occurred.
    Disconnected(ConnectionId, Option<std::io::Error>),
    /// A watched file changed on disk.
    FileChanged { path: PathBuf, change: FileChange },
    /// An OS signal was delivered.
    Signal(OsSignal),
    /// Shutdown was requested (last client gone, or a cross-thread handle).
    Shutdown,
}

/// Thread-safe wake-up primitive for the loop.
#[derive(Clone)]
pub struct LoopNotifier {
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<LoopEvent>>>>,
}

impl LoopNotifier {
    /// Create a notifier together with the receiving end the loop drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LoopEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                sender: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Post an event. Returns `false` if the loop is gone or shutting down.
    pub fn send(&self, event: LoopEvent) -> bool {
        match self.sender.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Detach the notifier. Every clone observes the close.
    pub fn close(&self) {
        self.sender.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl fmt::Debug for LoopNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopNotifier")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Every task registered against the loop.
///
/// Flushing tasks end by themselves once their write channel closes.
/// Force-closable tasks (signal listeners, blocking stdin readers) are
/// aborted during shutdown.
#[derive(Default)]
pub struct LoopHandles {
    tasks: JoinSet<()>,
    force_close: Vec<AbortHandle>,
}

impl LoopHandles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task that finishes on its own during shutdown.
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    /// Spawn a task that shutdown must abort.
    pub fn spawn_abortable<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.tasks.spawn(task);
        self.force_close.push(handle);
    }

    /// Abort every force-closable task.
    pub fn close_all(&mut self) {
        for handle in self.force_close.drain(..) {
            handle.abort();
        }
    }

    /// Number of tasks that have not been reaped yet.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Reap finished tasks, waiting at most `timeout`. Returns how many remain.
    pub async fn drain(&mut self, timeout: Duration) -> usize {
        let reap = async {
            while let Some(result) = self.tasks.join_next().await {
                if let Err(e) = result {
                    if !e.is_cancelled() {
                        debug!("Loop task ended abnormally: {}", e);
                    }
                }
            }
        };
        let _ = tokio::time::timeout(timeout, reap).await;
        self.tasks.len()
    }
}

/// Per-connection view of the loop handed to transport setup.
pub struct LoopContext<'a> {
    connection: ConnectionId,
    notifier: LoopNotifier,
    handles: &'a mut LoopHandles,
}

impl<'a> LoopContext<'a> {
    pub fn new(connection: ConnectionId, notifier: LoopNotifier, handles: &'a mut LoopHandles) -> Self {
        Self {
            connection,
            notifier,
            handles,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    pub fn notifier(&self) -> &LoopNotifier {
        &self.notifier
    }

    pub fn post(&self, event: LoopEvent) -> bool {
        self.notifier.send(event)
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles.spawn(task);
    }

    pub fn spawn_abortable<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles.spawn_abortable(task);
    }
}

/// Register interrupt and hang-up listeners that post [`LoopEvent::Signal`].
pub(crate) fn install_signal_handlers(
    handles: &mut LoopHandles,
    notifier: &LoopNotifier,
) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        for (kind, os_signal) in [
            (SignalKind::interrupt(), OsSignal::Interrupt),
            (SignalKind::hangup(), OsSignal::HangUp),
        ] {
            let mut stream = signal(kind)?;
            let notifier = notifier.clone();
            handles.spawn_abortable(async move {
                while stream.recv().await.is_some() {
                    if !notifier.send(LoopEvent::Signal(os_signal)) {
                        break;
                    }
                }
            });
        }
    }
    #[cfg(windows)]
    {
        let notifier = notifier.clone();
        handles.spawn_abortable(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if !notifier.send(LoopEvent::Signal(OsSignal::Interrupt)) {
                    break;
                }
            }
        });
    }
    Ok(())
}
