//! Standard input/output transport.
//!
//! Frames are written to stdout by a writer task. Terminal and pipe input is
//! read by a reader task; a regular file redirected to stdin is drained
//! synchronously once at startup, after which the connection reports a
//! disconnect so the session ends when the file's requests are answered.

use super::connection::{Connection, ConnectionCore};
use super::event_loop::{ConnectionId, LoopContext, LoopEvent, LoopNotifier};
use crate::config::ServerConfig;
use crate::error::Result;
use crate::platform::{stdin_kind, StdinKind};
use bytes::Bytes;
use std::io::Read;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

async fn write_stdout(mut writes: mpsc::UnboundedReceiver<Bytes>) {
    let mut stdout = tokio::io::stdout();
    while let Some(bytes) = writes.recv().await {
        let written = match stdout.write_all(&bytes).await {
            Ok(()) => stdout.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            debug!("Write to stdout failed: {}", e);
        }
    }
}

async fn read_stdin(id: ConnectionId, notifier: LoopNotifier) {
    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; ServerConfig::READ_CHUNK_SIZE];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) => {
                notifier.send(LoopEvent::Disconnected(id, None));
                return;
            }
            Ok(n) => {
                if !notifier.send(LoopEvent::Data(id, Bytes::copy_from_slice(&buf[..n]))) {
                    return;
                }
            }
            Err(e) => {
                notifier.send(LoopEvent::Disconnected(id, Some(e)));
                return;
            }
        }
    }
}

/// Connection over the process standard streams.
pub struct StdioConnection {
    core: ConnectionCore,
    kind: Option<StdinKind>,
}

impl StdioConnection {
    /// A framed connection; the stdin kind is detected when serving starts.
    pub fn new() -> Self {
        Self::with_core(ConnectionCore::framed())
    }

    pub fn with_core(core: ConnectionCore) -> Self {
        Self { core, kind: None }
    }

    /// Detected stdin kind, once serving started.
    pub fn kind(&self) -> Option<StdinKind> {
        self.kind
    }
}

impl Default for StdioConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for StdioConnection {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ConnectionCore {
        &mut self.core
    }

    fn describe(&self) -> String {
        match self.kind {
            Some(kind) => format!("stdio ({:?})", kind),
            None => "stdio".to_string(),
        }
    }

    fn on_serve_start(&mut self, ctx: &mut LoopContext<'_>) -> Result<()> {
        let kind = stdin_kind();
        self.kind = Some(kind);
        debug!("Serving on stdio, stdin is {:?}", kind);

        let writes = self.core.open_writer();
        ctx.spawn(write_stdout(writes));

        let id = ctx.connection_id();
        ctx.post(LoopEvent::Connected(id));
        match kind {
            StdinKind::File => {
                let mut contents = Vec::new();
                match std::io::stdin().lock().read_to_end(&mut contents) {
                    Ok(_) => {
                        ctx.post(LoopEvent::Data(id, Bytes::from(contents)));
                        ctx.post(LoopEvent::Disconnected(id, None));
                    }
                    Err(e) => {
                        ctx.post(LoopEvent::Disconnected(id, Some(e)));
                    }
                }
            }
            StdinKind::Tty | StdinKind::Pipe => {
                ctx.spawn_abortable(read_stdin(id, ctx.notifier().clone()));
            }
        }
        Ok(())
    }
}
