//! Named pipe transport.
//!
//! Binds a local endpoint (a Unix domain socket path, or a `\\.\pipe\` name
//! on Windows) and serves exactly one client. Further clients are accepted
//! and closed immediately.

use super::connection::{Connection, ConnectionCore};
use super::event_loop::{ConnectionId, LoopContext, LoopEvent, LoopNotifier};
use crate::config::ServerConfig;
use crate::error::Result;
use bytes::Bytes;
use std::future::Future;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Accept side of a pipe endpoint.
trait PipeListener: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + 'static;

    fn accept(&mut self) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

#[cfg(unix)]
mod endpoint {
    use super::PipeListener;
    use crate::error::{Result, ServerError};
    use std::future::Future;
    use std::io;
    use std::path::Path;
    use tokio::net::{UnixListener, UnixSocket, UnixStream};

    pub(super) struct Listener(UnixListener);

    impl PipeListener for Listener {
        type Stream = UnixStream;

        fn accept(&mut self) -> impl Future<Output = io::Result<UnixStream>> + Send {
            async move { self.0.accept().await.map(|(stream, _)| stream) }
        }
    }

    pub(super) fn bind(name: &str) -> Result<Listener> {
        let bind_error = |e: io::Error| ServerError::Bind {
            endpoint: name.to_string(),
            message: e.to_string(),
        };
        let socket = UnixSocket::new_stream().map_err(bind_error)?;
        socket.bind(Path::new(name)).map_err(bind_error)?;
        let listener = socket.listen(1).map_err(|e| ServerError::Listen {
            endpoint: name.to_string(),
            message: e.to_string(),
        })?;
        Ok(Listener(listener))
    }

    /// Remove the socket file left behind by [`bind`].
    pub(super) fn cleanup(name: &str) {
        let _ = std::fs::remove_file(name);
    }
}

#[cfg(windows)]
mod endpoint {
    use super::PipeListener;
    use crate::error::{Result, ServerError};
    use std::future::Future;
    use std::io;
    use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};

    pub(super) struct Listener {
        name: String,
        next: NamedPipeServer,
    }

    impl PipeListener for Listener {
        type Stream = NamedPipeServer;

        fn accept(&mut self) -> impl Future<Output = io::Result<NamedPipeServer>> + Send {
            async move {
                self.next.connect().await?;
                let fresh = ServerOptions::new().create(&self.name)?;
                Ok(std::mem::replace(&mut self.next, fresh))
            }
        }
    }

    pub(super) fn bind(name: &str) -> Result<Listener> {
        let next = ServerOptions::new()
            .first_pipe_instance(true)
            .create(name)
            .map_err(|e| ServerError::Bind {
                endpoint: name.to_string(),
                message: e.to_string(),
            })?;
        Ok(Listener {
            name: name.to_string(),
            next,
        })
    }

    pub(super) fn cleanup(_name: &str) {}
}

/// Serve the first client of `listener` until the write channel closes.
async fn serve_pipe<L: PipeListener>(
    mut listener: L,
    mut writes: mpsc::UnboundedReceiver<Bytes>,
    id: ConnectionId,
    notifier: LoopNotifier,
) {
    let stream = loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(stream) => break stream,
                Err(e) => {
                    notifier.send(LoopEvent::Disconnected(id, Some(e)));
                    return;
                }
            },
            queued = writes.recv() => {
                if queued.is_none() {
                    return;
                }
            }
        }
    };
    notifier.send(LoopEvent::Connected(id));

    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = vec![0u8; ServerConfig::READ_CHUNK_SIZE];
    let mut reading = true;
    loop {
        tokio::select! {
            extra = listener.accept() => match extra {
                Ok(stream) => {
                    warn!("{} already has a client, closing the new one", id);
                    drop(stream);
                }
                Err(e) => debug!("Accept on {} failed: {}", id, e),
            },
            read = reader.read(&mut buf), if reading => match read {
                Ok(0) => {
                    reading = false;
                    notifier.send(LoopEvent::Disconnected(id, None));
                }
                Ok(n) => {
                    notifier.send(LoopEvent::Data(id, Bytes::copy_from_slice(&buf[..n])));
                }
                Err(e) => {
                    reading = false;
                    notifier.send(LoopEvent::Disconnected(id, Some(e)));
                }
            },
            queued = writes.recv() => match queued {
                Some(bytes) => {
                    if let Err(e) = writer.write_all(&bytes).await {
                        debug!("Write on {} failed: {}", id, e);
                    }
                }
                None => break,
            },
        }
    }
    let _ = writer.shutdown().await;
}

/// Connection listening on a named pipe.
pub struct PipeConnection {
    core: ConnectionCore,
    name: String,
    pending_writer: Option<mpsc::UnboundedSender<Bytes>>,
    bound: bool,
    connected: bool,
}

impl PipeConnection {
    /// A framed connection on `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_core(name, ConnectionCore::framed())
    }

    pub fn with_core(name: impl Into<String>, core: ConnectionCore) -> Self {
        Self {
            core,
            name: name.into(),
            pending_writer: None,
            bound: false,
            connected: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Connection for PipeConnection {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ConnectionCore {
        &mut self.core
    }

    fn describe(&self) -> String {
        format!("pipe {}", self.name)
    }

    fn on_serve_start(&mut self, ctx: &mut LoopContext<'_>) -> Result<()> {
        let listener = endpoint::bind(&self.name)?;
        self.bound = true;
        info!("Listening on {}", self.name);

        let (tx, rx) = mpsc::unbounded_channel();
        self.pending_writer = Some(tx);
        ctx.spawn(serve_pipe(
            listener,
            rx,
            ctx.connection_id(),
            ctx.notifier().clone(),
        ));
        Ok(())
    }

    fn connect(&mut self) -> bool {
        if self.connected {
            return false;
        }
        let Some(writer) = self.pending_writer.take() else {
            return false;
        };
        self.core.install_writer(writer);
        self.connected = true;
        true
    }

    fn on_connection_shutting_down(&mut self) -> bool {
        self.pending_writer = None;
        self.core.shut_down()
    }
}

impl Drop for PipeConnection {
    fn drop(&mut self) {
        if self.bound {
            endpoint::cleanup(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServerError;
    use crate::ipc::event_loop::LoopHandles;

    #[test]
    fn test_connect_requires_serve_start() {
        let mut connection = PipeConnection::new("/nonexistent/buildwire.sock");
        assert!(!connection.connect());
        assert!(!connection.is_open());
        assert_eq!(connection.describe(), "pipe /nonexistent/buildwire.sock");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let (notifier, _events) = LoopNotifier::channel();
        let mut handles = LoopHandles::new();
        let mut connection = PipeConnection::new("/nonexistent-dir/buildwire.sock");
        let mut ctx = LoopContext::new(ConnectionId(0), notifier, &mut handles);
        let err = connection.on_serve_start(&mut ctx).unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
        assert!(err.is_startup_failure());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_single_client_and_rejection() {
        use tokio::net::UnixStream;

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("buildwire.sock");
        let name = path.to_string_lossy().into_owned();

        let (notifier, mut events) = LoopNotifier::channel();
        let mut handles = LoopHandles::new();
        let mut connection = PipeConnection::with_core(&name, ConnectionCore::passthrough());
        connection.core_mut().attach(ConnectionId(3));
        {
            let mut ctx = LoopContext::new(ConnectionId(3), notifier.clone(), &mut handles);
            connection.on_serve_start(&mut ctx).unwrap();
        }
        assert!(path.exists());

        let mut client = UnixStream::connect(&path).await.unwrap();
        assert!(matches!(events.recv().await, Some(LoopEvent::Connected(ConnectionId(3)))));
        assert!(connection.connect());
        assert!(!connection.connect());

        // A second client is closed straight away.
        let mut extra = UnixStream::connect(&path).await.unwrap();
        let mut probe = [0u8; 1];
        assert_eq!(extra.read(&mut probe).await.unwrap(), 0);

        client.write_all(b"hello").await.unwrap();
        match events.recv().await {
            Some(LoopEvent::Data(id, bytes)) => {
                assert_eq!(id, ConnectionId(3));
                assert_eq!(&bytes[..], b"hello");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        connection.write_data("reply");
        let mut received = [0u8; 5];
        client.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"reply");

        drop(client);
        assert!(matches!(
            events.recv().await,
            Some(LoopEvent::Disconnected(ConnectionId(3), None))
        ));

        connection.on_disconnect(None);
        assert_eq!(handles.drain(std::time::Duration::from_secs(5)).await, 0);
        drop(connection);
        assert!(!path.exists());
    }
}
