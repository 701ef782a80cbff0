//! Duplex byte-stream endpoints bound to the server loop.
//!
//! A [`Connection`] is one transport (a listening pipe with a single client,
//! or the process stdio). All variants share a [`ConnectionCore`] that owns
//! the raw receive accumulator, the optional [`BufferStrategy`] and the
//! write side of the transport.
//!
//! # Lifecycle
//!
//! ```text
//! add_connection ──► on_serve_start ──► connect ──► read/write ──► on_disconnect
//!   (attach id)       (bind/open)       (open)                     (shutting down)
//! ```
//!
//! Writes never block: framed bytes are handed to the transport's writer
//! task through a channel, which owns each buffer until it is written.

use super::buffer::{BufferStrategy, FramedBufferStrategy};
use super::event_loop::{ConnectionId, LoopContext};
use crate::error::Result;
use bytes::Bytes;
use std::thread::{self, ThreadId};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// State shared by every transport variant.
pub struct ConnectionCore {
    id: Option<ConnectionId>,
    strategy: Option<Box<dyn BufferStrategy>>,
    raw_read_buffer: Vec<u8>,
    writer: Option<mpsc::UnboundedSender<Bytes>>,
    loop_thread: Option<ThreadId>,
}

impl ConnectionCore {
    pub fn new(strategy: Option<Box<dyn BufferStrategy>>) -> Self {
        Self {
            id: None,
            strategy,
            raw_read_buffer: Vec::new(),
            writer: None,
            loop_thread: None,
        }
    }

    /// Core using the default delimiter framing.
    pub fn framed() -> Self {
        Self::new(Some(Box::new(FramedBufferStrategy::new())))
    }

    /// Core without framing: every read is forwarded verbatim as one message.
    pub fn passthrough() -> Self {
        Self::new(None)
    }

    pub fn id(&self) -> Option<ConnectionId> {
        self.id
    }

    pub(crate) fn attach(&mut self, id: ConnectionId) {
        self.id = Some(id);
    }

    /// Record the loop thread; writes from any other thread are a bug.
    pub(crate) fn bind_loop_thread(&mut self, thread: ThreadId) {
        self.loop_thread = Some(thread);
    }

    /// Create the write channel and keep its sending half.
    ///
    /// The receiving half goes to the task that owns the transport.
    pub fn open_writer(&mut self) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.writer = Some(tx);
        rx
    }

    /// Install a write channel created earlier (accepted listener clients).
    pub fn install_writer(&mut self, writer: mpsc::UnboundedSender<Bytes>) {
        self.writer = Some(writer);
    }

    /// True iff the write side of the transport is valid.
    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Frame `data` (if a strategy is installed) and queue it for writing.
    pub fn write_data(&self, data: &str) {
        if let Some(loop_thread) = self.loop_thread {
            debug_assert_eq!(
                thread::current().id(),
                loop_thread,
                "write_data called off the loop thread"
            );
        }

        let Some(writer) = self.writer.as_ref() else {
            debug!("Dropping write to closed connection {:?}", self.id);
            return;
        };

        let framed = match self.strategy.as_ref() {
            Some(strategy) => strategy.format(data),
            None => data.to_string(),
        };
        trace!("Queueing {} bytes on {:?}", framed.len(), self.id);
        // A send error means the writer task already ended; the transport
        // reports that through its own disconnect path.
        let _ = writer.send(Bytes::from(framed));
    }

    /// Append raw bytes and return every complete message now available.
    pub fn read_data(&mut self, data: &[u8]) -> Vec<String> {
        self.raw_read_buffer.extend_from_slice(data);

        match self.strategy.as_mut() {
            Some(strategy) => {
                let mut messages = Vec::new();
                while let Some(message) = strategy.extract(&mut self.raw_read_buffer) {
                    messages.push(message);
                }
                messages
            }
            None => {
                let message = String::from_utf8_lossy(&self.raw_read_buffer).into_owned();
                self.raw_read_buffer.clear();
                vec![message]
            }
        }
    }

    /// Release the write side. Idempotent.
    pub fn shut_down(&mut self) -> bool {
        self.writer.take();
        true
    }

    /// Forget buffered input. Called when the peer goes away so a half
    /// received frame never leaks into a later session.
    pub fn reset(&mut self) {
        self.raw_read_buffer.clear();
        if let Some(strategy) = self.strategy.as_mut() {
            strategy.clear();
        }
    }
}

impl Default for ConnectionCore {
    fn default() -> Self {
        Self::framed()
    }
}

/// A transport endpoint owned by the server.
///
/// Implementors provide access to their [`ConnectionCore`] and override the
/// transport-specific hooks; reading, writing and teardown are shared.
pub trait Connection: Send + Sync {
    fn core(&self) -> &ConnectionCore;

    fn core_mut(&mut self) -> &mut ConnectionCore;

    /// Human readable description for logs.
    fn describe(&self) -> String;

    /// Transport setup, run once when the server starts serving.
    ///
    /// An error aborts server startup before the loop runs.
    fn on_serve_start(&mut self, ctx: &mut LoopContext<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Bind an accepted peer as the active transport.
    ///
    /// Returns `false` if the connection was already bound.
    fn connect(&mut self) -> bool {
        true
    }

    /// Detach the transport. Idempotent; no writes happen afterwards.
    fn on_connection_shutting_down(&mut self) -> bool {
        self.core_mut().shut_down()
    }

    /// The peer closed or the transport failed.
    fn on_disconnect(&mut self, error: Option<&std::io::Error>) {
        match error {
            Some(e) => debug!("{} disconnected: {}", self.describe(), e),
            None => debug!("{} disconnected", self.describe()),
        }
        self.on_connection_shutting_down();
        self.core_mut().reset();
    }

    fn is_open(&self) -> bool {
        self.core().is_open()
    }

    fn write_data(&self, data: &str) {
        self.core().write_data(data);
    }

    fn read_data(&mut self, data: &[u8]) -> Vec<String> {
        self.core_mut().read_data(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_is_framed_and_queued() {
        let mut core = ConnectionCore::framed();
        let mut rx = core.open_writer();
        assert!(core.is_open());

        core.write_data("{}");
        let bytes = rx.try_recv().unwrap();
        assert_eq!(
            &bytes[..],
            b"\n[== \"CMake Server\" ==[\n{}\n]== \"CMake Server\" ==]\n"
        );
    }

    #[test]
    fn test_passthrough_forwards_whole_buffer() {
        let mut core = ConnectionCore::passthrough();
        assert_eq!(core.read_data(b"partial line"), vec!["partial line".to_string()]);
        assert_eq!(core.read_data(b"next"), vec!["next".to_string()]);

        let mut rx = core.open_writer();
        core.write_data("raw");
        assert_eq!(&rx.try_recv().unwrap()[..], b"raw");
    }

    #[test]
    fn test_read_drains_multiple_frames() {
        let mut core = ConnectionCore::framed();
        let frames = format!(
            "{}{}",
            FramedBufferStrategy::new().format("one"),
            FramedBufferStrategy::new().format("two")
        );
        let messages = core.read_data(frames.as_bytes());
        assert_eq!(messages, vec!["one\n".to_string(), "two\n".to_string()]);
    }

    #[test]
    fn test_shut_down_stops_writes() {
        let mut core = ConnectionCore::framed();
        let mut rx = core.open_writer();
        assert!(core.shut_down());
        assert!(core.shut_down());
        assert!(!core.is_open());

        core.write_data("ignored");
        assert!(rx.try_recv().is_err());
    }

    struct Bare {
        core: ConnectionCore,
    }

    impl Connection for Bare {
        fn core(&self) -> &ConnectionCore {
            &self.core
        }
        fn core_mut(&mut self) -> &mut ConnectionCore {
            &mut self.core
        }
        fn describe(&self) -> String {
            "bare".into()
        }
    }

    #[test]
    fn test_disconnect_closes_and_drops_partial_input() {
        let mut connection = Bare {
            core: ConnectionCore::framed(),
        };
        let _rx = connection.core_mut().open_writer();
        assert!(connection
            .read_data(b"[== \"CMake Server\" ==[\n{\"half\":")
            .is_empty());

        connection.on_disconnect(None);
        assert!(!connection.is_open());
        assert!(connection
            .read_data(b"1}\n]== \"CMake Server\" ==]\n")
            .is_empty());
    }

    #[test]
    fn test_reset_drops_partial_input() {
        let mut core = ConnectionCore::framed();
        assert!(core
            .read_data(b"[== \"CMake Server\" ==[\n{\"half\":")
            .is_empty());
        core.reset();
        assert!(core
            .read_data(b"1}\n]== \"CMake Server\" ==]\n")
            .is_empty());
    }
}
