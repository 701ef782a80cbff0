//! Local IPC server speaking framed JSON.
//!
//! # Architecture
//!
//! - **Buffer**: Frame extraction and formatting over a raw byte stream
//! - **Connection**: Transport endpoints (named pipe, process stdio)
//! - **Event loop**: Events posted by transport tasks, signals and watchers
//! - **Request**: Parsed requests, single-assignment responses
//! - **Server**: Connection set, version negotiation and dispatch

pub mod buffer;
pub mod connection;
pub mod event_loop;
pub mod pipe;
pub mod request;
pub mod server;
pub mod stdio;

pub use buffer::{BufferStrategy, FramedBufferStrategy};
pub use connection::{Connection, ConnectionCore};
pub use event_loop::{ConnectionId, LoopContext, LoopEvent, LoopNotifier, OsSignal};
pub use pipe::PipeConnection;
pub use request::{DebugInfo, Request, Response};
pub use server::{Server, ServerHandle, ServerLink};
pub use stdio::StdioConnection;
