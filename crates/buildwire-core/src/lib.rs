//! Buildwire Core - framed JSON IPC server for driving a build system.
//!
//! A [`Server`] owns a set of transports (a named pipe or the process stdio),
//! negotiates a protocol version with the client and forwards requests to
//! the active [`Protocol`]. Version 1 of the protocol drives a
//! [`BuildSystem`] through configure and generate, and watches the build's
//! input files to report changes.
//!
//! # Example
//!
//! ```rust,ignore
//! use buildwire_core::{CommandBuildSystem, ProtocolV1, Server, StdioConnection};
//! use std::sync::Arc;
//!
//! fn main() -> buildwire_core::Result<()> {
//!     let factory: buildwire_core::BuildSystemFactory =
//!         Arc::new(|| Box::new(CommandBuildSystem::new("cmake")));
//!
//!     let mut server = Server::new(false);
//!     server.register_protocol(Box::new(ProtocolV1::new(2, factory)));
//!     server.add_connection(Box::new(StdioConnection::new()));
//!     server.serve()
//! }
//! ```

pub mod build;
pub mod config;
pub mod error;
pub mod ipc;
pub mod platform;
pub mod protocol;
pub mod watch;

// Re-export commonly used types
pub use build::{
    BuildInputs, BuildSettings, BuildSystem, BuildSystemFactory, CacheEntry, CacheFile,
    CommandBuildSystem, GeneratorInfo, GlobalToggles, InputFile, Reporter,
};
pub use error::{Result, ServerError};
pub use ipc::{
    BufferStrategy, Connection, ConnectionCore, ConnectionId, FramedBufferStrategy,
    PipeConnection, Request, Response, Server, ServerHandle, ServerLink, StdioConnection,
};
pub use protocol::{Protocol, ProtocolState, ProtocolV1, ProtocolVersion};
pub use watch::{FileChange, FileWatchTree};
