//! Versioned request handlers.
//!
//! The server negotiates one [`Protocol`] per session during the handshake
//! and forwards every later request to it.

pub mod generator;
pub mod state;
pub mod v1;

pub use state::ProtocolState;
pub use v1::ProtocolV1;

use crate::ipc::{Request, Response};
use crate::watch::FileWatchTree;
use std::fmt;

/// A `(major, minor)` protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
}

impl ProtocolVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// A request handler for one protocol version.
pub trait Protocol: Send {
    fn version(&self) -> ProtocolVersion;

    fn is_experimental(&self) -> bool {
        false
    }

    /// Bind to a build system using the handshake request.
    ///
    /// On error the protocol stays inactive and the reason is reported to
    /// the client.
    fn activate(&mut self, request: &Request) -> Result<(), String>;

    /// Handle one request after activation.
    fn process(&mut self, request: &Request, watcher: &mut FileWatchTree) -> Response;
}

/// Pick the protocol matching a requested version.
///
/// An exact `(major, minor)` match wins. Without a requested minor the
/// highest minor of the same major is chosen.
pub fn find_matching_protocol(
    protocols: &[Box<dyn Protocol>],
    major: i64,
    minor: Option<i64>,
) -> Option<usize> {
    let mut best: Option<(usize, u32)> = None;
    for (index, protocol) in protocols.iter().enumerate() {
        let version = protocol.version();
        if i64::from(version.major) != major {
            continue;
        }
        match minor {
            Some(minor) if i64::from(version.minor) == minor => return Some(index),
            Some(_) => {}
            None => {
                if best.map_or(true, |(_, best_minor)| best_minor < version.minor) {
                    best = Some((index, version.minor));
                }
            }
        }
    }
    best.map(|(index, _)| index)
}
