//! The buildwire server.
//!
//! Owns the connection set, the registered protocols and the file watch
//! tree, and drives them from a single-threaded tokio runtime. Every
//! transport, signal listener and native watcher reports back through
//! [`LoopEvent`]s, so all request handling runs on the loop thread.
//!
//! # Thread Safety
//!
//! The connection set sits behind a `parking_lot::RwLock`: the loop thread
//! takes the exclusive lock to add, read into or evict connections, and the
//! shared lock to write; a [`ServerHandle`] on another thread only ever
//! takes the shared lock. Protocols and the watch tree are touched from the
//! loop thread alone.

use super::connection::Connection;
use super::event_loop::{
    install_signal_handlers, ConnectionId, LoopContext, LoopEvent, LoopHandles, LoopNotifier,
    OsSignal,
};
use super::request::{DebugInfo, Request, Response};
use crate::config::{RequestTypes, ServerConfig, WireKeys};
use crate::error::{Result, ServerError};
use crate::protocol::{find_matching_protocol, Protocol, ProtocolVersion};
use crate::watch::FileWatchTree;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

type ConnectionSet = Arc<RwLock<Vec<Box<dyn Connection>>>>;

fn as_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Write path into the connection set, shared with requests and watch
/// callbacks.
#[derive(Clone, Default)]
pub struct ServerLink {
    connections: ConnectionSet,
}

impl ServerLink {
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Serialize `value`, attaching debug statistics and dumping to a side
    /// file when requested.
    fn render(value: Map<String, Value>, debug: Option<&DebugInfo>) -> Option<String> {
        let mut value = Value::Object(value);
        let started = Instant::now();
        let mut text = match serde_json::to_string(&value) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to serialize outgoing message: {}", e);
                return None;
            }
        };

        let Some(debug) = debug else {
            return Some(text);
        };

        if debug.show_stats {
            let mut stats = Map::new();
            stats.insert(
                WireKeys::JSON_SERIALIZATION.into(),
                Value::from(started.elapsed().as_secs_f64() * 1000.0),
            );
            stats.insert(
                WireKeys::TOTAL_TIME.into(),
                Value::from(debug.started.elapsed().as_secs_f64() * 1000.0),
            );
            stats.insert(WireKeys::SIZE.into(), Value::from(text.len()));
            if let Some(path) = &debug.dump_to_file {
                stats.insert(
                    WireKeys::DUMP_FILE.into(),
                    Value::from(path.to_string_lossy().into_owned()),
                );
            }
            if let Value::Object(map) = &mut value {
                map.insert(WireKeys::DEBUG_STATS.into(), Value::Object(stats));
            }
            text = match serde_json::to_string(&value) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to serialize outgoing message: {}", e);
                    return None;
                }
            };
        }

        if let Some(path) = &debug.dump_to_file {
            if let Err(e) = std::fs::write(path, &text) {
                warn!("Failed to dump response to {:?}: {}", path, e);
            }
        }
        Some(text)
    }

    /// Send one object to a single connection. Unknown ids are ignored.
    pub fn write_json_to(
        &self,
        connection: ConnectionId,
        value: Map<String, Value>,
        debug: Option<&DebugInfo>,
    ) {
        let Some(text) = Self::render(value, debug) else {
            return;
        };
        let connections = self.connections.read();
        match connections
            .iter()
            .find(|c| c.core().id() == Some(connection))
        {
            Some(target) => target.write_data(&text),
            None => debug!("Dropping message for evicted connection {}", connection),
        }
    }

    /// Send one object to every connection.
    pub fn broadcast_json(&self, value: Map<String, Value>) {
        let Some(text) = Self::render(value, None) else {
            return;
        };
        for connection in self.connections.read().iter() {
            connection.write_data(&text);
        }
    }

    pub fn write_response(
        &self,
        connection: ConnectionId,
        response: &Response,
        debug: Option<&DebugInfo>,
    ) {
        let mut value = if response.is_error() {
            let mut value = Map::new();
            value.insert(WireKeys::TYPE.into(), RequestTypes::ERROR.into());
            value.insert(
                WireKeys::ERROR_MESSAGE.into(),
                response.error_message().into(),
            );
            value
        } else {
            let mut value = as_object(response.data().clone());
            value.insert(WireKeys::TYPE.into(), RequestTypes::REPLY.into());
            value
        };
        value.insert(WireKeys::REPLY_TO.into(), response.request_type().into());
        value.insert(WireKeys::COOKIE.into(), response.cookie().into());

        self.write_json_to(connection, value, debug);
    }

    /// Error for a message that could not be correlated to any request.
    pub fn write_parse_error(&self, connection: ConnectionId, message: &str) {
        let mut value = Map::new();
        value.insert(WireKeys::TYPE.into(), RequestTypes::ERROR.into());
        value.insert(WireKeys::ERROR_MESSAGE.into(), message.into());
        value.insert(WireKeys::REPLY_TO.into(), "".into());
        value.insert(WireKeys::COOKIE.into(), "".into());
        self.write_json_to(connection, value, None);
    }

    /// # Panics
    ///
    /// If `current` lies outside `[min, max]` or `message` is empty.
    pub fn write_progress(&self, request: &Request, min: i64, current: i64, max: i64, message: &str) {
        assert!(min <= current && current <= max, "progress out of bounds");
        assert!(!message.is_empty(), "progress without message");

        let mut value = Map::new();
        value.insert(WireKeys::TYPE.into(), RequestTypes::PROGRESS.into());
        value.insert(WireKeys::REPLY_TO.into(), request.request_type().into());
        value.insert(WireKeys::COOKIE.into(), request.cookie().into());
        value.insert(WireKeys::PROGRESS_MESSAGE.into(), message.into());
        value.insert(WireKeys::PROGRESS_MINIMUM.into(), min.into());
        value.insert(WireKeys::PROGRESS_MAXIMUM.into(), max.into());
        value.insert(WireKeys::PROGRESS_CURRENT.into(), current.into());
        self.write_json_to(request.connection(), value, None);
    }

    pub fn write_message(&self, request: &Request, message: &str, title: &str) {
        if message.is_empty() {
            return;
        }

        let mut value = Map::new();
        value.insert(WireKeys::TYPE.into(), RequestTypes::MESSAGE.into());
        value.insert(WireKeys::REPLY_TO.into(), request.request_type().into());
        value.insert(WireKeys::COOKIE.into(), request.cookie().into());
        value.insert(WireKeys::MESSAGE.into(), message.into());
        if !title.is_empty() {
            value.insert(WireKeys::TITLE.into(), title.into());
        }
        self.write_json_to(request.connection(), value, None);
    }

    /// Broadcast an uncorrelated signal. `data` must be an object or null.
    pub fn write_signal(&self, name: &str, data: Value) {
        assert!(
            data.is_object() || data.is_null(),
            "signal data must be an object"
        );

        let mut value = as_object(data);
        value.insert(WireKeys::TYPE.into(), RequestTypes::SIGNAL.into());
        value.insert(WireKeys::REPLY_TO.into(), "".into());
        value.insert(WireKeys::COOKIE.into(), "".into());
        value.insert(WireKeys::NAME.into(), name.into());
        self.broadcast_json(value);
    }
}

/// Cross-thread handle to a server, usable while it serves.
#[derive(Clone)]
pub struct ServerHandle {
    connections: ConnectionSet,
    notifier: LoopNotifier,
}

impl ServerHandle {
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Ask the loop to shut down. Returns `false` if it already stopped.
    pub fn shutdown(&self) -> bool {
        self.notifier.send(LoopEvent::Shutdown)
    }
}

/// Local IPC server speaking framed JSON.
pub struct Server {
    connections: ConnectionSet,
    link: ServerLink,
    protocols: Vec<Box<dyn Protocol>>,
    active: Option<usize>,
    support_experimental: bool,
    watch_tree: FileWatchTree,
    notifier: LoopNotifier,
    events: Option<mpsc::UnboundedReceiver<LoopEvent>>,
    next_id: u64,
    shutting_down: bool,
}

impl Server {
    /// Create a server. Experimental protocols are only registered when
    /// `support_experimental` is set.
    pub fn new(support_experimental: bool) -> Self {
        let link = ServerLink::default();
        let (notifier, events) = LoopNotifier::channel();
        Self {
            connections: Arc::clone(&link.connections),
            link,
            protocols: Vec::new(),
            active: None,
            support_experimental,
            watch_tree: FileWatchTree::new(),
            notifier,
            events: Some(events),
            next_id: 0,
            shutting_down: false,
        }
    }

    /// Register a candidate protocol. Returns `false` if it was skipped as
    /// experimental.
    ///
    /// # Panics
    ///
    /// If a protocol with the same version is already registered.
    pub fn register_protocol(&mut self, protocol: Box<dyn Protocol>) -> bool {
        let version = protocol.version();
        if protocol.is_experimental() && !self.support_experimental {
            debug!("Skipping experimental protocol {}", version);
            return false;
        }
        assert!(
            !self.protocols.iter().any(|p| p.version() == version),
            "protocol version {version} registered twice"
        );
        self.protocols.push(protocol);
        true
    }

    /// Take ownership of a connection. Transport I/O starts with [`serve`].
    ///
    /// [`serve`]: Server::serve
    pub fn add_connection(&mut self, mut connection: Box<dyn Connection>) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        connection.core_mut().attach(id);
        debug!("Adding {} as {}", connection.describe(), id);
        self.connections.write().push(connection);
        id
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            connections: Arc::clone(&self.connections),
            notifier: self.notifier.clone(),
        }
    }

    pub fn link(&self) -> ServerLink {
        self.link.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.link.connection_count()
    }

    pub fn active_protocol_version(&self) -> Option<ProtocolVersion> {
        self.active.map(|index| self.protocols[index].version())
    }

    pub fn watch_tree(&self) -> &FileWatchTree {
        &self.watch_tree
    }

    /// Run the loop on the calling thread until the session ends.
    ///
    /// Fails before the loop runs if no protocol is registered or a
    /// connection cannot be set up, and after it ends if tasks are still
    /// pending past the drain timeout.
    pub fn serve(&mut self) -> Result<()> {
        if self.protocols.is_empty() {
            return Err(ServerError::NoProtocols);
        }
        let events = self.events.take().ok_or(ServerError::AlreadyServed)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let result = runtime.block_on(self.run(events));
        // Blocking stdin reads cannot be interrupted; do not wait for them.
        runtime.shutdown_background();
        result
    }

    /// Run [`serve`](Server::serve) on a dedicated thread.
    pub fn start_on_thread(mut self) -> Result<thread::JoinHandle<Result<()>>> {
        thread::Builder::new()
            .name("buildwire-loop".into())
            .spawn(move || self.serve())
            .map_err(ServerError::from)
    }

    async fn run(&mut self, mut events: mpsc::UnboundedReceiver<LoopEvent>) -> Result<()> {
        let mut handles = LoopHandles::new();
        if let Err(e) = install_signal_handlers(&mut handles, &self.notifier) {
            warn!("Failed to install signal handlers: {}", e);
        }
        self.watch_tree.bind(self.notifier.clone());

        if let Err(e) = self.start_connections(thread::current().id(), &mut handles) {
            error!("{}", e);
            self.start_shut_down(&mut handles);
            handles.drain(ServerConfig::SHUTDOWN_DRAIN_TIMEOUT).await;
            return Err(e);
        }
        info!("Serving {} connection(s)", self.connection_count());

        while let Some(event) = events.recv().await {
            if !self.handle_event(event, &mut handles) {
                break;
            }
        }
        self.start_shut_down(&mut handles);

        let pending = handles.drain(ServerConfig::SHUTDOWN_DRAIN_TIMEOUT).await;
        if pending > 0 {
            error!("Event loop stopped with {} handle(s) still open", pending);
            return Err(ServerError::UncleanShutdown { pending });
        }
        info!("Server stopped");
        Ok(())
    }

    fn start_connections(&mut self, loop_thread: ThreadId, handles: &mut LoopHandles) -> Result<()> {
        let mut connections = self.connections.write();
        for connection in connections.iter_mut() {
            connection.core_mut().bind_loop_thread(loop_thread);
            let Some(id) = connection.core().id() else {
                continue;
            };
            let mut ctx = LoopContext::new(id, self.notifier.clone(), handles);
            connection.on_serve_start(&mut ctx)?;
        }
        Ok(())
    }

    /// Handle one event. Returns `false` once the loop should stop.
    fn handle_event(&mut self, event: LoopEvent, handles: &mut LoopHandles) -> bool {
        match event {
            LoopEvent::Connected(id) => self.on_connected(id),
            LoopEvent::Data(id, bytes) => {
                let messages = {
                    let mut connections = self.connections.write();
                    match connections.iter_mut().find(|c| c.core().id() == Some(id)) {
                        Some(connection) => connection.read_data(&bytes),
                        None => {
                            debug!("Ignoring data for evicted connection {}", id);
                            Vec::new()
                        }
                    }
                };
                for message in messages {
                    self.process_request(id, &message);
                }
            }
            LoopEvent::Disconnected(id, error) => self.on_disconnect(id, error),
            LoopEvent::FileChanged { path, change } => {
                self.watch_tree.dispatch(&path, change);
            }
            LoopEvent::Signal(signal) => {
                self.on_signal(signal, handles);
                return false;
            }
            LoopEvent::Shutdown => {
                self.start_shut_down(handles);
                return false;
            }
        }
        true
    }

    fn on_connected(&mut self, id: ConnectionId) {
        let bound = {
            let mut connections = self.connections.write();
            connections
                .iter_mut()
                .find(|c| c.core().id() == Some(id))
                .map(|c| c.connect())
                .unwrap_or(false)
        };
        if bound {
            debug!("{} connected", id);
            self.link.write_json_to(id, self.hello(), None);
        }
    }

    fn hello(&self) -> Map<String, Value> {
        let versions: Vec<Value> = self
            .protocols
            .iter()
            .map(|protocol| {
                let version = protocol.version();
                let mut entry = Map::new();
                entry.insert(WireKeys::MAJOR.into(), version.major.into());
                entry.insert(WireKeys::MINOR.into(), version.minor.into());
                if protocol.is_experimental() {
                    entry.insert(WireKeys::IS_EXPERIMENTAL.into(), true.into());
                }
                Value::Object(entry)
            })
            .collect();

        let mut hello = Map::new();
        hello.insert(WireKeys::TYPE.into(), RequestTypes::HELLO.into());
        hello.insert(
            WireKeys::SUPPORTED_PROTOCOL_VERSIONS.into(),
            Value::Array(versions),
        );
        hello
    }

    fn on_disconnect(&mut self, id: ConnectionId, error: Option<std::io::Error>) {
        let remaining = {
            let mut connections = self.connections.write();
            if let Some(position) = connections.iter().position(|c| c.core().id() == Some(id)) {
                let mut connection = connections.remove(position);
                connection.on_disconnect(error.as_ref());
            }
            connections.len()
        };
        if remaining == 0 {
            debug!("Last connection closed");
            self.notifier.send(LoopEvent::Shutdown);
        }
    }

    fn on_signal(&mut self, signal: OsSignal, handles: &mut LoopHandles) {
        info!("Received {:?}, shutting down", signal);
        self.start_shut_down(handles);
    }

    fn start_shut_down(&mut self, handles: &mut LoopHandles) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;

        handles.close_all();
        self.notifier.close();
        self.watch_tree.unbind();

        let mut connections = self.connections.write();
        for connection in connections.iter_mut() {
            connection.on_connection_shutting_down();
        }
        connections.clear();
    }

    /// Parse and dispatch one extracted message.
    pub(crate) fn process_request(&mut self, connection: ConnectionId, input: &str) {
        let value: Value = match serde_json::from_str(input) {
            Ok(value) => value,
            Err(e) => {
                debug!("Failed to parse request on {}: {}", connection, e);
                self.link
                    .write_parse_error(connection, "Failed to parse JSON input.");
                return;
            }
        };

        let debug = value.get(WireKeys::DEBUG).map(DebugInfo::from_value);
        let field = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let request_type = field(WireKeys::TYPE);
        let cookie = field(WireKeys::COOKIE);
        let request = Request::new(self.link.clone(), connection, request_type, cookie, value);

        let response = if request.request_type().is_empty() {
            request.report_error("No type given in request.")
        } else {
            match self.active {
                None => self.set_protocol_version(&request),
                Some(index) => self.protocols[index].process(&request, &mut self.watch_tree),
            }
        };

        self.link.write_response(connection, &response, debug.as_ref());
    }

    /// Run version negotiation for the handshake request.
    fn set_protocol_version(&mut self, request: &Request) -> Response {
        if request.request_type() != RequestTypes::HANDSHAKE {
            return request.report_error(format!(
                "Waiting for type \"{}\".",
                RequestTypes::HANDSHAKE
            ));
        }

        let Some(requested) = request.field(WireKeys::PROTOCOL_VERSION) else {
            return request.report_error(format!(
                "\"{}\" is required for \"{}\".",
                WireKeys::PROTOCOL_VERSION,
                RequestTypes::HANDSHAKE
            ));
        };
        if !requested.is_object() {
            return request.report_error(format!(
                "\"{}\" must be a JSON object.",
                WireKeys::PROTOCOL_VERSION
            ));
        }

        let Some(major) = requested.get(WireKeys::MAJOR).and_then(Value::as_i64) else {
            return request.report_error(format!(
                "\"{}\" must be set and an integer.",
                WireKeys::MAJOR
            ));
        };
        let minor = match requested.get(WireKeys::MINOR) {
            None | Some(Value::Null) => None,
            Some(value) => match value.as_i64() {
                Some(minor) => Some(minor),
                None => {
                    return request.report_error(format!(
                        "\"{}\" must be unset or an integer.",
                        WireKeys::MINOR
                    ))
                }
            },
        };
        if major < 0 {
            return request.report_error(format!("\"{}\" must be >= 0.", WireKeys::MAJOR));
        }
        if minor.is_some_and(|minor| minor < 0) {
            return request.report_error(format!(
                "\"{}\" must be >= 0 when set.",
                WireKeys::MINOR
            ));
        }

        let Some(index) = find_matching_protocol(&self.protocols, major, minor) else {
            return request.report_error("Protocol version not supported.");
        };

        if let Err(reason) = self.protocols[index].activate(request) {
            return request.report_error(format!(
                "Failed to activate protocol version: {reason}"
            ));
        }

        info!("Activated protocol {}", self.protocols[index].version());
        self.active = Some(index);
        request.reply(Value::Object(Map::new()))
    }
}
