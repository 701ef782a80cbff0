//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use buildwire_core::ipc::{LoopContext, LoopEvent};
use buildwire_core::{
    BufferStrategy, BuildInputs, BuildSettings, BuildSystem, BuildSystemFactory, CacheEntry,
    CacheFile, Connection, ConnectionCore, FramedBufferStrategy, GeneratorInfo, GlobalToggles,
    InputFile, ProtocolV1, Reporter, Result, Server,
};
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Build system that records its inputs instead of running anything.
#[derive(Default)]
pub struct FakeBuildSystem {
    settings: BuildSettings,
    cache: CacheFile,
    inputs: BuildInputs,
    toggles: GlobalToggles,
}

impl BuildSystem for FakeBuildSystem {
    fn generators(&self) -> Vec<GeneratorInfo> {
        vec![GeneratorInfo::new("Ninja").with_extra_generators(&["CodeBlocks"])]
    }

    fn load_cache(&mut self, build_directory: &Path) -> Result<bool> {
        match CacheFile::load(build_directory)? {
            Some(cache) => {
                self.cache = cache;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn cache_entries(&self) -> Vec<CacheEntry> {
        self.cache.entries().cloned().collect()
    }

    fn setup(&mut self, settings: &BuildSettings) -> Result<()> {
        self.settings = settings.clone();
        Ok(())
    }

    fn configure(&mut self, _arguments: &[String], reporter: &dyn Reporter) -> Result<()> {
        reporter.progress("Configuring", 0.0);
        let source = self.settings.source_directory.clone();
        self.cache.insert(CacheEntry::new(
            "CMAKE_HOME_DIRECTORY",
            "INTERNAL",
            source.to_string_lossy(),
        ));
        self.inputs = BuildInputs {
            cmake_root_directory: PathBuf::from("/usr/share/cmake"),
            source_directory: source.clone(),
            files: vec![InputFile {
                path: source.join("CMakeLists.txt"),
                is_cmake: false,
                is_temporary: false,
            }],
        };
        reporter.progress("Configuring done", 1.0);
        Ok(())
    }

    fn generate(&mut self, _reporter: &dyn Reporter) -> Result<()> {
        Ok(())
    }

    fn inputs(&self) -> BuildInputs {
        self.inputs.clone()
    }

    fn code_model(&self) -> Value {
        json!({"configurations": [{"name": "Debug", "projects": []}]})
    }

    fn test_info(&self) -> Value {
        json!({"configurations": []})
    }

    fn toggles(&self) -> GlobalToggles {
        self.toggles
    }

    fn set_toggles(&mut self, toggles: GlobalToggles) {
        self.toggles = toggles;
    }

    fn capabilities(&self) -> Value {
        json!({"version": {"string": "fake"}})
    }
}

pub fn fake_factory() -> BuildSystemFactory {
    Arc::new(|| Box::new(FakeBuildSystem::default()) as Box<dyn BuildSystem>)
}

/// A server with protocols 1.0 and 1.2 over the fake build system.
pub fn server() -> Server {
    let mut server = Server::new(false);
    server.register_protocol(Box::new(ProtocolV1::new(0, fake_factory())));
    server.register_protocol(Box::new(ProtocolV1::new(2, fake_factory())));
    server
}

/// Source tree with a top-level list file, and an empty build directory.
pub struct Project {
    pub source: TempDir,
    pub build: TempDir,
}

impl Project {
    pub fn new() -> Self {
        let source = TempDir::new().expect("Failed to create source dir");
        std::fs::write(source.path().join("CMakeLists.txt"), "project(demo)\n").unwrap();
        Self {
            source,
            build: TempDir::new().expect("Failed to create build dir"),
        }
    }

    pub fn handshake(&self, cookie: &str) -> Value {
        json!({
            "type": "handshake",
            "cookie": cookie,
            "protocolVersion": {"major": 1},
            "sourceDirectory": self.source.path().to_string_lossy(),
            "buildDirectory": self.build.path().to_string_lossy(),
            "generator": "Ninja",
        })
    }
}

/// Wrap every request in frame delimiters.
pub fn frame_all(requests: &[Value]) -> Vec<u8> {
    let strategy = FramedBufferStrategy::new();
    requests
        .iter()
        .map(|request| strategy.format(&request.to_string()))
        .collect::<String>()
        .into_bytes()
}

/// Split a framed byte stream back into JSON objects.
pub fn unframe(bytes: &[u8]) -> Vec<Value> {
    let mut strategy = FramedBufferStrategy::new();
    let mut raw = bytes.to_vec();
    let mut values = Vec::new();
    while let Some(message) = strategy.extract(&mut raw) {
        values.push(serde_json::from_str(&message).expect("server wrote invalid JSON"));
    }
    values
}

/// In-memory transport that replays a scripted input once serving starts.
pub struct MemoryConnection {
    core: ConnectionCore,
    input: Vec<u8>,
    chunk_size: usize,
    close_after_input: bool,
    output: Arc<Mutex<Vec<u8>>>,
}

impl MemoryConnection {
    pub fn new(input: Vec<u8>, output: Arc<Mutex<Vec<u8>>>) -> Self {
        Self {
            core: ConnectionCore::framed(),
            input,
            chunk_size: usize::MAX,
            close_after_input: true,
            output,
        }
    }

    /// Deliver the input in reads of at most `chunk_size` bytes.
    pub fn chunked(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Keep the connection open after the input was delivered.
    pub fn kept_open(mut self) -> Self {
        self.close_after_input = false;
        self
    }
}

impl Connection for MemoryConnection {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ConnectionCore {
        &mut self.core
    }

    fn describe(&self) -> String {
        "memory".into()
    }

    fn on_serve_start(&mut self, ctx: &mut LoopContext<'_>) -> Result<()> {
        let mut writes = self.core.open_writer();
        let output = Arc::clone(&self.output);
        ctx.spawn(async move {
            while let Some(bytes) = writes.recv().await {
                output.lock().extend_from_slice(&bytes);
            }
        });

        let id = ctx.connection_id();
        ctx.post(LoopEvent::Connected(id));
        for chunk in self.input.chunks(self.chunk_size) {
            ctx.post(LoopEvent::Data(id, Bytes::copy_from_slice(chunk)));
        }
        if self.close_after_input {
            ctx.post(LoopEvent::Disconnected(id, None));
        }
        Ok(())
    }
}

/// Serve a single scripted memory connection to completion and return what
/// the server wrote.
pub fn run_script(server: &mut Server, requests: &[Value], chunk_size: usize) -> Vec<Value> {
    let output = Arc::new(Mutex::new(Vec::new()));
    let connection =
        MemoryConnection::new(frame_all(requests), Arc::clone(&output)).chunked(chunk_size);
    server.add_connection(Box::new(connection));
    server.serve().expect("server did not stop cleanly");
    let bytes = output.lock().clone();
    unframe(&bytes)
}

/// The terminal replies and errors, in order.
pub fn terminal(values: &[Value]) -> Vec<&Value> {
    values
        .iter()
        .filter(|value| value["type"] == "reply" || value["type"] == "error")
        .collect()
}
