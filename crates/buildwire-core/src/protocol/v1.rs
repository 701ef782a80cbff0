//! Protocol 1.x request handlers.

use super::generator::resolve_settings;
use super::{Protocol, ProtocolState, ProtocolVersion};
use crate::build::{BuildSettings, BuildSystem, BuildSystemFactory, CacheEntry};
use crate::config::{RequestTypes, SignalNames, WireKeys};
use crate::ipc::{Request, Response, ServerLink};
use crate::watch::{FileChange, FileWatchTree, WatchCallback};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

const NOT_CONFIGURED: &str = "This instance was not yet configured.";
const NOT_GENERATED: &str = "No build system was generated yet.";
const NOT_COMPUTED: &str = "This instance was not yet computed.";

type Handled = Result<Value, String>;

/// Path relative to `base` when it lies inside it.
fn display_path(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

/// Callback that turns watched file changes into `dirty` and `fileChange`
/// signals. `dirty` is sent once until the flag is cleared again.
fn change_notifier(link: ServerLink, dirty: Arc<AtomicBool>) -> WatchCallback {
    Arc::new(move |path: &Path, change: FileChange| {
        if !dirty.swap(true, Ordering::SeqCst) {
            link.write_signal(SignalNames::DIRTY, json!({}));
        }
        link.write_signal(
            SignalNames::FILE_CHANGE,
            json!({
                (WireKeys::PATH): path.to_string_lossy(),
                (WireKeys::PROPERTIES): change.properties(),
            }),
        );
    })
}

/// Parse `cacheArguments`: unset, a string or an array of strings.
fn cache_arguments(request: &Request) -> Result<Vec<String>, String> {
    const INVALID: &str = "cacheArguments must be unset, a string or an array of strings.";
    match request.field(WireKeys::CACHE_ARGUMENTS) {
        None => Ok(Vec::new()),
        Some(Value::String(argument)) => Ok(vec![argument.clone()]),
        Some(Value::Array(arguments)) => arguments
            .iter()
            .map(|argument| argument.as_str().map(str::to_string).ok_or_else(|| INVALID.to_string()))
            .collect(),
        Some(_) => Err(INVALID.into()),
    }
}

/// Protocol version 1 with a configurable minor.
///
/// Minor 2 adds `ctestInfo`.
pub struct ProtocolV1 {
    minor: u32,
    factory: BuildSystemFactory,
    build: Option<Box<dyn BuildSystem>>,
    settings: Option<BuildSettings>,
    state: ProtocolState,
    dirty: Arc<AtomicBool>,
}

impl ProtocolV1 {
    pub fn new(minor: u32, factory: BuildSystemFactory) -> Self {
        Self {
            minor,
            factory,
            build: None,
            settings: None,
            state: ProtocolState::Inactive,
            dirty: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// Whether a watched input changed since the last configure.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn build(&self) -> Result<&dyn BuildSystem, String> {
        self.build
            .as_deref()
            .ok_or_else(|| "This instance is inactive.".to_string())
    }

    fn build_mut(&mut self) -> Result<&mut (dyn BuildSystem + 'static), String> {
        self.build
            .as_deref_mut()
            .ok_or_else(|| "This instance is inactive.".to_string())
    }

    fn settings(&self) -> BuildSettings {
        self.settings.clone().unwrap_or_default()
    }

    fn process_cache(&self, request: &Request) -> Handled {
        self.state
            .require(ProtocolState::Active, "This instance is inactive.")?;
        let build = self.build()?;

        let mut keys: Vec<String> = match request.field(WireKeys::KEYS) {
            None => Vec::new(),
            Some(Value::Array(keys)) => keys
                .iter()
                .map(|key| {
                    key.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| "A \"keys\" entry must be a string.".to_string())
                })
                .collect::<Result<_, _>>()?,
            Some(_) => return Err("\"keys\" must be unset or an array.".into()),
        };
        keys.sort();

        let entries = build.cache_entries();
        let selected: Vec<&CacheEntry> = if keys.is_empty() {
            entries.iter().collect()
        } else {
            let by_key: BTreeMap<&str, &CacheEntry> =
                entries.iter().map(|entry| (entry.key.as_str(), entry)).collect();
            keys.iter()
                .map(|key| {
                    by_key
                        .get(key.as_str())
                        .copied()
                        .ok_or_else(|| format!("Key \"{key}\" not found in cache."))
                })
                .collect::<Result<_, _>>()?
        };
        Ok(json!({ (WireKeys::CACHE): selected }))
    }

    fn process_cmake_inputs(&self) -> Handled {
        self.state.require(ProtocolState::Configured, NOT_CONFIGURED)?;
        let inputs = self.build()?.inputs();

        let mut groups: BTreeMap<(bool, bool), Vec<String>> = BTreeMap::new();
        for file in &inputs.files {
            groups
                .entry((file.is_cmake, file.is_temporary))
                .or_default()
                .push(display_path(&file.path, &inputs.source_directory));
        }
        let build_files: Vec<Value> = groups
            .into_iter()
            .map(|((is_cmake, is_temporary), sources)| {
                json!({
                    (WireKeys::IS_CMAKE): is_cmake,
                    (WireKeys::IS_TEMPORARY): is_temporary,
                    (WireKeys::SOURCES): sources,
                })
            })
            .collect();

        Ok(json!({
            (WireKeys::BUILD_FILES): build_files,
            (WireKeys::CMAKE_ROOT_DIRECTORY): inputs.cmake_root_directory.to_string_lossy(),
            (WireKeys::SOURCE_DIRECTORY): inputs.source_directory.to_string_lossy(),
        }))
    }

    fn process_code_model(&self) -> Handled {
        self.state.require(ProtocolState::Computed, NOT_GENERATED)?;
        Ok(self.build()?.code_model())
    }

    fn process_compute(&mut self, request: &Request) -> Handled {
        if self.state > ProtocolState::Configured {
            return Err("This build system was already generated.".into());
        }
        self.state
            .require(ProtocolState::Configured, "This project was not configured yet.")?;

        if let Err(e) = self.build_mut()?.generate(request) {
            warn!("Generate step failed: {}", e);
            return Err("Failed to compute build system.".into());
        }
        self.state.advance(ProtocolState::Computed);
        Ok(json!({}))
    }

    fn process_configure(&mut self, request: &Request, watcher: &mut FileWatchTree) -> Handled {
        self.state
            .require(ProtocolState::Active, "This instance is inactive.")?;
        watcher.reset();

        let arguments = cache_arguments(request)?;
        let settings = self.settings();
        let build = self.build_mut()?;
        let configured = build
            .setup(&settings)
            .and_then(|()| build.configure(&arguments, request));
        if let Err(e) = configured {
            warn!("Configure step failed: {}", e);
            return Err("Configuration failed.".into());
        }

        let watch_list = build.inputs().watch_list();
        let callback = change_notifier(request.link().clone(), Arc::clone(&self.dirty));
        let watched = watcher.monitor_paths(&watch_list, callback);
        info!("Configured, watching {} input files", watched);

        self.state.advance(ProtocolState::Configured);
        self.dirty.store(false, Ordering::SeqCst);
        Ok(json!({}))
    }

    fn process_file_system_watchers(&self, watcher: &FileWatchTree) -> Handled {
        Ok(json!({
            (WireKeys::WATCHED_FILES): watcher.watched_files(),
            (WireKeys::WATCHED_DIRECTORIES): watcher.watched_directories(),
        }))
    }

    fn process_global_settings(&self) -> Handled {
        let build = self.build()?;
        let settings = self.settings();

        let mut reply = Map::new();
        reply.insert(WireKeys::CAPABILITIES.into(), build.capabilities());
        for (key, value) in build.toggles().fields() {
            reply.insert(key.into(), value.into());
        }
        reply.insert(
            WireKeys::SOURCE_DIRECTORY.into(),
            settings.source_directory.to_string_lossy().into(),
        );
        reply.insert(
            WireKeys::BUILD_DIRECTORY.into(),
            settings.build_directory.to_string_lossy().into(),
        );
        reply.insert(WireKeys::GENERATOR.into(), settings.generator.into());
        reply.insert(
            WireKeys::EXTRA_GENERATOR.into(),
            settings.extra_generator.into(),
        );
        Ok(Value::Object(reply))
    }

    fn process_set_global_settings(&mut self, request: &Request) -> Handled {
        let build = self.build_mut()?;
        let mut toggles = build.toggles();
        for (key, _) in toggles.fields() {
            match request.field(key) {
                None => {}
                Some(Value::Bool(value)) => {
                    toggles.set(key, *value);
                }
                Some(_) => return Err(format!("\"{key}\" must be unset or a bool value.")),
            }
        }
        build.set_toggles(toggles);
        Ok(json!({}))
    }

    fn process_ctest_info(&self) -> Handled {
        self.state.require(ProtocolState::Computed, NOT_COMPUTED)?;
        Ok(self.build()?.test_info())
    }
}

impl Protocol for ProtocolV1 {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::new(1, self.minor)
    }

    fn activate(&mut self, request: &Request) -> Result<(), String> {
        let mut build = (self.factory)();
        let settings = resolve_settings(request, build.as_mut())?;
        info!(
            "Activated protocol {} for {:?} ({})",
            self.version(),
            settings.build_directory,
            settings.full_generator_name()
        );
        self.build = Some(build);
        self.settings = Some(settings);
        self.state.advance(ProtocolState::Active);
        Ok(())
    }

    fn process(&mut self, request: &Request, watcher: &mut FileWatchTree) -> Response {
        let handled = match request.request_type() {
            RequestTypes::CACHE => self.process_cache(request),
            RequestTypes::CMAKE_INPUTS => self.process_cmake_inputs(),
            RequestTypes::CODE_MODEL => self.process_code_model(),
            RequestTypes::COMPUTE => self.process_compute(request),
            RequestTypes::CONFIGURE => self.process_configure(request, watcher),
            RequestTypes::FILESYSTEM_WATCHERS => self.process_file_system_watchers(watcher),
            RequestTypes::GLOBAL_SETTINGS => self.process_global_settings(),
            RequestTypes::SET_GLOBAL_SETTINGS => self.process_set_global_settings(request),
            RequestTypes::CTEST_INFO if self.minor >= 2 => self.process_ctest_info(),
            _ => Err("Unknown command!".into()),
        };
        match handled {
            Ok(data) => request.reply(data),
            Err(message) => request.report_error(message),
        }
    }
}
