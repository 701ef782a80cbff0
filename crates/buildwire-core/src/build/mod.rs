//! Boundary to the build system driven by the protocol.
//!
//! The protocol only talks to a [`BuildSystem`] trait object created at
//! activation time through a [`BuildSystemFactory`]. Long-running phases
//! receive a [`Reporter`] so their progress reaches the requesting client.

pub mod cache;
pub mod command;

pub use cache::{parse_entry, CacheEntry, CacheFile};
pub use command::CommandBuildSystem;

use crate::config::WireKeys;
use crate::error::Result;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Sink for notifications emitted while a build-system phase runs.
pub trait Reporter {
    /// `fraction` in `[0, 1]`; values outside are ignored.
    fn progress(&self, message: &str, fraction: f32);

    fn message(&self, message: &str, title: &str);
}

/// A generator the build system can use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorInfo {
    pub name: String,
    pub extra_generators: Vec<String>,
    pub supports_toolset: bool,
    pub supports_platform: bool,
}

impl GeneratorInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extra_generators: Vec::new(),
            supports_toolset: false,
            supports_platform: false,
        }
    }

    pub fn with_extra_generators(mut self, extras: &[&str]) -> Self {
        self.extra_generators = extras.iter().map(|extra| extra.to_string()).collect();
        self
    }

    pub fn with_toolset_and_platform(mut self) -> Self {
        self.supports_toolset = true;
        self.supports_platform = true;
        self
    }

    /// Whether `extra` (empty for none) can be combined with this generator.
    pub fn supports_extra(&self, extra: &str) -> bool {
        extra.is_empty() || self.extra_generators.iter().any(|e| e == extra)
    }
}

/// Resolved source/build/generator settings of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildSettings {
    pub source_directory: PathBuf,
    pub build_directory: PathBuf,
    pub generator: String,
    pub extra_generator: String,
    pub toolset: String,
    pub platform: String,
}

impl BuildSettings {
    /// Generator name as the build tool spells it, e.g.
    /// `CodeBlocks - Unix Makefiles`.
    pub fn full_generator_name(&self) -> String {
        if self.extra_generator.is_empty() {
            self.generator.clone()
        } else {
            format!("{} - {}", self.extra_generator, self.generator)
        }
    }
}

/// Diagnostic switches of the build system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalToggles {
    pub debug_output: bool,
    pub trace: bool,
    pub trace_expand: bool,
    pub warn_uninitialized: bool,
    pub warn_unused: bool,
    pub warn_unused_cli: bool,
    pub check_system_vars: bool,
}

impl GlobalToggles {
    /// Wire names and values.
    pub fn fields(&self) -> [(&'static str, bool); 7] {
        [
            (WireKeys::DEBUG_OUTPUT, self.debug_output),
            (WireKeys::TRACE, self.trace),
            (WireKeys::TRACE_EXPAND, self.trace_expand),
            (WireKeys::WARN_UNINITIALIZED, self.warn_uninitialized),
            (WireKeys::WARN_UNUSED, self.warn_unused),
            (WireKeys::WARN_UNUSED_CLI, self.warn_unused_cli),
            (WireKeys::CHECK_SYSTEM_VARS, self.check_system_vars),
        ]
    }

    /// Set a toggle by wire name. Returns `false` for unknown names.
    pub fn set(&mut self, key: &str, value: bool) -> bool {
        let slot = match key {
            WireKeys::DEBUG_OUTPUT => &mut self.debug_output,
            WireKeys::TRACE => &mut self.trace,
            WireKeys::TRACE_EXPAND => &mut self.trace_expand,
            WireKeys::WARN_UNINITIALIZED => &mut self.warn_uninitialized,
            WireKeys::WARN_UNUSED => &mut self.warn_unused,
            WireKeys::WARN_UNUSED_CLI => &mut self.warn_unused_cli,
            WireKeys::CHECK_SYSTEM_VARS => &mut self.check_system_vars,
            _ => return false,
        };
        *slot = value;
        true
    }

    /// Command line flags the toggles translate to.
    pub fn command_line_flags(&self) -> Vec<&'static str> {
        [
            (self.debug_output, "--debug-output"),
            (self.trace, "--trace"),
            (self.trace_expand, "--trace-expand"),
            (self.warn_uninitialized, "--warn-uninitialized"),
            (self.warn_unused, "--warn-unused-vars"),
            (!self.warn_unused_cli, "--no-warn-unused-cli"),
            (self.check_system_vars, "--check-system-vars"),
        ]
        .into_iter()
        .filter(|(enabled, _)| *enabled)
        .map(|(_, flag)| flag)
        .collect()
    }
}

impl Default for GlobalToggles {
    fn default() -> Self {
        Self {
            debug_output: false,
            trace: false,
            trace_expand: false,
            warn_uninitialized: false,
            warn_unused: false,
            warn_unused_cli: true,
            check_system_vars: false,
        }
    }
}

/// A file that fed into the last configure run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    pub path: PathBuf,
    /// Shipped with the build tool itself.
    pub is_cmake: bool,
    /// Generated inside the build directory.
    pub is_temporary: bool,
}

/// Input files of the last configure run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildInputs {
    pub cmake_root_directory: PathBuf,
    pub source_directory: PathBuf,
    pub files: Vec<InputFile>,
}

impl BuildInputs {
    /// Project files whose change invalidates the configuration.
    pub fn watch_list(&self) -> Vec<PathBuf> {
        self.files
            .iter()
            .filter(|file| !file.is_cmake && !file.is_temporary)
            .map(|file| file.path.clone())
            .collect()
    }
}

/// Operations the protocol needs from a build system.
pub trait BuildSystem: Send {
    /// Generators available for the handshake.
    fn generators(&self) -> Vec<GeneratorInfo>;

    /// Load the cache of an existing build directory. `Ok(false)` if there
    /// is none.
    fn load_cache(&mut self, build_directory: &Path) -> Result<bool>;

    /// Current cache, sorted by key.
    fn cache_entries(&self) -> Vec<CacheEntry>;

    fn cache_value(&self, key: &str) -> Option<String> {
        self.cache_entries()
            .into_iter()
            .find(|entry| entry.key == key)
            .map(|entry| entry.value)
    }

    /// Apply the resolved settings before a configure run.
    fn setup(&mut self, settings: &BuildSettings) -> Result<()>;

    fn configure(&mut self, cache_arguments: &[String], reporter: &dyn Reporter) -> Result<()>;

    fn generate(&mut self, reporter: &dyn Reporter) -> Result<()>;

    fn inputs(&self) -> BuildInputs;

    /// Project/target model, an object with a `configurations` array.
    fn code_model(&self) -> Value;

    /// Test model, an object with a `configurations` array.
    fn test_info(&self) -> Value;

    fn toggles(&self) -> GlobalToggles;

    fn set_toggles(&mut self, toggles: GlobalToggles);

    /// Capability report of the build tool.
    fn capabilities(&self) -> Value;
}

/// Creates a fresh build system when a protocol activates.
pub type BuildSystemFactory = Arc<dyn Fn() -> Box<dyn BuildSystem> + Send + Sync>;
