//! Centralized configuration for the buildwire server.
//!
//! This module provides the compile-time constants for the event loop,
//! framing, file watching, and the read-only tables of wire field names,
//! request types and signal names shared by the server and the protocols.

use std::time::Duration;

/// Event loop and transport configuration.
pub struct ServerConfig;

impl ServerConfig {
    /// Size of a single read from a transport.
    pub const READ_CHUNK_SIZE: usize = 1024;
    /// How long shutdown waits for writer tasks to flush queued frames.
    pub const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
    /// Name of the cache file looked up in a build directory.
    pub const CACHE_FILE_NAME: &'static str = "CMakeCache.txt";
}

/// Frame delimiters of the default buffer strategy.
pub struct FramingConfig;

impl FramingConfig {
    pub const START_MAGIC: &'static str = "[== \"CMake Server\" ==[";
    pub const END_MAGIC: &'static str = "]== \"CMake Server\" ==]";
}

/// File watch tree configuration.
pub struct WatchConfig;

impl WatchConfig {
    /// File names treated as build-system input files during discovery.
    pub const INPUT_FILE_NAMES: &'static [&'static str] = &["CMakeLists.txt"];
    /// Extensions treated as build-system input files during discovery.
    pub const INPUT_FILE_EXTENSIONS: &'static [&'static str] = &["cmake"];
}

/// Field names of the wire envelope and the protocol payloads.
pub struct WireKeys;

impl WireKeys {
    pub const TYPE: &'static str = "type";
    pub const COOKIE: &'static str = "cookie";
    pub const REPLY_TO: &'static str = "inReplyTo";
    pub const ERROR_MESSAGE: &'static str = "errorMessage";
    pub const DEBUG: &'static str = "debug";
    pub const DUMP_TO_FILE: &'static str = "dumpToFile";
    pub const SHOW_STATS: &'static str = "showStats";
    pub const DEBUG_STATS: &'static str = "zzzDebug";
    pub const JSON_SERIALIZATION: &'static str = "jsonSerialization";
    pub const TOTAL_TIME: &'static str = "totalTime";
    pub const SIZE: &'static str = "size";
    pub const DUMP_FILE: &'static str = "dumpFile";

    pub const PROGRESS_MESSAGE: &'static str = "progressMessage";
    pub const PROGRESS_MINIMUM: &'static str = "progressMinimum";
    pub const PROGRESS_MAXIMUM: &'static str = "progressMaximum";
    pub const PROGRESS_CURRENT: &'static str = "progressCurrent";
    pub const MESSAGE: &'static str = "message";
    pub const TITLE: &'static str = "title";
    pub const NAME: &'static str = "name";

    pub const SUPPORTED_PROTOCOL_VERSIONS: &'static str = "supportedProtocolVersions";
    pub const PROTOCOL_VERSION: &'static str = "protocolVersion";
    pub const MAJOR: &'static str = "major";
    pub const MINOR: &'static str = "minor";
    pub const IS_EXPERIMENTAL: &'static str = "isExperimental";

    pub const SOURCE_DIRECTORY: &'static str = "sourceDirectory";
    pub const BUILD_DIRECTORY: &'static str = "buildDirectory";
    pub const GENERATOR: &'static str = "generator";
    pub const EXTRA_GENERATOR: &'static str = "extraGenerator";
    pub const TOOLSET: &'static str = "toolset";
    pub const PLATFORM: &'static str = "platform";

    pub const CACHE: &'static str = "cache";
    pub const CACHE_ARGUMENTS: &'static str = "cacheArguments";
    pub const KEYS: &'static str = "keys";
    pub const PROPERTIES: &'static str = "properties";
    pub const PATH: &'static str = "path";

    pub const CAPABILITIES: &'static str = "capabilities";
    pub const DEBUG_OUTPUT: &'static str = "debugOutput";
    pub const TRACE: &'static str = "trace";
    pub const TRACE_EXPAND: &'static str = "traceExpand";
    pub const WARN_UNINITIALIZED: &'static str = "warnUninitialized";
    pub const WARN_UNUSED: &'static str = "warnUnused";
    pub const WARN_UNUSED_CLI: &'static str = "warnUnusedCli";
    pub const CHECK_SYSTEM_VARS: &'static str = "checkSystemVars";

    pub const WATCHED_FILES: &'static str = "watchedFiles";
    pub const WATCHED_DIRECTORIES: &'static str = "watchedDirectories";

    pub const BUILD_FILES: &'static str = "buildFiles";
    pub const CMAKE_ROOT_DIRECTORY: &'static str = "cmakeRootDirectory";
    pub const IS_CMAKE: &'static str = "isCMake";
    pub const IS_TEMPORARY: &'static str = "isTemporary";
    pub const SOURCES: &'static str = "sources";
    pub const CONFIGURATIONS: &'static str = "configurations";
}

/// Values of the `type` field.
pub struct RequestTypes;

impl RequestTypes {
    // Outbound
    pub const HELLO: &'static str = "hello";
    pub const REPLY: &'static str = "reply";
    pub const ERROR: &'static str = "error";
    pub const PROGRESS: &'static str = "progress";
    pub const MESSAGE: &'static str = "message";
    pub const SIGNAL: &'static str = "signal";

    // Inbound
    pub const HANDSHAKE: &'static str = "handshake";
    pub const CACHE: &'static str = "cache";
    pub const CMAKE_INPUTS: &'static str = "cmakeInputs";
    pub const CODE_MODEL: &'static str = "codemodel";
    pub const COMPUTE: &'static str = "compute";
    pub const CONFIGURE: &'static str = "configure";
    pub const FILESYSTEM_WATCHERS: &'static str = "fileSystemWatchers";
    pub const GLOBAL_SETTINGS: &'static str = "globalSettings";
    pub const SET_GLOBAL_SETTINGS: &'static str = "setGlobalSettings";
    pub const CTEST_INFO: &'static str = "ctestInfo";
}

/// Names of uncorrelated signals and their property values.
pub struct SignalNames;

impl SignalNames {
    pub const DIRTY: &'static str = "dirty";
    pub const FILE_CHANGE: &'static str = "fileChange";
    pub const RENAME_PROPERTY: &'static str = "rename";
    pub const CHANGE_PROPERTY: &'static str = "change";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_magic_is_symmetric() {
        assert!(FramingConfig::START_MAGIC.contains("CMake Server"));
        assert!(FramingConfig::END_MAGIC.contains("CMake Server"));
        assert_ne!(FramingConfig::START_MAGIC, FramingConfig::END_MAGIC);
    }

    #[test]
    fn test_inbound_types_are_distinct() {
        let types = [
            RequestTypes::HANDSHAKE,
            RequestTypes::CACHE,
            RequestTypes::CMAKE_INPUTS,
            RequestTypes::CODE_MODEL,
            RequestTypes::COMPUTE,
            RequestTypes::CONFIGURE,
            RequestTypes::FILESYSTEM_WATCHERS,
            RequestTypes::GLOBAL_SETTINGS,
            RequestTypes::SET_GLOBAL_SETTINGS,
            RequestTypes::CTEST_INFO,
        ];
        let unique: std::collections::HashSet<_> = types.iter().collect();
        assert_eq!(unique.len(), types.len());
    }
}
