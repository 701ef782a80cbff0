//! Platform abstraction layer.
//!
//! All `#[cfg]` blocks for OS-specific behavior outside the transports live
//! here.
//!
//! - `stdio` - classification of the process standard input

pub mod stdio;

pub use stdio::{stdin_kind, StdinKind};

/// Returns the current platform name.
pub fn current_platform() -> &'static str {
    #[cfg(target_os = "linux")]
    {
        "linux"
    }
    #[cfg(target_os = "windows")]
    {
        "windows"
    }
    #[cfg(target_os = "macos")]
    {
        "macos"
    }
    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    {
        "unknown"
    }
}

/// Default pipe endpoint for this platform.
pub fn default_pipe_name() -> String {
    #[cfg(windows)]
    {
        r"\\.\pipe\buildwire".to_string()
    }
    #[cfg(not(windows))]
    {
        std::env::temp_dir()
            .join("buildwire.sock")
            .to_string_lossy()
            .into_owned()
    }
}
