//! Standard input classification.
//!
//! The stdio transport reads terminals and pipes asynchronously but drains a
//! redirected regular file in one go, since such a file is never "ready" in
//! the readiness sense.

use std::fs::File;
use std::io::{self, IsTerminal};

/// What the process standard input is connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdinKind {
    Tty,
    Pipe,
    File,
}

/// Inspect a duplicate of the stdin handle without consuming any input.
fn duplicate_stdin() -> io::Result<File> {
    #[cfg(unix)]
    {
        use std::os::fd::AsFd;
        Ok(File::from(io::stdin().as_fd().try_clone_to_owned()?))
    }
    #[cfg(windows)]
    {
        use std::os::windows::io::AsHandle;
        Ok(File::from(io::stdin().as_handle().try_clone_to_owned()?))
    }
}

/// Classify the current standard input.
///
/// Anything that is neither a terminal nor a regular file is treated as a
/// pipe, including handles whose metadata cannot be read.
pub fn stdin_kind() -> StdinKind {
    if io::stdin().is_terminal() {
        return StdinKind::Tty;
    }
    match duplicate_stdin().and_then(|file| file.metadata()) {
        Ok(metadata) if metadata.is_file() => StdinKind::File,
        _ => StdinKind::Pipe,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stdin_kind_is_stable() {
        assert_eq!(stdin_kind(), stdin_kind());
    }
}
