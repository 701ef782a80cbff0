//! Resolution of the handshake's source/build/generator settings.
//!
//! Values the client left unset are adopted from an existing cache in the
//! build directory; values that contradict the cache are rejected. The
//! result is checked against the generators the build system offers.

use crate::build::{BuildSettings, BuildSystem};
use crate::config::WireKeys;
use crate::ipc::Request;
use std::path::{Path, PathBuf};

const CACHE_GENERATOR: &str = "CMAKE_GENERATOR";
const CACHE_EXTRA_GENERATOR: &str = "CMAKE_EXTRA_GENERATOR";
const CACHE_HOME_DIRECTORY: &str = "CMAKE_HOME_DIRECTORY";
const CACHE_TOOLSET: &str = "CMAKE_GENERATOR_TOOLSET";
const CACHE_PLATFORM: &str = "CMAKE_GENERATOR_PLATFORM";

/// Adopt the cached value if `value` is empty, otherwise require equality.
fn get_or_test_value(
    build: &dyn BuildSystem,
    cache_key: &str,
    value: &mut String,
    description: &str,
) -> Result<(), String> {
    let cached = build.cache_value(cache_key).unwrap_or_default();
    if value.is_empty() {
        *value = cached.clone();
    }
    if !cached.is_empty() && cached != *value {
        return Err(format!(
            "\"{cache_key}\" is set but incompatible with configured {description} value."
        ));
    }
    Ok(())
}

/// Compare two directories, resolving them on disk when possible.
fn same_directory(a: &Path, b: &Path) -> bool {
    let resolve = |path: &Path| std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    resolve(a) == resolve(b)
}

/// Resolve the settings requested by a handshake against `build`.
pub fn resolve_settings(
    request: &Request,
    build: &mut dyn BuildSystem,
) -> Result<BuildSettings, String> {
    let mut source_directory = request.string_field(WireKeys::SOURCE_DIRECTORY);
    let build_directory = request.string_field(WireKeys::BUILD_DIRECTORY);
    let mut generator = request.string_field(WireKeys::GENERATOR);
    let mut extra_generator = request.string_field(WireKeys::EXTRA_GENERATOR);
    let mut toolset = request.string_field(WireKeys::TOOLSET);
    let mut platform = request.string_field(WireKeys::PLATFORM);

    if build_directory.is_empty() {
        return Err(format!("\"{}\" is missing.", WireKeys::BUILD_DIRECTORY));
    }

    let build_path = PathBuf::from(&build_directory);
    if build_path.exists() {
        if !build_path.is_dir() {
            return Err(format!(
                "\"{}\" exists but is not a directory.",
                WireKeys::BUILD_DIRECTORY
            ));
        }

        let has_cache = build.load_cache(&build_path).map_err(|e| e.to_string())?;
        if has_cache {
            get_or_test_value(
                build,
                CACHE_GENERATOR,
                &mut generator,
                "generator",
            )?;
            get_or_test_value(
                build,
                CACHE_EXTRA_GENERATOR,
                &mut extra_generator,
                "extra generator",
            )?;

            if let Some(cached) = build
                .cache_value(CACHE_HOME_DIRECTORY)
                .filter(|cached| !cached.is_empty())
            {
                if source_directory.is_empty() {
                    source_directory = cached;
                } else if !same_directory(Path::new(&source_directory), Path::new(&cached)) {
                    return Err(format!(
                        "\"{CACHE_HOME_DIRECTORY}\" is set but incompatible with configured source directory value."
                    ));
                }
            }

            get_or_test_value(
                build,
                CACHE_TOOLSET,
                &mut toolset,
                "toolset",
            )?;
            get_or_test_value(
                build,
                CACHE_PLATFORM,
                &mut platform,
                "platform",
            )?;
        }
    }

    if source_directory.is_empty() {
        return Err(format!(
            "\"{}\" is unset but required.",
            WireKeys::SOURCE_DIRECTORY
        ));
    }
    if !Path::new(&source_directory).is_dir() {
        return Err(format!(
            "\"{}\" is not a directory.",
            WireKeys::SOURCE_DIRECTORY
        ));
    }
    if generator.is_empty() {
        return Err(format!("\"{}\" is unset but required.", WireKeys::GENERATOR));
    }

    let generators = build.generators();
    let Some(info) = generators.iter().find(|info| info.name == generator) else {
        return Err(format!("Generator \"{generator}\" not supported."));
    };
    if !info.supports_extra(&extra_generator) {
        return Err(format!(
            "The combination of generator \"{generator}\" and extra generator \"{extra_generator}\" is not supported."
        ));
    }
    if !info.supports_toolset && !toolset.is_empty() {
        return Err("Toolset was provided but is not supported by the requested generator.".into());
    }
    if !info.supports_platform && !platform.is_empty() {
        return Err("Platform was provided but is not supported by the requested generator.".into());
    }

    Ok(BuildSettings {
        source_directory: PathBuf::from(source_directory),
        build_directory: build_path,
        generator,
        extra_generator,
        toolset,
        platform,
    })
}
