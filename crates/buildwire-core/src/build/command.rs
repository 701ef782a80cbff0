//! Build system backed by an external `cmake` executable.
//!
//! Configure runs the program against the session's source and build
//! directories and reads back the resulting cache. The program generates
//! the build files during that same run, so the generate phase only checks
//! for the generation stamp it leaves behind.

use super::cache::{CacheEntry, CacheFile};
use super::{BuildInputs, BuildSettings, BuildSystem, GeneratorInfo, GlobalToggles, InputFile, Reporter};
use crate::config::{WatchConfig, WireKeys};
use crate::error::{Result, ServerError};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Stamp written by the generate step of the external program.
const GENERATE_STAMP: &str = "CMakeFiles/cmake.check_cache";
const TEST_FILE: &str = "CTestTestfile.cmake";
const ERROR_TITLE: &str = "Error";

fn fallback_generators() -> Vec<GeneratorInfo> {
    const EXTRAS: &[&str] = &[
        "CodeBlocks",
        "CodeLite",
        "Eclipse CDT4",
        "Kate",
        "Sublime Text 2",
    ];
    vec![
        GeneratorInfo::new("Unix Makefiles").with_extra_generators(EXTRAS),
        GeneratorInfo::new("Ninja").with_extra_generators(EXTRAS),
        GeneratorInfo::new("Visual Studio 17 2022").with_toolset_and_platform(),
        GeneratorInfo::new("Visual Studio 16 2019").with_toolset_and_platform(),
    ]
}

/// Parse the `generators` array of a capability report.
fn generators_from_capabilities(capabilities: &Value) -> Vec<GeneratorInfo> {
    let Some(list) = capabilities.get("generators").and_then(Value::as_array) else {
        return Vec::new();
    };
    list.iter()
        .filter_map(|entry| {
            let name = entry.get("name")?.as_str()?;
            let extras: Vec<&str> = entry
                .get("extraGenerators")
                .and_then(Value::as_array)
                .map(|extras| extras.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            let flag = |key: &str| entry.get(key).and_then(Value::as_bool).unwrap_or(false);
            let mut info = GeneratorInfo::new(name).with_extra_generators(&extras);
            info.supports_toolset = flag("toolsetSupport");
            info.supports_platform = flag("platformSupport");
            Some(info)
        })
        .collect()
}

fn is_input_file(path: &Path) -> bool {
    let named = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| WatchConfig::INPUT_FILE_NAMES.contains(&name));
    let by_extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| WatchConfig::INPUT_FILE_EXTENSIONS.contains(&ext));
    named || by_extension
}

/// Collect list files of the source tree and generated ones of the build
/// tree.
pub(crate) fn discover_inputs(
    source_directory: &Path,
    build_directory: &Path,
    cmake_root: &Path,
) -> BuildInputs {
    let build_canonical = std::fs::canonicalize(build_directory).ok();
    let mut files = Vec::new();

    let walker = WalkDir::new(source_directory)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            let is_build = build_canonical.as_ref().is_some_and(|build| {
                std::fs::canonicalize(entry.path()).ok().as_ref() == Some(build)
            });
            !hidden && !is_build
        });
    for entry in walker.filter_map(|entry| entry.ok()) {
        if entry.file_type().is_file() && is_input_file(entry.path()) {
            files.push(InputFile {
                path: entry.path().to_path_buf(),
                is_cmake: false,
                is_temporary: false,
            });
        }
    }

    let generated = build_directory.join("CMakeFiles");
    for entry in WalkDir::new(&generated)
        .max_depth(2)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
    {
        if entry.file_type().is_file() && is_input_file(entry.path()) {
            files.push(InputFile {
                path: entry.path().to_path_buf(),
                is_cmake: false,
                is_temporary: true,
            });
        }
    }

    BuildInputs {
        cmake_root_directory: cmake_root.to_path_buf(),
        source_directory: source_directory.to_path_buf(),
        files,
    }
}

/// Test names declared with `add_test(` in a generated test file.
fn declared_tests(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| line.trim().strip_prefix("add_test("))
        .filter_map(|rest| {
            rest.split(|c: char| c.is_whitespace() || c == ')')
                .find(|token| !token.is_empty())
                .map(|token| token.trim_matches(['"', '[', ']']).to_string())
        })
        .filter(|name| !name.is_empty())
        .collect()
}

/// [`BuildSystem`] that shells out to a `cmake`-compatible program.
pub struct CommandBuildSystem {
    program: PathBuf,
    settings: Option<BuildSettings>,
    cache: CacheFile,
    toggles: GlobalToggles,
    inputs: BuildInputs,
    capabilities: OnceLock<Value>,
}

impl CommandBuildSystem {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            settings: None,
            cache: CacheFile::default(),
            toggles: GlobalToggles::default(),
            inputs: BuildInputs::default(),
            capabilities: OnceLock::new(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn settings(&self) -> Result<&BuildSettings> {
        self.settings.as_ref().ok_or_else(|| ServerError::BuildSystem {
            message: "Build system was not set up.".into(),
        })
    }

    fn configurations(&self) -> Vec<String> {
        let types = self.cache.value("CMAKE_CONFIGURATION_TYPES").unwrap_or_default();
        if !types.is_empty() {
            return types.split(';').map(str::to_string).collect();
        }
        vec![self
            .cache
            .value("CMAKE_BUILD_TYPE")
            .unwrap_or_default()
            .to_string()]
    }

    fn project_name(&self) -> String {
        self.cache
            .value("CMAKE_PROJECT_NAME")
            .unwrap_or_default()
            .to_string()
    }

    fn query_capabilities(&self) -> Value {
        let output = Command::new(&self.program)
            .args(["-E", "capabilities"])
            .output();
        match output {
            Ok(output) if output.status.success() => {
                serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
                    debug!("Unreadable capability report from {:?}: {}", self.program, e);
                    json!({})
                })
            }
            Ok(output) => {
                debug!("{:?} -E capabilities exited with {}", self.program, output.status);
                json!({})
            }
            Err(e) => {
                debug!("Failed to run {:?}: {}", self.program, e);
                json!({})
            }
        }
    }
}

impl BuildSystem for CommandBuildSystem {
    fn generators(&self) -> Vec<GeneratorInfo> {
        let reported = generators_from_capabilities(self.capabilities_ref());
        if reported.is_empty() {
            fallback_generators()
        } else {
            reported
        }
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

    fn cache_value(&self, key: &str) -> Option<String> {
        self.cache.value(key).map(str::to_string)
    }

    fn setup(&mut self, settings: &BuildSettings) -> Result<()> {
        self.settings = Some(settings.clone());
        Ok(())
    }

    fn configure(&mut self, cache_arguments: &[String], reporter: &dyn Reporter) -> Result<()> {
        let settings = self.settings()?.clone();

        let mut command = Command::new(&self.program);
        command
            .arg("-S")
            .arg(&settings.source_directory)
            .arg("-B")
            .arg(&settings.build_directory)
            .arg("-G")
            .arg(settings.full_generator_name());
        if !settings.toolset.is_empty() {
            command.arg("-T").arg(&settings.toolset);
        }
        if !settings.platform.is_empty() {
            command.arg("-A").arg(&settings.platform);
        }
        command.args(self.toggles.command_line_flags());
        command.args(cache_arguments);

        info!("Configuring {:?}", settings.build_directory);
        reporter.progress("Configuring", 0.0);
        let output = command
            .output()
            .map_err(|e| ServerError::io_with_path(e, &self.program))?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            reporter.message(line, "");
        }
        if !output.status.success() {
            for line in String::from_utf8_lossy(&output.stderr).lines() {
                reporter.message(line, ERROR_TITLE);
            }
            return Err(ServerError::BuildSystem {
                message: format!("{:?} exited with {}", self.program, output.status),
            });
        }
        reporter.progress("Configuring done", 1.0);

        self.cache = CacheFile::load(&settings.build_directory)?.unwrap_or_default();
        let cmake_root = PathBuf::from(self.cache.value("CMAKE_ROOT").unwrap_or_default());
        self.inputs = discover_inputs(
            &settings.source_directory,
            &settings.build_directory,
            &cmake_root,
        );
        Ok(())
    }

    fn generate(&mut self, reporter: &dyn Reporter) -> Result<()> {
        let settings = self.settings()?;
        reporter.progress("Generating", 0.0);
        let stamp = settings.build_directory.join(GENERATE_STAMP);
        if !stamp.is_file() {
            return Err(ServerError::BuildSystem {
                message: format!("Build system files were not generated ({:?} missing).", stamp),
            });
        }
        reporter.progress("Generating done", 1.0);
        Ok(())
    }

    fn inputs(&self) -> BuildInputs {
        self.inputs.clone()
    }

    fn code_model(&self) -> Value {
        let (source, build) = match &self.settings {
            Some(settings) => (
                settings.source_directory.to_string_lossy().into_owned(),
                settings.build_directory.to_string_lossy().into_owned(),
            ),
            None => (String::new(), String::new()),
        };
        let configurations: Vec<Value> = self
            .configurations()
            .into_iter()
            .map(|name| {
                json!({
                    "name": name,
                    "projects": [{
                        "name": self.project_name(),
                        "sourceDirectory": source,
                        "buildDirectory": build,
                        "targets": [],
                    }],
                })
            })
            .collect();
        json!({ (WireKeys::CONFIGURATIONS): configurations })
    }

    fn test_info(&self) -> Value {
        let tests: Vec<Value> = self
            .settings
            .as_ref()
            .and_then(|settings| {
                std::fs::read_to_string(settings.build_directory.join(TEST_FILE)).ok()
            })
            .map(|text| declared_tests(&text))
            .unwrap_or_default()
            .into_iter()
            .map(|name| json!({ "ctestName": name }))
            .collect();

        let configurations: Vec<Value> = self
            .configurations()
            .into_iter()
            .map(|name| {
                json!({
                    "name": name,
                    "projects": [{
                        "name": self.project_name(),
                        "ctestInfo": tests,
                    }],
                })
            })
            .collect();
        json!({ (WireKeys::CONFIGURATIONS): configurations })
    }

    fn toggles(&self) -> GlobalToggles {
        self.toggles
    }

    fn set_toggles(&mut self, toggles: GlobalToggles) {
        self.toggles = toggles;
    }

    fn capabilities(&self) -> Value {
        self.capabilities_ref().clone()
    }
}

impl CommandBuildSystem {
    fn capabilities_ref(&self) -> &Value {
        self.capabilities.get_or_init(|| self.query_capabilities())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    const MISSING_PROGRAM: &str = "buildwire-test-no-such-cmake";

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<(String, String)>>,
        progress: Mutex<Vec<(String, f32)>>,
    }

    impl Reporter for Recorder {
        fn progress(&self, message: &str, fraction: f32) {
            self.progress.lock().push((message.to_string(), fraction));
        }
        fn message(&self, message: &str, title: &str) {
            self.messages
                .lock()
                .push((message.to_string(), title.to_string()));
        }
    }

    fn settings(source: &Path, build: &Path) -> BuildSettings {
        BuildSettings {
            source_directory: source.to_path_buf(),
            build_directory: build.to_path_buf(),
            generator: "Unix Makefiles".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_fallback_generators_without_program() {
        let build = CommandBuildSystem::new(MISSING_PROGRAM);
        let generators = build.generators();
        assert!(generators.iter().any(|g| g.name == "Ninja"));
        assert_eq!(build.capabilities(), json!({}));
    }

    #[test]
    fn test_generators_from_capabilities() {
        let report = json!({
            "generators": [
                {"name": "Ninja", "extraGenerators": ["Kate"], "toolsetSupport": false, "platformSupport": false},
                {"name": "Visual Studio 17 2022", "extraGenerators": [], "toolsetSupport": true, "platformSupport": true},
                {"extraGenerators": []}
            ]
        });
        let generators = generators_from_capabilities(&report);
        assert_eq!(generators.len(), 2);
        assert!(generators[0].supports_extra("Kate"));
        assert!(generators[1].supports_toolset && generators[1].supports_platform);
    }

    #[test]
    fn test_configure_requires_setup() {
        let mut build = CommandBuildSystem::new(MISSING_PROGRAM);
        let err = build.configure(&[], &Recorder::default()).unwrap_err();
        assert!(err.to_string().contains("not set up"));
    }

    #[test]
    fn test_configure_reports_spawn_failure() {
        let source = TempDir::new().unwrap();
        let binary = TempDir::new().unwrap();
        let mut build = CommandBuildSystem::new(MISSING_PROGRAM);
        build.setup(&settings(source.path(), binary.path())).unwrap();
        assert!(build.configure(&[], &Recorder::default()).is_err());
    }

    #[test]
    fn test_discover_inputs_skips_build_and_hidden_dirs() {
        let source = TempDir::new().unwrap();
        let root = source.path();
        std::fs::write(root.join("CMakeLists.txt"), "project(demo)\n").unwrap();
        std::fs::create_dir_all(root.join("cmake")).unwrap();
        std::fs::write(root.join("cmake/Helpers.cmake"), "").unwrap();
        std::fs::write(root.join("main.c"), "").unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join(".git/CMakeLists.txt"), "").unwrap();
        let build_dir = root.join("build");
        std::fs::create_dir_all(build_dir.join("CMakeFiles/3.9.3")).unwrap();
        std::fs::write(build_dir.join("CMakeLists.txt"), "").unwrap();
        std::fs::write(build_dir.join("CMakeFiles/3.9.3/CMakeSystem.cmake"), "").unwrap();

        let inputs = discover_inputs(root, &build_dir, Path::new("/usr/share/cmake"));
        let watched = inputs.watch_list();
        assert_eq!(
            watched,
            vec![root.join("CMakeLists.txt"), root.join("cmake/Helpers.cmake")]
        );
        let temporary: Vec<_> = inputs.files.iter().filter(|f| f.is_temporary).collect();
        assert_eq!(temporary.len(), 1);
        assert_eq!(inputs.cmake_root_directory, PathBuf::from("/usr/share/cmake"));
    }

    #[test]
    fn test_declared_tests() {
        let text = "# generated\nadd_test(unit \"/build/unit\")\nadd_test( \"quoted\" /bin/true)\nsubdirs(\"lib\")\n";
        assert_eq!(declared_tests(text), vec!["unit", "quoted"]);
    }

    #[test]
    fn test_code_model_from_cache() {
        let mut build = CommandBuildSystem::new(MISSING_PROGRAM);
        let dir = TempDir::new().unwrap();
        std::fs::write(
            CacheFile::path_in(dir.path()),
            "CMAKE_PROJECT_NAME:STATIC=demo\nCMAKE_CONFIGURATION_TYPES:STRING=Debug;Release\n",
        )
        .unwrap();
        assert!(build.load_cache(dir.path()).unwrap());

        let model = build.code_model();
        let configurations = model["configurations"].as_array().unwrap();
        assert_eq!(configurations.len(), 2);
        assert_eq!(configurations[1]["name"], "Release");
        assert_eq!(configurations[0]["projects"][0]["name"], "demo");
    }

    #[cfg(unix)]
    #[test]
    fn test_configure_and_generate_with_script() {
        use std::os::unix::fs::PermissionsExt;

        let tools = TempDir::new().unwrap();
        let script = tools.path().join("fake-cmake");
        std::fs::write(
            &script,
            r#"#!/bin/sh
if [ "$1" = "-E" ]; then echo '{"generators":[{"name":"Unix Makefiles","extraGenerators":[]}]}'; exit 0; fi
while [ $# -gt 0 ]; do
  case "$1" in
    -S) src="$2"; shift ;;
    -B) build="$2"; shift ;;
  esac
  shift
done
mkdir -p "$build/CMakeFiles"
printf 'CMAKE_HOME_DIRECTORY:INTERNAL=%s\nCMAKE_PROJECT_NAME:STATIC=demo\n' "$src" > "$build/CMakeCache.txt"
touch "$build/CMakeFiles/cmake.check_cache"
echo "-- Configuring done"
"#,
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let source = TempDir::new().unwrap();
        std::fs::write(source.path().join("CMakeLists.txt"), "project(demo)\n").unwrap();
        let binary = TempDir::new().unwrap();

        let mut build = CommandBuildSystem::new(&script);
        build.setup(&settings(source.path(), binary.path())).unwrap();
        let recorder = Recorder::default();
        build.configure(&["-DFOO=1".to_string()], &recorder).unwrap();

        assert_eq!(build.cache_value("CMAKE_PROJECT_NAME").as_deref(), Some("demo"));
        assert!(recorder
            .messages
            .lock()
            .iter()
            .any(|(message, _)| message == "-- Configuring done"));
        assert_eq!(
            build.inputs().watch_list(),
            vec![source.path().join("CMakeLists.txt")]
        );

        build.generate(&recorder).unwrap();
        let progress = recorder.progress.lock();
        assert_eq!(progress.last().map(|(m, _)| m.as_str()), Some("Generating done"));
    }
}
