//! Reader for `CMakeCache.txt` files.
//!
//! Entries look like `KEY:TYPE=VALUE`; keys may be double-quoted, the type
//! may be omitted. `//` lines before an entry form its help string, and
//! `KEY-ADVANCED:INTERNAL=1` style entries become properties of `KEY`.

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const HELPSTRING: &str = "HELPSTRING";
const PROPERTY_SUFFIXES: &[(&str, &str)] = &[
    ("-ADVANCED", "ADVANCED"),
    ("-MODIFIED", "MODIFIED"),
    ("-STRINGS", "STRINGS"),
];

/// One cache variable, serialized as it appears in a `cache` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: kind.into(),
            value: value.into(),
            properties: BTreeMap::new(),
        }
    }
}

/// Parse a single `KEY[:TYPE]=VALUE` definition.
pub fn parse_entry(line: &str) -> Option<CacheEntry> {
    let line = line.trim_start();
    let (key, rest) = match line.strip_prefix('"') {
        Some(quoted) => {
            let end = quoted.find('"')?;
            (&quoted[..end], &quoted[end + 1..])
        }
        None => {
            let end = line.find([':', '='])?;
            (&line[..end], &line[end..])
        }
    };
    if key.is_empty() {
        return None;
    }

    let (kind, value) = match rest.strip_prefix(':') {
        Some(typed) => {
            let eq = typed.find('=')?;
            (typed[..eq].trim().to_ascii_uppercase(), &typed[eq + 1..])
        }
        None => ("UNINITIALIZED".to_string(), rest.strip_prefix('=')?),
    };

    let value = value.trim_end_matches([' ', '\t', '\r']);
    let value = if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
        &value[1..value.len() - 1]
    } else {
        value
    };

    Some(CacheEntry::new(key, kind, value))
}

/// A parsed cache file.
#[derive(Debug, Clone, Default)]
pub struct CacheFile {
    entries: BTreeMap<String, CacheEntry>,
}

impl CacheFile {
    pub fn path_in(build_directory: &Path) -> PathBuf {
        build_directory.join(ServerConfig::CACHE_FILE_NAME)
    }

    /// Load the cache of `build_directory`. `Ok(None)` if there is none.
    pub fn load(build_directory: &Path) -> Result<Option<Self>> {
        let path = Self::path_in(build_directory);
        if !path.is_file() {
            return Ok(None);
        }
        let text =
            std::fs::read_to_string(&path).map_err(|e| ServerError::io_with_path(e, &path))?;
        Ok(Some(Self::parse(&text)))
    }

    pub fn parse(text: &str) -> Self {
        let mut entries = BTreeMap::new();
        let mut help = String::new();

        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if let Some(comment) = trimmed.strip_prefix("//") {
                match comment.strip_prefix("\\n") {
                    Some(continued) => {
                        help.push('\n');
                        help.push_str(continued);
                    }
                    None => help.push_str(comment),
                }
                continue;
            }

            if let Some(mut entry) = parse_entry(trimmed) {
                if !help.is_empty() {
                    entry
                        .properties
                        .insert(HELPSTRING.to_string(), std::mem::take(&mut help));
                }
                entries.insert(entry.key.clone(), entry);
            }
            help.clear();
        }

        let mut cache = Self { entries };
        cache.fold_properties();
        cache
    }

    /// Move `KEY-SUFFIX` internal entries onto `KEY` as properties.
    fn fold_properties(&mut self) {
        let mut folded = Vec::new();
        for (key, entry) in &self.entries {
            if entry.kind != "INTERNAL" {
                continue;
            }
            for (suffix, property) in PROPERTY_SUFFIXES {
                if let Some(base) = key.strip_suffix(suffix) {
                    if self.entries.contains_key(base) {
                        folded.push((key.clone(), base.to_string(), *property));
                    }
                }
            }
        }

        for (key, base, property) in folded {
            if let Some(entry) = self.entries.remove(&key) {
                if let Some(target) = self.entries.get_mut(&base) {
                    target.properties.insert(property.to_string(), entry.value);
                }
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|entry| entry.value.as_str())
    }

    pub fn insert(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.key.clone(), entry);
    }

    /// Entries sorted by key.
    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"# This is the CMakeCache file.
# For build in directory: /work/build

########################
# EXTERNAL cache entries
########################

//Build type
CMAKE_BUILD_TYPE:STRING=Debug

//Path to a program.
//\nSecond line.
CMAKE_AR:FILEPATH=/usr/bin/ar

"QUOTED:KEY":STRING=with colon
UNTYPED=plain
QUOTED_VALUE:STRING='  spaced  '

########################
# INTERNAL cache entries
########################

CMAKE_AR-ADVANCED:INTERNAL=1
CMAKE_BUILD_TYPE-STRINGS:INTERNAL=Debug;Release
CMAKE_GENERATOR:INTERNAL=Unix Makefiles
CMAKE_HOME_DIRECTORY:INTERNAL=/work/src
ORPHAN-ADVANCED:INTERNAL=1
"#;

    #[test]
    fn test_parse_entries() {
        let cache = CacheFile::parse(SAMPLE);
        assert_eq!(cache.value("CMAKE_BUILD_TYPE"), Some("Debug"));
        assert_eq!(cache.value("CMAKE_GENERATOR"), Some("Unix Makefiles"));
        assert_eq!(cache.value("QUOTED:KEY"), Some("with colon"));
        assert_eq!(cache.get("UNTYPED").unwrap().kind, "UNINITIALIZED");
        assert_eq!(cache.value("QUOTED_VALUE"), Some("  spaced  "));
    }

    #[test]
    fn test_help_strings() {
        let cache = CacheFile::parse(SAMPLE);
        let ar = cache.get("CMAKE_AR").unwrap();
        assert_eq!(
            ar.properties.get("HELPSTRING").map(String::as_str),
            Some("Path to a program.\nSecond line.")
        );
        assert!(!cache
            .get("CMAKE_GENERATOR")
            .unwrap()
            .properties
            .contains_key("HELPSTRING"));
    }

    #[test]
    fn test_internal_properties_are_folded() {
        let cache = CacheFile::parse(SAMPLE);
        assert_eq!(
            cache.get("CMAKE_AR").unwrap().properties.get("ADVANCED").map(String::as_str),
            Some("1")
        );
        assert_eq!(
            cache
                .get("CMAKE_BUILD_TYPE")
                .unwrap()
                .properties
                .get("STRINGS")
                .map(String::as_str),
            Some("Debug;Release")
        );
        assert!(cache.get("CMAKE_AR-ADVANCED").is_none());
        assert!(cache.get("ORPHAN-ADVANCED").is_some());
    }

    #[test]
    fn test_entry_serialization_omits_empty_properties() {
        let cache = CacheFile::parse(SAMPLE);
        let generator = serde_json::to_value(cache.get("CMAKE_GENERATOR").unwrap()).unwrap();
        assert_eq!(
            generator,
            serde_json::json!({
                "key": "CMAKE_GENERATOR",
                "type": "INTERNAL",
                "value": "Unix Makefiles"
            })
        );

        let build_type = serde_json::to_value(cache.get("CMAKE_BUILD_TYPE").unwrap()).unwrap();
        assert_eq!(build_type["type"], "STRING");
        assert_eq!(build_type["properties"]["STRINGS"], "Debug;Release");
        assert_eq!(build_type["properties"]["HELPSTRING"], "Build type");
    }

    #[test]
    fn test_parse_entry_rejects_garbage() {
        assert!(parse_entry("no equals sign").is_none());
        assert!(parse_entry("=value").is_none());
        assert!(parse_entry("\"unterminated:STRING=x").is_none());
        let entry = parse_entry("FOO:bool=ON").unwrap();
        assert_eq!(entry.kind, "BOOL");
        assert_eq!(entry.value, "ON");
    }

    #[test]
    fn test_load_missing_and_present() {
        let dir = TempDir::new().unwrap();
        assert!(CacheFile::load(dir.path()).unwrap().is_none());

        std::fs::write(CacheFile::path_in(dir.path()), SAMPLE).unwrap();
        let cache = CacheFile::load(dir.path()).unwrap().unwrap();
        assert_eq!(cache.value("CMAKE_HOME_DIRECTORY"), Some("/work/src"));
    }
}
