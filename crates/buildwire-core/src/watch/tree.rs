//! Hierarchical watcher tree.
//!
//! An absolute path decomposes into a root segment (`/` on Unix, the drive
//! prefix on Windows) and the normal components below it. Each directory on
//! the way gets a [`DirectoryNode`]; the file itself is a [`FileNode`] leaf
//! holding the callbacks registered for it.
//!
//! Native watch handles are created per directory that directly holds
//! watched files, once the tree is bound to the loop. The handles forward
//! raw events as [`LoopEvent::FileChanged`]; the loop then calls
//! [`FileWatchTree::dispatch`] on its own thread.

use super::FileChange;
use crate::error::Result;
use crate::ipc::event_loop::{LoopEvent, LoopNotifier};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Callback invoked on the loop thread when a watched file changes.
pub type WatchCallback = Arc<dyn Fn(&Path, FileChange) + Send + Sync>;

#[derive(Default)]
struct FileNode {
    callbacks: Vec<WatchCallback>,
}

struct DirectoryNode {
    path: PathBuf,
    directories: BTreeMap<String, DirectoryNode>,
    files: BTreeMap<String, FileNode>,
    handle: Option<RecommendedWatcher>,
}

impl DirectoryNode {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            directories: BTreeMap::new(),
            files: BTreeMap::new(),
            handle: None,
        }
    }

    fn start_watching(&mut self, notifier: &LoopNotifier) -> usize {
        let mut started = 0;
        if self.handle.is_none() && !self.files.is_empty() {
            match create_handle(&self.path, notifier.clone()) {
                Ok(handle) => {
                    debug!("Watching directory {:?}", self.path);
                    self.handle = Some(handle);
                    started += 1;
                }
                Err(e) => warn!("Failed to watch {:?}: {}", self.path, e),
            }
        }
        for child in self.directories.values_mut() {
            started += child.start_watching(notifier);
        }
        started
    }

    fn stop_watching(&mut self) {
        // Dropping the handle removes the native watch.
        self.handle.take();
        for child in self.directories.values_mut() {
            child.stop_watching();
        }
    }

    fn collect_files(&self, out: &mut Vec<String>) {
        for name in self.files.keys() {
            out.push(self.path.join(name).to_string_lossy().into_owned());
        }
        for child in self.directories.values() {
            child.collect_files(out);
        }
    }

    fn collect_directories(&self, out: &mut Vec<String>) {
        out.push(self.path.to_string_lossy().into_owned());
        for child in self.directories.values() {
            child.collect_directories(out);
        }
    }

    fn handle_count(&self) -> usize {
        usize::from(self.handle.is_some())
            + self
                .directories
                .values()
                .map(DirectoryNode::handle_count)
                .sum::<usize>()
    }
}

fn create_handle(path: &Path, notifier: LoopNotifier) -> Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) => {
                let Some(change) = FileChange::from_event_kind(&event.kind) else {
                    return;
                };
                for path in event.paths {
                    notifier.send(LoopEvent::FileChanged { path, change });
                }
            }
            Err(e) => debug!("Watcher error: {}", e),
        }
    })?;
    watcher.watch(path, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Split an absolute path into its root segment and normal components.
fn decompose(path: &Path) -> Option<(PathBuf, Vec<String>)> {
    if !path.is_absolute() {
        return None;
    }

    let mut root = PathBuf::new();
    let mut segments = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                if !segments.is_empty() {
                    return None;
                }
                root.push(component.as_os_str());
            }
            Component::Normal(segment) => segments.push(segment.to_string_lossy().into_owned()),
            Component::CurDir | Component::ParentDir => return None,
        }
    }

    if root.as_os_str().is_empty() || segments.is_empty() {
        return None;
    }
    Some((root, segments))
}

/// Tree of watched input files.
#[derive(Default)]
pub struct FileWatchTree {
    roots: BTreeMap<PathBuf, DirectoryNode>,
    notifier: Option<LoopNotifier>,
}

impl FileWatchTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind to the loop so native events can be posted to it.
    pub fn bind(&mut self, notifier: LoopNotifier) {
        self.notifier = Some(notifier);
    }

    pub fn is_bound(&self) -> bool {
        self.notifier.is_some()
    }

    /// Register `callback` for a single file. Returns `false` for paths that
    /// are not absolute.
    ///
    /// Watching the same path twice appends another callback to the same
    /// node.
    pub fn watch_file(&mut self, path: &Path, callback: WatchCallback) -> bool {
        let Some((root, segments)) = decompose(path) else {
            warn!("Refusing to watch non-absolute path {:?}", path);
            return false;
        };
        let Some((file_name, directories)) = segments.split_last() else {
            return false;
        };

        let mut node = self
            .roots
            .entry(root.clone())
            .or_insert_with(|| DirectoryNode::new(root));
        for segment in directories {
            let child_path = node.path.join(segment);
            node = node
                .directories
                .entry(segment.clone())
                .or_insert_with(|| DirectoryNode::new(child_path));
        }
        node.files
            .entry(file_name.clone())
            .or_default()
            .callbacks
            .push(callback);
        true
    }

    /// Watch every path in `paths` with a shared callback and start native
    /// watching if the tree is bound.
    pub fn monitor_paths(&mut self, paths: &[PathBuf], callback: WatchCallback) -> usize {
        let added = paths
            .iter()
            .filter(|path| self.watch_file(path, Arc::clone(&callback)))
            .count();
        self.start_watching();
        added
    }

    /// Create native handles for every directory holding watched files.
    ///
    /// Directories that already have a handle are left alone.
    pub fn start_watching(&mut self) -> usize {
        let Some(notifier) = self.notifier.clone() else {
            return 0;
        };
        self.roots
            .values_mut()
            .map(|root| root.start_watching(&notifier))
            .sum()
    }

    /// Drop every native handle, keeping the registered paths.
    pub fn stop_watching(&mut self) {
        for root in self.roots.values_mut() {
            root.stop_watching();
        }
    }

    /// Drop all nodes and callbacks.
    pub fn reset(&mut self) {
        self.stop_watching();
        self.roots.clear();
    }

    /// Drop everything and detach from the loop.
    pub fn unbind(&mut self) {
        self.reset();
        self.notifier = None;
    }

    /// Run the callbacks registered for `path`. Returns how many ran.
    pub fn dispatch(&self, path: &Path, change: FileChange) -> usize {
        let Some((root, segments)) = decompose(path) else {
            return 0;
        };
        let Some((file_name, directories)) = segments.split_last() else {
            return 0;
        };

        let Some(mut node) = self.roots.get(&root) else {
            return 0;
        };
        for segment in directories {
            match node.directories.get(segment) {
                Some(child) => node = child,
                None => return 0,
            }
        }
        let Some(file) = node.files.get(file_name) else {
            return 0;
        };

        debug!("File change on {:?}: {:?}", path, change);
        for callback in &file.callbacks {
            callback(path, change);
        }
        file.callbacks.len()
    }

    /// Every watched file, sorted.
    pub fn watched_files(&self) -> Vec<String> {
        let mut files = Vec::new();
        for root in self.roots.values() {
            root.collect_files(&mut files);
        }
        files.sort();
        files
    }

    /// Every directory node in the tree, including root segments, sorted.
    pub fn watched_directories(&self) -> Vec<String> {
        let mut directories = Vec::new();
        for root in self.roots.values() {
            root.collect_directories(&mut directories);
        }
        directories.sort();
        directories
    }

    /// Number of live native watch handles.
    pub fn handle_count(&self) -> usize {
        self.roots.values().map(DirectoryNode::handle_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recording() -> (WatchCallback, Arc<Mutex<Vec<(PathBuf, FileChange)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: WatchCallback = Arc::new(move |path: &Path, change: FileChange| {
            sink.lock().push((path.to_path_buf(), change));
        });
        (callback, seen)
    }

    fn absolute(parts: &[&str]) -> PathBuf {
        let mut path = std::env::temp_dir();
        for part in parts {
            path.push(part);
        }
        path
    }

    #[test]
    fn test_decompose_is_deterministic() {
        let path = absolute(&["project", "CMakeLists.txt"]);
        let (root, segments) = decompose(&path).unwrap();
        let (root2, segments2) = decompose(&path).unwrap();
        assert_eq!(root, root2);
        assert_eq!(segments, segments2);
        assert_eq!(segments.last().map(String::as_str), Some("CMakeLists.txt"));
        assert!(decompose(Path::new("relative/file.txt")).is_none());
    }

    #[test]
    fn test_relative_paths_are_rejected() {
        let mut tree = FileWatchTree::new();
        let (callback, _) = recording();
        assert!(!tree.watch_file(Path::new("CMakeLists.txt"), callback));
        assert!(tree.watched_files().is_empty());
    }

    #[test]
    fn test_same_path_appends_callback() {
        let mut tree = FileWatchTree::new();
        let path = absolute(&["project", "CMakeLists.txt"]);
        let (first, first_seen) = recording();
        let (second, second_seen) = recording();

        assert!(tree.watch_file(&path, first));
        assert!(tree.watch_file(&path, second));
        assert_eq!(tree.watched_files().len(), 1);

        assert_eq!(tree.dispatch(&path, FileChange::CHANGED), 2);
        assert_eq!(first_seen.lock().len(), 1);
        assert_eq!(second_seen.lock()[0], (path, FileChange::CHANGED));
    }

    #[test]
    fn test_dispatch_ignores_unwatched_paths() {
        let mut tree = FileWatchTree::new();
        let (callback, seen) = recording();
        tree.watch_file(&absolute(&["project", "CMakeLists.txt"]), callback);

        assert_eq!(tree.dispatch(&absolute(&["project", "other.txt"]), FileChange::CHANGED), 0);
        assert_eq!(tree.dispatch(&absolute(&["elsewhere", "CMakeLists.txt"]), FileChange::RENAMED), 0);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_watched_listings() {
        let mut tree = FileWatchTree::new();
        let (callback, _) = recording();
        let top = absolute(&["project", "CMakeLists.txt"]);
        let nested = absolute(&["project", "cmake", "Helpers.cmake"]);
        let added = tree.monitor_paths(
            &[nested.clone(), top.clone(), PathBuf::from("not/absolute.cmake")],
            callback,
        );
        assert_eq!(added, 2);

        let files = tree.watched_files();
        let mut expected = vec![
            top.to_string_lossy().into_owned(),
            nested.to_string_lossy().into_owned(),
        ];
        expected.sort();
        assert_eq!(files, expected);

        let directories = tree.watched_directories();
        assert!(directories.contains(&absolute(&["project"]).to_string_lossy().into_owned()));
        assert!(directories.contains(&absolute(&["project", "cmake"]).to_string_lossy().into_owned()));
        let mut sorted = directories.clone();
        sorted.sort();
        assert_eq!(directories, sorted);
    }

    #[test]
    fn test_unbound_tree_creates_no_handles() {
        let mut tree = FileWatchTree::new();
        let (callback, _) = recording();
        tree.monitor_paths(&[absolute(&["project", "CMakeLists.txt"])], callback);
        assert_eq!(tree.handle_count(), 0);
        assert_eq!(tree.start_watching(), 0);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut tree = FileWatchTree::new();
        let (callback, seen) = recording();
        let path = absolute(&["project", "CMakeLists.txt"]);
        tree.watch_file(&path, callback);
        tree.reset();

        assert!(tree.watched_files().is_empty());
        assert!(tree.watched_directories().is_empty());
        assert_eq!(tree.dispatch(&path, FileChange::CHANGED), 0);
        assert!(seen.lock().is_empty());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_native_change_is_posted_to_loop() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("CMakeLists.txt");
        std::fs::write(&file, "project(demo)\n").unwrap();

        let (notifier, mut rx) = LoopNotifier::channel();
        let mut tree = FileWatchTree::new();
        tree.bind(notifier);
        let (callback, seen) = recording();
        tree.monitor_paths(&[file.clone()], callback);
        assert_eq!(tree.handle_count(), 1);

        std::fs::write(&file, "project(demo2)\n").unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Some(LoopEvent::FileChanged { path, change }) if path == file => {
                        return (path, change);
                    }
                    Some(_) => continue,
                    None => panic!("notifier closed"),
                }
            }
        })
        .await
        .unwrap();

        assert!(tree.dispatch(&event.0, event.1) >= 1);
        assert!(!seen.lock().is_empty());

        tree.unbind();
        assert_eq!(tree.handle_count(), 0);
        assert!(!tree.is_bound());
    }
}
