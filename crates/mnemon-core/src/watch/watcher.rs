//! Debounced file watcher with optional direct pipeline injection
//!
//! Raw notify events are coalesced over a debounce window and resolved
//! against the filesystem: rapid create+modify collapses to an add,
//! delete+create to a modify, create+delete to nothing. Ignore layering
//! matches the scanner. `.gitignore` edits debounce separately and only
//! fire when the ignore content hash actually changes.
//!
//! Two injection modes: batch events for an index job, or `PipelineFile`
//! straight into a running pipeline's reader (deletes bypass to the writer)
//! for sub-200 ms single-file latency.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lru::LruCache;
use notify::{RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::index::language::{language_for_extension, BINARY_EXTENSIONS, SKIP_DIRECTORIES};
use crate::index::pipeline::{PipelineFile, ScanMessage, WriteMessage};
use crate::index::scanner::{gitignore_hash, is_path_ignored};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Content cache entries for incremental parse reuse
const CONTENT_CACHE_ENTRIES: usize = 1000;

/// Files above this size are not cached
const CONTENT_CACHE_FILE_CAP: u64 = 512 * 1024;

/// Debounce scan cadence
const TICK: Duration = Duration::from_millis(100);

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Watcher tuning
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Event coalescing window
    pub debounce: Duration,
    /// Separate, longer window for ignore-file edits
    pub gitignore_debounce: Duration,
    /// Extra ignore file name loaded alongside .gitignore
    pub ignore_file: String,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            gitignore_debounce: Duration::from_secs(1),
            ignore_file: ".mnemonignore".to_string(),
        }
    }
}

impl From<&crate::config::IndexConfig> for WatcherConfig {
    fn from(config: &crate::config::IndexConfig) -> Self {
        Self {
            debounce: Duration::from_millis(config.watcher_debounce_ms),
            gitignore_debounce: Duration::from_millis(config.gitignore_debounce_ms),
            ignore_file: config.ignore_file.clone(),
        }
    }
}

// ============================================================================
// EVENTS / SINKS
// ============================================================================

/// A resolved file event after debouncing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Added(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
}

impl WatchEvent {
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::Added(p) | WatchEvent::Modified(p) | WatchEvent::Removed(p) => p,
        }
    }
}

/// Where resolved events go
pub enum WatchSink {
    /// Indexer mode: aggregated event batches, handed off as index jobs
    Events(mpsc::Sender<Vec<WatchEvent>>),
    /// Pipeline mode: files into the reader stage, deletes straight to the
    /// writer
    Pipeline {
        files: mpsc::Sender<ScanMessage>,
        writer: mpsc::Sender<WriteMessage>,
    },
}

// ============================================================================
// DEBOUNCE STATE
// ============================================================================

/// Pure debounce/tracking state, driven by the pump and directly testable
pub struct WatchState {
    root: PathBuf,
    config: WatcherConfig,
    /// Files currently known to the index
    tracked: HashSet<PathBuf>,
    /// Dirty paths with their last-event time
    pending: HashMap<PathBuf, tokio::time::Instant>,
    gitignore_pending: Option<tokio::time::Instant>,
    gitignore_hash: String,
}

impl WatchState {
    pub fn new(root: PathBuf, config: WatcherConfig, tracked: HashSet<PathBuf>) -> Self {
        let gitignore_hash = gitignore_hash(&root, &config.ignore_file);
        Self {
            root,
            config,
            tracked,
            pending: HashMap::new(),
            gitignore_pending: None,
            gitignore_hash,
        }
    }

    /// Whether a path can ever be indexable (cheap per-event filter; the
    /// layered ignore check happens at flush time)
    fn relevant(&self, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return false;
        };
        for component in relative.components() {
            let name = component.as_os_str().to_string_lossy();
            if name.starts_with('.') || SKIP_DIRECTORIES.contains(&name.as_ref()) {
                return false;
            }
        }
        let Some(extension) = path.extension().map(|e| e.to_string_lossy().to_lowercase()) else {
            return false;
        };
        if BINARY_EXTENSIONS.contains(&extension.as_str()) {
            return false;
        }
        language_for_extension(&extension).is_some()
    }

    /// Record a raw event path
    pub fn note(&mut self, path: PathBuf, now: tokio::time::Instant) {
        let name = path.file_name().map(|n| n.to_string_lossy().to_string());
        if let Some(name) = name {
            if name == ".gitignore" || name == self.config.ignore_file {
                self.gitignore_pending = Some(now);
                return;
            }
        }
        if self.relevant(&path) {
            self.pending.insert(path, now);
        }
    }

    /// Flush due entries. Events resolve against the filesystem and the
    /// tracked set, which makes the collapse rules fall out naturally:
    /// create+modify ⇒ add, delete+create ⇒ modify, create+delete ⇒ nothing.
    /// Returns the resolved events plus whether the ignore rules changed.
    pub fn due(&mut self, now: tokio::time::Instant) -> (Vec<WatchEvent>, bool) {
        let ready: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) >= self.config.debounce)
            .map(|(path, _)| path.clone())
            .collect();

        let mut events = Vec::new();
        for path in ready {
            self.pending.remove(&path);
            let exists = path.is_file();
            let tracked = self.tracked.contains(&path);

            if exists && is_path_ignored(&self.root, &self.config.ignore_file, &path) {
                // Ignore rules make it invisible regardless of prior state
                self.tracked.remove(&path);
                continue;
            }

            match (tracked, exists) {
                (false, true) => {
                    self.tracked.insert(path.clone());
                    events.push(WatchEvent::Added(path));
                }
                (true, true) => events.push(WatchEvent::Modified(path)),
                (true, false) => {
                    self.tracked.remove(&path);
                    events.push(WatchEvent::Removed(path));
                }
                (false, false) => {}
            }
        }

        let mut ignore_changed = false;
        if let Some(seen) = self.gitignore_pending {
            if now.duration_since(seen) >= self.config.gitignore_debounce {
                self.gitignore_pending = None;
                let hash = gitignore_hash(&self.root, &self.config.ignore_file);
                if hash != self.gitignore_hash {
                    self.gitignore_hash = hash;
                    ignore_changed = true;
                }
            }
        }

        (events, ignore_changed)
    }

    pub fn is_tracked(&self, path: &Path) -> bool {
        self.tracked.contains(path)
    }
}

// ============================================================================
// WATCHER
// ============================================================================

/// A running watcher
pub struct WatcherHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl WatcherHandle {
    /// Stop the watcher and wait for the pump to exit
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Recursive project watcher
pub struct CodeWatcher;

impl CodeWatcher {
    /// Start watching `root`. `initial_tracked` seeds the known-file set
    /// (typically the indexed paths); `on_ignore_change` receives the new
    /// ignore hash whenever the rules actually change, prompting a full
    /// re-scan.
    pub fn spawn(
        root: PathBuf,
        config: WatcherConfig,
        initial_tracked: HashSet<PathBuf>,
        sink: WatchSink,
        on_ignore_change: Option<mpsc::Sender<String>>,
    ) -> notify::Result<WatcherHandle> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<notify::Event>();
        let mut fs_watcher =
            notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
                match result {
                    Ok(event) => {
                        let _ = raw_tx.send(event);
                    }
                    Err(e) => tracing::warn!(error = %e, "Watcher backend error"),
                }
            })?;
        fs_watcher.watch(&root, RecursiveMode::Recursive)?;

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            // The backend stops when this handle drops; keep it in the task
            let _fs_watcher = fs_watcher;
            let mut state = WatchState::new(root.clone(), config, initial_tracked);
            let mut cache: LruCache<PathBuf, String> = LruCache::new(
                NonZeroUsize::new(CONTENT_CACHE_ENTRIES).expect("cache size is non-zero"),
            );
            let mut tick = tokio::time::interval(TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            tracing::info!(root = %root.display(), "Watcher started");

            loop {
                tokio::select! {
                    biased;

                    _ = task_cancel.cancelled() => break,

                    _ = tick.tick() => {
                        let (events, ignore_changed) = state.due(tokio::time::Instant::now());
                        if ignore_changed {
                            tracing::info!("Ignore rules changed; requesting full re-scan");
                            if let Some(sender) = &on_ignore_change {
                                let _ = sender.try_send(state.gitignore_hash.clone());
                            }
                        }
                        if !events.is_empty()
                            && !dispatch(&root, events, &sink, &mut cache).await
                        {
                            break;
                        }
                    }

                    event = raw_rx.recv() => {
                        match event {
                            Some(event) => {
                                let now = tokio::time::Instant::now();
                                for path in event.paths {
                                    state.note(path, now);
                                }
                            }
                            None => break,
                        }
                    }
                }
            }

            tracing::info!("Watcher stopped");
        });

        Ok(WatcherHandle { cancel, task })
    }
}

/// Deliver resolved events to the sink. Returns false when the sink closed.
async fn dispatch(
    root: &Path,
    events: Vec<WatchEvent>,
    sink: &WatchSink,
    cache: &mut LruCache<PathBuf, String>,
) -> bool {
    match sink {
        WatchSink::Events(sender) => sender.send(events).await.is_ok(),
        WatchSink::Pipeline { files, writer } => {
            for event in events {
                let relative = event
                    .path()
                    .strip_prefix(root)
                    .unwrap_or(event.path())
                    .to_string_lossy()
                    .replace('\\', "/");

                match &event {
                    WatchEvent::Added(path) | WatchEvent::Modified(path) => {
                        let old_content = cache.get(path).cloned();

                        let metadata = match std::fs::metadata(path) {
                            Ok(m) => m,
                            Err(_) => continue, // vanished between flush and dispatch
                        };
                        let mtime = metadata
                            .modified()
                            .ok()
                            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                            .map(|d| d.as_secs() as i64)
                            .unwrap_or(0);

                        if metadata.len() <= CONTENT_CACHE_FILE_CAP {
                            if let Ok(content) = tokio::fs::read_to_string(path).await {
                                cache.put(path.clone(), content);
                            }
                        } else {
                            cache.pop(path);
                        }

                        let extension = path
                            .extension()
                            .map(|e| e.to_string_lossy().to_lowercase())
                            .unwrap_or_default();
                        let language = language_for_extension(&extension)
                            .unwrap_or("plaintext")
                            .to_string();

                        let file = PipelineFile {
                            path: path.clone(),
                            relative_path: relative,
                            language,
                            mtime,
                            old_content,
                        };
                        if files.send(ScanMessage::File(file)).await.is_err() {
                            return false;
                        }
                    }
                    WatchEvent::Removed(path) => {
                        cache.pop(path);
                        if writer
                            .send(WriteMessage::Delete { path: relative })
                            .await
                            .is_err()
                        {
                            return false;
                        }
                    }
                }
            }
            true
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::time::Instant;

    fn quick_config() -> WatcherConfig {
        WatcherConfig {
            debounce: Duration::from_millis(50),
            gitignore_debounce: Duration::from_millis(80),
            ignore_file: ".mnemonignore".to_string(),
        }
    }

    fn state(root: &Path) -> WatchState {
        WatchState::new(root.to_path_buf(), quick_config(), HashSet::new())
    }

    fn write(root: &Path, relative: &str, content: &str) -> PathBuf {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test(start_paused = true)]
    async fn create_resolves_to_add_and_modify_after() {
        let temp = TempDir::new().unwrap();
        let mut state = state(temp.path());
        let path = write(temp.path(), "src/a.rs", "fn a() {}");

        state.note(path.clone(), Instant::now());
        // Not yet due
        let (events, _) = state.due(Instant::now());
        assert!(events.is_empty());

        tokio::time::advance(Duration::from_millis(60)).await;
        let (events, _) = state.due(Instant::now());
        assert_eq!(events, vec![WatchEvent::Added(path.clone())]);
        assert!(state.is_tracked(&path));

        // Subsequent change on a tracked file is a modify
        state.note(path.clone(), Instant::now());
        tokio::time::advance(Duration::from_millis(60)).await;
        let (events, _) = state.due(Instant::now());
        assert_eq!(events, vec![WatchEvent::Modified(path)]);
    }

    #[tokio::test(start_paused = true)]
    async fn create_then_delete_collapses_to_nothing() {
        let temp = TempDir::new().unwrap();
        let mut state = state(temp.path());
        let path = write(temp.path(), "src/flash.rs", "fn f() {}");

        state.note(path.clone(), Instant::now());
        std::fs::remove_file(&path).unwrap();
        state.note(path.clone(), Instant::now());

        tokio::time::advance(Duration::from_millis(60)).await;
        let (events, _) = state.due(Instant::now());
        assert!(events.is_empty());
        assert!(!state.is_tracked(&path));
    }

    #[tokio::test(start_paused = true)]
    async fn delete_then_recreate_collapses_to_modify() {
        let temp = TempDir::new().unwrap();
        let path = write(temp.path(), "src/a.rs", "fn a() {}");
        let mut state = WatchState::new(
            temp.path().to_path_buf(),
            quick_config(),
            HashSet::from([path.clone()]),
        );

        // Editors often delete + recreate on save
        std::fs::remove_file(&path).unwrap();
        state.note(path.clone(), Instant::now());
        write(temp.path(), "src/a.rs", "fn a() { /* saved */ }");
        state.note(path.clone(), Instant::now());

        tokio::time::advance(Duration::from_millis(60)).await;
        let (events, _) = state.due(Instant::now());
        assert_eq!(events, vec![WatchEvent::Modified(path)]);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_of_tracked_file_is_removed() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("src/gone.rs");
        let mut state = WatchState::new(
            temp.path().to_path_buf(),
            quick_config(),
            HashSet::from([path.clone()]),
        );

        state.note(path.clone(), Instant::now());
        tokio::time::advance(Duration::from_millis(60)).await;
        let (events, _) = state.due(Instant::now());
        assert_eq!(events, vec![WatchEvent::Removed(path.clone())]);
        assert!(!state.is_tracked(&path));
    }

    #[tokio::test(start_paused = true)]
    async fn irrelevant_paths_never_pend() {
        let temp = TempDir::new().unwrap();
        let mut state = state(temp.path());

        state.note(temp.path().join("logo.png"), Instant::now());
        state.note(temp.path().join("node_modules/x/index.js"), Instant::now());
        state.note(temp.path().join(".git/objects/ab"), Instant::now());
        state.note(temp.path().join("notes.unknownext"), Instant::now());

        tokio::time::advance(Duration::from_millis(60)).await;
        let (events, _) = state.due(Instant::now());
        assert!(events.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn newly_ignored_file_becomes_untracked_silently() {
        let temp = TempDir::new().unwrap();
        let path = write(temp.path(), "lib/app.test.ts", "test()");
        let mut state = WatchState::new(
            temp.path().to_path_buf(),
            quick_config(),
            HashSet::from([path.clone()]),
        );

        write(temp.path(), "lib/.gitignore", "*.test.ts\n");
        state.note(path.clone(), Instant::now());

        tokio::time::advance(Duration::from_millis(60)).await;
        let (events, _) = state.due(Instant::now());
        assert!(events.is_empty());
        assert!(!state.is_tracked(&path));
    }

    #[tokio::test(start_paused = true)]
    async fn gitignore_edit_fires_only_on_hash_change() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), ".gitignore", "dist/\n");
        let mut state = state(temp.path());

        // Touch without change: debounces but does not fire
        state.note(temp.path().join(".gitignore"), Instant::now());
        tokio::time::advance(Duration::from_millis(100)).await;
        let (_, changed) = state.due(Instant::now());
        assert!(!changed);

        // Real edit fires after its own (longer) debounce
        write(temp.path(), ".gitignore", "dist/\nbuild/\n");
        state.note(temp.path().join(".gitignore"), Instant::now());
        let (_, changed) = state.due(Instant::now());
        assert!(!changed); // not due yet
        tokio::time::advance(Duration::from_millis(100)).await;
        let (_, changed) = state.due(Instant::now());
        assert!(changed);
    }

    #[tokio::test]
    async fn end_to_end_watch_emits_batches() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("project");
        std::fs::create_dir_all(root.join("src")).unwrap();

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let handle = CodeWatcher::spawn(
            root.clone(),
            WatcherConfig {
                debounce: Duration::from_millis(100),
                ..WatcherConfig::default()
            },
            HashSet::new(),
            WatchSink::Events(events_tx),
            None,
        )
        .unwrap();

        // Give the backend a moment to arm, then create a file
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(root.join("src/new.rs"), "fn fresh() {}").unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .expect("watcher should emit within the timeout")
            .expect("sink open");
        assert!(batch
            .iter()
            .any(|e| matches!(e, WatchEvent::Added(p) if p.ends_with("src/new.rs"))));

        handle.stop().await;
    }
}
