//! Recursive source-tree scanner with layered ignore
//!
//! Walks a project root, honoring a project-level ignore file plus any
//! nested ignore files met during traversal; a nested pattern only applies
//! under its containing directory. Default filters drop binaries, lockfiles,
//! vendor/build directories, oversized, empty, and unknown-extension files.

use std::path::{Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::config::IndexConfig;
use crate::dedup::fnv1a64;

use super::language::{
    language_for_extension, BINARY_EXTENSIONS, LOCKFILE_NAMES, SKIP_DIRECTORIES,
};

/// Progress callback cadence, in files
const PROGRESS_EVERY: usize = 100;

// ============================================================================
// TYPES
// ============================================================================

/// A file accepted by the scanner
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub relative_path: String,
    pub size: u64,
    /// Seconds since the epoch
    pub mtime: i64,
    pub language: String,
}

/// Result of a full scan
#[derive(Debug, Default)]
pub struct ScanReport {
    pub files: Vec<ScannedFile>,
    pub total_size: u64,
    pub skipped_count: usize,
}

// ============================================================================
// IGNORE LAYERING
// ============================================================================

/// A stack of gitignore matchers, one frame per directory level that
/// carries ignore files. Each matcher only sees paths under its own root.
#[derive(Default)]
pub struct IgnoreStack {
    matchers: Vec<Gitignore>,
}

impl IgnoreStack {
    /// Build a matcher for one directory from `.gitignore` plus the
    /// configured extra ignore file. Returns `None` when neither exists.
    fn matcher_for_dir(dir: &Path, ignore_file: &str) -> Option<Gitignore> {
        let gitignore = dir.join(".gitignore");
        let custom = dir.join(ignore_file);
        if !gitignore.exists() && !custom.exists() {
            return None;
        }

        let mut builder = GitignoreBuilder::new(dir);
        for path in [&gitignore, &custom] {
            if path.exists() {
                if let Some(e) = builder.add(path) {
                    tracing::warn!(path = %path.display(), error = %e, "Unparseable ignore file");
                }
            }
        }
        match builder.build() {
            Ok(matcher) => Some(matcher),
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Ignore matcher build failed");
                None
            }
        }
    }

    /// Push the directory's matcher, if any. Returns the stack depth to
    /// restore when leaving the directory.
    pub fn enter_dir(&mut self, dir: &Path, ignore_file: &str) -> usize {
        let mark = self.matchers.len();
        if let Some(matcher) = Self::matcher_for_dir(dir, ignore_file) {
            self.matchers.push(matcher);
        }
        mark
    }

    /// Restore the stack to a previous depth
    pub fn leave_dir(&mut self, mark: usize) {
        self.matchers.truncate(mark);
    }

    /// Whether any active layer ignores the path. Matchers are rooted, so a
    /// nested layer never sees paths outside its directory.
    pub fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        self.matchers
            .iter()
            .any(|m| m.matched(path, is_dir).is_ignore())
    }
}

/// One-shot layered check for a single path (watcher event filtering):
/// collects ignore files on the chain root → parent-of-path.
pub fn is_path_ignored(root: &Path, ignore_file: &str, path: &Path) -> bool {
    let Ok(relative) = path.strip_prefix(root) else {
        return true;
    };

    let mut stack = IgnoreStack::default();
    stack.enter_dir(root, ignore_file);

    let mut dir = root.to_path_buf();
    let components: Vec<_> = relative.components().collect();
    for component in &components[..components.len().saturating_sub(1)] {
        dir.push(component);
        stack.enter_dir(&dir, ignore_file);
    }

    stack.is_ignored(path, path.is_dir())
}

// ============================================================================
// SCANNER
// ============================================================================

/// Recursive directory scanner
pub struct Scanner {
    root: PathBuf,
    config: IndexConfig,
}

impl Scanner {
    pub fn new(root: impl Into<PathBuf>, config: IndexConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    /// Scan the tree. The optional callback fires every 100 accepted files.
    pub fn scan(
        &self,
        mut progress: Option<&mut dyn FnMut(usize)>,
    ) -> std::io::Result<ScanReport> {
        let mut report = ScanReport::default();
        let mut ignores = IgnoreStack::default();
        self.walk(&self.root, &mut ignores, &mut report, &mut progress)?;

        tracing::debug!(
            files = report.files.len(),
            skipped = report.skipped_count,
            total_bytes = report.total_size,
            "Scan complete"
        );
        Ok(report)
    }

    fn walk(
        &self,
        dir: &Path,
        ignores: &mut IgnoreStack,
        report: &mut ScanReport,
        progress: &mut Option<&mut dyn FnMut(usize)>,
    ) -> std::io::Result<()> {
        let mark = ignores.enter_dir(dir, &self.config.ignore_file);

        let mut entries: Vec<_> = match std::fs::read_dir(dir) {
            Ok(iter) => iter.filter_map(|e| e.ok()).collect(),
            Err(e) => {
                // Per-directory read errors are non-fatal
                tracing::debug!(dir = %dir.display(), error = %e, "Unreadable directory skipped");
                ignores.leave_dir(mark);
                return Ok(());
            }
        };
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(_) => continue,
            };

            if file_type.is_dir() {
                if SKIP_DIRECTORIES.contains(&name.as_str()) || name.starts_with('.') {
                    continue;
                }
                if ignores.is_ignored(&path, true) {
                    continue;
                }
                self.walk(&path, ignores, report, progress)?;
                continue;
            }

            if !file_type.is_file() {
                continue;
            }

            if name.starts_with('.') || LOCKFILE_NAMES.contains(&name.as_str()) {
                report.skipped_count += 1;
                continue;
            }

            let extension = path
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            if BINARY_EXTENSIONS.contains(&extension.as_str()) {
                report.skipped_count += 1;
                continue;
            }
            let Some(language) = language_for_extension(&extension) else {
                report.skipped_count += 1;
                continue;
            };

            if ignores.is_ignored(&path, false) {
                report.skipped_count += 1;
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "Unstattable file skipped");
                    report.skipped_count += 1;
                    continue;
                }
            };
            let size = metadata.len();
            if size == 0 || size > self.config.max_file_size {
                report.skipped_count += 1;
                continue;
            }

            let mtime = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);

            let relative_path = path
                .strip_prefix(&self.root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");

            report.total_size += size;
            report.files.push(ScannedFile {
                path,
                relative_path,
                size,
                mtime,
                language: language.to_string(),
            });

            if let Some(callback) = progress.as_mut() {
                if report.files.len() % PROGRESS_EVERY == 0 {
                    callback(report.files.len());
                }
            }
        }

        ignores.leave_dir(mark);
        Ok(())
    }
}

// ============================================================================
// GITIGNORE HASH
// ============================================================================

/// Content hash of the project-level ignore files. A change triggers a full
/// re-scan instead of an incremental one.
pub fn gitignore_hash(root: &Path, ignore_file: &str) -> String {
    let mut combined = String::new();
    for name in [".gitignore", ignore_file] {
        if let Ok(content) = std::fs::read_to_string(root.join(name)) {
            combined.push_str(&content);
            combined.push('\n');
        }
    }
    format!("{:016x}", fnv1a64(combined.as_bytes()))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn scan(root: &Path) -> ScanReport {
        Scanner::new(root, IndexConfig::default()).scan(None).unwrap()
    }

    fn paths(report: &ScanReport) -> Vec<&str> {
        report.files.iter().map(|f| f.relative_path.as_str()).collect()
    }

    #[test]
    fn nested_ignore_applies_only_under_its_directory() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        write(root, "lib/.gitignore", "*.test.ts\n");
        write(root, "lib/utils.ts", "export const a = 1;");
        write(root, "lib/utils.test.ts", "test('a', () => {});");
        write(root, "app/main.test.ts", "test('b', () => {});");

        let report = scan(root);
        let found = paths(&report);
        assert!(found.contains(&"lib/utils.ts"));
        assert!(found.contains(&"app/main.test.ts"));
        assert!(!found.contains(&"lib/utils.test.ts"));
    }

    #[test]
    fn sibling_directory_is_unaffected_by_nested_ignore() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        write(root, "a/b/c/.gitignore", "secret.ts\n");
        write(root, "a/b/c/secret.ts", "const x = 1;");
        write(root, "a/b/d/secret.ts", "const y = 2;");

        let report = scan(root);
        let found = paths(&report);
        assert!(!found.contains(&"a/b/c/secret.ts"));
        assert!(found.contains(&"a/b/d/secret.ts"));
    }

    #[test]
    fn root_ignore_applies_everywhere() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        write(root, ".gitignore", "generated/\n*.min.js\n");
        write(root, "generated/out.ts", "const x = 1;");
        write(root, "src/app.min.js", "var a=1;");
        write(root, "src/app.js", "var a = 1;");

        let report = scan(root);
        let found = paths(&report);
        assert_eq!(found, vec!["src/app.js"]);
    }

    #[test]
    fn default_filters_drop_noise() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        write(root, "src/main.rs", "fn main() {}");
        write(root, "node_modules/pkg/index.js", "module.exports = {};");
        write(root, "target/debug/build.rs", "fn main() {}");
        write(root, "Cargo.lock", "[[package]]");
        write(root, "logo.png", "\u{1}\u{2}");
        write(root, "empty.rs", "");
        write(root, "notes.unknownext", "???");
        write(root, ".hidden.rs", "fn hidden() {}");

        let report = scan(root);
        assert_eq!(paths(&report), vec!["src/main.rs"]);
        assert!(report.skipped_count >= 5);
    }

    #[test]
    fn oversized_files_are_skipped() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        write(root, "big.rs", &"x".repeat(2 * 1024 * 1024));
        write(root, "small.rs", "fn ok() {}");

        let report = scan(root);
        assert_eq!(paths(&report), vec!["small.rs"]);
    }

    #[test]
    fn progress_fires_every_hundred_files() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        for i in 0..250 {
            write(root, &format!("src/file_{:03}.rs", i), "fn f() {}");
        }

        let mut calls = Vec::new();
        let mut callback = |n: usize| calls.push(n);
        Scanner::new(root, IndexConfig::default())
            .scan(Some(&mut callback))
            .unwrap();
        assert_eq!(calls, vec![100, 200]);
    }

    #[test]
    fn single_path_check_layers_like_the_scanner() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        write(root, "lib/.gitignore", "*.test.ts\n");
        write(root, "lib/utils.test.ts", "x");
        write(root, "app/main.test.ts", "x");

        assert!(is_path_ignored(root, ".mnemonignore", &root.join("lib/utils.test.ts")));
        assert!(!is_path_ignored(root, ".mnemonignore", &root.join("app/main.test.ts")));
        // Outside the root is never indexable
        assert!(is_path_ignored(root, ".mnemonignore", Path::new("/elsewhere/x.ts")));
    }

    #[test]
    fn gitignore_hash_tracks_content() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let before = gitignore_hash(root, ".mnemonignore");
        write(root, ".gitignore", "dist/\n");
        let after = gitignore_hash(root, ".mnemonignore");
        assert_ne!(before, after);
        assert_eq!(after, gitignore_hash(root, ".mnemonignore"));
    }

    #[test]
    fn scanned_files_carry_language_and_mtime() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        write(root, "src/app.py", "def main():\n    pass\n");

        let report = scan(root);
        assert_eq!(report.files.len(), 1);
        let file = &report.files[0];
        assert_eq!(file.language, "python");
        assert!(file.mtime > 0);
        assert_eq!(file.size, report.total_size);
    }
}
