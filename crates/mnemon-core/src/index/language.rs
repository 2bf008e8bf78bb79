//! Language detection and file-class tables for the scanner

/// Map a file extension to its language tag. Unknown extensions return
/// `None` and the scanner skips the file.
pub fn language_for_extension(ext: &str) -> Option<&'static str> {
    let language = match ext.to_lowercase().as_str() {
        "ts" => "typescript",
        "tsx" => "typescriptreact",
        "js" | "mjs" | "cjs" => "javascript",
        "jsx" => "javascriptreact",
        "py" => "python",
        "rs" => "rust",
        "go" => "go",
        "java" => "java",
        "c" | "h" => "c",
        "cpp" | "cc" | "cxx" | "hpp" => "cpp",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "kt" | "kts" => "kotlin",
        "scala" => "scala",
        "sh" | "bash" | "zsh" => "shell",
        "sql" => "sql",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "md" | "markdown" => "markdown",
        "css" | "scss" | "less" => "css",
        "html" | "htm" => "html",
        "vue" => "vue",
        "svelte" => "svelte",
        "xml" => "xml",
        "txt" => "plaintext",
        _ => return None,
    };
    Some(language)
}

/// Whether the language is source code (as opposed to prose/config).
/// Drives the `is_code` document flag and embedding-reuse policy.
pub fn is_code_language(language: &str) -> bool {
    !matches!(language, "markdown" | "plaintext")
}

/// Extensions that are always binary, never worth reading
pub const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "ico", "bmp", "svg", "pdf", "zip", "tar", "gz", "bz2",
    "xz", "7z", "rar", "exe", "dll", "so", "dylib", "a", "o", "class", "jar", "war", "woff",
    "woff2", "ttf", "otf", "eot", "mp3", "mp4", "avi", "mov", "wav", "flac", "wasm", "db",
    "sqlite", "bin", "dat", "pyc", "node",
];

/// Generated lockfiles: huge, mechanical, useless for retrieval
pub const LOCKFILE_NAMES: &[&str] = &[
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "Cargo.lock",
    "poetry.lock",
    "Pipfile.lock",
    "Gemfile.lock",
    "composer.lock",
    "go.sum",
    "flake.lock",
];

/// Directories never descended into
pub const SKIP_DIRECTORIES: &[&str] = &[
    "node_modules",
    ".git",
    "dist",
    "build",
    "out",
    "coverage",
    "__pycache__",
    "target",
    "vendor",
    ".next",
    ".venv",
    "venv",
];
