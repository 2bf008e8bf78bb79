//! Boundary-aware line chunker with symbol extraction
//!
//! Splits source files into chunks that respect declaration boundaries where
//! the language is recognized, and fall back to blank-line / block-close
//! break points elsewhere. Chunks carry 1-based inclusive line spans, a
//! coarse type tag, extracted symbols, and a `len/4` token estimate.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Preferred chunk length in lines
pub const TARGET_LINES: usize = 50;

/// Hard ceiling per chunk
pub const MAX_LINES: usize = 100;

/// Never start a chunk shorter than this when a boundary is available
pub const MIN_LINES: usize = 5;

/// Rough chars-per-token ratio for the token estimate
pub const CHARS_PER_TOKEN: usize = 4;

// ============================================================================
// TYPES
// ============================================================================

/// Coarse chunk classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Function,
    Class,
    Imports,
    #[default]
    Block,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkType::Function => "function",
            ChunkType::Class => "class",
            ChunkType::Imports => "imports",
            ChunkType::Block => "block",
        }
    }
}

/// A contiguous span of a source file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeChunk {
    pub content: String,
    /// 1-based, inclusive
    pub start_line: usize,
    /// 1-based, inclusive
    pub end_line: usize,
    pub chunk_type: ChunkType,
    pub symbols: Vec<String>,
    pub tokens_estimate: usize,
}

// ============================================================================
// BOUNDARY PATTERNS
// ============================================================================

struct BoundaryPattern {
    regex: Regex,
    chunk_type: ChunkType,
}

fn boundary(re: &str, chunk_type: ChunkType) -> BoundaryPattern {
    BoundaryPattern {
        regex: Regex::new(re).expect("boundary pattern compiles"),
        chunk_type,
    }
}

static TS_PATTERNS: LazyLock<Vec<BoundaryPattern>> = LazyLock::new(|| {
    vec![
        boundary(
            r"^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s*\*?\s*([A-Za-z_$][\w$]*)",
            ChunkType::Function,
        ),
        boundary(
            r"^\s*(?:export\s+)?const\s+([A-Za-z_$][\w$]*)\s*=\s*(?:async\s*)?\(",
            ChunkType::Function,
        ),
        boundary(
            r"^\s*(?:export\s+)?(?:abstract\s+)?class\s+([A-Za-z_$][\w$]*)",
            ChunkType::Class,
        ),
        boundary(
            r"^\s*(?:export\s+)?(?:interface|enum)\s+([A-Za-z_$][\w$]*)",
            ChunkType::Class,
        ),
        boundary(r"^\s*import\s", ChunkType::Imports),
    ]
});

static PY_PATTERNS: LazyLock<Vec<BoundaryPattern>> = LazyLock::new(|| {
    vec![
        boundary(r"^\s*(?:async\s+)?def\s+([A-Za-z_]\w*)", ChunkType::Function),
        boundary(r"^\s*class\s+([A-Za-z_]\w*)", ChunkType::Class),
        boundary(r"^(?:import|from)\s", ChunkType::Imports),
    ]
});

static RUST_PATTERNS: LazyLock<Vec<BoundaryPattern>> = LazyLock::new(|| {
    vec![
        boundary(
            r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?(?:unsafe\s+)?fn\s+([A-Za-z_]\w*)",
            ChunkType::Function,
        ),
        boundary(
            r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:struct|enum|trait)\s+([A-Za-z_]\w*)",
            ChunkType::Class,
        ),
        boundary(r"^\s*impl\b(?:.*\bfor\s+)?\s*([A-Za-z_]\w*)?", ChunkType::Class),
        boundary(r"^\s*(?:pub\s+)?use\s", ChunkType::Imports),
    ]
});

static GO_PATTERNS: LazyLock<Vec<BoundaryPattern>> = LazyLock::new(|| {
    vec![
        boundary(
            r"^func\s+(?:\([^)]*\)\s*)?([A-Za-z_]\w*)",
            ChunkType::Function,
        ),
        boundary(r"^type\s+([A-Za-z_]\w*)", ChunkType::Class),
        boundary(r"^import\b", ChunkType::Imports),
    ]
});

static JAVA_PATTERNS: LazyLock<Vec<BoundaryPattern>> = LazyLock::new(|| {
    vec![
        boundary(
            r"^\s*(?:public|private|protected)?\s*(?:abstract\s+|final\s+)?(?:class|interface|enum)\s+([A-Za-z_]\w*)",
            ChunkType::Class,
        ),
        boundary(r"^import\s", ChunkType::Imports),
    ]
});

static NO_PATTERNS: LazyLock<Vec<BoundaryPattern>> = LazyLock::new(Vec::new);

fn patterns_for(language: &str) -> &'static [BoundaryPattern] {
    match language {
        "typescript" | "typescriptreact" | "javascript" | "javascriptreact" => &TS_PATTERNS,
        "python" => &PY_PATTERNS,
        "rust" => &RUST_PATTERNS,
        "go" => &GO_PATTERNS,
        "java" | "kotlin" | "scala" => &JAVA_PATTERNS,
        _ => &NO_PATTERNS,
    }
}

// ============================================================================
// CHUNKING
// ============================================================================

/// Chunk a file's content under its language tag
pub fn chunk_file(content: &str, language: &str) -> Vec<CodeChunk> {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return Vec::new();
    }

    let patterns = patterns_for(language);

    if lines.len() <= MAX_LINES {
        return vec![make_chunk(&lines, 0, lines.len(), patterns)];
    }

    // Boundary lines: indices at which a new declaration starts
    let boundaries: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| patterns.iter().any(|p| p.regex.is_match(line)))
        .map(|(i, _)| i)
        .collect();

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < lines.len() {
        let remaining = lines.len() - start;
        if remaining <= MAX_LINES {
            chunks.push(make_chunk(&lines, start, lines.len(), patterns));
            break;
        }

        let window_end = start + MAX_LINES;
        let in_window: Vec<usize> = boundaries
            .iter()
            .copied()
            .filter(|&b| b > start && b <= window_end)
            .collect();

        // Prefer the first boundary at or past the target, else the last one
        // past the minimum, else scan for a textual break point
        let next = in_window
            .iter()
            .copied()
            .find(|&b| b >= start + TARGET_LINES)
            .or_else(|| {
                in_window
                    .iter()
                    .copied()
                    .filter(|&b| b >= start + MIN_LINES)
                    .next_back()
            })
            .unwrap_or_else(|| find_best_break_point(&lines, start));

        chunks.push(make_chunk(&lines, start, next, patterns));
        start = next;
    }

    chunks
}

/// Forward from the target to the window end looking for an empty line or a
/// block close, then backward down to the minimum. Falls back to a hard cut
/// at the window end. All scans are bounded by the line count.
fn find_best_break_point(lines: &[&str], start: usize) -> usize {
    let window_end = (start + MAX_LINES).min(lines.len());
    let target = (start + TARGET_LINES).min(window_end);
    let floor = (start + MIN_LINES).min(window_end);

    for i in target..window_end {
        if is_break_line(lines[i]) {
            return i + 1;
        }
    }
    for i in (floor..target).rev() {
        if is_break_line(lines[i]) {
            return i + 1;
        }
    }
    window_end
}

fn is_break_line(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed == "}" || trimmed == "};" || trimmed == "end"
}

fn make_chunk(
    lines: &[&str],
    start: usize,
    end: usize,
    patterns: &[BoundaryPattern],
) -> CodeChunk {
    let slice = &lines[start..end];
    let content = slice.join("\n");

    // Type comes from the first few lines; symbols from the whole chunk
    let chunk_type = slice
        .iter()
        .take(3)
        .find_map(|line| {
            patterns
                .iter()
                .find(|p| p.regex.is_match(line))
                .map(|p| p.chunk_type)
        })
        .unwrap_or_default();

    let mut symbols: Vec<String> = Vec::new();
    for line in slice {
        for pattern in patterns {
            if let Some(captures) = pattern.regex.captures(line) {
                if let Some(symbol) = captures.get(1) {
                    let symbol = symbol.as_str().to_string();
                    if !symbols.contains(&symbol) {
                        symbols.push(symbol);
                    }
                }
            }
        }
    }

    let tokens_estimate = content.len().div_ceil(CHARS_PER_TOKEN);

    CodeChunk {
        content,
        start_line: start + 1,
        end_line: end,
        chunk_type,
        symbols,
        tokens_estimate,
    }
}

// ============================================================================
// TESTS
// ============================================================================
