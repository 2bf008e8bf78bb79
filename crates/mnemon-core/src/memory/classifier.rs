//! Sector classification and content extraction
//!
//! Scores each sector by counting case-insensitive keyword-pattern matches
//! over the content. Ties break by the fixed priority
//! emotional > reflective > episodic > procedural > semantic; when nothing
//! matches, semantic is the default.

use std::sync::LazyLock;

use regex::Regex;

use super::types::Sector;

fn pattern(re: &str) -> Regex {
    Regex::new(&format!("(?i){re}")).expect("classifier pattern compiles")
}

static EMOTIONAL: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        pattern(r"frustrat|annoy|irritat"),
        pattern(r"\b(love[sd]?|hate[sd]?|enjoy(s|ed)?)\b"),
        pattern(r"\b(angry|upset|anxious|worried|stressed)\b"),
        pattern(r"\b(happy|excited|thrilled|relieved|glad)\b"),
        pattern(r"\b(confus(ing|ed)|overwhelm(ing|ed))\b"),
    ]
});

static REFLECTIVE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        pattern(r"\b(favors?|favoured?|prefer(s|red)?)\b"),
        pattern(r"\b(convention|principle|philosophy|style)\b"),
        pattern(r"\b(insight|lesson|learned|realiz(ed|ation))\b"),
        pattern(r"\btends? to\b|\bin hindsight\b|\bin general\b"),
        pattern(r"\b(pattern|approach) (of|is|here)\b"),
    ]
});

static EPISODIC: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        pattern(r"\buser\b|\bwe\b"),
        pattern(r"\b(asked|said|told|mentioned|discussed|reported|requested)\b"),
        pattern(r"\b(yesterday|today|earlier|last (week|session)|this session)\b"),
        pattern(r"\b(happened|occurred|during the)\b"),
    ]
});

static PROCEDURAL: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        pattern(r"\b(first|then|next|finally|afterwards)\b"),
        pattern(r"\bstep \d|\bsteps\b"),
        pattern(r"\b(run|install|deploy|build|compile|execute|restart)\b"),
        pattern(r"\bhow to\b|\bin order to\b|^to \w+:"),
    ]
});

static SEMANTIC: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        pattern(r"\bis (located|defined|stored|configured) (in|at|under)\b"),
        pattern(r"\b(refers to|consists of|represents|maps to)\b"),
        pattern(r"[\w./-]+\.(ts|tsx|js|jsx|py|rs|go|java|rb|c|cpp|h|hpp|sql|toml|yaml|json)\b"),
    ]
});

/// Tie-break priority, strongest claim first
const PRIORITY: [Sector; 5] = [
    Sector::Emotional,
    Sector::Reflective,
    Sector::Episodic,
    Sector::Procedural,
    Sector::Semantic,
];

fn score(patterns: &[Regex], content: &str) -> usize {
    patterns.iter().map(|re| re.find_iter(content).count()).sum()
}

/// Classify content into a sector
pub fn classify_sector(content: &str) -> Sector {
    let scores = [
        (Sector::Emotional, score(&EMOTIONAL, content)),
        (Sector::Reflective, score(&REFLECTIVE, content)),
        (Sector::Episodic, score(&EPISODIC, content)),
        (Sector::Procedural, score(&PROCEDURAL, content)),
        (Sector::Semantic, score(&SEMANTIC, content)),
    ];

    let best = scores.iter().map(|(_, n)| *n).max().unwrap_or(0);
    if best == 0 {
        return Sector::Semantic;
    }

    // PRIORITY is ordered, so the first sector at the best score wins ties
    for sector in PRIORITY {
        if scores.iter().any(|(s, n)| *s == sector && *n == best) {
            return sector;
        }
    }
    Sector::Semantic
}

// ============================================================================
// CONCEPT / FILE EXTRACTION
// ============================================================================

/// Longest concepts list worth persisting
const MAX_CONCEPTS: usize = 10;

static BACKTICKED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([^`\n]{2,64})`").expect("backtick pattern compiles"));

static CAMEL_CASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Z][a-z0-9]+(?:[A-Z][a-z0-9]+)+\b").expect("camel pattern compiles")
});

static SNAKE_IDENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[a-z][a-z0-9]*(?:_[a-z0-9]+)+\b").expect("snake pattern compiles")
});

static FILE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b[\w.-]+(?:/[\w.-]+)*\.(?:ts|tsx|js|jsx|py|rs|go|java|rb|php|c|h|cpp|hpp|css|html|json|yaml|yml|toml|md|sql|sh)\b",
    )
    .expect("file pattern compiles")
});

/// Extract identifier-like concepts from content, deduplicated, bounded
pub fn extract_concepts(content: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |candidate: &str| {
        let candidate = candidate.trim();
        if candidate.len() < 3 || out.iter().any(|c| c == candidate) {
            return;
        }
        out.push(candidate.to_string());
    };

    for capture in BACKTICKED.captures_iter(content) {
        if let Some(m) = capture.get(1) {
            push(m.as_str());
        }
    }
    for m in CAMEL_CASE.find_iter(content) {
        push(m.as_str());
    }
    for m in SNAKE_IDENT.find_iter(content) {
        push(m.as_str());
    }

    out.truncate(MAX_CONCEPTS);
    out
}

/// Extract file paths mentioned in content
pub fn extract_files(content: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for m in FILE_PATH.find_iter(content) {
        let path = m.as_str().to_string();
        if !out.contains(&path) {
            out.push(path);
        }
    }
    out
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_about_event_is_episodic() {
        assert_eq!(classify_sector("User asked about testing"), Sector::Episodic);
    }

    #[test]
    fn step_sequence_is_procedural() {
        assert_eq!(
            classify_sector("To deploy: first run build, then push to main"),
            Sector::Procedural
        );
    }

    #[test]
    fn location_fact_is_semantic() {
        assert_eq!(
            classify_sector("The auth handler is located in src/auth/handler.ts"),
            Sector::Semantic
        );
    }

    #[test]
    fn affect_is_emotional() {
        assert_eq!(classify_sector("Frustrated by slow tests"), Sector::Emotional);
    }

    #[test]
    fn meta_observation_is_reflective() {
        assert_eq!(
            classify_sector("This codebase favors composition over inheritance"),
            Sector::Reflective
        );
    }

    #[test]
    fn no_signal_defaults_to_semantic() {
        assert_eq!(
            classify_sector("The function returns a string"),
            Sector::Semantic
        );
    }

    #[test]
    fn tie_break_prefers_emotional() {
        // One emotional and one episodic match each; emotional outranks
        assert_eq!(
            classify_sector("User is frustrated"),
            Sector::Emotional
        );
    }

    #[test]
    fn concepts_pick_up_identifiers() {
        let concepts =
            extract_concepts("Use `tokio::spawn` inside RequestHandler to call fetch_user");
        assert!(concepts.iter().any(|c| c == "tokio::spawn"));
        assert!(concepts.iter().any(|c| c == "RequestHandler"));
        assert!(concepts.iter().any(|c| c == "fetch_user"));
    }

    #[test]
    fn concepts_are_deduplicated_and_bounded() {
        let text = "fetch_user fetch_user fetch_user";
        assert_eq!(extract_concepts(text), vec!["fetch_user".to_string()]);

        let many: String = (0..30).map(|i| format!("concept_number{} ", i)).collect();
        assert!(extract_concepts(&many).len() <= MAX_CONCEPTS);
    }

    #[test]
    fn files_are_extracted() {
        let files = extract_files("Fixed src/auth/handler.ts and updated config/dev.yaml");
        assert_eq!(files, vec!["src/auth/handler.ts", "config/dev.yaml"]);
    }

    #[test]
    fn plain_prose_yields_no_files() {
        assert!(extract_files("Nothing filesystem-shaped here").is_empty());
    }
}
