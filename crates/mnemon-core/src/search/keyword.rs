//! Keyword search support: FTS5 query sanitization and BM25 normalization
//!
//! Raw user queries cannot be handed to FTS5 verbatim: operators like `"`,
//! `-`, `NEAR` and stray parentheses are syntax there. Queries are reduced to
//! quoted prefix tokens joined by implicit AND.

/// Sanitize a free-text query into an FTS5 MATCH expression of prefixed
/// tokens: `rate limiter` → `"rate"* "limiter"*`. Returns an empty string
/// when nothing tokenizable remains.
pub fn sanitize_fts_query(query: &str) -> String {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"*", t.to_lowercase()))
        .collect();
    tokens.join(" ")
}

/// Map a raw FTS5 BM25 rank onto `[0, 1]`.
///
/// SQLite's `rank` is negative with better matches more negative; this maps
/// rank 0 to 0.0 and grows monotonically toward 1.0.
pub fn normalize_rank(rank: f64) -> f64 {
    let score = (-rank).max(0.0);
    score / (1.0 + score)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_become_quoted_prefixes() {
        assert_eq!(sanitize_fts_query("rate limiter"), "\"rate\"* \"limiter\"*");
    }

    #[test]
    fn operators_are_stripped() {
        assert_eq!(
            sanitize_fts_query("NEAR(\"foo\" -bar) OR baz"),
            "\"near\"* \"foo\"* \"bar\"* \"or\"* \"baz\"*"
        );
    }

    #[test]
    fn identifiers_keep_underscores() {
        assert_eq!(sanitize_fts_query("fetch_user"), "\"fetch_user\"*");
    }

    #[test]
    fn empty_and_symbolic_queries_yield_empty() {
        assert_eq!(sanitize_fts_query(""), "");
        assert_eq!(sanitize_fts_query("!!! ???"), "");
    }

    #[test]
    fn normalize_is_monotone_and_bounded() {
        assert_eq!(normalize_rank(0.0), 0.0);
        let better = normalize_rank(-8.0);
        let worse = normalize_rank(-1.0);
        assert!(better > worse);
        assert!(better < 1.0);
        // Positive ranks (shouldn't happen) clamp to zero
        assert_eq!(normalize_rank(3.0), 0.0);
    }
}
