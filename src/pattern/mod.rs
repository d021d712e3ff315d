use regex::Regex;

/// A wildcard pattern compiled to an anchored regex, with a priority used to
/// break ties when more than one pattern matches the same key.
///
/// `*` matches any run of characters (greedy). Priority: patterns with no
/// wildcard are treated as priority 100; otherwise `10*segments - 5*wildcards`
/// where segments are colon-separated components of the pattern.
pub struct CompiledPattern {
    pub literal: String,
    pub priority: i64,
    regex: Regex,
}

impl CompiledPattern {
    pub fn compile(literal: &str, priority: Option<i64>) -> Result<Self, String> {
        let priority = priority.unwrap_or_else(|| priority_of(literal));
        let escaped = regex::escape(literal).replace(r"\*", ".*");
        let pattern = format!("^{escaped}$");
        let regex = Regex::new(&pattern).map_err(|e| e.to_string())?;
        Ok(Self {
            literal: literal.to_string(),
            priority,
            regex,
        })
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }
}

/// Priority formula from the resolver's pattern tie-break rule: no wildcard
/// is treated as an exact match (100); otherwise more segments and fewer
/// wildcards both raise specificity.
pub fn priority_of(pattern: &str) -> i64 {
    if !pattern.contains('*') {
        return 100;
    }
    let segments = pattern.split(':').count() as i64;
    let wildcards = pattern.matches('*').count() as i64;
    10 * segments - 5 * wildcards
}

/// Select the highest-priority pattern among `patterns` that matches `key`.
/// Ties are broken by the order patterns appear in `patterns` (stable, but
/// callers should not register two equal-priority patterns that both match
/// the same key and expect a particular winner).
pub fn find_best_match<'a>(key: &str, patterns: &'a [CompiledPattern]) -> Option<&'a CompiledPattern> {
    patterns
        .iter()
        .filter(|p| p.matches(key))
        .max_by_key(|p| p.priority)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_literal_gets_priority_100() {
        assert_eq!(priority_of("user:123"), 100);
    }

    #[test]
    fn more_segments_and_fewer_wildcards_raise_priority() {
        let broad = priority_of("user:*");
        let narrow = priority_of("user:premium:*");
        assert!(narrow > broad, "{narrow} should exceed {broad}");
    }

    #[test]
    fn wildcard_matches_any_run() {
        let p = CompiledPattern::compile("user:*:read", None).unwrap();
        assert!(p.matches("user:42:read"));
        assert!(p.matches("user::read"));
        assert!(!p.matches("user:42:write"));
    }

    #[test]
    fn find_best_match_prefers_higher_priority() {
        let low = CompiledPattern::compile("user:*", Some(10)).unwrap();
        let high = CompiledPattern::compile("user:premium:*", Some(50)).unwrap();
        let patterns = vec![low, high];

        let best = find_best_match("user:premium:42", &patterns).unwrap();
        assert_eq!(best.literal, "user:premium:*");

        let best = find_best_match("user:free:42", &patterns).unwrap();
        assert_eq!(best.literal, "user:*");
    }

    #[test]
    fn find_best_match_returns_none_when_nothing_matches() {
        let patterns = vec![CompiledPattern::compile("user:*", None).unwrap()];
        assert!(find_best_match("order:1", &patterns).is_none());
    }
}
