//! Exclusion pattern matching.
//!
//! A pattern wrapped in `#` delimiters is a raw regular expression matched
//! case-sensitively. Anything else is a wildcard pattern: `*` matches any run
//! of characters, the match is anchored at the start of the subject only, and
//! case is ignored. Patterns that fail to compile never match.

use regex::Regex;
use tracing::debug;

const DELIMITER: char = '#';

/// Returns true when any pattern matches `subject`.
pub fn matches<S: AsRef<str>>(patterns: &[S], subject: &str) -> bool {
    patterns
        .iter()
        .any(|pattern| pattern_matches(pattern.as_ref(), subject))
}

pub fn pattern_matches(pattern: &str, subject: &str) -> bool {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return false;
    }

    match compile(pattern) {
        Ok(regex) => regex.is_match(subject),
        Err(err) => {
            debug!(
                op = "pattern::compile",
                pattern,
                error = %err,
                "Ignoring malformed exclusion pattern"
            );
            false
        }
    }
}

fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    if pattern.len() >= 2 && pattern.starts_with(DELIMITER) && pattern.ends_with(DELIMITER) {
        return Regex::new(&pattern[1..pattern.len() - 1]);
    }
    if pattern.len() == 1 && pattern.starts_with(DELIMITER) {
        return Err(regex::Error::Syntax("lone delimiter".to_string()));
    }

    let wildcard = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("(?i)^{wildcard}"))
}
