//! Wildcard pattern matchers
//!
//! Patterns other than `prefix + ">"` are compiled once on first subscribe
//! and tested against each published subject that shares their prefix.

use super::error::RegistryError;

/// Compiled wildcard pattern
pub trait PatternMatcher: Send + Sync {
    /// True if the whole subject matches
    fn is_match(&self, subject: &[u8]) -> bool;
}

/// Turns pattern text into a matcher
pub trait PatternCompiler: Send + Sync {
    fn compile(&self, pattern: &[u8]) -> Result<Box<dyn PatternMatcher>, RegistryError>;
}

/// Compiles patterns to anchored byte regexes
#[derive(Debug, Default, Clone, Copy)]
pub struct RegexCompiler;

struct RegexMatcher(regex::bytes::Regex);

impl PatternMatcher for RegexMatcher {
    fn is_match(&self, subject: &[u8]) -> bool {
        self.0.is_match(subject)
    }
}

impl PatternCompiler for RegexCompiler {
    fn compile(&self, pattern: &[u8]) -> Result<Box<dyn PatternMatcher>, RegistryError> {
        let text = std::str::from_utf8(pattern)
            .map_err(|_| RegistryError::BadPattern(String::from_utf8_lossy(pattern).into()))?;
        let source = pattern_to_regex(text);
        let re = regex::bytes::Regex::new(&source)
            .map_err(|e| RegistryError::BadPattern(format!("{}: {}", text, e)))?;
        Ok(Box::new(RegexMatcher(re)))
    }
}

/// Translate a subject pattern into regex source
///
/// `*` segments match one non-empty segment, a trailing `>` matches the
/// rest of the subject, everything else is literal. Wildcards match raw
/// bytes so subjects need not be UTF-8.
pub fn pattern_to_regex(pattern: &str) -> String {
    let segments: Vec<&str> = pattern.split('.').collect();
    let last = segments.len() - 1;
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');
    for (i, seg) in segments.iter().enumerate() {
        if i > 0 {
            out.push_str(r"\.");
        }
        match *seg {
            "*" => out.push_str("(?-u:[^.])+"),
            ">" if i == last => out.push_str("(?-u:.)+"),
            lit => out.push_str(&regex::escape(lit)),
        }
    }
    out.push('$');
    out
}
