//! Build-error classification of process output
//!
//! Output is matched against an ordered list of pattern rules; the first rule
//! that matches names the failure. Matches are heuristics, not a verified
//! build outcome.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// One entry in the build-error log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildError {
    /// The raw output chunk that matched
    pub message: String,
    /// Name of the matching rule
    pub rule: String,
    pub severity: Severity,
}

/// Named case-insensitive pattern
#[derive(Debug, Clone)]
pub struct PatternRule {
    name: String,
    pattern: Regex,
    severity: Severity,
}

impl PatternRule {
    /// Rule from a regular expression, matched case-insensitively
    pub fn new(
        name: impl Into<String>,
        pattern: &str,
        severity: Severity,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.into(),
            pattern: RegexBuilder::new(pattern).case_insensitive(true).build()?,
            severity,
        })
    }

    /// Rule matching `needle` literally
    pub fn literal(
        name: impl Into<String>,
        needle: &str,
        severity: Severity,
    ) -> Result<Self, regex::Error> {
        Self::new(name, &regex::escape(needle), severity)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }
}

/// Most specific signatures first; the bare `Error:` prefix is the fallback
static DEFAULT_RULES: Lazy<Vec<PatternRule>> = Lazy::new(|| {
    [
        ("missing-module", regex::escape("Cannot find module")),
        ("unresolved-import", regex::escape("Failed to resolve import")),
        ("type-error", regex::escape("TypeError")),
        ("reference-error", regex::escape("ReferenceError")),
        ("syntax-error", r"syntax\s?error".to_string()),
        ("error-prefix", regex::escape("Error:")),
    ]
    .into_iter()
    .map(|(name, pattern)| {
        PatternRule::new(name, &pattern, Severity::Error).expect("valid built-in pattern")
    })
    .collect()
});

/// Decides whether a chunk of process output signals a failure
pub trait OutputClassifier: Send + Sync {
    /// Classify one output chunk, returning the matching rule's name and severity
    fn classify(&self, text: &str) -> Option<(String, Severity)>;
}

/// Ordered pattern rules; the first match wins
#[derive(Debug, Clone)]
pub struct RuleClassifier {
    rules: Vec<PatternRule>,
}

impl RuleClassifier {
    pub fn new(rules: Vec<PatternRule>) -> Self {
        Self { rules }
    }

    /// Built-in failure signatures
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_RULES.clone())
    }

    /// Built-in signatures followed by user-supplied patterns
    pub fn with_extra_patterns(patterns: &[String]) -> Result<Self, regex::Error> {
        let mut classifier = Self::with_defaults();
        for (i, pattern) in patterns.iter().enumerate() {
            classifier.push(PatternRule::new(
                format!("custom-{}", i + 1),
                pattern,
                Severity::Error,
            )?);
        }
        Ok(classifier)
    }

    /// Append a rule with the lowest precedence
    pub fn push(&mut self, rule: PatternRule) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[PatternRule] {
        &self.rules
    }
}

impl Default for RuleClassifier {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl OutputClassifier for RuleClassifier {
    fn classify(&self, text: &str) -> Option<(String, Severity)> {
        self.rules
            .iter()
            .find(|rule| rule.is_match(text))
            .map(|rule| (rule.name.clone(), rule.severity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_for(text: &str) -> Option<String> {
        RuleClassifier::default().classify(text).map(|(rule, _)| rule)
    }

    #[test]
    fn test_specific_rule_wins_over_prefix() {
        assert_eq!(
            rule_for("Error: Cannot find module 'x'").as_deref(),
            Some("missing-module")
        );
        assert_eq!(
            rule_for("Uncaught TypeError: a is undefined").as_deref(),
            Some("type-error")
        );
        assert_eq!(rule_for("Error: boom").as_deref(), Some("error-prefix"));
    }

    #[test]
    fn test_matching_is_case_insensitive() {
        assert_eq!(
            rule_for("[vite] failed to resolve import \"./App\"").as_deref(),
            Some("unresolved-import")
        );
        assert_eq!(rule_for("SYNTAX ERROR at line 3").as_deref(), Some("syntax-error"));
        assert_eq!(rule_for("SyntaxError: Unexpected token").as_deref(), Some("syntax-error"));
    }

    #[test]
    fn test_clean_output_is_not_classified() {
        assert_eq!(rule_for("added 120 packages in 3s"), None);
        assert_eq!(rule_for("0 errors, 0 warnings"), None);
    }

    #[test]
    fn test_extra_patterns_run_after_defaults() {
        let classifier =
            RuleClassifier::with_extra_patterns(&["panicked at".to_string()]).unwrap();
        assert_eq!(
            classifier.classify("thread 'main' panicked at src/main.rs"),
            Some(("custom-1".to_string(), Severity::Error))
        );
        assert!(RuleClassifier::with_extra_patterns(&["(".to_string()]).is_err());
    }

    #[test]
    fn test_custom_warning_rule() {
        let mut classifier = RuleClassifier::new(Vec::new());
        classifier.push(PatternRule::literal("deprecation", "deprecated", Severity::Warning).unwrap());
        assert_eq!(
            classifier.classify("npm WARN deprecated inflight@1.0.6"),
            Some(("deprecation".to_string(), Severity::Warning))
        );
    }
}
