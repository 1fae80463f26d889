//! Failure-output pattern matching against recovery rules.
//!
//! Rules are data: new recovery behaviors are added by appending rules to the
//! settings, never by branching here.

use regex::Regex;
use tracing::warn;

use cronflow_types::AutoFixRule;

const PACKAGE_PLACEHOLDER: &str = "{package}";

/// A matched rule and the remediation command it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoFixMatch {
    pub rule: AutoFixRule,
    pub parameter: Option<String>,
    pub command: String,
}

struct CompiledRule {
    rule: AutoFixRule,
    pattern: Regex,
    extract: Option<Regex>,
}

/// Compiled, enabled rules in declaration order.
pub struct AutoFixEngine {
    rules: Vec<CompiledRule>,
}

impl AutoFixEngine {
    /// Compile the enabled rules. Rules with invalid regexes are skipped.
    pub fn new(rules: &[AutoFixRule]) -> Self {
        let rules = rules
            .iter()
            .filter(|rule| rule.enabled)
            .filter_map(|rule| {
                let pattern = match Regex::new(&rule.pattern) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(rule = %rule.id, "Skipping auto-fix rule with invalid pattern: {e}");
                        return None;
                    }
                };
                let extract = match rule.extract_package.as_deref().map(Regex::new) {
                    Some(Ok(re)) => Some(re),
                    Some(Err(e)) => {
                        warn!(rule = %rule.id, "Skipping auto-fix rule with invalid extractor: {e}");
                        return None;
                    }
                    None => None,
                };
                Some(CompiledRule {
                    rule: rule.clone(),
                    pattern,
                    extract,
                })
            })
            .collect();
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First rule whose pattern matches the combined output wins.
    ///
    /// A rule with an extraction step that yields nothing does not match.
    pub fn find_fix(&self, stdout: &str, stderr: &str) -> Option<AutoFixMatch> {
        let combined = format!("{stdout}\n{stderr}");

        self.rules.iter().find_map(|compiled| {
            if !compiled.pattern.is_match(&combined) {
                return None;
            }

            let parameter = match &compiled.extract {
                Some(extract) => {
                    let value = extract
                        .captures(&combined)
                        .and_then(|caps| caps.get(1))
                        .map(|m| m.as_str().trim().to_string())
                        .filter(|v| !v.is_empty())?;
                    Some(value)
                }
                None => None,
            };

            let command = match &parameter {
                Some(value) => compiled.rule.fix.replace(PACKAGE_PLACEHOLDER, value),
                None => compiled.rule.fix.clone(),
            };

            Some(AutoFixMatch {
                rule: compiled.rule.clone(),
                parameter,
                command,
            })
        })
    }
}
