//! Error rules and the line matcher
//!
//! Configuration supplies loose [`RuleSpec`] records. They are validated once
//! into [`ErrorRule`]s by [`compile_rules`]; bad records are reported to the
//! sink and dropped, so the matcher itself only ever sees well-formed rules.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{HarnessError, Result};
use crate::sink::{Level, LogSink};

/// Exit code used when a fatal rule does not configure its own
pub const DEFAULT_FATAL_EXIT_CODE: i32 = -1;

/// An error rule as written in configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Plain text to look for anywhere in the line
    #[serde(default, alias = "substr", skip_serializing_if = "Option::is_none")]
    pub substring: Option<String>,
    /// Regular expression searched for anywhere in the line
    #[serde(default, alias = "regex", skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default)]
    pub level: Level,
    /// `"before:after"` window of neighbouring lines to emit with a match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_lines: Option<String>,
    /// Exit code for the harness when a fatal rule fires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl RuleSpec {
    pub fn substring(text: impl Into<String>, level: Level) -> Self {
        Self {
            substring: Some(text.into()),
            level,
            ..Default::default()
        }
    }

    pub fn pattern(pattern: impl Into<String>, level: Level) -> Self {
        Self {
            pattern: Some(pattern.into()),
            level,
            ..Default::default()
        }
    }
}

/// How a rule recognises a line
#[derive(Debug, Clone)]
pub enum RuleMatch {
    Substring(String),
    Pattern(Regex),
}

/// Number of neighbouring lines emitted alongside a match
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextLines {
    pub before: usize,
    pub after: usize,
}

impl FromStr for ContextLines {
    type Err = HarnessError;

    /// Parses `"B:A"`, where either side may be empty (`"20:"`, `":3"`)
    fn from_str(s: &str) -> Result<Self> {
        let (before, after) = s
            .split_once(':')
            .ok_or_else(|| HarnessError::Rule(format!("context_lines '{}' is not 'before:after'", s)))?;

        let parse = |part: &str| -> Result<usize> {
            let part = part.trim();
            if part.is_empty() {
                return Ok(0);
            }
            part.parse::<usize>()
                .map_err(|e| HarnessError::Rule(format!("context_lines '{}': {}", s, e)))
        };

        Ok(Self {
            before: parse(before)?,
            after: parse(after)?,
        })
    }
}

/// A validated rule classifying one line of output
#[derive(Debug, Clone)]
pub struct ErrorRule {
    matcher: RuleMatch,
    level: Level,
    context: ContextLines,
    exit_code: Option<i32>,
}

impl ErrorRule {
    /// Rule matching `text` anywhere in a line
    pub fn substring(text: impl Into<String>, level: Level) -> Self {
        Self {
            matcher: RuleMatch::Substring(text.into()),
            level,
            context: ContextLines::default(),
            exit_code: None,
        }
    }

    /// Rule matching an unanchored regular expression
    pub fn pattern(pattern: &str, level: Level) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| HarnessError::Rule(format!("invalid pattern '{}': {}", pattern, e)))?;
        Ok(Self {
            matcher: RuleMatch::Pattern(regex),
            level,
            context: ContextLines::default(),
            exit_code: None,
        })
    }

    pub fn with_context(mut self, context: ContextLines) -> Self {
        self.context = context;
        self
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn context(&self) -> ContextLines {
        self.context
    }

    /// Exit code to terminate with when this rule fires at fatal level
    pub fn fatal_exit_code(&self) -> i32 {
        self.exit_code.unwrap_or(DEFAULT_FATAL_EXIT_CODE)
    }

    pub fn is_match(&self, line: &str) -> bool {
        match &self.matcher {
            RuleMatch::Substring(text) => line.contains(text.as_str()),
            RuleMatch::Pattern(regex) => regex.is_match(line),
        }
    }
}

impl TryFrom<&RuleSpec> for ErrorRule {
    type Error = HarnessError;

    fn try_from(spec: &RuleSpec) -> Result<Self> {
        let rule = match (&spec.substring, &spec.pattern) {
            (Some(text), None) => ErrorRule::substring(text.clone(), spec.level),
            (None, Some(pattern)) => ErrorRule::pattern(pattern, spec.level)?,
            (Some(_), Some(_)) => {
                return Err(HarnessError::Rule(
                    "both 'substring' and 'pattern' set; exactly one is allowed".to_string(),
                ));
            }
            (None, None) => {
                return Err(HarnessError::Rule(
                    "neither 'substring' nor 'pattern' set".to_string(),
                ));
            }
        };

        let rule = match &spec.context_lines {
            Some(window) => rule.with_context(window.parse()?),
            None => rule,
        };

        Ok(match spec.exit_code {
            Some(code) => rule.with_exit_code(code),
            None => rule,
        })
    }
}

/// Validate rule records, warning about and skipping the unusable ones
pub fn compile_rules(specs: &[RuleSpec], sink: &dyn LogSink) -> Vec<ErrorRule> {
    specs
        .iter()
        .filter_map(|spec| match ErrorRule::try_from(spec) {
            Ok(rule) => Some(rule),
            Err(e) => {
                sink.warning(&format!("Skipping error rule {:?}: {}", spec, e));
                None
            }
        })
        .collect()
}

/// Find the rule classifying `line`
///
/// Blank lines never match. Otherwise the first rule in list order that
/// matches wins and later rules are not consulted.
pub fn match_line<'a>(line: &str, rules: &'a [ErrorRule]) -> Option<&'a ErrorRule> {
    if line.trim().is_empty() {
        return None;
    }
    rules.iter().find(|rule| rule.is_match(line))
}

/// Rule sets that ship with the harness
pub fn builtin_rules(name: &str) -> Option<Vec<RuleSpec>> {
    match name {
        "hg" => Some(vec![
            RuleSpec::pattern(r"^abort:", Level::Error),
            RuleSpec::substring("unrecoverable error", Level::Error),
            RuleSpec::substring("EOF occurred in violation of protocol", Level::Error),
        ]),
        _ => None,
    }
}
