//! Inclusion / exclusion / optional rules evaluated against live agent attributes
//!
//! A rule is a `{method, pattern}` pair. Evaluating it queries the agent for
//! `method[object_key]` and searches the whole answer case-insensitively
//! (`.*<pattern>.*`, with `.` crossing line breaks). A `^` in the pattern
//! anchors at the start of the answer.

use regex::{Regex, RegexBuilder};
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::protocol::{AgentQuery, NOT_SUPPORTED_PREFIX};

#[derive(Debug, Clone)]
pub struct Rule {
    method: String,
    pattern: String,
    regex: Regex,
}

impl Rule {
    pub fn new(method: impl Into<String>, pattern: &str) -> Result<Self, regex::Error> {
        let regex = RegexBuilder::new(&format!(r"\A.*(?:{pattern})"))
            .case_insensitive(true)
            .dot_matches_new_line(true)
            .build()?;
        Ok(Self {
            method: method.into(),
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Attribute key queried for `object_key`.
    pub fn query_key(&self, object_key: &str) -> String {
        format!("{}[{}]", self.method, object_key)
    }

    pub fn matches(&self, response: &str) -> bool {
        self.regex.is_match(response)
    }
}

/// Registry object an optional rule attaches to a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Group(String),
    Template(String),
}

#[derive(Debug, Clone)]
pub struct OptionalRule {
    pub rule: Rule,
    pub target: Target,
}

/// Rules of one object type, immutable during a run.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub include: Vec<Rule>,
    pub exclude: Vec<Rule>,
    pub optional: Vec<OptionalRule>,
}

pub struct RuleEvaluator<'a, A: AgentQuery + ?Sized> {
    agent: &'a A,
}

impl<'a, A: AgentQuery + ?Sized> RuleEvaluator<'a, A> {
    pub fn new(agent: &'a A) -> Self {
        Self { agent }
    }

    /// Runs one test. A not-supported answer is an error, never a verdict.
    pub async fn evaluate_test(&self, object_key: &str, rule: &Rule) -> SyncResult<bool> {
        let key = rule.query_key(object_key);
        let response = self.agent.query(&key).await?;

        if response.trim_start().starts_with(NOT_SUPPORTED_PREFIX) {
            return Err(SyncError::Unsupported {
                key,
                detail: response.trim().to_string(),
            });
        }

        Ok(rule.matches(&response))
    }

    /// Every inclusion test must match; stops at the first miss.
    pub async fn passes_inclusion(
        &self,
        rules: &RuleSet,
        object_key: &str,
        skip_methods: &[&str],
    ) -> SyncResult<bool> {
        for rule in &rules.include {
            if skip_methods.contains(&rule.method()) {
                continue;
            }
            if !self.evaluate_test(object_key, rule).await? {
                debug!(object = object_key, method = rule.method(), pattern = rule.pattern(), "inclusion rule not matched");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// False as soon as one exclusion test matches.
    pub async fn passes_exclusion(
        &self,
        rules: &RuleSet,
        object_key: &str,
        skip_methods: &[&str],
    ) -> SyncResult<bool> {
        for rule in &rules.exclude {
            if skip_methods.contains(&rule.method()) {
                continue;
            }
            if self.evaluate_test(object_key, rule).await? {
                debug!(object = object_key, method = rule.method(), pattern = rule.pattern(), "exclusion rule matched");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Targets of every matching optional rule, each listed once.
    pub async fn matched_optional(
        &self,
        optional: &[OptionalRule],
        object_key: &str,
    ) -> SyncResult<Vec<Target>> {
        let mut targets: Vec<Target> = Vec::new();
        for entry in optional {
            if self.evaluate_test(object_key, &entry.rule).await? && !targets.contains(&entry.target) {
                targets.push(entry.target.clone());
            }
        }
        Ok(targets)
    }
}
