//! Declarative promotion steps.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::error::PromotionError;

/// Separator between a task namespace and a step name inside an alias.
pub const NAMESPACE_SEPARATOR: &str = "::";

/// Aliases of this form are generated by the engine and may not be chosen
/// by users.
static RESERVED_ALIAS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(step|task)-\d+$").expect("reserved alias pattern is valid"));

/// A variable whose value is an expression template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionVariable {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

impl ExpressionVariable {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Retry policy of a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum time since the first attempt before the step errors.
    #[serde(default, with = "duration_str", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    /// Consecutive errors tolerated before the step errors. Zero means unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_threshold: Option<u32>,
}

impl RetryPolicy {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn error_threshold(&self) -> Option<u32> {
        self.error_threshold.filter(|t| *t > 0)
    }
}

/// One declarative unit of promotion work.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Selects the runner.
    #[serde(alias = "uses")]
    pub kind: String,

    /// Name under which the step output is stored.
    #[serde(default, rename = "as", alias = "alias", skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// Boolean expression gating execution.
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Failures of this step do not fail the promotion.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub continue_on_error: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// Step-scoped variables.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vars: Vec<ExpressionVariable>,

    /// Runner configuration template.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub config: serde_json::Value,
}

impl Step {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.push(ExpressionVariable::new(name, value));
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    /// The `if` expression, if one was given.
    pub fn condition(&self) -> Option<&str> {
        self.condition
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }

    /// Resolve the alias of the step at `index`.
    ///
    /// A blank alias becomes `step-<index>`. User supplied aliases may not
    /// use the reserved `step-N`/`task-N` forms.
    pub fn resolve_alias(&self, index: usize) -> Result<String, PromotionError> {
        let alias = match self.alias.as_deref().map(str::trim) {
            None | Some("") => return Ok(format!("step-{}", index)),
            Some(alias) => alias,
        };
        if RESERVED_ALIAS.is_match(alias) {
            return Err(PromotionError::InvalidAlias {
                index,
                alias: alias.to_string(),
                reason: "aliases of the form step-N or task-N are reserved".to_string(),
            });
        }
        Ok(alias.to_string())
    }
}

/// The task namespace of an alias (`ns` in `ns::name`), if any.
pub fn alias_namespace(alias: &str) -> Option<&str> {
    alias
        .split_once(NAMESPACE_SEPARATOR)
        .map(|(namespace, _)| namespace)
        .filter(|namespace| !namespace.is_empty())
}

/// Resolve the aliases of all steps and check they are unique.
pub fn resolve_aliases(steps: &[Step]) -> Result<Vec<String>, PromotionError> {
    let mut seen = HashSet::with_capacity(steps.len());
    let mut aliases = Vec::with_capacity(steps.len());
    for (index, step) in steps.iter().enumerate() {
        let alias = step.resolve_alias(index)?;
        if !seen.insert(alias.clone()) {
            return Err(PromotionError::DuplicateAlias(alias));
        }
        aliases.push(alias);
    }
    Ok(aliases)
}

/// Parse durations such as `90s`, `5m`, `1h30m` or `250ms`. A bare number
/// is read as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let value: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];
        total += match unit {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            _ => return None,
        };
    }
    Some(total)
}

/// Format a duration the way [`parse_duration`] reads it.
pub fn format_duration(d: Duration) -> String {
    let millis = d.subsec_millis();
    let secs = d.as_secs();
    if millis != 0 {
        return format!("{}ms", d.as_millis());
    }
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{}h", h));
    }
    if m > 0 {
        out.push_str(&format!("{}m", m));
    }
    if s > 0 || out.is_empty() {
        out.push_str(&format!("{}s", s));
    }
    out
}

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_str(&super::format_duration(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        match raw {
            None => Ok(None),
            Some(raw) => super::parse_duration(&raw)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid duration '{}'", raw))),
        }
    }
}
