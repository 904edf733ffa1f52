//! Kubernetes label selector matching for cache-side queries
//!
//! Supports the string syntax accepted by the API server's `labelSelector`
//! parameter:
//!
//! - equality based: `app=web`, `app==web`, `tier!=cache`
//! - set based: `env in (prod, staging)`, `env notin (dev)`
//! - existence: `release`, `!canary`
//!
//! Requirements are comma separated and all of them must match. An empty
//! selector matches everything.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::str::FromStr;

use error_stack::Report;

use super::types::InformerError;

/// Operator of a single selector requirement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorOperator {
    Equals(String),
    NotEquals(String),
    In(BTreeSet<String>),
    NotIn(BTreeSet<String>),
    Exists,
    DoesNotExist,
}

/// One `key <op> values` clause
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub key: String,
    pub operator: SelectorOperator,
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match &self.operator {
            SelectorOperator::Equals(expected) => value == Some(expected),
            // A missing label satisfies `!=`, matching API server semantics.
            SelectorOperator::NotEquals(expected) => value != Some(expected),
            SelectorOperator::In(set) => value.is_some_and(|v| set.contains(v)),
            SelectorOperator::NotIn(set) => !value.is_some_and(|v| set.contains(v)),
            SelectorOperator::Exists => value.is_some(),
            SelectorOperator::DoesNotExist => value.is_none(),
        }
    }
}

/// Parsed label selector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl FromStr for LabelSelector {
    type Err = Report<InformerError>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let requirements = split_requirements(s)?
            .into_iter()
            .map(parse_requirement)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { requirements })
    }
}

fn invalid(message: impl Into<String>) -> Report<InformerError> {
    Report::new(InformerError::InvalidSelector {
        message: message.into(),
    })
}

/// Split on top-level commas, keeping commas inside `( ... )` value sets.
fn split_requirements(s: &str) -> Result<Vec<&str>, Report<InformerError>> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;

    for (idx, ch) in s.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| invalid(format!("unbalanced ')' in `{s}`")))?;
            }
            ',' if depth == 0 => {
                parts.push(&s[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(invalid(format!("unbalanced '(' in `{s}`")));
    }
    parts.push(&s[start..]);

    let trimmed: Vec<&str> = parts.into_iter().map(str::trim).collect();
    if trimmed.len() == 1 && trimmed[0].is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.iter().any(|p| p.is_empty()) {
        return Err(invalid(format!("empty requirement in `{s}`")));
    }
    Ok(trimmed)
}

fn parse_requirement(clause: &str) -> Result<Requirement, Report<InformerError>> {
    if let Some(key) = clause.strip_prefix('!') {
        return Ok(Requirement {
            key: parse_key(key)?,
            operator: SelectorOperator::DoesNotExist,
        });
    }

    if let Some((key, value)) = clause.split_once("!=") {
        return Ok(Requirement {
            key: parse_key(key)?,
            operator: SelectorOperator::NotEquals(parse_value(value)?),
        });
    }
    if let Some((key, value)) = clause.split_once("==") {
        return Ok(Requirement {
            key: parse_key(key)?,
            operator: SelectorOperator::Equals(parse_value(value)?),
        });
    }
    if let Some((key, value)) = clause.split_once('=') {
        return Ok(Requirement {
            key: parse_key(key)?,
            operator: SelectorOperator::Equals(parse_value(value)?),
        });
    }

    if let Some(open) = clause.find('(') {
        let head = clause[..open].trim_end();
        let (key, set_op) = head
            .rsplit_once(char::is_whitespace)
            .ok_or_else(|| invalid(format!("missing set operator in `{clause}`")))?;
        let values = parse_set(&clause[open..])?;
        let operator = match set_op {
            "in" => SelectorOperator::In(values),
            "notin" => SelectorOperator::NotIn(values),
            other => return Err(invalid(format!("unknown set operator `{other}`"))),
        };
        return Ok(Requirement {
            key: parse_key(key)?,
            operator,
        });
    }

    Ok(Requirement {
        key: parse_key(clause)?,
        operator: SelectorOperator::Exists,
    })
}

fn parse_set(s: &str) -> Result<BTreeSet<String>, Report<InformerError>> {
    let inner = s
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| invalid(format!("malformed value set `{s}`")))?;

    let values = inner
        .split(',')
        .map(parse_value)
        .collect::<Result<BTreeSet<_>, _>>()?;
    if values.is_empty() || (values.len() == 1 && values.contains("")) {
        return Err(invalid("value set must not be empty"));
    }
    Ok(values)
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

fn parse_key(key: &str) -> Result<String, Report<InformerError>> {
    let key = key.trim();
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };

    if name.is_empty() || name.len() > 63 || !name.chars().all(is_name_char) {
        return Err(invalid(format!("invalid label key `{key}`")));
    }
    if let Some(prefix) = prefix {
        if prefix.is_empty() || !prefix.chars().all(is_name_char) {
            return Err(invalid(format!("invalid label key prefix in `{key}`")));
        }
    }
    Ok(key.to_string())
}

fn parse_value(value: &str) -> Result<String, Report<InformerError>> {
    let value = value.trim();
    if value.len() > 63 || !value.chars().all(is_name_char) {
        return Err(invalid(format!("invalid label value `{value}`")));
    }
    Ok(value.to_string())
}
