//! Target filter expressions.
//!
//! Rollouts select their member targets with a small query language over
//! target fields and attributes:
//!
//! ```text
//! update_status==registered;attr.region==eu-*
//! name==gateway-*,controller_id==dev-0042
//! ```
//!
//! `;` combines comparisons with AND, `,` combines AND-clauses with OR
//! (AND binds tighter). Comparisons are `==` and `!=`; values may contain
//! `*` wildcards. Recognized fields are `controller_id` (alias `id`),
//! `name`, `update_status`, and `attr.<key>`.
//!
//! Filters are parsed once at rollout creation and evaluated in memory
//! against each target; a parse failure rejects the rollout.

use crate::error::{StateError, StateResult};
use crate::types::Target;

/// A parsed target filter: OR over AND-clauses of comparisons.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetFilter {
    clauses: Vec<Vec<Comparison>>,
}

/// A single `field op value` comparison.
#[derive(Debug, Clone, PartialEq)]
struct Comparison {
    field: Field,
    op: Op,
    value: String,
}

#[derive(Debug, Clone, PartialEq)]
enum Field {
    ControllerId,
    Name,
    UpdateStatus,
    Attribute(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Eq,
    Ne,
}

impl TargetFilter {
    /// Parse a filter expression. Fails on empty input, a missing operator,
    /// an empty value, or an unrecognized field name.
    pub fn parse(expr: &str) -> StateResult<Self> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(StateError::InvalidFilter("empty expression".to_string()));
        }
        let mut clauses = Vec::new();
        for clause in expr.split(',') {
            let mut comparisons = Vec::new();
            for part in clause.split(';') {
                comparisons.push(Comparison::parse(part.trim())?);
            }
            clauses.push(comparisons);
        }
        Ok(Self { clauses })
    }

    /// True if the target satisfies at least one AND-clause.
    pub fn matches(&self, target: &Target) -> bool {
        self.clauses
            .iter()
            .any(|clause| clause.iter().all(|cmp| cmp.matches(target)))
    }
}

impl Comparison {
    fn parse(text: &str) -> StateResult<Self> {
        let (field_text, op, value) = if let Some((f, v)) = text.split_once("==") {
            (f, Op::Eq, v)
        } else if let Some((f, v)) = text.split_once("!=") {
            (f, Op::Ne, v)
        } else {
            return Err(StateError::InvalidFilter(format!(
                "missing operator in '{text}'"
            )));
        };
        let field_text = field_text.trim();
        let value = value.trim();
        if value.is_empty() {
            return Err(StateError::InvalidFilter(format!(
                "empty value in '{text}'"
            )));
        }
        let field = match field_text {
            "id" | "controller_id" => Field::ControllerId,
            "name" => Field::Name,
            "update_status" => Field::UpdateStatus,
            _ => match field_text.strip_prefix("attr.") {
                Some(key) if !key.is_empty() => Field::Attribute(key.to_string()),
                _ => {
                    return Err(StateError::InvalidFilter(format!(
                        "unknown field '{field_text}'"
                    )));
                }
            },
        };
        Ok(Self {
            field,
            op,
            value: value.to_string(),
        })
    }

    fn matches(&self, target: &Target) -> bool {
        // A missing attribute never equals anything, so `!=` holds for it.
        let actual: Option<&str> = match &self.field {
            Field::ControllerId => Some(&target.controller_id),
            Field::Name => Some(&target.name),
            Field::UpdateStatus => Some(target.update_status.as_str()),
            Field::Attribute(key) => target.attributes.get(key).map(String::as_str),
        };
        let pattern = if matches!(self.field, Field::UpdateStatus) {
            // Status names compare case-insensitively.
            self.value.to_ascii_lowercase()
        } else {
            self.value.clone()
        };
        let equal = match actual {
            Some(actual) => wildcard_match(&pattern, actual),
            None => false,
        };
        match self.op {
            Op::Eq => equal,
            Op::Ne => !equal,
        }
    }
}

/// Glob-style match where `*` matches any run of characters.
fn wildcard_match(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !value.starts_with(first) {
        return false;
    }
    let mut rest = &value[first.len()..];
    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TargetUpdateStatus;
    use std::collections::HashMap;

    fn test_target(controller_id: &str, name: &str) -> Target {
        Target {
            controller_id: controller_id.to_string(),
            name: name.to_string(),
            attributes: HashMap::new(),
            assigned_ds: None,
            installed_ds: None,
            update_status: TargetUpdateStatus::Registered,
            last_poll_at: None,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    #[test]
    fn exact_match_on_controller_id() {
        let filter = TargetFilter::parse("controller_id==dev-1").unwrap();
        assert!(filter.matches(&test_target("dev-1", "a")));
        assert!(!filter.matches(&test_target("dev-2", "a")));
    }

    #[test]
    fn id_alias() {
        let filter = TargetFilter::parse("id==dev-1").unwrap();
        assert!(filter.matches(&test_target("dev-1", "a")));
    }

    #[test]
    fn wildcard_prefix_and_suffix() {
        let filter = TargetFilter::parse("name==gw-*").unwrap();
        assert!(filter.matches(&test_target("x", "gw-eu-1")));
        assert!(!filter.matches(&test_target("x", "sensor-1")));

        let filter = TargetFilter::parse("name==*-eu-1").unwrap();
        assert!(filter.matches(&test_target("x", "gw-eu-1")));
        assert!(!filter.matches(&test_target("x", "gw-us-1")));
    }

    #[test]
    fn wildcard_infix() {
        let filter = TargetFilter::parse("name==gw-*-1").unwrap();
        assert!(filter.matches(&test_target("x", "gw-eu-1")));
        assert!(filter.matches(&test_target("x", "gw-us-east-1")));
        assert!(!filter.matches(&test_target("x", "gw-eu-2")));
    }

    #[test]
    fn wildcard_alone_matches_everything() {
        let filter = TargetFilter::parse("controller_id==*").unwrap();
        assert!(filter.matches(&test_target("anything", "a")));
    }

    #[test]
    fn not_equal() {
        let filter = TargetFilter::parse("name!=gw-*").unwrap();
        assert!(!filter.matches(&test_target("x", "gw-1")));
        assert!(filter.matches(&test_target("x", "sensor-1")));
    }

    #[test]
    fn and_requires_all() {
        let mut target = test_target("dev-1", "gw-1");
        target
            .attributes
            .insert("region".to_string(), "eu".to_string());

        let filter = TargetFilter::parse("name==gw-*;attr.region==eu").unwrap();
        assert!(filter.matches(&target));

        let filter = TargetFilter::parse("name==gw-*;attr.region==us").unwrap();
        assert!(!filter.matches(&target));
    }

    #[test]
    fn or_requires_any() {
        let filter = TargetFilter::parse("controller_id==dev-1,controller_id==dev-2").unwrap();
        assert!(filter.matches(&test_target("dev-1", "a")));
        assert!(filter.matches(&test_target("dev-2", "a")));
        assert!(!filter.matches(&test_target("dev-3", "a")));
    }

    #[test]
    fn and_binds_tighter_than_or() {
        // (name==a AND attr.r==eu) OR controller_id==dev-9
        let filter = TargetFilter::parse("name==a;attr.r==eu,controller_id==dev-9").unwrap();

        let mut matching = test_target("dev-1", "a");
        matching.attributes.insert("r".to_string(), "eu".to_string());
        assert!(filter.matches(&matching));

        assert!(filter.matches(&test_target("dev-9", "b")));
        assert!(!filter.matches(&test_target("dev-1", "a")));
    }

    #[test]
    fn missing_attribute_fails_eq_but_passes_ne() {
        let target = test_target("dev-1", "a");
        assert!(!TargetFilter::parse("attr.region==eu").unwrap().matches(&target));
        assert!(TargetFilter::parse("attr.region!=eu").unwrap().matches(&target));
    }

    #[test]
    fn update_status_is_case_insensitive() {
        let filter = TargetFilter::parse("update_status==Registered").unwrap();
        assert!(filter.matches(&test_target("dev-1", "a")));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(TargetFilter::parse("").is_err());
        assert!(TargetFilter::parse("   ").is_err());
        assert!(TargetFilter::parse("name").is_err());
        assert!(TargetFilter::parse("name==").is_err());
        assert!(TargetFilter::parse("bogus==x").is_err());
        assert!(TargetFilter::parse("attr.==x").is_err());
        assert!(TargetFilter::parse("name==a;;name==b").is_err());
    }
}
