//! Success/error condition evaluation for rollout groups.
//!
//! Conditions are stored as strings on the group row, so a malformed
//! expression can surface long after rollout creation. Evaluation never
//! fails the rollout for that: it logs and reports the condition as unmet,
//! leaving the group running until an operator intervenes.

use tracing::error;

use fleetgrid_state::{ConditionKind, GroupCondition};

/// Evaluate `condition` against `observed` qualifying actions out of `total`
/// group members.
///
/// A group with zero members is trivially satisfied. Threshold expressions
/// are an integer percentage; the comparison divides as floats so that e.g.
/// 7 of 9 meets a 77 threshold. Absolute-count expressions compare directly.
pub fn evaluate(condition: &GroupCondition, observed: u64, total: u64) -> bool {
    if total == 0 {
        return true;
    }
    match condition.kind {
        ConditionKind::Threshold => match condition.expression.trim().parse::<u32>() {
            Ok(threshold) => {
                (observed as f64 / total as f64) >= (threshold as f64 / 100.0)
            }
            Err(err) => {
                error!(
                    expression = %condition.expression,
                    %err,
                    "unparseable threshold condition, treating as unmet"
                );
                false
            }
        },
        ConditionKind::AbsoluteCount => match condition.expression.trim().parse::<u64>() {
            Ok(count) => observed >= count,
            Err(err) => {
                error!(
                    expression = %condition.expression,
                    %err,
                    "unparseable absolute-count condition, treating as unmet"
                );
                false
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn threshold(expr: &str) -> GroupCondition {
        GroupCondition {
            kind: ConditionKind::Threshold,
            expression: expr.to_string(),
        }
    }

    fn absolute(expr: &str) -> GroupCondition {
        GroupCondition {
            kind: ConditionKind::AbsoluteCount,
            expression: expr.to_string(),
        }
    }

    #[test]
    fn threshold_met_at_exact_boundary() {
        assert!(evaluate(&threshold("80"), 8, 10));
        assert!(!evaluate(&threshold("80"), 7, 10));
    }

    #[test]
    fn threshold_uses_float_division() {
        // 7/9 = 77.78% meets 77 but not 78.
        assert!(evaluate(&threshold("77"), 7, 9));
        assert!(!evaluate(&threshold("78"), 7, 9));
    }

    #[test]
    fn hundred_percent_requires_every_member() {
        assert!(!evaluate(&threshold("100"), 9, 10));
        assert!(evaluate(&threshold("100"), 10, 10));
    }

    #[test]
    fn threshold_above_100_is_never_met() {
        assert!(!evaluate(&threshold("150"), 10, 10));
    }

    #[test]
    fn zero_threshold_is_always_met() {
        assert!(evaluate(&threshold("0"), 0, 10));
    }

    #[test]
    fn empty_group_is_trivially_satisfied() {
        assert!(evaluate(&threshold("80"), 0, 0));
        assert!(evaluate(&absolute("5"), 0, 0));
    }

    #[test]
    fn malformed_expressions_are_unmet() {
        assert!(!evaluate(&threshold("abc"), 10, 10));
        assert!(!evaluate(&threshold(""), 10, 10));
        assert!(!evaluate(&threshold("12.5"), 10, 10));
        assert!(!evaluate(&threshold("-5"), 10, 10));
        assert!(!evaluate(&absolute("many"), 10, 10));
    }

    #[test]
    fn whitespace_around_expression_is_tolerated() {
        assert!(evaluate(&threshold(" 80 "), 8, 10));
        assert!(evaluate(&absolute(" 3\n"), 3, 10));
    }

    #[test]
    fn absolute_count_compares_directly() {
        assert!(evaluate(&absolute("3"), 3, 100));
        assert!(evaluate(&absolute("3"), 4, 100));
        assert!(!evaluate(&absolute("3"), 2, 100));
    }
}
