//! Group planning — splits a rollout's target set into ordered groups.
//!
//! Quotas are either a percentage of the targets still unassigned when the
//! group's turn comes (consuming `ceil(percent × remaining)`) or an absolute
//! count. The last group absorbs any rounding remainder, so the group sizes
//! always sum to the rollout total and every target lands in exactly one
//! group.

use serde::{Deserialize, Serialize};

use fleetgrid_state::{ConditionKind, ErrorAction, GroupCondition, SuccessAction};

use crate::error::{RolloutError, RolloutResult};

/// How many targets a group claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupQuota {
    /// Percentage (1–100) of the targets remaining when this group is sized.
    Percent(u8),
    /// Absolute number of targets.
    Count(u64),
}

/// Definition of one rollout group, as supplied at rollout creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSpec {
    /// Display name; defaults to `group-{ordinal+1}` when omitted.
    #[serde(default)]
    pub name: Option<String>,
    pub quota: GroupQuota,
    pub success_condition: GroupCondition,
    pub success_action: SuccessAction,
    #[serde(default)]
    pub error_condition: Option<GroupCondition>,
    pub error_action: ErrorAction,
}

impl GroupSpec {
    /// An even split into `count` groups, each advancing automatically once
    /// `success_threshold` percent of its targets finished. The percentages
    /// sum to exactly 100, with the last group taking the remainder.
    pub fn even(count: u32, success_threshold: u8) -> Vec<GroupSpec> {
        if count == 0 {
            return Vec::new();
        }
        let base = 100 / count;
        let last = (100 - base * (count - 1)) as u8;
        let base = base as u8;
        (0..count)
            .map(|i| GroupSpec {
                name: None,
                quota: GroupQuota::Percent(if i + 1 == count { last } else { base }),
                success_condition: GroupCondition {
                    kind: ConditionKind::Threshold,
                    expression: success_threshold.to_string(),
                },
                success_action: SuccessAction::NextGroup,
                error_condition: None,
                error_action: ErrorAction::Pause,
            })
            .collect()
    }
}

/// Compute the size of each group for `total` targets.
///
/// Percent quotas apply to the remaining target count in group order; the
/// last group takes whatever remains. Fails if the definitions cannot cover
/// the targets exactly: a percent-only plan whose quotas don't sum to 100,
/// a count larger than what remains, a trailing count that mismatches the
/// remainder, or any group that would end up empty.
pub fn plan_sizes(
    total: u64,
    specs: &[GroupSpec],
    max_groups: usize,
) -> RolloutResult<Vec<u64>> {
    if specs.is_empty() {
        return Err(RolloutError::InvalidGroupDefinition(
            "no groups defined".to_string(),
        ));
    }
    if specs.len() > max_groups {
        return Err(RolloutError::TooManyGroups {
            requested: specs.len(),
            max: max_groups,
        });
    }
    for (idx, spec) in specs.iter().enumerate() {
        match spec.quota {
            GroupQuota::Percent(p) if p == 0 || p > 100 => {
                return Err(RolloutError::InvalidGroupDefinition(format!(
                    "group {idx}: percentage {p} out of range 1-100"
                )));
            }
            GroupQuota::Count(0) => {
                return Err(RolloutError::InvalidGroupDefinition(format!(
                    "group {idx}: zero target count"
                )));
            }
            _ => {}
        }
    }
    let all_percent = specs
        .iter()
        .all(|s| matches!(s.quota, GroupQuota::Percent(_)));
    if all_percent {
        let sum: u32 = specs
            .iter()
            .map(|s| match s.quota {
                GroupQuota::Percent(p) => p as u32,
                GroupQuota::Count(_) => 0,
            })
            .sum();
        if sum != 100 {
            return Err(RolloutError::InvalidGroupDefinition(format!(
                "group percentages sum to {sum}, expected 100"
            )));
        }
    }

    let mut sizes = Vec::with_capacity(specs.len());
    let mut remaining = total;
    for (idx, spec) in specs.iter().enumerate() {
        let is_last = idx + 1 == specs.len();
        if remaining == 0 {
            return Err(RolloutError::InvalidGroupDefinition(format!(
                "group {idx} would be empty"
            )));
        }
        let size = match spec.quota {
            GroupQuota::Percent(_) if is_last => remaining,
            GroupQuota::Percent(p) => (p as u64 * remaining).div_ceil(100).min(remaining),
            GroupQuota::Count(c) => {
                if c > remaining {
                    return Err(RolloutError::InvalidGroupDefinition(format!(
                        "group {idx} requests {c} targets but only {remaining} remain"
                    )));
                }
                if is_last && c != remaining {
                    return Err(RolloutError::InvalidGroupDefinition(format!(
                        "last group requests {c} targets but {remaining} remain unassigned"
                    )));
                }
                c
            }
        };
        remaining -= size;
        sizes.push(size);
    }
    Ok(sizes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn percent_specs(percents: &[u8]) -> Vec<GroupSpec> {
        percents
            .iter()
            .map(|p| GroupSpec {
                name: None,
                quota: GroupQuota::Percent(*p),
                success_condition: GroupCondition {
                    kind: ConditionKind::Threshold,
                    expression: "100".to_string(),
                },
                success_action: SuccessAction::NextGroup,
                error_condition: None,
                error_action: ErrorAction::Pause,
            })
            .collect()
    }

    fn count_spec(count: u64) -> GroupSpec {
        GroupSpec {
            name: None,
            quota: GroupQuota::Count(count),
            success_condition: GroupCondition {
                kind: ConditionKind::Threshold,
                expression: "100".to_string(),
            },
            success_action: SuccessAction::NextGroup,
            error_condition: None,
            error_action: ErrorAction::Pause,
        }
    }

    #[test]
    fn even_split_percentages_sum_to_100() {
        for count in 1..=10u32 {
            let specs = GroupSpec::even(count, 80);
            assert_eq!(specs.len(), count as usize);
            let sum: u32 = specs
                .iter()
                .map(|s| match s.quota {
                    GroupQuota::Percent(p) => p as u32,
                    GroupQuota::Count(_) => 0,
                })
                .sum();
            assert_eq!(sum, 100, "even({count}) percentages must sum to 100");
        }
    }

    #[test]
    fn two_even_groups_halve_the_fleet() {
        let sizes = plan_sizes(10, &percent_specs(&[50, 50]), 500).unwrap();
        assert_eq!(sizes, vec![5, 5]);
    }

    #[test]
    fn rounding_remainder_lands_in_last_group() {
        // ceil-of-remaining: 10 → 3, 7 → 2, 5 → 2, last absorbs 3.
        let sizes = plan_sizes(10, &percent_specs(&[25, 25, 25, 25]), 500).unwrap();
        assert_eq!(sizes, vec![3, 2, 2, 3]);
        assert_eq!(sizes.iter().sum::<u64>(), 10);
    }

    #[test]
    fn uneven_percentages_cover_exactly() {
        let sizes = plan_sizes(7, &percent_specs(&[33, 33, 34]), 500).unwrap();
        assert_eq!(sizes.iter().sum::<u64>(), 7);
        assert!(sizes.iter().all(|s| *s > 0));
    }

    #[test]
    fn percent_sum_must_be_100() {
        let err = plan_sizes(10, &percent_specs(&[30, 30]), 500).unwrap_err();
        assert!(matches!(err, RolloutError::InvalidGroupDefinition(_)));
    }

    #[test]
    fn counts_then_percent_remainder() {
        let specs = vec![count_spec(4), percent_specs(&[60]).remove(0)];
        let sizes = plan_sizes(10, &specs, 500).unwrap();
        assert_eq!(sizes, vec![4, 6]);
    }

    #[test]
    fn count_exceeding_remaining_is_rejected() {
        let specs = vec![count_spec(20)];
        let err = plan_sizes(10, &specs, 500).unwrap_err();
        assert!(matches!(err, RolloutError::InvalidGroupDefinition(_)));
    }

    #[test]
    fn trailing_count_must_match_remainder() {
        let bad = vec![count_spec(4), count_spec(5)];
        assert!(plan_sizes(10, &bad, 500).is_err());

        let good = vec![count_spec(4), count_spec(6)];
        assert_eq!(plan_sizes(10, &good, 500).unwrap(), vec![4, 6]);
    }

    #[test]
    fn group_that_would_be_empty_is_rejected() {
        // One target, two groups: ceil assigns it to the first group and
        // the second would be empty.
        let err = plan_sizes(1, &percent_specs(&[50, 50]), 500).unwrap_err();
        assert!(matches!(err, RolloutError::InvalidGroupDefinition(_)));
    }

    #[test]
    fn group_count_cap_is_enforced() {
        let specs = GroupSpec::even(6, 100);
        let err = plan_sizes(100, &specs, 5).unwrap_err();
        assert!(matches!(
            err,
            RolloutError::TooManyGroups {
                requested: 6,
                max: 5
            }
        ));
    }

    #[test]
    fn empty_and_zero_quota_definitions_are_rejected() {
        assert!(plan_sizes(10, &[], 500).is_err());
        assert!(plan_sizes(10, &percent_specs(&[0, 100]), 500).is_err());
        assert!(plan_sizes(10, &[count_spec(5), count_spec(0)], 500).is_err());
    }
}
