//! Rollout resolution.
//!
//! [`resolve`] is a pure function of the committed [`RolloutState`] and a
//! fresh candidate list (most recent first). It never performs I/O and never
//! mutates its inputs; the caller commits the returned state once the rest of
//! the cycle has succeeded.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::warn;

const FULL_TRAFFIC: f64 = 100.0;
const TRAFFIC_EPSILON: f64 = 1e-9;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no active rollouts")]
    NoActiveRollouts,
}

/// The rollout/config pair currently served.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RolloutState {
    pub rollout_id: String,
    pub config_id: String,
}

impl RolloutState {
    pub fn new(rollout_id: impl Into<String>, config_id: impl Into<String>) -> Self {
        Self {
            rollout_id: rollout_id.into(),
            config_id: config_id.into(),
        }
    }
}

/// One rollout as reported upstream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RolloutCandidate {
    pub rollout_id: String,
    /// Traffic share per config id. Ordered so iteration is deterministic.
    pub traffic_percentages: BTreeMap<String, f64>,
}

/// Outcome of [`resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub state: RolloutState,
    /// True when the config id changed and a new snapshot must be built.
    pub changed: bool,
}

/// Picks the authoritative config id from the most recent rollout.
///
/// The config with the greatest traffic share wins; equal shares go to the
/// lexicographically smallest config id. A new rollout that keeps the current
/// config id only advances the rollout id.
pub fn resolve(
    current: &RolloutState,
    candidates: &[RolloutCandidate],
) -> Result<Resolution, ResolveError> {
    let latest = candidates.first().ok_or(ResolveError::NoActiveRollouts)?;
    if latest.rollout_id == current.rollout_id {
        return Ok(Resolution {
            state: current.clone(),
            changed: false,
        });
    }

    // BTreeMap iterates in ascending key order, so keeping only strictly
    // greater values leaves the smallest id among equal maxima.
    let mut winner: Option<(&str, f64)> = None;
    for (config_id, &percent) in &latest.traffic_percentages {
        match winner {
            Some((_, best)) if percent <= best => {}
            _ => winner = Some((config_id, percent)),
        }
    }
    let (config_id, percent) = winner.ok_or(ResolveError::NoActiveRollouts)?;

    let state = RolloutState::new(latest.rollout_id.clone(), config_id);
    if config_id == current.config_id {
        return Ok(Resolution {
            state,
            changed: false,
        });
    }

    if (FULL_TRAFFIC - percent).abs() >= TRAFFIC_EPSILON {
        warn!(
            rollout_id = %latest.rollout_id,
            config_id,
            traffic_percent = percent,
            "though traffic percentage of configuration {config_id} is {percent}%, set it to 100%"
        );
    }

    Ok(Resolution {
        state,
        changed: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn candidate(rollout_id: &str, percentages: &[(&str, f64)]) -> RolloutCandidate {
        RolloutCandidate {
            rollout_id: rollout_id.to_string(),
            traffic_percentages: percentages
                .iter()
                .map(|(id, p)| (id.to_string(), *p))
                .collect(),
        }
    }

    #[test]
    fn empty_candidates_is_an_error() {
        let current = RolloutState::new("r0", "c0");
        assert_eq!(
            resolve(&current, &[]),
            Err(ResolveError::NoActiveRollouts)
        );
    }

    #[test]
    fn same_rollout_id_is_idempotent() {
        let current = RolloutState::new("r1", "c0");
        // Percentages are not inspected when the rollout id is unchanged.
        let candidates = [candidate("r1", &[])];
        let resolution = resolve(&current, &candidates).expect("resolution");
        assert_eq!(resolution.state, current);
        assert!(!resolution.changed);
    }

    #[test]
    fn new_rollout_without_percentages_is_an_error() {
        let current = RolloutState::new("r0", "c0");
        assert_eq!(
            resolve(&current, &[candidate("r1", &[])]),
            Err(ResolveError::NoActiveRollouts)
        );
    }

    #[test]
    #[traced_test]
    fn adopts_config_with_greatest_share() {
        let current = RolloutState::new("r0", "c0");
        let candidates = [candidate("r1", &[("c0", 40.0), ("c1", 60.0)])];
        let resolution = resolve(&current, &candidates).expect("resolution");
        assert_eq!(resolution.state, RolloutState::new("r1", "c1"));
        assert!(resolution.changed);
        assert!(logs_contain("set it to 100%"));
    }

    #[test]
    #[traced_test]
    fn full_traffic_does_not_warn() {
        let current = RolloutState::default();
        let candidates = [candidate("r1", &[("c1", 100.0)])];
        let resolution = resolve(&current, &candidates).expect("resolution");
        assert_eq!(resolution.state, RolloutState::new("r1", "c1"));
        assert!(resolution.changed);
        assert!(!logs_contain("set it to 100%"));
    }

    #[test]
    fn only_the_first_candidate_counts() {
        let current = RolloutState::new("r0", "c0");
        let candidates = [
            candidate("r2", &[("c2", 100.0)]),
            candidate("r1", &[("c1", 100.0)]),
        ];
        let resolution = resolve(&current, &candidates).expect("resolution");
        assert_eq!(resolution.state, RolloutState::new("r2", "c2"));
    }

    #[test]
    fn same_config_advances_rollout_only() {
        let current = RolloutState::new("r0", "c0");
        let candidates = [candidate("r1", &[("c0", 100.0)])];
        let resolution = resolve(&current, &candidates).expect("resolution");
        assert_eq!(resolution.state, RolloutState::new("r1", "c0"));
        assert!(!resolution.changed);
    }

    #[test]
    fn ties_go_to_smallest_config_id() {
        let current = RolloutState::new("r0", "c0");
        let candidates = [candidate("r1", &[("c9", 50.0), ("c3", 50.0)])];
        let resolution = resolve(&current, &candidates).expect("resolution");
        assert_eq!(resolution.state.config_id, "c3");
        assert!(resolution.changed);
    }

    #[test]
    fn tie_including_current_config_keeps_it_when_smallest() {
        let current = RolloutState::new("r0", "a");
        let candidates = [candidate("r1", &[("a", 50.0), ("b", 50.0)])];
        let resolution = resolve(&current, &candidates).expect("resolution");
        assert_eq!(resolution.state, RolloutState::new("r1", "a"));
        assert!(!resolution.changed);
    }

    #[test]
    fn inputs_are_not_mutated() {
        let current = RolloutState::new("r0", "c0");
        let candidates = vec![candidate("r1", &[("c1", 100.0)])];
        let before = candidates.clone();
        resolve(&current, &candidates).expect("resolution");
        assert_eq!(candidates, before);
        assert_eq!(current, RolloutState::new("r0", "c0"));
    }
}
