//! The fixed run phase sequence.
//!
//! A run walks `analysis → approaches → judging → implementation → pr →
//! completed`, one step at a time. `failed` is reachable from every
//! non-terminal phase. Nothing ever moves backwards.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Position of a run in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Analysis,
    Approaches,
    Judging,
    Implementation,
    Pr,
    Completed,
    Failed,
}

impl Phase {
    /// The forward sequence, excluding `Failed`.
    pub const ORDER: [Phase; 6] = [
        Phase::Analysis,
        Phase::Approaches,
        Phase::Judging,
        Phase::Implementation,
        Phase::Pr,
        Phase::Completed,
    ];

    /// Phases driven by an LLM agent, in execution order.
    pub const AGENT_PHASES: [Phase; 4] = [
        Phase::Analysis,
        Phase::Approaches,
        Phase::Judging,
        Phase::Implementation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Approaches => "approaches",
            Self::Judging => "judging",
            Self::Implementation => "implementation",
            Self::Pr => "pr",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// The phase that follows this one on the happy path.
    pub fn next(&self) -> Option<Phase> {
        let idx = Self::ORDER.iter().position(|p| p == self)?;
        Self::ORDER.get(idx + 1).copied()
    }

    /// Whether `self → to` is a legal single transition.
    ///
    /// # Examples
    ///
    /// ```
    /// use shipwright_common::Phase;
    ///
    /// assert!(Phase::Analysis.can_transition_to(Phase::Approaches));
    /// assert!(Phase::Judging.can_transition_to(Phase::Failed));
    /// assert!(!Phase::Analysis.can_transition_to(Phase::Judging));
    /// assert!(!Phase::Completed.can_transition_to(Phase::Failed));
    /// ```
    pub fn can_transition_to(&self, to: Phase) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == Phase::Failed || self.next() == Some(to)
    }

    /// Ordinal in the forward sequence. `Failed` has none.
    pub fn ordinal(&self) -> Option<usize> {
        Self::ORDER.iter().position(|p| p == self)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analysis" => Ok(Self::Analysis),
            "approaches" => Ok(Self::Approaches),
            "judging" => Ok(Self::Judging),
            "implementation" => Ok(Self::Implementation),
            "pr" => Ok(Self::Pr),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

/// Lifecycle of a single phase's execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Running,
    Passed,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for PhaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "passed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid phase status: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_order_is_single_step() {
        for pair in Phase::ORDER.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
            assert!(!pair[1].can_transition_to(pair[0]), "{} -> {}", pair[1], pair[0]);
        }
    }

    #[test]
    fn test_no_skipping() {
        assert!(!Phase::Analysis.can_transition_to(Phase::Implementation));
        assert!(!Phase::Approaches.can_transition_to(Phase::Pr));
        assert!(!Phase::Implementation.can_transition_to(Phase::Completed));
    }

    #[test]
    fn test_failed_reachable_from_every_non_terminal() {
        for phase in Phase::ORDER.iter().filter(|p| !p.is_terminal()) {
            assert!(phase.can_transition_to(Phase::Failed));
        }
        assert!(!Phase::Failed.can_transition_to(Phase::Failed));
        assert!(!Phase::Completed.can_transition_to(Phase::Failed));
    }

    #[test]
    fn test_round_trips_through_str() {
        for phase in Phase::ORDER.iter().chain(std::iter::once(&Phase::Failed)) {
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), *phase);
        }
        assert!("deploy".parse::<Phase>().is_err());
    }

    #[test]
    fn test_next() {
        assert_eq!(Phase::Analysis.next(), Some(Phase::Approaches));
        assert_eq!(Phase::Pr.next(), Some(Phase::Completed));
        assert_eq!(Phase::Completed.next(), None);
        assert_eq!(Phase::Failed.next(), None);
    }
}
