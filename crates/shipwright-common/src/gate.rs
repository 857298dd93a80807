use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One automated correctness check. The battery always runs in
/// [`GateName::ORDER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateName {
    Typecheck,
    Test,
    Lint,
    Build,
}

impl GateName {
    pub const ORDER: [GateName; 4] = [
        GateName::Typecheck,
        GateName::Test,
        GateName::Lint,
        GateName::Build,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Typecheck => "typecheck",
            Self::Test => "test",
            Self::Lint => "lint",
            Self::Build => "build",
        }
    }
}

impl fmt::Display for GateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GateName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "typecheck" => Ok(Self::Typecheck),
            "test" => Ok(Self::Test),
            "lint" => Ok(Self::Lint),
            "build" => Ok(Self::Build),
            _ => Err(format!("Invalid gate: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateStatus {
    Passed,
    Failed,
}

/// Outcome of one gate, with bounded diagnostic output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: GateName,
    pub status: GateStatus,
    pub output: String,
}

impl GateResult {
    pub fn passed(&self) -> bool {
        self.status == GateStatus::Passed
    }
}

/// True when the battery produced all four results and each passed.
pub fn all_gates_passed(results: &[GateResult]) -> bool {
    results.len() == GateName::ORDER.len() && results.iter().all(GateResult::passed)
}

/// Gates absent from an early-stopped battery, in order.
pub fn skipped_gates(results: &[GateResult]) -> Vec<GateName> {
    GateName::ORDER
        .iter()
        .filter(|g| !results.iter().any(|r| r.gate == **g))
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(gate: GateName, status: GateStatus) -> GateResult {
        GateResult {
            gate,
            status,
            output: String::new(),
        }
    }

    #[test]
    fn test_all_gates_passed_requires_full_battery() {
        let partial = vec![result(GateName::Typecheck, GateStatus::Passed)];
        assert!(!all_gates_passed(&partial));

        let full: Vec<_> = GateName::ORDER
            .iter()
            .map(|g| result(*g, GateStatus::Passed))
            .collect();
        assert!(all_gates_passed(&full));
    }

    #[test]
    fn test_skipped_gates_after_early_stop() {
        let results = vec![
            result(GateName::Typecheck, GateStatus::Passed),
            result(GateName::Test, GateStatus::Failed),
        ];
        assert_eq!(skipped_gates(&results), vec![GateName::Lint, GateName::Build]);
    }
}
