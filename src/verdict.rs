//! Deterministic judging verdict.

use serde::{Deserialize, Serialize};
use shipwright_common::{Condition, Finding, Severity, Verdict};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictOutcome {
    pub verdict: Verdict,
    pub conditions: Vec<Condition>,
    pub rejection_reason: Option<String>,
}

/// Map findings to a verdict.
///
/// Any critical finding rejects. Otherwise two or more majors reject, a
/// single major approves with conditions, and anything else approves.
/// Conditions are built from every non-critical finding.
///
/// # Examples
///
/// ```
/// use shipwright::verdict::derive_verdict;
/// use shipwright_common::{Finding, Severity, Verdict};
///
/// let findings = vec![Finding::new("security", Severity::Critical, "SQL injection", "bind params")];
/// let outcome = derive_verdict(&findings);
/// assert_eq!(outcome.verdict, Verdict::Rejected);
/// assert!(outcome.rejection_reason.is_some());
/// ```
pub fn derive_verdict(findings: &[Finding]) -> VerdictOutcome {
    let critical: Vec<&Finding> = findings
        .iter()
        .filter(|f| f.severity == Severity::Critical)
        .collect();
    let major: Vec<&Finding> = findings
        .iter()
        .filter(|f| f.severity == Severity::Major)
        .collect();

    let verdict = if !critical.is_empty() || major.len() >= 2 {
        Verdict::Rejected
    } else if major.len() == 1 {
        Verdict::ApprovedWithConditions
    } else {
        Verdict::Approved
    };

    let conditions = findings
        .iter()
        .filter(|f| f.severity != Severity::Critical)
        .map(|f| Condition {
            description: format!("{}: {}", f.criterion, f.description),
            severity: f.severity,
        })
        .collect();

    let rejection_reason = (verdict == Verdict::Rejected).then(|| {
        let triggers: Vec<&Finding> = if critical.is_empty() { major } else { critical };
        let lead = if triggers.iter().any(|f| f.severity == Severity::Critical) {
            format!("{} critical finding(s)", triggers.len())
        } else {
            format!("{} major findings", triggers.len())
        };
        let listed: Vec<String> = triggers
            .iter()
            .map(|f| format!("[{}] {}: {}", f.severity, f.criterion, f.description))
            .collect();
        format!("Rejected due to {}: {}", lead, listed.join("; "))
    });

    VerdictOutcome {
        verdict,
        conditions,
        rejection_reason,
    }
}
