//! Structured phase outputs.
//!
//! Phase agents finish with a JSON document. It is stored schema-less and
//! only turned into one of these types at the boundary where it is
//! consumed, via [`parse_output`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::gate::GateResult;
use crate::review::{Condition, Finding, Verdict};

/// A phase output failed its schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct SchemaError(pub String);

/// Post-deserialization checks serde cannot express.
pub trait Validate {
    fn validate(&self) -> Result<(), SchemaError>;
}

fn require_non_empty(field: &str, value: &str) -> Result<(), SchemaError> {
    if value.trim().is_empty() {
        return Err(SchemaError(format!("{} must not be empty", field)));
    }
    Ok(())
}

/// Pull the outermost JSON object out of model text, tolerating code fences
/// and surrounding prose.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Parse and validate a phase output from the agent's final text.
pub fn parse_output<T: DeserializeOwned + Validate>(text: &str) -> Result<T, SchemaError> {
    let json = extract_json(text)
        .ok_or_else(|| SchemaError("final answer contains no JSON object".to_string()))?;
    let value: T = serde_json::from_str(json).map_err(|e| SchemaError(e.to_string()))?;
    value.validate()?;
    Ok(value)
}

/// Validate an already-decoded JSON value (e.g. read back from storage).
pub fn from_value<T: DeserializeOwned + Validate>(value: serde_json::Value) -> Result<T, SchemaError> {
    let parsed: T = serde_json::from_value(value).map_err(|e| SchemaError(e.to_string()))?;
    parsed.validate()?;
    Ok(parsed)
}

// ── Analysis ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodebaseEntry {
    pub path: String,
    pub purpose: String,
    pub relevance: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisOutput {
    pub affected_systems: Vec<String>,
    pub architectural_constraints: Vec<String>,
    pub risks: Vec<String>,
    pub codebase_map: Vec<CodebaseEntry>,
    pub feasibility_assessment: String,
}

impl Validate for AnalysisOutput {
    fn validate(&self) -> Result<(), SchemaError> {
        require_non_empty("feasibilityAssessment", &self.feasibility_assessment)?;
        for entry in &self.codebase_map {
            require_non_empty("codebaseMap[].path", &entry.path)?;
        }
        Ok(())
    }
}

// ── Approaches ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tradeoffs {
    #[serde(default)]
    pub pros: Vec<String>,
    #[serde(default)]
    pub cons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assumption {
    pub claim: String,
    pub validated: bool,
    #[serde(default)]
    pub evidence: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approach {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub rationale: String,
    pub implementation: String,
    #[serde(default)]
    pub affected_files: Vec<String>,
    #[serde(default)]
    pub tradeoffs: Tradeoffs,
    #[serde(default)]
    pub assumptions: Vec<Assumption>,
    pub estimated_complexity: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproachesOutput {
    pub approaches: Vec<Approach>,
    pub recommendation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub single_approach_justification: Option<String>,
}

impl ApproachesOutput {
    pub fn find(&self, id: &str) -> Option<&Approach> {
        self.approaches.iter().find(|a| a.id == id)
    }
}

impl Validate for ApproachesOutput {
    fn validate(&self) -> Result<(), SchemaError> {
        if self.approaches.is_empty() {
            return Err(SchemaError("approaches must contain at least one approach".into()));
        }
        let mut ids = std::collections::HashSet::new();
        for approach in &self.approaches {
            require_non_empty("approaches[].id", &approach.id)?;
            require_non_empty("approaches[].title", &approach.title)?;
            if !ids.insert(approach.id.as_str()) {
                return Err(SchemaError(format!("duplicate approach id '{}'", approach.id)));
            }
        }
        if self.approaches.len() == 1
            && self
                .single_approach_justification
                .as_deref()
                .is_none_or(|j| j.trim().is_empty())
        {
            return Err(SchemaError(
                "a single approach requires singleApproachJustification".into(),
            ));
        }
        Ok(())
    }
}

// ── Judging ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgingOutput {
    pub selected_approach_id: String,
    pub findings: Vec<Finding>,
    pub overall_verdict: Verdict,
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    pub overall_assessment: String,
}

impl Validate for JudgingOutput {
    fn validate(&self) -> Result<(), SchemaError> {
        require_non_empty("selectedApproachId", &self.selected_approach_id)?;
        if self.overall_verdict == Verdict::Rejected
            && self.rejection_reason.as_deref().is_none_or(str::is_empty)
        {
            return Err(SchemaError("a rejected verdict requires rejectionReason".into()));
        }
        Ok(())
    }
}

/// What the judging agent itself reports; verdict fields are derived, not
/// taken from the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgingDraft {
    pub selected_approach_id: String,
    #[serde(default)]
    pub findings: Vec<Finding>,
    pub overall_assessment: String,
}

impl Validate for JudgingDraft {
    fn validate(&self) -> Result<(), SchemaError> {
        require_non_empty("selectedApproachId", &self.selected_approach_id)?;
        require_non_empty("overallAssessment", &self.overall_assessment)
    }
}

// ── Implementation ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
    Renamed,
}

impl ChangeType {
    /// Map a `git diff --name-status` letter.
    pub fn from_git_status(status: &str) -> Option<Self> {
        match status.chars().next()? {
            'A' => Some(Self::Added),
            'M' | 'T' => Some(Self::Modified),
            'D' => Some(Self::Deleted),
            'R' | 'C' => Some(Self::Renamed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub path: String,
    pub change_type: ChangeType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImplementationOutput {
    pub branch: String,
    pub files_changed: Vec<FileChange>,
    pub gate_results: Vec<GateResult>,
    pub total_coder_attempts: u32,
    pub conditions_addressed: Vec<String>,
}

impl Validate for ImplementationOutput {
    fn validate(&self) -> Result<(), SchemaError> {
        require_non_empty("branch", &self.branch)?;
        if self.total_coder_attempts == 0 {
            return Err(SchemaError("totalCoderAttempts must be at least 1".into()));
        }
        if !crate::gate::all_gates_passed(&self.gate_results) {
            return Err(SchemaError("an accepted implementation must pass every gate".into()));
        }
        Ok(())
    }
}

/// The coding agent's own report at the end of one attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoderReport {
    pub summary: String,
    #[serde(default)]
    pub conditions_addressed: Vec<String>,
}

impl Validate for CoderReport {
    fn validate(&self) -> Result<(), SchemaError> {
        require_non_empty("summary", &self.summary)
    }
}

// ── Pull request ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrOutput {
    pub pr_url: String,
    pub pr_number: u64,
    pub title: String,
    pub body: String,
}

impl Validate for PrOutput {
    fn validate(&self) -> Result<(), SchemaError> {
        require_non_empty("prUrl", &self.pr_url)?;
        require_non_empty("title", &self.title)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn approach(id: &str) -> serde_json::Value {
        json!({
            "id": id,
            "title": format!("Approach {}", id),
            "summary": "s",
            "rationale": "r",
            "implementation": "i",
            "affectedFiles": ["src/lib.rs"],
            "tradeoffs": {"pros": ["fast"], "cons": []},
            "assumptions": [{"claim": "c", "validated": true, "evidence": "e"}],
            "estimatedComplexity": "low"
        })
    }

    #[test]
    fn test_extract_json_from_fenced_block() {
        let text = "Here you go:\n```json\n{\"a\": {\"b\": 1}}\n```\nDone.";
        assert_eq!(extract_json(text), Some("{\"a\": {\"b\": 1}}"));
        assert_eq!(extract_json("no json here"), None);
    }

    #[test]
    fn test_analysis_parses_camel_case() {
        let text = json!({
            "affectedSystems": ["api"],
            "architecturalConstraints": [],
            "risks": ["migration"],
            "codebaseMap": [{"path": "src/api.rs", "purpose": "routes", "relevance": "high"}],
            "feasibilityAssessment": "feasible"
        })
        .to_string();
        let parsed: AnalysisOutput = parse_output(&text).unwrap();
        assert_eq!(parsed.codebase_map[0].path, "src/api.rs");
    }

    #[test]
    fn test_analysis_missing_field_is_schema_error() {
        let text = json!({"affectedSystems": []}).to_string();
        assert!(parse_output::<AnalysisOutput>(&text).is_err());
    }

    #[test]
    fn test_single_approach_needs_justification() {
        let without = json!({"approaches": [approach("a")], "recommendation": "a"});
        assert!(from_value::<ApproachesOutput>(without).is_err());

        let with = json!({
            "approaches": [approach("a")],
            "recommendation": "a",
            "singleApproachJustification": "only one sane design"
        });
        assert!(from_value::<ApproachesOutput>(with).is_ok());
    }

    #[test]
    fn test_duplicate_approach_ids_rejected() {
        let value = json!({"approaches": [approach("a"), approach("a")], "recommendation": "a"});
        let err = from_value::<ApproachesOutput>(value).unwrap_err();
        assert!(err.0.contains("duplicate"));
    }

    #[test]
    fn test_empty_approaches_rejected() {
        let value = json!({"approaches": [], "recommendation": ""});
        assert!(from_value::<ApproachesOutput>(value).is_err());
    }

    #[test]
    fn test_change_type_from_git_status() {
        assert_eq!(ChangeType::from_git_status("A"), Some(ChangeType::Added));
        assert_eq!(ChangeType::from_git_status("R100"), Some(ChangeType::Renamed));
        assert_eq!(ChangeType::from_git_status("?"), None);
    }
}
