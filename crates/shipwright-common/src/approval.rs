//! Approval wire contract.
//!
//! Requests and responses are discriminated by `kind`. The approval id
//! travels on both sides and is the correlation key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalKind {
    Approval,
    Text,
    Choice,
}

impl ApprovalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approval => "approval",
            Self::Text => "text",
            Self::Choice => "choice",
        }
    }
}

impl fmt::Display for ApprovalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approval" => Ok(Self::Approval),
            "text" => Ok(Self::Text),
            "choice" => Ok(Self::Choice),
            _ => Err(format!("Invalid approval kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceOption {
    pub id: String,
    pub label: String,
}

/// What a human is being asked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ApprovalRequestPayload {
    Approval {
        message: String,
    },
    Text {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        placeholder: Option<String>,
    },
    Choice {
        prompt: String,
        options: Vec<ChoiceOption>,
    },
}

/// Errors constructing or checking approval payloads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("choice request needs at least 2 options, got {0}")]
    TooFewOptions(usize),
    #[error("choice option ids must be unique, '{0}' repeats")]
    DuplicateOption(String),
    #[error("response kind {actual} does not match request kind {expected}")]
    KindMismatch {
        expected: ApprovalKind,
        actual: ApprovalKind,
    },
    #[error("selected option '{0}' is not one of the offered options")]
    UnknownOption(String),
}

impl ApprovalRequestPayload {
    pub fn kind(&self) -> ApprovalKind {
        match self {
            Self::Approval { .. } => ApprovalKind::Approval,
            Self::Text { .. } => ApprovalKind::Text,
            Self::Choice { .. } => ApprovalKind::Choice,
        }
    }

    /// Build a multiple-choice request, or an approval request when fewer
    /// than two options exist. A degenerate choice is never emitted.
    ///
    /// # Examples
    ///
    /// ```
    /// use shipwright_common::{ApprovalKind, ApprovalRequestPayload, ChoiceOption};
    ///
    /// let only = vec![ChoiceOption { id: "a".into(), label: "Only".into() }];
    /// let req = ApprovalRequestPayload::choice_or_approval("Pick one", only);
    /// assert_eq!(req.kind(), ApprovalKind::Approval);
    /// ```
    pub fn choice_or_approval(prompt: impl Into<String>, options: Vec<ChoiceOption>) -> Self {
        let prompt = prompt.into();
        match options.len() {
            0 => Self::Approval { message: prompt },
            1 => Self::Approval {
                message: format!("{}\n\nProceed with the only option: {}?", prompt, options[0].label),
            },
            _ => Self::Choice { prompt, options },
        }
    }

    /// Structural checks applied before a request is emitted.
    pub fn validate(&self) -> Result<(), PayloadError> {
        if let Self::Choice { options, .. } = self {
            if options.len() < 2 {
                return Err(PayloadError::TooFewOptions(options.len()));
            }
            let mut seen = std::collections::HashSet::new();
            for option in options {
                if !seen.insert(option.id.as_str()) {
                    return Err(PayloadError::DuplicateOption(option.id.clone()));
                }
            }
        }
        Ok(())
    }

    /// Check that `response` answers this request.
    pub fn accepts(&self, response: &ApprovalResponsePayload) -> Result<(), PayloadError> {
        if self.kind() != response.kind() {
            return Err(PayloadError::KindMismatch {
                expected: self.kind(),
                actual: response.kind(),
            });
        }
        if let (
            Self::Choice { options, .. },
            ApprovalResponsePayload::Choice { selected_id },
        ) = (self, response)
            && !options.iter().any(|o| &o.id == selected_id)
        {
            return Err(PayloadError::UnknownOption(selected_id.clone()));
        }
        Ok(())
    }
}

/// The human's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ApprovalResponsePayload {
    Approval {
        approved: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Text {
        text: String,
    },
    Choice {
        #[serde(rename = "selectedId")]
        selected_id: String,
    },
}

impl ApprovalResponsePayload {
    pub fn kind(&self) -> ApprovalKind {
        match self {
            Self::Approval { .. } => ApprovalKind::Approval,
            Self::Text { .. } => ApprovalKind::Text,
            Self::Choice { .. } => ApprovalKind::Choice,
        }
    }
}
