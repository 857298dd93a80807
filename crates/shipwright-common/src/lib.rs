//! Shared domain types for shipwright.
//!
//! Everything here is plain data plus the checks that belong to the data
//! itself: the phase order, approval payload rules, and phase output
//! schemas. No I/O.

pub mod approval;
pub mod gate;
pub mod memory;
pub mod outputs;
pub mod phase;
pub mod review;

pub use approval::{
    ApprovalKind, ApprovalRequestPayload, ApprovalResponsePayload, ChoiceOption, PayloadError,
};
pub use gate::{GateName, GateResult, GateStatus, all_gates_passed, skipped_gates};
pub use memory::{MemoryKind, MemoryRecord, render_memories};
pub use outputs::{
    AnalysisOutput, Approach, ApproachesOutput, ChangeType, CoderReport, FileChange,
    ImplementationOutput, JudgingDraft, JudgingOutput, PrOutput, SchemaError, Validate, from_value,
};
pub use phase::{Phase, PhaseStatus};
pub use review::{Condition, Finding, Severity, Verdict};
