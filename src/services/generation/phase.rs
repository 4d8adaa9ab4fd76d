//! Execution Phases and Progress Weights
//!
//! The ordered phase vocabulary for both workflows, the fixed weight table
//! that maps a phase plus an intra-phase percentage to an overall 0-100
//! progress value, and the per-task `PhaseCursor` the line parser mutates.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::generation::WorkflowKind;

/// Coarse stage of a workload's execution.
///
/// Build workflow: Idle → Planning → Coding → QaReview → QaFixing → Complete.
/// Ideation workflow: Analyzing → Generating → Finalizing → Complete.
/// `Failed` is the shared terminal failure state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Idle,
    Planning,
    Coding,
    QaReview,
    QaFixing,
    Analyzing,
    Generating,
    Finalizing,
    Complete,
    Failed,
}

impl std::fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExecutionPhase::Idle => "idle",
            ExecutionPhase::Planning => "planning",
            ExecutionPhase::Coding => "coding",
            ExecutionPhase::QaReview => "qa_review",
            ExecutionPhase::QaFixing => "qa_fixing",
            ExecutionPhase::Analyzing => "analyzing",
            ExecutionPhase::Generating => "generating",
            ExecutionPhase::Finalizing => "finalizing",
            ExecutionPhase::Complete => "complete",
            ExecutionPhase::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

impl ExecutionPhase {
    /// Parse a phase name as emitted in structured markers.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "idle" => Some(ExecutionPhase::Idle),
            "planning" => Some(ExecutionPhase::Planning),
            "coding" => Some(ExecutionPhase::Coding),
            "qa_review" => Some(ExecutionPhase::QaReview),
            "qa_fixing" => Some(ExecutionPhase::QaFixing),
            "analyzing" => Some(ExecutionPhase::Analyzing),
            "generating" | "discovering" => Some(ExecutionPhase::Generating),
            "finalizing" => Some(ExecutionPhase::Finalizing),
            "complete" => Some(ExecutionPhase::Complete),
            "failed" => Some(ExecutionPhase::Failed),
            _ => None,
        }
    }

    /// Terminal phases are sticky for heuristic parsing; only a new spawn or
    /// an explicit structured marker moves the cursor off them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionPhase::Complete | ExecutionPhase::Failed)
    }

    /// The declared phase ordering for a workflow, used to verify the weight
    /// table stays contiguous and monotonic.
    pub fn ordering(workflow: WorkflowKind) -> &'static [ExecutionPhase] {
        match workflow {
            WorkflowKind::Build => &[
                ExecutionPhase::Idle,
                ExecutionPhase::Planning,
                ExecutionPhase::Coding,
                ExecutionPhase::QaReview,
                ExecutionPhase::QaFixing,
                ExecutionPhase::Complete,
            ],
            WorkflowKind::Ideation => &[
                ExecutionPhase::Idle,
                ExecutionPhase::Analyzing,
                ExecutionPhase::Generating,
                ExecutionPhase::Finalizing,
                ExecutionPhase::Complete,
            ],
        }
    }
}

/// Fixed per-phase weight windows, `[start, end)` over the overall 0-100
/// progress scale. Declared once; must cover every `ExecutionPhase` value.
const WEIGHT_TABLE: &[(ExecutionPhase, u8, u8)] = &[
    (ExecutionPhase::Idle, 0, 0),
    (ExecutionPhase::Planning, 0, 15),
    (ExecutionPhase::Coding, 15, 60),
    (ExecutionPhase::QaReview, 60, 80),
    (ExecutionPhase::QaFixing, 80, 100),
    (ExecutionPhase::Analyzing, 0, 25),
    (ExecutionPhase::Generating, 25, 70),
    (ExecutionPhase::Finalizing, 70, 100),
    (ExecutionPhase::Complete, 100, 100),
    (ExecutionPhase::Failed, 100, 100),
];

/// Look up the weight window for a phase.
pub fn weight_range(phase: ExecutionPhase) -> Option<(u8, u8)> {
    WEIGHT_TABLE
        .iter()
        .find(|(p, _, _)| *p == phase)
        .map(|(_, start, end)| (*start, *end))
}

/// Map a phase plus an intra-phase percentage to overall progress.
///
/// A phase missing from the weight table is a configuration bug, not a user
/// error: log a diagnostic and return 0 rather than surfacing it.
pub fn overall_progress(phase: ExecutionPhase, intra_percent: u8) -> u8 {
    let Some((start, end)) = weight_range(phase) else {
        warn!(phase = %phase, "phase missing from weight table");
        return 0;
    };
    let intra = intra_percent.min(100) as f64 / 100.0;
    let span = (end - start) as f64;
    (start as f64 + span * intra).round() as u8
}

/// Whether a heuristic move from `current` to `candidate` walks progress
/// backwards. Compared by weight-window start, per the declared ordering.
pub fn is_regression(current: ExecutionPhase, candidate: ExecutionPhase) -> bool {
    match (weight_range(current), weight_range(candidate)) {
        (Some((cur_start, _)), Some((cand_start, _))) => cand_start < cur_start,
        _ => false,
    }
}

/// One decoded phase transition produced by the line parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTransition {
    /// The phase to move to (may equal the current phase)
    pub phase: ExecutionPhase,
    /// Optional human-readable message from the line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Optional sub-item label, e.g. "subtask 3/8"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_item: Option<String>,
    /// Sub-item identifier this line marks as completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_sub_item: Option<String>,
    /// New intra-phase percentage, when the line implies one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intra_percent: Option<u8>,
    /// True when decoded from a structured marker rather than a heuristic
    #[serde(default)]
    pub structured: bool,
}

impl PhaseTransition {
    /// Plain heuristic transition into a phase.
    pub fn heuristic(phase: ExecutionPhase) -> Self {
        Self {
            phase,
            message: None,
            sub_item: None,
            completed_sub_item: None,
            intra_percent: None,
            structured: false,
        }
    }

    /// Transition decoded from a structured marker.
    pub fn structured(phase: ExecutionPhase) -> Self {
        Self {
            structured: true,
            ..Self::heuristic(phase)
        }
    }

    /// Attach a message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Per-task progress cursor.
///
/// Mutated only by applying parser output sequentially in line order; a new
/// spawn for the same task key replaces the cursor wholesale.
#[derive(Debug, Clone)]
pub struct PhaseCursor {
    /// Current phase
    pub phase: ExecutionPhase,
    /// Intra-phase percentage (0-100)
    pub intra_percent: u8,
    /// Current sub-item label, if any
    pub sub_item: Option<String>,
    /// Sub-item identifiers already completed
    pub completed_sub_items: HashSet<String>,
    /// Expected total sub-items, for fan-out percentage computation
    pub expected_sub_items: Option<usize>,
}

impl PhaseCursor {
    /// Fresh cursor at the idle phase.
    pub fn new(expected_sub_items: Option<usize>) -> Self {
        Self {
            phase: ExecutionPhase::Idle,
            intra_percent: 0,
            sub_item: None,
            completed_sub_items: HashSet::new(),
            expected_sub_items,
        }
    }

    /// Apply one parser transition in line order.
    pub fn apply(&mut self, transition: &PhaseTransition) {
        if transition.phase != self.phase {
            self.phase = transition.phase;
            self.intra_percent = 0;
            self.sub_item = None;
        }
        if let Some(ref sub_item) = transition.sub_item {
            self.sub_item = Some(sub_item.clone());
        }
        if let Some(percent) = transition.intra_percent {
            self.intra_percent = percent.min(100);
        }
        if let Some(ref completed) = transition.completed_sub_item {
            self.mark_sub_item_complete(completed);
        }
    }

    /// Record a completed sub-item and recompute the fan-out percentage when
    /// the expected total is known.
    pub fn mark_sub_item_complete(&mut self, id: &str) {
        self.completed_sub_items.insert(id.to_string());
        if let Some(expected) = self.expected_sub_items {
            if expected > 0 {
                let done = self.completed_sub_items.len().min(expected);
                self.intra_percent = ((done * 100) / expected) as u8;
            }
        }
    }

    /// Overall 0-100 progress for display.
    pub fn overall(&self) -> u8 {
        overall_progress(self.phase, self.intra_percent)
    }
}
