//! Phase Protocol Parser
//!
//! Pure line classification: one line of process output plus the current
//! phase yields at most one `PhaseTransition`. A structured `PHASE_EVENT:`
//! marker is authoritative; everything else is best-effort keyword matching
//! with a non-regression guard so unrelated log noise never walks the
//! displayed progress backwards.
//!
//! Priority order, first match wins:
//! structured marker > terminal short-circuit > ideation phase keywords >
//! build phase keywords > sub-item progress > sub-item completion >
//! incomplete-build > failure.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::models::generation::WorkflowKind;

use super::phase::{is_regression, ExecutionPhase, PhaseTransition};

/// Reserved tag for structured phase events embedded in process output.
pub const PHASE_EVENT_TAG: &str = "PHASE_EVENT:";

/// Payload of a structured phase event line.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StructuredPhaseEvent {
    phase: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    sub_item: Option<String>,
    #[serde(default)]
    percent: Option<u8>,
}

struct Heuristics {
    analyzing: Regex,
    generating: Regex,
    finalizing: Regex,
    planning: Regex,
    coding: Regex,
    qa_review: Regex,
    qa_fixing: Regex,
    rework: Regex,
    subtask_progress: Regex,
    subtask_complete: Regex,
    incomplete_build: Regex,
    failure: Regex,
    failure_noise: Regex,
}

fn heuristics() -> &'static Heuristics {
    static HEURISTICS: OnceLock<Heuristics> = OnceLock::new();
    HEURISTICS.get_or_init(|| Heuristics {
        analyzing: Regex::new(r"(?i)\b(analyzing (the )?(project|codebase|repository)|analysis started)")
            .unwrap(),
        generating: Regex::new(r"(?i)\b(generating ideas?|discovering opportunities|drafting candidates)")
            .unwrap(),
        finalizing: Regex::new(r"(?i)\b(finalizing|writing results?|assembling output)").unwrap(),
        planning: Regex::new(r"(?i)\b(planning phase|creating (the )?plan|drafting implementation plan)")
            .unwrap(),
        coding: Regex::new(r"(?i)\b(starting implementation|implementing|writing code|coding phase)")
            .unwrap(),
        qa_review: Regex::new(r"(?i)\b(qa review|reviewing changes|running qa checks)").unwrap(),
        qa_fixing: Regex::new(r"(?i)\b(qa fix round|fixing qa findings|applying fixes)").unwrap(),
        rework: Regex::new(r"(?i)\breopening implementation\b").unwrap(),
        subtask_progress: Regex::new(r"(?i)\bsubtask (\d+)\s*/\s*(\d+)\b").unwrap(),
        subtask_complete: Regex::new(r"(?i)\b(?:completed|finished) subtask ([A-Za-z0-9_-]+)\b")
            .unwrap(),
        incomplete_build: Regex::new(r"(?i)\b(build (is )?incomplete|compilation incomplete)\b")
            .unwrap(),
        failure: Regex::new(
            r"(?i)\b(fatal error|workflow failed|generation failed|unrecoverable error|failed with exit code)\b",
        )
        .unwrap(),
        // The regex crate has no lookaheads; tool noise that merely mentions
        // errors is excluded by a pre-check instead.
        failure_noise: Regex::new(r"(?i)(0 errors|no errors|error-free|errorboundary|warning)")
            .unwrap(),
    })
}

/// Classify one output line against the current phase.
///
/// Returns `None` when the line carries no phase information, when the
/// current phase is terminal and the line is not a structured marker, or
/// when a heuristic match is suppressed by the non-regression guard.
pub fn parse_line(
    line: &str,
    current: ExecutionPhase,
    workflow: WorkflowKind,
) -> Option<PhaseTransition> {
    // Structured markers are the single source of truth: they bypass the
    // terminal short-circuit and the regression guard.
    if let Some(idx) = line.find(PHASE_EVENT_TAG) {
        return parse_structured(&line[idx + PHASE_EVENT_TAG.len()..]);
    }

    // Terminal phases are sticky until a new spawn resets the cursor.
    if current.is_terminal() {
        return None;
    }

    let h = heuristics();
    let trimmed = line.trim();

    // Workflow-variant phases first, then the general build vocabulary.
    if workflow == WorkflowKind::Ideation {
        for (re, phase) in [
            (&h.analyzing, ExecutionPhase::Analyzing),
            (&h.generating, ExecutionPhase::Generating),
            (&h.finalizing, ExecutionPhase::Finalizing),
        ] {
            if re.is_match(trimmed) {
                return guarded(current, phase, trimmed);
            }
        }
    }

    // QA rework is the one sanctioned re-entry into coding; it only applies
    // while a QA phase is active and is not ordinary regression.
    if h.rework.is_match(trimmed)
        && matches!(current, ExecutionPhase::QaReview | ExecutionPhase::QaFixing)
    {
        return Some(PhaseTransition::heuristic(ExecutionPhase::Coding).with_message(trimmed));
    }

    for (re, phase) in [
        (&h.planning, ExecutionPhase::Planning),
        (&h.coding, ExecutionPhase::Coding),
        (&h.qa_review, ExecutionPhase::QaReview),
        (&h.qa_fixing, ExecutionPhase::QaFixing),
    ] {
        if re.is_match(trimmed) {
            return guarded(current, phase, trimmed);
        }
    }

    // Unit progress is only meaningful while implementing.
    if current == ExecutionPhase::Coding {
        if let Some(caps) = h.subtask_progress.captures(trimmed) {
            let index: u32 = caps[1].parse().ok()?;
            let total: u32 = caps[2].parse().ok()?;
            if total == 0 || index == 0 {
                return None;
            }
            let label = format!("subtask {}/{}", index, total);
            return Some(PhaseTransition {
                sub_item: Some(label),
                intra_percent: Some((((index - 1) * 100) / total).min(100) as u8),
                ..PhaseTransition::heuristic(ExecutionPhase::Coding).with_message(trimmed)
            });
        }
    }

    // Unit completion is accepted from implementation or the later QA phases.
    if matches!(
        current,
        ExecutionPhase::Coding | ExecutionPhase::QaReview | ExecutionPhase::QaFixing
    ) {
        if let Some(caps) = h.subtask_complete.captures(trimmed) {
            return Some(PhaseTransition {
                completed_sub_item: Some(caps[1].to_string()),
                ..PhaseTransition::heuristic(current).with_message(trimmed)
            });
        }
    }

    if h.incomplete_build.is_match(trimmed) {
        return guarded(current, ExecutionPhase::QaFixing, trimmed);
    }

    if h.failure.is_match(trimmed) && !h.failure_noise.is_match(trimmed) {
        return Some(PhaseTransition::heuristic(ExecutionPhase::Failed).with_message(trimmed));
    }

    None
}

fn guarded(current: ExecutionPhase, candidate: ExecutionPhase, line: &str) -> Option<PhaseTransition> {
    if is_regression(current, candidate) {
        debug!(
            current = %current,
            candidate = %candidate,
            "suppressed regressive heuristic transition"
        );
        return None;
    }
    Some(PhaseTransition::heuristic(candidate).with_message(line))
}

fn parse_structured(payload: &str) -> Option<PhaseTransition> {
    let event: StructuredPhaseEvent = match serde_json::from_str(payload.trim()) {
        Ok(event) => event,
        Err(e) => {
            debug!(error = %e, "ignoring malformed structured phase event");
            return None;
        }
    };
    let Some(phase) = ExecutionPhase::from_name(&event.phase) else {
        debug!(phase = %event.phase, "structured event names unknown phase");
        return None;
    };
    Some(PhaseTransition {
        message: event.message,
        sub_item: event.sub_item,
        intra_percent: event.percent.map(|p| p.min(100)),
        ..PhaseTransition::structured(phase)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_build(line: &str, current: ExecutionPhase) -> Option<PhaseTransition> {
        parse_line(line, current, WorkflowKind::Build)
    }

    // ========================================================================
    // Structured markers
    // ========================================================================

    #[test]
    fn test_structured_marker_decodes() {
        let t = parse_build(
            r#"PHASE_EVENT:{"phase":"coding","message":"starting","subItem":"subtask 1/4"}"#,
            ExecutionPhase::Idle,
        )
        .unwrap();
        assert_eq!(t.phase, ExecutionPhase::Coding);
        assert_eq!(t.message.as_deref(), Some("starting"));
        assert_eq!(t.sub_item.as_deref(), Some("subtask 1/4"));
        assert!(t.structured);
    }

    #[test]
    fn test_structured_marker_with_prefix_noise() {
        let t = parse_build(
            r#"[runner] PHASE_EVENT:{"phase":"qa_review"}"#,
            ExecutionPhase::Coding,
        )
        .unwrap();
        assert_eq!(t.phase, ExecutionPhase::QaReview);
    }

    #[test]
    fn test_structured_marker_overrides_terminal() {
        let t = parse_build(
            r#"PHASE_EVENT:{"phase":"coding"}"#,
            ExecutionPhase::Complete,
        )
        .unwrap();
        assert_eq!(t.phase, ExecutionPhase::Coding);
    }

    #[test]
    fn test_structured_marker_allows_regression() {
        let t = parse_build(
            r#"PHASE_EVENT:{"phase":"planning"}"#,
            ExecutionPhase::QaFixing,
        )
        .unwrap();
        assert_eq!(t.phase, ExecutionPhase::Planning);
    }

    #[test]
    fn test_malformed_structured_marker_ignored() {
        assert!(parse_build("PHASE_EVENT:{not json", ExecutionPhase::Idle).is_none());
        assert!(parse_build(
            r#"PHASE_EVENT:{"phase":"warp-speed"}"#,
            ExecutionPhase::Idle
        )
        .is_none());
    }

    // ========================================================================
    // Terminal stickiness and the non-regression guard
    // ========================================================================

    #[test]
    fn test_terminal_phase_is_sticky_for_heuristics() {
        assert!(parse_build("starting implementation", ExecutionPhase::Complete).is_none());
        assert!(parse_build("fatal error: boom", ExecutionPhase::Failed).is_none());
    }

    #[test]
    fn test_regression_suppressed() {
        assert!(parse_build("planning phase started", ExecutionPhase::Coding).is_none());
        assert!(parse_build("starting implementation", ExecutionPhase::QaReview).is_none());
    }

    #[test]
    fn test_forward_transitions_accepted() {
        let t = parse_build("qa review started", ExecutionPhase::Coding).unwrap();
        assert_eq!(t.phase, ExecutionPhase::QaReview);

        let t = parse_build("qa fix round 2", ExecutionPhase::QaReview).unwrap();
        assert_eq!(t.phase, ExecutionPhase::QaFixing);
    }

    #[test]
    fn test_rework_reentry_only_from_qa() {
        let t = parse_build("reopening implementation for finding F-3", ExecutionPhase::QaReview)
            .unwrap();
        assert_eq!(t.phase, ExecutionPhase::Coding);

        // Outside a QA phase the same line is not a sanctioned regression.
        assert!(parse_build("reopening implementation", ExecutionPhase::Planning).is_none());
    }

    // ========================================================================
    // Ideation workflow vocabulary
    // ========================================================================

    #[test]
    fn test_ideation_phases_recognized() {
        let t = parse_line(
            "Analyzing the codebase for context",
            ExecutionPhase::Idle,
            WorkflowKind::Ideation,
        )
        .unwrap();
        assert_eq!(t.phase, ExecutionPhase::Analyzing);

        let t = parse_line(
            "generating ideas for security",
            ExecutionPhase::Analyzing,
            WorkflowKind::Ideation,
        )
        .unwrap();
        assert_eq!(t.phase, ExecutionPhase::Generating);
    }

    #[test]
    fn test_ideation_vocabulary_inert_in_build_workflow() {
        assert!(parse_build("generating ideas for security", ExecutionPhase::Idle).is_none());
    }

    // ========================================================================
    // Sub-items
    // ========================================================================

    #[test]
    fn test_subtask_progress_in_coding_phase() {
        let t = parse_build("working on subtask 3/8: wire auth", ExecutionPhase::Coding).unwrap();
        assert_eq!(t.sub_item.as_deref(), Some("subtask 3/8"));
        assert_eq!(t.intra_percent, Some(25));
        assert_eq!(t.phase, ExecutionPhase::Coding);
    }

    #[test]
    fn test_subtask_progress_ignored_outside_coding() {
        assert!(parse_build("working on subtask 3/8", ExecutionPhase::Planning).is_none());
        assert!(parse_build("working on subtask 3/8", ExecutionPhase::QaReview).is_none());
    }

    #[test]
    fn test_subtask_completion_from_coding_and_qa() {
        for current in [
            ExecutionPhase::Coding,
            ExecutionPhase::QaReview,
            ExecutionPhase::QaFixing,
        ] {
            let t = parse_build("completed subtask auth-wiring", current).unwrap();
            assert_eq!(t.completed_sub_item.as_deref(), Some("auth-wiring"));
            assert_eq!(t.phase, current);
        }
        assert!(parse_build("completed subtask auth-wiring", ExecutionPhase::Planning).is_none());
    }

    // ========================================================================
    // Failure detection
    // ========================================================================

    #[test]
    fn test_failure_detected() {
        let t = parse_build("workflow failed: out of retries", ExecutionPhase::Coding).unwrap();
        assert_eq!(t.phase, ExecutionPhase::Failed);
    }

    #[test]
    fn test_failure_noise_excluded() {
        assert!(parse_build("build finished, 0 errors, fatal error count: 0", ExecutionPhase::Coding)
            .is_none());
        assert!(parse_build("warning: fatal error handling is deprecated", ExecutionPhase::Coding)
            .is_none());
        assert!(parse_build("rendering <ErrorBoundary> generation failed fallback", ExecutionPhase::Coding)
            .is_none());
    }

    #[test]
    fn test_incomplete_build_moves_to_qa_fixing() {
        let t = parse_build("build incomplete: 3 modules unresolved", ExecutionPhase::QaReview)
            .unwrap();
        assert_eq!(t.phase, ExecutionPhase::QaFixing);
    }

    #[test]
    fn test_plain_noise_yields_nothing() {
        assert!(parse_build("npm WARN deprecated package", ExecutionPhase::Coding).is_none());
        assert!(parse_build("", ExecutionPhase::Idle).is_none());
    }

    // ========================================================================
    // Monotonicity property
    // ========================================================================

    #[test]
    fn test_heuristic_sequence_never_regresses() {
        use super::super::phase::{weight_range, PhaseCursor};

        let lines = [
            "planning phase started",
            "starting implementation",
            "working on subtask 1/2",
            "planning phase started", // noise, must be suppressed
            "qa review started",
            "starting implementation", // noise, must be suppressed
            "qa fix round 1",
        ];

        let mut cursor = PhaseCursor::new(None);
        let mut max_start = 0u8;
        for line in lines {
            if let Some(t) = parse_build(line, cursor.phase) {
                cursor.apply(&t);
            }
            let (start, _) = weight_range(cursor.phase).unwrap();
            assert!(start >= max_start, "regressed at line: {}", line);
            max_start = max_start.max(start);
        }
        assert_eq!(cursor.phase, ExecutionPhase::QaFixing);
    }
}
