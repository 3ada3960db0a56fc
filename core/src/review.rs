//! Decision-token parsing for reviewer and coordinator output.

/// Reviewer verdict token: `DECISION: APPROVE` or `DECISION: REJECT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Approve,
    Reject,
}

/// Find the last decision token in a reviewer's output. The last one wins so
/// a reviewer that quotes the instructions before deciding is still parsed
/// correctly.
pub fn parse_review_decision(text: &str) -> Option<ReviewDecision> {
    let mut decision = None;
    for line in text.lines() {
        let Some(rest) = line.trim().strip_prefix("DECISION:") else {
            continue;
        };
        match rest.trim() {
            "APPROVE" => decision = Some(ReviewDecision::Approve),
            "REJECT" => decision = Some(ReviewDecision::Reject),
            _ => {}
        }
    }
    decision
}

/// Scan free-form text (e.g. a JSONL transcript) for a decision token.
pub fn scan_for_decision(text: &str) -> Option<ReviewDecision> {
    let approve = text.rfind("DECISION: APPROVE");
    let reject = text.rfind("DECISION: REJECT");
    match (approve, reject) {
        (Some(a), Some(r)) if a > r => Some(ReviewDecision::Approve),
        (Some(_), Some(_)) => Some(ReviewDecision::Reject),
        (Some(_), None) => Some(ReviewDecision::Approve),
        (None, Some(_)) => Some(ReviewDecision::Reject),
        (None, None) => None,
    }
}

/// What the coordinator tells the loop to do about a rejection spiral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorDecision {
    GuideCoder,
    OverrideReviewer,
    NarrowScope,
}

impl CoordinatorDecision {
    pub const fn as_str(self) -> &'static str {
        match self {
            CoordinatorDecision::GuideCoder => "guide_coder",
            CoordinatorDecision::OverrideReviewer => "override_reviewer",
            CoordinatorDecision::NarrowScope => "narrow_scope",
        }
    }
}

/// Guidance attached to the next coder and reviewer invocations as
/// read-only context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorGuidance {
    pub decision: CoordinatorDecision,
    pub guidance: String,
}

const GUIDANCE_WORD_LIMIT: usize = 500;

/// Parse the coordinator's structured response:
/// a `DECISION:` line followed by a `GUIDANCE:` block (≤ 500 words; longer
/// guidance is truncated, not rejected).
pub fn parse_coordinator_response(text: &str) -> Option<CoordinatorGuidance> {
    let mut decision = None;
    let mut guidance_lines: Vec<&str> = Vec::new();
    let mut in_guidance = false;
    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("DECISION:") {
            in_guidance = false;
            decision = match rest.trim() {
                "guide_coder" => Some(CoordinatorDecision::GuideCoder),
                "override_reviewer" => Some(CoordinatorDecision::OverrideReviewer),
                "narrow_scope" => Some(CoordinatorDecision::NarrowScope),
                _ => decision,
            };
        } else if let Some(rest) = trimmed.strip_prefix("GUIDANCE:") {
            in_guidance = true;
            if !rest.trim().is_empty() {
                guidance_lines.push(rest.trim());
            }
        } else if in_guidance {
            guidance_lines.push(line);
        }
    }
    let decision = decision?;
    let guidance = truncate_words(&guidance_lines.join("\n"), GUIDANCE_WORD_LIMIT);
    Some(CoordinatorGuidance { decision, guidance })
}

fn truncate_words(text: &str, limit: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= limit {
        return text.trim().to_string();
    }
    words[..limit].join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn last_decision_token_wins() {
        let text = "The instructions say to end with DECISION: APPROVE or reject.\n\
                    I found problems.\n\
                    DECISION: REJECT\n";
        assert_eq!(parse_review_decision(text), Some(ReviewDecision::Reject));
        assert_eq!(parse_review_decision("no verdict here"), None);
    }

    #[test]
    fn transcript_scan_picks_the_later_token() {
        let log = r#"{"event":"stdout","data":"DECISION: REJECT"}
{"event":"stdout","data":"corrected: DECISION: APPROVE"}"#;
        assert_eq!(scan_for_decision(log), Some(ReviewDecision::Approve));
        assert_eq!(scan_for_decision("nothing"), None);
    }

    #[test]
    fn coordinator_response_parses_decision_and_guidance() {
        let text = "DECISION: guide_coder\nGUIDANCE: Focus on the failing test.\nKeep the API stable.\n";
        let parsed = parse_coordinator_response(text).expect("parse");
        assert_eq!(parsed.decision, CoordinatorDecision::GuideCoder);
        assert!(parsed.guidance.contains("failing test"));
        assert!(parsed.guidance.contains("API stable"));
    }

    #[test]
    fn coordinator_guidance_is_word_capped() {
        let long = format!("DECISION: narrow_scope\nGUIDANCE: {}", "word ".repeat(800));
        let parsed = parse_coordinator_response(&long).expect("parse");
        assert_eq!(parsed.guidance.split_whitespace().count(), 500);
    }

    #[test]
    fn malformed_coordinator_response_is_none() {
        assert_eq!(parse_coordinator_response("DECISION: do_everything"), None);
        assert_eq!(parse_coordinator_response("no structure"), None);
    }
}
