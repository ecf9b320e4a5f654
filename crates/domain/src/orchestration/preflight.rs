//! `preflightAnswer` (§4.5.6) — a heuristic check run by CHAPO over a draft
//! final answer before it is sent to the user, checking it against the
//! turn's open blocking obligations (or an explicit `must_address` list).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::{Obligation, ObligationStatus};

const STOPWORDS: &[&str] = &[
    "that", "this", "with", "from", "have", "will", "your", "about", "what",
    "when", "where", "which", "there", "their", "they", "them", "then",
    "than", "into", "onto", "also", "been", "being", "does", "done", "just",
    "like", "more", "most", "some", "such", "over", "under", "only", "very",
    "each", "every", "other", "should", "could", "would", "these", "those",
];

const POSITIVE_COMPLETION_MARKERS: &[&str] = &[
    "done", "completed", "finished", "fertig", "erledigt", "abgeschlossen",
];
const NEGATIVE_COMPLETION_MARKERS: &[&str] = &[
    "couldn't", "could not", "unable to", "failed to", "not done",
    "nicht fertig", "konnte nicht",
];
const EVIDENCE_MARKERS: &[&str] = &["id:", "id=", "status:", "status=", "result:", "result="];
const EXTERNAL_ACTION_VERBS: &[&str] = &[
    "created", "deployed", "merged", "pushed", "sent", "deleted", "restarted",
    "rolled back", "provisioned", "erstellt",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightResult {
    pub ok: bool,
    pub issues: Vec<PreflightIssue>,
    pub score: f64,
    pub checked_items: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    MissingAnswer,
    Contradiction,
    UnverifiedClaim,
    LanguageMismatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightIssue {
    pub kind: IssueKind,
    pub detail: String,
}

/// Run the preflight check over `draft`.
///
/// `must_address` defaults to the descriptions of open blocking obligations
/// for the active turn (capped at 10, matching the spec) when empty.
/// `original_request` is used only for the language-mismatch heuristic.
pub fn preflight_answer(
    draft: &str,
    must_address: &[String],
    obligations: &[Obligation],
    active_turn_id: Option<&str>,
    original_request: Option<&str>,
    strict: bool,
) -> PreflightResult {
    let mut issues = Vec::new();

    if draft.trim().is_empty() {
        issues.push(PreflightIssue {
            kind: IssueKind::MissingAnswer,
            detail: "draft answer is empty".into(),
        });
        return PreflightResult {
            ok: false,
            issues,
            score: 0.0,
            checked_items: Vec::new(),
        };
    }

    let checked_items: Vec<String> = if !must_address.is_empty() {
        must_address.to_vec()
    } else {
        obligations
            .iter()
            .filter(|o| {
                o.blocking
                    && o.status == ObligationStatus::Open
                    && active_turn_id.is_some_and(|t| o.turn_id == t)
            })
            .take(10)
            .map(|o| o.description.clone())
            .collect()
    };

    let draft_lower = draft.to_lowercase();
    let draft_tokens = tokenize(&draft_lower);

    let mut missing = 0usize;
    for item in &checked_items {
        let item_lower = item.to_lowercase();
        let item_tokens = tokenize(&item_lower);
        if item_tokens.is_empty() {
            continue;
        }
        let required = std::cmp::max(2, (0.4 * item_tokens.len() as f64).ceil() as usize);
        let matches = item_tokens.iter().filter(|t| draft_tokens.contains(*t)).count();
        let ok = if item_tokens.len() <= 2 {
            matches >= 1
        } else {
            matches >= required
        };
        if !ok {
            missing += 1;
            issues.push(PreflightIssue {
                kind: IssueKind::MissingAnswer,
                detail: format!("answer does not appear to address: {item}"),
            });
        }
    }

    let has_positive = POSITIVE_COMPLETION_MARKERS.iter().any(|m| draft_lower.contains(m));
    let has_negative = NEGATIVE_COMPLETION_MARKERS.iter().any(|m| draft_lower.contains(m));
    let mut contradiction = 0usize;
    if has_positive && has_negative {
        contradiction = 1;
        issues.push(PreflightIssue {
            kind: IssueKind::Contradiction,
            detail: "draft contains both a completion claim and a failure/incompletion claim".into(),
        });
    }

    let claims_external_action = EXTERNAL_ACTION_VERBS.iter().any(|v| draft_lower.contains(v));
    let has_evidence = EVIDENCE_MARKERS.iter().any(|m| draft_lower.contains(m));
    let mut unverified = 0usize;
    if claims_external_action && !has_evidence {
        unverified = 1;
        issues.push(PreflightIssue {
            kind: IssueKind::UnverifiedClaim,
            detail: "draft claims an external action without an id/status/result marker as evidence".into(),
        });
    }

    let mut language = 0usize;
    if let Some(orig) = original_request {
        if !orig.trim().is_empty() && detect_language(orig) != detect_language(draft) {
            language = 1;
            issues.push(PreflightIssue {
                kind: IssueKind::LanguageMismatch,
                detail: "draft answer's language does not match the original request's language".into(),
            });
        }
    }

    let score = (1.0
        - 0.18 * missing as f64
        - 0.35 * contradiction as f64
        - 0.2 * unverified as f64
        - 0.1 * language as f64)
        .clamp(0.0, 1.0);

    let ok = if strict {
        issues.is_empty()
    } else {
        score >= 0.75 && contradiction == 0
    };

    PreflightResult {
        ok,
        issues,
        score,
        checked_items,
    }
}

fn tokenize(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 4)
        .filter(|w| !STOPWORDS.contains(w))
        .map(|w| w.to_string())
        .collect()
}

/// Crude DE/EN bigram heuristic: counts hits against a small set of
/// high-frequency function-word bigrams for each language and picks
/// whichever has more. Ties (including both-zero, e.g. for very short or
/// non-DE/EN text) default to English.
fn detect_language(s: &str) -> &'static str {
    let lower = s.to_lowercase();
    let de_markers = ["der ", "die ", "das ", "und ", "ich ", "nicht ", "ist ", "mit ", "für "];
    let en_markers = ["the ", "and ", "you ", "is ", "with ", "for ", "will ", "not ", "this "];

    let de_hits = de_markers.iter().filter(|m| lower.contains(*m)).count();
    let en_hits = en_markers.iter().filter(|m| lower.contains(*m)).count();

    if de_hits > en_hits {
        "de"
    } else {
        "en"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::ObligationOrigin;

    fn obligation(turn: &str, desc: &str, blocking: bool, status: ObligationStatus) -> Obligation {
        let mut o = Obligation::new(turn, ObligationOrigin::Primary, blocking, "outcome", desc);
        o.status = status;
        o
    }

    #[test]
    fn empty_draft_is_missing_answer() {
        let result = preflight_answer("", &[], &[], Some("t1"), None, false);
        assert!(!result.ok);
        assert_eq!(result.issues.len(), 1);
        assert_eq!(result.issues[0].kind, IssueKind::MissingAnswer);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn addresses_all_obligations_scores_high() {
        let obls = vec![obligation(
            "t1",
            "write the configuration file to disk",
            true,
            ObligationStatus::Open,
        )];
        let draft = "I wrote the configuration file to disk as requested.";
        let result = preflight_answer(draft, &[], &obls, Some("t1"), None, false);
        assert!(result.ok, "issues: {:?}", result.issues);
        assert!(result.issues.is_empty());
        assert_eq!(result.score, 1.0);
    }

    #[test]
    fn missing_obligation_coverage_flagged() {
        let obls = vec![obligation(
            "t1",
            "deploy the staging environment and notify the team",
            true,
            ObligationStatus::Open,
        )];
        let draft = "Here's a summary of unrelated things.";
        let result = preflight_answer(draft, &[], &obls, Some("t1"), None, false);
        assert!(!result.ok);
        assert!(result.issues.iter().any(|i| i.kind == IssueKind::MissingAnswer));
    }

    #[test]
    fn non_blocking_obligations_are_not_checked() {
        let obls = vec![obligation(
            "t1",
            "optional nice to have thing",
            false,
            ObligationStatus::Open,
        )];
        let result = preflight_answer("unrelated text entirely", &[], &obls, Some("t1"), None, false);
        assert!(result.ok);
    }

    #[test]
    fn resolved_obligations_are_not_checked() {
        let obls = vec![obligation(
            "t1",
            "deploy the staging environment",
            true,
            ObligationStatus::Satisfied,
        )];
        let result = preflight_answer("unrelated text entirely", &[], &obls, Some("t1"), None, false);
        assert!(result.ok);
    }

    #[test]
    fn other_turn_obligations_are_not_checked() {
        let obls = vec![obligation(
            "t0",
            "deploy the staging environment",
            true,
            ObligationStatus::Open,
        )];
        let result = preflight_answer("unrelated text entirely", &[], &obls, Some("t1"), None, false);
        assert!(result.ok);
    }

    #[test]
    fn explicit_must_address_overrides_obligations() {
        let result = preflight_answer(
            "I restarted the service.",
            &["restart the service".to_string()],
            &[],
            None,
            None,
            false,
        );
        assert!(result.ok);
    }

    #[test]
    fn contradiction_detected() {
        let result = preflight_answer(
            "The task is done, but I was unable to finish the upload.",
            &[],
            &[],
            None,
            None,
            false,
        );
        assert!(!result.ok);
        assert!(result.issues.iter().any(|i| i.kind == IssueKind::Contradiction));
    }

    #[test]
    fn unverified_external_action_claim_detected() {
        let result = preflight_answer(
            "I deployed the new release to production.",
            &[],
            &[],
            None,
            None,
            false,
        );
        assert!(result.issues.iter().any(|i| i.kind == IssueKind::UnverifiedClaim));
    }

    #[test]
    fn external_action_claim_with_evidence_is_fine() {
        let result = preflight_answer(
            "I deployed the new release. status: success id: run-482",
            &[],
            &[],
            None,
            None,
            false,
        );
        assert!(!result.issues.iter().any(|i| i.kind == IssueKind::UnverifiedClaim));
    }

    #[test]
    fn language_mismatch_detected() {
        let result = preflight_answer(
            "Der Auftrag ist fertig und ich habe die Datei nicht gefunden.",
            &[],
            &[],
            None,
            Some("Can you please check if this file exists and tell me the result?"),
            false,
        );
        assert!(result.issues.iter().any(|i| i.kind == IssueKind::LanguageMismatch));
    }

    #[test]
    fn strict_mode_fails_on_any_issue() {
        let result = preflight_answer(
            "I deployed the new release.",
            &[],
            &[],
            None,
            None,
            true,
        );
        assert!(!result.issues.is_empty());
        assert!(!result.ok, "strict mode must fail when any issue is present");
    }

    #[test]
    fn non_strict_tolerates_a_single_minor_issue() {
        // One missing-answer issue only costs 0.18 off a perfect score —
        // still above the 0.75 threshold.
        let obls = vec![
            obligation("t1", "write notes", true, ObligationStatus::Open),
            obligation("t1", "send an email to the team lead", true, ObligationStatus::Open),
        ];
        let draft = "I wrote notes as requested.";
        let result = preflight_answer(draft, &[], &obls, Some("t1"), None, false);
        assert!(result.score > 0.7 && result.score < 1.0);
    }
}
