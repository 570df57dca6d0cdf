//! Verifier: score every surviving candidate and pick the winner.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::evidence::{render_evidence, EvidenceItem};
use super::planner::Plan;
use super::solver::Candidate;
use super::{execute, require_unit, PassError, PassOutcome, PassRequest};
use crate::gateway::Message;
use crate::run::context::RunContext;
use crate::run::model::PassType;

const SYSTEM: &str = "You are the verification stage of a reasoning pipeline. Judge \
each candidate answer against the goal, its required outputs and any evidence. Give \
each candidate a score from 0 (wrong or unusable) to 1 (correct and complete), decide \
whether it passes, and explain briefly. Judge every candidate listed, using its \
number as `candidate`.\n\n\
Respond with only a JSON object:\n\
{\"checks\": [{\"candidate\": integer, \"score\": number, \"pass\": boolean, \
\"rationale\": string}]}";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CandidateCheck {
    pub candidate: u32,
    pub score: f64,
    pub pass: bool,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Verdict {
    pub checks: Vec<CandidateCheck>,
}

impl Verdict {
    /// Exactly one check per expected candidate, scores in `[0, 1]`.
    pub fn validate(&self, expected: &BTreeSet<u32>) -> Result<(), String> {
        let mut seen = BTreeSet::new();
        for check in &self.checks {
            if !expected.contains(&check.candidate) {
                return Err(format!("check for unknown candidate {}", check.candidate));
            }
            if !seen.insert(check.candidate) {
                return Err(format!("candidate {} checked twice", check.candidate));
            }
            require_unit("score", check.score)?;
        }
        if let Some(missing) = expected.difference(&seen).next() {
            return Err(format!("no check for candidate {missing}"));
        }
        Ok(())
    }
}

/// What the run returns after verification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Selection {
    /// Candidate whose output becomes the run's result.
    pub chosen: u32,
    pub score: f64,
    /// Set only when some candidate passed.
    pub winner: Option<u32>,
    /// No candidate passed, or the winner scored under the threshold.
    pub degraded: bool,
}

/// Highest score first, lowest index on ties.
fn best<'a>(checks: impl Iterator<Item = &'a CandidateCheck>) -> Option<&'a CandidateCheck> {
    checks.max_by(|a, b| {
        a.score
            .total_cmp(&b.score)
            .then_with(|| b.candidate.cmp(&a.candidate))
    })
}

/// Winner among passing candidates; falls back to the best-scoring
/// candidate overall, marked degraded.
pub fn select(checks: &[CandidateCheck], threshold: f64) -> Option<Selection> {
    if let Some(w) = best(checks.iter().filter(|c| c.pass)) {
        return Some(Selection {
            chosen: w.candidate,
            score: w.score,
            winner: Some(w.candidate),
            degraded: w.score < threshold,
        });
    }
    best(checks.iter()).map(|top| Selection {
        chosen: top.candidate,
        score: top.score,
        winner: None,
        degraded: true,
    })
}

pub fn request(
    ctx: &RunContext,
    plan: &Plan,
    evidence: &[EvidenceItem],
    candidates: &[Candidate],
) -> PassRequest {
    let mut user = plan.render();
    if !evidence.is_empty() {
        user.push_str("\n\nEvidence:\n");
        user.push_str(&render_evidence(evidence));
    }
    user.push_str("\n\nCandidates:");
    for c in candidates {
        user.push_str(&format!(
            "\n\n### Candidate {} (self-rated confidence {:.2})\n{}",
            c.index,
            c.solution.confidence,
            c.solution.solution.trim()
        ));
        if !c.solution.citations.is_empty() {
            user.push_str(&format!("\nCites: {}", c.solution.citations.join(", ")));
        }
    }

    PassRequest {
        pass_type: PassType::Verifier,
        candidate_index: None,
        messages: vec![Message::system(SYSTEM), Message::user(user)],
        temperature: ctx.lane.verifier_temperature,
        signature: ctx.signature(None),
    }
}

pub async fn run(
    ctx: &RunContext,
    req: PassRequest,
    candidates: &[Candidate],
) -> Result<PassOutcome<Verdict>, PassError> {
    let expected: BTreeSet<u32> = candidates.iter().map(|c| c.index).collect();
    execute(ctx, req, |v: &Verdict| v.validate(&expected)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(candidate: u32, score: f64, pass: bool) -> CandidateCheck {
        CandidateCheck {
            candidate,
            score,
            pass,
            rationale: String::new(),
        }
    }

    #[test]
    fn test_highest_passing_score_wins() {
        let checks = vec![check(0, 0.95, false), check(1, 0.8, true), check(2, 0.85, true)];
        let sel = select(&checks, 0.7).unwrap();
        assert_eq!(sel.winner, Some(2));
        assert_eq!(sel.chosen, 2);
        assert!(!sel.degraded);
    }

    #[test]
    fn test_ties_go_to_lowest_index() {
        let checks = vec![check(3, 0.9, true), check(1, 0.9, true), check(2, 0.9, true)];
        assert_eq!(select(&checks, 0.5).unwrap().winner, Some(1));
    }

    #[test]
    fn test_winner_below_threshold_is_degraded() {
        let checks = vec![check(0, 0.6, true), check(1, 0.4, true)];
        let sel = select(&checks, 0.7).unwrap();
        assert_eq!(sel.winner, Some(0));
        assert!(sel.degraded);
    }

    #[test]
    fn test_no_passing_candidate_falls_back_to_top_score() {
        let checks = vec![check(0, 0.3, false), check(1, 0.5, false), check(2, 0.5, false)];
        let sel = select(&checks, 0.7).unwrap();
        assert_eq!(sel.winner, None);
        assert_eq!(sel.chosen, 1);
        assert!(sel.degraded);
        assert!(select(&[], 0.7).is_none());
    }

    #[test]
    fn test_verdict_must_cover_every_candidate_once() {
        let expected: BTreeSet<u32> = [0, 2, 4].into_iter().collect();
        let full = Verdict {
            checks: vec![check(0, 0.5, true), check(2, 0.1, false), check(4, 1.0, true)],
        };
        assert!(full.validate(&expected).is_ok());

        let missing = Verdict {
            checks: vec![check(0, 0.5, true), check(2, 0.1, false)],
        };
        assert!(missing.validate(&expected).unwrap_err().contains("candidate 4"));

        let unknown = Verdict {
            checks: vec![check(0, 0.5, true), check(1, 0.5, true), check(2, 0.1, false), check(4, 1.0, true)],
        };
        assert!(unknown.validate(&expected).is_err());

        let twice = Verdict {
            checks: vec![check(0, 0.5, true), check(0, 0.6, true), check(2, 0.1, false), check(4, 1.0, true)],
        };
        assert!(twice.validate(&expected).is_err());

        let out_of_range = Verdict {
            checks: vec![check(0, 1.5, true), check(2, 0.1, false), check(4, 1.0, true)],
        };
        assert!(out_of_range.validate(&expected).is_err());
    }
}
