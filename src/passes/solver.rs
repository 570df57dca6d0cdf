//! Solver: one independent candidate answer per slot.

use serde::{Deserialize, Serialize};

use super::evidence::{render_evidence, EvidenceItem};
use super::planner::Plan;
use super::{execute, require_text, require_unit, PassError, PassOutcome, PassRequest};
use crate::gateway::Message;
use crate::run::context::RunContext;
use crate::run::model::{PassId, PassType};

const SYSTEM: &str = "You are one of several independent solvers in a reasoning \
pipeline. Produce a complete, self-contained answer to the goal. When evidence is \
provided, ground your claims in it and cite snippets by label (for example \"E2\"). \
Rate your own confidence from 0 to 1.\n\n\
Respond with only a JSON object:\n\
{\"solution\": string, \"confidence\": number, \"citations\": [string]}";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Solution {
    pub solution: String,
    pub confidence: f64,
    #[serde(default)]
    pub citations: Vec<String>,
}

impl Solution {
    pub fn validate(&self) -> Result<(), String> {
        require_text("solution", &self.solution)?;
        require_unit("confidence", self.confidence)
    }
}

/// A solver pass that completed.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub index: u32,
    pub pass_id: PassId,
    pub solution: Solution,
}

pub fn request(
    ctx: &RunContext,
    plan: &Plan,
    evidence: &[EvidenceItem],
    index: u32,
    total: u32,
) -> PassRequest {
    let mut user = format!(
        "{}\n\nYou are solver {} of {total}. Work independently.",
        plan.render(),
        index + 1
    );
    if !evidence.is_empty() {
        user.push_str("\n\nEvidence:\n");
        user.push_str(&render_evidence(evidence));
    }
    PassRequest {
        pass_type: PassType::Solver,
        candidate_index: Some(index),
        messages: vec![Message::system(SYSTEM), Message::user(user)],
        temperature: ctx.lane.solver_temperature,
        signature: ctx.signature(Some(index)),
    }
}

pub async fn run(ctx: &RunContext, req: PassRequest) -> Result<PassOutcome<Solution>, PassError> {
    execute(ctx, req, Solution::validate).await
}
