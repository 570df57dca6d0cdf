//! Planner: restate the goal and decide whether evidence is needed.

use serde::{Deserialize, Serialize};

use super::{execute, require_text, PassError, PassOutcome, PassRequest};
use crate::gateway::Message;
use crate::run::context::RunContext;
use crate::run::model::PassType;

const SYSTEM: &str = "You are the planning stage of a multi-step reasoning pipeline. \
Read the goal and context, restate the goal precisely, list the outputs a complete \
answer must contain, and decide whether external evidence is needed to answer it \
reliably. If it is, give focused search queries.\n\n\
Respond with only a JSON object:\n\
{\"restated_goal\": string, \"evidence_required\": boolean, \
\"required_outputs\": [string], \"evidence_queries\": [string]}";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    pub restated_goal: String,
    pub evidence_required: bool,
    #[serde(default)]
    pub required_outputs: Vec<String>,
    #[serde(default)]
    pub evidence_queries: Vec<String>,
}

impl Plan {
    pub fn validate(&self) -> Result<(), String> {
        require_text("restated_goal", &self.restated_goal)?;
        if self.evidence_required
            && self.evidence_queries.iter().all(|q| q.trim().is_empty())
        {
            return Err("`evidence_queries` must not be empty when evidence is required".into());
        }
        Ok(())
    }

    /// Compact rendering reused by later prompts.
    pub fn render(&self) -> String {
        let mut out = format!("Goal: {}", self.restated_goal.trim());
        if !self.required_outputs.is_empty() {
            out.push_str("\nRequired outputs:");
            for item in &self.required_outputs {
                out.push_str("\n- ");
                out.push_str(item.trim());
            }
        }
        out
    }
}

pub fn request(ctx: &RunContext) -> PassRequest {
    let mut user = format!("Goal:\n{}", ctx.goal.trim());
    if let Some(rendered) = render_context(&ctx.context) {
        user.push_str("\n\nContext:\n");
        user.push_str(&rendered);
    }
    PassRequest {
        pass_type: PassType::Planner,
        candidate_index: None,
        messages: vec![Message::system(SYSTEM), Message::user(user)],
        temperature: ctx.lane.planner_temperature,
        signature: ctx.signature(None),
    }
}

pub async fn run(ctx: &RunContext, req: PassRequest) -> Result<PassOutcome<Plan>, PassError> {
    execute(ctx, req, Plan::validate).await
}

/// Context minus the bulky documents, which only the retriever reads.
fn render_context(context: &serde_json::Value) -> Option<String> {
    let mut map = context.as_object()?.clone();
    let documents = map.remove("documents").and_then(|d| d.as_array().map(Vec::len));
    if map.is_empty() && documents.is_none() {
        return None;
    }
    let mut out = serde_json::to_string_pretty(&map).ok()?;
    if let Some(n) = documents {
        out.push_str(&format!("\n({n} caller documents available to the evidence stage)"));
    }
    Some(out)
}
