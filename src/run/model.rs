//! Persisted entities: runs, passes, artifacts, checks.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type RunId = Uuid;
pub type PassId = Uuid;

// =============================================================================
// Status enums
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Planning,
    Evidence,
    Solving,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::Evidence => "evidence",
            Self::Solving => "solving",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "planning" => Self::Planning,
            "evidence" => Self::Evidence,
            "solving" => Self::Solving,
            "verifying" => Self::Verifying,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Edges of the run state machine. Evidence may be skipped; any live
    /// state may fail or be cancelled; terminal states are final.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed | Cancelled) {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Planning)
                | (Planning, Evidence)
                | (Planning, Solving)
                | (Evidence, Solving)
                | (Solving, Verifying)
                | (Verifying, Completed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassType {
    Planner,
    EvidenceRetriever,
    EvidenceReranker,
    Solver,
    Verifier,
}

impl PassType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::EvidenceRetriever => "evidence_retriever",
            Self::EvidenceReranker => "evidence_reranker",
            Self::Solver => "solver",
            Self::Verifier => "verifier",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "planner" => Self::Planner,
            "evidence_retriever" => Self::EvidenceRetriever,
            "evidence_reranker" => Self::EvidenceReranker,
            "solver" => Self::Solver,
            "verifier" => Self::Verifier,
            _ => return None,
        })
    }

    /// Attribution caller tag for gateway requests.
    pub fn caller(self) -> &'static str {
        match self {
            Self::Planner => "pass::planner",
            Self::EvidenceRetriever => "pass::evidence_retriever",
            Self::EvidenceReranker => "pass::evidence_reranker",
            Self::Solver => "pass::solver",
            Self::Verifier => "pass::verifier",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PassStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }
}

// =============================================================================
// Usage
// =============================================================================

/// Tokens and cost spent by one pass, summed across its attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
}

impl Usage {
    pub fn add(&mut self, input_tokens: u32, output_tokens: u32, cost_nanodollars: i64) {
        self.input_tokens = self.input_tokens.saturating_add(input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(output_tokens);
        self.cost_nanodollars = self.cost_nanodollars.saturating_add(cost_nanodollars);
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens as u64 + self.output_tokens as u64
    }
}

// =============================================================================
// Entities
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub lane_id: String,
    pub lane_version: u32,
    pub goal: String,
    pub context: Value,
    pub status: RunStatus,
    pub final_output: Option<String>,
    pub verify_score: Option<f64>,
    /// Completed below the lane's verification threshold.
    pub degraded: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at_ms: i64,
    pub completed_at_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pass {
    pub id: PassId,
    pub run_id: RunId,
    pub pass_type: PassType,
    pub candidate_index: Option<u32>,
    pub status: PassStatus,
    pub model: String,
    pub usage: Usage,
    pub cached: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub created_at_ms: i64,
    pub completed_at_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub run_id: RunId,
    pub pass_id: PassId,
    pub content: String,
    pub source: String,
    /// Position after reranking (0 = most relevant); retrieval order for
    /// retriever artifacts.
    pub rank: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    pub id: Uuid,
    pub run_id: RunId,
    pub candidate_pass_id: PassId,
    pub candidate_index: u32,
    pub score: f64,
    pub passed: bool,
    pub is_winner: bool,
    pub rationale: String,
}

/// Everything the read interface returns for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunView {
    pub run: Run,
    pub passes: Vec<Pass>,
    pub artifacts: Vec<Artifact>,
    pub checks: Vec<Check>,
    pub total_cost_nanodollars: i64,
}

impl RunView {
    pub fn passes_of(&self, pass_type: PassType) -> impl Iterator<Item = &Pass> {
        self.passes.iter().filter(move |p| p.pass_type == pass_type)
    }

    pub fn winner(&self) -> Option<&Check> {
        self.checks.iter().find(|c| c.is_winner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RunStatus::*;

    #[test]
    fn test_happy_path_transitions() {
        assert!(Pending.can_transition_to(Planning));
        assert!(Planning.can_transition_to(Evidence));
        assert!(Planning.can_transition_to(Solving));
        assert!(Evidence.can_transition_to(Solving));
        assert!(Solving.can_transition_to(Verifying));
        assert!(Verifying.can_transition_to(Completed));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!Pending.can_transition_to(Solving));
        assert!(!Planning.can_transition_to(Verifying));
        assert!(!Solving.can_transition_to(Evidence));
        assert!(!Solving.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Cancelled.can_transition_to(Planning));
        assert!(!Failed.can_transition_to(Cancelled));
    }

    #[test]
    fn test_any_live_state_can_fail_or_cancel() {
        for s in [Pending, Planning, Evidence, Solving, Verifying] {
            assert!(s.can_transition_to(Failed));
            assert!(s.can_transition_to(Cancelled));
        }
    }

    #[test]
    fn test_string_forms_round_trip() {
        for s in [
            Pending, Planning, Evidence, Solving, Verifying, Completed, Failed, Cancelled,
        ] {
            assert_eq!(RunStatus::parse(s.as_str()), Some(s));
        }
        for p in [
            PassType::Planner,
            PassType::EvidenceRetriever,
            PassType::EvidenceReranker,
            PassType::Solver,
            PassType::Verifier,
        ] {
            assert_eq!(PassType::parse(p.as_str()), Some(p));
        }
        assert_eq!(RunStatus::parse("bogus"), None);
    }
}
