//! Lane configurations: named, versioned pipeline settings.
//!
//! A run snapshots its lane as an `Arc<LaneConfig>` at submission, so a lane
//! cannot change underneath a run in flight.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::run::model::PassType;

/// Upper bound on solver fan-out regardless of lane settings.
pub const HARD_MAX_SOLVERS: u32 = 16;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LaneError {
    #[error("unknown lane: {0}")]
    Unknown(String),
    #[error("lane {lane}: {reason}")]
    Invalid { lane: String, reason: String },
    #[error("lane {0} defined more than once")]
    Duplicate(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassModels {
    pub planner: String,
    pub retriever: String,
    pub reranker: String,
    pub solver: String,
    pub verifier: String,
}

impl Default for PassModels {
    fn default() -> Self {
        Self {
            planner: "openai/gpt-4o-mini".into(),
            retriever: "openai/gpt-4o-mini".into(),
            reranker: "openai/gpt-4o-mini".into(),
            solver: "anthropic/claude-3-5-haiku".into(),
            verifier: "openai/gpt-5-mini".into(),
        }
    }
}

impl PassModels {
    pub fn for_pass(&self, pass: PassType) -> &str {
        match pass {
            PassType::Planner => &self.planner,
            PassType::EvidenceRetriever => &self.retriever,
            PassType::EvidenceReranker => &self.reranker,
            PassType::Solver => &self.solver,
            PassType::Verifier => &self.verifier,
        }
    }
}

/// Output token ceilings per pass type. Also the worst case used by budget
/// projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassTokenLimits {
    pub planner: u32,
    pub retriever: u32,
    pub reranker: u32,
    pub solver: u32,
    pub verifier: u32,
}

impl Default for PassTokenLimits {
    fn default() -> Self {
        Self {
            planner: 800,
            retriever: 1_500,
            reranker: 600,
            solver: 2_000,
            verifier: 1_200,
        }
    }
}

impl PassTokenLimits {
    pub fn for_pass(&self, pass: PassType) -> u32 {
        match pass {
            PassType::Planner => self.planner,
            PassType::EvidenceRetriever => self.retriever,
            PassType::EvidenceReranker => self.reranker,
            PassType::Solver => self.solver,
            PassType::Verifier => self.verifier,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneConfig {
    pub id: String,
    /// Bumped by operators on any change; part of every cache fingerprint.
    pub version: u32,
    pub description: String,
    pub models: PassModels,
    pub max_tokens: PassTokenLimits,
    pub max_solver_parallelism: u32,
    /// Minimum winning verifier score for a non-degraded result.
    pub verification_threshold: f64,
    /// Cap on total tokens (in + out) a run may spend.
    pub token_cap: Option<u64>,
    /// Cap on total cost a run may spend.
    pub budget_nanodollars: Option<i64>,
    /// Overrides `[cache].default_ttl_secs`. 0 disables caching.
    pub cache_ttl_secs: Option<u64>,
    /// Snippets kept after reranking.
    pub evidence_cap: usize,
    pub planner_temperature: f32,
    pub solver_temperature: f32,
    pub verifier_temperature: f32,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            id: "default".into(),
            version: 1,
            description: "Balanced lane: three solvers, cheap planner".into(),
            models: PassModels::default(),
            max_tokens: PassTokenLimits::default(),
            max_solver_parallelism: 3,
            verification_threshold: 0.7,
            token_cap: None,
            budget_nanodollars: None,
            cache_ttl_secs: None,
            evidence_cap: 6,
            planner_temperature: 0.0,
            solver_temperature: 0.7,
            verifier_temperature: 0.0,
        }
    }
}

impl LaneConfig {
    /// Number of solver passes a run on this lane launches.
    pub fn solver_count(&self) -> u32 {
        self.max_solver_parallelism.clamp(1, HARD_MAX_SOLVERS)
    }

    pub fn model_for(&self, pass: PassType) -> &str {
        self.models.for_pass(pass)
    }

    pub fn max_tokens_for(&self, pass: PassType) -> u32 {
        self.max_tokens.for_pass(pass)
    }

    pub fn validate(&self) -> Result<(), LaneError> {
        let invalid = |reason: String| LaneError::Invalid {
            lane: self.id.clone(),
            reason,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty".into()));
        }
        if self.max_solver_parallelism == 0 {
            return Err(invalid("max_solver_parallelism must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.verification_threshold) {
            return Err(invalid(format!(
                "verification_threshold {} outside [0, 1]",
                self.verification_threshold
            )));
        }
        if self.evidence_cap == 0 {
            return Err(invalid("evidence_cap must be at least 1".into()));
        }
        for pass in [
            PassType::Planner,
            PassType::EvidenceRetriever,
            PassType::EvidenceReranker,
            PassType::Solver,
            PassType::Verifier,
        ] {
            if self.model_for(pass).trim().is_empty() {
                return Err(invalid(format!("no model for {}", pass.as_str())));
            }
            if self.max_tokens_for(pass) == 0 {
                return Err(invalid(format!("max_tokens for {} is 0", pass.as_str())));
            }
        }
        if matches!(self.budget_nanodollars, Some(b) if b < 0) {
            return Err(invalid("budget_nanodollars must not be negative".into()));
        }
        Ok(())
    }
}

/// Read-only lookup of lanes by id.
#[derive(Debug, Clone, Default)]
pub struct LaneRegistry {
    lanes: BTreeMap<String, Arc<LaneConfig>>,
}

impl LaneRegistry {
    /// Validate and index `lanes`. An empty list registers the built-in
    /// `default` lane.
    pub fn new(lanes: Vec<LaneConfig>) -> Result<Self, LaneError> {
        let lanes = if lanes.is_empty() {
            vec![LaneConfig::default()]
        } else {
            lanes
        };

        let mut map = BTreeMap::new();
        for lane in lanes {
            lane.validate()?;
            if map.contains_key(&lane.id) {
                return Err(LaneError::Duplicate(lane.id));
            }
            map.insert(lane.id.clone(), Arc::new(lane));
        }
        Ok(Self { lanes: map })
    }

    pub fn get(&self, id: &str) -> Result<Arc<LaneConfig>, LaneError> {
        self.lanes
            .get(id)
            .cloned()
            .ok_or_else(|| LaneError::Unknown(id.to_string()))
    }

    pub fn list(&self) -> impl Iterator<Item = &Arc<LaneConfig>> {
        self.lanes.values()
    }

    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }
}
