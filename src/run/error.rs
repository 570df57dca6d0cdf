use std::time::Duration;

use super::model::PassType;
use super::store::StoreError;
use crate::gateway::{ErrorClass, ProviderError};
use crate::lanes::LaneError;
use crate::ledger::BudgetBreach;
use crate::passes::PassError;

/// Why a run did not complete normally. `code()` is the stable string
/// surfaced in `error` events and persisted on the run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("{pass} pass failed after retries: {source}")]
    BackendTransient {
        pass: &'static str,
        source: ProviderError,
    },
    #[error("{pass} pass rejected by provider: {source}")]
    BackendPermanent {
        pass: &'static str,
        source: ProviderError,
    },
    #[error("{pass} pass returned invalid output after {attempts} attempts: {message}")]
    Schema {
        pass: &'static str,
        attempts: u32,
        message: String,
    },
    #[error("all {attempted} solver candidates failed; last error: {last_error}")]
    NoViableCandidates { attempted: u32, last_error: String },
    #[error("best verified score {score:.2} is below threshold {threshold:.2}")]
    LowConfidence { score: f64, threshold: f64 },
    #[error("budget exceeded before {stage}: {breach}")]
    BudgetExceeded {
        stage: &'static str,
        breach: BudgetBreach,
    },
    #[error("run exceeded its {0:?} deadline")]
    Timeout(Duration),
    #[error("run cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl RunError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::BackendTransient { .. } => "BACKEND_TRANSIENT",
            Self::BackendPermanent { .. } => "BACKEND_PERMANENT",
            Self::Schema { .. } => "SCHEMA_VIOLATION",
            Self::NoViableCandidates { .. } => "NO_VIABLE_CANDIDATES",
            Self::LowConfidence { .. } => "VERIFICATION_LOW_CONFIDENCE",
            Self::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            Self::Timeout(_) => "RUN_TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Map a failed pass onto the run-level taxonomy.
    pub fn from_pass(pass: PassType, err: PassError) -> Self {
        let pass = pass.as_str();
        match err {
            PassError::Cancelled => Self::Cancelled,
            PassError::Provider(source) => match source.class() {
                ErrorClass::Transient => Self::BackendTransient { pass, source },
                ErrorClass::Permanent => Self::BackendPermanent { pass, source },
                ErrorClass::Cancelled => Self::Cancelled,
            },
            PassError::Schema { attempts, message } => Self::Schema {
                pass,
                attempts,
                message,
            },
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Rejections at submission time; no run record is created.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error(transparent)]
    Lane(#[from] LaneError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SubmitError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::Lane(_) => "VALIDATION",
            Self::Store(_) => "INTERNAL",
        }
    }
}
