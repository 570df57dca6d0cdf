#![forbid(unsafe_code)]

//! # quorum-harness
//!
//! Verified multi-pass reasoning over LLMs.
//!
//! A goal goes through a fixed pipeline: a planner restates it and decides
//! whether evidence is needed, an optional evidence stage retrieves and
//! reranks snippets, N solvers answer independently and in parallel, and a
//! verifier scores every surviving candidate and picks a winner. Each pass is
//! cached by content fingerprint, costed into an append-only ledger, and
//! checked against a lane budget before it starts.
//!
//! Entry points: [`run::open`] wires the production stack from a
//! [`config::HarnessConfig`]; [`run::Orchestrator`] submits, observes and
//! cancels runs.

pub mod cache;
pub mod chunking;
pub mod config;
pub mod gateway;
pub mod lanes;
pub mod ledger;
pub mod passes;
pub mod run;

pub use cache::{CacheStore, Fingerprint, MemoryResponseCache, ResponseCache, SqliteResponseCache};
pub use config::HarnessConfig;
pub use gateway::{Attribution, ChatGateway, ProviderGateway, UsageSink};
pub use lanes::{LaneConfig, LaneRegistry};
pub use ledger::{CostLedger, MemoryLedger, SqliteLedger};
pub use run::{Orchestrator, RunEvent, RunStatus, RunView, Services};
