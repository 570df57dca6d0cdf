//! Evidence: a retriever pass gathers snippets, a reranker pass orders and
//! trims them to the lane's cap. Both persist what they produce as artifacts.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use super::planner::Plan;
use super::{execute, require_text, require_unit, PassError, PassRequest};
use crate::chunking::{chunk_documents, DocumentChunk};
use crate::gateway::Message;
use crate::ledger::ProjectedCall;
use crate::run::context::RunContext;
use crate::run::model::{Artifact, PassId, PassType};

const RETRIEVER_SYSTEM: &str = "You are the evidence retrieval stage of a reasoning \
pipeline. Given a goal, search queries and (optionally) numbered document chunks, \
extract the passages that help answer the goal. Quote chunk text verbatim and use the \
chunk's source as `source`. If no chunks are provided, state well-established facts \
you are confident of and name where they come from as `source`.\n\n\
Respond with only a JSON object:\n\
{\"snippets\": [{\"content\": string, \"source\": string}]}";

const RERANKER_SYSTEM: &str = "You are the evidence reranking stage of a reasoning \
pipeline. Score each numbered snippet for how much it helps answer the goal, from 0 \
(irrelevant) to 1 (essential). Omit snippets that do not help at all.\n\n\
Respond with only a JSON object:\n\
{\"ranking\": [{\"index\": integer, \"relevance\": number}]}";

/// Input headroom for the reranker prompt around the retriever's snippets.
const RERANK_PROMPT_OVERHEAD_TOKENS: u32 = 400;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Snippet {
    pub content: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Retrieval {
    pub snippets: Vec<Snippet>,
}

impl Retrieval {
    pub fn validate(&self) -> Result<(), String> {
        for (i, s) in self.snippets.iter().enumerate() {
            require_text(&format!("snippets[{i}].content"), &s.content)?;
            require_text(&format!("snippets[{i}].source"), &s.source)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Ranked {
    pub index: usize,
    pub relevance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Ranking {
    pub ranking: Vec<Ranked>,
}

impl Ranking {
    pub fn validate(&self, snippet_count: usize) -> Result<(), String> {
        let mut seen = HashSet::new();
        for r in &self.ranking {
            if r.index >= snippet_count {
                return Err(format!(
                    "ranking index {} out of range (have {snippet_count} snippets)",
                    r.index
                ));
            }
            if !seen.insert(r.index) {
                return Err(format!("ranking index {} listed twice", r.index));
            }
            require_unit("relevance", r.relevance)?;
        }
        Ok(())
    }
}

/// Evidence handed to solvers and the verifier, labelled `E1`, `E2`, ...
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub label: String,
    pub source: String,
    pub content: String,
    pub relevance: f64,
    pub artifact_id: Uuid,
}

pub fn retrieval_request(ctx: &RunContext, plan: &Plan) -> PassRequest {
    let settings = &ctx.services.settings;
    let chunks = chunk_documents(
        &ctx.documents(),
        &settings.chunking,
        settings.max_evidence_chunks,
    );

    let mut user = plan.render();
    user.push_str("\n\nQueries:");
    for q in &plan.evidence_queries {
        user.push_str("\n- ");
        user.push_str(q.trim());
    }
    if chunks.is_empty() {
        user.push_str("\n\nNo documents were provided.");
    } else {
        user.push_str("\n\nDocument chunks:");
        user.push_str(&render_chunks(&chunks));
    }

    PassRequest {
        pass_type: PassType::EvidenceRetriever,
        candidate_index: None,
        messages: vec![Message::system(RETRIEVER_SYSTEM), Message::user(user)],
        temperature: ctx.lane.planner_temperature,
        signature: ctx.signature(None),
    }
}

/// Worst case for the reranker, whose prompt is not known until retrieval
/// finishes: the retriever's full output plus prompt overhead.
pub fn rerank_projection(ctx: &RunContext) -> ProjectedCall {
    ProjectedCall {
        model: ctx.lane.model_for(PassType::EvidenceReranker).to_string(),
        input_tokens: ctx.lane.max_tokens_for(PassType::EvidenceRetriever)
            + RERANK_PROMPT_OVERHEAD_TOKENS,
        max_output_tokens: ctx.lane.max_tokens_for(PassType::EvidenceReranker),
    }
}

/// Run the retriever and persist each snippet in retrieval order.
pub async fn retrieve(ctx: &RunContext, req: PassRequest) -> Result<Vec<Snippet>, PassError> {
    let outcome = execute(ctx, req, Retrieval::validate).await?;
    let snippets = outcome.output.snippets;
    persist(ctx, outcome.pass_id, snippets.iter()).await?;
    Ok(snippets)
}

/// Rerank `snippets`, keep the top `evidence_cap`, persist them in rank
/// order. Nothing to rank means no reranker pass.
pub async fn rerank(
    ctx: &RunContext,
    plan: &Plan,
    snippets: Vec<Snippet>,
) -> Result<Vec<EvidenceItem>, PassError> {
    if snippets.is_empty() {
        return Ok(Vec::new());
    }

    let mut user = plan.render();
    user.push_str("\n\nSnippets:");
    for (i, s) in snippets.iter().enumerate() {
        user.push_str(&format!("\n[{i}] ({}) {}", s.source, s.content.trim()));
    }
    let req = PassRequest {
        pass_type: PassType::EvidenceReranker,
        candidate_index: None,
        messages: vec![Message::system(RERANKER_SYSTEM), Message::user(user)],
        temperature: ctx.lane.planner_temperature,
        signature: ctx.signature(None),
    };

    let count = snippets.len();
    let outcome = execute(ctx, req, |r: &Ranking| r.validate(count)).await?;
    let kept = apply_ranking(snippets, &outcome.output.ranking, ctx.lane.evidence_cap);
    let ids = persist(ctx, outcome.pass_id, kept.iter().map(|(s, _)| s)).await?;

    Ok(kept
        .into_iter()
        .zip(ids)
        .enumerate()
        .map(|(i, ((snippet, relevance), artifact_id))| EvidenceItem {
            label: format!("E{}", i + 1),
            source: snippet.source,
            content: snippet.content,
            relevance,
            artifact_id,
        })
        .collect())
}

/// Order by relevance (ties keep the reranker's listing order) and cut to
/// `cap`. Snippets the reranker omitted are dropped.
pub fn apply_ranking(snippets: Vec<Snippet>, ranking: &[Ranked], cap: usize) -> Vec<(Snippet, f64)> {
    let mut order: Vec<Ranked> = ranking.to_vec();
    order.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));

    let mut slots: Vec<Option<Snippet>> = snippets.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|r| {
            slots
                .get_mut(r.index)
                .and_then(Option::take)
                .map(|s| (s, r.relevance))
        })
        .take(cap)
        .collect()
}

/// Evidence block shared by solver and verifier prompts.
pub fn render_evidence(items: &[EvidenceItem]) -> String {
    items
        .iter()
        .map(|e| format!("[{}] ({}) {}", e.label, e.source, e.content.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_chunks(chunks: &[DocumentChunk]) -> String {
    chunks
        .iter()
        .enumerate()
        .map(|(i, c)| format!("\n[C{}] ({}) {}", i + 1, c.source, c.text))
        .collect()
}

async fn persist<'a>(
    ctx: &RunContext,
    pass_id: PassId,
    snippets: impl Iterator<Item = &'a Snippet>,
) -> Result<Vec<Uuid>, PassError> {
    let artifacts: Vec<Artifact> = snippets
        .enumerate()
        .map(|(rank, s)| Artifact {
            id: Uuid::new_v4(),
            run_id: ctx.run_id,
            pass_id,
            content: s.content.clone(),
            source: s.source.clone(),
            rank: rank as u32,
        })
        .collect();
    if !artifacts.is_empty() {
        ctx.services.store.insert_artifacts(&artifacts).await?;
    }
    Ok(artifacts.into_iter().map(|a| a.id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snippets(n: usize) -> Vec<Snippet> {
        (0..n)
            .map(|i| Snippet {
                content: format!("fact {i}"),
                source: format!("doc{i}.md"),
            })
            .collect()
    }

    fn ranked(pairs: &[(usize, f64)]) -> Vec<Ranked> {
        pairs
            .iter()
            .map(|&(index, relevance)| Ranked { index, relevance })
            .collect()
    }

    #[test]
    fn test_ranking_orders_and_trims() {
        let kept = apply_ranking(
            snippets(4),
            &ranked(&[(0, 0.2), (1, 0.9), (2, 0.5), (3, 0.9)]),
            3,
        );
        let order: Vec<&str> = kept.iter().map(|(s, _)| s.content.as_str()).collect();
        assert_eq!(order, vec!["fact 1", "fact 3", "fact 2"]);
    }

    #[test]
    fn test_omitted_snippets_dropped() {
        let kept = apply_ranking(snippets(3), &ranked(&[(2, 0.4)]), 5);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].0.source, "doc2.md");
    }

    #[test]
    fn test_ranking_validation() {
        assert!(Ranking { ranking: ranked(&[(0, 0.5), (1, 1.0)]) }
            .validate(2)
            .is_ok());
        assert!(Ranking { ranking: ranked(&[(2, 0.5)]) }.validate(2).is_err());
        assert!(Ranking { ranking: ranked(&[(0, 0.5), (0, 0.4)]) }
            .validate(2)
            .is_err());
        assert!(Ranking { ranking: ranked(&[(0, 1.5)]) }.validate(2).is_err());
    }

    #[test]
    fn test_retrieval_validation() {
        let mut r = Retrieval {
            snippets: snippets(2),
        };
        assert!(r.validate().is_ok());
        r.snippets[1].source = String::new();
        assert!(r.validate().unwrap_err().contains("snippets[1].source"));
    }

    #[test]
    fn test_evidence_rendering() {
        let items = vec![EvidenceItem {
            label: "E1".into(),
            source: "runbook.md".into(),
            content: " Restart the primary. ".into(),
            relevance: 0.9,
            artifact_id: Uuid::new_v4(),
        }];
        assert_eq!(render_evidence(&items), "[E1] (runbook.md) Restart the primary.");
    }
}
