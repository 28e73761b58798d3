use std::sync::Arc;
use std::time::Duration;

use crate::error::GuardError;
use crate::retry::{PipelineOutcome, RetryController};
use crate::tools::ToolCallProposal;

/// A proposal from a multi-call turn. A dependent proposal operates on the
/// accepted output of the one before it.
#[derive(Debug, Clone)]
pub struct BatchProposal {
    pub proposal: ToolCallProposal,
    pub depends_on_previous: bool,
}

impl BatchProposal {
    pub fn independent(proposal: ToolCallProposal) -> Self {
        Self {
            proposal,
            depends_on_previous: false,
        }
    }

    pub fn dependent(proposal: ToolCallProposal) -> Self {
        Self {
            proposal,
            depends_on_previous: true,
        }
    }
}

type Chain = Vec<(usize, ToolCallProposal)>;

/// Runs independent chains concurrently and each chain serially, in
/// proposal order. Results come back in input order.
pub async fn run_batch(
    controller: RetryController,
    image: Vec<u8>,
    proposals: Vec<BatchProposal>,
) -> Vec<Result<PipelineOutcome, GuardError>> {
    let total = proposals.len();
    let timeout_ms = controller.settings().request_timeout_ms;
    let controller = Arc::new(controller);
    let image = Arc::new(image);

    let mut handles = Vec::new();
    for chain in split_chains(proposals) {
        let indexes = chain.iter().map(|(idx, _)| *idx).collect::<Vec<_>>();
        let task = tokio::spawn(run_chain(
            Arc::clone(&controller),
            Arc::clone(&image),
            chain,
            timeout_ms,
        ));
        handles.push((indexes, task));
    }

    let mut results = (0..total).map(|_| None).collect::<Vec<_>>();
    for (indexes, handle) in handles {
        match handle.await {
            Ok(outcomes) => {
                for (idx, outcome) in outcomes {
                    results[idx] = Some(outcome);
                }
            }
            Err(err) => {
                for idx in indexes {
                    results[idx] = Some(Err(GuardError::Worker(err.to_string())));
                }
            }
        }
    }
    results
        .into_iter()
        .map(|slot| {
            slot.unwrap_or_else(|| Err(GuardError::Worker(String::from("proposal produced no result"))))
        })
        .collect()
}

fn split_chains(proposals: Vec<BatchProposal>) -> Vec<Chain> {
    let mut chains: Vec<Chain> = Vec::new();
    for (idx, item) in proposals.into_iter().enumerate() {
        match chains.last_mut() {
            Some(chain) if item.depends_on_previous => chain.push((idx, item.proposal)),
            _ => chains.push(vec![(idx, item.proposal)]),
        }
    }
    chains
}

async fn run_chain(
    controller: Arc<RetryController>,
    image: Arc<Vec<u8>>,
    chain: Chain,
    timeout_ms: Option<u64>,
) -> Vec<(usize, Result<PipelineOutcome, GuardError>)> {
    let mut input = image;
    let mut upstream_accepted = true;
    let mut out = Vec::with_capacity(chain.len());
    for (index, proposal) in chain {
        if !upstream_accepted {
            out.push((index, Err(GuardError::UpstreamNotAccepted { index })));
            continue;
        }
        let outcome = run_one(Arc::clone(&controller), Arc::clone(&input), proposal, timeout_ms).await;
        match &outcome {
            Ok(done) if done.accepted => {
                if let Some(bytes) = done.result_image() {
                    input = Arc::new(bytes.to_vec());
                }
            }
            _ => upstream_accepted = false,
        }
        out.push((index, outcome));
    }
    out
}

async fn run_one(
    controller: Arc<RetryController>,
    image: Arc<Vec<u8>>,
    proposal: ToolCallProposal,
    timeout_ms: Option<u64>,
) -> Result<PipelineOutcome, GuardError> {
    // Pixel scans are CPU-bound; keep them off the async workers.
    let task = tokio::task::spawn_blocking(move || controller.run(&proposal, image.as_slice()));
    let joined = match timeout_ms {
        Some(ms) => tokio::time::timeout(Duration::from_millis(ms), task)
            .await
            .map_err(|_| GuardError::Timeout { timeout_ms: ms })?,
        None => task.await,
    };
    joined.map_err(|err| GuardError::Worker(err.to_string()))?
}
