pub mod adjust;
pub mod state;

use std::time::Instant;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::analysis::{analyze, ImageAnalysis};
use crate::error::{GuardError, SchemaError};
use crate::gateway::SharedToolExecutionGateway;
use crate::history::{ExecutionRecord, ResultMetrics, SharedHistoryStore, TerminalState};
use crate::scoring::{self, ConfidenceScore};
use crate::settings::GuardSettings;
use crate::tools::{registry, ToolCallProposal};
use crate::validation::{
    ParameterValidator, ResultExpectation, ResultValidation, ResultValidator, ValidationResult,
};

pub use adjust::derive_adjustment;
pub use state::{transition, AttemptDecision, RetryEvent, RetryPolicy, RetryState};

/// One executed attempt, or the single rejected pre-validation.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptReport {
    pub attempt: u32,
    pub parameters: Map<String, Value>,
    pub validation: ValidationResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultValidation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<ConfidenceScore>,
    pub execution_time_ms: u64,
    #[serde(skip)]
    pub output: Option<Vec<u8>>,
}

impl AttemptReport {
    fn confidence(&self) -> Option<f64> {
        self.score.map(|s| s.value)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub tool_name: String,
    pub final_state: RetryState,
    pub terminal_state: TerminalState,
    pub accepted: bool,
    pub confidence: ConfidenceScore,
    pub reasoning: String,
    pub attempts: Vec<AttemptReport>,
    /// Index into `attempts` of the surfaced attempt.
    pub best_attempt: Option<usize>,
    pub transitions: Vec<RetryState>,
    pub record_id: String,
}

impl PipelineOutcome {
    pub fn best(&self) -> Option<&AttemptReport> {
        self.best_attempt.and_then(|idx| self.attempts.get(idx))
    }

    /// Output image of the surfaced attempt.
    pub fn result_image(&self) -> Option<&[u8]> {
        self.best().and_then(|a| a.output.as_deref())
    }

    pub fn executed_attempts(&self) -> u32 {
        self.attempts.iter().filter(|a| a.result.is_some()).count() as u32
    }
}

/// Drives one proposal through validate, execute, verify and score, retrying
/// with derived adjustments up to the attempt cap. Every run ends in exactly
/// one history record.
#[derive(Clone)]
pub struct RetryController {
    settings: GuardSettings,
    policy: RetryPolicy,
    validator: ParameterValidator,
    result_validator: ResultValidator,
    gateway: SharedToolExecutionGateway,
    history: SharedHistoryStore,
}

impl RetryController {
    pub fn new(
        settings: GuardSettings,
        gateway: SharedToolExecutionGateway,
        history: SharedHistoryStore,
    ) -> Self {
        Self {
            policy: RetryPolicy::from_settings(&settings),
            validator: ParameterValidator::new(settings.clone(), history.clone()),
            result_validator: ResultValidator::new(settings.clone()),
            settings,
            gateway,
            history,
        }
    }

    pub fn settings(&self) -> &GuardSettings {
        &self.settings
    }

    pub fn run(
        &self,
        proposal: &ToolCallProposal,
        image: &[u8],
    ) -> Result<PipelineOutcome, GuardError> {
        let analysis = analyze(image)?;
        self.run_with_analysis(proposal, image, &analysis)
    }

    pub fn run_with_analysis(
        &self,
        proposal: &ToolCallProposal,
        image: &[u8],
        analysis: &ImageAnalysis,
    ) -> Result<PipelineOutcome, GuardError> {
        let mut run = Run::default();
        run.advance(RetryEvent::Start)?;

        let validation = self.validator.validate(proposal, analysis);
        if !validation.is_valid {
            run.advance(RetryEvent::PreValidated { is_valid: false })?;
            let reasoning = validation.reasoning.clone();
            run.attempts.push(AttemptReport {
                attempt: 0,
                parameters: proposal.parameters.clone(),
                validation,
                result: None,
                score: None,
                execution_time_ms: 0,
                output: None,
            });
            return self.finish(proposal, analysis, run, reasoning);
        }
        run.advance(RetryEvent::PreValidated { is_valid: true })?;

        let Some(spec) = registry().get(proposal.tool_name.as_str()) else {
            return Err(SchemaError::UnknownTool {
                tool: proposal.tool_name.clone(),
            }
            .into());
        };

        let (mut parameters, mut current) = self.first_attempt(proposal, analysis, validation);
        let mut attempt = 0_u32;

        loop {
            attempt += 1;
            let started = Instant::now();
            // Always the original image: retries never compound on a failed output.
            let output = match self.gateway.execute(spec.name, &parameters, image) {
                Ok(output) => output,
                Err(err) => {
                    warn!(tool = spec.name, attempt, error = %err, "tool execution failed");
                    run.advance(RetryEvent::ExecutionFailed)?;
                    let reasoning = match run.best_index() {
                        Some(idx) => format!(
                            "{err}; surfacing attempt {} of {}",
                            run.attempts[idx].attempt,
                            attempt - 1
                        ),
                        None => err.to_string(),
                    };
                    return self.finish(proposal, analysis, run, reasoning);
                }
            };
            run.advance(RetryEvent::Executed)?;

            let expectation = ResultExpectation::for_tool(spec, &parameters, analysis.dimensions());
            let result = self
                .result_validator
                .validate(spec.name, image, &output, &expectation);
            let execution_time_ms = started.elapsed().as_millis() as u64;
            let score = scoring::score(&current, &result);
            let success = result.success;
            let accepted = self.policy.accepts(score.value, success);
            debug!(
                tool = spec.name,
                attempt,
                confidence = score.value,
                success,
                "attempt scored"
            );

            let next = if accepted || attempt >= self.policy.max_attempts {
                None
            } else {
                Some(self.prepare_retry(proposal, analysis, spec, &parameters, &current, &result))
            };
            run.attempts.push(AttemptReport {
                attempt,
                parameters: parameters.clone(),
                validation: current.clone(),
                result: Some(result),
                score: Some(score),
                execution_time_ms,
                output: Some(output),
            });
            let decision = self.policy.decide(score.value, success, attempt);
            run.advance(RetryEvent::Scored(decision))?;

            match (run.state, next) {
                (RetryState::Retrying, Some((next_parameters, next_validation))) => {
                    run.advance(RetryEvent::Readjusted)?;
                    run.advance(RetryEvent::PreValidated { is_valid: true })?;
                    parameters = next_parameters;
                    current = next_validation;
                }
                _ => break,
            }
        }

        let reasoning = match (run.state, run.best_index()) {
            (RetryState::Accepted, _) => format!(
                "accepted on attempt {attempt} with confidence {:.0}",
                run.attempts.last().and_then(AttemptReport::confidence).unwrap_or(0.0)
            ),
            (_, Some(idx)) => {
                let best = &run.attempts[idx];
                let detail = best
                    .result
                    .as_ref()
                    .map(|r| r.reasoning.clone())
                    .unwrap_or_default();
                format!(
                    "not accepted after {attempt} attempt(s); best was attempt {} with confidence {:.0}: {detail}",
                    best.attempt,
                    best.confidence().unwrap_or(0.0)
                )
            }
            _ => format!("not accepted after {attempt} attempt(s)"),
        };
        self.finish(proposal, analysis, run, reasoning)
    }

    /// Parameters and verdict for the first execution. Suggested parameters
    /// are used only when they pass validation themselves.
    fn first_attempt(
        &self,
        proposal: &ToolCallProposal,
        analysis: &ImageAnalysis,
        validation: ValidationResult,
    ) -> (Map<String, Value>, ValidationResult) {
        let adjusted = match &validation.adjusted_parameters {
            Some(adjusted) if self.settings.apply_suggested_parameters => adjusted.clone(),
            _ => return (proposal.parameters.clone(), validation),
        };
        let suggested = ToolCallProposal::new(proposal.tool_name.clone(), adjusted);
        let revalidated = self.validator.validate(&suggested, analysis);
        if !revalidated.is_valid {
            warn!(
                tool = %proposal.tool_name,
                reasoning = %revalidated.reasoning,
                "suggested parameters failed validation; executing the proposal as given"
            );
            return (proposal.parameters.clone(), validation);
        }
        (suggested.parameters, revalidated)
    }

    /// Parameters for the next attempt: a derived adjustment when one exists
    /// and passes validation, otherwise the same parameters again.
    fn prepare_retry(
        &self,
        proposal: &ToolCallProposal,
        analysis: &ImageAnalysis,
        spec: &crate::tools::ToolSpec,
        parameters: &Map<String, Value>,
        current: &ValidationResult,
        result: &ResultValidation,
    ) -> (Map<String, Value>, ValidationResult) {
        if let Some(adjusted) = derive_adjustment(spec, parameters, result) {
            let next = ToolCallProposal::new(proposal.tool_name.clone(), adjusted);
            let validation = self.validator.validate(&next, analysis);
            if validation.is_valid {
                return (next.parameters, validation);
            }
            debug!(
                tool = spec.name,
                reasoning = %validation.reasoning,
                "derived adjustment failed validation; repeating the last parameters"
            );
        }
        (parameters.clone(), current.clone())
    }

    fn finish(
        &self,
        proposal: &ToolCallProposal,
        analysis: &ImageAnalysis,
        run: Run,
        reasoning: String,
    ) -> Result<PipelineOutcome, GuardError> {
        let Some(terminal_state) = run.state.terminal_state() else {
            return Err(GuardError::InvalidTransition {
                from: run.state.as_str().to_string(),
                event: String::from("finish"),
            });
        };
        let accepted = terminal_state == TerminalState::Accepted;
        let best_attempt = if accepted {
            run.attempts.len().checked_sub(1)
        } else {
            run.best_index()
        };
        let best = best_attempt.and_then(|idx| run.attempts.get(idx));
        let confidence = ConfidenceScore::new(best.and_then(AttemptReport::confidence).unwrap_or(0.0));
        let metrics = best
            .and_then(|a| a.result.as_ref().map(|r| r.metrics(a.execution_time_ms)))
            .unwrap_or_else(ResultMetrics::default);
        let parameters = best
            .map(|a| a.parameters.clone())
            .unwrap_or_else(|| proposal.parameters.clone());
        let executed = run.attempts.iter().filter(|a| a.result.is_some()).count() as u32;

        let record = ExecutionRecord::new(
            proposal.tool_name.trim(),
            parameters,
            terminal_state,
            executed,
            confidence.value,
            metrics,
            analysis.clone(),
        );
        self.history.append(&record)?;
        info!(
            tool = %record.tool_name,
            state = terminal_state.as_str(),
            attempts = executed,
            confidence = confidence.value,
            "proposal finished"
        );

        Ok(PipelineOutcome {
            tool_name: record.tool_name.clone(),
            final_state: run.state,
            terminal_state,
            accepted,
            confidence,
            reasoning,
            attempts: run.attempts,
            best_attempt,
            transitions: run.transitions,
            record_id: record.id,
        })
    }
}

struct Run {
    state: RetryState,
    transitions: Vec<RetryState>,
    attempts: Vec<AttemptReport>,
}

impl Default for Run {
    fn default() -> Self {
        Self {
            state: RetryState::Proposed,
            transitions: vec![RetryState::Proposed],
            attempts: Vec::new(),
        }
    }
}

impl Run {
    fn advance(&mut self, event: RetryEvent) -> Result<(), GuardError> {
        self.state = transition(self.state, event)?;
        self.transitions.push(self.state);
        Ok(())
    }

    /// Highest-confidence executed attempt; the earliest wins ties.
    fn best_index(&self) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (idx, attempt) in self.attempts.iter().enumerate() {
            let Some(value) = attempt.confidence() else {
                continue;
            };
            if best.map_or(true, |(_, top)| value > top) {
                best = Some((idx, value));
            }
        }
        best.map(|(idx, _)| idx)
    }
}
