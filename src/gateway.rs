use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use crate::error::ExecutionError;

/// Runs the actual edit. Implementations live outside this crate; a genuine
/// failure is an `Err`, an unhelpful result is still `Ok`.
pub trait ToolExecutionGateway: Send + Sync + 'static {
    fn execute(
        &self,
        tool_name: &str,
        parameters: &Map<String, Value>,
        image: &[u8],
    ) -> Result<Vec<u8>, ExecutionError>;
}

pub type SharedToolExecutionGateway = Arc<dyn ToolExecutionGateway>;

/// Adapts a closure into a gateway.
pub struct FnGateway<F>(pub F);

impl<F> ToolExecutionGateway for FnGateway<F>
where
    F: Fn(&str, &Map<String, Value>, &[u8]) -> Result<Vec<u8>, ExecutionError>
        + Send
        + Sync
        + 'static,
{
    fn execute(
        &self,
        tool_name: &str,
        parameters: &Map<String, Value>,
        image: &[u8],
    ) -> Result<Vec<u8>, ExecutionError> {
        (self.0)(tool_name, parameters, image)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayCall {
    pub tool_name: String,
    pub parameters: Map<String, Value>,
    pub input: Vec<u8>,
}

/// Replays queued outputs in order and records every call it receives.
#[derive(Debug, Default)]
pub struct ScriptedGateway {
    outputs: Mutex<VecDeque<Result<Vec<u8>, ExecutionError>>>,
    calls: Mutex<Vec<GatewayCall>>,
}

impl ScriptedGateway {
    pub fn new(outputs: impl IntoIterator<Item = Result<Vec<u8>, ExecutionError>>) -> Self {
        Self {
            outputs: Mutex::new(outputs.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

impl ToolExecutionGateway for ScriptedGateway {
    fn execute(
        &self,
        tool_name: &str,
        parameters: &Map<String, Value>,
        image: &[u8],
    ) -> Result<Vec<u8>, ExecutionError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(GatewayCall {
                tool_name: tool_name.to_string(),
                parameters: parameters.clone(),
                input: image.to_vec(),
            });
        }
        let next = self
            .outputs
            .lock()
            .ok()
            .and_then(|mut outputs| outputs.pop_front());
        next.unwrap_or_else(|| {
            Err(ExecutionError::Failed {
                tool: tool_name.to_string(),
                message: String::from("no scripted output left"),
            })
        })
    }
}
