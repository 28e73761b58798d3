pub mod sqlite;

use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::analysis::ImageAnalysis;
use crate::error::HistoryError;
use crate::tools::{registry, ToolSpec};

pub use sqlite::SqliteHistoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Accepted,
    Rejected,
    Exhausted,
    Aborted,
}

impl TerminalState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Exhausted => "exhausted",
            Self::Aborted => "aborted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            "exhausted" => Some(Self::Exhausted),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMetrics {
    pub pixels_changed: u64,
    pub percentage_changed: f64,
    pub quality_score: f64,
    pub execution_time_ms: u64,
}

/// One terminal outcome of a proposal. Never edited after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub tool_name: String,
    pub parameters: Map<String, Value>,
    pub success: bool,
    pub confidence: f64,
    pub result_metrics: ResultMetrics,
    pub image_snapshot: ImageAnalysis,
    pub timestamp: String,
    pub terminal_state: TerminalState,
    pub attempts: u32,
}

impl ExecutionRecord {
    pub fn new(
        tool_name: impl Into<String>,
        parameters: Map<String, Value>,
        terminal_state: TerminalState,
        attempts: u32,
        confidence: f64,
        result_metrics: ResultMetrics,
        image_snapshot: ImageAnalysis,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tool_name: tool_name.into(),
            parameters,
            success: terminal_state == TerminalState::Accepted,
            confidence: confidence.clamp(0.0, 100.0),
            result_metrics,
            image_snapshot,
            timestamp: now_iso(),
            terminal_state,
            attempts,
        }
    }
}

/// Append-only log of terminal outcomes, readable concurrently.
///
/// Queries return records newest first.
pub trait HistoryStore: Send + Sync + 'static {
    fn append(&self, record: &ExecutionRecord) -> Result<(), HistoryError>;

    fn recent_for_tool(
        &self,
        tool_name: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, HistoryError>;

    fn successful_for_tool(
        &self,
        tool_name: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, HistoryError>;

    fn len(&self) -> Result<usize, HistoryError>;

    fn is_empty(&self) -> Result<bool, HistoryError> {
        Ok(self.len()? == 0)
    }

    /// Successful records whose normalized numeric parameters lie within `radius`.
    fn similar_successes(
        &self,
        tool_name: &str,
        parameters: &Map<String, Value>,
        radius: f64,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, HistoryError> {
        let Some(spec) = registry().get(tool_name) else {
            return Ok(Vec::new());
        };
        let records = self.successful_for_tool(spec.name, limit)?;
        Ok(find_similar_successes(&records, spec, parameters, radius))
    }
}

pub type SharedHistoryStore = Arc<dyn HistoryStore>;

#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    records: RwLock<Vec<ExecutionRecord>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<ExecutionRecord>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }

    pub fn shared() -> SharedHistoryStore {
        Arc::new(Self::new())
    }

    fn query(
        &self,
        tool_name: &str,
        limit: usize,
        only_successful: bool,
    ) -> Result<Vec<ExecutionRecord>, HistoryError> {
        let records = self.records.read().map_err(|_| HistoryError::Poisoned)?;
        Ok(records
            .iter()
            .rev()
            .filter(|r| r.tool_name == tool_name && (!only_successful || r.success))
            .take(limit)
            .cloned()
            .collect())
    }
}

impl HistoryStore for InMemoryHistoryStore {
    fn append(&self, record: &ExecutionRecord) -> Result<(), HistoryError> {
        let mut records = self.records.write().map_err(|_| HistoryError::Poisoned)?;
        records.push(record.clone());
        Ok(())
    }

    fn recent_for_tool(
        &self,
        tool_name: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, HistoryError> {
        self.query(tool_name, limit, false)
    }

    fn successful_for_tool(
        &self,
        tool_name: &str,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, HistoryError> {
        self.query(tool_name, limit, true)
    }

    fn len(&self) -> Result<usize, HistoryError> {
        Ok(self
            .records
            .read()
            .map_err(|_| HistoryError::Poisoned)?
            .len())
    }
}

/// Root-mean-square distance over the tool's numeric parameters, each
/// normalized by its declared range. `None` when no numeric parameter is shared.
pub fn parameter_distance(
    spec: &ToolSpec,
    a: &Map<String, Value>,
    b: &Map<String, Value>,
) -> Option<f64> {
    let mut sum = 0.0;
    let mut count = 0usize;
    for param in &spec.schema.params {
        let Some((min, max, _)) = param.bounds() else {
            continue;
        };
        let (Some(left), Some(right)) = (
            spec.schema.number_or_default(a, param.name),
            spec.schema.number_or_default(b, param.name),
        ) else {
            continue;
        };
        let span = (max - min).max(f64::EPSILON);
        sum += ((left - right) / span).powi(2);
        count += 1;
    }
    (count > 0).then(|| (sum / count as f64).sqrt())
}

pub fn find_similar_successes(
    records: &[ExecutionRecord],
    spec: &ToolSpec,
    parameters: &Map<String, Value>,
    radius: f64,
) -> Vec<ExecutionRecord> {
    records
        .iter()
        .filter(|r| r.success && r.tool_name == spec.name)
        .filter(|r| {
            parameter_distance(spec, &r.parameters, parameters).is_some_and(|d| d <= radius)
        })
        .cloned()
        .collect()
}

fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::analysis::{DominantColor, Rgb};
    use serde_json::json;

    pub(crate) fn snapshot() -> ImageAnalysis {
        ImageAnalysis {
            width: 10,
            height: 10,
            dominant_colors: vec![DominantColor::new(Rgb::new(255, 0, 0), 1.0)],
            has_transparency: false,
            sharpness: 0.0,
            noise_level: 0.0,
            dpi: 72.0,
            is_print_ready: false,
            confidence: 100.0,
            digest: String::from("snapshot"),
        }
    }

    pub(crate) fn record(tool: &str, params: Value, state: TerminalState) -> ExecutionRecord {
        ExecutionRecord::new(
            tool,
            params.as_object().cloned().unwrap_or_default(),
            state,
            1,
            90.0,
            ResultMetrics::default(),
            snapshot(),
        )
    }

    #[test]
    fn in_memory_queries_are_newest_first_and_filtered() {
        let store = InMemoryHistoryStore::new();
        for tolerance in [5, 10, 15] {
            store
                .append(&record(
                    "remove_color",
                    json!({"colors": ["#ff0000"], "tolerance": tolerance}),
                    TerminalState::Accepted,
                ))
                .expect("append should succeed");
        }
        store
            .append(&record("remove_color", json!({}), TerminalState::Rejected))
            .expect("append should succeed");
        store
            .append(&record("upscale", json!({"scale_factor": 2}), TerminalState::Accepted))
            .expect("append should succeed");

        assert_eq!(store.len().expect("len"), 5);
        let recent = store.recent_for_tool("remove_color", 2).expect("recent");
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].terminal_state, TerminalState::Rejected);
        let successes = store.successful_for_tool("remove_color", 10).expect("successes");
        assert_eq!(successes.len(), 3);
        assert_eq!(successes[0].parameters["tolerance"], json!(15));
    }

    #[test]
    fn similar_successes_use_normalized_distance() {
        let store = InMemoryHistoryStore::new();
        for tolerance in [10, 40] {
            store
                .append(&record(
                    "remove_color",
                    json!({"colors": ["#ff0000"], "tolerance": tolerance}),
                    TerminalState::Accepted,
                ))
                .expect("append should succeed");
        }
        let proposal = json!({"colors": ["#00ff00"], "tolerance": 12});
        let similar = store
            .similar_successes(
                "remove_color",
                proposal.as_object().expect("object"),
                0.1,
                50,
            )
            .expect("lookup");
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0].parameters["tolerance"], json!(10));
    }

    #[test]
    fn only_accepted_records_count_as_success() {
        assert!(record("crop", json!({}), TerminalState::Accepted).success);
        assert!(!record("crop", json!({}), TerminalState::Exhausted).success);
        assert_eq!(TerminalState::parse("aborted"), Some(TerminalState::Aborted));
    }
}
