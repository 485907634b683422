//! Audit and cost ledger: the append-only record of a run.
//!
//! Two JSON-lines streams live in the run directory:
//!
//! - `call_sequence.jsonl`: every tool and model call, in order
//! - `cost_ledger.jsonl`: one [`CostEntry`] per model call
//!
//! Each append is flushed and synced before the call returns, so the caller
//! may only feed a result back into the conversation after its record is on
//! disk. Records are never edited or removed; totals are derived on demand.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::llm::types::{ModelReply, TokenUsage, ToolCall};
use crate::tools::ToolError;

pub const CALL_SEQUENCE_FILE: &str = "call_sequence.jsonl";
pub const COST_LEDGER_FILE: &str = "cost_ledger.jsonl";
pub const COST_SUMMARY_FILE: &str = "cost.json";

/// Errors from writing or reading a ledger.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger record is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per-token prices of one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rates {
    pub rate_in: f64,
    pub rate_out: f64,
}

/// Prices keyed by model id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateTable {
    rates: HashMap<String, Rates>,
}

impl RateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_models<'a>(models: impl IntoIterator<Item = &'a repodoc_config::ModelConfig>) -> Self {
        let rates = models
            .into_iter()
            .map(|m| {
                (
                    m.id.clone(),
                    Rates {
                        rate_in: m.rate_in,
                        rate_out: m.rate_out,
                    },
                )
            })
            .collect();
        Self { rates }
    }

    pub fn with_rate(mut self, model: &str, rate_in: f64, rate_out: f64) -> Self {
        self.rates
            .insert(model.to_string(), Rates { rate_in, rate_out });
        self
    }

    /// Cost of one call, or `None` if the model has no rate.
    pub fn cost(&self, model: &str, usage: &TokenUsage) -> Option<f64> {
        self.rates.get(model).map(|r| {
            f64::from(usage.prompt_tokens) * r.rate_in
                + f64::from(usage.completion_tokens) * r.rate_out
        })
    }
}

/// One executed tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub seq: u64,
    pub call_id: String,
    pub tool: String,
    pub arguments: serde_json::Value,
    /// The observation returned to the model, truncated when oversized.
    pub result_summary: String,
    /// The whole observation, kept only when `result_summary` is cut short.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl ToolCallRecord {
    /// The observation exactly as the model received it.
    pub fn full_observation(&self) -> &str {
        self.observation.as_deref().unwrap_or(&self.result_summary)
    }

    /// The recorded outcome, as the registry would have returned it.
    pub fn outcome(&self) -> Result<String, ToolError> {
        if self.success {
            return Ok(self.full_observation().to_string());
        }
        Err(ToolError::Recorded {
            kind: self.error_kind.clone().unwrap_or_else(|| "unknown".to_string()),
            observation: self.full_observation().to_string(),
        })
    }
}

/// One completed model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCallRecord {
    pub seq: u64,
    pub step: u32,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub usage: TokenUsage,
    pub cost: f64,
    /// The normalized reply, kept whole so the run can be replayed.
    pub reply: ModelReply,
}

/// An entry of the call sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerRecord {
    Tool(ToolCallRecord),
    Model(ModelCallRecord),
}

impl LedgerRecord {
    pub fn seq(&self) -> u64 {
        match self {
            Self::Tool(r) => r.seq,
            Self::Model(r) => r.seq,
        }
    }
}

/// Cost of one model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEntry {
    pub seq: u64,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost: f64,
    /// False when the model had no rate and the cost was recorded as zero.
    pub priced: bool,
}

/// Totals derived from the cost entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostTotals {
    pub calls: usize,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
    pub per_model: BTreeMap<String, ModelTotals>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelTotals {
    pub calls: usize,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
}

#[derive(Serialize)]
struct CostSummary<'a> {
    start_epoch: i64,
    end_epoch: i64,
    elapsed_seconds: f64,
    #[serde(flatten)]
    totals: &'a CostTotals,
}

struct LedgerFiles {
    dir: PathBuf,
    calls: tokio::fs::File,
    costs: tokio::fs::File,
}

/// Append-only recorder of one run.
pub struct Ledger {
    files: Option<LedgerFiles>,
    records: Vec<LedgerRecord>,
    costs: Vec<CostEntry>,
    rates: RateTable,
    summary_chars: usize,
    started: DateTime<Utc>,
    next_seq: u64,
}

impl Ledger {
    /// Open a ledger writing into `dir`, which must exist.
    pub async fn create(
        dir: &Path,
        rates: RateTable,
        summary_chars: usize,
    ) -> Result<Self, LedgerError> {
        let calls = open_append(&dir.join(CALL_SEQUENCE_FILE)).await?;
        let costs = open_append(&dir.join(COST_LEDGER_FILE)).await?;
        let mut ledger = Self::in_memory(rates, summary_chars);
        ledger.files = Some(LedgerFiles {
            dir: dir.to_path_buf(),
            calls,
            costs,
        });
        Ok(ledger)
    }

    /// A ledger that keeps records in memory only.
    pub fn in_memory(rates: RateTable, summary_chars: usize) -> Self {
        Self {
            files: None,
            records: Vec::new(),
            costs: Vec::new(),
            rates,
            summary_chars,
            started: Utc::now(),
            next_seq: 0,
        }
    }

    /// Directory the ledger writes to, if any.
    pub fn dir(&self) -> Option<&Path> {
        self.files.as_ref().map(|f| f.dir.as_path())
    }

    /// Record a tool call and its outcome. The outcome text must not reach
    /// the model before this returns.
    pub async fn record_tool(
        &mut self,
        call: &ToolCall,
        outcome: &Result<String, ToolError>,
    ) -> Result<ToolCallRecord, LedgerError> {
        let (text, success, error_kind) = match outcome {
            Ok(text) => (text.clone(), true, None),
            Err(err) => (err.observation(), false, Some(err.kind().to_string())),
        };
        let result_summary = truncate_summary(&text, self.summary_chars);
        let observation = (result_summary != text).then_some(text);
        let record = ToolCallRecord {
            seq: self.take_seq(),
            call_id: call.id.clone(),
            tool: call.name.clone(),
            arguments: call.arguments.clone(),
            result_summary,
            observation,
            timestamp: Utc::now(),
            success,
            error_kind,
        };
        let entry = LedgerRecord::Tool(record.clone());
        self.append_call(&entry).await?;
        self.records.push(entry);
        Ok(record)
    }

    /// Record a completed model call and its cost.
    pub async fn record_model(
        &mut self,
        step: u32,
        reply: &ModelReply,
    ) -> Result<CostEntry, LedgerError> {
        let priced_cost = self.rates.cost(&reply.model, &reply.usage);
        if priced_cost.is_none() {
            warn!(model = %reply.model, "no rate for model, cost recorded as zero");
        }
        let cost = priced_cost.unwrap_or(0.0);
        let seq = self.take_seq();

        let entry = LedgerRecord::Model(ModelCallRecord {
            seq,
            step,
            timestamp: Utc::now(),
            model: reply.model.clone(),
            usage: reply.usage,
            cost,
            reply: reply.clone(),
        });
        self.append_call(&entry).await?;
        self.records.push(entry);

        let cost_entry = CostEntry {
            seq,
            model: reply.model.clone(),
            prompt_tokens: reply.usage.prompt_tokens,
            completion_tokens: reply.usage.completion_tokens,
            cost,
            priced: priced_cost.is_some(),
        };
        if let Some(files) = self.files.as_mut() {
            append_line(&mut files.costs, &cost_entry).await?;
        }
        self.costs.push(cost_entry.clone());
        Ok(cost_entry)
    }

    /// The full ordered call sequence.
    pub fn records(&self) -> &[LedgerRecord] {
        &self.records
    }

    pub fn cost_entries(&self) -> &[CostEntry] {
        &self.costs
    }

    pub fn tool_records(&self) -> impl Iterator<Item = &ToolCallRecord> {
        self.records.iter().filter_map(|r| match r {
            LedgerRecord::Tool(t) => Some(t),
            LedgerRecord::Model(_) => None,
        })
    }

    pub fn model_records(&self) -> impl Iterator<Item = &ModelCallRecord> {
        self.records.iter().filter_map(|r| match r {
            LedgerRecord::Model(m) => Some(m),
            LedgerRecord::Tool(_) => None,
        })
    }

    /// Running totals, derived from the cost entries.
    pub fn totals(&self) -> CostTotals {
        totals_of(&self.costs)
    }

    /// Write the `cost.json` report. Appends stay possible afterwards but
    /// the report is not refreshed.
    pub async fn finish(&mut self) -> Result<Option<PathBuf>, LedgerError> {
        let Some(files) = self.files.as_ref() else {
            return Ok(None);
        };
        let end = Utc::now();
        let totals = self.totals();
        let summary = CostSummary {
            start_epoch: self.started.timestamp(),
            end_epoch: end.timestamp(),
            elapsed_seconds: (end - self.started).num_milliseconds() as f64 / 1000.0,
            totals: &totals,
        };
        let path = files.dir.join(COST_SUMMARY_FILE);
        tokio::fs::write(&path, serde_json::to_vec_pretty(&summary)?).await?;
        Ok(Some(path))
    }

    /// Load the call sequence persisted in a run directory.
    pub async fn read_trace(dir: &Path) -> Result<Vec<LedgerRecord>, LedgerError> {
        let text = tokio::fs::read_to_string(dir.join(CALL_SEQUENCE_FILE)).await?;
        let mut records = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            records.push(serde_json::from_str(line)?);
        }
        Ok(records)
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    async fn append_call(&mut self, record: &LedgerRecord) -> Result<(), LedgerError> {
        if let Some(files) = self.files.as_mut() {
            append_line(&mut files.calls, record).await?;
        }
        Ok(())
    }
}

/// Totals over a set of cost entries, summed in entry order.
pub fn totals_of(entries: &[CostEntry]) -> CostTotals {
    let mut totals = CostTotals::default();
    for entry in entries {
        totals.calls += 1;
        totals.prompt_tokens += u64::from(entry.prompt_tokens);
        totals.completion_tokens += u64::from(entry.completion_tokens);
        totals.cost += entry.cost;
        let model = totals.per_model.entry(entry.model.clone()).or_default();
        model.calls += 1;
        model.prompt_tokens += u64::from(entry.prompt_tokens);
        model.completion_tokens += u64::from(entry.completion_tokens);
        model.cost += entry.cost;
    }
    totals
}

async fn open_append(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

async fn append_line<T: Serialize>(file: &mut tokio::fs::File, value: &T) -> Result<(), LedgerError> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    file.write_all(&line).await?;
    file.flush().await?;
    file.sync_data().await?;
    Ok(())
}

fn truncate_summary(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}… [truncated {} chars]", total - max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn reply(model: &str, prompt: u32, completion: u32) -> ModelReply {
        ModelReply {
            model: model.to_string(),
            content: None,
            tool_calls: vec![],
            final_answer: None,
            usage: TokenUsage::new(prompt, completion),
        }
    }

    fn call(name: &str) -> ToolCall {
        ToolCall {
            id: "c1".to_string(),
            name: name.to_string(),
            arguments: serde_json::json!({"path": "."}),
        }
    }

    #[tokio::test]
    async fn test_sequence_numbers_are_monotonic() {
        let mut ledger = Ledger::in_memory(RateTable::new(), 100);
        ledger.record_model(0, &reply("m", 1, 1)).await.unwrap();
        ledger.record_tool(&call("list_files"), &Ok("a".into())).await.unwrap();
        ledger.record_model(1, &reply("m", 1, 1)).await.unwrap();
        let seqs: Vec<u64> = ledger.records().iter().map(LedgerRecord::seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_cost_is_sum_of_calls() {
        let rates = RateTable::new().with_rate("m", 0.001, 0.002);
        let mut ledger = Ledger::in_memory(rates, 100);
        let usages = [(100u32, 20u32), (250, 40), (75, 300)];
        for (i, (p, c)) in usages.iter().enumerate() {
            ledger.record_model(i as u32, &reply("m", *p, *c)).await.unwrap();
        }
        let expected: f64 = usages
            .iter()
            .map(|(p, c)| f64::from(*p) * 0.001 + f64::from(*c) * 0.002)
            .sum();
        let totals = ledger.totals();
        assert_eq!(totals.cost, expected);
        assert_eq!(totals.calls, 3);
        assert_eq!(totals.prompt_tokens, 425);
        assert_eq!(totals.per_model["m"].completion_tokens, 360);
    }

    #[tokio::test]
    async fn test_unknown_model_costs_zero() {
        let mut ledger = Ledger::in_memory(RateTable::new(), 100);
        let entry = ledger.record_model(0, &reply("mystery", 1000, 1000)).await.unwrap();
        assert_eq!(entry.cost, 0.0);
        assert!(!entry.priced);
    }

    #[tokio::test]
    async fn test_failed_tool_record() {
        let mut ledger = Ledger::in_memory(RateTable::new(), 100);
        let record = ledger
            .record_tool(
                &call("read_file"),
                &Err(ToolError::PathEscape("../x".to_string())),
            )
            .await
            .unwrap();
        assert!(!record.success);
        assert_eq!(record.error_kind.as_deref(), Some("path_escape"));
        assert!(record.result_summary.contains("escapes"));
    }

    #[tokio::test]
    async fn test_summary_truncated() {
        let mut ledger = Ledger::in_memory(RateTable::new(), 5);
        let record = ledger
            .record_tool(&call("read_file"), &Ok("abcdefghij".into()))
            .await
            .unwrap();
        assert_eq!(record.result_summary, "abcde… [truncated 5 chars]");
        assert_eq!(record.full_observation(), "abcdefghij");
        assert_eq!(record.outcome(), Ok("abcdefghij".to_string()));
    }

    #[tokio::test]
    async fn test_short_result_is_not_stored_twice() {
        let mut ledger = Ledger::in_memory(RateTable::new(), 100);
        let record = ledger
            .record_tool(&call("list_files"), &Ok("a.rs".into()))
            .await
            .unwrap();
        assert!(record.observation.is_none());
        assert_eq!(record.full_observation(), "a.rs");
    }

    #[tokio::test]
    async fn test_failed_record_reproduces_its_error() {
        let mut ledger = Ledger::in_memory(RateTable::new(), 100);
        let original = ToolError::NotFound("gone.py".to_string());
        let record = ledger
            .record_tool(&call("read_file"), &Err(original.clone()))
            .await
            .unwrap();
        let Err(replayed) = record.outcome() else {
            panic!("expected a failed outcome");
        };
        assert_eq!(replayed.kind(), "not_found");
        assert_eq!(replayed.observation(), original.observation());
        assert!(replayed.counts_as_failure());
    }

    #[tokio::test]
    async fn test_persisted_trace_matches_memory() {
        let tmp = TempDir::new().unwrap();
        let rates = RateTable::new().with_rate("m", 0.5, 1.0);
        let mut ledger = Ledger::create(tmp.path(), rates, 100).await.unwrap();
        ledger.record_model(0, &reply("m", 2, 3)).await.unwrap();
        ledger.record_tool(&call("list_files"), &Ok("a.rs".into())).await.unwrap();

        let trace = Ledger::read_trace(tmp.path()).await.unwrap();
        assert_eq!(trace, ledger.records());

        let costs = std::fs::read_to_string(tmp.path().join(COST_LEDGER_FILE)).unwrap();
        let entry: CostEntry = serde_json::from_str(costs.lines().next().unwrap()).unwrap();
        assert_eq!(entry.cost, 4.0);

        let path = ledger.finish().await.unwrap().unwrap();
        let summary: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(summary["cost"], 4.0);
        assert_eq!(summary["calls"], 1);
        assert!(summary["elapsed_seconds"].as_f64().unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn test_in_memory_finish_writes_nothing() {
        let mut ledger = Ledger::in_memory(RateTable::new(), 10);
        assert!(ledger.finish().await.unwrap().is_none());
        assert!(ledger.dir().is_none());
    }
}
