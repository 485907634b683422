//! Replaying a recorded run.
//!
//! A run directory holds `run.json` (what was asked) and the ledger trace
//! (what the model answered and what each tool returned). Replay feeds the
//! recorded replies back through a [`ScriptedProvider`] and answers snapshot
//! reads from the recorded results, so the section sequence does not depend
//! on the snapshot still matching. `write_section` runs again since sections
//! are rebuilt from the replies alone.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use repodoc_config::{ModelConfig, ProviderKind};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ledger::{Ledger, LedgerRecord, ToolCallRecord};
use crate::llm::{ModelHub, ModelReply, RetryPolicy, ScriptedProvider, ToolCall};
use crate::tools::{DocumentSections, Snapshot, ToolError, ToolName, ToolRegistry};

use super::artifact::DocumentationArtifact;
use super::context::{CancelToken, RunContext};
use super::orchestrator::DocAgent;
use super::{AgentSettings, RunError, RunFailure};

pub const RUN_META_FILE: &str = "run.json";

/// Parameters of a run, written before its first model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub task_id: String,
    pub model: String,
    pub max_steps: u32,
    pub max_consecutive_failures: u32,
    pub snapshot_root: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl RunMeta {
    pub fn from_context(ctx: &RunContext) -> Self {
        Self {
            task_id: ctx.task_id.clone(),
            model: ctx.model.clone(),
            max_steps: ctx.max_steps,
            max_consecutive_failures: ctx.max_consecutive_failures,
            snapshot_root: ctx.snapshot.root().display().to_string(),
            revision: ctx.snapshot.revision().map(str::to_string),
            started_at: Utc::now(),
        }
    }

    pub async fn write(&self, dir: &Path) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        tokio::fs::write(dir.join(RUN_META_FILE), json).await
    }

    pub async fn read(dir: &Path) -> Result<Self, RunError> {
        let bytes = tokio::fs::read(dir.join(RUN_META_FILE)).await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            RunError::Validation(format!("{} is not a valid run file: {e}", RUN_META_FILE))
        })
    }
}

/// Why a replay could not produce an artifact.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("cannot load recorded run: {0}")]
    Load(RunError),

    #[error("replayed run failed: {0}")]
    Run(#[from] RunFailure),
}

/// A finished run as recorded on disk.
#[derive(Debug, Clone)]
pub struct RecordedRun {
    pub meta: RunMeta,
    pub trace: Vec<LedgerRecord>,
}

impl RecordedRun {
    pub async fn load(run_dir: &Path) -> Result<Self, RunError> {
        let meta = RunMeta::read(run_dir).await?;
        let trace = Ledger::read_trace(run_dir).await?;
        Ok(Self { meta, trace })
    }

    /// Model replies in call order.
    pub fn replies(&self) -> Vec<&ModelReply> {
        self.trace
            .iter()
            .filter_map(|r| match r {
                LedgerRecord::Model(m) => Some(&m.reply),
                LedgerRecord::Tool(_) => None,
            })
            .collect()
    }

    /// Tool call records in call order.
    pub fn tool_records(&self) -> Vec<ToolCallRecord> {
        self.trace.iter().filter_map(tool_record).cloned().collect()
    }

    /// A hub serving the recorded replies under the recorded model id.
    ///
    /// Pricing comes from `catalog` when the model is listed there, so the
    /// replayed cost report matches the original.
    pub fn scripted_hub(&self, catalog: &[ModelConfig]) -> (ModelHub, Arc<ScriptedProvider>) {
        let config = catalog
            .iter()
            .find(|m| m.id == self.meta.model)
            .cloned()
            .unwrap_or_else(|| ModelConfig::new(&self.meta.model, ProviderKind::OpenAi));
        let provider = Arc::new(ScriptedProvider::from_replies(self.replies()));
        let hub = ModelHub::new().with_model(config, provider.clone());
        (hub, provider)
    }

    /// Re-run the loop against the recorded results, writing a fresh run into
    /// `output_dir`. `snapshot` only supplies the opening prompt.
    pub async fn replay(
        &self,
        snapshot: Snapshot,
        output_dir: &Path,
        mut settings: AgentSettings,
        catalog: &[ModelConfig],
    ) -> Result<DocumentationArtifact, RunFailure> {
        let (hub, provider) = self.scripted_hub(catalog);
        // A recorded reply is never a transient failure.
        settings.retry = RetryPolicy::immediate(1);
        let agent = DocAgent::new(Arc::new(hub), settings);
        let ctx = RunContext::new(
            self.meta.task_id.clone(),
            snapshot,
            output_dir,
            self.meta.model.clone(),
            self.meta.max_steps,
        )
        .with_failure_cap(self.meta.max_consecutive_failures);

        info!(
            task_id = %self.meta.task_id,
            replies = provider.remaining(),
            "replaying recorded run"
        );
        let outcome = agent
            .replay(ctx, &CancelToken::new(), self.tool_records())
            .await;
        if provider.remaining() > 0 {
            warn!(
                unused = provider.remaining(),
                "replay ended before every recorded reply was used"
            );
        }
        outcome
    }
}

/// Tool results served from a recording, in call order.
///
/// Reads of the snapshot return what was recorded. `write_section` and calls
/// the registry rejects before touching the snapshot are dispatched again.
#[derive(Debug)]
pub(crate) struct RecordedTools {
    registry: ToolRegistry,
    recorded: VecDeque<ToolCallRecord>,
}

impl RecordedTools {
    pub(crate) fn new(registry: ToolRegistry, recorded: Vec<ToolCallRecord>) -> Self {
        Self {
            registry,
            recorded: recorded.into(),
        }
    }

    pub(crate) async fn dispatch(
        &mut self,
        call: &ToolCall,
        sections: &mut DocumentSections,
    ) -> Result<String, ToolError> {
        let record = self.recorded.pop_front();
        let reads_snapshot = matches!(
            ToolName::parse(&call.name),
            Ok(ToolName::ListFiles | ToolName::ReadFile | ToolName::SearchCode)
        );
        if !reads_snapshot {
            return self.registry.dispatch(call, sections).await;
        }
        match record {
            Some(record) if record.tool == call.name && record.arguments == call.arguments => {
                record.outcome()
            }
            other => {
                warn!(
                    call_id = %call.id,
                    tool = %call.name,
                    recorded = ?other.map(|r| r.tool),
                    "no matching recorded result, reading the snapshot"
                );
                self.registry.dispatch(call, sections).await
            }
        }
    }
}

fn tool_record(record: &LedgerRecord) -> Option<&ToolCallRecord> {
    match record {
        LedgerRecord::Tool(t) => Some(t),
        LedgerRecord::Model(_) => None,
    }
}

/// Load the run in `run_dir` and replay it into `output_dir`.
pub async fn replay_run(
    run_dir: &Path,
    snapshot: Snapshot,
    output_dir: &Path,
    settings: AgentSettings,
    catalog: &[ModelConfig],
) -> Result<DocumentationArtifact, ReplayError> {
    let recorded = RecordedRun::load(run_dir).await.map_err(ReplayError::Load)?;
    Ok(recorded.replay(snapshot, output_dir, settings, catalog).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatMessage, ChatResponse, FinalAnswer, ScriptStep, SectionDraft, TokenUsage, ToolCall};
    use crate::tools::ToolLimits;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn settings() -> AgentSettings {
        AgentSettings {
            limits: ToolLimits {
                max_read_bytes: 4096,
                max_search_results: 20,
                max_list_entries: 100,
                exclude_dirs: Vec::new(),
            },
            max_sections: 8,
            max_section_bytes: 4096,
            result_summary_chars: 500,
            retry: RetryPolicy::immediate(1),
            conversation_snapshots: false,
        }
    }

    fn response(calls: Vec<ToolCall>, final_answer: Option<FinalAnswer>) -> ScriptStep {
        ScriptStep::Reply(ChatResponse {
            message: ChatMessage::assistant_tool_calls(None, calls),
            final_answer,
            finish_reason: "stop".to_string(),
            usage: TokenUsage::new(4, 2),
            model: "m".to_string(),
        })
    }

    #[tokio::test]
    async fn test_replay_reproduces_sections() {
        let repo = TempDir::new().unwrap();
        std::fs::write(repo.path().join("lib.rs"), "pub fn x() {}\n").unwrap();
        let snapshot = Snapshot::new(repo.path(), None).unwrap();
        let first_dir = TempDir::new().unwrap();

        let provider = Arc::new(ScriptedProvider::new(vec![
            response(
                vec![ToolCall {
                    id: "1".into(),
                    name: "read_file".into(),
                    arguments: json!({"path": "lib.rs"}),
                }],
                None,
            ),
            response(
                vec![ToolCall {
                    id: "2".into(),
                    name: "write_section".into(),
                    arguments: json!({"title": "API", "content": "`x()` does nothing."}),
                }],
                None,
            ),
            response(
                Vec::new(),
                Some(FinalAnswer {
                    sections: vec![SectionDraft {
                        title: "Summary".into(),
                        content: "Tiny.".into(),
                    }],
                    summary: None,
                }),
            ),
        ]));
        let hub = ModelHub::new().with_model(ModelConfig::new("m", ProviderKind::OpenAi), provider);
        let agent = DocAgent::new(Arc::new(hub), settings());
        let ctx = RunContext::new("t", snapshot.clone(), first_dir.path(), "m", 5);
        let original = agent.run(ctx, &CancelToken::new()).await.unwrap();

        let replay_dir = TempDir::new().unwrap();
        let replayed = replay_run(first_dir.path(), snapshot, replay_dir.path(), settings(), &[])
            .await
            .unwrap();
        assert_eq!(replayed.sections, original.sections);
        assert_eq!(replayed.steps, original.steps);

        let recorded = RecordedRun::load(replay_dir.path()).await.unwrap();
        assert_eq!(recorded.meta.task_id, "t");
        assert_eq!(recorded.replies().len(), 3);
    }

    #[tokio::test]
    async fn test_replay_ignores_snapshot_changes() {
        let repo = TempDir::new().unwrap();
        let body = format!("def two():\n    return {}\n", "2 + ".repeat(200));
        std::fs::write(repo.path().join("file2.py"), &body).unwrap();
        let snapshot = Snapshot::new(repo.path(), None).unwrap();
        let first_dir = TempDir::new().unwrap();

        let provider = Arc::new(ScriptedProvider::new(vec![
            response(
                vec![ToolCall {
                    id: "1".into(),
                    name: "read_file".into(),
                    arguments: json!({"path": "file2.py"}),
                }],
                None,
            ),
            response(
                Vec::new(),
                Some(FinalAnswer {
                    sections: vec![SectionDraft {
                        title: "Overview".into(),
                        content: "Adds twos.".into(),
                    }],
                    summary: None,
                }),
            ),
        ]));
        let hub = ModelHub::new().with_model(ModelConfig::new("m", ProviderKind::OpenAi), provider);
        let agent = DocAgent::new(Arc::new(hub), settings());
        let ctx = RunContext::new("t", snapshot.clone(), first_dir.path(), "m", 5).with_failure_cap(1);
        let original = agent.run(ctx, &CancelToken::new()).await.unwrap();

        std::fs::remove_file(repo.path().join("file2.py")).unwrap();

        let replay_dir = TempDir::new().unwrap();
        let replayed = replay_run(first_dir.path(), snapshot, replay_dir.path(), settings(), &[])
            .await
            .unwrap();
        assert_eq!(replayed.titles(), vec!["Overview"]);
        assert_eq!(replayed.sections, original.sections);

        // The file is gone, yet the replayed read returns the recorded content
        // in full, past the summary limit.
        let trace = RecordedRun::load(replay_dir.path()).await.unwrap();
        let reads = trace.tool_records();
        assert_eq!(reads.len(), 1);
        assert!(reads[0].success);
        assert!(reads[0].observation.is_some());
        assert!(reads[0].full_observation().contains(body.trim_end()));
    }

    #[tokio::test]
    async fn test_recorded_failures_replay_as_failures() {
        let repo = TempDir::new().unwrap();
        let registry = ToolRegistry::new(
            Snapshot::new(repo.path(), None).unwrap(),
            settings().limits,
        );
        let recorded = ToolCallRecord {
            seq: 1,
            call_id: "1".into(),
            tool: "read_file".into(),
            arguments: json!({"path": "a.rs"}),
            result_summary: "Error: not found: a.rs".into(),
            observation: None,
            timestamp: Utc::now(),
            success: false,
            error_kind: Some("not_found".into()),
        };
        let mut tools = RecordedTools::new(registry, vec![recorded]);
        // The file exists now, but the recording says it did not.
        std::fs::write(repo.path().join("a.rs"), "fn a() {}").unwrap();
        let call = ToolCall {
            id: "1".into(),
            name: "read_file".into(),
            arguments: json!({"path": "a.rs"}),
        };
        let mut sections = DocumentSections::new(4, 1024);
        let err = tools.dispatch(&call, &mut sections).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert_eq!(err.observation(), "Error: not found: a.rs");
        assert!(err.counts_as_failure());
    }

    #[tokio::test]
    async fn test_missing_run_dir_is_a_load_error() {
        let tmp = TempDir::new().unwrap();
        let snapshot = Snapshot::new(tmp.path(), None).unwrap();
        let err = replay_run(&tmp.path().join("nope"), snapshot, tmp.path(), settings(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::Load(_)));
    }
}
