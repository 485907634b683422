//! End-to-end documentation runs against scripted models.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use repodoc_config::AppConfig;
use repodoc_core::agent::{RecordedRun, replay_run};
use repodoc_core::ledger::{CostEntry, Ledger, LedgerRecord, COST_LEDGER_FILE, COST_SUMMARY_FILE};
use repodoc_core::llm::{ScriptStep, ScriptedProvider};
use repodoc_core::{AgentSettings, CancelToken, DocAgent, ModelHub, RunContext, RunError};
use repodoc_test_utils::config::TestConfigBuilder;
use repodoc_test_utils::script::{USAGE, call, finish, text};
use repodoc_test_utils::snapshot::TestSnapshot;
use repodoc_core::logging::INFO_LOG_FILE;
use repodoc_test_utils::tracing_setup::{capture_run_log, init_test_tracing};
use serde_json::json;
use tempfile::TempDir;

const MODEL: &str = "stub";

fn config() -> AppConfig {
    TestConfigBuilder::new()
        .stub_model(MODEL)
        .max_steps(10)
        .fast_retry(2)
        .build()
}

fn repo() -> TestSnapshot {
    TestSnapshot::new()
        .file("file1.py", "def one():\n    return 1\n")
        .file("file2.py", "def two():\n    return one() + 1\n")
        .file("README.md", "# Demo\n\nTwo tiny functions.\n")
}

fn agent(config: &AppConfig, steps: Vec<ScriptStep>) -> (DocAgent, Arc<ScriptedProvider>) {
    let provider = Arc::new(ScriptedProvider::new(steps));
    let model = config.model(MODEL).unwrap().clone();
    let hub = ModelHub::new().with_model(model, provider.clone());
    (
        DocAgent::new(Arc::new(hub), AgentSettings::from_config(config)),
        provider,
    )
}

fn read_costs(dir: &std::path::Path) -> Vec<CostEntry> {
    std::fs::read_to_string(dir.join(COST_LEDGER_FILE))
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[test_log::test(tokio::test)]
async fn test_explore_then_finish() {
    let repo = repo();
    let out = TempDir::new().unwrap();
    let config = config();
    let (agent, provider) = agent(
        &config,
        vec![
            call("c1", "list_files", json!({"path": "."})),
            call("c2", "read_file", json!({"path": "file2.py"})),
            finish(&[("Overview", "`two()` builds on `one()`.")]),
        ],
    );

    let ctx = RunContext::new("scenario-a", repo.snapshot(), out.path(), MODEL, 10);
    let artifact = agent.run(ctx, &CancelToken::new()).await.unwrap();

    assert!(artifact.complete);
    assert_eq!(artifact.steps, 3);
    assert_eq!(artifact.titles(), vec!["Overview"]);
    assert_eq!(provider.remaining(), 0);

    let trace = Ledger::read_trace(out.path()).await.unwrap();
    let kinds: Vec<&str> = trace
        .iter()
        .map(|r| match r {
            LedgerRecord::Model(_) => "model",
            LedgerRecord::Tool(_) => "tool",
        })
        .collect();
    assert_eq!(kinds, vec!["model", "tool", "model", "tool", "model"]);
    let seqs: Vec<u64> = trace.iter().map(LedgerRecord::seq).collect();
    assert_eq!(seqs, vec![0, 1, 2, 3, 4]);

    let read = trace
        .iter()
        .find_map(|r| match r {
            LedgerRecord::Tool(t) if t.tool == "read_file" => Some(t),
            _ => None,
        })
        .unwrap();
    assert!(read.success);
    assert!(read.result_summary.contains("def two()"));

    let doc = std::fs::read_to_string(artifact.documentation_path()).unwrap();
    assert!(doc.contains("Overview"));
    assert!(out.path().join("sections").read_dir().unwrap().count() == 1);

    // The opening message carries the README and the folder tree.
    let first = &provider.requests()[0];
    let opening = first.messages.last().unwrap().content.clone().unwrap();
    assert!(opening.contains("Two tiny functions."));
    assert!(opening.contains("file1.py"));
}

#[tokio::test]
async fn test_cost_report_sums_every_model_call() {
    init_test_tracing();
    let repo = repo();
    let out = TempDir::new().unwrap();
    let config = config();
    let (agent, _) = agent(
        &config,
        vec![
            call("c1", "search_code", json!({"query": "one"})),
            call("c2", "write_section", json!({"title": "Usage", "content": "Call `two()`."})),
            finish(&[]),
        ],
    );

    let ctx = RunContext::new("costs", repo.snapshot(), out.path(), MODEL, 10);
    let artifact = agent.run(ctx, &CancelToken::new()).await.unwrap();

    let entries = read_costs(out.path());
    assert_eq!(entries.len(), 3);
    let model = config.model(MODEL).unwrap();
    let per_call = f64::from(USAGE.prompt_tokens) * model.rate_in
        + f64::from(USAGE.completion_tokens) * model.rate_out;
    let summed: f64 = entries.iter().map(|e| e.cost).sum();
    assert!((summed - 3.0 * per_call).abs() < 1e-12);
    assert!((artifact.totals.cost - summed).abs() < 1e-12);
    assert_eq!(artifact.totals.prompt_tokens, 3 * u64::from(USAGE.prompt_tokens));

    let report: serde_json::Value =
        serde_json::from_slice(&std::fs::read(out.path().join(COST_SUMMARY_FILE)).unwrap())
            .unwrap();
    assert_eq!(report["calls"], 3);
    assert!((report["cost"].as_f64().unwrap() - summed).abs() < 1e-12);
}

#[tokio::test]
async fn test_escaping_path_is_reported_and_run_continues() {
    let repo = repo();
    let out = TempDir::new().unwrap();
    let config = config();
    let (agent, provider) = agent(
        &config,
        vec![
            call("c1", "read_file", json!({"path": "../../etc/passwd"})),
            finish(&[("Overview", "Done.")]),
        ],
    );

    let (log, _guard) = capture_run_log();
    log.attach(out.path()).unwrap();

    let ctx = RunContext::new("escape", repo.snapshot(), out.path(), MODEL, 10);
    let artifact = agent.run(ctx, &CancelToken::new()).await.unwrap();
    assert!(artifact.complete);

    log.detach();
    let info = std::fs::read_to_string(out.path().join(INFO_LOG_FILE)).unwrap();
    assert!(info.contains("documentation run started"));
    assert!(info.contains("tool call failed"));
    assert!(info.contains("documentation run finished"));

    let trace = Ledger::read_trace(out.path()).await.unwrap();
    let tool = trace
        .iter()
        .find_map(|r| match r {
            LedgerRecord::Tool(t) => Some(t),
            LedgerRecord::Model(_) => None,
        })
        .unwrap();
    assert!(!tool.success);
    assert_eq!(tool.error_kind.as_deref(), Some("path_escape"));

    // The model saw the error as the result of its call.
    let second = &provider.requests()[1];
    let observation = second.messages.last().unwrap();
    assert_eq!(observation.tool_call_id.as_deref(), Some("c1"));
    assert!(observation.content.as_deref().unwrap().starts_with("Error:"));
}

#[tokio::test]
async fn test_step_limit_keeps_written_sections() {
    let repo = repo();
    let out = TempDir::new().unwrap();
    let config = config();
    let (agent, _) = agent(
        &config,
        vec![
            call("c1", "write_section", json!({"title": "Intro", "content": "Hi."})),
            call("c2", "list_files", json!({})),
        ],
    );

    let ctx = RunContext::new("limit", repo.snapshot(), out.path(), MODEL, 2);
    let failure = agent.run(ctx, &CancelToken::new()).await.unwrap_err();
    assert!(!failure.artifact.complete);
    assert_eq!(failure.artifact.titles(), vec!["Intro"]);
    let doc = std::fs::read_to_string(failure.artifact.documentation_path()).unwrap();
    assert!(doc.contains("Partial documentation"));
}

#[tokio::test]
async fn test_replay_follows_the_recording() {
    let repo = repo();
    let first = TempDir::new().unwrap();
    let config = config();
    let (agent, _) = agent(
        &config,
        vec![
            call("c1", "read_file", json!({"path": "file1.py"})),
            call("c2", "write_section", json!({"title": "API", "content": "`one()`"})),
            finish(&[("Summary", "Small.")]),
        ],
    );
    let ctx = RunContext::new("recorded", repo.snapshot(), first.path(), MODEL, 10);
    let original = agent.run(ctx, &CancelToken::new()).await.unwrap();

    let second = TempDir::new().unwrap();
    let replayed = replay_run(
        first.path(),
        repo.snapshot(),
        second.path(),
        AgentSettings::from_config(&config),
        &config.models,
    )
    .await
    .unwrap();

    assert_eq!(replayed.sections, original.sections);
    assert!((replayed.totals.cost - original.totals.cost).abs() < 1e-12);

    let before = RecordedRun::load(first.path()).await.unwrap();
    let after = RecordedRun::load(second.path()).await.unwrap();
    assert_eq!(before.replies(), after.replies());
    assert_eq!(after.meta.revision.as_deref(), Some("test-rev"));
}

#[tokio::test]
async fn test_chatty_model_hits_the_failure_cap() {
    init_test_tracing();
    let repo = repo();
    let out = TempDir::new().unwrap();
    let config = TestConfigBuilder::new()
        .stub_model(MODEL)
        .max_consecutive_failures(2)
        .fast_retry(1)
        .build();
    let (agent, provider) = agent(
        &config,
        vec![
            text("Let me think about this repository."),
            text("Still thinking."),
            finish(&[("Never", "reached")]),
        ],
    );

    let ctx = RunContext::new("chatty", repo.snapshot(), out.path(), MODEL, 10)
        .with_failure_cap(config.agent.max_consecutive_failures);
    let failure = agent.run(ctx, &CancelToken::new()).await.unwrap_err();
    assert!(matches!(failure.error, RunError::TooManyFailures { count: 2 }));
    assert_eq!(provider.remaining(), 1);
    assert!(failure.artifact.sections.is_empty());

    // The second request carried the text back plus a corrective message.
    let second = &provider.requests()[1];
    let n = second.messages.len();
    assert_eq!(second.messages[n - 2].role, "assistant");
    assert_eq!(second.messages[n - 1].role, "user");
}
