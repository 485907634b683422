//! The state machine driving a documentation run.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::ledger::{Ledger, ToolCallRecord};
use crate::llm::{
    ChatMessage, FinalAnswer, ModelHub, ModelReply, ToolCall, ToolDefinition,
    final_answer_definition, with_retry,
};
use crate::tools::{DocumentSections, ToolError, ToolRegistry};

use super::artifact::DocumentationArtifact;
use super::context::{CancelToken, Conversation, RunContext};
use super::prompt;
use super::replay::{RecordedTools, RunMeta};
use super::state::AgentState;
use super::{AgentSettings, CapacityKind, RunError, RunFailure};

/// Observation fed back to the model when it called more than one tool.
const MULTIPLE_CALLS_OBSERVATION: &str = "error: only one tool call per reply is allowed. \
     None of the requested calls were executed; call the tools one at a time.";

/// Observation fed back when the reply had neither a tool call nor a final answer.
const NO_ACTION_OBSERVATION: &str = "error: your reply did not call a tool. Call one of the \
     available tools, or submit the documentation when you are done.";

/// Runs documentation tasks against a shared [`ModelHub`].
///
/// One `DocAgent` can serve any number of concurrent runs; each call to
/// [`run`](Self::run) owns its own context, conversation and ledger.
#[derive(Clone)]
pub struct DocAgent {
    hub: Arc<ModelHub>,
    settings: AgentSettings,
}

impl DocAgent {
    pub fn new(hub: Arc<ModelHub>, settings: AgentSettings) -> Self {
        Self { hub, settings }
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Run the task in `ctx` to completion.
    ///
    /// On failure the returned [`RunFailure`] carries the partial artifact.
    /// A context that fails validation writes nothing to disk.
    pub async fn run(
        &self,
        ctx: RunContext,
        cancel: &CancelToken,
    ) -> Result<DocumentationArtifact, RunFailure> {
        self.run_with(ctx, cancel, None).await
    }

    /// Run the task answering snapshot reads from `recorded` instead of the
    /// snapshot itself.
    pub(crate) async fn replay(
        &self,
        ctx: RunContext,
        cancel: &CancelToken,
        recorded: Vec<ToolCallRecord>,
    ) -> Result<DocumentationArtifact, RunFailure> {
        self.run_with(ctx, cancel, Some(recorded)).await
    }

    /// Validate `ctx` and check that the hub serves its model.
    pub fn check(&self, ctx: &RunContext) -> Result<(), RunError> {
        ctx.validate()?;
        self.ensure_model(ctx)
    }

    /// [`check`](Self::check) for a context whose output directory is not
    /// created yet.
    pub fn preflight(&self, ctx: &RunContext) -> Result<(), RunError> {
        ctx.validate_settings()?;
        self.ensure_model(ctx)
    }

    fn ensure_model(&self, ctx: &RunContext) -> Result<(), RunError> {
        if !self.hub.contains(&ctx.model) {
            return Err(RunError::Fatal(crate::llm::LlmError::UnknownModel(
                ctx.model.clone(),
            )));
        }
        Ok(())
    }

    async fn run_with(
        &self,
        mut ctx: RunContext,
        cancel: &CancelToken,
        recorded: Option<Vec<ToolCallRecord>>,
    ) -> Result<DocumentationArtifact, RunFailure> {
        if let Err(error) = self.check(&ctx) {
            ctx.set_state(AgentState::Failed);
            return Err(RunFailure {
                error,
                artifact: empty_artifact(&ctx),
            });
        }

        let ledger = match self.open_ledger(&ctx).await {
            Ok(ledger) => ledger,
            Err(error) => {
                ctx.set_state(AgentState::Failed);
                return Err(RunFailure {
                    error,
                    artifact: empty_artifact(&ctx),
                });
            }
        };

        info!(
            task_id = %ctx.task_id,
            model = %ctx.model,
            snapshot = %ctx.snapshot.root().display(),
            max_steps = ctx.max_steps,
            "documentation run started"
        );

        let registry = ToolRegistry::new(ctx.snapshot.clone(), self.settings.limits.clone());
        let mut tools = registry.definitions();
        tools.push(final_answer_definition());
        let source = match recorded {
            Some(records) => ToolSource::Recorded(RecordedTools::new(registry, records)),
            None => ToolSource::Live(registry),
        };

        let mut run = Run {
            agent: self,
            source,
            tools,
            conversation: Conversation::new(),
            sections: DocumentSections::new(
                self.settings.max_sections,
                self.settings.max_section_bytes,
            ),
            ledger,
            cancel,
            pending_call: None,
            observation: Vec::new(),
            observation_ok: true,
            final_answer: None,
            summary: None,
            consecutive_failures: 0,
        };

        let outcome = run.drive(&mut ctx).await;
        run.finish(ctx, outcome).await
    }

    async fn open_ledger(&self, ctx: &RunContext) -> Result<Ledger, RunError> {
        RunMeta::from_context(ctx).write(&ctx.output_dir).await?;
        Ok(Ledger::create(
            &ctx.output_dir,
            self.hub.rate_table(),
            self.settings.result_summary_chars,
        )
        .await?)
    }
}

/// Where tool results come from.
enum ToolSource {
    Live(ToolRegistry),
    Recorded(RecordedTools),
}

impl ToolSource {
    async fn dispatch(
        &mut self,
        call: &ToolCall,
        sections: &mut DocumentSections,
    ) -> Result<String, ToolError> {
        match self {
            Self::Live(registry) => registry.dispatch(call, sections).await,
            Self::Recorded(recorded) => recorded.dispatch(call, sections).await,
        }
    }
}

/// Mutable state of one run, alive between validation and the terminal state.
struct Run<'a> {
    agent: &'a DocAgent,
    source: ToolSource,
    tools: Vec<ToolDefinition>,
    conversation: Conversation,
    sections: DocumentSections,
    ledger: Ledger,
    cancel: &'a CancelToken,
    /// Tool call chosen in Planning, executed in ToolDispatch.
    pending_call: Option<ToolCall>,
    /// Messages appended to the conversation in Observing.
    observation: Vec<ChatMessage>,
    observation_ok: bool,
    final_answer: Option<FinalAnswer>,
    summary: Option<String>,
    consecutive_failures: u32,
}

impl Run<'_> {
    async fn drive(&mut self, ctx: &mut RunContext) -> Result<(), RunError> {
        loop {
            let next = match ctx.state() {
                AgentState::Init => self.init(ctx),
                AgentState::Planning => self.plan(ctx).await,
                AgentState::ToolDispatch => self.dispatch(ctx).await,
                AgentState::Observing => self.observe(ctx).await,
                AgentState::Completing => self.complete(ctx).await,
                AgentState::Done | AgentState::Failed => return Ok(()),
            };
            let next = match next {
                Ok(next) => next,
                Err(err) => {
                    ctx.set_state(AgentState::Failed);
                    return Err(err);
                }
            };
            debug_assert!(
                ctx.state().can_transition_to(next),
                "illegal transition {} -> {}",
                ctx.state(),
                next
            );
            debug!(task_id = %ctx.task_id, from = %ctx.state(), to = %next, "state transition");
            ctx.set_state(next);
        }
    }

    fn init(&mut self, ctx: &RunContext) -> Result<AgentState, RunError> {
        for message in prompt::opening_messages(&ctx.snapshot, &self.agent.settings.limits) {
            self.conversation.push(message);
        }
        Ok(AgentState::Planning)
    }

    async fn plan(&mut self, ctx: &mut RunContext) -> Result<AgentState, RunError> {
        if self.cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        if ctx.step() >= ctx.max_steps {
            return Err(RunError::Capacity(CapacityKind::StepLimit {
                max: ctx.max_steps,
            }));
        }

        let reply = match self.request_reply(ctx).await {
            Ok(reply) => reply,
            // A rejected call is a failed step; the conversation is unchanged.
            Err(RunError::Provider(err)) if !err.is_retryable() => {
                warn!(
                    task_id = %ctx.task_id,
                    step = ctx.step(),
                    kind = err.kind(),
                    error = %err,
                    "model call failed"
                );
                self.set_observation(Vec::new(), false);
                return Ok(AgentState::Observing);
            }
            Err(err) => return Err(err),
        };
        ctx.advance_step();
        self.ledger.record_model(ctx.step(), &reply).await?;
        debug!(
            task_id = %ctx.task_id,
            step = ctx.step(),
            tool_calls = reply.tool_calls.len(),
            final_answer = reply.final_answer.is_some(),
            prompt_tokens = reply.usage.prompt_tokens,
            completion_tokens = reply.usage.completion_tokens,
            "model replied"
        );

        let ModelReply {
            content,
            mut tool_calls,
            final_answer,
            ..
        } = reply;

        match (final_answer, tool_calls.len()) {
            (Some(answer), 0) => {
                if let Some(text) = content {
                    self.conversation.push(ChatMessage::assistant(text));
                }
                self.final_answer = Some(answer);
                Ok(AgentState::Completing)
            }
            (None, 1) => {
                let call = tool_calls.remove(0);
                self.conversation.push(ChatMessage::assistant_tool_calls(
                    content,
                    vec![call.clone()],
                ));
                self.pending_call = Some(call);
                Ok(AgentState::ToolDispatch)
            }
            (_, 0) => {
                warn!(task_id = %ctx.task_id, step = ctx.step(), "reply had no tool call");
                if let Some(text) = content {
                    self.conversation.push(ChatMessage::assistant(text));
                }
                self.set_observation(vec![ChatMessage::user(NO_ACTION_OBSERVATION)], false);
                Ok(AgentState::Observing)
            }
            (_, count) => {
                warn!(
                    task_id = %ctx.task_id,
                    step = ctx.step(),
                    count,
                    "reply had more than one action"
                );
                let results = tool_calls
                    .iter()
                    .map(|c| ChatMessage::tool_result(&c.id, MULTIPLE_CALLS_OBSERVATION))
                    .collect();
                self.conversation
                    .push(ChatMessage::assistant_tool_calls(content, tool_calls));
                self.set_observation(results, false);
                Ok(AgentState::Observing)
            }
        }
    }

    /// Ask the hub for the next turn, retrying transient failures, and give
    /// up as soon as the run is cancelled.
    async fn request_reply(&self, ctx: &RunContext) -> Result<ModelReply, RunError> {
        let hub = self.agent.hub.as_ref();
        let model = ctx.model.as_str();
        let messages = self.conversation.messages();
        let tools = self.tools.as_slice();
        let policy = &self.agent.settings.retry;

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RunError::Cancelled),
            reply = with_retry(policy, "complete", move || hub.complete(model, messages, tools)) => {
                reply.map_err(RunError::from_llm)
            }
        }
    }

    async fn dispatch(&mut self, ctx: &RunContext) -> Result<AgentState, RunError> {
        if self.cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        let Some(call) = self.pending_call.take() else {
            return Err(RunError::Validation(
                "tool dispatch without a pending call".to_string(),
            ));
        };

        let outcome = self.source.dispatch(&call, &mut self.sections).await;
        // The record must be durable before the result can influence the
        // next decision.
        self.ledger.record_tool(&call, &outcome).await?;

        let (text, ok) = match outcome {
            Ok(text) => {
                debug!(task_id = %ctx.task_id, tool = %call.name, "tool call succeeded");
                (text, true)
            }
            Err(err) if err.is_capacity() => {
                warn!(task_id = %ctx.task_id, tool = %call.name, error = %err, "section capacity exceeded");
                return Err(RunError::Capacity(CapacityKind::Sections(err)));
            }
            Err(err) => {
                warn!(
                    task_id = %ctx.task_id,
                    tool = %call.name,
                    kind = err.kind(),
                    error = %err,
                    "tool call failed"
                );
                (err.observation(), !err.counts_as_failure())
            }
        };
        self.set_observation(vec![ChatMessage::tool_result(&call.id, text)], ok);
        Ok(AgentState::Observing)
    }

    async fn observe(&mut self, ctx: &RunContext) -> Result<AgentState, RunError> {
        for message in std::mem::take(&mut self.observation) {
            self.conversation.push(message);
        }
        self.snapshot_conversation(ctx).await?;

        if self.observation_ok {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
            if self.consecutive_failures >= ctx.max_consecutive_failures {
                return Err(RunError::TooManyFailures {
                    count: self.consecutive_failures,
                });
            }
        }
        Ok(AgentState::Planning)
    }

    async fn complete(&mut self, ctx: &RunContext) -> Result<AgentState, RunError> {
        let answer = self.final_answer.take().unwrap_or_default();
        for draft in answer.sections {
            match self.sections.write(&draft.title, &draft.content) {
                Ok(_) => {}
                Err(err) if err.is_capacity() => {
                    return Err(RunError::Capacity(CapacityKind::Sections(err)));
                }
                Err(err) => {
                    warn!(task_id = %ctx.task_id, error = %err, "final answer section skipped");
                }
            }
        }
        self.summary = answer.summary;
        self.snapshot_conversation(ctx).await?;
        Ok(AgentState::Done)
    }

    fn set_observation(&mut self, messages: Vec<ChatMessage>, ok: bool) {
        self.observation = messages;
        self.observation_ok = ok;
    }

    async fn snapshot_conversation(&self, ctx: &RunContext) -> Result<(), RunError> {
        if !self.agent.settings.conversation_snapshots {
            return Ok(());
        }
        let path = ctx
            .output_dir
            .join(format!("conversation_round_{}.json", ctx.step()));
        let json = serde_json::to_vec_pretty(self.conversation.messages())
            .map_err(|e| RunError::Io(std::io::Error::other(e)))?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Flush the artifact and cost report, whatever the outcome.
    async fn finish(
        mut self,
        ctx: RunContext,
        outcome: Result<(), RunError>,
    ) -> Result<DocumentationArtifact, RunFailure> {
        let artifact = DocumentationArtifact {
            task_id: ctx.task_id.clone(),
            model: ctx.model.clone(),
            sections: self.sections.into_vec(),
            complete: outcome.is_ok(),
            summary: self.summary.take(),
            steps: ctx.step(),
            totals: self.ledger.totals(),
            run_dir: ctx.output_dir.clone(),
        };

        let flushed = match artifact.persist().await {
            Ok(_) => self.ledger.finish().await.map(|_| ()).map_err(RunError::from),
            Err(err) => Err(RunError::from(err)),
        };

        let outcome = match (outcome, flushed) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(flush_err)) => {
                warn!(task_id = %ctx.task_id, error = %flush_err, "could not flush partial artifact");
                Err(err)
            }
        };

        match outcome {
            Ok(()) => {
                info!(
                    task_id = %ctx.task_id,
                    steps = artifact.steps,
                    sections = artifact.sections.len(),
                    cost = artifact.totals.cost,
                    "documentation run finished"
                );
                Ok(artifact)
            }
            Err(error) => {
                warn!(
                    task_id = %ctx.task_id,
                    state = %ctx.state(),
                    steps = artifact.steps,
                    sections = artifact.sections.len(),
                    error = %error,
                    "documentation run failed"
                );
                Err(RunFailure { error, artifact })
            }
        }
    }
}

fn empty_artifact(ctx: &RunContext) -> DocumentationArtifact {
    DocumentationArtifact {
        task_id: ctx.task_id.clone(),
        model: ctx.model.clone(),
        sections: Vec::new(),
        complete: false,
        summary: None,
        steps: 0,
        totals: Default::default(),
        run_dir: ctx.output_dir.clone(),
    }
}
