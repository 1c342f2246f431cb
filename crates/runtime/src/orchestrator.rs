//! Agent orchestrator: drives one conversational turn.
//!
//! A turn moves through `Init -> ContextReady -> (Streaming <-> ToolExecuting)*
//! -> Finalizing -> Done | Failed`. History is owned by the turn while it runs
//! and is appended to the conversation store only when the turn finishes.
//! Masking only ever changes the view sent to the provider, never the history.

use crate::classifier::{ClassifiedResponse, ResponseClassifier};
use crate::context::AgentContext;
use crate::error::RuntimeError;
use crate::events::{ActivityEvent, ActivityStatus, EventSink};
use crate::evidence::extract_evidence;
use crate::metrics::{self, MetricTimer, LLM_STREAM_LATENCY, TOOL_EXECUTION_LATENCY};
use crate::prompt::build_system_prompt;
use aiops_core::{
    AgentMode, CancellationToken, ClassifiedError, FixTargetScope, Message, Part, ToolCall,
    ToolErrorCode, ToolResult,
};
use aiops_memory::mask_observations;
use aiops_policy::{AuthorizationDecision, FixTargetAuthorizer};
use aiops_providers::{CompletionRequest, FinishReason, ProviderError, StreamEvent, Usage};
use aiops_tools::ToolRegistry;
use futures::future::join_all;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

/// Input of one turn.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub session_id: String,
    pub user_message: String,
    pub mode: AgentMode,
    pub fix_scope: Option<FixTargetScope>,
    /// Dangerous tools the user confirmed for this turn.
    pub confirmed_tools: Vec<String>,
}

impl TurnRequest {
    pub fn new(session_id: impl Into<String>, user_message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_message: user_message.into(),
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: AgentMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_fix_scope(mut self, scope: FixTargetScope) -> Self {
        self.fix_scope = Some(scope);
        self
    }

    pub fn with_confirmed_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.confirmed_tools = tools.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model answered without requesting more tools.
    Answer,
    /// The model produced a structured JSON payload.
    Structured,
    /// The tool-call or iteration budget ran out; the response is partial.
    BudgetExhausted,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Answer => "answer",
            StopReason::Structured => "structured",
            StopReason::BudgetExhausted => "budget_exhausted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub response: String,
    pub is_json: bool,
    pub preamble: Option<String>,
    /// Parsed structured payload, when the response is valid JSON.
    pub payload: Option<Value>,
    pub stop_reason: StopReason,
    pub tool_calls_executed: usize,
    pub masked_rounds: usize,
    pub usage: Usage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnPhase {
    Init,
    ContextReady,
    Streaming,
    ToolExecuting,
    Finalizing,
}

/// Output of one provider stream.
struct Segment {
    text: String,
    calls: Vec<ToolCall>,
    classified: ClassifiedResponse,
    finish: Option<FinishReason>,
    usage: Option<Usage>,
}

/// Mutable bookkeeping of a running turn.
struct TurnState<'r> {
    request: &'r TurnRequest,
    phase: TurnPhase,
    history: Vec<Message>,
    executed: usize,
    masked_rounds: usize,
    usage: Usage,
    transcript: String,
}

impl TurnState<'_> {
    fn enter(&mut self, phase: TurnPhase) {
        debug!(
            session_id = %self.request.session_id,
            from = ?self.phase,
            to = ?phase,
            "Turn state transition"
        );
        self.phase = phase;
    }
}

fn check_cancel(cancel: &CancellationToken) -> Result<(), RuntimeError> {
    if cancel.is_cancelled() {
        Err(RuntimeError::Cancelled)
    } else {
        Ok(())
    }
}

/// Runs turns against one session's tool set.
pub struct Orchestrator<'a> {
    context: &'a AgentContext,
    registry: &'a ToolRegistry,
}

impl<'a> Orchestrator<'a> {
    pub fn new(context: &'a AgentContext, registry: &'a ToolRegistry) -> Self {
        Self { context, registry }
    }

    /// Run one turn to completion. Provider and store failures end the turn
    /// with a single `on_error`; cancellation ends it silently. Either way the
    /// conversation store is left untouched.
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        sink: &dyn EventSink,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, ClassifiedError> {
        info!(
            session_id = %request.session_id,
            mode = ?request.mode,
            "Turn started"
        );

        match self.run_inner(&request, sink, &cancel).await {
            Ok(outcome) => {
                metrics::increment_turns(outcome.stop_reason.as_str());
                info!(
                    session_id = %request.session_id,
                    stop_reason = outcome.stop_reason.as_str(),
                    tool_calls = outcome.tool_calls_executed,
                    "Turn complete"
                );
                if !cancel.is_cancelled() {
                    sink.on_turn_complete(&outcome).await;
                }
                Ok(outcome)
            }
            Err(e) if matches!(e, RuntimeError::Cancelled) || cancel.is_cancelled() => {
                metrics::increment_turns("cancelled");
                info!(session_id = %request.session_id, "Turn cancelled");
                Err(RuntimeError::Cancelled.classify())
            }
            Err(e) => {
                let classified = e.classify();
                metrics::increment_turns("failed");
                error!(
                    session_id = %request.session_id,
                    code = %classified.code,
                    "Turn failed: {}",
                    classified.message
                );
                sink.on_error(&classified).await;
                Err(classified)
            }
        }
    }

    async fn run_inner(
        &self,
        request: &TurnRequest,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, RuntimeError> {
        if self.registry.mode() != request.mode {
            return Err(RuntimeError::ModeMismatch {
                registry: self.registry.mode(),
                requested: request.mode,
            });
        }
        let config = self.context.config();
        let mut state = TurnState {
            request,
            phase: TurnPhase::Init,
            history: self.context.store().load(&request.session_id).await?,
            executed: 0,
            masked_rounds: 0,
            usage: Usage::default(),
            transcript: String::new(),
        };
        check_cancel(cancel)?;

        let persisted = state.history.len();
        state.history.push(Message::user_text(request.user_message.as_str()));
        let tools = self.registry.schemas();
        let system = build_system_prompt(request.mode, request.fix_scope.as_ref(), &tools);
        let authorizer = FixTargetAuthorizer::new(request.mode, request.fix_scope.clone())
            .with_confirmed(request.confirmed_tools.iter().cloned());
        state.enter(TurnPhase::ContextReady);

        let mut finished: Option<(StopReason, Option<ClassifiedResponse>)> = None;
        for round in 0..config.turn.max_iterations {
            state.enter(TurnPhase::Streaming);
            let messages = self.provider_view(&mut state, sink, cancel, round).await;
            let segment = self
                .stream_segment(
                    CompletionRequest {
                        system: Some(system.clone()),
                        messages,
                        tools: tools.clone(),
                    },
                    sink,
                    cancel,
                )
                .await?;
            let Segment {
                text,
                mut calls,
                classified,
                finish,
                usage,
            } = segment;

            if let Some(usage) = usage {
                state.usage.input_tokens += usage.input_tokens;
                state.usage.output_tokens += usage.output_tokens;
            }
            self.debug(
                sink,
                cancel,
                "segment_finished",
                json!({
                    "round": round,
                    "finish_reason": finish,
                    "tool_calls": calls.len(),
                    "is_json": classified.is_json,
                }),
            )
            .await;

            if classified.is_json && !calls.is_empty() {
                warn!(
                    session_id = %request.session_id,
                    "Structured reply also requested {} tool calls; ignoring them",
                    calls.len()
                );
                calls.clear();
            }
            if !text.trim().is_empty() {
                if !state.transcript.is_empty() {
                    state.transcript.push_str("\n\n");
                }
                state.transcript.push_str(text.trim());
            }
            let assistant = Message::assistant(Some(text), &calls);
            if !assistant.parts.is_empty() {
                state.history.push(assistant);
            }

            if calls.is_empty() {
                let reason = if classified.is_json {
                    StopReason::Structured
                } else {
                    StopReason::Answer
                };
                finished = Some((reason, Some(classified)));
                break;
            }

            state.enter(TurnPhase::ToolExecuting);
            let (results, exhausted) = self
                .execute_batch(&calls, &authorizer, &mut state, sink, cancel)
                .await?;
            state.history.push(Message::tool_results(results));
            if exhausted {
                finished = Some((StopReason::BudgetExhausted, None));
                break;
            }
        }

        state.enter(TurnPhase::Finalizing);
        let (stop_reason, classified) = match finished {
            Some(finished) => finished,
            None => {
                warn!(
                    session_id = %request.session_id,
                    "Iteration limit of {} reached",
                    config.turn.max_iterations
                );
                (StopReason::BudgetExhausted, None)
            }
        };
        let (response, is_json, preamble) = match classified {
            Some(classified) => (classified.response, classified.is_json, classified.preamble),
            None if state.transcript.is_empty() => (
                "The tool-call budget for this turn ran out before a final answer was reached."
                    .to_string(),
                false,
                None,
            ),
            None => (state.transcript.clone(), false, None),
        };
        let payload = if is_json {
            serde_json::from_str::<Value>(&response).ok()
        } else {
            None
        };

        check_cancel(cancel)?;
        self.context
            .store()
            .append(&request.session_id, &state.history[persisted..])
            .await?;

        Ok(TurnOutcome {
            response,
            is_json,
            preamble,
            payload,
            stop_reason,
            tool_calls_executed: state.executed,
            masked_rounds: state.masked_rounds,
            usage: state.usage,
        })
    }

    /// History as the provider sees it this round, masked when over budget.
    async fn provider_view(
        &self,
        state: &mut TurnState<'_>,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
        round: usize,
    ) -> Vec<Message> {
        let outcome = mask_observations(&state.history, &self.context.config().masking);
        let stats = outcome.stats;
        let masked = outcome.masked;
        let messages = outcome.messages.into_owned();

        self.debug(
            sink,
            cancel,
            "round_started",
            json!({ "round": round, "messages": messages.len() }),
        )
        .await;
        if masked {
            state.masked_rounds += 1;
            metrics::increment_masking_count();
            info!(
                session_id = %state.request.session_id,
                masked_parts = stats.masked_parts,
                saved_tokens = stats.saved_tokens,
                "Observations masked"
            );
            self.debug(sink, cancel, "observations_masked", json!(stats))
                .await;
        }
        messages
    }

    async fn stream_segment(
        &self,
        request: CompletionRequest,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<Segment, RuntimeError> {
        let _timer = MetricTimer::new(LLM_STREAM_LATENCY);
        let provider = self.context.provider();
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
            opened = provider.stream_completion(request, cancel.clone()) => opened?,
        };

        let mut classifier = ResponseClassifier::new();
        let mut text = String::new();
        let mut calls = Vec::new();
        let mut finish = None;
        let mut usage = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                next = stream.next() => next,
            };
            match next {
                None => break,
                Some(Ok(StreamEvent::TextDelta(delta))) => {
                    text.push_str(&delta);
                    if let Some(prose) = classifier.feed(&delta) {
                        sink.on_text_chunk(&prose).await;
                    }
                }
                Some(Ok(StreamEvent::ToolCalls(batch))) => calls.extend(batch),
                Some(Ok(StreamEvent::Finished {
                    reason,
                    usage: reported,
                })) => {
                    finish = Some(reason);
                    usage = reported;
                }
                Some(Err(ProviderError::Cancelled)) => return Err(RuntimeError::Cancelled),
                Some(Err(e)) => return Err(e.into()),
            }
        }

        let (flushed, classified) = classifier.finish();
        if let Some(prose) = flushed {
            check_cancel(cancel)?;
            sink.on_text_chunk(&prose).await;
        }
        debug!(
            "Provider segment finished: reason={:?}, tool_calls={}",
            finish,
            calls.len()
        );
        Ok(Segment {
            text,
            calls,
            classified,
            finish,
            usage,
        })
    }

    /// Execute one batch concurrently. Calls beyond the turn's budget are not
    /// run but still get a result so every call stays paired.
    async fn execute_batch(
        &self,
        calls: &[ToolCall],
        authorizer: &FixTargetAuthorizer,
        state: &mut TurnState<'_>,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Part>, bool), RuntimeError> {
        let limit = self.context.config().turn.max_tool_calls;
        let budget = limit.saturating_sub(state.executed);
        let (run, over) = calls.split_at(calls.len().min(budget));

        for call in calls {
            check_cancel(cancel)?;
            sink.on_tool_call(call).await;
        }
        // Every announced call gets Pending, including those the budget skips.
        for call in calls {
            sink.on_activity(&ActivityEvent {
                call_id: call.id.clone(),
                tool: call.name.clone(),
                status: ActivityStatus::Pending,
                summary: None,
            })
            .await;
        }

        info!(
            session_id = %state.request.session_id,
            batch = calls.len(),
            executing = run.len(),
            "Executing tool batch"
        );
        let results = join_all(
            run.iter()
                .map(|call| self.execute_one(call, authorizer, sink, cancel)),
        )
        .await;
        check_cancel(cancel)?;
        state.executed += run.len();

        let mut parts: Vec<Part> = run
            .iter()
            .zip(results)
            .map(|(call, result)| Part::tool_result(call, result))
            .collect();
        for call in over {
            let result = ToolResult::failure(
                ToolErrorCode::BudgetExceeded,
                format!(
                    "Tool call budget of {limit} per turn exhausted; {} was not executed",
                    call.name
                ),
                false,
            );
            metrics::increment_tool_calls(&call.name, "budget_exceeded");
            self.report(call, &result, sink, cancel).await;
            parts.push(Part::tool_result(call, result));
        }
        if !over.is_empty() {
            warn!(
                session_id = %state.request.session_id,
                "Tool call budget exhausted; {} calls skipped",
                over.len()
            );
        }
        Ok((parts, !over.is_empty()))
    }

    async fn execute_one(
        &self,
        call: &ToolCall,
        authorizer: &FixTargetAuthorizer,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> ToolResult {
        let _timer = MetricTimer::new(TOOL_EXECUTION_LATENCY);
        let denial = self
            .registry
            .get(&call.name)
            .map(|tool| authorizer.authorize(&call.name, tool.safety_level(), &call.args))
            .and_then(AuthorizationDecision::into_denial);

        let result = match denial {
            Some(denial) => {
                warn!(tool = %call.name, "Tool call denied by fix-target policy");
                metrics::increment_authorization_denials();
                denial
            }
            None => {
                debug!(tool = %call.name, call_id = %call.id, "Dispatching tool");
                self.registry
                    .execute(&call.name, call.args.clone(), cancel)
                    .await
            }
        };

        let outcome = match result.error_code() {
            None => "success",
            Some(ToolErrorCode::Cancelled) => "cancelled",
            Some(ToolErrorCode::AuthorizationDenied) => "denied",
            Some(_) => "failed",
        };
        metrics::increment_tool_calls(&call.name, outcome);
        self.report(call, &result, sink, cancel).await;
        result
    }

    /// Post-completion events for one call. Suppressed once cancelled.
    async fn report(
        &self,
        call: &ToolCall,
        result: &ToolResult,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) {
        if cancel.is_cancelled() {
            return;
        }
        sink.on_tool_result(call, result).await;
        sink.on_activity(&ActivityEvent {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            status: if result.success {
                ActivityStatus::Completed
            } else {
                ActivityStatus::Failed
            },
            summary: result.error.as_ref().map(|e| e.message.clone()),
        })
        .await;
        for evidence in extract_evidence(&call.name, &call.args, result) {
            sink.on_evidence(&call.id, &evidence).await;
        }
    }

    async fn debug(
        &self,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
        label: &str,
        detail: Value,
    ) {
        if self.context.config().turn.verbose && !cancel.is_cancelled() {
            sink.on_debug(label, &detail).await;
        }
    }
}
