//! The orchestration loop.
//!
//! [`Core`] drives one `chat` invocation: it asks the backend for a turn,
//! executes any requested tools through the registry, appends the results and
//! asks again, until the model answers without tools or a budget runs out.
//!
//! ```text
//! Init -> AwaitingModel -> (ExecutingTools <-> AwaitingModel)* -> StreamingContent -> Done
//!                                    any state -> Error
//! ```

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use log::{debug, error, info, warn};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use llmserve_client::{ChatStream, LLMClient};
use llmserve_common::{
    ChatRequest, ChatResponse, Conversation, Message, StreamChunk, ToolCall, ToolChoice,
    ToolResult,
};
use llmserve_tools::{DEFAULT_TOOL_TIMEOUT, Sandbox, ToolRegistry};

use crate::classifier::{StreamClassifier, ThinkSplitter, Turn, fresh_call_id};
use crate::error::CoreError;

/// A lazy stream of classified chunks for one `chat` invocation.
///
/// Ends with [`StreamChunk::Done`] on success, or right after the first error.
pub type ChunkStream<'a> = Pin<Box<dyn Stream<Item = Result<StreamChunk, CoreError>> + Send + 'a>>;

/// Budgets for one orchestration run.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Tool-resolution rounds allowed before the run fails.
    pub max_rounds: usize,
    /// Time budget per tool call, unless the tool sets its own.
    pub tool_timeout: Duration,
    /// Tool calls of one turn that may run at the same time.
    pub max_concurrent_tools: usize,
    /// Extra attempts for a backend call that failed transiently.
    pub max_backend_retries: usize,
    /// Wall-clock limit for the whole run.
    pub deadline: Option<Duration>,
    pub tool_choice: ToolChoice,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            max_concurrent_tools: 4,
            max_backend_retries: 2,
            deadline: None,
            tool_choice: ToolChoice::Auto,
        }
    }
}

impl CoreConfig {
    #[must_use]
    pub const fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    #[must_use]
    pub const fn with_tool_timeout(mut self, tool_timeout: Duration) -> Self {
        self.tool_timeout = tool_timeout;
        self
    }

    #[must_use]
    pub const fn with_max_concurrent_tools(mut self, max_concurrent_tools: usize) -> Self {
        self.max_concurrent_tools = max_concurrent_tools;
        self
    }

    #[must_use]
    pub const fn with_max_backend_retries(mut self, max_backend_retries: usize) -> Self {
        self.max_backend_retries = max_backend_retries;
        self
    }

    #[must_use]
    pub const fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_tool_choice(mut self, tool_choice: ToolChoice) -> Self {
        self.tool_choice = tool_choice;
        self
    }
}

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Init,
    AwaitingModel,
    ExecutingTools,
    StreamingContent,
    Done,
    Error,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Init => "INIT",
            Self::AwaitingModel => "AWAITING_MODEL",
            Self::ExecutingTools => "EXECUTING_TOOLS",
            Self::StreamingContent => "STREAMING_CONTENT",
            Self::Done => "DONE",
            Self::Error => "ERROR",
        };
        f.write_str(label)
    }
}

impl LoopState {
    fn advance(&mut self, next: Self) {
        debug!("{self} -> {next}");
        *self = next;
    }
}

/// Races a suspension point against cancellation and the run deadline.
#[derive(Debug, Clone)]
struct Guard {
    cancel: CancellationToken,
    deadline: Option<(Instant, Duration)>,
}

impl Guard {
    fn new(cancel: CancellationToken, deadline: Option<Duration>) -> Self {
        Self {
            cancel,
            deadline: deadline.map(|budget| (Instant::now() + budget, budget)),
        }
    }

    async fn run<F: Future>(&self, fut: F) -> Result<F::Output, CoreError> {
        let expired = async {
            match self.deadline {
                Some((at, budget)) => {
                    tokio::time::sleep_until(at).await;
                    budget
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(CoreError::Cancelled),
            budget = expired => Err(CoreError::DeadlineExceeded(budget)),
            output = fut => Ok(output),
        }
    }
}

/// Runs the tool-calling loop against one backend and one registry.
pub struct Core<C: LLMClient> {
    pub client: C,
    pub registry: Arc<ToolRegistry>,
    pub config: CoreConfig,
}

impl<C: LLMClient> fmt::Debug for Core<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("model", &self.client.config().model)
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

impl<C: LLMClient> Core<C> {
    pub fn new(client: C, registry: Arc<ToolRegistry>) -> Self {
        Self {
            client,
            registry,
            config: CoreConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    fn request(&self, conversation: &Conversation, use_tools: bool, stream: bool) -> ChatRequest {
        let mut request = self
            .client
            .config()
            .chat_request(conversation.get_messages().to_vec())
            .with_streaming(stream);

        if use_tools {
            let tools = self.registry.list_definitions();
            if !tools.is_empty() {
                request = request
                    .with_tools(tools)
                    .with_tool_choice(self.config.tool_choice.clone());
            }
        }
        request
    }

    fn sandbox(&self, guard: &Guard) -> Sandbox {
        Sandbox::new(self.config.tool_timeout).with_cancellation(guard.cancel.clone())
    }

    /// Calls the backend, retrying errors that may be transient.
    async fn with_retry<T, F, Fut>(&self, guard: &Guard, mut call: F) -> Result<T, CoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let delay = self.client.config().retry_config.initial_delay;
        let mut attempt = 0;

        loop {
            match guard.run(call()).await? {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let err = CoreError::from_backend(err);
                    if attempt < self.config.max_backend_retries && err.is_retryable() {
                        attempt += 1;
                        warn!(
                            "Backend call failed (attempt {attempt}), retrying in {delay:?}: {err}"
                        );
                        guard.run(tokio::time::sleep(delay)).await?;
                        continue;
                    }
                    error!("Backend call failed: {err}");
                    return Err(err);
                }
            }
        }
    }

    fn check_round_limit(
        &self,
        rounds: usize,
        conversation: &Conversation,
        message: &Message,
    ) -> Result<(), CoreError> {
        if rounds < self.config.max_rounds {
            return Ok(());
        }
        warn!(
            "Model still requests tools after {rounds} rounds: {:?}",
            message
                .tool_calls
                .iter()
                .map(|call| call.function.name.as_str())
                .collect::<Vec<_>>()
        );
        let mut snapshot = conversation.clone();
        snapshot.add_message(message.clone())?;
        Err(CoreError::OrchestrationLimit {
            rounds,
            conversation: Box::new(snapshot),
        })
    }

    /// Executes every call of `message`, then appends the message and its
    /// results.
    ///
    /// Nothing is appended if the round is interrupted, so the conversation
    /// never holds unanswered calls.
    async fn execute_tools(
        &self,
        conversation: &mut Conversation,
        message: Message,
        guard: &Guard,
    ) -> Result<Vec<ToolResult>, CoreError> {
        let sandbox = self.sandbox(guard);
        let results = guard
            .run(self.registry.invoke_all(
                &message.tool_calls[..],
                &sandbox,
                self.config.max_concurrent_tools,
            ))
            .await?;

        conversation.add_message(message)?;
        for result in &results {
            conversation.add_tool_result(result)?;
        }
        Ok(results)
    }

    /// Runs the loop until the model answers, and returns that answer.
    ///
    /// The final assistant message is appended to `conversation` as well.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::BackendUnavailable`] or
    /// [`CoreError::BackendProtocol`] for backend failures,
    /// [`CoreError::OrchestrationLimit`] when the round budget is spent, and
    /// [`CoreError::Cancelled`] or [`CoreError::DeadlineExceeded`] when the
    /// run is interrupted.
    pub async fn run(
        &self,
        conversation: &mut Conversation,
        use_tools: bool,
        cancel: &CancellationToken,
    ) -> Result<Message, CoreError> {
        let guard = Guard::new(cancel.clone(), self.config.deadline);
        let mut state = LoopState::Init;

        let outcome = self.drive(conversation, use_tools, &guard, &mut state).await;
        if let Err(err) = &outcome {
            state.advance(LoopState::Error);
            debug!("Run failed ({}): {err}", err.kind());
        }
        outcome
    }

    async fn drive(
        &self,
        conversation: &mut Conversation,
        use_tools: bool,
        guard: &Guard,
        state: &mut LoopState,
    ) -> Result<Message, CoreError> {
        let mut rounds = 0;

        loop {
            state.advance(LoopState::AwaitingModel);
            info!(
                "Requesting model turn (round {}/{})",
                rounds + 1,
                self.config.max_rounds
            );

            let request = self.request(conversation, use_tools, false);
            let response = {
                let request = &request;
                let client = &self.client;
                self.with_retry(guard, move || client.chat(request)).await?
            };
            let message = reply_message(conversation, response, use_tools)?;

            if !message.requests_tools() {
                state.advance(LoopState::StreamingContent);
                conversation.add_message(message.clone())?;
                state.advance(LoopState::Done);
                return Ok(message);
            }

            self.check_round_limit(rounds, conversation, &message)?;
            state.advance(LoopState::ExecutingTools);
            info!("Executing {} tool call(s)", message.tool_calls.len());
            self.execute_tools(conversation, message, guard).await?;
            rounds += 1;
        }
    }

    /// Runs the loop and streams classified chunks as they are produced.
    ///
    /// The stream is lazy: nothing happens until it is polled, and dropping it
    /// stops the run, aborting in-flight tools. The deadline is measured from
    /// this call.
    pub fn run_stream<'a>(
        &'a self,
        conversation: &'a mut Conversation,
        use_tools: bool,
        cancel: CancellationToken,
    ) -> ChunkStream<'a> {
        let run = StreamRun {
            core: self,
            conversation,
            use_tools,
            guard: Guard::new(cancel, self.config.deadline),
            state: LoopState::Init,
            rounds: 0,
            phase: Phase::Request,
            queue: VecDeque::new(),
        };

        Box::pin(futures::stream::unfold(Some(run), |run| async move {
            let mut run = run?;
            match run.next_chunk().await? {
                Ok(chunk) => Some((Ok(chunk), Some(run))),
                Err(err) => {
                    run.state.advance(LoopState::Error);
                    Some((Err(err), None))
                }
            }
        }))
    }
}

/// Builds the assistant message for a complete backend reply.
fn reply_message(
    conversation: &Conversation,
    response: ChatResponse,
    use_tools: bool,
) -> Result<Message, CoreError> {
    let reply = response.message;
    let (inline_reasoning, content) = ThinkSplitter::split(&reply.content);
    let reasoning = match reply.reasoning {
        Some(reasoning) if !inline_reasoning.is_empty() => format!("{reasoning}\n{inline_reasoning}"),
        Some(reasoning) => reasoning,
        None => inline_reasoning,
    };

    let tool_calls = if use_tools {
        unique_ids(reply.tool_calls.into_vec())?
    } else {
        if !reply.tool_calls.is_empty() {
            debug!("Ignoring {} tool call(s) in a turn without tools", reply.tool_calls.len());
        }
        Vec::new()
    };

    assistant_message(conversation, content, reasoning, tool_calls)
}

fn assistant_message(
    conversation: &Conversation,
    content: String,
    reasoning: String,
    tool_calls: Vec<ToolCall>,
) -> Result<Message, CoreError> {
    let message = conversation
        .assistant_message(content)
        .with_reasoning(reasoning);
    if tool_calls.is_empty() {
        return Ok(message);
    }
    message.with_tool_calls(tool_calls).map_err(CoreError::Other)
}

/// Gives every call an id unique within its message.
fn unique_ids(calls: Vec<ToolCall>) -> Result<Vec<ToolCall>, CoreError> {
    let mut seen = HashSet::new();
    calls
        .into_iter()
        .map(|mut call| {
            if call.function.name.is_empty() {
                return Err(CoreError::BackendProtocol(anyhow::anyhow!(
                    "tool call '{}' has no function name",
                    call.id
                )));
            }
            if call.id.is_empty() || seen.contains(&call.id) {
                call.id = fresh_call_id();
            }
            seen.insert(call.id.clone());
            Ok(call)
        })
        .collect()
}

enum Phase {
    Request,
    Receiving {
        stream: ChatStream,
        classifier: StreamClassifier,
    },
    Execute(Message),
    Finished,
}

/// State carried between polls of a [`ChunkStream`].
struct StreamRun<'a, C: LLMClient> {
    core: &'a Core<C>,
    conversation: &'a mut Conversation,
    use_tools: bool,
    guard: Guard,
    state: LoopState,
    rounds: usize,
    phase: Phase,
    queue: VecDeque<StreamChunk>,
}

impl<C: LLMClient> StreamRun<'_, C> {
    async fn next_chunk(&mut self) -> Option<Result<StreamChunk, CoreError>> {
        loop {
            if let Some(chunk) = self.queue.pop_front() {
                return Some(Ok(chunk));
            }

            let step = match mem::replace(&mut self.phase, Phase::Finished) {
                Phase::Finished => return None,
                Phase::Request => self.open_stream().await,
                Phase::Receiving { stream, classifier } => self.receive(stream, classifier).await,
                Phase::Execute(message) => self.execute(message).await,
            };
            if let Err(err) = step {
                return Some(Err(err));
            }
        }
    }

    async fn open_stream(&mut self) -> Result<(), CoreError> {
        self.state.advance(LoopState::AwaitingModel);
        info!(
            "Requesting streamed model turn (round {}/{})",
            self.rounds + 1,
            self.core.config.max_rounds
        );

        let request = self.core.request(self.conversation, self.use_tools, true);
        let stream = {
            let request = &request;
            let client = &self.core.client;
            self.core
                .with_retry(&self.guard, move || client.chat_stream(request))
                .await?
        };

        let classifier = if self.use_tools {
            StreamClassifier::new()
        } else {
            StreamClassifier::without_tools()
        };
        self.phase = Phase::Receiving { stream, classifier };
        Ok(())
    }

    async fn receive(
        &mut self,
        mut stream: ChatStream,
        mut classifier: StreamClassifier,
    ) -> Result<(), CoreError> {
        match self.guard.run(stream.next()).await? {
            Some(Ok(chunk)) => {
                self.queue
                    .extend(classifier.push(&chunk).into_iter().map(StreamChunk::from));
                self.phase = Phase::Receiving { stream, classifier };
                Ok(())
            }
            Some(Err(err)) => {
                let err = CoreError::from_backend(err);
                error!("Backend stream failed: {err}");
                Err(err)
            }
            None => self.end_of_turn(classifier.finish()?),
        }
    }

    fn end_of_turn(&mut self, turn: Turn) -> Result<(), CoreError> {
        self.queue
            .extend(turn.fragments.into_iter().map(StreamChunk::from));
        let message = assistant_message(
            self.conversation,
            turn.content,
            turn.reasoning,
            turn.tool_calls,
        )?;

        if message.requests_tools() {
            self.core
                .check_round_limit(self.rounds, self.conversation, &message)?;
            self.phase = Phase::Execute(message);
        } else {
            self.state.advance(LoopState::StreamingContent);
            self.conversation.add_message(message)?;
            self.state.advance(LoopState::Done);
            self.queue.push_back(StreamChunk::Done);
        }
        Ok(())
    }

    async fn execute(&mut self, message: Message) -> Result<(), CoreError> {
        self.state.advance(LoopState::ExecutingTools);
        info!("Executing {} tool call(s)", message.tool_calls.len());

        let results = self
            .core
            .execute_tools(self.conversation, message, &self.guard)
            .await?;
        self.queue
            .extend(results.into_iter().map(StreamChunk::ToolResult));
        self.rounds += 1;
        self.phase = Phase::Request;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::ScriptedClient;
    use llmserve_common::{ChunkKind, MessageRole, Parameters, Property};
    use llmserve_tools::FunctionTool;
    use serde_json::Value;

    fn registry() -> Arc<ToolRegistry> {
        let registry = ToolRegistry::new();
        registry
            .register(Arc::new(FunctionTool::new(
                "add",
                "Add two integers",
                Parameters::from_fields([
                    ("a", Property::integer("First addend"), true),
                    ("b", Property::integer("Second addend"), true),
                ]),
                |args: Value| async move {
                    let a = args["a"].as_i64().unwrap_or_default();
                    let b = args["b"].as_i64().unwrap_or_default();
                    Ok::<_, anyhow::Error>(a + b)
                },
            )))
            .unwrap();
        Arc::new(registry)
    }

    fn conversation() -> Conversation {
        let mut conversation = Conversation::with_system_prompt("You add numbers.");
        let msg = conversation.user_message("What is 2 + 3?");
        conversation.add_message(msg).unwrap();
        conversation
    }

    #[test]
    fn test_unique_ids() {
        let calls = vec![
            ToolCall::with_id("a", "add", "{}"),
            ToolCall::with_id("a", "add", "{}"),
            ToolCall::with_id("", "add", "{}"),
        ];
        let calls = unique_ids(calls).unwrap();
        assert_eq!(calls[0].id, "a");
        assert_ne!(calls[1].id, "a");
        assert!(calls[2].id.starts_with("call_"));

        let err = unique_ids(vec![ToolCall::with_id("x", "", "{}")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendProtocol);
    }

    #[tokio::test]
    async fn test_run_answers_without_tools() {
        let client = ScriptedClient::new().reply("<think>easy</think>5");
        let core = Core::new(client, registry());
        let mut conversation = conversation();

        let message = core
            .run(&mut conversation, true, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(message.content, "5");
        assert_eq!(message.reasoning.as_deref(), Some("easy"));
        assert_eq!(conversation.len(), 3);
        assert!(core.client.requests()[0].has_tools());
    }

    #[tokio::test]
    async fn test_run_executes_tool_round() {
        let client = ScriptedClient::new()
            .reply_tool_calls(vec![ToolCall::with_id("c1", "add", r#"{"a": 2, "b": 3}"#)])
            .reply("2 + 3 = 5");
        let core = Core::new(client, registry());
        let mut conversation = conversation();

        let message = core
            .run(&mut conversation, true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(message.content, "2 + 3 = 5");

        let messages = conversation.get_messages();
        assert_eq!(messages.len(), 5);
        assert!(messages[2].requests_tools());
        assert_eq!(messages[3].role, MessageRole::Tool);
        assert_eq!(messages[3].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(messages[3].content, "5");

        let second = &core.client.requests()[1];
        assert_eq!(second.messages.len(), 4);
    }

    #[tokio::test]
    async fn test_run_without_tools_ignores_calls() {
        let client = ScriptedClient::new().reply_message(
            Message::assistant(uuid::Uuid::nil(), "I would call a tool")
                .with_tool_calls(vec![ToolCall::new("add", "{}")])
                .unwrap(),
        );
        let core = Core::new(client, registry());
        let mut conversation = conversation();

        let message = core
            .run(&mut conversation, false, &CancellationToken::new())
            .await
            .unwrap();
        assert!(message.tool_calls.is_empty());
        assert_eq!(message.content, "I would call a tool");
        assert!(!core.client.requests()[0].has_tools());
    }

    #[tokio::test]
    async fn test_round_limit() {
        let mut client = ScriptedClient::new();
        for i in 0..5 {
            client = client.reply_tool_calls(vec![ToolCall::with_id(
                format!("c{i}"),
                "add",
                r#"{"a": 1, "b": 1}"#,
            )]);
        }
        let core = Core::new(client, registry()).with_config(CoreConfig::default().with_max_rounds(2));
        let mut conversation = conversation();

        let err = core
            .run(&mut conversation, true, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::OrchestrationLimit { rounds: 2, .. }));
        let snapshot = err.conversation().unwrap();
        assert!(snapshot.last().unwrap().requests_tools());
        assert_eq!(snapshot.pending_tool_call_ids(), vec!["c2".to_string()]);
        assert!(conversation.pending_tool_call_ids().is_empty());
        assert_eq!(core.client.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_deadline_interrupts_backend_call() {
        let client = ScriptedClient::new()
            .reply("too late")
            .with_latency(Duration::from_secs(30));
        let core = Core::new(client, registry())
            .with_config(CoreConfig::default().with_deadline(Duration::from_millis(20)));
        let mut conversation = conversation();

        let err = core
            .run(&mut conversation, true, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DeadlineExceeded(d) if d == Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn test_stream_emits_done_last() {
        let client = ScriptedClient::new().stream_text(&["Hel", "lo"]);
        let core = Core::new(client, registry());
        let mut conversation = conversation();

        let chunks: Vec<StreamChunk> = core
            .run_stream(&mut conversation, true, CancellationToken::new())
            .map(Result::unwrap)
            .collect()
            .await;

        let kinds: Vec<ChunkKind> = chunks.iter().map(StreamChunk::kind).collect();
        assert_eq!(kinds, vec![ChunkKind::Content, ChunkKind::Content, ChunkKind::Done]);
        assert_eq!(conversation.last().unwrap().content, "Hello");
        assert!(core.client.requests()[0].stream);
    }

    #[tokio::test]
    async fn test_stream_stops_after_error() {
        let client = ScriptedClient::new();
        let core = Core::new(client, registry());
        let mut conversation = conversation();

        let items: Vec<Result<StreamChunk, CoreError>> = core
            .run_stream(&mut conversation, true, CancellationToken::new())
            .collect()
            .await;

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap_err().kind(), ErrorKind::BackendProtocol);
    }

    #[test]
    fn test_reply_message_merges_reasoning() {
        let conversation = conversation();
        let response = ChatResponse {
            message: Message::assistant(conversation.id, "<think>inline</think>answer")
                .with_reasoning("separate"),
            model: "m".to_string(),
            usage: None,
            finish_reason: None,
            created_at: chrono::Utc::now(),
            response_id: None,
        };

        let message = reply_message(&conversation, response, true).unwrap();
        assert_eq!(message.content, "answer");
        assert_eq!(message.reasoning.as_deref(), Some("separate\ninline"));
        assert_eq!(message.conversation_id, conversation.id);
    }
}
