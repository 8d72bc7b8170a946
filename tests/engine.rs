//! End-to-end engine properties against scripted collaborators.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use serde_json::{json, Value};

use conductor::definition::{
    AgentDefinition, AgentKind, AgentSelection, CachePolicy, Identity, MemoryBinding, MemoryScope,
    MessageTemplate, ModelInfo, OutputBinding, OutputShape, OutputVariable, ParamType, Parameter,
    Route, RouteTarget, SubCall, TEXT_OUTPUT,
};
use conductor::engine::cache::{CacheEntry, CacheStore};
use conductor::llm::{
    ChatRequest, ChatResponse, ChatStream, FunctionCall, ImageClient, ImageRequest, LlmClient,
    Role, StreamChunk, ToolCall,
};
use conductor::memory::{MemoryKey, MemoryStore};
use conductor::platform::{PlatformCatalog, PlatformOperation};
use conductor::protocol::{ProtocolClient, ProtocolConnector};
use conductor::secrets::SecretStore;
use conductor::{
    AgentResolver, Collaborators, EngineError, EventSink, ExecuteOptions, ExecutePhase,
    ExecutionContext, ExecutionEvent, JsonMap, SessionInfo,
};

// ---------------------------------------------------------------------------
// Scripted collaborators
// ---------------------------------------------------------------------------

struct RecordingSink {
    events: Mutex<Vec<ExecutionEvent>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self { events: Mutex::new(Vec::new()) })
    }

    fn snapshot(&self) -> Vec<ExecutionEvent> {
        self.events.lock().unwrap().clone()
    }

    fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: ExecutionEvent) {
        self.events.lock().unwrap().push(event);
    }
}

struct StaticResolver {
    agents: HashMap<String, AgentDefinition>,
}

#[async_trait]
impl AgentResolver for StaticResolver {
    async fn resolve(&self, selection: &AgentSelection) -> anyhow::Result<Option<AgentDefinition>> {
        Ok(self.agents.get(&selection.agent_id).cloned())
    }
}

/// Pops one scripted response per model call and records every request.
struct ScriptedLlm {
    responses: Mutex<VecDeque<ChatResponse>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedLlm {
    fn new(responses: Vec<ChatResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat_stream(&self, request: ChatRequest) -> anyhow::Result<ChatStream> {
        self.requests.lock().unwrap().push(request);
        let response = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no scripted response left"))?;
        Ok(stream::iter(vec![Ok(StreamChunk::Done(response))]).boxed())
    }
}

/// Streams the last message's content back, one whitespace-delimited
/// token per delta.
struct EchoLlm;

#[async_trait]
impl LlmClient for EchoLlm {
    async fn chat_stream(&self, request: ChatRequest) -> anyhow::Result<ChatStream> {
        let content = request
            .messages
            .last()
            .and_then(|m| m.content.clone())
            .unwrap_or_default();
        let mut chunks: Vec<anyhow::Result<StreamChunk>> = content
            .split_inclusive(' ')
            .map(|token| Ok(StreamChunk::Delta(token.to_string())))
            .collect();
        chunks.push(Ok(StreamChunk::Done(ChatResponse {
            content: Some(content),
            ..ChatResponse::default()
        })));
        Ok(stream::iter(chunks).boxed())
    }
}

struct InMemoryCache {
    entries: Mutex<HashMap<(String, String), CacheEntry>>,
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn get(&self, project_id: &str, key: &str) -> anyhow::Result<Option<CacheEntry>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .get(&(project_id.to_string(), key.to_string()))
            .cloned())
    }

    async fn set(&self, project_id: &str, key: &str, entry: CacheEntry) -> anyhow::Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert((project_id.to_string(), key.to_string()), entry);
        Ok(())
    }
}

struct InMemoryMemory {
    values: Mutex<HashMap<String, Vec<Value>>>,
}

fn memory_slot(key: &MemoryKey) -> String {
    format!(
        "{}|{}|{}|{}|{:?}",
        key.project_id.as_deref().unwrap_or(""),
        key.session_id.as_deref().unwrap_or(""),
        key.agent_id,
        key.key,
        key.scope
    )
}

#[async_trait]
impl MemoryStore for InMemoryMemory {
    async fn read(&self, key: &MemoryKey) -> anyhow::Result<Vec<Value>> {
        Ok(self
            .values
            .lock()
            .unwrap()
            .get(&memory_slot(key))
            .cloned()
            .unwrap_or_default())
    }

    async fn write(&self, key: &MemoryKey, value: Value, reset: bool) -> anyhow::Result<()> {
        let mut values = self.values.lock().unwrap();
        let slot = values.entry(memory_slot(key)).or_default();
        if reset {
            slot.clear();
        }
        slot.push(value);
        Ok(())
    }
}

/// Answers every lookup and records the identity it was asked with.
struct RecordingSecrets {
    calls: Mutex<Vec<(Option<String>, String, String)>>,
}

#[async_trait]
impl SecretStore for RecordingSecrets {
    async fn resolve(
        &self,
        project_id: Option<&str>,
        agent_id: &str,
        input_key: &str,
    ) -> anyhow::Result<Option<String>> {
        self.calls.lock().unwrap().push((
            project_id.map(str::to_string),
            agent_id.to_string(),
            input_key.to_string(),
        ));
        Ok(Some("s3cret".to_string()))
    }
}

struct NoPlatforms;

#[async_trait]
impl PlatformCatalog for NoPlatforms {
    async fn operations(&self, _platform_id: &str) -> anyhow::Result<Vec<PlatformOperation>> {
        Ok(Vec::new())
    }

    async fn invoke(
        &self,
        platform_id: &str,
        _operation_id: &str,
        _args: Value,
    ) -> anyhow::Result<Value> {
        anyhow::bail!("no platform '{}' in tests", platform_id)
    }
}

struct NoImages;

#[async_trait]
impl ImageClient for NoImages {
    async fn generate(&self, _request: ImageRequest) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

struct NoProtocols;

#[async_trait]
impl ProtocolConnector for NoProtocols {
    async fn connect(&self, platform_id: &str) -> anyhow::Result<Arc<dyn ProtocolClient>> {
        anyhow::bail!("no protocol server '{}' in tests", platform_id)
    }
}

struct Harness {
    ctx: ExecutionContext,
    events: Arc<RecordingSink>,
    memory: Arc<InMemoryMemory>,
    secrets: Arc<RecordingSecrets>,
}

fn harness(agents: Vec<AgentDefinition>, llm: Arc<dyn LlmClient>) -> Harness {
    let events = RecordingSink::new();
    let memory = Arc::new(InMemoryMemory { values: Mutex::new(HashMap::new()) });
    let secrets = Arc::new(RecordingSecrets { calls: Mutex::new(Vec::new()) });
    let resolver = StaticResolver {
        agents: agents.into_iter().map(|a| (a.id.clone(), a)).collect(),
    };
    let ctx = ExecutionContext::new(Collaborators {
        agents: Arc::new(resolver),
        llm,
        image: Arc::new(NoImages),
        events: events.clone(),
        memory: memory.clone(),
        secrets: secrets.clone(),
        cache: Arc::new(InMemoryCache { entries: Mutex::new(HashMap::new()) }),
        platforms: Arc::new(NoPlatforms),
        protocols: Arc::new(NoProtocols),
    })
    .with_session(SessionInfo {
        session_id: Some("sess-1".into()),
        user_id: Some("user-1".into()),
    });
    Harness { ctx, events, memory, secrets }
}

// ---------------------------------------------------------------------------
// Definition builders
// ---------------------------------------------------------------------------

fn base(id: &str, kind: AgentKind) -> AgentDefinition {
    AgentDefinition {
        id: id.into(),
        name: id.into(),
        description: None,
        identity: None,
        model: Some(ModelInfo { name: "test-model".into(), ..ModelInfo::default() }),
        parameters: vec![],
        outputs: vec![],
        cache: None,
        executor: None,
        kind,
    }
}

fn llm_agent(id: &str, prompt: &str) -> AgentDefinition {
    let mut agent = base(
        id,
        AgentKind::LlmPrompt {
            messages: vec![MessageTemplate::new(Role::User, prompt)],
        },
    );
    agent.parameters = vec![Parameter::new("word", ParamType::String)];
    agent
}

fn function_agent(id: &str, code: &str) -> AgentDefinition {
    base(id, AgentKind::Function { code: code.into() })
}

fn inputs(pairs: &[(&str, Value)]) -> JsonMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

async fn run(
    harness: &Harness,
    definition: &AgentDefinition,
    input_pairs: &[(&str, Value)],
) -> Result<JsonMap, EngineError> {
    harness
        .ctx
        .dispatcher()
        .execute(
            definition,
            ExecuteOptions { inputs: inputs(input_pairs), ..ExecuteOptions::default() },
        )
        .await
}

fn phases_for(events: &[ExecutionEvent], task: &conductor::TaskId) -> Vec<ExecutePhase> {
    events
        .iter()
        .filter_map(|event| match event {
            ExecutionEvent::Execute { task_id, phase, .. } if task_id == task => Some(*phase),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn llm_echo_end_to_end() {
    let agent = llm_agent("echo", "Echo {{word}}");
    let h = harness(vec![agent.clone()], Arc::new(EchoLlm));

    let outputs = run(&h, &agent, &[("word", json!("hi"))]).await.unwrap();
    assert_eq!(outputs.get(TEXT_OUTPUT), Some(&json!("Echo hi")));

    let events = h.events.snapshot();
    let root = events[0].task_id().clone();

    // One chunk per token, then the final full-object chunk.
    let chunks: Vec<&Value> = events
        .iter()
        .filter_map(|event| match event {
            ExecutionEvent::Chunk { task_id, delta, .. } if *task_id == root => Some(delta),
            _ => None,
        })
        .collect();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0], &json!({ TEXT_OUTPUT: "Echo " }));
    assert_eq!(chunks[1], &json!({ TEXT_OUTPUT: "hi" }));
    assert_eq!(chunks[2], &json!({ TEXT_OUTPUT: "Echo hi" }));
}

#[tokio::test]
async fn lifecycle_emits_running_then_end_once() {
    let agent = llm_agent("echo", "Echo {{word}}");
    let h = harness(vec![agent.clone()], Arc::new(EchoLlm));
    run(&h, &agent, &[("word", json!("hi"))]).await.unwrap();

    let events = h.events.snapshot();
    let root = events[0].task_id().clone();
    assert_eq!(
        phases_for(&events, &root),
        vec![ExecutePhase::Running, ExecutePhase::End]
    );

    // The final full-object chunk precedes EXECUTE(END).
    let end_index = events
        .iter()
        .position(|e| matches!(e, ExecutionEvent::Execute { phase: ExecutePhase::End, .. }))
        .unwrap();
    let last_chunk_index = events
        .iter()
        .rposition(|e| matches!(e, ExecutionEvent::Chunk { .. }))
        .unwrap();
    assert!(last_chunk_index < end_index);
}

#[tokio::test]
async fn cache_hits_skip_the_strategy() {
    let mut agent = function_agent(
        "cached-fn",
        r#"
            fn handler(word) {
                log("ran");
                #{ echoed: word }
            }
        "#,
    );
    agent.cache = Some(CachePolicy { enabled: true });
    agent.identity = Some(Identity {
        project_id: Some("proj-1".into()),
        project_ref: Some("main".into()),
        ..Identity::default()
    });
    agent.parameters = vec![Parameter::new("word", ParamType::String)];
    let h = harness(vec![agent.clone()], Arc::new(EchoLlm));

    let first = run(&h, &agent, &[("word", json!("hi"))]).await.unwrap();
    let ran_logs = h
        .events
        .snapshot()
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::Log { .. }))
        .count();
    assert_eq!(ran_logs, 1);

    h.events.clear();
    let second = run(&h, &agent, &[("word", json!("hi"))]).await.unwrap();
    assert_eq!(first, second);
    let ran_logs = h
        .events
        .snapshot()
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::Log { .. }))
        .count();
    assert_eq!(ran_logs, 0, "cache hit must not run the sandbox again");

    // Different visible input misses the cache.
    h.events.clear();
    run(&h, &agent, &[("word", json!("other"))]).await.unwrap();
    let ran_logs = h
        .events
        .snapshot()
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::Log { .. }))
        .count();
    assert_eq!(ran_logs, 1);
}

#[tokio::test]
async fn router_loop_runs_two_model_calls_and_threads_the_conversation() {
    let tool = function_agent("lookup-agent", "fn lookup() { #{ answer: 42 } }");
    let mut router = base(
        "router",
        AgentKind::Router {
            messages: vec![MessageTemplate::new(Role::User, "Answer: {{question}}")],
            routes: vec![Route {
                name: "lookup".into(),
                description: Some("look something up".into()),
                target: RouteTarget::Agent { agent: AgentSelection::by_id("lookup-agent") },
                bound: JsonMap::new(),
                final_text: false,
                exit: false,
            }],
        },
    );
    router.parameters = vec![Parameter::new("question", ParamType::String)];

    let llm = ScriptedLlm::new(vec![
        ChatResponse {
            tool_calls: Some(vec![ToolCall {
                id: "call-1".into(),
                call_type: "function".into(),
                function: FunctionCall { name: "lookup".into(), arguments: "{}".into() },
            }]),
            ..ChatResponse::default()
        },
        ChatResponse { content: Some("done".into()), ..ChatResponse::default() },
    ]);
    let h = harness(vec![router.clone(), tool], llm.clone());

    let outputs = run(&h, &router, &[("question", json!("why"))]).await.unwrap();
    assert_eq!(outputs.get(TEXT_OUTPUT), Some(&json!("done")));

    let requests = llm.requests();
    assert_eq!(requests.len(), 2, "exactly two model calls");

    // Second call's conversation: assistant tool-call message, then the
    // tool's result message, appended in that order.
    let second = &requests[1].messages;
    let assistant_index = second
        .iter()
        .position(|m| m.role == Role::Assistant && m.tool_calls.is_some())
        .unwrap();
    let tool_index = second
        .iter()
        .position(|m| m.role == Role::Tool && m.tool_call_id.as_deref() == Some("call-1"))
        .unwrap();
    assert_eq!(tool_index, assistant_index + 1);
    let tool_body: Value =
        serde_json::from_str(second[tool_index].content.as_deref().unwrap()).unwrap();
    assert_eq!(tool_body, json!({"answer": 42}));
}

#[tokio::test]
async fn exit_route_stops_the_loop_without_another_model_call() {
    let tool = function_agent("finisher", "fn finish() { #{ done: true } }");
    let router = base(
        "router-exit",
        AgentKind::Router {
            messages: vec![MessageTemplate::new(Role::User, "go")],
            routes: vec![Route {
                name: "finish".into(),
                description: None,
                target: RouteTarget::Agent { agent: AgentSelection::by_id("finisher") },
                bound: JsonMap::new(),
                final_text: false,
                exit: true,
            }],
        },
    );
    let llm = ScriptedLlm::new(vec![ChatResponse {
        tool_calls: Some(vec![ToolCall {
            id: "call-1".into(),
            call_type: "function".into(),
            function: FunctionCall { name: "finish".into(), arguments: "{}".into() },
        }]),
        ..ChatResponse::default()
    }]);
    let h = harness(vec![router.clone(), tool], llm.clone());

    run(&h, &router, &[]).await.unwrap();
    assert_eq!(llm.requests().len(), 1, "exit directive aborts further rounds");
}

#[tokio::test]
async fn exit_directive_from_a_tool_unwinds_to_the_router_boundary() {
    let tool = function_agent(
        "stopper",
        r#"fn stop() { exit(#{ verdict: "stop" }); }"#,
    );
    let router = base(
        "router-directive",
        AgentKind::Router {
            messages: vec![MessageTemplate::new(Role::User, "go")],
            routes: vec![Route {
                name: "stop".into(),
                description: None,
                target: RouteTarget::Agent { agent: AgentSelection::by_id("stopper") },
                bound: JsonMap::new(),
                final_text: false,
                exit: false,
            }],
        },
    );
    let llm = ScriptedLlm::new(vec![ChatResponse {
        tool_calls: Some(vec![ToolCall {
            id: "call-1".into(),
            call_type: "function".into(),
            function: FunctionCall { name: "stop".into(), arguments: "{}".into() },
        }]),
        ..ChatResponse::default()
    }]);
    let h = harness(vec![router.clone(), tool], llm.clone());

    let outputs = run(&h, &router, &[]).await.unwrap();
    assert_eq!(outputs.get("verdict"), Some(&json!("stop")));
    assert_eq!(llm.requests().len(), 1, "the directive aborts the loop");
}

#[tokio::test]
async fn identity_inheritance_reaches_the_secret_store() {
    let mut child = function_agent("child", "fn handler() { #{ ok: true } }");
    let mut key = Parameter::new("api_key", ParamType::Secret);
    key.required = true;
    key.hidden = true;
    child.parameters = vec![key];

    let mut parent = base(
        "parent",
        AgentKind::CallAgent {
            calls: vec![SubCall {
                name: "step".into(),
                agent: AgentSelection::by_id("child"),
                inputs: JsonMap::new(),
            }],
        },
    );
    parent.identity = Some(Identity {
        project_id: Some("proj-1".into()),
        project_ref: Some("main".into()),
        ..Identity::default()
    });

    let h = harness(vec![parent.clone(), child], Arc::new(EchoLlm));
    run(&h, &parent, &[]).await.unwrap();

    let calls = h.secrets.calls.lock().unwrap().clone();
    assert_eq!(
        calls,
        vec![(Some("proj-1".to_string()), "child".to_string(), "api_key".to_string())],
        "child without identity inherits the parent's project"
    );
}

#[tokio::test]
async fn fully_qualified_child_identity_is_left_unmodified() {
    let mut child = function_agent("child", "fn handler() { #{ ok: true } }");
    child.identity = Some(Identity {
        project_id: Some("other-project".into()),
        ..Identity::default()
    });
    let mut key = Parameter::new("api_key", ParamType::Secret);
    key.required = true;
    child.parameters = vec![key];

    let mut parent = base(
        "parent",
        AgentKind::CallAgent {
            calls: vec![SubCall {
                name: "step".into(),
                agent: AgentSelection::by_id("child"),
                inputs: JsonMap::new(),
            }],
        },
    );
    parent.identity = Some(Identity {
        project_id: Some("proj-1".into()),
        ..Identity::default()
    });

    let h = harness(vec![parent.clone(), child], Arc::new(EchoLlm));
    run(&h, &parent, &[]).await.unwrap();

    let calls = h.secrets.calls.lock().unwrap().clone();
    assert_eq!(calls[0].0.as_deref(), Some("other-project"));
}

#[tokio::test]
async fn call_agent_composes_sub_agent_outputs_by_path() {
    let a = function_agent("agent-a", r#"fn produce() { #{ value: "hello" } }"#);
    let mut b = function_agent("agent-b", "fn echo(text) { #{ echoed: text } }");
    b.parameters = vec![Parameter::new("text", ParamType::Object)];

    let mut root = base(
        "composer",
        AgentKind::CallAgent {
            calls: vec![
                SubCall {
                    name: "a".into(),
                    agent: AgentSelection::by_id("agent-a"),
                    inputs: JsonMap::new(),
                },
                SubCall {
                    name: "b".into(),
                    agent: AgentSelection::by_id("agent-b"),
                    inputs: inputs(&[("text", json!("{{a}}"))]),
                },
            ],
        },
    );
    root.outputs = vec![
        OutputVariable {
            from: Some(OutputBinding::AgentOutput { call: "a".into(), path: vec!["value".into()] }),
            ..OutputVariable::new("direct", OutputShape::String)
        },
        OutputVariable {
            from: Some(OutputBinding::AgentOutput {
                call: "b".into(),
                path: vec!["echoed".into(), "value".into()],
            }),
            ..OutputVariable::new("threaded", OutputShape::String)
        },
    ];

    let h = harness(vec![root.clone(), a, b], Arc::new(EchoLlm));
    let outputs = run(&h, &root, &[]).await.unwrap();
    assert_eq!(outputs.get("direct"), Some(&json!("hello")));
    assert_eq!(outputs.get("threaded"), Some(&json!("hello")));
}

#[tokio::test]
async fn parallel_call_returns_all_raw_results() {
    let a = function_agent("agent-a", "fn one() { #{ n: 1 } }");
    let b = function_agent("agent-b", "fn two() { #{ n: 2 } }");
    let root = base(
        "fanout",
        AgentKind::ParallelCall {
            calls: vec![
                SubCall {
                    name: "a".into(),
                    agent: AgentSelection::by_id("agent-a"),
                    inputs: JsonMap::new(),
                },
                SubCall {
                    name: "b".into(),
                    agent: AgentSelection::by_id("agent-b"),
                    inputs: JsonMap::new(),
                },
            ],
        },
    );
    let h = harness(vec![root.clone(), a, b], Arc::new(EchoLlm));
    let outputs = run(&h, &root, &[]).await.unwrap();
    assert_eq!(
        outputs.get("results"),
        Some(&json!([{"n": 1}, {"n": 2}])),
        "raw results in declaration order"
    );
}

#[tokio::test]
async fn llm_retries_until_the_fenced_block_validates() {
    let mut agent = llm_agent("structured", "Produce the answer for {{q}}");
    agent.parameters = vec![Parameter::new("q", ParamType::String)];
    agent.outputs = vec![OutputVariable::new("answer", OutputShape::Number)];

    let llm = ScriptedLlm::new(vec![
        ChatResponse {
            content: Some("```json\nnot json at all\n```".into()),
            ..ChatResponse::default()
        },
        ChatResponse {
            content: Some("```json\n{\"answer\": 7}\n```".into()),
            ..ChatResponse::default()
        },
    ]);
    let h = harness(vec![agent.clone()], llm.clone());

    let outputs = run(&h, &agent, &[("q", json!("seven"))]).await.unwrap();
    assert_eq!(outputs.get("answer"), Some(&json!(7)));
    assert_eq!(llm.requests().len(), 2, "one retry after the malformed block");
}

#[tokio::test]
async fn input_bound_outputs_surface_before_the_strategy_runs() {
    let mut agent = function_agent("pass-through", "fn noop() { #{} }");
    agent.parameters = vec![Parameter::new("word", ParamType::String)];
    agent.outputs = vec![OutputVariable {
        from: Some(OutputBinding::Input { key: "word".into() }),
        ..OutputVariable::new("echoed", OutputShape::String)
    }];

    let h = harness(vec![agent.clone()], Arc::new(EchoLlm));
    let outputs = run(&h, &agent, &[("word", json!("hi"))]).await.unwrap();
    assert_eq!(outputs.get("echoed"), Some(&json!("hi")));

    let events = h.events.snapshot();
    let early_chunk = events
        .iter()
        .position(|e| matches!(e, ExecutionEvent::Chunk { delta, .. } if delta == &json!({"echoed": "hi"})))
        .expect("early partial chunk emitted");
    let running = events
        .iter()
        .position(|e| matches!(e, ExecutionEvent::Execute { phase: ExecutePhase::Running, .. }))
        .unwrap();
    assert!(early_chunk < running, "partial chunk precedes EXECUTE(RUNNING)");
}

#[tokio::test]
async fn memory_bound_outputs_persist_with_reset_semantics() {
    let mut agent = function_agent("remember", r#"fn handler() { #{ greeting: "hello" } }"#);
    agent.identity = Some(Identity {
        project_id: Some("proj-1".into()),
        ..Identity::default()
    });
    agent.outputs = vec![OutputVariable {
        memory: Some(MemoryBinding {
            key: "greet".into(),
            scope: MemoryScope::Session,
            reset: false,
        }),
        ..OutputVariable::new("greeting", OutputShape::String)
    }];

    let h = harness(vec![agent.clone()], Arc::new(EchoLlm));
    run(&h, &agent, &[]).await.unwrap();
    run(&h, &agent, &[]).await.unwrap();

    let key = MemoryKey {
        project_id: Some("proj-1".into()),
        session_id: Some("sess-1".into()),
        agent_id: "remember".into(),
        key: "greet".into(),
        scope: MemoryScope::Session,
    };
    assert_eq!(h.memory.read(&key).await.unwrap().len(), 2, "append by default");

    let mut resetting = agent.clone();
    resetting.outputs[0].memory = Some(MemoryBinding {
        key: "greet".into(),
        scope: MemoryScope::Session,
        reset: true,
    });
    run(&h, &resetting, &[]).await.unwrap();
    assert_eq!(h.memory.read(&key).await.unwrap().len(), 1, "reset replaces");
}

#[tokio::test]
async fn self_referential_graphs_hit_the_depth_guard() {
    let cycle = base(
        "ouroboros",
        AgentKind::CallAgent {
            calls: vec![SubCall {
                name: "again".into(),
                agent: AgentSelection::by_id("ouroboros"),
                inputs: JsonMap::new(),
            }],
        },
    );
    let h = harness(vec![cycle.clone()], Arc::new(EchoLlm));
    let err = run(&h, &cycle, &[]).await.unwrap_err();
    assert!(matches!(err, EngineError::DepthExceeded(_)));
}

#[tokio::test]
async fn unknown_agent_references_fail_fast() {
    let root = base(
        "broken",
        AgentKind::CallAgent {
            calls: vec![SubCall {
                name: "ghost".into(),
                agent: AgentSelection::by_id("ghost"),
                inputs: JsonMap::new(),
            }],
        },
    );
    let h = harness(vec![root.clone()], Arc::new(EchoLlm));
    let err = run(&h, &root, &[]).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownAgent(id) if id == "ghost"));
}

#[tokio::test]
async fn child_events_carry_their_own_task_ids_under_one_tree() {
    let child = function_agent("leaf", "fn leaf() { #{ ok: true } }");
    let root = base(
        "tree-root",
        AgentKind::CallAgent {
            calls: vec![SubCall {
                name: "leaf".into(),
                agent: AgentSelection::by_id("leaf"),
                inputs: JsonMap::new(),
            }],
        },
    );
    let h = harness(vec![root.clone(), child], Arc::new(EchoLlm));
    run(&h, &root, &[]).await.unwrap();

    let events = h.events.snapshot();
    let root_task = events[0].task_id().clone();
    let child_task = events
        .iter()
        .map(|e| e.task_id().clone())
        .find(|t| *t != root_task)
        .expect("child task id present");

    // The child's RUNNING comes after the parent's RUNNING, and the
    // parent sees the child's serialized result on its own task id.
    let parent_running = events
        .iter()
        .position(|e| matches!(e, ExecutionEvent::Execute { task_id, phase: ExecutePhase::Running, .. } if *task_id == root_task))
        .unwrap();
    let child_running = events
        .iter()
        .position(|e| matches!(e, ExecutionEvent::Execute { task_id, phase: ExecutePhase::Running, .. } if *task_id == child_task))
        .unwrap();
    assert!(parent_running < child_running);

    let mirrored = events.iter().any(|e| matches!(
        e,
        ExecutionEvent::Chunk { task_id, delta: Value::String(text), .. }
            if *task_id == root_task && text.contains("\"ok\":true")
    ));
    assert!(mirrored, "nested result mirrored to the parent's task id as text");
}
