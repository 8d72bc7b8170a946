//! Function/logic strategy - sandboxed script execution.
//!
//! Caller-declared source runs inside an embedded interpreter with an
//! explicit capability allow-list: no filesystem, process or ambient
//! network access; the only injected effects are `log` (forwarded as LOG
//! events) and a blocking `fetch`. The script must define exactly one
//! function; its declared parameter names bind to the resolved inputs,
//! and a parameter named `context` receives a read-only view of select
//! execution-context fields. Evaluation runs on a blocking thread with
//! operation, recursion and size limits.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{kind_mismatch, Strategy};
use crate::definition::{AgentDefinition, AgentKind};
use crate::engine::context::ExecutionContext;
use crate::engine::error::EngineError;
use crate::engine::events::ExecutionEvent;
use crate::engine::task::ExecutionTask;
use crate::JsonMap;

pub struct FunctionStrategy;

#[async_trait]
impl Strategy for FunctionStrategy {
    async fn process(
        &self,
        ctx: &ExecutionContext,
        definition: &AgentDefinition,
        task: &ExecutionTask,
        inputs: &JsonMap,
    ) -> Result<Value, EngineError> {
        let AgentKind::Function { code } = &definition.kind else {
            return Err(kind_mismatch(definition, "function"));
        };
        if code.trim().is_empty() {
            return Err(EngineError::Config(format!(
                "function agent '{}' has no code",
                definition.id
            )));
        }

        let context_view = json!({
            "agent_id": definition.id,
            "project_id": definition.project_id(),
            "session_id": ctx.session.session_id,
            "user_id": ctx.session.user_id,
        });

        let events = Arc::clone(&ctx.events);
        let task_id = task.id.clone();
        let agent_id = definition.id.clone();
        let log: Arc<dyn Fn(String) + Send + Sync> = Arc::new(move |message: String| {
            events.emit(ExecutionEvent::Log {
                task_id: task_id.clone(),
                agent_id: agent_id.clone(),
                message,
            });
        });

        let code = code.clone();
        let inputs = inputs.clone();
        tokio::task::spawn_blocking(move || run_sandboxed(&code, &inputs, &context_view, log))
            .await
            .map_err(|e| EngineError::Other(e.into()))?
    }
}

/// Compile and run a script in a restricted interpreter.
fn run_sandboxed(
    code: &str,
    inputs: &JsonMap,
    context_view: &Value,
    log: Arc<dyn Fn(String) + Send + Sync>,
) -> Result<Value, EngineError> {
    let mut engine = rhai::Engine::new();
    engine.set_max_operations(5_000_000);
    engine.set_max_call_levels(64);
    engine.set_max_string_size(1_000_000);
    engine.set_max_array_size(100_000);
    engine.set_max_map_size(100_000);

    engine.register_fn("log", move |message: &str| log(message.to_string()));
    engine.register_fn("fetch", |url: &str| -> Result<String, Box<rhai::EvalAltResult>> {
        reqwest::blocking::get(url)
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.text())
            .map_err(|e| e.to_string().into())
    });
    // `exit(value)` raises the loop-exit directive: when the agent runs
    // as a tool, the enclosing router stops iterating and `value`
    // becomes its result.
    engine.register_fn(
        "exit",
        |value: rhai::Dynamic| -> Result<(), Box<rhai::EvalAltResult>> {
            let payload = rhai::serde::from_dynamic::<Value>(&value).unwrap_or(Value::Null);
            Err(Box::new(rhai::EvalAltResult::ErrorRuntime(
                rhai::Dynamic::from(ExitPayload(payload)),
                rhai::Position::NONE,
            )))
        },
    );

    let ast = engine
        .compile(code)
        .map_err(|e| EngineError::Config(format!("function agent failed to compile: {}", e)))?;

    let exported: Vec<_> = ast.iter_functions().collect();
    if exported.len() != 1 {
        return Err(EngineError::Config(format!(
            "function agents must export exactly one function, found {}",
            exported.len()
        )));
    }
    let entry = &exported[0];

    let context_dynamic = rhai::serde::to_dynamic(context_view)
        .map_err(|e| EngineError::Config(format!("context binding failed: {}", e)))?;
    let mut args = Vec::with_capacity(entry.params.len());
    for param in &entry.params {
        if *param == "context" {
            args.push(context_dynamic.clone());
        } else {
            let bound = inputs.get(*param).cloned().unwrap_or(Value::Null);
            args.push(
                rhai::serde::to_dynamic(&bound)
                    .map_err(|e| EngineError::Config(format!("input binding failed: {}", e)))?,
            );
        }
    }

    let name = entry.name.to_string();
    let mut scope = rhai::Scope::new();
    let result: rhai::Dynamic = match engine.call_fn(&mut scope, &ast, &name, args) {
        Ok(result) => result,
        Err(e) => {
            if let Some(payload) = unwrap_exit(&e) {
                return Err(EngineError::ExitDirective(payload));
            }
            return Err(EngineError::Other(anyhow::anyhow!(
                "function agent failed: {}",
                e
            )));
        }
    };

    rhai::serde::from_dynamic(&result)
        .map_err(|e| EngineError::Config(format!("function agent returned an unconvertible value: {}", e)))
}

/// Marker carried through the interpreter by the `exit` binding.
#[derive(Debug, Clone)]
struct ExitPayload(Value);

/// Recover an exit payload from a (possibly wrapped) evaluation error.
fn unwrap_exit(error: &rhai::EvalAltResult) -> Option<Value> {
    match error {
        rhai::EvalAltResult::ErrorRuntime(payload, _) => payload
            .clone()
            .try_cast::<ExitPayload>()
            .map(|exit| exit.0),
        rhai::EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => unwrap_exit(inner),
        _ => None,
    }
}
