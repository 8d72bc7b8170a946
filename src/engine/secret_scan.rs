//! Secret-input resolver.
//!
//! Walks a definition's transitive agent references - tool parameters,
//! router routes, composed sub-calls and executor overrides - to find
//! which parameters require pre-resolved secrets before execution can
//! start. A visited set keeps self-referential agent graphs from
//! looping.

use std::collections::HashSet;

use crate::definition::{AgentDefinition, AgentKind, AgentSelection, ParamType, RouteTarget};
use crate::engine::context::AgentResolver;
use crate::engine::error::EngineError;

/// One parameter that needs a secret resolved up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRequirement {
    pub agent_id: String,
    pub input_key: String,
}

fn visit_key(definition: &AgentDefinition) -> (String, String, String) {
    let identity = definition.identity.as_ref();
    (
        identity
            .and_then(|i| i.project_id.clone())
            .unwrap_or_default(),
        identity
            .and_then(|i| i.project_ref.clone())
            .unwrap_or_default(),
        definition.id.clone(),
    )
}

/// Agent references a definition can reach directly.
fn referenced_selections(definition: &AgentDefinition) -> Vec<AgentSelection> {
    let mut selections = Vec::new();
    if let Some(executor) = &definition.executor {
        selections.push(executor.qualified(definition.identity.as_ref()));
    }
    for param in &definition.parameters {
        if let ParamType::SubAgentTool { agent } = &param.param_type {
            selections.push(agent.qualified(definition.identity.as_ref()));
        }
    }
    match &definition.kind {
        AgentKind::Router { routes, .. } => {
            for route in routes {
                if let RouteTarget::Agent { agent } = &route.target {
                    selections.push(agent.qualified(definition.identity.as_ref()));
                }
            }
        }
        AgentKind::CallAgent { calls } | AgentKind::ParallelCall { calls } => {
            for call in calls {
                selections.push(call.agent.qualified(definition.identity.as_ref()));
            }
        }
        _ => {}
    }
    selections
}

/// Collect every (agent, parameter) pair in the reference closure that
/// requires a secret.
pub async fn required_secrets(
    resolver: &dyn AgentResolver,
    definition: &AgentDefinition,
) -> Result<Vec<SecretRequirement>, EngineError> {
    let mut visited = HashSet::new();
    let mut queue = vec![definition.clone()];
    let mut requirements = Vec::new();

    while let Some(current) = queue.pop() {
        if !visited.insert(visit_key(&current)) {
            continue;
        }

        for param in &current.parameters {
            if matches!(param.param_type, ParamType::Secret) {
                requirements.push(SecretRequirement {
                    agent_id: current.id.clone(),
                    input_key: param.key.clone(),
                });
            }
        }

        for selection in referenced_selections(&current) {
            match resolver.resolve(&selection).await {
                Ok(Some(target)) => queue.push(target),
                // An unresolvable reference fails at execution time;
                // the scan just skips it.
                Ok(None) => {}
                Err(e) => return Err(EngineError::Other(e)),
            }
        }
    }

    requirements.sort_by(|a, b| (&a.agent_id, &a.input_key).cmp(&(&b.agent_id, &b.input_key)));
    requirements.dedup();
    Ok(requirements)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{Parameter, SubCall};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct MapResolver {
        agents: HashMap<String, AgentDefinition>,
    }

    #[async_trait]
    impl AgentResolver for MapResolver {
        async fn resolve(
            &self,
            selection: &AgentSelection,
        ) -> anyhow::Result<Option<AgentDefinition>> {
            Ok(self.agents.get(&selection.agent_id).cloned())
        }
    }

    fn agent(id: &str, parameters: Vec<Parameter>, kind: AgentKind) -> AgentDefinition {
        AgentDefinition {
            id: id.into(),
            name: id.into(),
            description: None,
            identity: None,
            model: None,
            parameters,
            outputs: vec![],
            cache: None,
            executor: None,
            kind,
        }
    }

    fn secret_param(key: &str) -> Parameter {
        Parameter::new(key, ParamType::Secret)
    }

    fn call(name: &str, agent_id: &str) -> SubCall {
        SubCall {
            name: name.into(),
            agent: AgentSelection::by_id(agent_id),
            inputs: crate::JsonMap::new(),
        }
    }

    #[tokio::test]
    async fn walks_transitive_references() {
        let leaf = agent(
            "leaf",
            vec![secret_param("api_key")],
            AgentKind::Function { code: "fn f() { 1 }".into() },
        );
        let middle = agent(
            "middle",
            vec![],
            AgentKind::CallAgent { calls: vec![call("leaf", "leaf")] },
        );
        let root = agent(
            "root",
            vec![secret_param("root_token")],
            AgentKind::CallAgent { calls: vec![call("middle", "middle")] },
        );
        let resolver = MapResolver {
            agents: [
                ("leaf".to_string(), leaf),
                ("middle".to_string(), middle),
                ("root".to_string(), root.clone()),
            ]
            .into_iter()
            .collect(),
        };

        let requirements = required_secrets(&resolver, &root).await.unwrap();
        assert_eq!(
            requirements,
            vec![
                SecretRequirement { agent_id: "leaf".into(), input_key: "api_key".into() },
                SecretRequirement { agent_id: "root".into(), input_key: "root_token".into() },
            ]
        );
    }

    #[tokio::test]
    async fn cycles_terminate() {
        let a = agent(
            "a",
            vec![secret_param("ka")],
            AgentKind::CallAgent { calls: vec![call("b", "b")] },
        );
        let b = agent(
            "b",
            vec![],
            AgentKind::CallAgent { calls: vec![call("a", "a")] },
        );
        let resolver = MapResolver {
            agents: [("a".to_string(), a.clone()), ("b".to_string(), b)]
                .into_iter()
                .collect(),
        };
        let requirements = required_secrets(&resolver, &a).await.unwrap();
        assert_eq!(requirements.len(), 1);
        assert_eq!(requirements[0].agent_id, "a");
    }

    #[tokio::test]
    async fn unresolvable_references_are_skipped() {
        let root = agent(
            "root",
            vec![],
            AgentKind::CallAgent { calls: vec![call("ghost", "ghost")] },
        );
        let resolver = MapResolver { agents: HashMap::new() };
        let requirements = required_secrets(&resolver, &root).await.unwrap();
        assert!(requirements.is_empty());
    }
}
