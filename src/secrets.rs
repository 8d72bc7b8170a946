//! Secret store collaborator boundary.
//!
//! Secret-typed parameters resolve through this trait. The engine never
//! sees how secrets are stored or encrypted; it only asks for the value
//! bound to a (project, agent, input key) triple.

use async_trait::async_trait;

/// External secret store.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Resolve the secret configured for an agent's input key.
    /// `None` means no value is stored.
    async fn resolve(
        &self,
        project_id: Option<&str>,
        agent_id: &str,
        input_key: &str,
    ) -> anyhow::Result<Option<String>>;
}
