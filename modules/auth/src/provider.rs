use async_trait::async_trait;

use flowkit::JsonMap;

/// A verified identity attached to authenticated requests.
#[derive(Debug, Clone)]
pub struct Identity {
    pub subject: String,
    pub issuer: Option<String>,
    pub claims: JsonMap,
}

/// Validates bearer credentials. Providers are published in the registry
/// and discovered by the auth middleware in the wiring pass.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn validate(&self, token: &str) -> anyhow::Result<Identity>;
}
