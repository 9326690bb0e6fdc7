use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::info;

use flowkit::{Callable, JsonMap, Module, ModuleCtx, WireableModule};

use crate::provider::{AuthProvider, Identity};
use crate::users::{MemoryUserStore, User, UserStore};

fn default_issuer() -> String {
    "flowd".to_string()
}
fn default_ttl() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JwtProviderConfig {
    /// HS256 signing secret; usually `${FLOWD_JWT_SECRET}`.
    pub secret: String,
    #[serde(default = "default_issuer")]
    pub issuer: String,
    #[serde(default = "default_ttl", rename = "ttlSecs")]
    pub ttl_secs: u64,
    /// Service name of a user store; defaults to an in-memory store.
    #[serde(default)]
    pub users: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iss: String,
    iat: i64,
    exp: i64,
}

/// HS256 token issuance and validation.
pub struct JwtProvider {
    name: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    ttl_secs: u64,
}

impl JwtProvider {
    pub fn new(name: &str, cfg: &JwtProviderConfig) -> Self {
        Self {
            name: name.to_string(),
            encoding: EncodingKey::from_secret(cfg.secret.as_bytes()),
            decoding: DecodingKey::from_secret(cfg.secret.as_bytes()),
            issuer: cfg.issuer.clone(),
            ttl_secs: cfg.ttl_secs,
        }
    }

    pub fn issue(&self, subject: &str) -> anyhow::Result<(String, i64)> {
        let now = Utc::now().timestamp();
        let exp = now + self.ttl_secs as i64;
        let claims = Claims {
            sub: subject.to_string(),
            iss: self.issuer.clone(),
            iat: now,
            exp,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        Ok((token, exp))
    }
}

#[async_trait]
impl AuthProvider for JwtProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, token: &str) -> anyhow::Result<Identity> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(&[&self.issuer]);

        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    anyhow::anyhow!("token-expired")
                }
                _ => anyhow::anyhow!("token-invalid: {e}"),
            }
        })?;

        let mut claims = JsonMap::new();
        claims.insert("iat".to_string(), serde_json::json!(data.claims.iat));
        claims.insert("exp".to_string(), serde_json::json!(data.claims.exp));
        Ok(Identity {
            subject: data.claims.sub,
            issuer: Some(data.claims.iss),
            claims,
        })
    }
}

/// Resolves the configured user store on each use, so a store published by
/// a later-initializing persistence module binds correctly; unnamed
/// configurations use a shared in-memory store.
#[derive(Clone)]
struct StoreHandle {
    registry: Arc<flowkit::ServiceRegistry>,
    name: Option<String>,
    fallback: Arc<MemoryUserStore>,
}

impl StoreHandle {
    fn resolve(&self) -> anyhow::Result<Arc<dyn UserStore>> {
        match &self.name {
            Some(name) => Ok(self.registry.get(name)?),
            None => Ok(self.fallback.clone() as Arc<dyn UserStore>),
        }
    }
}

struct RegisterCallable {
    store: StoreHandle,
}

#[async_trait]
impl Callable for RegisterCallable {
    async fn execute(&self, params: JsonMap) -> anyhow::Result<JsonMap> {
        let email = require_str(&params, "email")?;
        let password = require_str(&params, "password")?;
        let name = params
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or(email);

        let user = User::new(email, password, name)?;
        self.store.resolve()?.create(&user).await?;

        let mut out = JsonMap::new();
        out.insert("email".to_string(), serde_json::json!(user.email));
        out.insert("name".to_string(), serde_json::json!(user.name));
        out.insert(
            "created_at".to_string(),
            serde_json::json!(user.created_at.to_rfc3339()),
        );
        Ok(out)
    }
}

struct LoginCallable {
    store: StoreHandle,
    provider: Arc<JwtProvider>,
}

#[async_trait]
impl Callable for LoginCallable {
    async fn execute(&self, params: JsonMap) -> anyhow::Result<JsonMap> {
        let email = require_str(&params, "email")?;
        let password = require_str(&params, "password")?;

        let user = self
            .store
            .resolve()?
            .find_by_email(email)
            .await?
            .filter(|u| u.verify_password(password))
            .ok_or_else(|| anyhow::anyhow!("invalid credentials"))?;

        let (token, exp) = self.provider.issue(&user.email)?;
        let mut out = JsonMap::new();
        out.insert("token".to_string(), serde_json::json!(token));
        out.insert("expires_at".to_string(), serde_json::json!(exp));
        Ok(out)
    }
}

fn require_str<'a>(params: &'a JsonMap, key: &str) -> anyhow::Result<&'a str> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("missing '{key}' parameter"))
}

/// The `auth.jwt` module: publishes the provider under the module name,
/// plus `<name>.login` and `<name>.register` callables.
pub struct JwtProviderModule {
    name: String,
    store_name: parking_lot::RwLock<Option<String>>,
}

impl JwtProviderModule {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            store_name: parking_lot::RwLock::new(None),
        }
    }
}

#[async_trait]
impl Module for JwtProviderModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        let cfg: JwtProviderConfig = ctx.config()?;
        if cfg.secret.trim().is_empty() {
            anyhow::bail!("auth.jwt '{}' requires a non-empty secret", self.name);
        }
        *self.store_name.write() = cfg.users.clone();

        let provider = Arc::new(JwtProvider::new(&self.name, &cfg));
        ctx.registry()
            .register(self.name.clone(), provider.clone() as Arc<dyn AuthProvider>)?;

        let store = StoreHandle {
            registry: ctx.registry().clone(),
            name: cfg.users.clone(),
            fallback: Arc::new(MemoryUserStore::new()),
        };

        ctx.registry().register(
            format!("{}.register", self.name),
            Arc::new(RegisterCallable {
                store: store.clone(),
            }) as Arc<dyn Callable>,
        )?;
        ctx.registry().register(
            format!("{}.login", self.name),
            Arc::new(LoginCallable { store, provider }) as Arc<dyn Callable>,
        )?;

        info!(module = %self.name, issuer = %cfg.issuer, "JWT provider initialized");
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_wireable(&self) -> Option<&dyn WireableModule> {
        Some(self)
    }
}

impl WireableModule for JwtProviderModule {
    fn wire(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        // A named user store must exist once the registry is complete.
        if let Some(store_name) = self.store_name.read().clone() {
            ctx.registry().get::<Arc<dyn UserStore>>(&store_name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ttl_secs: u64) -> JwtProviderConfig {
        JwtProviderConfig {
            secret: "test-secret".to_string(),
            issuer: default_issuer(),
            ttl_secs,
            users: None,
        }
    }

    #[tokio::test]
    async fn issue_then_validate() {
        let provider = JwtProvider::new("jwt", &config(60));
        let (token, exp) = provider.issue("ada@example.com").unwrap();
        assert!(exp > Utc::now().timestamp());

        let identity = provider.validate(&token).await.unwrap();
        assert_eq!(identity.subject, "ada@example.com");
        assert_eq!(identity.issuer.as_deref(), Some("flowd"));
        assert!(identity.claims.contains_key("exp"));
    }

    #[tokio::test]
    async fn expired_token_rejects_with_token_expired() {
        let provider = JwtProvider::new("jwt", &config(0));
        let (token, _) = provider.issue("ada@example.com").unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let err = provider.validate(&token).await.unwrap_err();
        assert_eq!(err.to_string(), "token-expired");
    }

    #[tokio::test]
    async fn tampered_token_rejects() {
        let provider = JwtProvider::new("jwt", &config(60));
        let (token, _) = provider.issue("ada@example.com").unwrap();

        let other = JwtProvider::new(
            "other",
            &JwtProviderConfig {
                secret: "different".to_string(),
                issuer: default_issuer(),
                ttl_secs: 60,
                users: None,
            },
        );
        assert!(other.validate(&token).await.is_err());
    }

    #[tokio::test]
    async fn register_then_login_flow() {
        let store = StoreHandle {
            registry: Arc::new(flowkit::ServiceRegistry::new()),
            name: None,
            fallback: Arc::new(MemoryUserStore::new()),
        };
        let provider = Arc::new(JwtProvider::new("jwt", &config(60)));

        let register = RegisterCallable {
            store: store.clone(),
        };
        let mut params = JsonMap::new();
        params.insert("email".to_string(), serde_json::json!("ada@example.com"));
        params.insert("password".to_string(), serde_json::json!("pw1234"));
        params.insert("name".to_string(), serde_json::json!("Ada"));
        register.execute(params.clone()).await.unwrap();

        let login = LoginCallable {
            store,
            provider: provider.clone(),
        };
        let out = login.execute(params.clone()).await.unwrap();
        let token = out["token"].as_str().unwrap();
        assert_eq!(
            provider.validate(token).await.unwrap().subject,
            "ada@example.com"
        );

        // Wrong password fails.
        params.insert("password".to_string(), serde_json::json!("nope"));
        assert!(login.execute(params).await.is_err());
    }
}
