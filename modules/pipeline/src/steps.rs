//! The closed set of built-in step types and the registry that builds them
//! from configuration.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use flowkit::template::{lookup, render, render_value};
use flowkit::{Callable, EngineCtx, JsonMap, ServiceRegistry};
use messaging::MessageBroker;

use crate::engine::{PipelineStep, StepOutcome};

/// One step declaration inside a pipeline body.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

type StepBuilder =
    Box<dyn Fn(&StepConfig, &EngineCtx) -> anyhow::Result<Arc<dyn PipelineStep>> + Send + Sync>;

/// Registry of step constructors keyed by step type.
pub struct StepRegistry {
    builders: HashMap<String, StepBuilder>,
}

impl StepRegistry {
    /// The built-in closed set.
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            builders: HashMap::new(),
        };
        registry.register("validate", |cfg, ctx| {
            let parsed: ValidateConfig = parse(cfg)?;
            Ok(Arc::new(ValidateStep {
                name: cfg.name.clone(),
                cfg: parsed,
                registry: ctx.registry().clone(),
            }))
        });
        registry.register("set", |cfg, _ctx| {
            let parsed: SetConfig = parse(cfg)?;
            Ok(Arc::new(SetStep {
                name: cfg.name.clone(),
                values: parsed.values,
            }))
        });
        registry.register("log", |cfg, _ctx| {
            let parsed: LogConfig = parse(cfg)?;
            Ok(Arc::new(LogStep {
                name: cfg.name.clone(),
                level: parsed.level,
                message: parsed.message,
            }))
        });
        registry.register("conditional", |cfg, _ctx| {
            let parsed: ConditionalConfig = parse(cfg)?;
            Ok(Arc::new(ConditionalStep {
                name: cfg.name.clone(),
                cfg: parsed,
            }))
        });
        registry.register("transform", |cfg, ctx| {
            let parsed: TransformConfig = parse(cfg)?;
            Ok(Arc::new(TransformStep {
                name: cfg.name.clone(),
                cfg: parsed,
                registry: ctx.registry().clone(),
            }))
        });
        registry.register("publish", |cfg, ctx| {
            let parsed: PublishConfig = parse(cfg)?;
            Ok(Arc::new(PublishStep {
                name: cfg.name.clone(),
                cfg: parsed,
                registry: ctx.registry().clone(),
                events: ctx.events().clone(),
            }))
        });
        registry.register("http_call", |cfg, _ctx| {
            let parsed: HttpCallConfig = parse(cfg)?;
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(parsed.timeout_secs))
                .build()?;
            Ok(Arc::new(HttpCallStep {
                name: cfg.name.clone(),
                cfg: parsed,
                client,
            }))
        });
        registry
    }

    pub fn register<F>(&mut self, step_type: impl Into<String>, builder: F)
    where
        F: Fn(&StepConfig, &EngineCtx) -> anyhow::Result<Arc<dyn PipelineStep>>
            + Send
            + Sync
            + 'static,
    {
        self.builders.insert(step_type.into(), Box::new(builder));
    }

    pub fn build(
        &self,
        cfg: &StepConfig,
        ctx: &EngineCtx,
    ) -> anyhow::Result<Arc<dyn PipelineStep>> {
        let builder = self
            .builders
            .get(&cfg.step_type)
            .ok_or_else(|| anyhow::anyhow!("unknown pipeline step type '{}'", cfg.step_type))?;
        builder(cfg, ctx)
    }
}

fn parse<T: serde::de::DeserializeOwned + Default>(cfg: &StepConfig) -> anyhow::Result<T> {
    if cfg.config.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(cfg.config.clone())
        .map_err(|e| anyhow::anyhow!("step '{}': invalid config: {e}", cfg.name))
}

// ---------------- validate ----------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ValidateConfig {
    #[serde(default)]
    required_fields: Vec<String>,
    /// Inline JSON schema, checked by an external validator service.
    #[serde(default)]
    json_schema: Option<serde_json::Value>,
    #[serde(default = "default_validator")]
    validator: String,
}

fn default_validator() -> String {
    "json-schema-validator".to_string()
}

struct ValidateStep {
    name: String,
    cfg: ValidateConfig,
    registry: Arc<ServiceRegistry>,
}

#[async_trait]
impl PipelineStep for ValidateStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut JsonMap) -> anyhow::Result<StepOutcome> {
        for field in &self.cfg.required_fields {
            let missing = match lookup(ctx, field) {
                None => true,
                Some(serde_json::Value::Null) => true,
                Some(serde_json::Value::String(s)) => s.is_empty(),
                Some(_) => false,
            };
            if missing {
                anyhow::bail!("required field '{field}' is missing or empty");
            }
        }

        if let Some(schema) = &self.cfg.json_schema {
            // JSON-Schema evaluation is an external collaborator published
            // as a callable.
            let validator: Arc<dyn Callable> = self.registry.get(&self.cfg.validator)?;
            let mut params = JsonMap::new();
            params.insert("schema".to_string(), schema.clone());
            params.insert(
                "data".to_string(),
                serde_json::Value::Object(ctx.clone()),
            );
            validator.execute(params).await?;
        }
        Ok(StepOutcome::Continue)
    }
}

// ---------------- set ----------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SetConfig {
    #[serde(default)]
    values: JsonMap,
}

struct SetStep {
    name: String,
    values: JsonMap,
}

#[async_trait]
impl PipelineStep for SetStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut JsonMap) -> anyhow::Result<StepOutcome> {
        for (key, template) in &self.values {
            let rendered = render_value(template, ctx);
            ctx.insert(key.clone(), rendered);
        }
        Ok(StepOutcome::Continue)
    }
}

// ---------------- log ----------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct LogConfig {
    #[serde(default = "default_level")]
    level: String,
    message: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            message: String::new(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

struct LogStep {
    name: String,
    level: String,
    message: String,
}

#[async_trait]
impl PipelineStep for LogStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut JsonMap) -> anyhow::Result<StepOutcome> {
        let message = render(&self.message, ctx);
        match self.level.as_str() {
            "error" => error!(step = %self.name, "{message}"),
            "warn" => warn!(step = %self.name, "{message}"),
            "debug" => debug!(step = %self.name, "{message}"),
            _ => info!(step = %self.name, "{message}"),
        }
        Ok(StepOutcome::Continue)
    }
}

// ---------------- conditional ----------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConditionalConfig {
    field: String,
    /// Field value → step name.
    #[serde(default)]
    routes: BTreeMap<String, String>,
    #[serde(default)]
    default: Option<String>,
}

struct ConditionalStep {
    name: String,
    cfg: ConditionalConfig,
}

#[async_trait]
impl PipelineStep for ConditionalStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut JsonMap) -> anyhow::Result<StepOutcome> {
        let value = lookup(ctx, &self.cfg.field)
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default();

        if let Some(target) = self.cfg.routes.get(&value) {
            return Ok(StepOutcome::Jump(target.clone()));
        }
        match &self.cfg.default {
            Some(target) => Ok(StepOutcome::Jump(target.clone())),
            None => Ok(StepOutcome::Continue),
        }
    }
}

// ---------------- transform ----------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TransformConfig {
    /// Service name of the data-transformer callable.
    component: String,
    #[serde(default)]
    operations: Option<serde_json::Value>,
}

struct TransformStep {
    name: String,
    cfg: TransformConfig,
    registry: Arc<ServiceRegistry>,
}

#[async_trait]
impl PipelineStep for TransformStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut JsonMap) -> anyhow::Result<StepOutcome> {
        let transformer: Arc<dyn Callable> = self.registry.get(&self.cfg.component)?;

        let mut params = JsonMap::new();
        if let Some(operations) = &self.cfg.operations {
            params.insert("operations".to_string(), operations.clone());
        }
        params.insert("data".to_string(), serde_json::Value::Object(ctx.clone()));

        let result = transformer.execute(params).await?;
        for (k, v) in result {
            ctx.insert(k, v);
        }
        Ok(StepOutcome::Continue)
    }
}

// ---------------- publish ----------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PublishConfig {
    topic: String,
    /// Broker service name; without one the in-process event bus is used.
    #[serde(default)]
    broker: Option<String>,
    /// Payload template; defaults to the whole context.
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

struct PublishStep {
    name: String,
    cfg: PublishConfig,
    registry: Arc<ServiceRegistry>,
    events: flowkit::EventBus,
}

#[async_trait]
impl PipelineStep for PublishStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut JsonMap) -> anyhow::Result<StepOutcome> {
        let topic = render(&self.cfg.topic, ctx);
        let payload = match &self.cfg.payload {
            Some(template) => render_value(template, ctx),
            None => serde_json::Value::Object(ctx.clone()),
        };

        match &self.cfg.broker {
            Some(broker_name) => {
                let broker: Arc<dyn MessageBroker> = self.registry.get(broker_name)?;
                broker.publish(&topic, payload).await?;
            }
            None => self.events.publish(topic, payload),
        }
        Ok(StepOutcome::Continue)
    }
}

// ---------------- http_call ----------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct HttpCallConfig {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    body: Option<serde_json::Value>,
    #[serde(default = "default_http_timeout", rename = "timeoutSecs")]
    timeout_secs: u64,
    #[serde(default)]
    retries: u32,
    #[serde(default = "default_result_field", rename = "resultField")]
    result_field: String,
}

impl Default for HttpCallConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: default_method(),
            body: None,
            timeout_secs: default_http_timeout(),
            retries: 0,
            result_field: default_result_field(),
        }
    }
}

fn default_method() -> String {
    "POST".to_string()
}
fn default_http_timeout() -> u64 {
    30
}
fn default_result_field() -> String {
    "http_response".to_string()
}

struct HttpCallStep {
    name: String,
    cfg: HttpCallConfig,
    client: reqwest::Client,
}

#[async_trait]
impl PipelineStep for HttpCallStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut JsonMap) -> anyhow::Result<StepOutcome> {
        let url = render(&self.cfg.url, ctx);
        let method = reqwest::Method::from_bytes(self.cfg.method.to_uppercase().as_bytes())
            .map_err(|_| anyhow::anyhow!("invalid http method '{}'", self.cfg.method))?;
        let body = self.cfg.body.as_ref().map(|t| render_value(t, ctx));

        let mut last_err = None;
        for attempt in 0..=self.cfg.retries {
            let mut request = self.client.request(method.clone(), &url);
            if let Some(body) = &body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let text = resp.text().await.unwrap_or_default();
                    let parsed: serde_json::Value =
                        serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));
                    ctx.insert(
                        self.cfg.result_field.clone(),
                        serde_json::json!({ "status": status, "body": parsed }),
                    );
                    if status >= 500 {
                        last_err =
                            Some(anyhow::anyhow!("upstream returned {status} from '{url}'"));
                    } else {
                        return Ok(StepOutcome::Continue);
                    }
                }
                Err(e) => {
                    last_err = Some(anyhow::anyhow!(e));
                }
            }
            if attempt < self.cfg.retries {
                debug!(step = %self.name, attempt, "HTTP call failed; retrying");
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("http_call '{url}' failed")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowkit::EventBus;
    use std::path::PathBuf;
    use tokio_util::sync::CancellationToken;

    fn engine_ctx() -> EngineCtx {
        EngineCtx::new(
            Arc::new(ServiceRegistry::new()),
            EventBus::new(),
            CancellationToken::new(),
            PathBuf::from("."),
        )
    }

    fn step(step_type: &str, config: serde_json::Value) -> StepConfig {
        StepConfig {
            name: format!("{step_type}-step"),
            step_type: step_type.to_string(),
            config,
        }
    }

    fn ctx_of(json: serde_json::Value) -> JsonMap {
        serde_json::from_value(json).unwrap()
    }

    #[tokio::test]
    async fn validate_checks_required_fields() {
        let registry = StepRegistry::with_builtins();
        let validate = registry
            .build(
                &step("validate", serde_json::json!({ "required_fields": ["order.id"] })),
                &engine_ctx(),
            )
            .unwrap();

        let mut ok = ctx_of(serde_json::json!({ "order": { "id": "o-1" } }));
        validate.execute(&mut ok).await.unwrap();

        let mut empty = ctx_of(serde_json::json!({ "order": { "id": "" } }));
        let err = validate.execute(&mut empty).await.unwrap_err();
        assert!(err.to_string().contains("order.id"));
    }

    #[tokio::test]
    async fn set_renders_templates_into_context() {
        let registry = StepRegistry::with_builtins();
        let set = registry
            .build(
                &step(
                    "set",
                    serde_json::json!({ "values": {
                        "greeting": "hi {{ user }}",
                        "copy": "{{ amount }}"
                    }}),
                ),
                &engine_ctx(),
            )
            .unwrap();

        let mut ctx = ctx_of(serde_json::json!({ "user": "ada", "amount": 3 }));
        set.execute(&mut ctx).await.unwrap();
        assert_eq!(ctx["greeting"], "hi ada");
        // Sole placeholders keep their type.
        assert_eq!(ctx["copy"], 3);
    }

    #[tokio::test]
    async fn conditional_routes_by_field_value() {
        let registry = StepRegistry::with_builtins();
        let conditional = registry
            .build(
                &step(
                    "conditional",
                    serde_json::json!({
                        "field": "status",
                        "routes": { "vip": "fast-lane" },
                        "default": "slow-lane"
                    }),
                ),
                &engine_ctx(),
            )
            .unwrap();

        let mut vip = ctx_of(serde_json::json!({ "status": "vip" }));
        match conditional.execute(&mut vip).await.unwrap() {
            StepOutcome::Jump(target) => assert_eq!(target, "fast-lane"),
            StepOutcome::Continue => panic!("expected jump"),
        }

        let mut other = ctx_of(serde_json::json!({ "status": "normal" }));
        match conditional.execute(&mut other).await.unwrap() {
            StepOutcome::Jump(target) => assert_eq!(target, "slow-lane"),
            StepOutcome::Continue => panic!("expected default jump"),
        }
    }

    #[tokio::test]
    async fn publish_defaults_to_event_bus() {
        let ctx = engine_ctx();
        let mut stream = ctx.events().subscribe("orders.*");

        let registry = StepRegistry::with_builtins();
        let publish = registry
            .build(
                &step("publish", serde_json::json!({ "topic": "orders.{{ kind }}" })),
                &ctx,
            )
            .unwrap();

        let mut data = ctx_of(serde_json::json!({ "kind": "created", "id": 5 }));
        publish.execute(&mut data).await.unwrap();

        let event = stream.recv().await.unwrap();
        assert_eq!(event.topic, "orders.created");
        assert_eq!(event.data["id"], 5);
    }

    #[tokio::test]
    async fn unknown_step_type_fails_build() {
        let registry = StepRegistry::with_builtins();
        let result = registry.build(&step("teleport", serde_json::json!({})), &engine_ctx());
        let Err(err) = result else {
            panic!("expected an error");
        };
        assert!(err.to_string().contains("teleport"));
    }

    struct Upper;

    #[async_trait]
    impl Callable for Upper {
        async fn execute(&self, params: JsonMap) -> anyhow::Result<JsonMap> {
            let data = params["data"].as_object().cloned().unwrap_or_default();
            let mut out = JsonMap::new();
            if let Some(name) = data.get("name").and_then(|v| v.as_str()) {
                out.insert("name".to_string(), serde_json::json!(name.to_uppercase()));
            }
            Ok(out)
        }
    }

    #[tokio::test]
    async fn transform_merges_component_result() {
        let ctx = engine_ctx();
        ctx.registry()
            .register("upper", Arc::new(Upper) as Arc<dyn Callable>)
            .unwrap();

        let registry = StepRegistry::with_builtins();
        let transform = registry
            .build(
                &step("transform", serde_json::json!({ "component": "upper" })),
                &ctx,
            )
            .unwrap();

        let mut data = ctx_of(serde_json::json!({ "name": "ada" }));
        transform.execute(&mut data).await.unwrap();
        assert_eq!(data["name"], "ADA");
    }
}
