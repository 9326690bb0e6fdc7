//! End-to-end scenarios over the full engine: a workflow document is
//! parsed, built and exercised through the public surfaces.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use flowkit::{Engine, EngineOptions, JsonMap, WorkflowConfig};
use flowkit_bootstrap::LogBuffer;
use http_gateway::RouterService;
use state_machine::StateMachineEngine;

fn options(base_dir: PathBuf) -> EngineOptions {
    let log_buffer = LogBuffer::new(64);

    let mut factory = flowkit::ModuleFactory::new();
    http_gateway::register_module_types(&mut factory);
    http_gateway::register_log_collector(&mut factory, log_buffer);
    auth::register_module_types(&mut factory);
    messaging::register_module_types(&mut factory);
    scheduler::register_module_types(&mut factory);
    state_machine::register_module_types(&mut factory);
    persistence::register_module_types(&mut factory);
    dynamic_component::register_module_types(&mut factory);

    let mut triggers = flowkit::TriggerFactory::new();
    http_gateway::register_trigger_kinds(&mut triggers);
    messaging::register_trigger_kinds(&mut triggers);
    scheduler::register_trigger_kinds(&mut triggers);

    EngineOptions {
        factory,
        triggers,
        handlers: vec![
            Arc::new(http_gateway::HttpWorkflowHandler::new()),
            Arc::new(messaging::MessagingWorkflowHandler::new()),
            Arc::new(state_machine::StateMachineWorkflowHandler::new()),
            Arc::new(scheduler::SchedulerWorkflowHandler::new()),
            Arc::new(pipeline::PipelineWorkflowHandler::new()),
            Arc::new(pipeline::IntegrationWorkflowHandler::new()),
            Arc::new(dynamic_component::EventWorkflowHandler::new()),
        ],
        base_dir,
        cancel: CancellationToken::new(),
    }
}

async fn build(doc: &str) -> Engine {
    let cfg = WorkflowConfig::from_yaml_str(doc).expect("document parses");
    Engine::build_from_config(cfg, options(PathBuf::from(".")))
        .await
        .expect("engine builds")
}

async fn post_json(
    engine: &Engine,
    router: &str,
    path: &str,
    body: serde_json::Value,
) -> (u16, serde_json::Value) {
    let router: Arc<dyn RouterService> = engine.registry().get(router).unwrap();
    let resp = router
        .build()
        .oneshot(
            axum::http::Request::post(path)
                .header("content-type", "application/json")
                .body(axum::body::Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = resp.status().as_u16();
    let bytes = axum::body::to_bytes(resp.into_body(), 65536).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

const HTTP_TO_STATEMACHINE: &str = r#"
modules:
  - name: api
    type: http.router
  - name: web
    type: http.server
    config: { addr: "127.0.0.1:0" }
    dependsOn: [api]
  - name: orders-sm
    type: statemachine.engine
workflows:
  statemachine:
    engine: orders-sm
    definitions:
      - name: order
        initialState: new
        states:
          new: {}
          done: { isFinal: true }
        transitions:
          finish: { from: new, to: done }
    instances:
      - { definition: order, id: inst-1 }
triggers:
  http:
    method: POST
    path: /go
    workflowType: statemachine
    action: finish
"#;

#[tokio::test]
async fn http_trigger_drives_state_machine_transition() {
    let engine = build(HTTP_TO_STATEMACHINE).await;

    let (status, body) = post_json(
        &engine,
        "api",
        "/go",
        serde_json::json!({ "id": "inst-1" }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["state"], "done");

    // Replaying the transition is an invalid transition with a structured
    // body.
    let (status, body) = post_json(
        &engine,
        "api",
        "/go",
        serde_json::json!({ "id": "inst-1" }),
    )
    .await;
    assert_eq!(status, 409);
    assert_eq!(body["error"], "invalid_transition");

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn wiring_pass_connects_consumer_declared_after_provider() {
    // `z-late` health checker wires to the router published by `a-early`
    // even though every module already initialized (alphabetically) before
    // the wiring pass ran.
    let doc = r#"
modules:
  - name: z-late
    type: health.checker
  - name: a-early
    type: http.router
"#;
    let engine = build(doc).await;

    let router: Arc<dyn RouterService> = engine.registry().get("a-early").unwrap();
    assert!(router.has_route(&axum::http::Method::GET, "/healthz"));
    assert!(router.has_route(&axum::http::Method::GET, "/readyz"));
    assert!(router.has_route(&axum::http::Method::GET, "/livez"));

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn pipeline_with_inline_http_trigger() {
    let doc = r#"
modules:
  - name: api
    type: http.router
pipelines:
  intake:
    steps:
      - name: check
        type: validate
        config: { required_fields: [order_id] }
      - name: tag
        type: set
        config: { values: { handled: true, order: "{{ order_id }}" } }
    onError: stop
    trigger:
      type: http
      config: { method: POST, path: /intake }
"#;
    let engine = build(doc).await;

    let (status, body) = post_json(
        &engine,
        "api",
        "/intake",
        serde_json::json!({ "order_id": "o-9" }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["handled"], true);
    assert_eq!(body["order"], "o-9");

    // Validation failure surfaces as an error body.
    let (status, _body) = post_json(&engine, "api", "/intake", serde_json::json!({})).await;
    assert_eq!(status, 500);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn persistence_survives_restart_with_same_config() {
    let dir = tempfile::tempdir().unwrap();
    let dsn = format!("sqlite://{}", dir.path().join("flowd.db").display());
    let doc = format!(
        r#"
modules:
  - name: store
    type: persistence.store
    config: {{ dsn: "{dsn}" }}
  - name: orders-sm
    type: statemachine.engine
    config: {{ store: store }}
workflows:
  statemachine:
    engine: orders-sm
    definitions:
      - name: order
        initialState: new
        states:
          new: {{}}
          paid: {{}}
          done: {{ isFinal: true }}
        transitions:
          pay: {{ from: new, to: paid }}
          finish: {{ from: paid, to: done }}
    instances:
      - {{ definition: order, id: inst-1 }}
"#
    );

    // First run: transition to `paid`, then stop.
    let engine = build(&doc).await;
    engine.start().await.unwrap();
    let mut data = JsonMap::new();
    data.insert("id".to_string(), serde_json::json!("inst-1"));
    let out = engine
        .trigger_workflow("statemachine", "pay", data.clone())
        .await
        .unwrap();
    assert_eq!(out["state"], "paid");
    engine.stop().await.unwrap();
    drop(engine);

    // Second run over the same config and store: the instance enumerates
    // in `paid` and further transitions proceed from there.
    let engine = build(&doc).await;
    engine.start().await.unwrap();

    let sm: Arc<StateMachineEngine> = engine.registry().get("orders-sm").unwrap();
    assert_eq!(sm.instance_ids(), vec!["inst-1"]);
    assert_eq!(sm.query("inst-1").await.unwrap().state, "paid");

    let out = engine
        .trigger_workflow("statemachine", "finish", data)
        .await
        .unwrap();
    assert_eq!(out["state"], "done");
    assert_eq!(out["counter"], 2);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn schedule_workflow_registers_jobs_on_factory_built_scheduler() {
    let doc = r#"
modules:
  - name: ticker
    type: scheduler.modular
workflows:
  schedule:
    scheduler: ticker
    jobs:
      - { component: cleanup, interval: 30s }
"#;
    let engine = build(doc).await;

    let scheduler: Arc<scheduler::ModularScheduler> = engine.registry().get("ticker").unwrap();
    assert_eq!(scheduler.job_count(), 1);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_dependency_fails_validation() {
    let cfg = WorkflowConfig::from_yaml_str(
        r#"
modules:
  - name: web
    type: http.server
    dependsOn: [missing-router]
"#,
    )
    .unwrap();

    let err = Engine::build_from_config(cfg, options(PathBuf::from(".")))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        flowkit::EngineError::UnknownDependency { .. }
    ));
}

#[tokio::test]
async fn workflow_events_and_metrics_are_recorded() {
    let engine = build(HTTP_TO_STATEMACHINE).await;
    let mut events = engine.events().subscribe("workflow.*");

    let mut data = JsonMap::new();
    data.insert("id".to_string(), serde_json::json!("inst-1"));
    engine
        .trigger_workflow("statemachine", "finish", data)
        .await
        .unwrap();

    assert_eq!(events.recv().await.unwrap().topic, "workflow.started");
    assert_eq!(events.recv().await.unwrap().topic, "workflow.completed");

    let mut buf = Vec::new();
    use prometheus::Encoder;
    prometheus::TextEncoder::new()
        .encode(&engine.metrics().registry().gather(), &mut buf)
        .unwrap();
    let text = String::from_utf8(buf).unwrap();
    assert!(text.contains(
        r#"workflow_triggered_total{action="finish",kind="statemachine",outcome="completed"} 1"#
    ));

    engine.stop().await.unwrap();
}
