//! Integration tests for the API server.

use std::sync::OnceLock;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::create_order::{self, OrderFaults, OrderServices};
use saga::{OrchestratorConfig, RetryPolicy};
use saga_store::InMemorySagaStore;
use serde_json::{Value, json};
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

struct TestApp {
    app: axum::Router,
    services: OrderServices,
    faults: OrderFaults,
}

fn setup() -> TestApp {
    let services = OrderServices::new();
    services.users.register("user-1");
    services.inventory.add_stock("SKU-001", 10);
    let faults = OrderFaults::default();

    let registry = create_order::registry(&services, &faults).unwrap();
    let config = OrchestratorConfig::default().with_retry(RetryPolicy::immediate());
    let state = api::create_state(
        InMemorySagaStore::new(),
        registry,
        config,
        get_metrics_handle(),
    );

    TestApp {
        app: api::create_app(state),
        services,
        faults,
    }
}

fn order(user_id: &str) -> Value {
    json!({
        "user_id": user_id,
        "items": [{ "sku": "SKU-001", "quantity": 3 }],
        "amount_cents": 2500,
    })
}

impl TestApp {
    async fn send(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_string(&body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, json)
    }

    async fn start(&self, data: Value, wait: bool) -> (StatusCode, Value) {
        self.send(
            "POST",
            "/sagas",
            Some(json!({ "saga_type": "create_order", "data": data, "wait": wait })),
        )
        .await
    }

    /// Polls the status endpoint until the saga is in `status`.
    async fn wait_for_status(&self, saga_id: &str, status: &str) -> Value {
        for _ in 0..400 {
            let (code, detail) = self.send("GET", &format!("/sagas/{saga_id}"), None).await;
            assert_eq!(code, StatusCode::OK);
            if detail["status"] == status {
                return detail;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("saga {saga_id} never reached {status}");
    }
}

#[tokio::test]
async fn test_health_check() {
    let app = setup();

    let (status, json) = app.send("GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["saga_types"], json!(["create_order"]));
}

#[tokio::test]
async fn test_start_and_wait_completes() {
    let app = setup();

    let (status, started) = app.start(order("user-1"), true).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(started["status"], "completed");

    let saga_id = started["saga_id"].as_str().unwrap();
    let (status, detail) = app.send("GET", &format!("/sagas/{saga_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["saga_type"], "create_order");
    assert_eq!(detail["current_step"], 3);
    assert_eq!(detail["total_steps"], 3);
    assert_eq!(detail["progress_percent"], 100);

    let steps = detail["steps"].as_array().unwrap();
    let names: Vec<&str> = steps.iter().map(|s| s["name"].as_str().unwrap()).collect();
    assert_eq!(
        names,
        vec!["reserve_inventory", "charge_payment", "send_notification"]
    );
    assert!(steps.iter().all(|s| s["status"] == "completed"));
    assert_eq!(steps[0]["result"]["reservation_id"], "RES-0001");
    assert_eq!(app.services.inventory.available("SKU-001"), 7);
}

#[tokio::test]
async fn test_start_in_background() {
    let app = setup();

    let (status, started) = app.start(order("user-1"), false).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(started["status"], "started");

    let saga_id = started["saga_id"].as_str().unwrap();
    app.wait_for_status(saga_id, "completed").await;
    assert_eq!(app.services.notifications.sent().len(), 1);
}

#[tokio::test]
async fn test_unknown_saga_type_is_bad_request() {
    let app = setup();

    let (status, json) = app
        .send(
            "POST",
            "/sagas",
            Some(json!({ "saga_type": "ship_order", "data": {} })),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("ship_order"));
}

#[tokio::test]
async fn test_get_missing_and_malformed_ids() {
    let app = setup();

    let missing = common::SagaId::new();
    let (status, json) = app.send("GET", &format!("/sagas/{missing}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains("not found"));

    let (status, _) = app.send("GET", "/sagas/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .send("GET", &format!("/sagas/{missing}/events"), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_failed_charge_is_compensated_and_listed() {
    let app = setup();
    app.services.payments.set_decline(Some("card expired"));

    let (_, started) = app.start(order("user-1"), true).await;
    assert_eq!(started["status"], "compensated");
    let saga_id = started["saga_id"].as_str().unwrap().to_string();

    let (_, detail) = app.send("GET", &format!("/sagas/{saga_id}"), None).await;
    assert_eq!(detail["failed_step"], "charge_payment");
    assert!(detail["error"].as_str().unwrap().contains("card expired"));
    assert_eq!(detail["steps"][0]["status"], "compensated");
    assert_eq!(app.services.inventory.available("SKU-001"), 10);

    app.start(order("user-1"), true).await;
    app.services.payments.set_decline(None);
    app.start(order("user-1"), true).await;

    let (status, list) = app.send("GET", "/sagas?status=compensated", None).await;
    assert_eq!(status, StatusCode::OK);
    let list = list.as_array().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0]["saga_id"], saga_id.as_str());

    let (_, all) = app
        .send("GET", "/sagas?status=completed,compensated&limit=2", None)
        .await;
    assert_eq!(all.as_array().unwrap().len(), 2);

    let (status, _) = app.send("GET", "/sagas?status=finished", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cancel_terminal_saga_conflicts() {
    let app = setup();
    let (_, started) = app.start(order("user-1"), true).await;
    let saga_id = started["saga_id"].as_str().unwrap();

    let (status, json) = app
        .send("POST", &format!("/sagas/{saga_id}/cancel"), None)
        .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn test_cancel_with_compensation() {
    let app = setup();
    app.faults
        .charge_payment
        .delay(Duration::from_millis(200));

    let (_, started) = app.start(order("user-1"), false).await;
    let saga_id = started["saga_id"].as_str().unwrap();

    let (status, detail) = app
        .send(
            "POST",
            &format!("/sagas/{saga_id}/cancel?compensate=true"),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["status"], "compensating");
    assert!(detail["cancelled_at"].is_string());

    let detail = app.wait_for_status(saga_id, "compensated").await;
    assert_eq!(detail["steps"][2]["status"], "pending");
    assert_eq!(app.services.inventory.available("SKU-001"), 10);
    assert_eq!(app.services.payments.active_payments(), 0);
}

#[tokio::test]
async fn test_retry_after_compensation() {
    let app = setup();
    app.services.users.block("user-1");

    let (_, started) = app.start(order("user-1"), true).await;
    assert_eq!(started["status"], "compensated");
    let saga_id = started["saga_id"].as_str().unwrap();

    // Registering again unblocks the user
    app.services.users.register("user-1");
    let (status, detail) = app
        .send("POST", &format!("/sagas/{saga_id}/retry"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["status"], "started");
    assert_eq!(detail["current_step"], 0);

    app.wait_for_status(saga_id, "completed").await;

    let (status, _) = app
        .send("POST", &format!("/sagas/{saga_id}/retry"), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_events_journal() {
    let app = setup();
    let (_, started) = app.start(order("user-1"), true).await;
    let saga_id = started["saga_id"].as_str().unwrap();

    let (status, events) = app
        .send("GET", &format!("/sagas/{saga_id}/events"), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let events = events.as_array().unwrap();
    let types: Vec<&str> = events
        .iter()
        .map(|e| e["event_type"].as_str().unwrap())
        .collect();
    assert_eq!(types.first(), Some(&"SagaCreated"));
    assert_eq!(types.last(), Some(&"SagaCompleted"));
    assert_eq!(
        types.iter().filter(|t| **t == "StepCompleted").count(),
        3
    );
    assert!(events.iter().all(|e| e["saga_id"] == saga_id));
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = setup();
    app.start(order("user-1"), true).await;

    let (status, body) = app.send("GET", "/metrics", None).await;

    assert_eq!(status, StatusCode::OK);
    let text = body.as_str().unwrap();
    assert!(text.contains("saga_started_total"));
    assert!(text.contains("saga_completed_total"));
}

#[tokio::test]
async fn test_registry_file_is_loaded() {
    let path = std::env::temp_dir().join(format!("sagas-{}.json", common::SagaId::new()));
    std::fs::write(
        &path,
        serde_json::to_string(&json!([{
            "saga_type": "reserve_only",
            "steps": [{
                "name": "reserve_inventory",
                "forward": "reserve_inventory",
                "compensate": "release_inventory",
                "timeout_seconds": 5,
                "max_retries": 1
            }]
        }]))
        .unwrap(),
    )
    .unwrap();

    let config = api::config::Config {
        registry_path: Some(path.clone()),
        ..Default::default()
    };
    let services = OrderServices::new();
    let registry = api::load_registry(&config, &services, &OrderFaults::default()).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(registry.saga_types(), vec!["reserve_only"]);
    let step = &registry.steps_for("reserve_only").unwrap()[0];
    assert_eq!(step.timeout, Duration::from_secs(5));
    assert!(step.compensate.is_some());
}
