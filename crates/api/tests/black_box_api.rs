use std::sync::Arc;

use reqwest::StatusCode;
use serde_json::{json, Value};
use stockledger_api::app::{build_app, services::AppServices};

struct TestServer {
    base_url: String,
    client: reqwest::Client,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        // Same router as prod, in-memory backend, ephemeral port.
        let app = build_app(Arc::new(AppServices::in_memory()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            client: reqwest::Client::new(),
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let res = self.client.post(self.url(path)).json(&body).send().await.unwrap();
        let status = res.status();
        let body = res.json().await.unwrap_or(Value::Null);
        (status, body)
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let res = self.client.get(self.url(path)).send().await.unwrap();
        let status = res.status();
        let body = res.json().await.unwrap_or(Value::Null);
        (status, body)
    }

    /// Org `A` with stores S1, S2 and sku X.
    async fn seed_org(&self) {
        let (status, _) = self.post("/orgs", json!({ "org_id": "A" })).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = self.post("/orgs/A/stores", json!({ "ids": ["S1", "S2"] })).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = self.post("/orgs/A/skus", json!({ "ids": ["X"] })).await;
        assert_eq!(status, StatusCode::OK);
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn order(store: &str, qty: i64, key: &str) -> Value {
    json!({
        "store_id": store,
        "sku_id": "X",
        "qty": qty,
        "approved_by": "ops@example.com",
        "idempotency_key": key,
    })
}

#[tokio::test]
async fn health_is_ok() {
    let srv = TestServer::spawn().await;
    let res = srv.client.get(srv.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn org_upsert_is_created_then_updated() {
    let srv = TestServer::spawn().await;

    let (status, body) = srv.post("/orgs", json!({ "org_id": "A" })).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "created");

    let (status, body) = srv
        .post("/orgs", json!({ "org_id": "A", "display_name": "Acme" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "updated");
    assert_eq!(body["organization"]["display_name"], "Acme");

    let (status, _) = srv.post("/orgs", json!({ "org_id": "   " })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn membership_is_idempotent() {
    let srv = TestServer::spawn().await;
    srv.seed_org().await;

    let (_, body) = srv.post("/orgs/A/stores", json!({ "ids": ["S1", "S3", " "] })).await;
    assert_eq!(body["added"], 1);

    let (status, body) = srv.get("/orgs/A/stores").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stores"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn order_is_applied_once_and_replayed_after() {
    let srv = TestServer::spawn().await;
    srv.seed_org().await;

    let (status, first) = srv.post("/orgs/A/orders", order("S1", 10, "k1")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["status"], "recorded");
    assert_eq!(first["state"], "notified");

    let (status, replay) = srv.post("/orgs/A/orders", order("S1", 10, "k1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replay["status"], "duplicate");
    assert_eq!(replay["ledger_id"], first["ledger_id"]);
    assert_eq!(replay["approved_at"], first["approved_at"]);

    let (status, body) = srv.get("/orgs/A/inventory?store_id=S1&sku_id=X").await;
    assert_eq!(status, StatusCode::OK);
    let levels = body["levels"].as_array().unwrap();
    assert_eq!(levels.len(), 1);
    assert_eq!(levels[0]["on_hand"], 10);
}

#[tokio::test]
async fn idempotency_key_can_come_from_the_header() {
    let srv = TestServer::spawn().await;
    srv.seed_org().await;

    let body = json!({
        "store_id": "S1",
        "sku_id": "X",
        "qty": 4,
        "approved_by": "ops@example.com",
    });
    let res = srv
        .client
        .post(srv.url("/orgs/A/orders"))
        .header("Idempotency-Key", "hdr-1")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);

    let (status, err) = srv.post("/orgs/A/orders", body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "validation_error");
}

#[tokio::test]
async fn transfer_moves_stock_and_may_go_negative() {
    let srv = TestServer::spawn().await;
    srv.seed_org().await;

    let (status, _) = srv
        .post(
            "/orgs/A/transfers",
            json!({
                "from_store": "S1",
                "to_store": "S2",
                "sku_id": "X",
                "qty": 3,
                "approved_by": "ops@example.com",
                "idem_key": "t1",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (_, body) = srv.get("/orgs/A/inventory").await;
    let levels = body["levels"].as_array().unwrap();
    let on_hand = |store: &str| {
        levels
            .iter()
            .find(|l| l["store_id"] == store)
            .map(|l| l["on_hand"].as_i64().unwrap())
    };
    assert_eq!(on_hand("S1"), Some(-3));
    assert_eq!(on_hand("S2"), Some(3));
}

#[tokio::test]
async fn invalid_confirmations_are_rejected() {
    let srv = TestServer::spawn().await;
    srv.seed_org().await;

    let (status, body) = srv
        .post(
            "/orgs/A/transfers",
            json!({
                "from_store": "S1",
                "to_store": "S1",
                "sku_id": "X",
                "qty": 1,
                "approved_by": "ops@example.com",
                "idempotency_key": "t-same",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    let (status, _) = srv.post("/orgs/A/orders", order("S1", 0, "zero")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = srv.post("/orgs/A/orders", order("S9", 1, "unknown-store")).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "out_of_scope");

    let (status, _) = srv.post("/orgs/B/orders", order("S1", 1, "unknown-org")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Nothing above touched the projection.
    let (_, body) = srv.get("/orgs/A/inventory").await;
    assert!(body["levels"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn events_can_be_polled_with_a_cursor() {
    let srv = TestServer::spawn().await;
    srv.seed_org().await;
    srv.post("/orgs/A/orders", order("S1", 1, "e1")).await;
    srv.post("/orgs/A/orders", order("S1", 1, "e2")).await;

    let (status, page) = srv.get("/orgs/A/events?after=0").await;
    assert_eq!(status, StatusCode::OK);
    let types: Vec<&str> = page["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["event_type"].as_str().unwrap())
        .collect();
    assert_eq!(types, vec!["org_created", "order_confirmed", "order_confirmed"]);

    let cursor = page["cursor"].as_i64().unwrap();
    let (_, next) = srv.get(&format!("/orgs/A/events?after={cursor}")).await;
    assert!(next["events"].as_array().unwrap().is_empty());
    assert_eq!(next["cursor"].as_i64().unwrap(), cursor);

    let (_, recent) = srv.get("/orgs/A/events/recent?limit=1").await;
    let recent = recent["events"].as_array().unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0]["id"].as_i64().unwrap(), cursor);
}

#[tokio::test]
async fn batch_lines_apply_independently() {
    let srv = TestServer::spawn().await;
    srv.seed_org().await;

    let batch = json!({
        "approved_by": "ops@example.com",
        "idem_prefix": "po-7",
        "lines": [
            { "store_id": "S1", "sku_id": "X", "quantity": 5 },
            { "store_id": "S9", "sku_id": "X", "quantity": 5 },
            { "store_id": "S2", "sku_id": "X", "quantity": 2 },
        ],
    });
    let (status, summary) = srv.post("/orgs/A/orders/batch", batch.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["applied"], 2);
    assert_eq!(summary["rejected"], 1);

    let (_, replay) = srv.post("/orgs/A/orders/batch", batch).await;
    assert_eq!(replay["applied"], 0);
    assert_eq!(replay["duplicates"], 2);

    let (_, recent) = srv.get("/orgs/A/events/recent?limit=1").await;
    assert_eq!(recent["events"][0]["event_type"], "orders_approved");
}

#[tokio::test]
async fn reconcile_reports_a_consistent_projection() {
    let srv = TestServer::spawn().await;
    srv.seed_org().await;
    srv.post("/orgs/A/orders", order("S1", 10, "r1")).await;

    let (status, report) = srv.post("/orgs/A/reconcile", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["checked"], 1);
    assert!(report["drift"].as_array().unwrap().is_empty());

    let (status, repaired) = srv.post("/orgs/A/repair", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(repaired["corrected"], 0);
    assert_eq!(repaired["rows"], 1);
}

#[tokio::test]
async fn users_can_be_created_and_verified() {
    let srv = TestServer::spawn().await;
    srv.seed_org().await;

    let (status, created) = srv
        .post(
            "/orgs/A/users",
            json!({ "email": "Ops@Example.com", "password": "hunter2" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["created"], true);

    let (status, again) = srv
        .post(
            "/orgs/A/users",
            json!({ "email": "ops@example.com", "password": "other" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["id"], created["id"]);

    let (status, user) = srv
        .post(
            "/users/verify",
            json!({ "email": "ops@example.com", "password": "hunter2" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(user["org_id"], "A");
    assert!(user.get("password_digest").is_none());

    let (status, _) = srv
        .post(
            "/users/verify",
            json!({ "email": "ops@example.com", "password": "wrong" }),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn deleting_an_org_removes_it() {
    let srv = TestServer::spawn().await;
    srv.seed_org().await;
    srv.post("/orgs/A/orders", order("S1", 1, "d1")).await;

    let res = srv.client.delete(srv.url("/orgs/A")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let (status, _) = srv.get("/orgs/A").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = srv.get("/orgs/A/inventory").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
