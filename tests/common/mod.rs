#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    routing::post,
    Json, Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set,
};
use serde_json::{json, Value};
use storefront_api::{
    config::AppConfig,
    db,
    entities::{bundle, order, product},
    events::{self, EventSender},
    notifications::{Notifier, NotifyError},
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const ADMIN_TOKEN: &str = "admin-bearer-f3a9c2e8d1b7a605-4e9c8d7b";
pub const CALLBACK_TOKEN: &str = "cb-token-9e4d2a7c5b1f8e30-c6a2d8f1";
const GATEWAY_SECRET: &str = "gw-shared-7c1f0a9e3b2d8c4f-a1e6b0d9";

/// Notifier that records every delivery instead of sending anything.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, contact: &str, message: &str) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .expect("notifier mutex")
            .push((contact.to_string(), message.to_string()));
        Ok(())
    }
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().expect("notifier mutex").clone()
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.sent()
            .iter()
            .filter(|(_, message)| message.contains(needle))
            .count()
    }
}

/// Harness around a full application instance backed by a throwaway SQLite
/// file and an in-process payment provider stub.
pub struct TestApp {
    router: Router,
    pub state: Arc<AppState>,
    pub notices: Arc<RecordingNotifier>,
    _event_task: tokio::task::JoinHandle<()>,
    _provider_task: Option<tokio::task::JoinHandle<()>>,
    _db_dir: tempfile::TempDir,
}

impl TestApp {
    /// App wired to a provider stub that accepts every initiation.
    pub async fn new() -> Self {
        let (base_url, task) = spawn_provider_stub().await;
        Self::build(base_url, Some(task)).await
    }

    /// App whose provider endpoint refuses connections, so initiation always
    /// fails while everything else works.
    pub async fn with_unreachable_gateway() -> Self {
        Self::build("http://127.0.0.1:9".to_string(), None).await
    }

    async fn build(
        gateway_base_url: String,
        provider_task: Option<tokio::task::JoinHandle<()>>,
    ) -> Self {
        let db_dir = tempfile::tempdir().expect("create temp dir for test database");
        let db_path = db_dir.path().join("storefront_test.db");

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            "127.0.0.1",
            18_080,
            "test",
            ADMIN_TOKEN,
            gateway_base_url,
            "merchant-042",
            GATEWAY_SECRET,
            CALLBACK_TOKEN,
            "http://127.0.0.1:18080",
        );
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.gateway_timeout_secs = 1;

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("create test database");
        db::run_migrations(&pool).await.expect("run migrations");

        let db = Arc::new(pool);
        let config = Arc::new(cfg);

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = Arc::new(EventSender::new(event_tx));

        let notices = Arc::new(RecordingNotifier::default());
        let notifier: Arc<dyn Notifier> = notices.clone();
        let event_task = tokio::spawn(events::process_events(event_rx, db.clone(), notifier));

        let state = Arc::new(
            AppState::new(db, config, event_sender).expect("assemble application state"),
        );
        let router = storefront_api::app_router(state.clone());

        Self {
            router,
            state,
            notices,
            _event_task: event_task,
            _provider_task: provider_task,
            _db_dir: db_dir,
        }
    }

    /// Sends a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    pub async fn request_public(&self, method: Method, uri: &str, body: Option<Value>) -> Response {
        self.request(method, uri, body, None).await
    }

    pub async fn request_admin(&self, method: Method, uri: &str, body: Option<Value>) -> Response {
        self.request(method, uri, body, Some(ADMIN_TOKEN)).await
    }

    /// Provider webhook with the shared callback token.
    pub async fn post_callback(&self, body: Value) -> Response {
        self.request(
            Method::POST,
            "/api/v1/payments/callback",
            Some(body),
            Some(CALLBACK_TOKEN),
        )
        .await
    }

    /// Gives the spawned event loop time to drain and notify.
    pub async fn settle_events(&self) {
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    }

    pub async fn seed_product(&self, name: &str, price: Decimal, stock: i32) -> product::Model {
        self.seed_product_priced(name, price, price, stock).await
    }

    pub async fn seed_product_priced(
        &self,
        name: &str,
        price_usd: Decimal,
        price_eur: Decimal,
        stock: i32,
    ) -> product::Model {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            price_usd: Set(price_usd),
            price_eur: Set(price_eur),
            stock: Set(stock),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed product")
    }

    pub async fn seed_bundle(&self, name: &str, price: Decimal, stock: i32) -> bundle::Model {
        let now = Utc::now();
        bundle::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            price_usd: Set(price),
            price_eur: Set(price),
            stock: Set(stock),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed bundle")
    }

    pub async fn product_stock(&self, id: Uuid) -> i32 {
        product::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("query product")
            .expect("product exists")
            .stock
    }

    pub async fn bundle_stock(&self, id: Uuid) -> i32 {
        bundle::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("query bundle")
            .expect("bundle exists")
            .stock
    }

    pub async fn set_product(&self, id: Uuid, stock: Option<i32>, is_active: Option<bool>) {
        let mut update = product::Entity::update_many();
        if let Some(stock) = stock {
            update = update.col_expr(product::Column::Stock, Expr::value(stock));
        }
        if let Some(active) = is_active {
            update = update.col_expr(product::Column::IsActive, Expr::value(active));
        }
        update
            .filter(product::Column::Id.eq(id))
            .exec(&*self.state.db)
            .await
            .expect("update product");
    }

    pub async fn order_row(&self, id: Uuid) -> order::Model {
        self.state
            .services
            .orders
            .get(id)
            .await
            .expect("order exists")
    }

    /// Creates a cart holding one product line and returns its token.
    pub async fn cart_with_product(&self, item_id: Uuid, quantity: i32) -> String {
        let response = self
            .request_public(Method::POST, "/api/v1/carts", None)
            .await;
        assert_eq!(response.status(), 201, "cart creation failed");
        let cart = response_json(response).await;
        let token = cart["token"].as_str().expect("cart token").to_string();

        let response = self
            .request_public(
                Method::POST,
                &format!("/api/v1/carts/{}/items", token),
                Some(json!({ "item_id": item_id, "quantity": quantity })),
            )
            .await;
        assert_eq!(response.status(), 200, "adding the cart line failed");

        token
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
        if let Some(task) = &self._provider_task {
            task.abort();
        }
    }
}

/// Minimal hosted-payment provider: accepts every initiation and hands back
/// a session URL derived from the reference.
async fn spawn_provider_stub() -> (String, tokio::task::JoinHandle<()>) {
    let app = Router::new().route(
        "/payments",
        post(|Json(body): Json<Value>| async move {
            let reference = body["reference"].as_str().unwrap_or_default().to_string();
            Json(json!({
                "payment_url": format!("https://pay.example.test/session/{}", reference),
            }))
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind provider stub");
    let base_url = format!("http://{}", listener.local_addr().expect("provider stub addr"));
    let task = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    (base_url, task)
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response body")
}

pub fn checkout_payload(cart_token: &str, payment_method: &str) -> Value {
    json!({
        "cart_token": cart_token,
        "email": "shopper@example.test",
        "name": "Sam Shopper",
        "shipping_address": "1 Harbor Way, Testville",
        "payment_method": payment_method,
        "currency": "USD",
    })
}
