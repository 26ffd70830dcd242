use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::{rngs::SmallRng, SeedableRng};
use reqwest::{header::CONTENT_TYPE, Method};
use serde_json::Value;

use crate::{
    error::{ClientError, Result},
    observer::{Notice, SessionObserver},
    order::OrderRequest,
    utils::request_id,
};

#[derive(Debug, Clone)]
pub struct CallOptions {
    pub method: Method,
    pub body: Option<Value>,
}

impl CallOptions {
    pub fn get() -> Self {
        Self { method: Method::GET, body: None }
    }

    pub fn post() -> Self {
        Self { method: Method::POST, body: None }
    }

    pub fn post_json(body: Value) -> Self {
        Self { method: Method::POST, body: Some(body) }
    }
}

#[derive(Debug, Clone)]
struct PendingRequest {
    endpoint: String,
    started: Instant,
}

#[derive(Clone)]
struct PendingRequests {
    table: Arc<Mutex<HashMap<String, PendingRequest>>>,
    rng: Arc<Mutex<SmallRng>>,
}

struct PendingGuard {
    table: Arc<Mutex<HashMap<String, PendingRequest>>>,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Some(p) = self.table.lock().remove(&self.id) {
            log::debug!(
                "api.pending.done request_id={} endpoint={} elapsed_ms={}",
                self.id,
                p.endpoint,
                p.started.elapsed().as_millis()
            );
        }
    }
}

impl PendingRequests {
    fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            rng: Arc::new(Mutex::new(SmallRng::seed_from_u64(rand::random()))),
        }
    }

    fn register(&self, endpoint: &str) -> PendingGuard {
        let mut table = self.table.lock();
        let mut rng = self.rng.lock();
        let id = loop {
            let id = request_id(&mut *rng);
            if !table.contains_key(&id) {
                break id;
            }
        };
        table.insert(
            id.clone(),
            PendingRequest { endpoint: endpoint.to_string(), started: Instant::now() },
        );
        PendingGuard { table: self.table.clone(), id }
    }

    fn len(&self) -> usize {
        self.table.lock().len()
    }
}

#[derive(Clone)]
pub struct RequestGateway {
    http: reqwest::Client,
    base: String,
    observer: Arc<dyn SessionObserver>,
    pending: PendingRequests,
}

impl RequestGateway {
    pub fn new(base: &str, timeout: Duration, observer: Arc<dyn SessionObserver>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("tradedesk/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Transport { message: format!("http client: {e}") })?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            observer,
            pending: PendingRequests::new(),
        })
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub async fn call(&self, endpoint: &str, opts: CallOptions) -> Result<Value> {
        let res = self.execute(endpoint, opts).await.and_then(|body| {
            if body.iter().all(u8::is_ascii_whitespace) {
                return Ok(Value::Null);
            }
            Ok(serde_json::from_slice::<Value>(&body)?)
        });
        self.report(endpoint, res.as_ref().map(|_| ()));
        res
    }

    pub async fn call_bytes(&self, endpoint: &str, opts: CallOptions) -> Result<Vec<u8>> {
        let res = self.execute(endpoint, opts).await;
        self.report(endpoint, res.as_ref().map(|_| ()));
        res
    }

    async fn execute(&self, endpoint: &str, opts: CallOptions) -> Result<Vec<u8>> {
        let guard = self.pending.register(endpoint);
        let url = format!("{}{}", self.base, endpoint);
        log::info!("api.request method={} endpoint={} request_id={}", opts.method, endpoint, guard.id);

        let mut req = self
            .http
            .request(opts.method, &url)
            .header(CONTENT_TYPE, "application/json")
            .header("X-Request-Id", guard.id.as_str());
        if let Some(body) = &opts.body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ClientError::Http {
                code: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("").to_string(),
            });
        }
        let body = resp.bytes().await?;
        Ok(body.to_vec())
    }

    fn report(&self, endpoint: &str, outcome: std::result::Result<(), &ClientError>) {
        match outcome {
            Ok(()) => log::info!("api.response endpoint={} ok", endpoint),
            Err(e) => {
                log::error!("api.error endpoint={} kind={} {}", endpoint, e.kind(), e);
                self.observer.on_notice(&Notice::error(format!("API Error: {e}")));
            }
        }
        self.observer.on_call_result(endpoint, outcome);
    }

    pub async fn account_info(&self) -> Result<Value> {
        self.call("/api/account/info", CallOptions::get()).await
    }

    pub async fn positions(&self) -> Result<Value> {
        self.call("/api/account/positions", CallOptions::get()).await
    }

    pub async fn order_history(&self, limit: usize) -> Result<Value> {
        self.call(&format!("/api/orders/history?limit={limit}"), CallOptions::get()).await
    }

    pub async fn place_order(&self, order: &OrderRequest) -> Result<Value> {
        let body = serde_json::to_value(order)?;
        self.call("/api/orders/place", CallOptions::post_json(body)).await
    }

    pub async fn close_all_positions(&self) -> Result<Value> {
        self.call("/api/account/positions/close-all", CallOptions::post()).await
    }

    pub async fn cancel_all_orders(&self) -> Result<Value> {
        self.call("/api/orders/cancel-all", CallOptions::post()).await
    }

    pub async fn export_orders(&self) -> Result<Vec<u8>> {
        self.call_bytes("/api/orders/export", CallOptions::get()).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_json, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::observer::{testing::RecordingObserver, NoticeLevel};
    use crate::order::{OrderType, Side};

    fn gateway(base: &str, timeout_ms: u64) -> (RequestGateway, Arc<RecordingObserver>) {
        let obs = Arc::new(RecordingObserver::default());
        let gw = RequestGateway::new(base, Duration::from_millis(timeout_ms), obs.clone()).unwrap();
        (gw, obs)
    }

    #[tokio::test]
    async fn success_returns_body_and_notifies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/account/info"))
            .and(header_exists("x-request-id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "balances": [{"currency": "USD", "total": 25000.0}]
            })))
            .mount(&server)
            .await;

        let (gw, obs) = gateway(&server.uri(), 5_000);
        let body = gw.account_info().await.unwrap();
        assert_eq!(body["balances"][0]["total"], 25000.0);
        assert_eq!(*obs.calls.lock(), vec![("/api/account/info".to_string(), None)]);
        assert!(obs.notices.lock().is_empty());
        assert_eq!(gw.pending_count(), 0);
    }

    #[tokio::test]
    async fn non_2xx_is_http_error_with_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/orders/cancel-all"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let (gw, obs) = gateway(&server.uri(), 5_000);
        let err = gw.cancel_all_orders().await.unwrap_err();
        assert_eq!(
            err,
            ClientError::Http { code: 503, status_text: "Service Unavailable".to_string() }
        );
        assert_eq!(
            obs.notices_at(NoticeLevel::Error),
            vec!["API Error: HTTP 503: Service Unavailable"]
        );
        assert_eq!(
            *obs.calls.lock(),
            vec![("/api/orders/cancel-all".to_string(), Some("http".to_string()))]
        );
    }

    #[tokio::test]
    async fn unreachable_backend_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (gw, obs) = gateway(&format!("http://{addr}"), 2_000);
        let err = gw.positions().await.unwrap_err();
        assert_eq!(err.kind(), "transport");
        assert_eq!(obs.calls.lock().len(), 1);
        assert_eq!(gw.pending_count(), 0);
    }

    #[tokio::test]
    async fn slow_backend_times_out_as_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/account/positions"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let (gw, _obs) = gateway(&server.uri(), 100);
        let err = gw.positions().await.unwrap_err();
        let ClientError::Transport { message } = err else { panic!("expected transport error") };
        assert!(message.contains("timed out"), "{message}");
        assert_eq!(gw.pending_count(), 0);
    }

    #[tokio::test]
    async fn empty_and_malformed_bodies() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/account/positions/close-all"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/account/positions"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let (gw, _obs) = gateway(&server.uri(), 5_000);
        assert_eq!(gw.close_all_positions().await.unwrap(), Value::Null);
        assert_eq!(gw.positions().await.unwrap_err().kind(), "parse");
    }

    #[tokio::test]
    async fn place_order_posts_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/orders/place"))
            .and(body_json(json!({
                "symbol": "MES",
                "side": "sell",
                "order_type": "limit",
                "quantity": 2,
                "price": 4210.25,
                "stop_price": null
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"order_id": "X9"})))
            .expect(1)
            .mount(&server)
            .await;

        let (gw, _obs) = gateway(&server.uri(), 5_000);
        let order = OrderRequest {
            symbol: "MES".to_string(),
            side: Side::Sell,
            order_type: OrderType::Limit,
            quantity: 2,
            price: Some(4210.25),
            stop_price: None,
        };
        assert_eq!(gw.place_order(&order).await.unwrap()["order_id"], "X9");
    }

    #[tokio::test]
    async fn history_limit_and_csv_export() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/orders/history"))
            .and(query_param("limit", "10"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/orders/export"))
            .respond_with(ResponseTemplate::new(200).set_body_string("id,symbol\n1,MES\n"))
            .mount(&server)
            .await;

        let (gw, _obs) = gateway(&server.uri(), 5_000);
        assert_eq!(gw.order_history(10).await.unwrap(), json!([]));
        assert_eq!(gw.export_orders().await.unwrap(), b"id,symbol\n1,MES\n".to_vec());
    }

    #[test]
    fn pending_ids_are_unique_and_released() {
        let pending = PendingRequests::new();
        let a = pending.register("/a");
        let b = pending.register("/b");
        assert_ne!(a.id, b.id);
        assert_eq!(pending.len(), 2);
        drop(a);
        assert_eq!(pending.len(), 1);
        drop(b);
        assert_eq!(pending.len(), 0);
    }
}
