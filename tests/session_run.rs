use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use trafficscraper_rs::{
    BodyFetcher, CaptureConfig, DriverError, ExchangeId, ExtractionSession, FetchError,
    FetchedBody, NavigationDriver, NetworkEvent, SessionError, write_records_json,
};

/// Emits the traffic a product page would produce when "navigated".
struct ScriptedBrowser {
    events: mpsc::Sender<NetworkEvent>,
    bodies: Arc<Mutex<HashMap<String, FetchedBody>>>,
    next_id: u32,
}

impl ScriptedBrowser {
    async fn emit(&self, method: &str, params: serde_json::Value) {
        if let Some(event) = NetworkEvent::from_cdp(method, params).unwrap() {
            self.events.send(event).await.unwrap();
        }
    }
}

#[async_trait]
impl NavigationDriver for ScriptedBrowser {
    async fn navigate(&mut self, url: &str) -> Result<(), DriverError> {
        let Some(item) = url.rsplit('/').next().and_then(|s| s.parse::<u64>().ok()) else {
            return Err(DriverError::new(format!("not a product page: {url}")));
        };

        self.next_id += 1;
        let asset = format!("{}.asset", self.next_id);
        self.emit("Network.requestWillBeSent", json!({"requestId": asset, "request": {"url": "https://shopee.tw/main.js"}}))
            .await;
        self.emit("Network.loadingFinished", json!({"requestId": asset})).await;

        self.next_id += 1;
        let api = self.next_id.to_string();
        let api_url = format!("https://shopee.tw/api/v4/pdp/get_pc?itemid={item}");
        self.bodies.lock().unwrap().insert(
            api.clone(),
            FetchedBody::plain(
                json!({"item": {"itemid": item, "shopid": 1, "name": format!("商品 {item}"), "stock": 3}})
                    .to_string(),
            ),
        );
        self.emit("Network.requestWillBeSent", json!({"requestId": api, "request": {"url": api_url}}))
            .await;
        self.emit("Network.dataReceived", json!({"requestId": api})).await;
        // Finish arrives before the response headers.
        self.emit("Network.loadingFinished", json!({"requestId": api})).await;
        self.emit("Network.responseReceived", json!({"requestId": api, "response": {"status": 200}}))
            .await;
        // Page load time; the capture loop runs meanwhile.
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(())
    }
}

struct SharedBodies(Arc<Mutex<HashMap<String, FetchedBody>>>);

#[async_trait]
impl BodyFetcher for SharedBodies {
    async fn fetch_body(&self, id: &ExchangeId) -> Result<FetchedBody, FetchError> {
        self.0
            .lock()
            .unwrap()
            .remove(id.as_str())
            .ok_or_else(|| FetchError::Evicted(id.clone()))
    }
}

#[tokio::test]
async fn session_collects_records_per_page_and_skips_bad_pages() {
    let (events_tx, events_rx) = mpsc::channel(64);
    let bodies = Arc::new(Mutex::new(HashMap::new()));
    let browser = ScriptedBrowser {
        events: events_tx,
        bodies: bodies.clone(),
        next_id: 0,
    };

    let config = CaptureConfig::from_json_str(r#"{"settle_ms": 0, "settle_jitter_ms": 20}"#).unwrap();
    let mut session = ExtractionSession::<ScriptedBrowser>::builder()
        .with_config(config)
        .build_protocol_push(browser, SharedBodies(bodies), events_rx)
        .unwrap();

    let records = session
        .run([
            "https://shopee.tw/product/1/100",
            "https://shopee.tw/search?keyword=bottle",
            "https://shopee.tw/product/1/200",
        ])
        .await
        .unwrap();
    let trailing = session.metrics().unwrap();
    let rest = session.shutdown().await.unwrap();

    let mut ids: Vec<u64> = records
        .iter()
        .chain(rest.iter())
        .filter_map(|r| r.product_id)
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![100, 200]);

    let first = records
        .iter()
        .chain(rest.iter())
        .find(|r| r.product_id == Some(100))
        .unwrap();
    assert_eq!(first.name.as_deref(), Some("商品 100"));
    assert_eq!(first.stock, Some(3));
    assert_eq!(first.rating_star, None);
    assert_eq!(
        first.source_url.as_deref(),
        Some("https://shopee.tw/api/v4/pdp/get_pc?itemid=100")
    );

    // Two pages with an asset and an API call each; only the API calls match.
    assert_eq!(trailing.global.exchanges_finished, 4);
    assert_eq!(trailing.global.exchanges_matched, 2);
    // Each late response lands after its exchange already left the table.
    assert_eq!(trailing.global.protocol_violations, 2);
    assert_eq!(trailing.global.fetch_failures, 0);
}

#[tokio::test]
async fn records_round_trip_through_json_file() {
    let (events_tx, events_rx) = mpsc::channel(64);
    let bodies = Arc::new(Mutex::new(HashMap::new()));
    let browser = ScriptedBrowser {
        events: events_tx,
        bodies: bodies.clone(),
        next_id: 0,
    };
    let mut session = ExtractionSession::<ScriptedBrowser>::builder()
        .with_settle(Duration::ZERO, Duration::ZERO)
        .disable_metrics()
        .build_protocol_push(browser, SharedBodies(bodies), events_rx)
        .unwrap();
    assert!(session.metrics().is_none());

    let mut records = session.run(["https://shopee.tw/product/1/7"]).await.unwrap();
    records.extend(session.shutdown().await.unwrap());

    let path = std::env::temp_dir().join(format!("session-run-{}.json", std::process::id()));
    write_records_json(&path, &records).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::remove_file(&path).ok();

    let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed[0]["productId"], 7);
    assert_eq!(parsed[0]["name"], "商品 7");
    assert!(parsed[0]["price"].is_null());
    assert!(parsed[0]["extractedAt"].is_string());
}

#[tokio::test]
async fn invalid_endpoint_pattern_is_a_config_error() {
    let (_events_tx, events_rx) = mpsc::channel(1);
    let result = ExtractionSession::<ScriptedBrowser>::builder()
        .with_endpoint_patterns(["pdp/get_pc("])
        .build_protocol_push(
            ScriptedBrowser {
                events: mpsc::channel(1).0,
                bodies: Arc::default(),
                next_id: 0,
            },
            SharedBodies(Arc::default()),
            events_rx,
        );
    assert!(matches!(result, Err(SessionError::Config(_))));
}
