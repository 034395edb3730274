//! End-to-end fetch flow tests against a scripted transport.
//!
//! No network: every scenario drives the retry state machine with canned
//! responses and a manually advanced clock.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method};
use url::Url;

use gravy_fetch::{
    FetchError, FetchRequest, FetchTransport, Feature, Identity, IdentityConfig, ManualClock,
    Outcome, RawResponse, ResilientFetcher, ScraperConfig, TransportFailure, TransportKind,
};

enum Step {
    Respond(u16, &'static str),
    Fail(TransportFailure),
}

/// Transport that replays scripted steps per identity and records which
/// identities were used, in order.
struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    defaults: Mutex<HashMap<String, (u16, &'static str)>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            defaults: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn script(&self, identity: &str, step: Step) {
        self.scripts
            .lock()
            .unwrap()
            .entry(identity.to_string())
            .or_default()
            .push_back(step);
    }

    fn always(&self, identity: &str, status: u16, body: &'static str) {
        self.defaults
            .lock()
            .unwrap()
            .insert(identity.to_string(), (status, body));
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl FetchTransport for ScriptedTransport {
    async fn execute(
        &self,
        identity: &Identity,
        _method: &Method,
        url: &Url,
        _headers: &HashMap<String, String>,
        _timeout: Duration,
    ) -> Result<RawResponse, TransportFailure> {
        self.calls.lock().unwrap().push(identity.id.clone());

        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&identity.id)
            .and_then(VecDeque::pop_front);

        let (status, body) = match step {
            Some(Step::Respond(status, body)) => (status, body),
            Some(Step::Fail(failure)) => return Err(failure),
            None => self
                .defaults
                .lock()
                .unwrap()
                .get(&identity.id)
                .copied()
                .unwrap_or((200, "ok")),
        };

        Ok(RawResponse {
            status,
            headers: HeaderMap::new(),
            body: Bytes::from_static(body.as_bytes()),
            url: url.clone(),
        })
    }
}

struct Harness {
    fetcher: ResilientFetcher,
    transport: Arc<ScriptedTransport>,
    clock: Arc<ManualClock>,
    _dir: tempfile::TempDir,
}

fn identity_entry(id: &str, transport: TransportKind) -> IdentityConfig {
    IdentityConfig {
        id: id.into(),
        transport,
        endpoint: matches!(transport, TransportKind::LocalSocks)
            .then(|| "socks5://127.0.0.1:8080".to_string()),
        service: None,
        country: None,
    }
}

fn harness(identities: Vec<IdentityConfig>, max_retries: u32, license_key: &str) -> Harness {
    let mut config = ScraperConfig::default();
    config.identities = identities;
    config.rotation.request_delay_min_secs = 0.0;
    config.rotation.request_delay_max_secs = 0.0;
    config.rotation.max_retries = max_retries;
    config.license_key = (!license_key.is_empty()).then(|| license_key.to_string());

    let dir = tempfile::tempdir().expect("temp dir");
    let transport = ScriptedTransport::new();
    let clock = Arc::new(ManualClock::new());

    let fetcher = ResilientFetcher::builder()
        .with_config(config)
        .with_transport(transport.clone())
        .with_clock(clock.clone())
        .with_cache_path(dir.path().join("fetch-cache.redb"))
        .build()
        .expect("fetcher builds");

    Harness {
        fetcher,
        transport,
        clock,
        _dir: dir,
    }
}

fn target() -> FetchRequest {
    FetchRequest::get(Url::parse("https://remoteok.com/remote-dev-jobs").unwrap())
}

#[tokio::test]
async fn live_success_is_cached_and_not_stale() {
    let h = harness(
        vec![identity_entry("direct", TransportKind::Direct)],
        3,
        "",
    );
    h.transport.always("direct", 200, "<html>42 jobs</html>");

    let response = h.fetcher.fetch(target()).await.expect("success");
    assert_eq!(response.status, 200);
    assert!(!response.stale);
    assert_eq!(response.identity.as_deref(), Some("direct"));

    // The payload is now served from cache without touching the network.
    let cached = h.fetcher.fetch(target()).await.expect("cache hit");
    assert!(!cached.stale);
    assert_eq!(cached.identity, None);
    assert_eq!(cached.body, response.body);
    assert_eq!(h.transport.calls().len(), 1);
}

#[tokio::test]
async fn rate_limited_proxy_accumulates_backoff_and_direct_serves() {
    let h = harness(
        vec![
            identity_entry("proxy-a", TransportKind::LocalSocks),
            identity_entry("direct", TransportKind::Direct),
        ],
        3,
        "",
    );
    h.transport.always("proxy-a", 429, "rate limited");
    h.transport.always("direct", 200, "<html>jobs</html>");

    // Three rounds; between rounds the clock moves past proxy-a's window so
    // it is retried and fails again. Every round is ultimately served by
    // the direct connection.
    for round in 0..3u32 {
        let response = h
            .fetcher
            .fetch(target().force_fresh())
            .await
            .expect("served via direct");
        assert_eq!(response.identity.as_deref(), Some("direct"), "round {round}");
        assert!(!response.stale);
        h.clock.advance(Duration::from_secs(120));
    }

    let state = h.fetcher.backoff().snapshot("proxy-a");
    assert_eq!(state.consecutive_failures, 3);
    assert_eq!(h.fetcher.backoff().snapshot("direct").consecutive_failures, 0);
}

#[tokio::test]
async fn blocked_page_on_http_200_rotates_identity() {
    let h = harness(
        vec![
            identity_entry("proxy-a", TransportKind::LocalSocks),
            identity_entry("direct", TransportKind::Direct),
        ],
        3,
        "",
    );
    h.transport.script(
        "proxy-a",
        Step::Respond(200, "<html>Please verify you are a human</html>"),
    );
    h.transport.always("direct", 200, "<html>listings</html>");

    let response = h.fetcher.fetch(target()).await.expect("rotated to direct");
    assert_eq!(response.identity.as_deref(), Some("direct"));
    assert_eq!(response.text(), "<html>listings</html>");
    assert_eq!(
        h.fetcher.backoff().snapshot("proxy-a").consecutive_failures,
        1
    );
}

#[tokio::test]
async fn transport_errors_are_retried_without_exponential_growth() {
    let h = harness(
        vec![
            identity_entry("proxy-a", TransportKind::LocalSocks),
            identity_entry("direct", TransportKind::Direct),
        ],
        3,
        "",
    );
    h.transport.script(
        "proxy-a",
        Step::Fail(TransportFailure::Connect("connection reset".into())),
    );
    h.transport.always("direct", 200, "ok");

    let response = h.fetcher.fetch(target()).await.expect("retried");
    assert_eq!(response.identity.as_deref(), Some("direct"));
    let state = h.fetcher.backoff().snapshot("proxy-a");
    assert_eq!(state.consecutive_failures, 1);
}

#[tokio::test]
async fn exhausted_identities_with_fresh_cache_return_not_stale() {
    let h = harness(
        vec![identity_entry("direct", TransportKind::Direct)],
        3,
        "",
    );
    h.transport.script("direct", Step::Respond(200, "fresh payload"));

    // Seed the cache, then take the only identity out of rotation.
    h.fetcher.fetch(target()).await.expect("seed cache");
    h.fetcher.backoff().record("direct", Outcome::RateLimited);

    let response = h.fetcher.fetch(target()).await.expect("fresh cache hit");
    assert!(!response.stale);
    assert_eq!(response.text(), "fresh payload");
    assert_eq!(h.transport.calls().len(), 1, "no live attempt was made");
}

#[tokio::test]
async fn stale_cache_serves_when_retries_run_out() {
    let h = harness(
        vec![identity_entry("direct", TransportKind::Direct)],
        2,
        "",
    );
    h.transport.script("direct", Step::Respond(200, "yesterday's jobs"));

    h.fetcher.fetch(target()).await.expect("seed cache");
    h.transport.always("direct", 429, "rate limited");

    // Force a live attempt; it fails, the identity backs off past the
    // deadline, and the cached payload is served flagged stale.
    let response = h
        .fetcher
        .fetch(
            target()
                .force_fresh()
                .with_deadline(Duration::from_secs(1)),
        )
        .await
        .expect("stale fallback");
    assert!(response.stale);
    assert_eq!(response.identity, None);
    assert_eq!(response.text(), "yesterday's jobs");
}

#[tokio::test]
async fn fetch_failed_names_last_classification() {
    let h = harness(
        vec![identity_entry("direct", TransportKind::Direct)],
        2,
        "",
    );
    h.transport.always("direct", 429, "rate limited");

    let err = h
        .fetcher
        .fetch(target().with_deadline(Duration::from_secs(1)))
        .await
        .expect_err("no fallback available");
    match err {
        FetchError::Failed { attempts, last } => {
            assert!(attempts >= 1);
            assert_eq!(last, Outcome::RateLimited);
        }
        other => panic!("expected Failed, got {other:?}"),
    }
}

#[tokio::test]
async fn deadline_with_no_eligible_identity_surfaces_no_identity() {
    let h = harness(
        vec![identity_entry("direct", TransportKind::Direct)],
        3,
        "",
    );
    h.fetcher.backoff().record("direct", Outcome::Blocked);

    let err = h
        .fetcher
        .fetch(target().with_deadline(Duration::from_secs(1)))
        .await
        .expect_err("nothing eligible, nothing cached");
    assert!(matches!(err, FetchError::NoIdentityAvailable));
    assert!(h.transport.calls().is_empty());
}

#[tokio::test]
async fn unlicensed_run_never_touches_commercial_identities() {
    let mut config = ScraperConfig::default();
    config.identities = vec![
        identity_entry("direct", TransportKind::Direct),
        IdentityConfig {
            id: "bright-us".into(),
            transport: TransportKind::CommercialProxy,
            endpoint: None,
            service: Some("brightdata".into()),
            country: Some("us".into()),
        },
    ];
    config.proxy_services.insert(
        "brightdata".into(),
        gravy_fetch::ProxyServiceConfig {
            username: "gravy".into(),
            password: "secret".into(),
            ..Default::default()
        },
    );
    config.rotation.request_delay_min_secs = 0.0;
    config.rotation.request_delay_max_secs = 0.0;

    let dir = tempfile::tempdir().expect("temp dir");
    let transport = ScriptedTransport::new();
    let fetcher = ResilientFetcher::builder()
        .with_config(config)
        .with_transport(transport.clone())
        .with_cache_path(dir.path().join("fetch-cache.redb"))
        .build()
        .expect("fetcher builds");

    assert!(!fetcher.license().has_feature(Feature::CommercialProxies));

    for _ in 0..4 {
        let response = fetcher
            .fetch(target().force_fresh())
            .await
            .expect("direct serves");
        assert_eq!(response.identity.as_deref(), Some("direct"));
    }
    assert!(transport.calls().iter().all(|id| id == "direct"));
}

#[tokio::test]
async fn trial_license_unlocks_commercial_identities() {
    let h = harness(
        vec![identity_entry("direct", TransportKind::Direct)],
        3,
        "TEST-GRAVY-JOBS-12345",
    );
    let report = h.fetcher.capability_report();
    assert!(report.valid);
    assert!(
        report
            .enabled_features
            .contains(&"commercial-proxies".to_string())
    );
    let until = report.valid_until.expect("trial window");
    assert_eq!((until - h.clock.utc_now()).num_days(), 30);
}
