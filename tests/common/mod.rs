#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use webhook_relay::{Delivery, DeliveryId, DeliveryStatus, Dispatcher, DispatcherConfig};
use wiremock::{Request, Respond, ResponseTemplate};

/// Route engine logs through the test harness; filter with `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Engine config sized for tests: tiny pool, no jitter, no background
/// sweeping (tests drive the sweeper by hand where they need it).
pub fn fast_config() -> DispatcherConfig {
    init_tracing();
    DispatcherConfig {
        worker_count: 2,
        queue_size: 64,
        retry_jitter_ms: 0,
        sweep_interval: Duration::from_secs(3600),
        cleanup_retention: None,
        ..DispatcherConfig::default()
    }
}

/// Poll until the delivery reaches `status`, panicking after 10 s.
pub async fn wait_for_status(
    dispatcher: &Dispatcher,
    id: DeliveryId,
    status: DeliveryStatus,
) -> Delivery {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let delivery = dispatcher
            .delivery(id)
            .await
            .expect("store")
            .expect("delivery exists");
        if delivery.status == status {
            return delivery;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "delivery never reached {status}, last seen {}",
            delivery.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Responds with `status` for the first `failures` requests, then 200.
pub struct FailingResponder {
    failures: usize,
    status: u16,
    hits: Arc<AtomicUsize>,
}

impl FailingResponder {
    pub fn new(failures: usize, status: u16) -> Self {
        Self {
            failures,
            status,
            hits: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn hits(&self) -> Arc<AtomicUsize> {
        self.hits.clone()
    }
}

impl Respond for FailingResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.hits.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            ResponseTemplate::new(self.status)
        } else {
            ResponseTemplate::new(200)
        }
    }
}
