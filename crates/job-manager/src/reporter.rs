//! Best-effort delivery of job status notifications to subscriber webhooks.
//!
//! A [CallbackReporter] holds at most one pending notification. Reporting again before the
//! pending one was sent replaces it, so a subscriber sees the latest state of the job but may
//! miss intermediate ones. A background thread takes the pending notification on every poll
//! interval and POSTs it as JSON. Delivery failures are logged and never retried.
//!
//! Reporting doesn't wake the thread; only closing does. A notification therefore waits up to
//! one poll interval, plus any POST still in flight, before it is sent, and every report
//! made within that window collapses into the last one. Lower
//! [poll_interval_ms](ReporterConfig::poll_interval_ms) for quicker delivery at the cost of
//! less coalescing.

use std::{sync::Arc, thread::JoinHandle, time::Duration};

use error_stack::{Report, ResultExt};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{event, Level};
use url::Url;

#[derive(Error, Debug)]
pub enum ReporterError {
    #[error("failed to start the callback reporter thread")]
    Spawn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    /// How often the background thread checks for a pending notification.
    pub poll_interval_ms: u64,
    /// The timeout for a single webhook request.
    pub request_timeout_ms: u64,
    /// How long [CallbackReporter::stop] waits for the background thread to exit.
    pub stop_timeout_ms: u64,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            request_timeout_ms: 5_000,
            stop_timeout_ms: 10_000,
        }
    }
}

impl ReporterConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[derive(Default)]
struct Slot {
    pending: Option<(Url, Value)>,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    slot: Mutex<Slot>,
    wake: Condvar,
}

/// Posts the most recent reported payload to its URL from a background thread.
pub struct CallbackReporter {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    /// Disconnects or receives a value when the background thread exits.
    exited: flume::Receiver<()>,
    stop_timeout: Duration,
}

impl std::fmt::Debug for CallbackReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackReporter")
            .field("stop_timeout", &self.stop_timeout)
            .finish_non_exhaustive()
    }
}

impl CallbackReporter {
    /// Start a reporter and its background thread.
    pub fn new(config: &ReporterConfig) -> Result<Self, Report<ReporterError>> {
        let shared = Arc::new(Shared::default());
        let (exited_tx, exited_rx) = flume::bounded(1);

        let thread = std::thread::Builder::new()
            .name("callback-reporter".to_string())
            .spawn({
                let shared = shared.clone();
                let config = config.clone();
                move || {
                    deliver_loop(&shared, &config);
                    exited_tx.send(()).ok();
                }
            })
            .change_context(ReporterError::Spawn)?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
            exited: exited_rx,
            stop_timeout: config.stop_timeout(),
        })
    }

    /// Set the payload to send next, replacing any payload that wasn't sent yet. It goes out
    /// on the background thread's next poll, or when the reporter is closed.
    pub fn report(&self, url: Url, data: Value) {
        let mut slot = self.shared.slot.lock();
        if slot.shutdown {
            event!(Level::DEBUG, %url, "Dropping callback reported after shutdown");
            return;
        }

        if let Some((replaced, _)) = slot.pending.replace((url, data)) {
            event!(Level::TRACE, url = %replaced, "Coalesced pending callback");
        }
    }

    /// Ask the background thread to exit without waiting for it. A pending payload is still
    /// delivered before it exits.
    pub fn close(&self) {
        let mut slot = self.shared.slot.lock();
        slot.shutdown = true;
        self.shared.wake.notify_all();
    }

    /// Close the reporter and wait for the background thread to deliver its pending payload
    /// and exit. If that takes longer than the configured stop timeout, the thread is left
    /// to finish on its own.
    pub fn stop(&self) {
        self.close();

        let Some(thread) = self.thread.lock().take() else {
            return;
        };

        match self.exited.recv_timeout(self.stop_timeout) {
            Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => {
                thread.join().ok();
            }
            Err(flume::RecvTimeoutError::Timeout) => {
                event!(
                    Level::WARN,
                    timeout = ?self.stop_timeout,
                    "Callback reporter did not stop in time, detaching it"
                );
            }
        }
    }
}

impl Drop for CallbackReporter {
    fn drop(&mut self) {
        self.close();
    }
}

fn deliver_loop(shared: &Shared, config: &ReporterConfig) {
    let client = match reqwest::blocking::Client::builder()
        .timeout(config.request_timeout())
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            event!(Level::ERROR, error = %e, "Failed to create callback HTTP client");
            return;
        }
    };

    loop {
        let (next, shutdown) = {
            let mut slot = shared.slot.lock();
            if !slot.shutdown {
                shared.wake.wait_for(&mut slot, config.poll_interval());
            }
            (slot.pending.take(), slot.shutdown)
        };

        match next {
            Some((url, payload)) => post(&client, &url, &payload),
            None if shutdown => break,
            None => {}
        }
    }
}

fn post(client: &reqwest::blocking::Client, url: &Url, payload: &Value) {
    let result = client
        .post(url.clone())
        .json(payload)
        .send()
        .and_then(|response| response.error_for_status());

    match result {
        Ok(response) => {
            event!(Level::DEBUG, %url, status = %response.status(), "Delivered callback");
        }
        Err(e) => {
            event!(Level::WARN, %url, error = %e, "Callback delivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;

    /// A poll interval long enough that nothing is sent until the reporter is stopped.
    fn idle_config() -> ReporterConfig {
        ReporterConfig {
            poll_interval_ms: 60_000,
            ..Default::default()
        }
    }

    fn fast_config() -> ReporterConfig {
        ReporterConfig {
            poll_interval_ms: 10,
            ..Default::default()
        }
    }

    fn wait_for_hits(mock: &httpmock::Mock, hits: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while mock.hits() < hits && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn coalesces_to_latest_payload() {
        crate::test_util::setup_test_tracing();
        let server = MockServer::start();
        let first = server.mock(|when, then| {
            when.method(POST).path("/status").json_body(json!({ "a": 1 }));
            then.status(200);
        });
        let second = server.mock(|when, then| {
            when.method(POST)
                .path("/status")
                .header("content-type", "application/json")
                .json_body(json!({ "a": 2 }));
            then.status(200);
        });

        let reporter = CallbackReporter::new(&idle_config()).unwrap();
        let url = Url::parse(&server.url("/status")).unwrap();
        reporter.report(url.clone(), json!({ "a": 1 }));
        reporter.report(url, json!({ "a": 2 }));
        reporter.stop();

        first.assert_hits(0);
        second.assert_hits(1);
    }

    #[test]
    fn delivers_on_poll_interval() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/progress");
            then.status(204);
        });

        let reporter = CallbackReporter::new(&fast_config()).unwrap();
        let url = Url::parse(&server.url("/progress")).unwrap();
        reporter.report(url.clone(), json!({ "progress": 10 }));
        wait_for_hits(&mock, 1);
        mock.assert_hits(1);

        reporter.report(url, json!({ "progress": 20 }));
        wait_for_hits(&mock, 2);
        mock.assert_hits(2);
        reporter.stop();
    }

    #[test]
    fn report_waits_for_next_poll() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/progress");
            then.status(204);
        });

        let reporter = CallbackReporter::new(&ReporterConfig {
            poll_interval_ms: 400,
            ..Default::default()
        })
        .unwrap();
        let url = Url::parse(&server.url("/progress")).unwrap();

        let reported = Instant::now();
        reporter.report(url, json!({ "progress": 10 }));
        std::thread::sleep(Duration::from_millis(50));
        mock.assert_hits(0);

        wait_for_hits(&mock, 1);
        mock.assert_hits(1);
        assert!(reported.elapsed() < Duration::from_secs(2));
        reporter.stop();
    }

    #[test]
    fn failed_delivery_is_not_retried() {
        let server = MockServer::start();
        let failing = server.mock(|when, then| {
            when.method(POST).path("/broken");
            then.status(500);
        });
        let working = server.mock(|when, then| {
            when.method(POST).path("/ok");
            then.status(200);
        });

        let reporter = CallbackReporter::new(&fast_config()).unwrap();
        reporter.report(Url::parse(&server.url("/broken")).unwrap(), json!({}));
        wait_for_hits(&failing, 1);

        reporter.report(Url::parse(&server.url("/ok")).unwrap(), json!({}));
        reporter.stop();

        failing.assert_hits(1);
        working.assert_hits(1);
    }

    #[test]
    fn unreachable_subscriber_is_swallowed() {
        let reporter = CallbackReporter::new(&ReporterConfig {
            request_timeout_ms: 500,
            ..idle_config()
        })
        .unwrap();
        reporter.report(Url::parse("http://127.0.0.1:1/status").unwrap(), json!({}));
        reporter.stop();
    }

    #[test]
    fn stop_is_bounded_by_timeout() {
        let server = MockServer::start();
        let slow = server.mock(|when, then| {
            when.method(POST).path("/slow");
            then.status(200).delay(Duration::from_secs(3));
        });

        let reporter = CallbackReporter::new(&ReporterConfig {
            poll_interval_ms: 10,
            request_timeout_ms: 10_000,
            stop_timeout_ms: 100,
        })
        .unwrap();
        reporter.report(Url::parse(&server.url("/slow")).unwrap(), json!({}));
        wait_for_hits(&slow, 1);

        let start = Instant::now();
        reporter.stop();
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn reports_after_close_are_dropped() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/late");
            then.status(200);
        });

        let reporter = CallbackReporter::new(&idle_config()).unwrap();
        reporter.stop();
        reporter.report(Url::parse(&server.url("/late")).unwrap(), json!({}));
        reporter.stop();
        mock.assert_hits(0);
    }
}
