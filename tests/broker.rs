//! End-to-end coverage of the broker's retry-then-succeed path (spec §8
//! scenario 5) and the "one descendant's failure skips the rest" rule,
//! using a real `tokio` runtime rather than a mocked executor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use pip_sandbox::broker::{Broker, EventSignaler};
use pip_sandbox::injector::{AlwaysFailingInjector, FlakyInjector, InjectionPayload};
use pip_sandbox::NullLogSink;

struct RecordingSignaler {
    signaled: Mutex<Vec<String>>,
}

impl RecordingSignaler {
    fn new() -> Self {
        RecordingSignaler {
            signaled: Mutex::new(Vec::new()),
        }
    }
}

impl EventSignaler for RecordingSignaler {
    fn try_signal(&self, event_name: &str) -> std::io::Result<bool> {
        self.signaled.lock().unwrap().push(event_name.to_string());
        Ok(true)
    }
}

#[tokio::test]
async fn retries_until_the_flaky_injector_succeeds_then_signals_success() {
    let signaler = Arc::new(RecordingSignaler::new());
    let broker = Broker::new(
        Arc::new(FlakyInjector::new(2)),
        signaler.clone(),
        Arc::new(NullLogSink),
    );

    broker
        .handle_request("ok-event,fail-event,true,0x2a", &InjectionPayload::default())
        .await;

    let outcome = broker.stop();
    assert!(!outcome.has_detours_failures);
    assert_eq!(signaler.signaled.lock().unwrap().as_slice(), ["ok-event"]);
}

#[tokio::test]
async fn a_failed_injection_marks_the_broker_failed_and_subsequent_requests_are_skipped() {
    let signaler = Arc::new(RecordingSignaler::new());
    let attempts = Arc::new(AtomicUsize::new(0));

    struct CountingAlwaysFails {
        attempts: Arc<AtomicUsize>,
        inner: AlwaysFailingInjector,
    }
    impl pip_sandbox::injector::ProcessInjector for CountingAlwaysFails {
        fn inject(
            &self,
            target_pid: u32,
            payload: &InjectionPayload,
        ) -> Result<(), pip_sandbox::injector::InjectorError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.inner.inject(target_pid, payload)
        }
    }

    let broker = Broker::new(
        Arc::new(CountingAlwaysFails {
            attempts: attempts.clone(),
            inner: AlwaysFailingInjector,
        }),
        signaler.clone(),
        Arc::new(NullLogSink),
    );

    broker
        .handle_request("ok-1,fail-1,true,0x1", &InjectionPayload::default())
        .await;
    broker
        .handle_request("ok-2,fail-2,true,0x2", &InjectionPayload::default())
        .await;

    let outcome = broker.stop();
    assert!(outcome.has_detours_failures);
    assert_eq!(outcome.failed_pids, vec![1]);
    // Second request never reached the injector: once failed, the broker
    // only signals the failure event for later requests.
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(
        signaler.signaled.lock().unwrap().as_slice(),
        ["fail-1", "fail-2"]
    );
}
