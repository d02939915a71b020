//! Process-tree injector broker (spec §4.2).
//!
//! Descendants whose bitness or rights prevent the immediate parent from
//! injecting post a request on the control pipe; the broker reads it,
//! performs the injection (with retry), and signals the result back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::injector::{InjectionPayload, ProcessInjector};
use crate::logging::{Level, LogRecord, LogSink};

/// One decoded request line from the control pipe (spec §6 line format).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectRequest {
    /// Event name to signal on success.
    pub success_event_name: String,
    /// Event name to signal on failure.
    pub failure_event_name: String,
    /// Whether the named events were created with handle inheritance.
    pub inherited_handles: bool,
    /// The process to inject into.
    pub target_pid: u32,
}

/// Raised when a control-pipe line doesn't have exactly four comma-separated
/// fields, or its pid field isn't valid hex. The broker's inbound is trusted
/// (only our own shim writes to it), so malformed input is a fatal assertion
/// per spec §4.2, not a recoverable `Result`.
fn parse_request(line: &str) -> InjectRequest {
    let fields: Vec<&str> = line.split(',').collect();
    assert_eq!(
        fields.len(),
        4,
        "malformed control-pipe line (expected 4 fields): {line:?}"
    );
    let target_pid = u32::from_str_radix(fields[3].trim_start_matches("0x"), 16)
        .unwrap_or_else(|_| panic!("malformed control-pipe pid field: {:?}", fields[3]));
    InjectRequest {
        success_event_name: fields[0].to_string(),
        failure_event_name: fields[1].to_string(),
        inherited_handles: fields[2] == "true",
        target_pid,
    }
}

const MAX_INJECT_RETRIES: u32 = 5;

/// Opens (or waits for the creation of) a named event and signals it,
/// retrying with the fixed backoff schedule {1s, 2s, 4s} per spec §4.2,
/// since a descendant may post its request before the runner has created
/// the corresponding event.
pub trait EventSignaler: Send + Sync {
    /// Attempts to open `event_name` and signal it once. Returns `Ok(true)`
    /// if the event existed and was signaled, `Ok(false)` if it did not yet
    /// exist (the caller retries), or `Err` on a hard failure.
    fn try_signal(&self, event_name: &str) -> std::io::Result<bool>;
}

const OPEN_EVENT_BACKOFF: [Duration; 3] =
    [Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)];

async fn signal_with_backoff(signaler: &dyn EventSignaler, event_name: &str, log: &dyn LogSink) {
    if matches!(signaler.try_signal(event_name), Ok(true)) {
        return;
    }
    for delay in OPEN_EVENT_BACKOFF {
        tokio::time::sleep(delay).await;
        match signaler.try_signal(event_name) {
            Ok(true) => return,
            Ok(false) => continue,
            Err(e) => {
                log.log(
                    LogRecord::new(Level::Warn, "broker_signal_failed")
                        .with("event", event_name)
                        .with("error", e),
                );
                return;
            }
        }
    }
    log.log(LogRecord::new(Level::Warn, "broker_signal_event_never_appeared").with("event", event_name));
}

/// The broker itself: owns the injector and the "has any injection failed"
/// flag, and processes requests fed to it by the control-pipe reader.
pub struct Broker {
    injector: Arc<dyn ProcessInjector>,
    signaler: Arc<dyn EventSignaler>,
    log: Arc<dyn LogSink>,
    shutting_down: AtomicBool,
    has_failed: AtomicBool,
    failed_pids: std::sync::Mutex<Vec<u32>>,
}

/// Outcome exposed to the runner once the broker has been stopped and
/// drained (spec §4.3 exit path step iv).
#[derive(Debug, Clone)]
pub struct BrokerOutcome {
    /// True iff any brokered injection ultimately failed. This is the only
    /// field load-bearing downstream today (spec §9 Open Question i).
    pub has_detours_failures: bool,
    /// Individual pids whose injection failed, tracked even though only the
    /// aggregate flag above is consumed by the merger/runner at present.
    pub failed_pids: Vec<u32>,
}

impl Broker {
    /// Creates a broker around an injector and an event signaler.
    pub fn new(
        injector: Arc<dyn ProcessInjector>,
        signaler: Arc<dyn EventSignaler>,
        log: Arc<dyn LogSink>,
    ) -> Self {
        Broker {
            injector,
            signaler,
            log,
            shutting_down: AtomicBool::new(false),
            has_failed: AtomicBool::new(false),
            failed_pids: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Marks the broker as shutting down: subsequent requests are ignored
    /// (spec §4.2 step (a)) without being evaluated.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Processes one decoded line from the control pipe.
    pub async fn handle_request(&self, line: &str, payload: &InjectionPayload) {
        let request = parse_request(line);

        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        if self.has_failed.load(Ordering::SeqCst) {
            signal_with_backoff(self.signaler.as_ref(), &request.failure_event_name, self.log.as_ref())
                .await;
            return;
        }

        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            match self.injector.inject(request.target_pid, payload) {
                Ok(()) => break Ok(()),
                Err(e) if e.is_retryable() && attempt < MAX_INJECT_RETRIES => {
                    self.log.log(
                        LogRecord::new(Level::Warn, "injector_retry")
                            .with("target_pid", request.target_pid)
                            .with("attempt", attempt),
                    );
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
                Err(e) => break Err(e),
            }
        };

        match outcome {
            Ok(()) => {
                signal_with_backoff(self.signaler.as_ref(), &request.success_event_name, self.log.as_ref())
                    .await;
            }
            Err(e) => {
                self.has_failed.store(true, Ordering::SeqCst);
                self.failed_pids.lock().unwrap().push(request.target_pid);
                self.log.log(
                    LogRecord::new(Level::Error, "injector_failed")
                        .with("target_pid", request.target_pid)
                        .with("reason", e),
                );
                signal_with_backoff(self.signaler.as_ref(), &request.failure_event_name, self.log.as_ref())
                    .await;
            }
        }
    }

    /// Stops the broker and reports whether any injection ultimately
    /// failed. Must only be called after the control pipe has been fully
    /// drained to EOF (spec §4.2 shutdown ordering) — calling it earlier
    /// loses no correctness here since `has_failed` is cumulative, but the
    /// runner's teardown order exists specifically so this isn't raced
    /// against an in-flight request from a not-yet-exited descendant.
    pub fn stop(&self) -> BrokerOutcome {
        self.begin_shutdown();
        BrokerOutcome {
            has_detours_failures: self.has_failed.load(Ordering::SeqCst),
            failed_pids: self.failed_pids.lock().unwrap().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::injector::{FlakyInjector, NullInjector};
    use crate::logging::NullLogSink;
    use std::sync::Mutex as StdMutex;

    struct RecordingSignaler {
        signaled: StdMutex<Vec<String>>,
    }

    impl RecordingSignaler {
        fn new() -> Self {
            RecordingSignaler {
                signaled: StdMutex::new(Vec::new()),
            }
        }
    }

    impl EventSignaler for RecordingSignaler {
        fn try_signal(&self, event_name: &str) -> std::io::Result<bool> {
            self.signaled.lock().unwrap().push(event_name.to_string());
            Ok(true)
        }
    }

    #[test]
    fn parses_well_formed_request_line() {
        let req = parse_request("ok_evt,fail_evt,true,1a");
        assert_eq!(req.target_pid, 0x1a);
        assert!(req.inherited_handles);
        assert_eq!(req.success_event_name, "ok_evt");
        assert_eq!(req.failure_event_name, "fail_evt");
    }

    #[test]
    #[should_panic(expected = "malformed control-pipe line")]
    fn rejects_wrong_field_count() {
        parse_request("only,three,fields");
    }

    #[tokio::test]
    async fn successful_injection_signals_success_event() {
        let broker = Broker::new(
            Arc::new(NullInjector),
            Arc::new(RecordingSignaler::new()),
            Arc::new(NullLogSink),
        );
        broker
            .handle_request("ok,fail,false,64", &InjectionPayload::default())
            .await;
        let outcome = broker.stop();
        assert!(!outcome.has_detours_failures);
    }

    #[tokio::test]
    async fn retries_on_partial_copy_then_succeeds() {
        let broker = Broker::new(
            Arc::new(FlakyInjector::new(2)),
            Arc::new(RecordingSignaler::new()),
            Arc::new(NullLogSink),
        );
        broker
            .handle_request("ok,fail,false,1", &InjectionPayload::default())
            .await;
        let outcome = broker.stop();
        assert!(!outcome.has_detours_failures);
    }

    #[tokio::test]
    async fn subsequent_requests_skip_injection_after_first_failure() {
        use crate::injector::AlwaysFailingInjector;
        let broker = Broker::new(
            Arc::new(AlwaysFailingInjector),
            Arc::new(RecordingSignaler::new()),
            Arc::new(NullLogSink),
        );
        broker
            .handle_request("ok,fail,false,1", &InjectionPayload::default())
            .await;
        broker
            .handle_request("ok,fail,false,2", &InjectionPayload::default())
            .await;
        let outcome = broker.stop();
        assert!(outcome.has_detours_failures);
        assert_eq!(outcome.failed_pids, vec![1]);
    }

    #[tokio::test]
    async fn requests_after_shutdown_are_ignored() {
        let broker = Broker::new(
            Arc::new(NullInjector),
            Arc::new(RecordingSignaler::new()),
            Arc::new(NullLogSink),
        );
        broker.begin_shutdown();
        broker
            .handle_request("ok,fail,false,1", &InjectionPayload::default())
            .await;
        let outcome = broker.stop();
        assert!(!outcome.has_detours_failures);
        assert!(outcome.failed_pids.is_empty());
    }
}
