//! Coverage for the ambient `tracing`-backed logging sink: confirms
//! `TracingLogSink` actually reaches a real subscriber rather than just
//! type-checking against the `LogSink` trait.

use std::io::Write;
use std::sync::{Arc, Mutex};

use tracing::subscriber::with_default;
use tracing_subscriber::fmt::MakeWriter;

use pip_sandbox::{Level, LogRecord, LogSink, TracingLogSink};

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for SharedBuf {
    type Writer = SharedBuf;
    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[test]
fn tracing_log_sink_forwards_events_to_a_real_subscriber() {
    let buf = SharedBuf::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(buf.clone())
        .with_ansi(false)
        .finish();

    with_default(subscriber, || {
        TracingLogSink.log(
            LogRecord::new(Level::Warn, "injector_retry")
                .with("target_pid", 4242)
                .with("attempt", 2),
        );
    });

    let written = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
    assert!(written.contains("injector_retry"));
    assert!(written.contains("target_pid=4242"));
}
