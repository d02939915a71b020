//! Detoured process runner (spec §4.3): the integration glue tying the
//! pipe layer, broker, job object, container and merger together into a
//! single `start → wait → merge → finalize` pipeline (spec §2's
//! "Integration glue" component).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::broker::{Broker, BrokerOutcome, EventSignaler};
use crate::container::ContainerConfiguration;
use crate::description::ProcessDescription;
use crate::error::{CoreError, Result};
use crate::injector::{InjectionPayload, ProcessInjector};
use crate::interning::PathTable;
use crate::job::{JobLimits, JobObject};
use crate::logging::{Level, LogRecord, LogSink};
use crate::merger::{ArtifactDetector, DeclaredOutput, OutputMerger};
use crate::pipe::{AsyncLineReader, ChildPipeHandles, LineCallback, ReaderOutcome};
use crate::process::Process;
use crate::sideband::SidebandWriter;

/// Best-effort memory-dump capture on timeout (spec §4.3 "Timed out").
///
/// Producing a real minidump needs `MiniDumpWriteDump`/`dbghelp.dll` on
/// Windows or a `core_pattern`/ptrace dance on Linux — both outside this
/// crate's scope. The calling contract (best-effort, non-fatal, recorded
/// not raised) is fully implemented here against the trait.
pub trait DumpCapture: Send + Sync {
    /// Attempts to capture a dump of `pids` into `dir`, returning the
    /// resulting file path.
    fn capture(&self, pids: &[u32], dir: &Path) -> std::io::Result<PathBuf>;
}

/// No-op [`DumpCapture`] — always fails, which the runner treats as the
/// "best effort, not fatal" outcome the spec requires.
#[derive(Debug, Default)]
pub struct NoDumpCapture;

impl DumpCapture for NoDumpCapture {
    fn capture(&self, _pids: &[u32], _dir: &Path) -> std::io::Result<PathBuf> {
        Err(std::io::Error::other("dump capture not implemented"))
    }
}

/// The native process handle a successful creation hands back on Windows,
/// alongside the pid, so [`Process`] can wrap it for waiting (spec §4.3
/// step 5). On Unix the pid alone is sufficient (`waitpid` needs nothing
/// else), so this type only exists under `cfg(windows)`.
#[cfg(windows)]
pub type RawProcessHandle = winapi::um::winnt::HANDLE;

/// Structured outcome of the native "create detoured process" call (spec
/// §4.3 step 5). The actual detour-DLL injection is native, platform-
/// specific machinery outside this crate (mirroring how [`ProcessInjector`]
/// abstracts the broker's equivalent call); callers supply a
/// [`NativeProcessCreator`] implementation appropriate to their platform.
#[derive(Debug, Clone)]
pub enum CreationStatus {
    /// The child started suspended, was added to the job, injected, and
    /// resumed successfully.
    Succeeded {
        /// The child's process id.
        pid: u32,
        /// The child's process handle (Windows only — Unix waits on the
        /// pid directly via `waitpid`).
        #[cfg(windows)]
        process_handle: RawProcessHandle,
    },
    /// The OS refused to create the child at all.
    ProcessCreationFailed {
        /// Native error code, if available.
        native_code: i32,
    },
    /// The child was created but the detour DLL could not be injected.
    DetoursInjectionFailed,
    /// The child could not be added to the job object.
    JobAssignmentFailed,
}

/// Abstracts "invoke the native helper that starts the child suspended,
/// adds it to the job, injects the detour DLL, and resumes it" (spec §4.3
/// step 5).
pub trait NativeProcessCreator: Send + Sync {
    /// Performs the native creation + injection + resume sequence. Receives
    /// the already-created job object so it can assign the child into it
    /// before resuming it (spec §4.3 steps 3-5 happen as one atomic native
    /// call on the platforms this abstracts), and the inheritable child-side
    /// pipe ends to wire as the child's stdio/report/control handles (spec
    /// §4.3 steps 2 and 4).
    fn create_detoured_process(
        &self,
        description: &ProcessDescription,
        payload: &InjectionPayload,
        job: &JobObject,
        child_handles: &ChildPipeHandles,
    ) -> CreationStatus;
}

/// Callbacks the caller supplies for the exit path (spec §4.3 step after
/// detection, "under its single mutex").
pub trait RunnerCallbacks: Send + Sync {
    /// Called once, right after exit/timeout is detected, before stdio is
    /// drained — typically tears down the process tree so write-sides
    /// close.
    fn process_exiting(&self) {}
    /// Called once, after stdio EOF and broker teardown, before stdin is
    /// closed.
    fn process_exited(&self) {}
}

/// No-op callback set.
#[derive(Debug, Default)]
pub struct NoopCallbacks;
impl RunnerCallbacks for NoopCallbacks {}

/// Exit code the job is killed with on timeout (spec §4.3 "Timed out":
/// `kill via the job object with exit_code = TIMEOUT`).
const TIMEOUT_EXIT_CODE: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunnerPhase {
    NotStarted,
    Running,
    Exited,
    Disposed,
}

struct RunnerState {
    phase: RunnerPhase,
    process: Option<Process>,
    job: Option<JobObject>,
}

/// Final summary returned once the runner's whole pipeline has completed.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Whether the process exited on its own or was killed on timeout.
    pub timed_out: bool,
    /// True iff any brokered injection ultimately failed.
    pub has_detours_failures: bool,
    /// The child's exit code, if one could be determined.
    pub exit_code: Option<u32>,
}

/// Ties together a job object, a broker, three pipe readers, and the
/// merger into one pip's lifecycle. Single-use: [`DetouredProcessRunner::start`]
/// may only be called once (spec §4.3 "Start preconditions").
pub struct DetouredProcessRunner {
    state: AsyncMutex<RunnerState>,
    creator: Arc<dyn NativeProcessCreator>,
    injector: Arc<dyn ProcessInjector>,
    signaler: Arc<dyn EventSignaler>,
    dump_capture: Arc<dyn DumpCapture>,
    callbacks: Arc<dyn RunnerCallbacks>,
    log: Arc<dyn LogSink>,
    dump_dir: PathBuf,
}

impl DetouredProcessRunner {
    /// Creates a runner. Nothing happens until [`start`](Self::start) is
    /// called.
    pub fn new(
        creator: Arc<dyn NativeProcessCreator>,
        injector: Arc<dyn ProcessInjector>,
        signaler: Arc<dyn EventSignaler>,
        dump_capture: Arc<dyn DumpCapture>,
        callbacks: Arc<dyn RunnerCallbacks>,
        log: Arc<dyn LogSink>,
        dump_dir: PathBuf,
    ) -> Self {
        DetouredProcessRunner {
            state: AsyncMutex::new(RunnerState {
                phase: RunnerPhase::NotStarted,
                process: None,
                job: None,
            }),
            creator,
            injector,
            signaler,
            dump_capture,
            callbacks,
            log,
            dump_dir,
        }
    }

    /// Runs the full start algorithm (spec §4.3 steps 1-7) and then drives
    /// the exit path to completion, returning once the process has exited
    /// (or been killed on timeout) and stdio has reached EOF.
    ///
    /// `sideband` receives every line the detour library's report pipe
    /// delivers (spec §4.6); `on_stdout_line`/`on_stderr_line` receive the
    /// child's own stdio lines.
    ///
    /// Does not run the merger — call [`DetouredProcessRunner::merge`]
    /// afterward with the container configuration and declared outputs, per
    /// spec §4.5 ("runs after `process_exited`").
    pub async fn start(
        &self,
        description: &ProcessDescription,
        payload: &InjectionPayload,
        sideband: Arc<std::sync::Mutex<SidebandWriter>>,
        on_stdout_line: Arc<LineCallback>,
        on_stderr_line: Arc<LineCallback>,
    ) -> Result<RunResult> {
        {
            let mut state = self.state.lock().await;
            assert_eq!(
                state.phase,
                RunnerPhase::NotStarted,
                "DetouredProcessRunner::start called more than once"
            );
            state.phase = RunnerPhase::Running;
        }

        // Step 2: the stdin/stdout/stderr/report pipes.
        let (stdin_parent, stdin_child) = crate::pipe::create_inheritable_input_pipe()?;
        let (stdout_parent, stdout_child) = crate::pipe::create_inheritable_pipe()?;
        let (stderr_parent, stderr_child) = crate::pipe::create_inheritable_pipe()?;
        let (report_parent, report_child) = crate::pipe::create_inheritable_pipe()?;

        // Step 3: job object with the fixed limit flags.
        let job = JobObject::create(JobLimits {
            terminate_on_close: true,
            fail_critical_errors: false,
            allow_breakaway: description.allow_breakaway,
        })?;

        // Step 4: the broker and its own inheritable control-pipe pair.
        // Shared via `Arc` so the control-pipe consumer task spawned below
        // can hold its own handle alongside the one `start` keeps for
        // `stop()`.
        let broker = Arc::new(Broker::new(self.injector.clone(), self.signaler.clone(), self.log.clone()));
        let (control_parent, control_child) = crate::pipe::create_inheritable_pipe()?;

        let child_handles = child_pipe_handles(&stdin_child, &stdout_child, &stderr_child, &report_child, &control_child);

        // Step 5: native creation.
        let status = self
            .creator
            .create_detoured_process(description, payload, &job, &child_handles);

        // The child (and whatever it inherited into) now holds its own
        // reference; drop ours so the parent-side readers can observe real
        // EOF once every such reference is gone (spec §4.2 "dispose the
        // injector object, closing the local write handle it holds for
        // inheritance").
        drop(stdin_child);
        drop(stdout_child);
        drop(stderr_child);
        drop(report_child);
        drop(control_child);

        let pid = match &status {
            CreationStatus::Succeeded { pid, .. } => *pid,
            CreationStatus::ProcessCreationFailed { native_code } => {
                return Err(CoreError::ProcessCreationFailed { native_code: *native_code });
            }
            CreationStatus::DetoursInjectionFailed => {
                return Err(CoreError::DetoursInjectionFailed { phase: "create" });
            }
            CreationStatus::JobAssignmentFailed => {
                return Err(CoreError::ProcessCreationFailed { native_code: -1 });
            }
        };

        #[cfg(unix)]
        let process = Process::new(pid, ());
        #[cfg(windows)]
        let process = match status {
            CreationStatus::Succeeded { process_handle, .. } => Process::from_handle(pid, process_handle),
            _ => unreachable!("non-Succeeded status already returned above"),
        };

        {
            let mut state = self.state.lock().await;
            state.process = Some(process.clone());
            state.job = Some(job);
        }

        // Step 6: spawn async readers for stdout, stderr, and report, and
        // start the broker listening on the control pipe.
        let stdout_reader = build_line_reader(stdout_parent, "stdout", self.log.clone())?;
        let stderr_reader = build_line_reader(stderr_parent, "stderr", self.log.clone())?;
        let report_reader = build_line_reader(report_parent, "report", self.log.clone())?;
        let control_reader = build_line_reader(control_parent, "control", self.log.clone())?;

        let stdout_task = stdout_reader.spawn(on_stdout_line);
        let stderr_task = stderr_reader.spawn(on_stderr_line);

        let report_callback: Arc<LineCallback> = {
            let sideband = sideband.clone();
            let log = self.log.clone();
            Arc::new(move |line: &str| {
                if let Err(e) = sideband.lock().unwrap().record(Path::new(line)) {
                    log.log(LogRecord::new(Level::Warn, "sideband_record_failed").with("error", e));
                }
            })
        };
        let report_task = report_reader.spawn(report_callback);

        // The report callback's `LineCallback` is synchronous (spec §4.1),
        // but handling a brokered request is `async`; bridge the two with a
        // channel and a dedicated consumer task so lines are still handled
        // strictly in arrival order.
        let (control_tx, mut control_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let control_callback: Arc<LineCallback> = Arc::new(move |line: &str| {
            let _ = control_tx.send(line.to_string());
        });
        let control_reader_task = control_reader.spawn(control_callback);
        let control_consumer_task = {
            let broker = broker.clone();
            let payload = payload.clone();
            tokio::spawn(async move {
                while let Some(line) = control_rx.recv().await {
                    broker.handle_request(&line, &payload).await;
                }
            })
        };

        // Step 7: OS wait with timeout.
        let timed_out = process.wait_timeout_async(description.timeout).await?.is_none();

        if timed_out {
            self.log.log(LogRecord::new(Level::Warn, "process_timed_out").with("pid", pid));
            if let Err(e) = self.dump_capture.capture(&[pid], &self.dump_dir) {
                self.log.log(
                    LogRecord::new(Level::Warn, "dump_capture_failed").with("error", e),
                );
            }
            {
                let state = self.state.lock().await;
                if let Some(job) = &state.job {
                    let _ = job.terminate(TIMEOUT_EXIT_CODE);
                }
            }
            // Ensure the wait future resolves even though we've already
            // forced termination via the job.
            let _ = process.wait_async().await;
        }

        // Exit path, under the single mutex (spec §4.3): deregister wait is
        // implicit once wait_async resolved; invoke process_exiting, await
        // stdio EOF, stop the broker, invoke process_exited, close stdin.
        self.callbacks.process_exiting();

        let stdout_outcome = stdout_task.await.unwrap_or(ReaderOutcome { reached_eof: false });
        let stderr_outcome = stderr_task.await.unwrap_or(ReaderOutcome { reached_eof: false });
        let _ = report_task.await;

        // The control pipe cannot reach EOF until every descendant has
        // exited and closed its inherited write handle (spec §4.2 shutdown
        // ordering); await that reader, which drops `control_tx`'s last
        // sender once it returns, which in turn lets the consumer task's
        // `recv()` resolve to `None` and finish draining.
        let _ = control_reader_task.await;
        let _ = control_consumer_task.await;

        let broker_outcome: BrokerOutcome = broker.stop();

        self.callbacks.process_exited();

        // Step (vi): close stdin.
        drop(stdin_parent);

        {
            let mut state = self.state.lock().await;
            state.phase = RunnerPhase::Exited;
        }

        self.log.log(
            LogRecord::new(Level::Debug, "stdio_drained")
                .with("stdout_reached_eof", stdout_outcome.reached_eof)
                .with("stderr_reached_eof", stderr_outcome.reached_eof),
        );

        Ok(RunResult {
            timed_out,
            has_detours_failures: broker_outcome.has_detours_failures,
            exit_code: process.exit_status().and_then(|s| s.code()),
        })
    }

    /// Runs the merger over a pip's declared outputs (spec §4.5), after
    /// `process_exited` has returned: redirects the container configuration's
    /// entries back into [`DeclaredOutput`]s and merges every one of them
    /// through this runner's own log sink, so double-write violations are
    /// actually recorded rather than silently discarded.
    pub fn merge(
        &self,
        table: &PathTable,
        config: &ContainerConfiguration,
        description: &ProcessDescription,
        policy: crate::merger::DoubleWritePolicy,
        artifacts: Box<dyn ArtifactDetector>,
    ) -> Result<()> {
        let outputs = declared_outputs_for_merge(table, config, description);
        let mut merger = OutputMerger::new(policy, artifacts, self.log.clone());
        merger.merge_all(&outputs)
    }

    /// Kills the process and its job, idempotently, silently no-opping
    /// after disposal (spec §4.3 "Kill semantics"). Reads the process
    /// handle once under the mutex, then issues native calls outside it,
    /// so a blocking terminate call can't starve other state transitions
    /// (spec §4.3 "Concurrency").
    pub async fn kill(&self, _exit_code: u32) -> Result<()> {
        let (process, job) = {
            let state = self.state.lock().await;
            if state.phase == RunnerPhase::Disposed {
                return Ok(());
            }
            (state.process.clone(), state.job.is_some())
        };
        if let Some(process) = process {
            process.kill()?;
        }
        if job {
            let state = self.state.lock().await;
            if let Some(job) = &state.job {
                job.terminate(1)?;
            }
        }
        Ok(())
    }

    /// Marks the runner disposed; subsequent [`kill`](Self::kill) calls
    /// become no-ops.
    pub async fn dispose(&self) {
        let mut state = self.state.lock().await;
        state.phase = RunnerPhase::Disposed;
    }
}

/// Bundles the child-facing ends of the five pipes just created into the
/// shape [`NativeProcessCreator::create_detoured_process`] expects (spec
/// §4.3 steps 2 and 4).
#[cfg(unix)]
fn child_pipe_handles(
    stdin: &std::os::unix::io::OwnedFd,
    stdout: &std::os::unix::io::OwnedFd,
    stderr: &std::os::unix::io::OwnedFd,
    report: &std::os::unix::io::OwnedFd,
    control: &std::os::unix::io::OwnedFd,
) -> ChildPipeHandles {
    use std::os::unix::io::AsRawFd;
    ChildPipeHandles {
        stdin: stdin.as_raw_fd(),
        stdout: stdout.as_raw_fd(),
        stderr: stderr.as_raw_fd(),
        report: report.as_raw_fd(),
        control: control.as_raw_fd(),
    }
}

/// Bundles the child-facing ends of the five pipes just created into the
/// shape [`NativeProcessCreator::create_detoured_process`] expects (spec
/// §4.3 steps 2 and 4).
#[cfg(windows)]
fn child_pipe_handles(
    stdin: &std::fs::File,
    stdout: &std::fs::File,
    stderr: &std::fs::File,
    report: &std::fs::File,
    control: &std::fs::File,
) -> ChildPipeHandles {
    use std::os::windows::io::AsRawHandle;
    ChildPipeHandles {
        stdin: stdin.as_raw_handle(),
        stdout: stdout.as_raw_handle(),
        stderr: stderr.as_raw_handle(),
        report: report.as_raw_handle(),
        control: control.as_raw_handle(),
    }
}

/// Wraps a parent-side pipe end in the platform's [`AsyncLineReader`] impl
/// (spec §4.1's cfg-selected reader).
#[cfg(unix)]
fn build_line_reader(
    fd: std::os::unix::io::OwnedFd,
    stream_name: &'static str,
    log: Arc<dyn LogSink>,
) -> Result<Box<dyn AsyncLineReader>> {
    Ok(Box::new(crate::pipe::UnixPipeLineReader::new(
        fd,
        stream_name,
        crate::pipe::ReaderConfig::default(),
        log,
    )?))
}

/// Wraps a parent-side pipe end in the platform's [`AsyncLineReader`] impl
/// (spec §4.1's cfg-selected reader).
#[cfg(windows)]
fn build_line_reader(
    file: std::fs::File,
    stream_name: &'static str,
    log: Arc<dyn LogSink>,
) -> Result<Box<dyn AsyncLineReader>> {
    Ok(Box::new(crate::pipe::OverlappedLineReader::new(
        file,
        stream_name,
        crate::pipe::ReaderConfig::default(),
        log,
    )?))
}

/// Redirects a container-relative redirected path back to a declared
/// output's destination, producing the [`DeclaredOutput`] list the merger
/// needs — a thin adapter between the container configuration and the
/// merger, since the runner is the only component that needs both at once.
pub fn declared_outputs_for_merge(
    table: &PathTable,
    config: &ContainerConfiguration,
    description: &ProcessDescription,
) -> Vec<DeclaredOutput> {
    description
        .declared_file_outputs
        .iter()
        .filter_map(|output| {
            let redirected = config.redirected_for_declared_output(table, output.path)?;
            Some(DeclaredOutput {
                redirected_path: PathBuf::from(table.expand_to_string(redirected)),
                destination: PathBuf::from(table.expand_to_string(output.path)),
                rewrite_count: output.rewrite_count,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::EventSignaler;
    use crate::injector::NullInjector;
    use crate::logging::NullLogSink;
    use crate::pipe::ReaderConfig;
    use std::time::Duration as StdDuration;

    struct AlwaysFailsSignaler;
    impl EventSignaler for AlwaysFailsSignaler {
        fn try_signal(&self, _event_name: &str) -> std::io::Result<bool> {
            Ok(true)
        }
    }

    struct ImmediatelyExitingCreator;
    impl NativeProcessCreator for ImmediatelyExitingCreator {
        fn create_detoured_process(
            &self,
            _description: &ProcessDescription,
            _payload: &InjectionPayload,
            _job: &JobObject,
            _child_handles: &ChildPipeHandles,
        ) -> CreationStatus {
            // A pid of 0 would be invalid on a real OS; this is purely a
            // compile-time/shape test, not a real spawn. See integration
            // tests for end-to-end coverage using `tempfile`-backed paths.
            CreationStatus::ProcessCreationFailed { native_code: 2 }
        }
    }

    #[test]
    fn reader_config_default_is_sane() {
        let _ = ReaderConfig::default();
    }

    #[tokio::test]
    async fn start_surfaces_process_creation_failure() {
        let runner = DetouredProcessRunner::new(
            Arc::new(ImmediatelyExitingCreator),
            Arc::new(NullInjector),
            Arc::new(AlwaysFailsSignaler),
            Arc::new(NoDumpCapture),
            Arc::new(NoopCallbacks),
            Arc::new(NullLogSink),
            std::env::temp_dir(),
        );

        let table = PathTable::new();
        let description = ProcessDescription {
            command_line: vec!["true".to_string()],
            working_directory: table.intern(&std::env::temp_dir()),
            environment: Default::default(),
            declared_file_outputs: vec![],
            declared_output_directories: vec![],
            double_write_policy: crate::merger::DoubleWritePolicy::DoubleWritesAreErrors,
            isolation_level: crate::description::IsolationLevel::none(),
            timeout: StdDuration::from_secs(1),
            redirected_root: table.intern(&std::env::temp_dir()),
            allow_breakaway: false,
        };

        let sideband = Arc::new(std::sync::Mutex::new(crate::sideband::SidebandWriter::new(
            crate::tagged::TaggedValue::Number(0),
            std::env::temp_dir().join("runner-test-sideband.bin"),
            None,
        )));

        let result = runner
            .start(
                &description,
                &InjectionPayload::default(),
                sideband,
                Arc::new(|_: &str| {}),
                Arc::new(|_: &str| {}),
            )
            .await;
        assert!(matches!(result, Err(CoreError::ProcessCreationFailed { native_code: 2 })));
    }
}
