//! Process lifecycle handle underlying the runner (spec §4.3).
//!
//! Mirrors the teacher's `Process`/`InnerProcess` shape almost verbatim:
//! a cheaply-cloned `Arc` handle backed by a single `Mutex<ProcessState>`,
//! adapted to return [`CoreError`] instead of `io::Error` and to expose an
//! async `wait_async` for the runner's tokio-task-based OS wait (spec §5).

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{CoreError, Result};

/// Opaque wrapper around the platform's native exit status representation.
#[derive(Eq, PartialEq, Hash, Copy, Clone)]
pub struct ExitStatus(pub(crate) Option<os::RawExitStatus>);

impl ExitStatus {
    pub(crate) fn from_raw(raw: os::RawExitStatus) -> ExitStatus {
        ExitStatus(Some(raw))
    }

    /// An exit status with no known value (e.g. a process reaped by someone
    /// else).
    pub fn undetermined() -> ExitStatus {
        ExitStatus(None)
    }

    /// True if the process exited with code 0.
    pub fn success(&self) -> bool {
        self.code() == Some(0)
    }

    /// True if the process was killed by the given signal number. Always
    /// `false` on Windows.
    pub fn is_killed_by(&self, signum: i32) -> bool {
        self.signal() == Some(signum)
    }
}

/// A handle to a running or finished child process.
///
/// All methods take `&self`; `Process` can be shared freely between tasks.
/// Dropping the last clone waits for the child to finish unless
/// [`detach`](Self::detach) was called — callers embedding this in the
/// runner always detach once the runner itself takes over the wait, since
/// the runner's own teardown order (spec §4.3) is authoritative.
#[derive(Clone)]
pub struct Process(Arc<InnerProcess>);

struct InnerProcess {
    pid: u32,
    ext: os::ExtProcessState,
    state: Mutex<ProcessState>,
    detached: AtomicBool,
}

#[derive(Debug, Clone, Copy)]
enum ProcessState {
    Running,
    Finished(ExitStatus),
}

impl Process {
    pub(crate) fn new(pid: u32, ext: os::ExtProcessState) -> Process {
        Process(Arc::new(InnerProcess {
            pid,
            ext,
            state: Mutex::new(ProcessState::Running),
            detached: AtomicBool::new(false),
        }))
    }

    /// The child's process id.
    pub fn pid(&self) -> u32 {
        self.0.pid
    }

    /// The cached exit status, if the process is known to have finished.
    /// Performs no system calls; use [`wait`](Self::wait) to block.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match *self.0.state.lock().unwrap() {
            ProcessState::Finished(status) => Some(status),
            ProcessState::Running => None,
        }
    }

    /// Blocks the calling thread until the process exits.
    pub fn wait(&self) -> Result<ExitStatus> {
        self.0.os_wait()
    }

    /// Blocks until the process exits or `dur` elapses.
    pub fn wait_timeout(&self, dur: Duration) -> Result<Option<ExitStatus>> {
        self.0.os_wait_timeout(dur)
    }

    /// Async wait, used by the runner's OS-wait task (spec §4.3 step 7):
    /// runs the blocking wait on tokio's blocking thread pool so it never
    /// occupies an async worker thread.
    pub async fn wait_async(&self) -> Result<ExitStatus> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.wait())
            .await
            .map_err(|_| CoreError::Canceled)?
    }

    /// Async wait with a timeout, used for the runner's per-pip deadline.
    /// Returns `Ok(None)` if the timeout elapses first.
    pub async fn wait_timeout_async(&self, dur: Duration) -> Result<Option<ExitStatus>> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.wait_timeout(dur))
            .await
            .map_err(|_| CoreError::Canceled)?
    }

    /// Sends a graceful termination request (SIGTERM on Unix,
    /// `TerminateProcess` on Windows).
    pub fn terminate(&self) -> Result<()> {
        self.0.os_terminate()
    }

    /// Forcibly kills the process (SIGKILL on Unix, `TerminateProcess` on
    /// Windows — Windows has no softer/harder distinction).
    pub fn kill(&self) -> Result<()> {
        self.0.os_kill()
    }

    /// Prevents the implicit wait-on-drop.
    pub fn detach(&self) {
        self.0.detached.store(true, Ordering::Relaxed);
    }
}

#[cfg(windows)]
impl Process {
    /// Constructs a handle from the native creator's process `HANDLE` (spec
    /// §4.3 step 5: the native "create detoured process" helper returns the
    /// handle alongside the pid).
    pub(crate) fn from_handle(pid: u32, handle: winapi::um::winnt::HANDLE) -> Process {
        Process::new(pid, os::ExtProcessState(handle))
    }
}

impl Drop for InnerProcess {
    fn drop(&mut self) {
        if !self.detached.load(Ordering::Relaxed) {
            let state = *self.state.get_mut().unwrap();
            if matches!(state, ProcessState::Running) {
                let _ = self.os_wait();
            }
        }
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = *self.0.state.lock().unwrap();
        f.debug_struct("Process")
            .field("pid", &self.0.pid)
            .field("state", &state)
            .field("detached", &self.0.detached.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(unix)]
mod os {
    use super::*;
    use std::io;

    pub type ExtProcessState = ();
    pub type RawExitStatus = i32;

    impl ExitStatus {
        pub fn code(&self) -> Option<u32> {
            let raw = self.0?;
            libc::WIFEXITED(raw).then(|| libc::WEXITSTATUS(raw) as u32)
        }

        pub fn signal(&self) -> Option<i32> {
            let raw = self.0?;
            libc::WIFSIGNALED(raw).then(|| libc::WTERMSIG(raw))
        }
    }

    impl fmt::Debug for ExitStatus {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self.0 {
                Some(raw) if libc::WIFEXITED(raw) => {
                    write!(f, "ExitStatus(Exited({}))", libc::WEXITSTATUS(raw))
                }
                Some(raw) if libc::WIFSIGNALED(raw) => {
                    write!(f, "ExitStatus(Signal({}))", libc::WTERMSIG(raw))
                }
                Some(raw) => write!(f, "ExitStatus(Unknown({raw}))"),
                None => write!(f, "ExitStatus(Undetermined)"),
            }
        }
    }

    fn waitpid(pid: u32, flags: i32) -> io::Result<(u32, ExitStatus)> {
        let mut status: i32 = 0;
        let ret = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, flags) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((ret as u32, ExitStatus::from_raw(status)))
    }

    impl InnerProcess {
        pub(super) fn os_wait(&self) -> Result<ExitStatus> {
            let mut state = self.state.lock().unwrap();
            loop {
                if let ProcessState::Finished(status) = *state {
                    return Ok(status);
                }
                Self::waitpid_into(&mut state, self.pid, true)?;
            }
        }

        pub(super) fn os_wait_timeout(&self, dur: Duration) -> Result<Option<ExitStatus>> {
            use std::cmp::min;
            use std::time::Instant;

            let mut state = self.state.lock().unwrap();
            if let ProcessState::Finished(status) = *state {
                return Ok(Some(status));
            }

            let deadline = Instant::now() + dur;
            let mut delay = Duration::from_millis(1);

            loop {
                Self::waitpid_into(&mut state, self.pid, false)?;
                if let ProcessState::Finished(status) = *state {
                    return Ok(Some(status));
                }
                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                let remaining = deadline.duration_since(now);
                drop(state);
                std::thread::sleep(min(delay, remaining));
                delay = min(delay * 2, Duration::from_millis(100));
                state = self.state.lock().unwrap();
                if let ProcessState::Finished(status) = *state {
                    return Ok(Some(status));
                }
            }
        }

        pub(super) fn os_terminate(&self) -> Result<()> {
            self.send_signal(libc::SIGTERM)
        }

        pub(super) fn os_kill(&self) -> Result<()> {
            self.send_signal(libc::SIGKILL)
        }

        fn send_signal(&self, signal: i32) -> Result<()> {
            let state = self.state.lock().unwrap();
            match *state {
                ProcessState::Finished(_) => Ok(()),
                ProcessState::Running => {
                    let ret = unsafe { libc::kill(self.pid as libc::pid_t, signal) };
                    if ret != 0 {
                        let err = io::Error::last_os_error();
                        if err.raw_os_error() == Some(libc::ESRCH) {
                            return Ok(());
                        }
                        return Err(err.into());
                    }
                    Ok(())
                }
            }
        }

        fn waitpid_into(state: &mut ProcessState, pid: u32, block: bool) -> Result<()> {
            if matches!(*state, ProcessState::Finished(_)) {
                return Ok(());
            }
            match waitpid(pid, if block { 0 } else { libc::WNOHANG }) {
                Ok((pid_out, exit_status)) if pid_out == pid => {
                    *state = ProcessState::Finished(exit_status);
                }
                Ok(_) => {}
                Err(e) if e.raw_os_error() == Some(libc::ECHILD) => {
                    *state = ProcessState::Finished(ExitStatus(None));
                }
                Err(e) => return Err(e.into()),
            }
            Ok(())
        }
    }
}

#[cfg(windows)]
mod os {
    use super::*;
    use std::io;
    use winapi::shared::minwindef::{DWORD, FALSE};
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::{GetExitCodeProcess, TerminateProcess};
    use winapi::um::synchapi::WaitForSingleObject;
    use winapi::um::winbase::{INFINITE, WAIT_OBJECT_0, WAIT_TIMEOUT};
    use winapi::um::winnt::HANDLE;

    const STILL_ACTIVE: DWORD = 259;

    #[derive(Debug)]
    pub struct ExtProcessState(pub(crate) HANDLE);

    // SAFETY: a process HANDLE may be waited on and queried from any thread.
    unsafe impl Send for ExtProcessState {}
    unsafe impl Sync for ExtProcessState {}

    impl Drop for ExtProcessState {
        fn drop(&mut self) {
            unsafe { CloseHandle(self.0) };
        }
    }

    pub type RawExitStatus = u32;

    impl ExitStatus {
        pub fn code(&self) -> Option<u32> {
            self.0
        }
        pub fn signal(&self) -> Option<i32> {
            None
        }
    }

    impl fmt::Debug for ExitStatus {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self.0 {
                Some(code) => write!(f, "ExitStatus(Exited({code}))"),
                None => write!(f, "ExitStatus(Undetermined)"),
            }
        }
    }

    fn get_exit_code(handle: HANDLE) -> io::Result<DWORD> {
        let mut code: DWORD = 0;
        let ok = unsafe { GetExitCodeProcess(handle, &mut code) };
        if ok == FALSE {
            return Err(io::Error::last_os_error());
        }
        Ok(code)
    }

    fn wait_for(handle: HANDLE, timeout_ms: DWORD) -> io::Result<bool> {
        match unsafe { WaitForSingleObject(handle, timeout_ms) } {
            WAIT_OBJECT_0 => Ok(true),
            WAIT_TIMEOUT => Ok(false),
            _ => Err(io::Error::last_os_error()),
        }
    }

    impl InnerProcess {
        pub(super) fn os_wait(&self) -> Result<ExitStatus> {
            {
                let state = self.state.lock().unwrap();
                if let ProcessState::Finished(status) = *state {
                    return Ok(status);
                }
            }
            wait_for(self.ext.0, INFINITE)?;
            let mut state = self.state.lock().unwrap();
            if let ProcessState::Finished(status) = *state {
                return Ok(status);
            }
            let code = get_exit_code(self.ext.0)?;
            let status = ExitStatus::from_raw(code);
            *state = ProcessState::Finished(status);
            Ok(status)
        }

        pub(super) fn os_wait_timeout(&self, dur: Duration) -> Result<Option<ExitStatus>> {
            {
                let state = self.state.lock().unwrap();
                if let ProcessState::Finished(status) = *state {
                    return Ok(Some(status));
                }
            }
            let millis = u32::try_from(dur.as_millis()).unwrap_or(u32::MAX);
            let signaled = wait_for(self.ext.0, millis)?;
            let mut state = self.state.lock().unwrap();
            if let ProcessState::Finished(status) = *state {
                return Ok(Some(status));
            }
            if !signaled {
                return Ok(None);
            }
            let code = get_exit_code(self.ext.0)?;
            let status = ExitStatus::from_raw(code);
            *state = ProcessState::Finished(status);
            Ok(Some(status))
        }

        pub(super) fn os_terminate(&self) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if let ProcessState::Running = *state {
                let ok = unsafe { TerminateProcess(self.ext.0, 1) };
                if ok == FALSE {
                    let err = io::Error::last_os_error();
                    let code = get_exit_code(self.ext.0)?;
                    if code == STILL_ACTIVE {
                        return Err(err.into());
                    }
                    *state = ProcessState::Finished(ExitStatus::from_raw(code));
                }
            }
            Ok(())
        }

        pub(super) fn os_kill(&self) -> Result<()> {
            self.os_terminate()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_checks_exit_code_zero() {
        let status = ExitStatus::from_raw(
            #[cfg(unix)]
            0,
            #[cfg(windows)]
            0,
        );
        assert!(status.success());
    }

    #[test]
    fn undetermined_status_reports_no_code() {
        let status = ExitStatus::undetermined();
        assert_eq!(status.code(), None);
        assert!(!status.success());
    }
}
