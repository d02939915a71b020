//! Job-object abstraction (spec §4.3): Windows job objects, or a Unix
//! process-group standing in for the same "kill the whole tree" contract.

use crate::error::{CoreError, Result};

#[cfg(unix)]
use std::sync::atomic::{AtomicI32, Ordering};

/// The three limit flags spec §4.3 step 3 assigns on every job.
#[derive(Debug, Clone, Copy)]
pub struct JobLimits {
    /// Kill every process in the job when its last handle closes.
    pub terminate_on_close: bool,
    /// If false, an unhandled exception in a job member does not tear down
    /// the whole job (Windows: inverted `JOB_OBJECT_LIMIT_DIE_ON_UNHANDLED_EXCEPTION`).
    pub fail_critical_errors: bool,
    /// Permit a child to escape the job (Windows: `JOB_OBJECT_LIMIT_BREAKAWAY_OK`).
    pub allow_breakaway: bool,
}

#[cfg(windows)]
mod os {
    use super::*;
    use std::ptr;
    use winapi::shared::minwindef::{DWORD, FALSE};
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::jobapi2::{
        AssignProcessToJobObject, CreateJobObjectW, SetInformationJobObject, TerminateJobObject,
    };
    use winapi::um::winnt::{
        JobObjectExtendedLimitInformation, HANDLE, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
        JOB_OBJECT_LIMIT_BREAKAWAY_OK, JOB_OBJECT_LIMIT_DIE_ON_UNHANDLED_EXCEPTION,
        JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
    };

    pub struct JobObject {
        handle: HANDLE,
    }

    // SAFETY: a job object HANDLE is just a kernel object reference; the
    // Windows API is thread-safe for the operations we perform on it.
    unsafe impl Send for JobObject {}
    unsafe impl Sync for JobObject {}

    impl JobObject {
        pub fn create(limits: JobLimits) -> Result<Self> {
            let handle = unsafe { CreateJobObjectW(ptr::null_mut(), ptr::null()) };
            if handle.is_null() {
                return Err(CoreError::process_creation_failed());
            }

            let mut basic_limits: DWORD = 0;
            if limits.terminate_on_close {
                basic_limits |= JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
            }
            if !limits.fail_critical_errors {
                basic_limits |= JOB_OBJECT_LIMIT_DIE_ON_UNHANDLED_EXCEPTION;
            }
            if limits.allow_breakaway {
                basic_limits |= JOB_OBJECT_LIMIT_BREAKAWAY_OK;
            }

            let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { std::mem::zeroed() };
            info.BasicLimitInformation.LimitFlags = basic_limits;

            let ok = unsafe {
                SetInformationJobObject(
                    handle,
                    JobObjectExtendedLimitInformation,
                    &mut info as *mut _ as *mut _,
                    std::mem::size_of_val(&info) as DWORD,
                )
            };
            if ok == FALSE {
                unsafe { CloseHandle(handle) };
                return Err(CoreError::process_creation_failed());
            }

            Ok(JobObject { handle })
        }

        pub fn assign(&self, process_handle: HANDLE) -> Result<()> {
            let ok = unsafe { AssignProcessToJobObject(self.handle, process_handle) };
            if ok == FALSE {
                return Err(CoreError::process_creation_failed());
            }
            Ok(())
        }

        pub fn terminate(&self, exit_code: u32) -> Result<()> {
            let ok = unsafe { TerminateJobObject(self.handle, exit_code) };
            if ok == FALSE {
                return Err(CoreError::process_creation_failed());
            }
            Ok(())
        }
    }

    impl Drop for JobObject {
        fn drop(&mut self) {
            unsafe { CloseHandle(self.handle) };
        }
    }
}

#[cfg(unix)]
mod os {
    use super::*;

    /// A Unix stand-in for a job object: a process group. There is no
    /// kernel object to hold open, so `terminate_on_close`/`allow_breakaway`
    /// have no effect here beyond documentation — they are genuine platform
    /// gaps, not silently-dropped features (spec §4.3 **[ADDED]**).
    pub struct JobObject {
        pgid: AtomicI32,
        limits: JobLimits,
    }

    impl JobObject {
        pub fn create(limits: JobLimits) -> Result<Self> {
            // The actual pgid is only known once the child is spawned and
            // calls `setpgid(0, 0)` in its pre-exec hook; `assign` records
            // it here. Interior mutability so the creator can assign through
            // the same shared reference it was handed (spec §4.3 step 5).
            Ok(JobObject {
                pgid: AtomicI32::new(0),
                limits,
            })
        }

        pub fn assign(&self, pid: libc::pid_t) -> Result<()> {
            let ret = unsafe { libc::setpgid(pid, pid) };
            if ret != 0 {
                return Err(CoreError::process_creation_failed());
            }
            self.pgid.store(pid, Ordering::SeqCst);
            Ok(())
        }

        pub fn terminate(&self, _exit_code: u32) -> Result<()> {
            let pgid = self.pgid.load(Ordering::SeqCst);
            if pgid == 0 {
                return Ok(());
            }
            let ret = unsafe { libc::killpg(pgid, libc::SIGKILL) };
            if ret != 0 && std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH) {
                return Err(CoreError::process_creation_failed());
            }
            Ok(())
        }

        pub fn limits(&self) -> JobLimits {
            self.limits
        }
    }
}

pub use os::JobObject;

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn unassigned_job_terminate_is_a_noop() {
        let job = JobObject::create(JobLimits {
            terminate_on_close: true,
            fail_critical_errors: false,
            allow_breakaway: false,
        })
        .unwrap();
        assert!(job.terminate(1).is_ok());
    }
}
