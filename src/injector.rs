//! Abstract process injector factory (spec §4.2, §6).
//!
//! The broker calls into a [`ProcessInjector`] once per brokered request; it
//! never talks to the OS injection API directly, so the broker's retry and
//! shutdown logic can be exercised without a real detour DLL.

use std::sync::Mutex;

/// Opaque bytes handed to the native injector, assembled by the runner from
/// the process description (detour DLL path, payload config). The broker
/// never inspects the contents.
#[derive(Debug, Clone, Default)]
pub struct InjectionPayload(pub Vec<u8>);

/// Failure reported by a [`ProcessInjector::inject`] call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InjectorError {
    /// The injector observed a partially-completed write into the target
    /// process and should be retried (spec §4.2 retry budget).
    #[error("partial copy while injecting into pid {target_pid}")]
    PartialCopy {
        /// The process that was being injected into.
        target_pid: u32,
    },
    /// Any other injection failure; not retried.
    #[error("injection into pid {target_pid} failed: {reason}")]
    Other {
        /// The process that was being injected into.
        target_pid: u32,
        /// Human-readable diagnostic, not parsed by callers.
        reason: String,
    },
}

impl InjectorError {
    /// True iff the broker should retry this call (spec §4.2 step (c)).
    pub fn is_retryable(&self) -> bool {
        matches!(self, InjectorError::PartialCopy { .. })
    }
}

/// Factory the broker calls to perform the actual in-process injection.
///
/// Implementations must be safe to call concurrently for distinct target
/// pids; the broker serializes calls for the *same* pid itself.
pub trait ProcessInjector: Send + Sync {
    /// Attempts to inject the detour payload into `target_pid`.
    fn inject(&self, target_pid: u32, payload: &InjectionPayload) -> Result<(), InjectorError>;
}

/// Test double that always succeeds immediately.
#[derive(Debug, Default)]
pub struct NullInjector;

impl ProcessInjector for NullInjector {
    fn inject(&self, _target_pid: u32, _payload: &InjectionPayload) -> Result<(), InjectorError> {
        Ok(())
    }
}

/// Test double that reports [`InjectorError::PartialCopy`] a configured
/// number of times before succeeding, used to drive the broker's retry path
/// (spec §8 scenario 5).
#[derive(Debug)]
pub struct FlakyInjector {
    remaining_failures: Mutex<u32>,
}

impl FlakyInjector {
    /// Creates an injector that fails with `PartialCopy` `failures` times,
    /// then succeeds on every subsequent call.
    pub fn new(failures: u32) -> Self {
        FlakyInjector {
            remaining_failures: Mutex::new(failures),
        }
    }
}

impl ProcessInjector for FlakyInjector {
    fn inject(&self, target_pid: u32, _payload: &InjectionPayload) -> Result<(), InjectorError> {
        let mut remaining = self.remaining_failures.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            Err(InjectorError::PartialCopy { target_pid })
        } else {
            Ok(())
        }
    }
}

/// Test double that always fails with a non-retryable error, used to drive
/// the "skip future injections once one has failed" path.
#[derive(Debug, Default)]
pub struct AlwaysFailingInjector;

impl ProcessInjector for AlwaysFailingInjector {
    fn inject(&self, target_pid: u32, _payload: &InjectionPayload) -> Result<(), InjectorError> {
        Err(InjectorError::Other {
            target_pid,
            reason: "injected test failure".to_string(),
        })
    }
}
