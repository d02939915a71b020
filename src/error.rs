use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the sandboxed process execution core.
///
/// Variant set is stable across reimplementations of this subsystem: callers
/// match on it to decide whether a pip failed for a reason the cache layer
/// cares about (e.g. [`CoreError::DisallowedDoubleWrite`]) or for a reason
/// that is simply fatal (e.g. [`CoreError::ProcessCreationFailed`]).
#[derive(Debug, Error)]
pub enum CoreError {
    /// Creating or configuring an inheritable pipe failed.
    #[error("pipe setup failed (native error {native_code})")]
    PipeSetupFailed {
        /// The raw OS error code, if one was available.
        native_code: i32,
    },

    /// The OS refused to create the child process.
    #[error("process creation failed (native error {native_code})")]
    ProcessCreationFailed {
        /// The raw OS error code, if one was available.
        native_code: i32,
    },

    /// Detour injection failed, either at process creation time or later via
    /// the broker.
    #[error("detours injection failed during {phase}")]
    DetoursInjectionFailed {
        /// Which phase the failure happened in (e.g. `"create"`, `"broker"`).
        phase: &'static str,
    },

    /// The process did not exit before its configured timeout elapsed.
    #[error("process timed out")]
    Timeout,

    /// A declared output was written more than once and the pip's double
    /// write policy is `DoubleWritesAreErrors`.
    #[error("disallowed double write: declared {declared:?}, redirected source {source:?}")]
    DisallowedDoubleWrite {
        /// The declared (final) destination path.
        declared: PathBuf,
        /// The redirected path that was about to be merged onto it.
        source: PathBuf,
    },

    /// A hardlink merge failed for a reason unrelated to double-write policy.
    #[error("hardlink merge failed (native error {native_code})")]
    HardlinkFailed {
        /// The raw OS error code, if one was available.
        native_code: i32,
    },

    /// The sideband log could not be fully decoded; readers degrade
    /// gracefully and return this only when no further paths could be
    /// recovered at all (e.g. the header itself was unreadable).
    #[error("sideband log corrupted: {reason}")]
    SidebandCorrupted {
        /// Human-readable description of what failed to parse.
        reason: String,
    },

    /// The operation was canceled by a forced shutdown.
    #[error("operation canceled")]
    Canceled,

    /// Catch-all for OS errors that don't need their own variant.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Wraps the last OS error as a [`CoreError::PipeSetupFailed`].
    pub fn pipe_setup_failed() -> CoreError {
        let native_code = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(-1);
        CoreError::PipeSetupFailed { native_code }
    }

    /// Wraps the last OS error as a [`CoreError::ProcessCreationFailed`].
    pub fn process_creation_failed() -> CoreError {
        let native_code = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(-1);
        CoreError::ProcessCreationFailed { native_code }
    }

    /// True for errors that are never retried by the runner.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CoreError::Io(_))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoreError>;
