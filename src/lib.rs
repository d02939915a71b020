//! Sandboxed process execution core for a distributed build engine.
//!
//! This crate runs one pip (one build step) as a detoured child process:
//! it starts the process under a job object, brokers the detour DLL's
//! requests to inject itself into any children the pip spawns, drains its
//! stdout/stderr as line streams, enforces a per-pip output-redirection
//! sandbox, and merges the redirected outputs back onto their declared
//! destinations once the process exits.
//!
//! The pieces compose roughly in call order:
//!
//! * [`description`] — the immutable [`ProcessDescription`] the caller
//!   builds once per pip.
//! * [`container`] — turns a process description's declared outputs into a
//!   [`ContainerConfiguration`] that redirects writes into an isolated
//!   directory tree.
//! * [`injector`] and [`broker`] — the process-tree injector and the
//!   control-pipe protocol that lets a detoured child ask to have its own
//!   children injected in turn.
//! * [`job`] and [`process`] — the job-object/process-group and process
//!   handle wrapped across platforms.
//! * [`pipe`] and [`line_decoder`] — inheritable pipe creation and the
//!   async line readers that drain a child's stdout/stderr.
//! * [`runner`] — [`DetouredProcessRunner`], the integration glue tying all
//!   of the above into one pip's `start → wait → merge` lifecycle.
//! * [`merger`] — hardlinks redirected outputs onto their declared
//!   destinations once the process has exited.
//! * [`sideband`] and [`tagged`] — the durable out-of-band write log a
//!   detoured child's file-system filter reports through, independent of
//!   stdout/stderr.
//! * [`interning`] — the path-interning table ([`PathTable`]/[`PathId`])
//!   everything above shares to avoid repeatedly allocating/hashing full
//!   path strings.
//! * [`logging`] and [`error`] — the ambient logging sink and the crate's
//!   error type.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use pip_sandbox::error::Result;
//! use pip_sandbox::interning::PathTable;
//! use pip_sandbox::logging::{NullLogSink, LogSink};
//!
//! # fn run() -> Result<()> {
//! let table = PathTable::new();
//! let root = table.intern(Path::new("/tmp"));
//! let log: Arc<dyn LogSink> = Arc::new(NullLogSink);
//! log.log(pip_sandbox::logging::LogRecord::new(
//!     pip_sandbox::logging::Level::Debug,
//!     "example_interned_root",
//! ));
//! let _ = root;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod broker;
pub mod container;
pub mod description;
pub mod error;
pub mod injector;
pub mod interning;
pub mod job;
pub mod line_decoder;
pub mod logging;
pub mod merger;
pub mod pipe;
pub mod process;
pub mod runner;
pub mod sideband;
pub mod tagged;

pub use container::{ContainerConfiguration, ContainerInput, DeclaredOutputDirectory, OpaqueKind};
pub use description::{DeclaredFileOutput, IsolationLevel, ProcessDescription};
pub use error::{CoreError, Result};
pub use interning::{PathId, PathTable};
pub use logging::{Level, LogRecord, LogSink, NullLogSink, TracingLogSink};
pub use merger::{DeclaredOutput, DoubleWritePolicy, OutputMerger};
pub use process::{ExitStatus, Process};
pub use runner::{DetouredProcessRunner, RunResult};
