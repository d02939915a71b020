//! Process description and isolation configuration (spec §3 "Process
//! description"), consumed but not owned by the core: the scheduler builds
//! one of these per pip and hands it to [`crate::runner::DetouredProcessRunner`].

use std::collections::HashMap;
use std::time::Duration;

use crate::container::{DeclaredOutputDirectory, OpaqueKind};
use crate::interning::PathId;
use crate::merger::DoubleWritePolicy;

/// Which isolation facets are enabled for a pip (spec §3 `isolation_level`
/// bits).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IsolationLevel {
    /// Redirect declared file outputs' parent directories.
    pub isolate_outputs: bool,
    /// Redirect shared opaque output directories.
    pub isolate_shared_opaques: bool,
    /// Redirect exclusive opaque output directories.
    pub isolate_exclusive_opaques: bool,
}

impl IsolationLevel {
    /// No isolation facets enabled; the process runs with no container.
    pub fn none() -> Self {
        IsolationLevel::default()
    }

    /// True if any facet is enabled (spec §3 `isolation_enabled`
    /// derivation).
    pub fn any_enabled(&self) -> bool {
        self.isolate_outputs || self.isolate_shared_opaques || self.isolate_exclusive_opaques
    }
}

/// One declared file output edge.
#[derive(Debug, Clone, Copy)]
pub struct DeclaredFileOutput {
    /// The output's final (un-redirected) path.
    pub path: PathId,
    /// `1` if produced exactly once; `>1` if a prior pip is expected to
    /// have produced it and this pip overwrites it (spec GLOSSARY "Rewrite
    /// count").
    pub rewrite_count: u32,
}

/// Everything the runner needs to start and supervise one child process.
///
/// Constructed by the caller (the scheduler, out of scope here); the core
/// only reads from it.
pub struct ProcessDescription {
    /// Argv, including argv\[0\].
    pub command_line: Vec<String>,
    /// Working directory for the child.
    pub working_directory: PathId,
    /// The child's explicit environment block (spec §6: "explicit
    /// environment block" — never inherited implicitly).
    pub environment: HashMap<String, String>,
    /// Declared file outputs.
    pub declared_file_outputs: Vec<DeclaredFileOutput>,
    /// Declared output directories, each tagged shared/exclusive.
    pub declared_output_directories: Vec<DeclaredOutputDirectory>,
    /// Double-write handling policy for the merger.
    pub double_write_policy: DoubleWritePolicy,
    /// Which isolation facets apply.
    pub isolation_level: IsolationLevel,
    /// Wall-clock budget before the runner kills the child (spec §4.3
    /// "Timed out").
    pub timeout: Duration,
    /// This pip's unique redirected directory root.
    pub redirected_root: PathId,
    /// Whether the child may escape the job object (spec §4.3 step 3
    /// `allow_breakaway`).
    pub allow_breakaway: bool,
}

impl ProcessDescription {
    /// True iff this pip declares any shared opaque output directories.
    pub fn has_shared_opaques(&self) -> bool {
        self.declared_output_directories
            .iter()
            .any(|d| d.kind == OpaqueKind::Shared)
    }

    /// True iff this pip declares any exclusive opaque output directories.
    pub fn has_exclusive_opaques(&self) -> bool {
        self.declared_output_directories
            .iter()
            .any(|d| d.kind == OpaqueKind::Exclusive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolation_level_none_has_nothing_enabled() {
        assert!(!IsolationLevel::none().any_enabled());
    }

    #[test]
    fn isolation_level_any_enabled_true_if_one_facet_set() {
        let level = IsolationLevel {
            isolate_outputs: false,
            isolate_shared_opaques: true,
            isolate_exclusive_opaques: false,
        };
        assert!(level.any_enabled());
    }
}
