//! Output merger (spec §4.5): hardlinks redirected outputs onto their
//! declared destinations, honoring the double-write policy.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{CoreError, Result};
use crate::logging::{Level, LogRecord, LogSink};

/// How the pip wants double writes to a declared output handled (spec
/// §4.5 step 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoubleWritePolicy {
    /// A second write to an existing, already-merged destination is an
    /// error.
    DoubleWritesAreErrors,
    /// The first writer to merge wins; later ones are silently skipped.
    UnsafeFirstDoubleWriteWins,
}

/// One declared file output to merge.
#[derive(Debug, Clone)]
pub struct DeclaredOutput {
    /// Where the redirected (sandboxed) write landed.
    pub redirected_path: PathBuf,
    /// Where it must be visible to the rest of the build.
    pub destination: PathBuf,
    /// `1` if this is the sole producer; `>1` for a sanctioned rewrite.
    pub rewrite_count: u32,
}

/// Returns true if `path` is a virtualization artifact (tombstone or
/// reparse marker) rather than real user data. This crate has no
/// filter-driver integration of its own; callers supply the predicate
/// appropriate to their platform (e.g. checking a reparse tag on Windows,
/// a sentinel xattr elsewhere).
pub trait ArtifactDetector: Send + Sync {
    /// Inspects `path` (which is known to exist) and reports whether it is
    /// a virtualization artifact.
    fn is_virtualization_artifact(&self, path: &Path) -> bool;
}

/// Detector that never reports an artifact; suitable when isolation is
/// disabled or for tests that don't exercise the filter-driver path.
#[derive(Debug, Default)]
pub struct NoArtifacts;

impl ArtifactDetector for NoArtifacts {
    fn is_virtualization_artifact(&self, _path: &Path) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy)]
struct MergeDecision {
    proceed: bool,
    should_delete: bool,
}

fn can_merge(destination: &Path, rewrite_count: u32, policy: DoubleWritePolicy) -> Result<MergeDecision> {
    if !destination.exists() {
        return Ok(MergeDecision {
            proceed: true,
            should_delete: false,
        });
    }
    if rewrite_count > 1 {
        return Ok(MergeDecision {
            proceed: true,
            should_delete: true,
        });
    }
    match policy {
        DoubleWritePolicy::DoubleWritesAreErrors => Err(CoreError::DisallowedDoubleWrite {
            declared: destination.to_path_buf(),
            source: PathBuf::new(),
        }),
        DoubleWritePolicy::UnsafeFirstDoubleWriteWins => Ok(MergeDecision {
            proceed: false,
            should_delete: false,
        }),
    }
}

/// Merges one pip's redirected outputs onto their declared destinations.
///
/// Holds a per-merge cache of parent directories already confirmed to
/// exist (spec §4.5 step 2), so merging many outputs under the same
/// destination tree doesn't repeatedly stat/create the same ancestors.
pub struct OutputMerger {
    policy: DoubleWritePolicy,
    artifacts: Box<dyn ArtifactDetector>,
    log: Arc<dyn LogSink>,
    created_parents: HashSet<PathBuf>,
}

impl OutputMerger {
    /// Creates a merger for one pip's policy.
    pub fn new(policy: DoubleWritePolicy, artifacts: Box<dyn ArtifactDetector>, log: Arc<dyn LogSink>) -> Self {
        OutputMerger {
            policy,
            artifacts,
            log,
            created_parents: HashSet::new(),
        }
    }

    fn ensure_parent_exists(&mut self, destination: &Path) -> Result<()> {
        let Some(parent) = destination.parent() else {
            return Ok(());
        };
        if self.created_parents.contains(parent) {
            return Ok(());
        }
        fs::create_dir_all(parent)?;
        self.created_parents.insert(parent.to_path_buf());
        Ok(())
    }

    fn hardlink_with_reevaluation(&mut self, source: &Path, destination: &Path, rewrite_count: u32) -> Result<()> {
        match fs::hard_link(source, destination) {
            Ok(()) => Ok(()),
            Err(first_err) => {
                // A competing merger may have satisfied can_merge concurrently
                // since we checked; re-evaluate before deciding the failure
                // mode (spec §4.5 step 3).
                let decision = can_merge(destination, rewrite_count, self.policy);
                match decision {
                    Err(CoreError::DisallowedDoubleWrite { declared, .. }) => {
                        self.log.log(
                            LogRecord::new(Level::Warn, "double_write_violation")
                                .with("destination", declared.display())
                                .with("source", source.display()),
                        );
                        Err(CoreError::DisallowedDoubleWrite {
                            declared,
                            source: source.to_path_buf(),
                        })
                    }
                    Ok(_) | Err(_) => {
                        let native_code = first_err.raw_os_error().unwrap_or(-1);
                        Err(CoreError::HardlinkFailed { native_code })
                    }
                }
            }
        }
    }

    /// Merges one declared output, applying the full `can_merge` →
    /// ensure-parent → delete-if-needed → hardlink flow, or deleting the
    /// redirected side outright if it turns out to be a virtualization
    /// artifact.
    pub fn merge_declared_output(&mut self, output: &DeclaredOutput) -> Result<()> {
        if !output.redirected_path.exists() {
            return Ok(());
        }
        if self.artifacts.is_virtualization_artifact(&output.redirected_path) {
            fs::remove_file(&output.redirected_path)?;
            return Ok(());
        }

        let decision = can_merge(&output.destination, output.rewrite_count, self.policy);
        let decision = match decision {
            Err(CoreError::DisallowedDoubleWrite { declared, .. }) => {
                self.log.log(
                    LogRecord::new(Level::Warn, "double_write_violation")
                        .with("destination", declared.display())
                        .with("source", output.redirected_path.display()),
                );
                return Err(CoreError::DisallowedDoubleWrite {
                    declared,
                    source: output.redirected_path.clone(),
                });
            }
            other => other?,
        };

        if !decision.proceed {
            self.log.log(
                LogRecord::new(Level::Info, "double_write_first_wins")
                    .with("destination", output.destination.display())
                    .with("source", output.redirected_path.display()),
            );
            return Ok(());
        }

        self.ensure_parent_exists(&output.destination)?;
        if decision.should_delete && output.destination.exists() {
            fs::remove_file(&output.destination)?;
        }
        self.hardlink_with_reevaluation(&output.redirected_path, &output.destination, output.rewrite_count)
    }

    /// Merges every declared output, short-circuiting on the first failure
    /// (spec §4.5 "Return value").
    pub fn merge_all(&mut self, outputs: &[DeclaredOutput]) -> Result<()> {
        for output in outputs {
            self.merge_declared_output(output)?;
        }
        Ok(())
    }

    /// Merges a dynamically-discovered opaque-directory write (shared or
    /// exclusive) with `rewrite_count = 1` always, per spec §4.5.
    pub fn merge_opaque_write(&mut self, redirected_path: &Path, destination: &Path) -> Result<()> {
        self.merge_declared_output(&DeclaredOutput {
            redirected_path: redirected_path.to_path_buf(),
            destination: destination.to_path_buf(),
            rewrite_count: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn merger(policy: DoubleWritePolicy) -> OutputMerger {
        OutputMerger::new(policy, Box::new(NoArtifacts), Arc::new(crate::logging::NullLogSink))
    }

    #[test]
    fn fresh_output_merges_via_hardlink() {
        let dir = tempdir().unwrap();
        let redirected = dir.path().join("redirected.txt");
        let destination = dir.path().join("out").join("final.txt");
        fs::write(&redirected, b"hello").unwrap();

        let mut m = merger(DoubleWritePolicy::DoubleWritesAreErrors);
        m.merge_declared_output(&DeclaredOutput {
            redirected_path: redirected.clone(),
            destination: destination.clone(),
            rewrite_count: 1,
        })
        .unwrap();

        assert_eq!(fs::read(&destination).unwrap(), b"hello");
    }

    #[test]
    fn double_write_errors_policy_rejects_existing_destination() {
        let dir = tempdir().unwrap();
        let redirected = dir.path().join("redirected.txt");
        let destination = dir.path().join("final.txt");
        fs::write(&redirected, b"new").unwrap();
        fs::write(&destination, b"old").unwrap();

        let mut m = merger(DoubleWritePolicy::DoubleWritesAreErrors);
        let err = m
            .merge_declared_output(&DeclaredOutput {
                redirected_path: redirected,
                destination: destination.clone(),
                rewrite_count: 1,
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::DisallowedDoubleWrite { .. }));
        assert_eq!(fs::read(&destination).unwrap(), b"old");
    }

    #[test]
    fn disallowed_double_write_logs_exactly_once_with_both_paths() {
        struct CaptureSink(std::sync::Mutex<Vec<LogRecord<'static>>>);
        impl LogSink for CaptureSink {
            fn log(&self, record: LogRecord<'_>) {
                self.0.lock().unwrap().push(LogRecord {
                    level: record.level,
                    event: "double_write_violation",
                    fields: record.fields,
                });
            }
        }

        let dir = tempdir().unwrap();
        let redirected = dir.path().join("redirected.txt");
        let destination = dir.path().join("final.txt");
        fs::write(&redirected, b"new").unwrap();
        fs::write(&destination, b"old").unwrap();

        let sink = Arc::new(CaptureSink(std::sync::Mutex::new(Vec::new())));
        let mut m = OutputMerger::new(
            DoubleWritePolicy::DoubleWritesAreErrors,
            Box::new(NoArtifacts),
            sink.clone(),
        );
        m.merge_declared_output(&DeclaredOutput {
            redirected_path: redirected.clone(),
            destination: destination.clone(),
            rewrite_count: 1,
        })
        .unwrap_err();

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event, "double_write_violation");
        let has_both_paths = records[0]
            .fields
            .iter()
            .any(|f| f.key == "destination" && f.value.contains("final.txt"))
            && records[0]
                .fields
                .iter()
                .any(|f| f.key == "source" && f.value.contains("redirected.txt"));
        assert!(has_both_paths);
    }

    #[test]
    fn first_wins_policy_skips_without_erroring() {
        let dir = tempdir().unwrap();
        let redirected = dir.path().join("redirected.txt");
        let destination = dir.path().join("final.txt");
        fs::write(&redirected, b"new").unwrap();
        fs::write(&destination, b"old").unwrap();

        let mut m = merger(DoubleWritePolicy::UnsafeFirstDoubleWriteWins);
        m.merge_declared_output(&DeclaredOutput {
            redirected_path: redirected,
            destination: destination.clone(),
            rewrite_count: 1,
        })
        .unwrap();
        assert_eq!(fs::read(&destination).unwrap(), b"old");
    }

    #[test]
    fn rewrite_count_above_one_deletes_then_replaces() {
        let dir = tempdir().unwrap();
        let redirected = dir.path().join("redirected.txt");
        let destination = dir.path().join("final.txt");
        fs::write(&redirected, b"new").unwrap();
        fs::write(&destination, b"old").unwrap();

        let mut m = merger(DoubleWritePolicy::DoubleWritesAreErrors);
        m.merge_declared_output(&DeclaredOutput {
            redirected_path: redirected,
            destination: destination.clone(),
            rewrite_count: 2,
        })
        .unwrap();
        assert_eq!(fs::read(&destination).unwrap(), b"new");
    }

    #[test]
    fn missing_redirected_path_is_a_noop() {
        let dir = tempdir().unwrap();
        let mut m = merger(DoubleWritePolicy::DoubleWritesAreErrors);
        m.merge_declared_output(&DeclaredOutput {
            redirected_path: dir.path().join("never_written.txt"),
            destination: dir.path().join("final.txt"),
            rewrite_count: 1,
        })
        .unwrap();
        assert!(!dir.path().join("final.txt").exists());
    }

    struct AlwaysArtifact;
    impl ArtifactDetector for AlwaysArtifact {
        fn is_virtualization_artifact(&self, _path: &Path) -> bool {
            true
        }
    }

    #[test]
    fn virtualization_artifact_is_deleted_not_merged() {
        let dir = tempdir().unwrap();
        let redirected = dir.path().join("redirected.txt");
        let destination = dir.path().join("final.txt");
        fs::write(&redirected, b"tombstone").unwrap();

        let mut m = OutputMerger::new(
            DoubleWritePolicy::DoubleWritesAreErrors,
            Box::new(AlwaysArtifact),
            Arc::new(crate::logging::NullLogSink),
        );
        m.merge_declared_output(&DeclaredOutput {
            redirected_path: redirected.clone(),
            destination,
            rewrite_count: 1,
        })
        .unwrap();
        assert!(!redirected.exists());
    }
}
