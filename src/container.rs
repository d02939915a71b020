//! Container configuration / path virtualizer (spec §4.4).
//!
//! Built once per process from its declared outputs, then shared by
//! reference for the lifetime of the pip — construction does the
//! collapsing/allocation work so the hot-path query operations are simple
//! table lookups.

use std::collections::HashMap;

use crate::interning::{PathId, PathTable};

/// Whether an opaque output directory may receive writes from more than one
/// pip (spec GLOSSARY "Opaque directory").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpaqueKind {
    /// Disjoint subtrees may be written by different pips.
    Shared,
    /// Only this pip may write under the directory.
    Exclusive,
}

/// One declared output directory root.
#[derive(Debug, Clone, Copy)]
pub struct DeclaredOutputDirectory {
    /// The directory's original (pre-virtualization) path.
    pub root: PathId,
    /// Shared vs. exclusive.
    pub kind: OpaqueKind,
}

/// Inputs to [`ContainerConfiguration::build`] (spec §4.4 "Input").
pub struct ContainerInput {
    /// Declared file outputs (their parent directories are candidate
    /// output-containing directories when `isolate_outputs` is set).
    pub declared_file_outputs: Vec<PathId>,
    /// Declared output directories, each tagged shared/exclusive.
    pub declared_output_directories: Vec<DeclaredOutputDirectory>,
    /// Whether per-file output parents should be isolated.
    pub isolate_outputs: bool,
    /// Whether declared output directories tagged `Shared` are isolated.
    pub isolate_shared_opaques: bool,
    /// Whether declared output directories tagged `Exclusive` are isolated.
    pub isolate_exclusive_opaques: bool,
    /// Unique redirected root for this process.
    pub redirected_root: PathId,
}

impl ContainerInput {
    /// Builds the container input from a process description's declared
    /// outputs and isolation flags (spec §4.4 "Input").
    pub fn from_description(description: &crate::description::ProcessDescription) -> Self {
        ContainerInput {
            declared_file_outputs: description
                .declared_file_outputs
                .iter()
                .map(|output| output.path)
                .collect(),
            declared_output_directories: description.declared_output_directories.clone(),
            isolate_outputs: description.isolation_level.isolate_outputs,
            isolate_shared_opaques: description.isolation_level.isolate_shared_opaques,
            isolate_exclusive_opaques: description.isolation_level.isolate_exclusive_opaques,
            redirected_root: description.redirected_root,
        }
    }
}

/// The result of the "collapse nested directories" pass: a mapping from
/// every candidate original directory to the collapsed original that
/// represents it, plus the reverse one-to-many map.
struct CollapsedDirectories {
    original_to_collapsed: HashMap<PathId, PathId>,
    collapsed_to_originals: HashMap<PathId, Vec<PathId>>,
}

fn collapse_nested_directories(table: &PathTable, candidates: &[PathId]) -> CollapsedDirectories {
    // Two directories A, B collapse to A iff A is a strict prefix of B.
    // Sorting by expanded string length puts shallower (shorter) paths
    // first, so each candidate only ever needs to check already-accepted
    // roots for "am I nested under one of these".
    let mut sorted: Vec<PathId> = candidates.to_vec();
    sorted.sort_by_key(|id| table.expand_to_string(*id).len());

    let mut roots: Vec<PathId> = Vec::new();
    let mut original_to_collapsed = HashMap::new();
    let mut collapsed_to_originals: HashMap<PathId, Vec<PathId>> = HashMap::new();

    for candidate in sorted {
        let existing_root = roots.iter().copied().find(|root| {
            *root == candidate || table.is_within(candidate, *root)
        });
        let root = existing_root.unwrap_or_else(|| {
            roots.push(candidate);
            candidate
        });
        original_to_collapsed.insert(candidate, root);
        collapsed_to_originals.entry(root).or_default().push(candidate);
    }

    CollapsedDirectories {
        original_to_collapsed,
        collapsed_to_originals,
    }
}

/// Immutable, freely-shared-by-reference record produced once per process
/// (spec §5 shared-resource policy).
pub struct ContainerConfiguration {
    original_to_redirected: HashMap<PathId, PathId>,
    redirected_to_originals: HashMap<PathId, Vec<PathId>>,
}

impl ContainerConfiguration {
    /// Runs the full construction algorithm (spec §4.4 steps 1-4).
    pub fn build(table: &PathTable, input: &ContainerInput) -> Self {
        let mut candidates: Vec<PathId> = Vec::new();

        if input.isolate_outputs {
            for &file in &input.declared_file_outputs {
                if let Some(parent) = table.parent(file) {
                    candidates.push(parent);
                }
            }
        }
        for dir in &input.declared_output_directories {
            let isolate = match dir.kind {
                OpaqueKind::Shared => input.isolate_shared_opaques,
                OpaqueKind::Exclusive => input.isolate_exclusive_opaques,
            };
            if isolate {
                candidates.push(dir.root);
            }
        }
        candidates.sort_by_key(|id| table.expand_to_string(*id));
        candidates.dedup();

        let collapsed = collapse_nested_directories(table, &candidates);

        // Allocate one redirected directory per collapsed original, named
        // by its leaf atom; collisions within this process get a `_1`,
        // `_2`, ... suffix.
        let mut used_names: HashMap<String, u32> = HashMap::new();
        let mut collapsed_redirected: HashMap<PathId, PathId> = HashMap::new();
        let mut collapsed_roots: Vec<PathId> = collapsed.collapsed_to_originals.keys().copied().collect();
        collapsed_roots.sort_by_key(|id| table.expand_to_string(*id));

        for root in collapsed_roots {
            let leaf = table.leaf_name(root);
            let name = match used_names.get_mut(&leaf) {
                None => {
                    used_names.insert(leaf.clone(), 0);
                    leaf
                }
                Some(count) => {
                    *count += 1;
                    format!("{leaf}_{count}")
                }
            };
            let redirected = table.combine(input.redirected_root, &name);
            collapsed_redirected.insert(root, redirected);
        }

        // Populate original -> redirected for every non-collapsed original,
        // relocating the collapsed target to preserve the original's
        // relative depth (spec §4.4 step 4).
        let mut original_to_redirected = HashMap::new();
        let mut redirected_to_originals: HashMap<PathId, Vec<PathId>> = HashMap::new();

        for &original in &candidates {
            let collapsed_root = collapsed.original_to_collapsed[&original];
            let redirected_root = collapsed_redirected[&collapsed_root];
            let redirected = if original == collapsed_root {
                redirected_root
            } else {
                table
                    .relocate(original, collapsed_root, redirected_root)
                    .expect("original was confirmed within collapsed_root by the collapse pass")
            };
            original_to_redirected.insert(original, redirected);
            redirected_to_originals.entry(redirected).or_default().push(original);
        }

        ContainerConfiguration {
            original_to_redirected,
            redirected_to_originals,
        }
    }

    /// Looks up the redirected path for a declared file output. Expects
    /// the output's parent directory to have exactly one redirected
    /// mapping (spec §4.4 "Query operations").
    pub fn redirected_for_declared_output(&self, table: &PathTable, path: PathId) -> Option<PathId> {
        let parent = table.parent(path)?;
        let redirected_parent = *self.original_to_redirected.get(&parent)?;
        let leaf = table.leaf_name(path);
        Some(table.combine(redirected_parent, &leaf))
    }

    /// Looks up the redirected path for a file discovered dynamically
    /// under an opaque output directory.
    pub fn redirected_for_opaque_output(
        &self,
        table: &PathTable,
        declared_root: PathId,
        file_under_root: PathId,
    ) -> Option<PathId> {
        let redirected_root = *self.original_to_redirected.get(&declared_root)?;
        table.relocate(file_under_root, declared_root, redirected_root)
    }

    /// True iff `original` participates in this configuration at all — lets
    /// callers distinguish "not isolated" from "mis-configured" (spec §4.4).
    pub fn is_configured(&self, original: PathId) -> bool {
        self.original_to_redirected.contains_key(&original)
    }

    /// All originals that map to a given redirected directory.
    pub fn originals_for_redirected(&self, redirected: PathId) -> &[PathId] {
        self.redirected_to_originals
            .get(&redirected)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn collapses_nested_directories_to_their_shallowest_ancestor() {
        let table = PathTable::new();
        let shallow = table.intern(Path::new("/out"));
        let deep = table.intern(Path::new("/out/nested"));
        let collapsed = collapse_nested_directories(&table, &[deep, shallow]);
        assert_eq!(collapsed.original_to_collapsed[&deep], shallow);
        assert_eq!(collapsed.original_to_collapsed[&shallow], shallow);
        assert_eq!(collapsed.collapsed_to_originals[&shallow].len(), 2);
    }

    #[test]
    fn collision_within_one_process_gets_numeric_suffix() {
        let table = PathTable::new();
        let a = table.intern(Path::new("/a/out"));
        let b = table.intern(Path::new("/b/out"));
        let redirected_root = table.intern(Path::new("/redir"));

        let input = ContainerInput {
            declared_file_outputs: vec![],
            declared_output_directories: vec![
                DeclaredOutputDirectory { root: a, kind: OpaqueKind::Exclusive },
                DeclaredOutputDirectory { root: b, kind: OpaqueKind::Exclusive },
            ],
            isolate_outputs: false,
            isolate_shared_opaques: false,
            isolate_exclusive_opaques: true,
            redirected_root,
        };
        let config = ContainerConfiguration::build(&table, &input);
        let redirected_a = config.original_to_redirected[&a];
        let redirected_b = config.original_to_redirected[&b];
        assert_ne!(redirected_a, redirected_b);
        let names = [
            table.leaf_name(redirected_a),
            table.leaf_name(redirected_b),
        ];
        assert!(names.contains(&"out".to_string()));
        assert!(names.contains(&"out_1".to_string()));
    }

    #[test]
    fn redirected_for_declared_output_relocates_parent_then_appends_leaf() {
        let table = PathTable::new();
        let parent = table.intern(Path::new("/out"));
        let file = table.intern(Path::new("/out/a.txt"));
        let redirected_root = table.intern(Path::new("/redir"));

        let input = ContainerInput {
            declared_file_outputs: vec![file],
            declared_output_directories: vec![],
            isolate_outputs: true,
            isolate_shared_opaques: false,
            isolate_exclusive_opaques: false,
            redirected_root,
        };
        let config = ContainerConfiguration::build(&table, &input);
        let redirected = config
            .redirected_for_declared_output(&table, file)
            .unwrap();
        assert_eq!(table.expand_to_string(redirected), "/redir/out/a.txt");
    }

    #[test]
    fn unconfigured_root_is_not_configured() {
        let table = PathTable::new();
        let untouched = table.intern(Path::new("/never/mentioned"));
        let redirected_root = table.intern(Path::new("/redir"));
        let config = ContainerConfiguration::build(
            &table,
            &ContainerInput {
                declared_file_outputs: vec![],
                declared_output_directories: vec![],
                isolate_outputs: false,
                isolate_shared_opaques: false,
                isolate_exclusive_opaques: false,
                redirected_root,
            },
        );
        assert!(!config.is_configured(untouched));
    }
}
