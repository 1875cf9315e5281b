//! The repository class index.
//!
//! Scanning the local package repository produces a map from class name to
//! every jar that contains that class, keyed further by the content hash of
//! the class bytes inside each jar. A class name present in the index has
//! not (yet) been explained by the build itself; the reduction pass removes
//! every class the build's output compiled, leaving only classes that can
//! only have arrived through a dependency.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

use crate::fs_guard;
use crate::gav;
use crate::tracker::{ClassFileTracker, TrackingData};

/// Marker file recording where each entry in an artifact-version directory
/// came from.
const ORIGIN_MARKER_FILE: &str = "_remote.repositories";

/// Maximum accepted size of an origin marker file.
const MAX_MARKER_BYTES: u64 = 1024 * 1024; // 1MB

/// The module descriptor pseudo-class present in modular jars. It names no
/// real type and would collide across every modular artifact.
const MODULE_DESCRIPTOR: &str = "module-info";

/// Suffix of this tool's own packaged executables, which are never
/// community dependencies.
const RUNNER_JAR_SUFFIX: &str = "-runner.jar";

/// Class name -> jar path -> content hash of the class bytes in that jar.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassIndex {
    classes: BTreeMap<String, BTreeMap<PathBuf, String>>,
}

impl ClassIndex {
    pub fn record(&mut self, class_name: &str, jar: &Path, hash: &str) {
        self.classes
            .entry(class_name.to_string())
            .or_default()
            .insert(jar.to_path_buf(), hash.to_string());
    }

    /// Drops a class name entirely: the build produced it, so no jar needs
    /// to explain it.
    pub fn remove_class(&mut self, class_name: &str) {
        self.classes.remove(class_name);
    }

    /// The jars containing `class_name`, with the content hash each one
    /// holds for it.
    pub fn candidates(&self, class_name: &str) -> Option<&BTreeMap<PathBuf, String>> {
        self.classes.get(class_name)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// Walks a flat-layout package repository and builds the class index.
///
/// Also returns every provenance record the repository's artifacts carry:
/// embedded records where present, and an `"unknown"`-source placeholder
/// for any jar with no embedded record for its own coordinate.
///
/// Artifact-version directories whose origin marker says every entry was
/// built locally are skipped outright; nothing in them can be a downloaded
/// community artifact.
pub fn scan_repository(
    repo_root: &Path,
    tracker: &dyn ClassFileTracker,
) -> Result<(ClassIndex, BTreeSet<TrackingData>)> {
    let mut index = ClassIndex::default();
    let mut repo_records = BTreeSet::new();

    let mut walker = WalkDir::new(repo_root).follow_links(false).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.with_context(|| format!("walking {}", repo_root.display()))?;
        if entry.file_type().is_dir() {
            if all_entries_built_locally(&entry.path().join(ORIGIN_MARKER_FILE))? {
                walker.skip_current_dir();
            }
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy();
        if !file_name.ends_with(".jar") || file_name.ends_with(RUNNER_JAR_SUFFIX) {
            continue;
        }

        let gav = gav::flat_gav(repo_root, entry.path())?;
        info!("found GAV {gav}");

        let jar_path = entry.path();
        let records = tracker.read_archive(jar_path, &mut |class_name, hash| {
            if class_name == MODULE_DESCRIPTOR {
                return;
            }
            index.record(class_name, jar_path, hash);
        })?;

        if records.is_empty() {
            repo_records.insert(TrackingData::unknown(gav));
        } else {
            let own_gav_tracked = records.iter().any(|r| r.gav == gav);
            repo_records.extend(records);
            if !own_gav_tracked {
                repo_records.insert(TrackingData::unknown(gav));
            }
        }
    }
    Ok((index, repo_records))
}

/// Removes from the index every class name the build's output compiled.
///
/// Only loose class files count here: a class file the build wrote to its
/// output tree is explained by the build, whatever jars it also appears in.
pub fn reduce_build_output(
    index: &mut ClassIndex,
    build_paths: &[PathBuf],
    tracker: &dyn ClassFileTracker,
) -> Result<()> {
    for root in build_paths {
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.with_context(|| format!("walking {}", root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if !entry.file_name().to_string_lossy().ends_with(".class") {
                continue;
            }
            tracker.read_class(entry.path(), &mut |class_name, _hash| {
                index.remove_class(class_name);
            })?;
        }
    }
    Ok(())
}

/// Parses an origin marker file and reports whether every entry in the
/// directory was built locally.
///
/// Marker keys are file names suffixed with `>` plus an optional origin
/// tag: `lib-1.0.jar>central` for a downloaded entry, `lib-1.0.jar>` for a
/// locally-built one. A missing marker means the directory's origin is
/// unknown, so it is walked normally.
fn all_entries_built_locally(marker_path: &Path) -> Result<bool> {
    if !marker_path.exists() {
        return Ok(false);
    }
    let raw = fs_guard::read_validated(marker_path, MAX_MARKER_BYTES)?;
    let text = String::from_utf8_lossy(&raw);
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let key = line
            .split_once('=')
            .map_or(line, |(key, _)| key)
            .trim();
        if !key.ends_with('>') {
            return Ok(false);
        }
    }
    Ok(true)
}
