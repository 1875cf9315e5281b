//! Resolution of observed build-output classes against the class index.
//!
//! Most hits resolve immediately: the class lives in exactly one repository
//! jar, or its content hash singles one jar out of several. The rest are
//! true duplicates -- several jars carry byte-identical copies of the same
//! class -- and get deferred. Deferred groups resolve after every
//! build-output file has been seen, smallest group first: by then another,
//! unambiguous hit may already have pinned one of the group's jars, in
//! which case the group needs no further action. A group with no pinned
//! member keeps every candidate. Over-reporting a jar that was not actually
//! used is recoverable downstream; silently dropping a community dependency
//! is not.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::index::ClassIndex;

/// Jars that all matched the same class and could not be told apart by
/// content hash.
///
/// Groups order by size first, then by their canonical string form, so that
/// iterating a set of groups always resolves the most constrained ones
/// first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateGroup {
    jars: BTreeSet<PathBuf>,
}

impl CandidateGroup {
    pub fn new(jars: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            jars: jars.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.jars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathBuf> {
        self.jars.iter()
    }

    /// Stable, human-readable rendering used for ordering and diagnostics.
    pub fn canonical_string(&self) -> String {
        let joined: Vec<String> = self.jars.iter().map(|p| p.display().to_string()).collect();
        format!("[{}]", joined.join(", "))
    }
}

impl Ord for CandidateGroup {
    fn cmp(&self, other: &Self) -> Ordering {
        self.jars
            .len()
            .cmp(&other.jars.len())
            .then_with(|| self.canonical_string().cmp(&other.canonical_string()))
    }
}

impl PartialOrd for CandidateGroup {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl IntoIterator for CandidateGroup {
    type Item = PathBuf;
    type IntoIter = std::collections::btree_set::IntoIter<PathBuf>;

    fn into_iter(self) -> Self::IntoIter {
        self.jars.into_iter()
    }
}

/// Accumulates class hits across the build output, then resolves the
/// deferred groups.
#[derive(Debug, Default)]
pub struct HitResolver {
    additional: BTreeSet<PathBuf>,
    deferred: BTreeSet<CandidateGroup>,
}

impl HitResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one observed (class name, content hash) pair from `build_file`.
    pub fn observe(
        &mut self,
        index: &ClassIndex,
        class_name: &str,
        observed_hash: &str,
        build_file: &Path,
    ) {
        let Some(candidates) = index.candidates(class_name) else {
            return;
        };
        if candidates.len() > 1 {
            let matching: Vec<&PathBuf> = candidates
                .iter()
                .filter(|(_, hash)| hash.as_str() == observed_hash)
                .map(|(jar, _)| jar)
                .collect();
            match matching.len() {
                1 => self.mark(matching[0], build_file),
                0 => {
                    // nothing matched: the observed copy differs from every
                    // candidate, so none of them can be ruled out
                    self.deferred
                        .insert(CandidateGroup::new(candidates.keys().cloned()));
                }
                _ => {
                    self.deferred
                        .insert(CandidateGroup::new(matching.into_iter().cloned()));
                }
            }
        } else {
            for jar in candidates.keys() {
                self.mark(jar, build_file);
            }
        }
    }

    fn mark(&mut self, jar: &Path, build_file: &Path) {
        if self.additional.insert(jar.to_path_buf()) {
            info!(
                "community jar {} found in {}",
                jar.display(),
                build_file.display()
            );
        }
    }

    /// Resolves the deferred groups and returns every jar identified as an
    /// additional community dependency.
    pub fn finish(self) -> BTreeSet<PathBuf> {
        let Self {
            mut additional,
            deferred,
        } = self;
        for group in deferred {
            let already_resolved = group.iter().any(|jar| additional.contains(jar));
            if already_resolved {
                continue;
            }
            warn!(
                "unable to decide which jar supplied duplicate classes, keeping all of {}",
                group.canonical_string()
            );
            additional.extend(group);
        }
        additional
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_with(entries: &[(&str, &str, &str)]) -> ClassIndex {
        let mut index = ClassIndex::default();
        for (class_name, jar, hash) in entries {
            index.record(class_name, Path::new(jar), hash);
        }
        index
    }

    #[test]
    fn single_candidate_resolves_immediately() {
        let index = index_with(&[("com.acme.A", "/repo/a-1.0.jar", "h1")]);
        let mut resolver = HitResolver::new();
        resolver.observe(&index, "com.acme.A", "different", Path::new("out/app.jar"));
        let additional = resolver.finish();
        assert_eq!(additional.len(), 1);
        assert!(additional.contains(Path::new("/repo/a-1.0.jar")));
    }

    #[test]
    fn unknown_class_is_ignored() {
        let index = index_with(&[("com.acme.A", "/repo/a-1.0.jar", "h1")]);
        let mut resolver = HitResolver::new();
        resolver.observe(&index, "com.acme.B", "h1", Path::new("out/app.jar"));
        assert!(resolver.finish().is_empty());
    }

    #[test]
    fn hash_singles_out_one_of_two_candidates() {
        let index = index_with(&[
            ("com.acme.B", "/repo/b-1.0.jar", "h1"),
            ("com.acme.B", "/repo/b-2.0.jar", "h2"),
        ]);
        let mut resolver = HitResolver::new();
        resolver.observe(&index, "com.acme.B", "h2", Path::new("out/app.jar"));
        let additional = resolver.finish();
        assert_eq!(additional.len(), 1, "only the hash match may be kept");
        assert!(additional.contains(Path::new("/repo/b-2.0.jar")));
    }

    #[test]
    fn identical_hashes_keep_every_candidate_after_deferral() {
        let index = index_with(&[
            ("com.acme.C", "/repo/c-1.0.jar", "same"),
            ("com.acme.C", "/repo/c-2.0.jar", "same"),
        ]);
        let mut resolver = HitResolver::new();
        resolver.observe(&index, "com.acme.C", "same", Path::new("out/app.jar"));
        let additional = resolver.finish();
        assert_eq!(additional.len(), 2);
    }

    #[test]
    fn no_hash_match_defers_the_full_candidate_set() {
        let index = index_with(&[
            ("com.acme.C", "/repo/c-1.0.jar", "h1"),
            ("com.acme.C", "/repo/c-2.0.jar", "h2"),
        ]);
        let mut resolver = HitResolver::new();
        resolver.observe(&index, "com.acme.C", "h3", Path::new("out/app.jar"));
        let additional = resolver.finish();
        assert_eq!(additional.len(), 2);
    }

    #[test]
    fn group_with_an_already_marked_member_is_skipped() {
        let index = index_with(&[
            // class D is unique to d-1.0.jar
            ("com.acme.D", "/repo/d-1.0.jar", "hd"),
            // class E is duplicated between d-1.0.jar and d-2.0.jar
            ("com.acme.E", "/repo/d-1.0.jar", "same"),
            ("com.acme.E", "/repo/d-2.0.jar", "same"),
        ]);
        let mut resolver = HitResolver::new();
        resolver.observe(&index, "com.acme.E", "same", Path::new("out/app.jar"));
        resolver.observe(&index, "com.acme.D", "hd", Path::new("out/app.jar"));
        let additional = resolver.finish();
        // d-1.0.jar already explains the duplicate, d-2.0.jar stays out
        assert_eq!(additional.len(), 1);
        assert!(additional.contains(Path::new("/repo/d-1.0.jar")));
    }

    #[test]
    fn smaller_groups_resolve_before_larger_ones() {
        let index = index_with(&[
            ("com.acme.F", "/repo/x-1.0.jar", "same"),
            ("com.acme.F", "/repo/x-2.0.jar", "same"),
            ("com.acme.G", "/repo/x-1.0.jar", "g1"),
            ("com.acme.G", "/repo/x-2.0.jar", "g2"),
            ("com.acme.G", "/repo/x-3.0.jar", "g3"),
        ]);
        let mut resolver = HitResolver::new();
        // three-way group first, two-way group second: resolution order
        // must not depend on observation order
        resolver.observe(&index, "com.acme.G", "unmatched", Path::new("out/app.jar"));
        resolver.observe(&index, "com.acme.F", "same", Path::new("out/app.jar"));
        let additional = resolver.finish();
        // the two-way group keeps both jars; the three-way group then
        // already contains a marked member and adds nothing
        assert_eq!(additional.len(), 2);
        assert!(additional.contains(Path::new("/repo/x-1.0.jar")));
        assert!(additional.contains(Path::new("/repo/x-2.0.jar")));
        assert!(!additional.contains(Path::new("/repo/x-3.0.jar")));
    }

    #[test]
    fn group_ordering_is_by_size_then_string_form() {
        let small = CandidateGroup::new([PathBuf::from("/repo/z.jar")]);
        let big_a = CandidateGroup::new([PathBuf::from("/repo/a.jar"), PathBuf::from("/repo/b.jar")]);
        let big_b = CandidateGroup::new([PathBuf::from("/repo/a.jar"), PathBuf::from("/repo/c.jar")]);
        let groups: BTreeSet<_> = [big_b.clone(), small.clone(), big_a.clone()].into();
        let ordered: Vec<_> = groups.into_iter().collect();
        assert_eq!(ordered, vec![small, big_a, big_b]);
    }

    #[test]
    fn repeated_hits_mark_a_jar_once() {
        let index = index_with(&[("com.acme.A", "/repo/a-1.0.jar", "h1")]);
        let mut resolver = HitResolver::new();
        resolver.observe(&index, "com.acme.A", "x", Path::new("out/app.jar"));
        resolver.observe(&index, "com.acme.A", "y", Path::new("out/other.jar"));
        assert_eq!(resolver.finish().len(), 1);
    }
}
