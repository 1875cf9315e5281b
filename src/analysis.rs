//! The analysis pipeline.
//!
//! Scans the local repository, subtracts the build's own classes, resolves
//! every class the build output observed, derives coordinates for the
//! matched jars, and filters the result through the operator allow-list.
//! Each stage returns its results explicitly; nothing accumulates in
//! shared state, so every stage is unit-testable on its own.

use anyhow::{Context, Result};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::gav::{self, RepoLayout};
use crate::index;
use crate::resolve::HitResolver;
use crate::tracker::{ClassFileTracker, TrackingData};

/// Build-output archive extensions routed through the archive reader.
const ARCHIVE_SUFFIXES: &[&str] = &[".jar", ".war", ".ear"];

/// Operator-supplied patterns naming GAVs that may come from community
/// sources without failing the build.
///
/// Patterns match the whole GAV, not a substring: `com\.acme:.*` allows
/// everything under the group, plain `com\.acme` allows nothing.
#[derive(Debug, Default)]
pub struct AllowList {
    rules: Vec<AllowRule>,
}

#[derive(Debug)]
struct AllowRule {
    pattern: String,
    regex: Regex,
}

impl AllowList {
    pub fn compile(patterns: &[String]) -> Result<Self> {
        let mut rules = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let regex = Regex::new(&format!("^(?:{pattern})$"))
                .with_context(|| format!("invalid allowed-artifacts pattern `{pattern}`"))?;
            rules.push(AllowRule {
                pattern: pattern.clone(),
                regex,
            });
        }
        Ok(Self { rules })
    }

    /// Returns the first pattern fully matching `gav`, if any.
    pub fn matched_pattern(&self, gav: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| rule.regex.is_match(gav))
            .map(|rule| rule.pattern.as_str())
    }
}

/// Inputs to one analysis run.
pub struct AnalysisRequest<'a> {
    /// Root of the local package repository, usually `$HOME/.m2/repository`.
    pub maven_repo: &'a Path,
    /// Build output roots to check for community artifacts.
    pub build_paths: &'a [PathBuf],
    /// Provenance sources treated as approved.
    pub allowed_sources: BTreeSet<String>,
    /// GAV patterns allowed to come from community sources.
    pub allow_list: AllowList,
    /// Layout convention of `maven_repo`.
    pub layout: RepoLayout,
}

/// Everything one analysis run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisOutcome {
    /// Every provenance record observed in or attributed to the build
    /// output, community placeholders included. Input to the full SBOM.
    pub tracking_data: BTreeSet<TrackingData>,
    /// Provenance of every artifact in the local repository, with
    /// `"unknown"` placeholders. Input to the repository SBOM.
    pub repo_records: BTreeSet<TrackingData>,
    /// Community GAVs remaining after allow-list filtering. Non-empty
    /// means the build pulled in unapproved dependencies.
    pub community_gavs: BTreeSet<String>,
}

/// Runs the full pipeline.
pub fn analyse(
    request: &AnalysisRequest<'_>,
    tracker: &dyn ClassFileTracker,
) -> Result<AnalysisOutcome> {
    let (mut class_index, repo_records) = index::scan_repository(request.maven_repo, tracker)?;
    index::reduce_build_output(&mut class_index, request.build_paths, tracker)?;
    let class_index = class_index;

    info!(
        "analysing build output roots {:?} against {} unexplained classes",
        request.build_paths,
        class_index.len()
    );

    let mut tracking_data: BTreeSet<TrackingData> = BTreeSet::new();
    let mut community_gavs: BTreeSet<String> = BTreeSet::new();
    let mut resolver = HitResolver::new();

    for root in request.build_paths {
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.with_context(|| format!("walking {}", root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy();
            debug!("processing {file_name}");
            let build_file = entry.path();
            if file_name.ends_with(".class") {
                tracker.read_class(build_file, &mut |class_name, hash| {
                    resolver.observe(&class_index, class_name, hash, build_file);
                })?;
            } else if is_archive(&file_name) {
                let records = tracker.read_archive(build_file, &mut |class_name, hash| {
                    resolver.observe(&class_index, class_name, hash, build_file);
                })?;
                for record in records {
                    if !request.allowed_sources.contains(&record.source) {
                        debug!("found GAV {} in {file_name}", record.gav);
                        community_gavs.insert(record.gav.clone());
                    }
                    tracking_data.insert(record);
                }
            }
        }
    }

    for jar in resolver.finish() {
        let Some(gav) = gav::derive(request.maven_repo, &jar, request.layout)? else {
            continue;
        };
        community_gavs.insert(gav.clone());
        tracking_data.insert(TrackingData::community(gav));
    }

    community_gavs.retain(|gav| match request.allow_list.matched_pattern(gav) {
        Some(pattern) => {
            info!("community dependency {gav} was allowed by specified pattern {pattern}");
            false
        }
        None => true,
    });

    Ok(AnalysisOutcome {
        tracking_data,
        repo_records,
        community_gavs,
    })
}

fn is_archive(file_name: &str) -> bool {
    ARCHIVE_SUFFIXES
        .iter()
        .any(|suffix| file_name.ends_with(suffix))
}
