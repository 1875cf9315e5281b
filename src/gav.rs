//! Derivation of `group:artifact:version` coordinates from the position of
//! an artifact inside a repository tree.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use tracing::warn;

/// Shortest directory name accepted as a content digest in the
/// content-addressed layout. SHA-1 digests are 40 hex characters; 39 keeps
/// headroom for truncated digests observed in the wild.
const MIN_DIGEST_DIR_LEN: usize = 39;

/// How a repository tree encodes coordinates in its directory structure.
///
/// This is an explicit mode chosen by the operator. Inferring it from
/// directory-name length alone would misclassify version strings that
/// happen to be digest-length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoLayout {
    /// Maven-style: `.../group/path/segments/artifact/version/file.jar`.
    Flat,
    /// Gradle-cache-style: `.../group/artifact/version/<digest>/file.jar`,
    /// where the immediate parent directory is a content digest.
    ContentAddressed,
}

/// Derives the GAV for an artifact sitting in a flat-layout repository.
///
/// The group id is the repository-relative path above the artifact
/// directory, with separators replaced by dots.
pub fn flat_gav(repo_root: &Path, artifact_path: &Path) -> Result<String> {
    let relative = artifact_path.strip_prefix(repo_root).with_context(|| {
        format!(
            "artifact {} is not under repository root {}",
            artifact_path.display(),
            repo_root.display()
        )
    })?;
    let components: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    // group/artifact/version/file is the minimum depth that yields a
    // non-empty group id.
    if components.len() < 4 {
        return Err(anyhow!(
            "artifact path {} is too shallow to carry group/artifact/version",
            artifact_path.display()
        ));
    }
    let version = &components[components.len() - 2];
    let artifact = &components[components.len() - 3];
    let group = components[..components.len() - 3].join(".");
    Ok(format!("{group}:{artifact}:{version}"))
}

/// Derives the GAV for a resolved artifact under the given layout.
///
/// Returns `Ok(None)` when the path cannot be resolved in the
/// content-addressed layout (logged as a warning); flat-layout paths that
/// cannot be resolved are malformed repository structure and fatal.
pub fn derive(repo_root: &Path, artifact_path: &Path, layout: RepoLayout) -> Result<Option<String>> {
    match layout {
        RepoLayout::Flat => flat_gav(repo_root, artifact_path).map(Some),
        RepoLayout::ContentAddressed => Ok(content_addressed_gav(artifact_path)),
    }
}

fn content_addressed_gav(artifact_path: &Path) -> Option<String> {
    let digest_dir = artifact_path.parent()?;
    if !is_digest_name(digest_dir.file_name()?.to_string_lossy().as_ref()) {
        warn!("could not determine GAV for {}", artifact_path.display());
        return None;
    }
    let version = digest_dir.parent()?;
    let artifact = version.parent()?;
    let group = artifact.parent()?;
    match (group.file_name(), artifact.file_name(), version.file_name()) {
        (Some(group), Some(artifact), Some(version)) => Some(format!(
            "{}:{}:{}",
            group.to_string_lossy(),
            artifact.to_string_lossy(),
            version.to_string_lossy()
        )),
        _ => {
            warn!("could not determine GAV for {}", artifact_path.display());
            None
        }
    }
}

fn is_digest_name(name: &str) -> bool {
    name.len() >= MIN_DIGEST_DIR_LEN && name.chars().all(|c| c.is_ascii_hexdigit())
}
