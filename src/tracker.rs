//! Provenance records and the class extraction boundary.
//!
//! DPW never parses jar or class-file bytes itself. Reading class names,
//! per-class content hashes, and embedded provenance records out of build
//! artifacts is an external capability, reached through the
//! [`ClassFileTracker`] trait. The production implementation,
//! [`ExternalTracker`], delegates to a configured command in the same way
//! the rest of the supply chain delegates signing to `cosign`: spawn the
//! tool, read structured JSON from stdout, fail loudly on anything else.
//!
//! The external command is expected to support two invocations:
//!
//! ```text
//! <cmd> archive <path>    read a jar/war archive
//! <cmd> class <path>      read a single loose class file
//! ```
//!
//! both printing a single JSON object:
//!
//! ```json
//! {
//!   "records": [{"gav": "com.acme:lib:1.0", "source": "rebuilt", "attributes": {}}],
//!   "classes": [{"name": "com.acme.Widget", "hash": "3f786850e387550f..."}]
//! }
//! ```

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::process::{Command, Stdio};

/// Largest chunk of extractor stderr echoed into an error message.
const MAX_TOOL_ERR_BYTES: usize = 8 * 1024; // 8KB

/// A claim that a given GAV originated from a named source.
///
/// Two records are the same record exactly when gav, source and attributes
/// all agree; sets of these deduplicate on that identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackingData {
    /// Canonical `group:artifact:version` coordinate.
    pub gav: String,
    /// Declared origin, e.g. "redhat", "rebuilt", "community", "unknown".
    pub source: String,
    /// Free-form origin metadata carried through into SBOM properties.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl TrackingData {
    pub fn new(
        gav: impl Into<String>,
        source: impl Into<String>,
        attributes: BTreeMap<String, String>,
    ) -> Self {
        Self {
            gav: gav.into(),
            source: source.into(),
            attributes,
        }
    }

    /// Placeholder record for a repository artifact that carries no embedded
    /// provenance for its own coordinate.
    pub fn unknown(gav: impl Into<String>) -> Self {
        Self::new(gav, "unknown", BTreeMap::new())
    }

    /// Record for a jar identified as a community dependency by class
    /// correlation rather than by embedded provenance.
    pub fn community(gav: impl Into<String>) -> Self {
        Self::new(gav, "community", BTreeMap::new())
    }
}

/// Extraction operations DPW consumes.
///
/// The observer is invoked once per class the file contains that carries no
/// embedded provenance record of its own, with the class name and the hex
/// content hash of that class's bytes. Classes with embedded records come
/// back through the record set instead.
pub trait ClassFileTracker {
    /// Reads any provenance records embedded in an archive, reporting every
    /// contained class through the observer.
    fn read_archive(
        &self,
        archive: &Path,
        observer: &mut dyn FnMut(&str, &str),
    ) -> Result<BTreeSet<TrackingData>>;

    /// Reads the class name (and content hash) of a single loose class
    /// file, reported through the observer. Loose classes carry no
    /// embedded records.
    fn read_class(&self, class_file: &Path, observer: &mut dyn FnMut(&str, &str)) -> Result<()>;
}

/// Wire format printed by the external extraction command.
#[derive(Debug, Default, Deserialize)]
struct ExtractionOutput {
    #[serde(default)]
    records: BTreeSet<TrackingData>,
    #[serde(default)]
    classes: Vec<ClassEntry>,
}

#[derive(Debug, Deserialize)]
struct ClassEntry {
    name: String,
    hash: String,
}

/// Production tracker: shells out to the configured extraction command.
#[derive(Debug, Clone)]
pub struct ExternalTracker {
    command: String,
}

impl ExternalTracker {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    fn run(&self, mode: &str, path: &Path) -> Result<ExtractionOutput> {
        let out = Command::new(&self.command)
            .arg(mode)
            .arg(path)
            .output()
            .with_context(|| format!("running {} {mode}", self.command))?;
        if !out.status.success() {
            return Err(anyhow!(
                "{} {mode} failed for {}: {}",
                self.command,
                path.display(),
                truncated_stderr(&out.stderr)
            ));
        }
        serde_json::from_slice(&out.stdout)
            .with_context(|| format!("parsing {} output for {}", self.command, path.display()))
    }
}

impl ClassFileTracker for ExternalTracker {
    fn read_archive(
        &self,
        archive: &Path,
        observer: &mut dyn FnMut(&str, &str),
    ) -> Result<BTreeSet<TrackingData>> {
        let output = self.run("archive", archive)?;
        for class in &output.classes {
            observer(&class.name, &class.hash);
        }
        Ok(output.records)
    }

    fn read_class(&self, class_file: &Path, observer: &mut dyn FnMut(&str, &str)) -> Result<()> {
        let output = self.run("class", class_file)?;
        for class in &output.classes {
            observer(&class.name, &class.hash);
        }
        Ok(())
    }
}

fn truncated_stderr(stderr: &[u8]) -> String {
    let mut s = String::from_utf8_lossy(stderr).trim().to_string();
    if s.len() > MAX_TOOL_ERR_BYTES {
        s.truncate(MAX_TOOL_ERR_BYTES);
        s.push_str("\n[TRUNCATED]");
    }
    s
}

/// Attempts to spawn `command --version` and returns `true` if the process
/// launched, regardless of exit code. Probing up front turns an opaque
/// mid-analysis "No such file or directory" into an actionable diagnostic.
pub fn probe(command: &str) -> bool {
    Command::new(command)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

/// Table-driven tracker keyed by file name, for tests.
///
/// Files with no registered entry read as empty: no records, no classes.
#[derive(Debug, Default)]
pub struct StaticTracker {
    files: HashMap<String, (BTreeSet<TrackingData>, Vec<(String, String)>)>,
}

impl StaticTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an archive's canned extraction result.
    #[must_use]
    pub fn with_archive(
        mut self,
        file_name: &str,
        records: Vec<TrackingData>,
        classes: Vec<(&str, &str)>,
    ) -> Self {
        self.files.insert(
            file_name.to_string(),
            (
                records.into_iter().collect(),
                classes
                    .into_iter()
                    .map(|(n, h)| (n.to_string(), h.to_string()))
                    .collect(),
            ),
        );
        self
    }

    /// Registers a loose class file's name and content hash.
    #[must_use]
    pub fn with_class(self, file_name: &str, class_name: &str, hash: &str) -> Self {
        self.with_archive(file_name, Vec::new(), vec![(class_name, hash)])
    }

    fn lookup(&self, path: &Path) -> Option<&(BTreeSet<TrackingData>, Vec<(String, String)>)> {
        let name = path.file_name()?.to_string_lossy();
        self.files.get(name.as_ref())
    }
}

impl ClassFileTracker for StaticTracker {
    fn read_archive(
        &self,
        archive: &Path,
        observer: &mut dyn FnMut(&str, &str),
    ) -> Result<BTreeSet<TrackingData>> {
        match self.lookup(archive) {
            Some((records, classes)) => {
                for (name, hash) in classes {
                    observer(name, hash);
                }
                Ok(records.clone())
            }
            None => Ok(BTreeSet::new()),
        }
    }

    fn read_class(&self, class_file: &Path, observer: &mut dyn FnMut(&str, &str)) -> Result<()> {
        if let Some((_, classes)) = self.lookup(class_file) {
            for (name, hash) in classes {
                observer(name, hash);
            }
        }
        Ok(())
    }
}
