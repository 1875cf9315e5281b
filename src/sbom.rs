//! CycloneDX SBOM assembly.
//!
//! One [`BomComponent`] per provenance record, rendered into a
//! CycloneDX-1.4 JSON document. The full document is assembled twice per
//! analysis run: once over everything the build output pulled in
//! (community placeholders included) and once over the local repository's
//! own provenance.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::tracker::TrackingData;

/// One SBOM component, derived 1:1 from a provenance record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BomComponent {
    #[serde(rename = "type")]
    pub component_type: String,
    pub group: String,
    pub name: String,
    pub version: String,
    pub publisher: String,
    pub purl: String,
    pub properties: Vec<BomProperty>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BomProperty {
    pub name: String,
    pub value: String,
}

/// Builds the component for one record.
///
/// A GAV that does not split into exactly group, artifact and version is a
/// malformed input and fatal: it means an upstream producer wrote garbage
/// into embedded provenance, and an SBOM built from it would be garbage too.
pub fn component_from_record(record: &TrackingData) -> Result<BomComponent> {
    let mut parts = record.gav.split(':');
    let (Some(group), Some(name), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(anyhow!(
            "malformed GAV `{}`: expected group:artifact:version",
            record.gav
        ));
    };

    let mut properties: Vec<BomProperty> = record
        .attributes
        .iter()
        .map(|(key, value)| BomProperty {
            name: format!("java:{key}"),
            value: value.clone(),
        })
        .collect();
    properties.push(BomProperty {
        name: "package:type".to_string(),
        value: "maven".to_string(),
    });
    properties.push(BomProperty {
        name: "package:language".to_string(),
        value: "java".to_string(),
    });

    Ok(BomComponent {
        component_type: "library".to_string(),
        group: group.to_string(),
        name: name.to_string(),
        version: version.to_string(),
        publisher: record.source.clone(),
        purl: format!("pkg:maven/{group}/{name}@{version}"),
        properties,
    })
}

pub fn assemble(records: &BTreeSet<TrackingData>) -> Result<Vec<BomComponent>> {
    records.iter().map(component_from_record).collect()
}

/// Renders the full CycloneDX document.
pub fn bom_document(records: &BTreeSet<TrackingData>) -> Result<serde_json::Value> {
    let timestamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("formatting SBOM timestamp")?;
    Ok(json!({
        "bomFormat": "CycloneDX",
        "specVersion": "1.4",
        "version": 1,
        "metadata": { "timestamp": timestamp },
        "components": assemble(records)?,
    }))
}

/// Renders and optionally writes one SBOM document.
pub fn write_bom(records: &BTreeSet<TrackingData>, path: Option<&Path>) -> Result<()> {
    let document = bom_document(records)?;
    info!("generated SBOM with {} components", records.len());
    debug!(
        "generated SBOM:\n{}",
        serde_json::to_string_pretty(&document).unwrap_or_default()
    );
    if let Some(path) = path {
        fs::write(path, serde_json::to_vec_pretty(&document)?)
            .with_context(|| format!("writing SBOM to {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn component_carries_purl_publisher_and_fixed_properties() {
        let record = TrackingData::new(
            "com.acme:lib:1.0",
            "rebuilt",
            BTreeMap::from([("build-id".to_string(), "42".to_string())]),
        );
        let component = component_from_record(&record).unwrap();
        assert_eq!(component.component_type, "library");
        assert_eq!(component.group, "com.acme");
        assert_eq!(component.name, "lib");
        assert_eq!(component.version, "1.0");
        assert_eq!(component.publisher, "rebuilt");
        assert_eq!(component.purl, "pkg:maven/com.acme/lib@1.0");
        assert_eq!(
            component.properties,
            vec![
                BomProperty {
                    name: "java:build-id".to_string(),
                    value: "42".to_string(),
                },
                BomProperty {
                    name: "package:type".to_string(),
                    value: "maven".to_string(),
                },
                BomProperty {
                    name: "package:language".to_string(),
                    value: "java".to_string(),
                },
            ]
        );
    }

    #[test]
    fn malformed_gavs_are_fatal() {
        for gav in ["com.acme:lib", "com.acme:lib:1.0:jar", "com.acme"] {
            let record = TrackingData::unknown(gav);
            let err = component_from_record(&record).unwrap_err().to_string();
            assert!(err.contains("malformed GAV"), "{gav}: {err}");
        }
    }

    #[test]
    fn document_has_cyclonedx_envelope() {
        let records: BTreeSet<_> = [TrackingData::community("com.acme:lib:1.0")].into();
        let document = bom_document(&records).unwrap();
        assert_eq!(document["bomFormat"], "CycloneDX");
        assert_eq!(document["specVersion"], "1.4");
        assert_eq!(document["version"], 1);
        assert!(document["metadata"]["timestamp"].is_string());
        assert_eq!(document["components"][0]["purl"], "pkg:maven/com.acme/lib@1.0");
        assert_eq!(document["components"][0]["publisher"], "community");
    }

    #[test]
    fn write_bom_without_path_only_logs() {
        let records: BTreeSet<_> = [TrackingData::community("com.acme:lib:1.0")].into();
        write_bom(&records, None).unwrap();
    }

    #[test]
    fn write_bom_writes_parseable_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sbom.json");
        let records: BTreeSet<_> = [
            TrackingData::new("com.acme:lib:1.0", "redhat", BTreeMap::new()),
            TrackingData::community("org.other:dep:2.0"),
        ]
        .into();
        write_bom(&records, Some(&path)).unwrap();
        let parsed: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(parsed["components"].as_array().unwrap().len(), 2);
    }
}
