//! OCI registry client and content-addressed artifact cache.
//!
//! Previously-published build outputs live in an OCI registry as 3-layer
//! images whose last layer is a gzipped tar of the artifacts. This module
//! resolves an image reference to its manifest digest, pulls the artifact
//! layer at most once per digest, and extracts it under
//! `<cache root>/<digest hash>/artifacts`.
//!
//! A digest-named directory is write-once: it is staged next to its final
//! path and renamed into place only after extraction completes, so a
//! concurrent invocation never observes a partially extracted entry.
//! Authentication failures and missing images are normal outcomes
//! (`Ok(None)`), not errors; a missing rebuilt artifact just means nothing
//! was published for that reference yet.

use anyhow::{anyhow, Context, Result};
use base64::Engine as _;
use flate2::read::GzDecoder;
use reqwest::blocking::{Client, Response};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Subdirectory of every extracted image that holds the artifact tree.
pub const ARTIFACTS_DIR: &str = "artifacts";

const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const DIGEST_HEADER: &str = "Docker-Content-Digest";

/// Artifact images always carry exactly three layers; anything else is not
/// an image this tool published.
const EXPECTED_LAYER_COUNT: usize = 3;
/// The artifact tree is the last of the three layers.
const ARTIFACTS_LAYER_INDEX: usize = 2;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// A registry password. Zeroed on drop and redacted from `Debug` output so
/// it cannot leak through logs or error reports.
#[derive(Clone, zeroize::Zeroize, zeroize::ZeroizeOnDrop)]
pub struct RegistryPassword(String);

impl fmt::Debug for RegistryPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegistryPassword([REDACTED])")
    }
}

/// One resolved basic-auth credential.
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    password: RegistryPassword,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: RegistryPassword(password.into()),
        }
    }

    fn password(&self) -> &str {
        &self.password.0
    }
}

/// Multi-host Docker-config-style credential document.
#[derive(Debug, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: BTreeMap<String, DockerAuth>,
}

#[derive(Debug, Deserialize)]
struct DockerAuth {
    auth: String,
}

/// Resolves the credential to use against `registry`.
///
/// A token that starts with `{` is treated as a Docker config document; the
/// entry whose host key is contained in the registry hostname wins, and a
/// config with no matching host is fatal. Any other token is one base64
/// `user:password` pair. No token means anonymous access.
pub fn resolve_credential(registry: &str, token: Option<&str>) -> Result<Option<Credential>> {
    let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) else {
        info!("no registry credential provided");
        return Ok(None);
    };
    if token.starts_with('{') {
        let config: DockerConfig =
            serde_json::from_str(token).context("parsing docker config credential")?;
        for (host, entry) in &config.auths {
            if registry.contains(host.as_str()) {
                let (username, password) = split_basic_token(&entry.auth)?;
                info!("credential provided as docker config, selected host {host} for registry {registry}");
                return Ok(Some(Credential::new(username, password)));
            }
        }
        return Err(anyhow!(
            "unable to find a host matching {registry} in provided docker config, hosts provided: {:?}",
            config.auths.keys().collect::<Vec<_>>()
        ));
    }
    let (username, password) = split_basic_token(token)?;
    info!("credential provided as base64 encoded token");
    Ok(Some(Credential::new(username, password)))
}

fn split_basic_token(encoded: &str) -> Result<(String, String)> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .context("decoding basic-auth token")?;
    let decoded = String::from_utf8(decoded).context("basic-auth token is not valid UTF-8")?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| anyhow!("basic-auth token is missing the `:` separator"))?;
    Ok((username.to_string(), password.to_string()))
}

#[derive(Debug, Deserialize)]
struct OciManifest {
    #[serde(rename = "mediaType", default)]
    media_type: Option<String>,
    #[serde(default)]
    layers: Vec<OciDescriptor>,
}

#[derive(Debug, Deserialize)]
struct OciDescriptor {
    digest: String,
}

struct ResolvedManifest {
    digest_hash: String,
    layers: Vec<OciDescriptor>,
}

/// Client for one `<registry>/<owner>/<repository>` image repository plus
/// its local cache root.
pub struct RegistryClient {
    base_url: String,
    credential: Option<Credential>,
    cache_root: PathBuf,
    http: Client,
}

impl RegistryClient {
    pub fn new(
        registry: &str,
        owner: &str,
        repository: &str,
        credential: Option<Credential>,
        cache_root: &Path,
        insecure: bool,
    ) -> Result<Self> {
        let scheme = if insecure { "http" } else { "https" };
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(insecure)
            .build()
            .context("building registry http client")?;
        fs::create_dir_all(cache_root)
            .with_context(|| format!("creating cache directory {}", cache_root.display()))?;
        debug!("using {} as local cache root", cache_root.display());
        Ok(Self {
            base_url: format!("{scheme}://{registry}/v2/{owner}/{repository}"),
            credential,
            cache_root: cache_root.to_path_buf(),
            http,
        })
    }

    /// Materializes the image at `reference` into the local cache and
    /// returns the artifact directory inside it.
    ///
    /// `Ok(None)` means no artifact is available: the image does not exist,
    /// the registry rejected our credential, or the image does not have the
    /// expected layer structure.
    pub fn extract_image(&self, reference: &str) -> Result<Option<PathBuf>> {
        let Some(manifest) = self.pull_manifest(reference)? else {
            return Ok(None);
        };
        if let Some(artifacts) = self.cached_artifacts(&manifest.digest_hash) {
            debug!("cache hit for digest {}", manifest.digest_hash);
            return Ok(Some(artifacts));
        }
        if manifest.layers.len() != EXPECTED_LAYER_COUNT {
            warn!(
                "unexpected layer count {}, expected {EXPECTED_LAYER_COUNT}",
                manifest.layers.len()
            );
            return Ok(None);
        }
        let Some(blob) = self.pull_blob(&manifest.layers[ARTIFACTS_LAYER_INDEX].digest)? else {
            return Ok(None);
        };
        self.materialize(&manifest.digest_hash, &blob).map(Some)
    }

    /// The artifact path for an already-extracted digest, if present.
    fn cached_artifacts(&self, digest_hash: &str) -> Option<PathBuf> {
        let digest_dir = self.cache_root.join(digest_hash);
        digest_dir
            .is_dir()
            .then(|| digest_dir.join(ARTIFACTS_DIR))
    }

    fn get(&self, url: &str, accept: Option<&str>) -> Result<Option<Response>> {
        let mut request = self.http.get(url);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }
        if let Some(credential) = &self.credential {
            request = request.basic_auth(&credential.username, Some(credential.password()));
        }
        let response = request
            .send()
            .with_context(|| format!("requesting {url}"))?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            error!("failed to authenticate against {url}");
            return Ok(None);
        }
        if status == StatusCode::NOT_FOUND {
            debug!("nothing found at {url}");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(anyhow!("registry request {url} failed with status {status}"));
        }
        Ok(Some(response))
    }

    fn pull_manifest(&self, reference: &str) -> Result<Option<ResolvedManifest>> {
        let url = format!("{}/manifests/{reference}", self.base_url);
        let Some(response) = self.get(&url, Some(OCI_MANIFEST_MEDIA_TYPE))? else {
            return Ok(None);
        };
        let header_digest = response
            .headers()
            .get(DIGEST_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or_default().trim().to_string());
        let body = response.bytes().context("reading manifest body")?;
        let manifest: OciManifest =
            serde_json::from_slice(&body).context("parsing image manifest")?;

        let media_type = manifest
            .media_type
            .clone()
            .or(content_type)
            .unwrap_or_default();
        if !media_type.eq_ignore_ascii_case(OCI_MANIFEST_MEDIA_TYPE) {
            return Err(anyhow!(
                "wrong manifest media type, only {OCI_MANIFEST_MEDIA_TYPE} is supported, but got {media_type}"
            ));
        }

        let digest = header_digest
            .unwrap_or_else(|| format!("sha256:{}", hex::encode(Sha256::digest(&body))));
        let digest_hash = digest
            .split_once(':')
            .map_or_else(|| digest.clone(), |(_, hash)| hash.to_string());
        Ok(Some(ResolvedManifest {
            digest_hash,
            layers: manifest.layers,
        }))
    }

    fn pull_blob(&self, digest: &str) -> Result<Option<Vec<u8>>> {
        let url = format!("{}/blobs/{digest}", self.base_url);
        let Some(response) = self.get(&url, None)? else {
            return Ok(None);
        };
        let bytes = response
            .bytes()
            .with_context(|| format!("reading blob {digest}"))?;
        Ok(Some(bytes.to_vec()))
    }

    /// Stages the blob next to its final location, extracts it, and renames
    /// the staged directory into place.
    fn materialize(&self, digest_hash: &str, blob: &[u8]) -> Result<PathBuf> {
        let digest_dir = self.cache_root.join(digest_hash);
        let stage = self
            .cache_root
            .join(format!(".{digest_hash}.{}", std::process::id()));
        if let Err(err) = fill_stage(&stage, digest_hash, blob) {
            let _ = fs::remove_dir_all(&stage);
            return Err(err);
        }
        if let Err(err) = fs::rename(&stage, &digest_dir) {
            let _ = fs::remove_dir_all(&stage);
            // a concurrent invocation may have extracted the same digest
            // and won the rename; content addressing makes its copy as
            // good as ours
            if !digest_dir.is_dir() {
                return Err(err).with_context(|| {
                    format!("moving extracted image into {}", digest_dir.display())
                });
            }
        }
        Ok(digest_dir.join(ARTIFACTS_DIR))
    }
}

fn fill_stage(stage: &Path, digest_hash: &str, blob: &[u8]) -> Result<()> {
    fs::create_dir_all(stage)
        .with_context(|| format!("creating staging directory {}", stage.display()))?;
    let tar_path = stage.join(format!("{digest_hash}.tar"));
    fs::write(&tar_path, blob)
        .with_context(|| format!("writing layer to {}", tar_path.display()))?;
    let tar_file = fs::File::open(&tar_path)
        .with_context(|| format!("open {}", tar_path.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(tar_file));
    archive
        .unpack(stage)
        .with_context(|| format!("extracting layer into {}", stage.display()))?;
    Ok(())
}
