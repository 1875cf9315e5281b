use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use dpw::analysis::{self, AllowList, AnalysisRequest};
use dpw::gav::RepoLayout;
use dpw::registry::{self, RegistryClient};
use dpw::sbom;
use dpw::tracker::{self, ExternalTracker};

/// Environment variable consulted when `--token` is not given.
const TOKEN_ENV: &str = "REGISTRY_TOKEN";

#[derive(Parser)]
#[command(name = "dpw", about = "Dependency Provenance Witness", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LayoutArg {
    /// Maven-style group/artifact/version directories
    Flat,
    /// Gradle-cache-style layout with a content digest directory per file
    ContentAddressed,
}

impl From<LayoutArg> for RepoLayout {
    fn from(value: LayoutArg) -> Self {
        match value {
            LayoutArg::Flat => RepoLayout::Flat,
            LayoutArg::ContentAddressed => RepoLayout::ContentAddressed,
        }
    }
}

#[derive(Subcommand)]
enum Cmd {
    /// Check build output for community dependencies and generate SBOMs
    #[command(alias = "analyze")]
    Analyse {
        /// The paths to check for community artifacts. Can be files or directories.
        paths: Vec<PathBuf>,

        /// The path to the local repository. Usually $HOME/.m2/repository
        #[arg(long)]
        maven_repo: PathBuf,

        /// The path to generate a SBOM at
        #[arg(long)]
        sbom_path: Option<PathBuf>,

        /// The path to generate a SBOM of the repository's own provenance at
        #[arg(long)]
        build_sbom_path: Option<PathBuf>,

        /// Provenance sources that are approved
        #[arg(
            long,
            value_delimiter = ',',
            default_values_t = ["redhat".to_string(), "rebuilt".to_string()]
        )]
        allowed_sources: Vec<String>,

        /// A list of regexes of artifacts that are allowed to come from
        /// community sources
        #[arg(long)]
        allowed_artifacts: Vec<String>,

        /// Layout convention of the local repository
        #[arg(long, value_enum, default_value_t = LayoutArg::Flat)]
        layout: LayoutArg,

        /// External command used to read class names and embedded
        /// provenance out of build artifacts
        #[arg(long, default_value = "jar-provenance")]
        tracker_cmd: String,
    },

    /// Materialize a published artifact image into the local cache
    Fetch {
        /// Image tag or digest reference to materialize
        reference: String,

        /// Registry hostname
        #[arg(long, default_value = "quay.io")]
        registry: String,

        /// Registry organization or user owning the repository
        #[arg(long)]
        owner: String,

        /// Image repository name
        #[arg(long, default_value = "artifact-deployments")]
        repository: String,

        /// Basic-auth token or docker-config JSON. Falls back to
        /// $REGISTRY_TOKEN
        #[arg(long)]
        token: Option<String>,

        /// Local cache directory for extracted images
        #[arg(long)]
        cache_dir: PathBuf,

        /// Allow plain HTTP and invalid certificates
        #[arg(long)]
        insecure: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Analyse {
            paths,
            maven_repo,
            sbom_path,
            build_sbom_path,
            allowed_sources,
            allowed_artifacts,
            layout,
            tracker_cmd,
        } => run_analyse(
            paths,
            maven_repo,
            sbom_path,
            build_sbom_path,
            allowed_sources,
            allowed_artifacts,
            layout,
            tracker_cmd,
        ),
        Cmd::Fetch {
            reference,
            registry,
            owner,
            repository,
            token,
            cache_dir,
            insecure,
        } => run_fetch(reference, registry, owner, repository, token, cache_dir, insecure),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_analyse(
    paths: Vec<PathBuf>,
    maven_repo: PathBuf,
    sbom_path: Option<PathBuf>,
    build_sbom_path: Option<PathBuf>,
    allowed_sources: Vec<String>,
    allowed_artifacts: Vec<String>,
    layout: LayoutArg,
    tracker_cmd: String,
) -> Result<()> {
    if paths.is_empty() {
        return Err(anyhow!("at least one build output path is required"));
    }
    if !tracker::probe(&tracker_cmd) {
        return Err(anyhow!(
            "class tracking command `{tracker_cmd}` is not available on $PATH; \
             pass --tracker-cmd to point at it"
        ));
    }

    let extractor = ExternalTracker::new(tracker_cmd);
    let request = AnalysisRequest {
        maven_repo: &maven_repo,
        build_paths: &paths,
        allowed_sources: allowed_sources.into_iter().collect::<BTreeSet<_>>(),
        allow_list: AllowList::compile(&allowed_artifacts)?,
        layout: layout.into(),
    };
    let outcome = analysis::analyse(&request, &extractor)?;

    // both documents are always written, whatever the verdict
    sbom::write_bom(&outcome.tracking_data, sbom_path.as_deref())?;
    sbom::write_bom(&outcome.repo_records, build_sbom_path.as_deref())?;

    if outcome.community_gavs.is_empty() {
        println!("✓ no community dependencies detected");
        return Ok(());
    }
    for gav in &outcome.community_gavs {
        eprintln!("✗ community dependency: {gav}");
    }
    Err(anyhow!(
        "{} community dependencies detected",
        outcome.community_gavs.len()
    ))
}

fn run_fetch(
    reference: String,
    registry: String,
    owner: String,
    repository: String,
    token: Option<String>,
    cache_dir: PathBuf,
    insecure: bool,
) -> Result<()> {
    let token = token.or_else(|| std::env::var(TOKEN_ENV).ok());
    let credential = registry::resolve_credential(&registry, token.as_deref())?;
    let client = RegistryClient::new(
        &registry,
        &owner,
        &repository,
        credential,
        &cache_dir,
        insecure,
    )?;
    match client.extract_image(&reference)? {
        Some(artifacts) => {
            println!("{}", artifacts.display());
            Ok(())
        }
        None => Err(anyhow!("no artifact available for {reference}")),
    }
}
