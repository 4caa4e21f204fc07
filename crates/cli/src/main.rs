mod load;

use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use kairn_apply::{render, CommandResult, DeployOptions, Deployer, DeploymentCollection, IgnoreRules, InclusionFilter};
use kairn_core::ClusterAdapter;
use kairn_kubehub::KubeCluster;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kairnctl", version, about = "Kairn GitOps reconciler")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json, Yaml }

#[derive(Args, Debug)]
struct TargetArgs {
    /// Project name stamped into the ownership labels
    #[arg(long, env = "KAIRN_PROJECT")]
    project: String,
    /// Target name stamped into the ownership labels
    #[arg(long, env = "KAIRN_TARGET", default_value = "")]
    target: String,
    /// Namespace for namespaced objects that do not set one
    #[arg(long = "override-namespace")]
    override_namespace: Option<String>,
}

#[derive(Args, Debug)]
struct SourceArgs {
    /// Directory of rendered manifests; subdirectory names become tags
    #[arg(short = 'f', long = "manifests", env = "KAIRN_MANIFESTS")]
    manifests: PathBuf,
    /// Extra tag added to every loaded item
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long = "include-tag")]
    include_tags: Vec<String>,
    #[arg(long = "exclude-tag")]
    exclude_tags: Vec<String>,
    /// Source path prefix to include, relative to the manifest root
    #[arg(long = "include-path")]
    include_paths: Vec<String>,
    #[arg(long = "exclude-path")]
    exclude_paths: Vec<String>,
    /// Object to delete explicitly, e.g. "v1/ConfigMap/ns/name" or "apps/v1/Deployment/name";
    /// a namespaced object without a namespace uses the override namespace or "default"
    #[arg(long = "delete-object")]
    delete_objects: Vec<String>,
}

#[derive(Args, Debug)]
struct IgnoreArgs {
    /// Ignore differences in kairn.io/tag-* labels
    #[arg(long = "ignore-tags", action = ArgAction::SetTrue)]
    ignore_tags: bool,
    #[arg(long = "ignore-labels", action = ArgAction::SetTrue)]
    ignore_labels: bool,
    #[arg(long = "ignore-annotations", action = ArgAction::SetTrue)]
    ignore_annotations: bool,
    /// Field path pattern to ignore, e.g. "spec.replicas" or "spec.template.spec.containers[*].image"
    #[arg(long = "ignore-path")]
    ignore_paths: Vec<String>,
    #[arg(long = "ignore-label")]
    ignore_label_keys: Vec<String>,
    #[arg(long = "ignore-annotation")]
    ignore_annotation_keys: Vec<String>,
    /// "<tag>:<path>": ignore a path only on items carrying the tag
    #[arg(long = "ignore-tagged")]
    ignore_tagged: Vec<String>,
}

#[derive(Args, Debug)]
struct ApplyArgs {
    /// Replace every object instead of updating it
    #[arg(long = "force-apply", action = ArgAction::SetTrue)]
    force_apply: bool,
    /// Delete and recreate when an update is rejected as invalid
    #[arg(long = "replace-on-error", action = ArgAction::SetTrue)]
    replace_on_error: bool,
    /// Also replace on update conflicts
    #[arg(long = "force-replace-on-error", action = ArgAction::SetTrue)]
    force_replace_on_error: bool,
    /// Maximum in-flight cluster operations (default: KAIRN_CONCURRENCY or 8)
    #[arg(long)]
    concurrency: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show what a deploy would change
    Diff {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        ignore: IgnoreArgs,
        /// Deploy fallback flags; they only change behaviour once the server rejects a write
        #[command(flatten)]
        apply: ApplyArgs,
        /// Also plan deletion of owned objects missing from the manifests
        #[arg(long, action = ArgAction::SetTrue)]
        prune: bool,
    },
    /// Apply the manifests in dependency order
    Deploy {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        ignore: IgnoreArgs,
        #[command(flatten)]
        apply: ApplyArgs,
        /// Delete owned objects missing from the manifests afterwards
        #[arg(long, action = ArgAction::SetTrue)]
        prune: bool,
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Delete owned objects missing from the manifests
    Prune {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        source: SourceArgs,
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Delete every object owned by the project and target
    Delete {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Discover served resources (incl. CRDs)
    Discover,
}

fn init_tracing() {
    let env = std::env::var("KAIRN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KAIRN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KAIRN_METRICS_ADDR; expected host:port");
        }
    }
}

fn collection(target: &TargetArgs, source: Option<&SourceArgs>) -> Result<DeploymentCollection> {
    let mut col = DeploymentCollection::new(&target.project, &target.target);
    col.override_namespace = target.override_namespace.clone();
    if let Some(src) = source {
        col.items = load::load_dir(&src.manifests, &src.tags)?;
        col.delete_objects = src.delete_objects.iter().map(|s| load::parse_object_ref(s)).collect::<Result<_>>()?;
        info!(items = col.items.len(), root = %src.manifests.display(), "manifests loaded");
    }
    Ok(col)
}

fn filter(source: &SourceArgs) -> InclusionFilter {
    InclusionFilter {
        include_tags: source.include_tags.iter().cloned().collect(),
        exclude_tags: source.exclude_tags.iter().cloned().collect(),
        include_paths: source.include_paths.clone(),
        exclude_paths: source.exclude_paths.clone(),
    }
}

fn ignore_rules(args: &IgnoreArgs) -> Result<IgnoreRules> {
    Ok(IgnoreRules {
        ignore_tags: args.ignore_tags,
        ignore_labels: args.ignore_labels,
        ignore_annotations: args.ignore_annotations,
        paths: args.ignore_paths.iter().map(|p| IgnoreRules::parse_path(p)).collect::<Result<_, _>>()?,
        label_keys: args.ignore_label_keys.clone(),
        annotation_keys: args.ignore_annotation_keys.clone(),
        tagged: args.ignore_tagged.iter().map(|t| IgnoreRules::parse_tagged(t)).collect::<Result<_, _>>()?,
    })
}

fn options(apply: Option<&ApplyArgs>, prune: bool, dry_run: bool) -> DeployOptions {
    let mut o = DeployOptions::from_env();
    if let Some(a) = apply {
        o.force_apply = a.force_apply;
        o.replace_on_error = a.replace_on_error;
        o.force_replace_on_error = a.force_replace_on_error;
        if let Some(c) = a.concurrency { o.concurrency = c.max(1); }
    }
    o.prune = prune;
    o.dry_run = dry_run;
    o
}

/// First Ctrl-C stops new work; in-flight operations finish and the partial result is reported.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight operations");
            token.cancel();
        }
    });
}

fn emit(result: &CommandResult, output: Output) -> Result<ExitCode> {
    match output {
        Output::Human => print!("{}", render::human(result)),
        Output::Json => println!("{}", render::to_json(result)?),
        Output::Yaml => print!("{}", render::to_yaml(result)?),
    }
    if result.failed() {
        error!(run_id = %result.run_id, errors = result.errors.len(), "run failed");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cluster: Arc<dyn ClusterAdapter> = Arc::new(KubeCluster::try_default().await?);

    let (deployer, col, command) = match cli.command {
        Commands::Discover => {
            let kinds = cluster.discover_kinds().await.context("discovery failed")?;
            match cli.output {
                Output::Human => {
                    for k in kinds {
                        let scope = if k.namespaced { "namespaced" } else { "cluster" };
                        println!("{} • {} • {}", k.api_version(), k.kind, scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&kinds)?),
                Output::Yaml => print!("{}", serde_yaml::to_string(&kinds)?),
            }
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Diff { target, source, ignore, apply, prune } => {
            let d = Deployer::new(cluster).with_options(options(Some(&apply), prune, true)).with_ignore_rules(ignore_rules(&ignore)?).with_filter(filter(&source));
            (d, collection(&target, Some(&source))?, "diff")
        }
        Commands::Deploy { target, source, ignore, apply, prune, dry_run } => {
            let d = Deployer::new(cluster)
                .with_options(options(Some(&apply), prune, dry_run))
                .with_ignore_rules(ignore_rules(&ignore)?)
                .with_filter(filter(&source));
            (d, collection(&target, Some(&source))?, "deploy")
        }
        Commands::Prune { target, source, dry_run } => {
            let d = Deployer::new(cluster).with_options(options(None, true, dry_run)).with_filter(filter(&source));
            (d, collection(&target, Some(&source))?, "prune")
        }
        Commands::Delete { target, dry_run } => (Deployer::new(cluster).with_options(options(None, false, dry_run)), collection(&target, None)?, "delete"),
    };

    cancel_on_interrupt(deployer.cancel_token());
    info!(command, project = %col.project, target = %col.target, "run starting");
    let result = match command {
        "diff" => deployer.diff(&col).await,
        "deploy" => deployer.deploy(&col).await,
        "prune" => deployer.prune(&col).await,
        _ => deployer.delete(&col).await,
    }
    .with_context(|| format!("{} aborted", command))?;
    emit(&result, cli.output)
}
