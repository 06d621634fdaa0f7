use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use driftless_apply::{default_update_kinds, Applier};
use driftless_core::{ErrorTaxonomy, SyncRef};
use driftless_kubehub::{KubeCluster, KubeStatusWriter};
use driftless_reconciler::{Parts, Reconciler, ReconcilerOptions, WatchRemediator};
use driftless_source::{DirReader, ManifestParser, Parser as _, SourceReader};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "driftlessd", version, about = "Keep a cluster in sync with a directory of manifests")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(clap::Args, Debug)]
struct SourceArgs {
    /// Checked-out repository root, or a git-sync style symlink to the current commit
    #[arg(long = "source-root", env = "DRIFTLESS_SOURCE_ROOT")]
    source_root: PathBuf,
    /// Directory under the root holding the manifests
    #[arg(long = "policy-dir", env = "DRIFTLESS_POLICY_DIR", default_value = ".")]
    policy_dir: PathBuf,
    /// RootSync/RepoSync name
    #[arg(long = "sync-name", env = "DRIFTLESS_SYNC_NAME", default_value = "root-sync")]
    sync_name: String,
    /// Namespace of a RepoSync; omit for a RootSync
    #[arg(long = "sync-namespace", env = "DRIFTLESS_SYNC_NAMESPACE")]
    sync_namespace: Option<String>,
}

impl SourceArgs {
    fn sync(&self) -> SyncRef {
        match &self.sync_namespace {
            Some(ns) => SyncRef::namespaced(ns, &self.sync_name),
            None => SyncRef::root(&self.sync_name),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one reconciler until interrupted
    Run {
        #[command(flatten)]
        source: SourceArgs,
        /// Seconds between checks for a new commit
        #[arg(long = "poll-secs", env = "DRIFTLESS_POLL_SECS", default_value_t = 15)]
        poll_secs: u64,
        /// Seconds between full re-syncs
        #[arg(long = "resync-secs", env = "DRIFTLESS_RESYNC_SECS", default_value_t = 3600)]
        resync_secs: u64,
        /// Seconds between status re-assertions
        #[arg(long = "status-secs", env = "DRIFTLESS_STATUS_SECS", default_value_t = 60)]
        status_secs: u64,
        /// Kinds released with a plain update instead of an apply patch, as group/Kind
        #[arg(long = "update-kind", env = "DRIFTLESS_UPDATE_KINDS", value_delimiter = ',')]
        update_kinds: Vec<String>,
    },
    /// Print every error code the reconciler can report
    Errors,
    /// Read and parse a source once without touching a cluster
    Check {
        #[command(flatten)]
        source: SourceArgs,
    },
}

fn init_tracing() {
    let env = std::env::var("DRIFTLESS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("DRIFTLESS_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid DRIFTLESS_METRICS_ADDR; expected host:port");
        }
    }
}

/// "apiregistration.k8s.io/APIService" or "/Kind" for the core group.
fn parse_group_kind(s: &str) -> Option<(String, String)> {
    let (group, kind) = s.rsplit_once('/')?;
    if kind.is_empty() {
        return None;
    }
    Some((group.to_string(), kind.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { source, poll_secs, resync_secs, status_secs, update_kinds } => {
            let sync = source.sync();
            let kinds = if update_kinds.is_empty() {
                default_update_kinds()
            } else {
                let mut kinds = Vec::new();
                for k in &update_kinds {
                    match parse_group_kind(k) {
                        Some(gk) => kinds.push(gk),
                        None => anyhow::bail!("invalid --update-kind {:?}; expected group/Kind", k),
                    }
                }
                kinds
            };
            let cluster = Arc::new(KubeCluster::try_default().await.context("connecting to the cluster")?);
            let parts = Parts {
                reader: Arc::new(DirReader::new(&source.source_root, &source.policy_dir)),
                parser: Arc::new(ManifestParser::new(sync.clone())),
                applier: Arc::new(Applier::new(sync.clone(), cluster.clone()).with_update_kinds(kinds)),
                remediator: Arc::new(WatchRemediator::new(cluster.client(), &sync)),
                status: Arc::new(KubeStatusWriter::new(cluster.clone(), sync.clone())),
            };
            let opts = ReconcilerOptions {
                poll_period: Duration::from_secs(poll_secs.max(1)),
                resync_period: Duration::from_secs(resync_secs.max(1)),
                status_period: Duration::from_secs(status_secs.max(1)),
                ..ReconcilerOptions::default()
            };
            let reconciler = Reconciler::new(sync.clone(), opts, parts, ErrorTaxonomy::standard());

            let handle = reconciler.handle();
            let mut epochs = handle.subscribe_epoch();
            let output = cli.output;
            let reporter = tokio::spawn(async move {
                while epochs.changed().await.is_ok() {
                    let snap = handle.current();
                    match output {
                        Output::Json => match serde_json::to_string(&*snap) {
                            Ok(line) => println!("{}", line),
                            Err(e) => warn!(error = %e, "failed to encode state"),
                        },
                        Output::Human => info!(
                            epoch = snap.epoch,
                            phase = ?snap.phase,
                            commit = %snap.commit,
                            errors = snap.errors.len(),
                            retries = snap.same_error_count,
                            "state"
                        ),
                    }
                }
            });

            info!(sync = %sync, root = %source.source_root.display(), "starting");
            reconciler
                .run(async {
                    if let Err(e) = signal::ctrl_c().await {
                        error!(error = %e, "failed to listen for ctrl-c");
                    }
                })
                .await;
            reporter.abort();
            info!("shutdown complete");
        }
        Commands::Errors => {
            let taxonomy = ErrorTaxonomy::standard();
            match cli.output {
                Output::Human => {
                    for e in taxonomy.entries() {
                        println!("{} • {} • {}", e.code, e.class.as_str(), e.summary);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(taxonomy.entries())?),
            }
        }
        Commands::Check { source } => {
            let sync = source.sync();
            let reader = DirReader::new(&source.source_root, &source.policy_dir);
            let state = reader.read().context("reading source")?;
            let (objects, errs) = ManifestParser::new(sync).parse(&state);
            match cli.output {
                Output::Human => {
                    println!("commit {} • {} files • {} objects", state.commit, state.files.len(), objects.len());
                    for o in &objects {
                        println!("  {} ({:?})", o.identity(), o.management());
                    }
                    for e in errs.iter() {
                        println!("{} {}", e.code(), e);
                    }
                }
                Output::Json => {
                    let out = serde_json::json!({
                        "commit": state.commit,
                        "objects": objects.iter().map(|o| o.identity().to_string()).collect::<Vec<_>>(),
                        "errors": driftless_core::status::summarize(&errs),
                    });
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
            if !errs.is_empty() {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_kinds() {
        assert_eq!(parse_group_kind("apiregistration.k8s.io/APIService"), Some(("apiregistration.k8s.io".into(), "APIService".into())));
        assert_eq!(parse_group_kind("/Namespace"), Some((String::new(), "Namespace".into())));
        assert_eq!(parse_group_kind("APIService"), None);
        assert_eq!(parse_group_kind("apps/"), None);
    }

    #[test]
    fn scope_from_flags() {
        let cli = Cli::parse_from(["driftlessd", "check", "--source-root", "/repo", "--sync-namespace", "b", "--sync-name", "repo-sync"]);
        let Commands::Check { source } = cli.command else { panic!("expected check") };
        assert_eq!(source.sync(), SyncRef::namespaced("b", "repo-sync"));
        assert_eq!(source.policy_dir, PathBuf::from("."));
    }
}
