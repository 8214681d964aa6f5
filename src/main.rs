mod config;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use remediate_engine::{
    ClusterObserver, EngineConfig, EvictionExecutor, ExecutionReport, RemediationController,
    plan,
};
use remediate_k8s::{ClusterApi, KubeClient};
use remediate_types::{RemediationRequest, ResourceKind};

/// remediate - budget-aware node drains and pod evictions for Kubernetes
#[derive(Parser, Debug)]
#[command(name = "remediate")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a kubeconfig file (defaults to the usual inference chain)
    #[arg(long, global = true, value_name = "PATH")]
    kubeconfig: Option<PathBuf>,

    /// Kubernetes context to use
    #[arg(long, global = true)]
    context: Option<String>,

    /// Engine configuration file (TOML)
    #[arg(long, short = 'c', global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Cordon and drain a node, respecting disruption budgets
    Node {
        /// Node name
        name: String,

        /// Budget groups evicted in parallel
        #[arg(long, value_name = "N")]
        max_concurrency: Option<usize>,

        /// Print the eviction plan without evicting anything
        #[arg(long)]
        dry_run: bool,

        /// Do not mark the node unschedulable first
        #[arg(long)]
        no_cordon: bool,
    },

    /// Evict a single pod
    Pod {
        /// Pod name; the namespace is looked up in cluster state
        name: String,

        /// Namespace, when the name exists in several
        #[arg(long, short)]
        namespace: Option<String>,

        /// Print the eviction plan without evicting anything
        #[arg(long)]
        dry_run: bool,
    },

    /// List pods with their readiness and governing budget
    Pods {
        /// Only pods scheduled on this node
        #[arg(long)]
        node: Option<String>,

        /// Only pods in this namespace
        #[arg(long, short)]
        namespace: Option<String>,
    },

    /// Run the remediation controller until interrupted
    Watch {
        /// Budget groups evicted in parallel
        #[arg(long, value_name = "N")]
        max_concurrency: Option<usize>,
    },
}

/// Connected client and synced cluster view
struct Session {
    api: Arc<dyn ClusterApi>,
    observer: ClusterObserver,
    config: EngineConfig,
    cancel: CancellationToken,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();

    let session = match connect(&args).await {
        Ok(session) => session,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(2);
        }
    };

    match run_command(args.command, session).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

/// Everything that must succeed before any work starts
async fn connect(args: &Args) -> Result<Session> {
    let config = config::load(args.config.as_deref())?;

    let client = KubeClient::connect(args.kubeconfig.as_deref(), args.context.as_deref())
        .await
        .context("Failed to load Kubernetes credentials")?;
    let version = client
        .server_version()
        .await
        .context("Cannot reach the Kubernetes API server")?;
    info!(%version, "Connected to API server");

    let api: Arc<dyn ClusterApi> = Arc::new(client);
    let observer = ClusterObserver::new(api.clone(), config.observer.clone());
    observer
        .sync()
        .await
        .context("Failed to read initial cluster state")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, shutting down");
            on_signal.cancel();
        }
    });

    Ok(Session {
        api,
        observer,
        config,
        cancel,
    })
}

/// Returns whether every targeted pod ended up evicted
async fn run_command(command: Command, session: Session) -> Result<bool> {
    match command {
        Command::Pods { node, namespace } => {
            let snapshot = session.observer.snapshot();
            print!(
                "{}",
                output::pods_table(&snapshot, node.as_deref(), namespace.as_deref())
            );
            Ok(true)
        }

        Command::Node {
            name,
            max_concurrency,
            dry_run,
            no_cordon,
        } => {
            let request = RemediationRequest::drain(&name);
            let cordon = !dry_run && !no_cordon;
            remediate(&session, request, max_concurrency, dry_run, cordon.then_some(name)).await
        }

        Command::Pod {
            name,
            namespace,
            dry_run,
        } => {
            let key = session
                .observer
                .snapshot()
                .resolve_pod(&name, namespace.as_deref())?
                .key();
            let request = RemediationRequest::evict(vec![key]);
            remediate(&session, request, None, dry_run, None).await
        }

        Command::Watch { max_concurrency } => watch(session, max_concurrency).await,
    }
}

async fn remediate(
    session: &Session,
    request: RemediationRequest,
    max_concurrency: Option<usize>,
    dry_run: bool,
    cordon: Option<String>,
) -> Result<bool> {
    let snapshot = session.observer.snapshot();
    let plan = plan(&snapshot, &request)?;

    if dry_run {
        print!("{}", output::plan_table(&plan, &snapshot));
        return Ok(true);
    }

    let watcher = session.observer.start(session.cancel.clone());

    if let Some(node) = cordon {
        session
            .api
            .cordon(&node)
            .await
            .with_context(|| format!("Failed to cordon node {}", node))?;
        println!("node/{} cordoned", node);
    }

    let report = execute(session, &plan, max_concurrency).await;
    print!("{}", output::summary(&report));

    session.cancel.cancel();
    let _ = watcher.await;
    Ok(!report.has_failures())
}

async fn execute(
    session: &Session,
    plan: &remediate_engine::EvictionPlan,
    max_concurrency: Option<usize>,
) -> ExecutionReport {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(outcome) = rx.recv().await {
            println!("{}", output::outcome_line(&outcome));
        }
    });

    let executor = executor(session, max_concurrency).with_progress(tx);
    let report = executor.execute(plan, &session.cancel).await;
    drop(executor);
    let _ = printer.await;
    report
}

fn executor(session: &Session, max_concurrency: Option<usize>) -> EvictionExecutor {
    let executor = EvictionExecutor::new(
        session.api.clone(),
        session.observer.store().clone(),
        &session.config,
    );
    match max_concurrency {
        Some(n) => executor.with_max_concurrency(n),
        None => executor,
    }
}

async fn watch(session: Session, max_concurrency: Option<usize>) -> Result<bool> {
    let nodes = session.observer.store().len(ResourceKind::Node);
    info!(nodes, "Starting controller");

    let watcher = session.observer.start(session.cancel.clone());
    let controller = RemediationController::new(
        session.api.clone(),
        session.observer.clone(),
        executor(&session, max_concurrency),
        session.config.controller.clone(),
    );

    let report = controller.run(session.cancel.clone()).await;
    let _ = watcher.await;

    print!("{}", output::summary(&report));
    // Budget waits and denials are expected in a long-running loop
    Ok(report.summary().abandoned == 0)
}
