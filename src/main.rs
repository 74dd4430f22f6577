use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::{mpsc, watch, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleetward::config::Config;
use fleetward::directory::InstanceDirectory;
use fleetward::error::Error;
use fleetward::fanout::ApiFanout;
use fleetward::jobs::{load_catalog, JobScheduler};
use fleetward::lock::{cleanup_socket, LockCoordinator};
use fleetward::reconcile::Reconciler;
use fleetward::schema::SettingCatalog;
use fleetward::store::SqliteStore;
use fleetward::utils::PidFile;
use fleetward::watcher::{
    docker::DockerWatcher, kubernetes::KubernetesWatcher, spawn_watch, static_file::StaticWatcher,
    swarm::SwarmWatcher, Backend,
};

#[derive(Parser)]
#[command(
    name = "fleetward",
    version,
    about = "Control plane for a reverse-proxy/WAF fleet",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML); environment variables otherwise
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true, default_value = "text")]
    log_format: String,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendKind {
    Docker,
    Swarm,
    Kubernetes,
    Static,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the backend and reconcile the fleet until shutdown
    Daemon {
        /// Backend to observe
        #[arg(short, long, value_enum)]
        backend: BackendKind,

        /// Variables file for the static backend
        #[arg(long)]
        variables: Option<PathBuf>,
    },

    /// Observe once, apply once, run cached jobs, exit
    RunOnce {
        /// Backend to observe
        #[arg(short, long, value_enum)]
        backend: BackendKind,

        /// Variables file for the static backend
        #[arg(long)]
        variables: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_format, cli.verbose) {
        eprintln!("cannot initialize logging: {e}");
        return ExitCode::from(2);
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::from(2);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "cannot start runtime");
            return ExitCode::from(2);
        }
    };

    let outcome = runtime.block_on(async {
        match cli.command {
            Commands::Daemon { backend, variables } => daemon(config, backend, variables).await,
            Commands::RunOnce { backend, variables } => run_once(config, backend, variables).await,
        }
    });

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if matches!(e, Error::StartupFatal { .. }) => {
            tracing::error!(error = %e, "startup failed");
            ExitCode::from(2)
        }
        Err(e) => {
            tracing::error!(error = %e, "exiting on error");
            ExitCode::from(1)
        }
    }
}

fn load_config(cli: &Cli) -> fleetward::error::Result<Config> {
    let config = match &cli.config {
        Some(path) => Config::from_file(path).map_err(|e| Error::startup(e.to_string()))?,
        None => Config::from_env().map_err(|e| Error::startup(e.to_string()))?,
    };
    config
        .validate()
        .map_err(|e| Error::startup(e.to_string()))?;
    Ok(config)
}

fn setup_tracing(format: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("fleetward=debug,info")
    } else {
        tracing_subscriber::EnvFilter::new("fleetward=info,warn")
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}

fn build_backend(
    config: &Config,
    kind: BackendKind,
    variables: Option<PathBuf>,
) -> fleetward::error::Result<Arc<dyn Backend>> {
    let default_port = config.fanout.default_port;
    let backend: Arc<dyn Backend> = match kind {
        BackendKind::Docker => Arc::new(
            DockerWatcher::new(&config.backend, default_port)
                .map_err(|e| Error::startup(format!("docker backend: {e}")))?,
        ),
        BackendKind::Swarm => Arc::new(
            SwarmWatcher::new(&config.backend, default_port)
                .map_err(|e| Error::startup(format!("swarm backend: {e}")))?,
        ),
        BackendKind::Kubernetes => Arc::new(
            KubernetesWatcher::new(&config.backend, default_port)
                .map_err(|e| Error::startup(format!("kubernetes backend: {e}")))?,
        ),
        BackendKind::Static => {
            let path = variables
                .or_else(|| config.backend.variables_path.clone())
                .ok_or_else(|| Error::startup("static backend requires --variables"))?;
            Arc::new(StaticWatcher::new(path, default_port))
        }
    };
    Ok(backend)
}

fn build_scheduler(config: &Config) -> fleetward::error::Result<Option<Arc<JobScheduler>>> {
    if !config.jobs.catalog_path.exists() {
        tracing::info!(
            catalog = %config.jobs.catalog_path.display(),
            "no job catalog, scheduler disabled"
        );
        return Ok(None);
    }
    let defs = load_catalog(&config.jobs.catalog_path)?;
    tracing::info!(jobs = defs.len(), "job catalog loaded");
    Ok(Some(Arc::new(JobScheduler::new(
        defs,
        config.jobs.cache_dir.clone(),
        config.jobs.workers,
    ))))
}

fn build_reconciler(
    config: &Config,
    lock: Arc<Mutex<()>>,
    scheduler: Option<Arc<JobScheduler>>,
    store: Arc<SqliteStore>,
) -> fleetward::error::Result<Reconciler> {
    let catalog = SettingCatalog::load(&config.schema_path)?;
    let fanout = ApiFanout::new(config.fanout.clone())
        .map_err(|e| Error::startup(format!("fanout client: {e}")))?;
    Ok(Reconciler::new(
        Arc::new(InstanceDirectory::new()),
        Arc::new(fanout),
        catalog,
        store,
        lock,
        scheduler,
        config.jobs.cache_dir.clone(),
    ))
}

async fn daemon(
    config: Config,
    backend: BackendKind,
    variables: Option<PathBuf>,
) -> fleetward::error::Result<()> {
    let _pid = PidFile::acquire("/var/run/fleetward/fleetward.pid")?;
    if let Err(e) = fleetward::metrics::init_metrics() {
        tracing::warn!(error = %e, "metrics disabled");
    }

    let store = Arc::new(SqliteStore::open(&config.store.sqlite_path)?);
    Reconciler::wait_for_store(
        store.as_ref(),
        Duration::from_secs(config.store.init_timeout_secs),
    )
    .await?;

    let lock = Arc::new(Mutex::new(()));
    let scheduler = build_scheduler(&config)?;
    let reconciler = build_reconciler(&config, Arc::clone(&lock), scheduler.clone(), store)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (event_tx, event_rx) = mpsc::channel(16);

    let observer = build_backend(&config, backend, variables)?;
    tracing::info!(backend = observer.name(), "watching backend");
    let watch_handle = spawn_watch(
        observer,
        config.poll_interval(),
        event_tx,
        shutdown_rx.clone(),
    );

    let socket_path = config.lock.socket_path.clone();
    let mut coordinator = LockCoordinator::new(
        Arc::clone(&lock),
        socket_path.clone(),
        Duration::from_secs(config.lock.action_timeout_secs),
    );
    if let Some(scheduler) = scheduler {
        let jobs = Arc::clone(&scheduler);
        coordinator.register_action(
            "jobs",
            Arc::new(move || {
                let jobs = Arc::clone(&jobs);
                Box::pin(async move {
                    jobs.tick().await;
                    Ok(())
                })
            }),
        );
    }
    let lock_handle = tokio::spawn(coordinator.serve());

    let loop_handle = tokio::spawn(reconciler.run(event_rx, shutdown_rx));

    wait_for_signal().await;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = watch_handle.await;
    let _ = loop_handle.await;
    lock_handle.abort();
    cleanup_socket(&socket_path);

    tracing::info!("fleetward stopped");
    Ok(())
}

async fn run_once(
    config: Config,
    backend: BackendKind,
    variables: Option<PathBuf>,
) -> fleetward::error::Result<()> {
    if let Err(e) = fleetward::metrics::init_metrics() {
        tracing::warn!(error = %e, "metrics disabled");
    }

    let store = Arc::new(SqliteStore::open(&config.store.sqlite_path)?);
    let lock = Arc::new(Mutex::new(()));
    let scheduler = build_scheduler(&config)?;
    let mut reconciler =
        build_reconciler(&config, lock, scheduler.clone(), store)?;

    let observer = build_backend(&config, backend, variables)?;
    let mut observation = observer.observe().await?;
    if observation.instances.is_empty() {
        return Err(Error::BackendUnreachable {
            backend: observer.name().to_string(),
            reason: "no instances observed".to_string(),
        });
    }
    reconciler.probe_health(&mut observation.instances).await;

    let report = reconciler.apply(observation, true).await?;
    if !report.published() {
        return Err(Error::InstanceUnreachable {
            hostname: "*".to_string(),
            reason: "no instance accepted the configuration".to_string(),
        });
    }

    if let Some(scheduler) = scheduler {
        if !scheduler.run_once().await {
            return Err(Error::JobFailed {
                job: "*".to_string(),
                reason: "at least one job failed".to_string(),
            });
        }
    }

    tracing::info!(pass = %report.pass_id, "single pass applied");
    Ok(())
}

async fn wait_for_signal() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(sig) => sig,
        Err(e) => {
            tracing::warn!(error = %e, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
