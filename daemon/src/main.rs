use benchctl_core::config::{Config, ConfigLoader};
use benchctl_core::hostbridge::PipePool;
use benchctl_core::identity::IdentityAdapter;
use benchctl_core::registration::RegistrationLoop;
use benchctl_core::rpc::proto::controller_service_server::ControllerServiceServer;
use benchctl_core::rpc::ControllerGrpc;
use benchctl_core::scheduler::SchedulerAdapter;
use benchctl_core::store::documents::DocumentStore;
use benchctl_core::store::timeseries::TimeSeriesGateway;
use benchctl_core::submitter::Submitter;
use benchctl_core::watcher::Watcher;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// benchctld - controller daemon for Slurm-backed benchmark automation
#[derive(Parser)]
#[command(name = "benchctld")]
#[command(author = "Benchctl Contributors")]
#[command(version)]
#[command(about = "Controller daemon for the benchmark automation control plane", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to a config.toml file, overriding the default search path
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose (debug) logging regardless of `log_level`
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller daemon (default if no subcommand is given)
    Run,

    /// Configuration management commands
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a default config.toml to the default config path
    Init,
    /// Print the effective configuration (defaults + file + env) as TOML
    Show,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(cli.config, cli.verbose).await,
        Commands::Config(ConfigCommands::Init) => init_config(),
        Commands::Config(ConfigCommands::Show) => show_config(cli.config),
        Commands::Completions { shell } => {
            generate_completions(shell);
            Ok(())
        }
    };

    if let Err(err) = result {
        eprintln!("Error: {err}");
        if cli.verbose {
            eprintln!("\nCaused by:");
            for cause in err.chain().skip(1) {
                eprintln!("  {cause}");
            }
        }
        process::exit(1);
    }
}

fn init_config() -> anyhow::Result<()> {
    let path = benchctl_core::config::init_config_file()?;
    println!("wrote default config to {}", path.display());
    Ok(())
}

fn show_config(custom_path: Option<PathBuf>) -> anyhow::Result<()> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = custom_path {
        loader = loader.with_file(path);
    }
    let config = loader.load()?;
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

async fn run(custom_path: Option<PathBuf>, verbose: bool) -> anyhow::Result<()> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = custom_path {
        loader = loader.with_file(path);
    }
    let config: Config = loader.load()?;

    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(build_mode = ?config.build_mode, "starting benchctld");

    // Leaves first: stores and the host bridge have no dependencies on
    // anything else in this process.
    let documents = Arc::new(DocumentStore::connect(&config.document_store).await?);
    let time_series = Arc::new(TimeSeriesGateway::connect(&config.time_series).await?);

    let pipe_directory = if config.build_mode == benchctl_core::config::BuildMode::Dev {
        std::env::temp_dir().join("xbatctld-pipes")
    } else {
        PathBuf::from(&config.host_bridge.pipe_directory)
    };
    std::fs::create_dir_all(&pipe_directory)?;
    let pipes = Arc::new(PipePool::discover(pipe_directory, config.host_bridge.poll_retries)?);
    let acquire_timeout = Duration::from_secs(config.host_bridge.acquire_timeout_seconds);

    let scheduler = Arc::new(SchedulerAdapter::new(pipes.clone(), config.scheduler.clone(), acquire_timeout));
    if let Err(err) = scheduler.probe_version().await {
        tracing::warn!(error = %err, "scheduler version probe failed, defaulting to legacy node-query strategy");
    }

    let identity = Arc::new(IdentityAdapter::new(pipes.clone(), &config));
    let submitter = Arc::new(Submitter::new(identity.clone(), scheduler.clone(), documents.clone()));
    let watcher =
        Arc::new(Watcher::new(scheduler.clone(), documents.clone(), identity.clone(), config.scheduler.clone()));
    let registration =
        Arc::new(RegistrationLoop::new(scheduler.clone(), documents.clone(), watcher.clone(), config.scheduler.clone()));

    let cancellation = CancellationToken::new();

    let registration_handle = tokio::spawn({
        let registration = registration.clone();
        let cancellation = cancellation.clone();
        async move { registration.run(cancellation).await }
    });

    let grpc = ControllerGrpc::new(scheduler, identity, documents, time_series, submitter);
    let bind_address: std::net::SocketAddr = config.rpc.bind_address.parse()?;
    let shutdown_grace = Duration::from_secs(config.rpc.shutdown_grace_seconds);

    tracing::info!(%bind_address, "rpc surface listening");
    tokio::spawn(force_quit_on_second_signal());

    let server = tonic::transport::Server::builder()
        .add_service(ControllerServiceServer::new(grpc))
        .serve_with_shutdown(bind_address, first_signal(cancellation.clone()));

    server.await?;

    tokio::time::timeout(shutdown_grace, registration_handle).await.ok();

    Ok(())
}

/// Resolves on the first SIGINT/SIGTERM, cancelling `token` so the
/// registration loop exits at its next sleep boundary and telling
/// `serve_with_shutdown` to begin draining.
async fn first_signal(token: CancellationToken) {
    wait_for_signal().await;
    tracing::info!("shutdown signal received, draining");
    token.cancel();
}

/// A second SIGINT/SIGTERM during the drain window exits immediately
/// rather than waiting out the grace period.
async fn force_quit_on_second_signal() {
    wait_for_signal().await;
    wait_for_signal().await;
    tracing::warn!("second signal received, exiting immediately");
    process::exit(130);
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

fn generate_completions(shell: clap_complete::Shell) {
    use clap::CommandFactory;
    use clap_complete::generate;
    use std::io;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();
    generate(shell, &mut cmd, bin_name, &mut io::stdout());
}
