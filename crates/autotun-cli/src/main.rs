//! autotun - keeps SSH port forwards alive

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

use autotun_cli::config::AppConfig;
use autotun_cli::service::{ServiceManager, ServiceStatus, LOG_DIR_NAME};
use autotun_cli::{default_work_dir, logging};
use autotun_client::{MappingSpec, Supervisor};
use autotun_transport::AuthMethod;
use autotun_transport_ssh::SshConnector;

#[cfg(windows)]
mod windows_host;

/// Upper bound on how long a stop may take before the process exits anyway
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// autotun - persistent SSH port forwarding
#[derive(Parser, Debug)]
#[command(name = "autotun")]
#[command(about = "Keep remote and local SSH port forwards alive", long_about = None)]
#[command(version = env!("AUTOTUN_VERSION"))]
#[command(long_version = concat!(env!("AUTOTUN_VERSION"), "\nCommit: ", env!("AUTOTUN_GIT_HASH"), "\nBuilt: ", env!("AUTOTUN_BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file (default: config.private.yaml or config.yaml in the working directory)
    #[arg(short, long, global = true, env = "AUTOTUN_CONFIG")]
    config: Option<PathBuf>,

    /// Working directory for configuration, relative key paths and logs
    #[arg(long, global = true, env = "AUTOTUN_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Write logs to daily files under <work-dir>/logs instead of stderr
    #[arg(long, global = true)]
    log_to_file: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect and keep every mapping forwarded (default)
    Run,
    /// Validate the configuration and print the forwarding plan
    Check,
    /// Write a starter config.yaml into the working directory
    Init,
    /// Manage the background service
    Service {
        #[command(subcommand)]
        command: ServiceCommands,
    },
    /// Run under the Windows service control manager
    #[cfg(windows)]
    #[command(name = "service-host", hide = true)]
    ServiceHost,
}

#[derive(Subcommand, Debug)]
enum ServiceCommands {
    /// Install system service
    Install,
    /// Uninstall system service
    Uninstall,
    /// Start service
    Start,
    /// Stop service
    Stop,
    /// Restart service
    Restart,
    /// Check service status
    Status,
    /// View service logs
    Logs {
        /// Number of lines to show
        #[arg(short, long, default_value = "50")]
        lines: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let work_dir = match &cli.work_dir {
        Some(dir) => dir.clone(),
        None => default_work_dir(),
    };

    let log_dir = cli.log_to_file.then(|| work_dir.join(LOG_DIR_NAME));
    let _log_guard = logging::init_logging(cli.verbose, log_dir.as_deref())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
            runtime.block_on(run(cli.config.as_deref(), &work_dir, shutdown_signal()))
        }
        Commands::Check => check(cli.config.as_deref(), &work_dir),
        Commands::Init => init(&work_dir),
        Commands::Service { command } => {
            handle_service_command(command, cli.config.as_deref(), &work_dir)
        }
        // The dispatcher blocks until the service stops, keeping the log guard alive
        #[cfg(windows)]
        Commands::ServiceHost => windows_host::dispatch(cli.config, work_dir),
    }
}

/// Supervise every mapping until `shutdown` resolves or a fatal error occurs
async fn run(
    config_path: Option<&Path>,
    work_dir: &Path,
    shutdown: impl Future<Output = Result<()>>,
) -> Result<()> {
    let (path, config) = AppConfig::resolve(config_path, work_dir)?;
    info!(
        config = %path.display(),
        version = env!("AUTOTUN_VERSION"),
        commit = env!("AUTOTUN_GIT_HASH"),
        "Loaded configuration"
    );

    let mappings = config.mappings();
    if mappings.is_empty() {
        warn!("No valid mappings configured, the session will carry no forwards");
    }

    let connector = SshConnector::new(config.ssh_config()?);
    let supervisor = Supervisor::new(
        connector,
        mappings,
        config.credentials(work_dir),
        config.supervisor_config(),
    );
    let handle = supervisor.handle();

    let mut task = tokio::spawn(supervisor.run());

    tokio::select! {
        result = &mut task => {
            return result
                .context("Supervisor task panicked")?
                .context("Tunnel supervisor failed");
        }
        signal = shutdown => {
            signal?;
            info!("Shutdown requested");
            handle.stop();
        }
    }

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task).await {
        Ok(result) => {
            result
                .context("Supervisor task panicked")?
                .context("Tunnel supervisor failed")?;
            info!("Stopped");
            Ok(())
        }
        Err(_) => {
            task.abort();
            error!(
                timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                state = ?handle.state(),
                "Supervisor did not stop in time"
            );
            anyhow::bail!("Timed out waiting for the supervisor to stop")
        }
    }
}

/// Resolves on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl+C"),
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")
    }
}

fn check(config_path: Option<&Path>, work_dir: &Path) -> Result<()> {
    let (path, config) = AppConfig::resolve(config_path, work_dir)?;
    let endpoint = config.server_endpoint()?;
    let credentials = config.credentials(work_dir);

    println!("Configuration: {}", path.display());
    println!("Server:        {}@{}", config.server.user, endpoint);

    let methods = credentials.auth_methods();
    if methods.is_empty() {
        anyhow::bail!("Neither server.keyfile nor server.password is set");
    }
    for method in &methods {
        match method {
            AuthMethod::PrivateKey(key) => {
                let state = if key.is_file() { "" } else { " (missing)" };
                println!("Auth:          key {}{}", key.display(), state);
            }
            AuthMethod::Password(_) => println!("Auth:          password"),
        }
    }

    let mappings = config.mappings();
    let configured = config.mappings.rtl.len() + config.mappings.ltr.len();
    println!();
    println!("Mappings ({} of {} valid):", mappings.len(), configured);
    print_plan(&mappings);

    Ok(())
}

fn init(work_dir: &Path) -> Result<()> {
    let path = AppConfig::write_template(work_dir)?;
    println!("✅ Wrote {}", path.display());
    println!("   Edit the server and mappings, then run: autotun check");
    Ok(())
}

fn print_plan(mappings: &[MappingSpec]) {
    if mappings.is_empty() {
        println!("  (none)");
        return;
    }
    for (index, spec) in mappings.iter().enumerate() {
        println!("  {:>2}. {:<3} {}", index + 1, spec.direction.as_str(), spec);
    }
}

fn handle_service_command(
    command: ServiceCommands,
    config_path: Option<&Path>,
    work_dir: &Path,
) -> Result<()> {
    let work_dir = std::path::absolute(work_dir)
        .with_context(|| format!("Failed to resolve working directory: {:?}", work_dir))?;
    let config_path = config_path
        .map(|path| std::path::absolute(work_dir.join(path)))
        .transpose()
        .context("Failed to resolve configuration path")?;
    let service_manager = ServiceManager::new(&work_dir).with_config(config_path.clone());

    if !service_manager.is_supported() {
        eprintln!("❌ Service management is not supported on this platform");
        eprintln!("   Supported platforms: macOS (launchd), Linux (systemd), Windows (SCM)");
        std::process::exit(1);
    }

    match command {
        ServiceCommands::Install => {
            // Refuse to install a service that would fail on its first start
            let (path, _) = AppConfig::resolve(config_path.as_deref(), &work_dir)?;
            println!("Using configuration: {}", path.display());
            service_manager.install()
        }
        ServiceCommands::Uninstall => service_manager.uninstall(),
        ServiceCommands::Start => service_manager.start(),
        ServiceCommands::Stop => service_manager.stop(),
        ServiceCommands::Restart => service_manager.restart(),
        ServiceCommands::Status => {
            let status = service_manager.status()?;
            println!("Service status: {}", status);
            if status == ServiceStatus::NotInstalled {
                println!("   Install with: autotun service install");
            }
            Ok(())
        }
        ServiceCommands::Logs { lines } => {
            let logs = service_manager.logs(lines)?;
            print!("{}", logs);
            Ok(())
        }
    }
}
