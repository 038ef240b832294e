use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use rtrmd::app::registry::ApplicationRegistry;
use rtrmd::config::{CliOverrides, ConfigWatcher, DaemonConfig};
use rtrmd::ipc::event::{ManagerEvent, UserCommand};
use rtrmd::ipc::EventBroadcaster;
use rtrmd::manager::ResourceManager;
use rtrmd::peer::{run_peer_directory_loop, PeerDirectory};
use rtrmd::platform::{run_platform_refresh_loop, LocalPlatformProxy, PlatformEvent, PlatformProxy};
use rtrmd::res::ResourceAccounter;
use rtrmd::res::ResourceTree;
use rtrmd::rpc::{serve, RpcClient, RpcServerContext};
use rtrmd::scenarios;
use rtrmd::scheduler::policies::greedy::GreedyPolicy;
use rtrmd::scheduler::policy::Policy;
use rtrmd::scheduler::SchedulerDriver;
use rtrmd::sync::channel::ChannelRegistry;
use rtrmd::sync::SyncManager;

/// The run-time resource manager daemon: arbitrates compute/memory/accelerator
/// resources among registered execution contexts and federates sibling
/// instances over the agent RPC surface.
#[derive(Parser, Debug)]
#[command(name = "rtrmd", version, about = "Run-Time Resource Manager daemon")]
struct Cli {
    /// Run as a foreground daemon. This is also the default action when no
    /// other flag forces a different mode (e.g. `--tests`).
    #[arg(long)]
    daemon: bool,

    /// Path to the TOML configuration file.
    #[arg(long, default_value = "/etc/rtrmd/config.toml")]
    config: PathBuf,

    /// Directory to load scheduling-policy plug-ins from. Accepted for CLI
    /// completeness; dynamic plug-in loading is not implemented by this
    /// build, so the path is recorded but never read back.
    #[arg(long)]
    plugins_dir: Option<PathBuf>,

    /// Run the built-in end-to-end scenario suite and exit. Exit code is 0
    /// if every scenario passed, non-zero otherwise.
    #[arg(long)]
    tests: bool,

    /// Drop privileges to this uid after binding the RPC listener (unix only).
    #[arg(long)]
    uid: Option<u32>,

    /// Drop privileges to this gid after binding the RPC listener (unix only).
    #[arg(long)]
    gid: Option<u32>,

    /// Exclusive lockfile path; refuses to start a second instance against
    /// the same file.
    #[arg(long)]
    lockfile: Option<PathBuf>,

    /// Working directory to chdir into before dropping privileges.
    #[arg(long)]
    rundir: Option<PathBuf>,

    /// Override `DistributedManager.start_address`.
    #[arg(long)]
    start_address: Option<Ipv4Addr>,

    /// Override `DistributedManager.end_address`.
    #[arg(long)]
    end_address: Option<Ipv4Addr>,

    /// Override `AgentProxy.port`.
    #[arg(long)]
    port: Option<u16>,

    /// Override `Scheduler.policy`.
    #[arg(long)]
    policy: Option<String>,

    /// Override `Logging.level`.
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> ExitCode {
    let cli_overrides = CliOverrides {
        start_address: cli.start_address,
        end_address: cli.end_address,
        agent_proxy_port: cli.port,
        policy: cli.policy.clone(),
        log_level: cli.log_level.clone(),
        plugins_dir: cli.plugins_dir.clone(),
    };

    let config = match DaemonConfig::load(&cli.config, &cli_overrides) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let log_reload = init_logging(&config.logging.level);

    if cli.tests {
        return run_scenario_suite().await;
    }

    if let Some(rundir) = &cli.rundir {
        if let Err(e) = std::env::set_current_dir(rundir) {
            error!(rundir = %rundir.display(), err = %e, "failed to chdir into rundir");
            return ExitCode::FAILURE;
        }
    }

    let _lock_guard = match cli.lockfile.as_deref() {
        Some(path) => match acquire_lockfile(path) {
            Ok(guard) => Some(guard),
            Err(e) => {
                error!(path = %path.display(), err = %e, "failed to acquire lockfile — another instance may be running");
                return ExitCode::FAILURE;
            }
        },
        None => None,
    };

    if let Err(e) = drop_privileges(cli.uid, cli.gid) {
        error!(err = %e, "failed to drop privileges");
        return ExitCode::FAILURE;
    }

    match run_daemon(config, log_reload).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(err = %e, "daemon exited with a fatal error");
            ExitCode::FAILURE
        }
    }
}

/// Handle the `Logging.level` hot-reload watcher uses to swap the active
/// filter without restarting the daemon.
type LogReloadHandle = tracing_subscriber::reload::Handle<
    tracing_subscriber::EnvFilter,
    tracing_subscriber::Registry,
>;

fn init_logging(level: &str) -> LogReloadHandle {
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let (filter, reload_handle) = tracing_subscriber::reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .init();
    reload_handle
}

async fn run_scenario_suite() -> ExitCode {
    info!("running built-in scenario suite");
    let report = scenarios::run_all().await;
    for result in &report.results {
        if result.passed {
            info!(scenario = result.name, "passed");
        } else {
            error!(scenario = result.name, detail = %result.detail, "failed");
        }
    }
    if report.all_passed() {
        info!("all scenarios passed");
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Build every long-lived component, start the background loops, and run
/// the Resource Manager loop until a shutdown command arrives.
async fn run_daemon(config: DaemonConfig, log_reload: LogReloadHandle) -> anyhow::Result<()> {
    let config = Arc::new(config);
    info!(
        policy = %config.scheduler.policy,
        port = config.agent_proxy.port,
        "rtrmd starting"
    );

    let accounter = Arc::new(ResourceAccounter::new(ResourceTree::new()));
    let registry = Arc::new(ApplicationRegistry::new());
    let channels = ChannelRegistry::new();
    let sync = Arc::new(SyncManager::new(channels.clone()));

    let policy: Arc<dyn Policy> = match config.scheduler.policy.as_str() {
        "greedy" => Arc::new(GreedyPolicy::new()),
        other => {
            anyhow::bail!("unknown Scheduler.policy {other:?} (available: greedy)");
        }
    };
    let driver = Arc::new(SchedulerDriver::new(accounter.clone(), registry.clone(), sync, policy));

    let platform = Arc::new(LocalPlatformProxy::new(accounter.clone()));
    platform.load_platform_data().await?;

    let local_addr = local_ip_address::local_ip()
        .ok()
        .and_then(|ip| match ip {
            std::net::IpAddr::V4(v4) => Some(v4),
            std::net::IpAddr::V6(_) => None,
        })
        .unwrap_or(Ipv4Addr::new(127, 0, 0, 1));
    let is_master = u32::from(local_addr) <= u32::from(config.distributed_manager.start_address);
    let rpc_client = Arc::new(RpcClient::new(u32::from(local_addr), config.agent_proxy.port));
    let directory = Arc::new(PeerDirectory::new(
        rpc_client.clone(),
        local_addr,
        (config.distributed_manager.start_address, config.distributed_manager.end_address),
        config.distributed_manager.hierarchical,
        is_master,
    ));

    let broadcaster = Arc::new(EventBroadcaster::new());
    let manager = Arc::new(ResourceManager::new(
        registry.clone(),
        accounter.clone(),
        driver.clone(),
        channels,
        broadcaster.clone(),
    ));

    let (events_tx, events_rx) = mpsc::channel::<ManagerEvent>(256);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.agent_proxy.port)).await?;
    let rpc_ctx = Arc::new(RpcServerContext {
        accounter: accounter.clone(),
        registry: registry.clone(),
        directory: directory.clone(),
        local_role: if is_master && config.distributed_manager.hierarchical {
            rtrmd::peer::PeerRole::Master
        } else {
            rtrmd::peer::PeerRole::Slave
        },
    });
    tokio::spawn(serve(rpc_ctx, listener));

    let (platform_tx, mut platform_rx) = mpsc::channel::<PlatformEvent>(32);
    tokio::spawn(run_platform_refresh_loop(platform.clone(), std::time::Duration::from_secs(5), platform_tx));
    {
        let events_tx = events_tx.clone();
        tokio::spawn(async move {
            while let Some(PlatformEvent::Refreshed(report)) = platform_rx.recv().await {
                if events_tx.send(ManagerEvent::PlatRefresh(report)).await.is_err() {
                    return;
                }
            }
        });
    }

    tokio::spawn(run_peer_directory_loop(directory.clone(), config.peer_tick_period()));
    {
        let directory = directory.clone();
        let events_tx = events_tx.clone();
        let mut known: std::collections::HashSet<u16> = std::collections::HashSet::new();
        let mut tick = tokio::time::interval(config.peer_tick_period());
        tokio::spawn(async move {
            loop {
                tick.tick().await;
                let peers = directory.peers().await;
                for peer in peers {
                    if known.insert(peer.id) && events_tx.send(ManagerEvent::PeerJoin(peer.id)).await.is_err() {
                        return;
                    }
                }
            }
        });
    }

    let _config_watcher = ConfigWatcher::start(&config.config_path).map(|watcher| {
        let hot = watcher.hot.clone();
        let events_tx = events_tx.clone();
        let mut applied_level = config.logging.level.clone();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(std::time::Duration::from_secs(2));
            loop {
                ticks.tick().await;
                let level = hot.read().await.log_level.clone();
                if level == applied_level {
                    continue;
                }
                let filter = tracing_subscriber::EnvFilter::try_new(&level)
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
                if log_reload.reload(filter).is_err() {
                    warn!("failed to apply reloaded log level, keeping previous filter");
                    continue;
                }
                applied_level = level;
                info!(level = %applied_level, "logging level hot-reloaded");
                if events_tx.send(ManagerEvent::UserCmd(UserCommand::ReloadConfig)).await.is_err() {
                    return;
                }
            }
        });
        watcher
    });

    {
        let events_tx = events_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("signal received, requesting shutdown");
                let _ = events_tx.send(ManagerEvent::UserCmd(UserCommand::Shutdown)).await;
            }
        });
    }

    manager.run(events_rx).await;
    info!("rtrmd shut down cleanly");
    Ok(())
}

struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn acquire_lockfile(path: &std::path::Path) -> std::io::Result<LockGuard> {
    use std::fs::OpenOptions;
    use std::io::Write;

    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    write!(file, "{}", std::process::id())?;
    Ok(LockGuard { path: path.to_path_buf() })
}

#[cfg(unix)]
fn drop_privileges(uid: Option<u32>, gid: Option<u32>) -> anyhow::Result<()> {
    if let Some(gid) = gid {
        if unsafe { libc::setgid(gid) } != 0 {
            anyhow::bail!("setgid({gid}) failed: {}", std::io::Error::last_os_error());
        }
    }
    if let Some(uid) = uid {
        if unsafe { libc::setuid(uid) } != 0 {
            anyhow::bail!("setuid({uid}) failed: {}", std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn drop_privileges(uid: Option<u32>, gid: Option<u32>) -> anyhow::Result<()> {
    if uid.is_some() || gid.is_some() {
        anyhow::bail!("--uid/--gid privilege drop is only supported on unix");
    }
    Ok(())
}
