//! Daemon configuration (C11): TOML file, overlaid with CLI flags, using a
//! `CLI/env > TOML > built-in default` precedence layering and hot-reload
//! pattern.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::error::{Result, RtrmError};

const DEFAULT_START_ADDRESS: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);
const DEFAULT_END_ADDRESS: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);
const DEFAULT_DISCOVER_PERIOD_S: u64 = 5;
const DEFAULT_PING_PERIOD_S: u64 = 2;
const DEFAULT_AGENT_PROXY_PORT: u16 = 25000;
const DEFAULT_POLICY: &str = "greedy";
const DEFAULT_LOG_LEVEL: &str = "info";

// ─── TOML config file ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
struct TomlDistributedManager {
    start_address: Option<Ipv4Addr>,
    end_address: Option<Ipv4Addr>,
    discover_period_s: Option<u64>,
    ping_period_s: Option<u64>,
    hierarchical: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlAgentProxy {
    port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlScheduler {
    policy: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlLogging {
    level: Option<String>,
}

/// `config.toml` — all fields optional; priority is CLI/env > TOML > default.
#[derive(Debug, Deserialize, Default)]
struct TomlConfig {
    #[serde(rename = "DistributedManager", default)]
    distributed_manager: TomlDistributedManager,
    #[serde(rename = "AgentProxy", default)]
    agent_proxy: TomlAgentProxy,
    #[serde(rename = "Scheduler", default)]
    scheduler: TomlScheduler,
    #[serde(rename = "Logging", default)]
    logging: TomlLogging,
}

fn load_toml(path: &Path) -> Option<TomlConfig> {
    let contents = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config file — using defaults");
            None
        }
    }
}

// ─── DaemonConfig ───────────────────────────────────────────────────────────

/// CLI-supplied overrides.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub start_address: Option<Ipv4Addr>,
    pub end_address: Option<Ipv4Addr>,
    pub agent_proxy_port: Option<u16>,
    pub policy: Option<String>,
    pub log_level: Option<String>,
    pub plugins_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct DistributedManagerConfig {
    pub start_address: Ipv4Addr,
    pub end_address: Ipv4Addr,
    pub discover_period_s: u64,
    pub ping_period_s: u64,
    pub hierarchical: bool,
}

#[derive(Debug, Clone)]
pub struct AgentProxyConfig {
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub policy: String,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub distributed_manager: DistributedManagerConfig,
    pub agent_proxy: AgentProxyConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
    /// Accepted for CLI completeness; dynamic
    /// plug-in loading is out of scope, so this is recorded but never read back.
    pub plugins_dir: Option<PathBuf>,
    pub config_path: PathBuf,
}

impl DaemonConfig {
    /// Build config from a TOML file plus CLI overrides. Validates the
    /// `DistributedManager` period fields and address range.
    pub fn load(config_path: &Path, cli: &CliOverrides) -> Result<Self> {
        let toml = load_toml(config_path).unwrap_or_default();

        let start_address = cli
            .start_address
            .or(toml.distributed_manager.start_address)
            .unwrap_or(DEFAULT_START_ADDRESS);
        let end_address = cli
            .end_address
            .or(toml.distributed_manager.end_address)
            .unwrap_or(DEFAULT_END_ADDRESS);
        let discover_period_s = toml.distributed_manager.discover_period_s.unwrap_or(DEFAULT_DISCOVER_PERIOD_S);
        let ping_period_s = toml.distributed_manager.ping_period_s.unwrap_or(DEFAULT_PING_PERIOD_S);
        let hierarchical = toml.distributed_manager.hierarchical.unwrap_or(false);

        if discover_period_s < 1 {
            return Err(RtrmError::ConfigInvalid("DistributedManager.discover_period_s must be >= 1".into()));
        }
        if ping_period_s < 1 {
            return Err(RtrmError::ConfigInvalid("DistributedManager.ping_period_s must be >= 1".into()));
        }
        if start_address > end_address {
            return Err(RtrmError::ConfigInvalid("DistributedManager.start_address must be <= end_address".into()));
        }

        let port = cli.agent_proxy_port.or(toml.agent_proxy.port).unwrap_or(DEFAULT_AGENT_PROXY_PORT);

        let policy = cli
            .policy
            .clone()
            .or(toml.scheduler.policy)
            .unwrap_or_else(|| DEFAULT_POLICY.to_string());

        let level = cli
            .log_level
            .clone()
            .or(toml.logging.level)
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

        Ok(Self {
            distributed_manager: DistributedManagerConfig {
                start_address,
                end_address,
                discover_period_s,
                ping_period_s,
                hierarchical,
            },
            agent_proxy: AgentProxyConfig { port },
            scheduler: SchedulerConfig { policy },
            logging: LoggingConfig { level },
            plugins_dir: cli.plugins_dir.clone(),
            config_path: config_path.to_path_buf(),
        })
    }

    /// `gcd(discover_period_s, ping_period_s)` — the Peer Directory's single
    /// tick period.
    pub fn peer_tick_period(&self) -> std::time::Duration {
        std::time::Duration::from_secs(gcd(
            self.distributed_manager.discover_period_s,
            self.distributed_manager.ping_period_s,
        ))
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a.max(1)
}

// ─── Hot-reloadable config subset ───────────────────────────────────────────

/// Non-critical config fields that can change without restarting the daemon.
#[derive(Debug, Clone)]
pub struct HotConfig {
    pub log_level: String,
}

/// Watches the config file for changes and reloads `Logging.level`.
pub struct ConfigWatcher {
    pub hot: Arc<RwLock<HotConfig>>,
    _watcher: notify_debouncer_full::Debouncer<
        notify_debouncer_full::notify::RecommendedWatcher,
        notify_debouncer_full::FileIdMap,
    >,
}

impl ConfigWatcher {
    /// Start watching `config_path` for changes. Returns `None` if the
    /// watcher could not be created (non-fatal; the daemon runs fine without
    /// hot-reload).
    pub fn start(config_path: &Path) -> Option<Self> {
        let initial = load_hot_config(config_path);
        let hot = Arc::new(RwLock::new(initial));

        let hot_clone = hot.clone();
        let config_path_clone = config_path.to_path_buf();
        let rt_handle = tokio::runtime::Handle::current();

        let watcher = notify_debouncer_full::new_debouncer(
            std::time::Duration::from_secs(2),
            None,
            move |result: notify_debouncer_full::DebounceEventResult| {
                if let Ok(events) = result {
                    use notify_debouncer_full::notify::EventKind;
                    let relevant =
                        events.iter().any(|e| matches!(e.event.kind, EventKind::Modify(_) | EventKind::Create(_)));
                    if relevant {
                        let hot = hot_clone.clone();
                        let path = config_path_clone.clone();
                        rt_handle.spawn(async move {
                            let new_config = load_hot_config(&path);
                            let mut guard = hot.write().await;
                            if guard.log_level != new_config.log_level {
                                info!(log_level = %new_config.log_level, "config reloaded");
                                *guard = new_config;
                            }
                        });
                    }
                }
            },
        );

        match watcher {
            Ok(mut debouncer) => {
                use notify_debouncer_full::notify::Watcher as _;
                let watch_path = config_path.parent().unwrap_or_else(|| Path::new("."));
                if let Err(e) =
                    debouncer.watcher().watch(watch_path, notify_debouncer_full::notify::RecursiveMode::NonRecursive)
                {
                    warn!("config watcher failed to start: {e} — hot-reload disabled");
                    return None;
                }
                info!(path = %config_path.display(), "config hot-reload watcher started");
                Some(Self { hot, _watcher: debouncer })
            }
            Err(e) => {
                warn!("config watcher creation failed: {e} — hot-reload disabled");
                None
            }
        }
    }
}

fn load_hot_config(path: &Path) -> HotConfig {
    let toml = std::fs::read_to_string(path).ok().and_then(|s| toml::from_str::<TomlConfig>(&s).ok()).unwrap_or_default();
    HotConfig { log_level: toml.logging.level.unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()) }
}
