use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub fees: FeesConfig,
    #[serde(default)]
    pub rebalancer: RebalancerConfig,
    #[serde(default)]
    pub reputation: ReputationConfig,
    #[serde(default)]
    pub hive: HiveConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize)]
pub struct NodeConfig {
    /// Host daemon JSON-RPC endpoint
    pub base_url: String,
    /// Bearer token for the RPC endpoint (empty = no auth)
    #[serde(default)]
    pub api_token: String,
    /// Per-request RPC deadline in seconds
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    /// Path to the embedded store
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Master enable/disable
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Dry-run mode: decide everything, write nothing to the host
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Deserialize)]
pub struct FlowConfig {
    /// Flow analysis loop period in seconds
    #[serde(default = "default_flow_interval")]
    pub flow_interval: u64,
    /// Rolling window for flow and profitability stats
    #[serde(default = "default_flow_window_days")]
    pub flow_window_days: u32,
    /// Target daily forwarded sats used as the demand yardstick
    #[serde(default = "default_target_flow")]
    pub target_flow: u64,
    /// Above this concurrent-HTLC fill ratio a channel counts as congested
    #[serde(default = "default_congestion_threshold")]
    pub htlc_congestion_threshold: f64,
}

#[derive(Debug, Deserialize)]
pub struct FeesConfig {
    /// Fee adjustment loop period in seconds
    #[serde(default = "default_fee_interval")]
    pub fee_interval: u64,
    /// Hard clamp on every broadcast fee
    #[serde(default = "default_min_fee_ppm")]
    pub min_fee_ppm: u32,
    /// Hard clamp on every broadcast fee
    #[serde(default = "default_max_fee_ppm")]
    pub max_fee_ppm: u32,
    /// Minimum forwards since the last change before re-deciding
    #[serde(default = "default_min_forwards")]
    pub min_forwards_for_update: u32,
    /// Minimum seconds between fee changes on one channel
    #[serde(default = "default_fee_cooldown")]
    pub fee_cooldown_secs: u64,
    /// Additive ppm bump while a channel is congested
    #[serde(default = "default_congestion_step")]
    pub congestion_step_ppm: u32,
    /// Additive ppm bump while outbound liquidity is scarce
    #[serde(default = "default_scarcity_step")]
    pub scarcity_step_ppm: u32,
    /// Default per-channel policy: dynamic | passive | static | hive
    #[serde(default = "default_policy")]
    pub policy: String,
    /// Fee forced when policy = static
    #[serde(default = "default_static_fee")]
    pub static_fee_ppm: u32,
    /// Override the auto-manager before writing fees
    #[serde(default = "default_true")]
    pub clboss_enabled: bool,
    /// Legacy PID gains, retained so old config files keep loading; never evaluated
    #[serde(default = "default_pid_kp")]
    pub pid_kp: f64,
    #[serde(default = "default_pid_ki")]
    pub pid_ki: f64,
    #[serde(default)]
    pub pid_kd: f64,
    /// Per-channel policy overrides
    #[serde(default)]
    pub channel_policy: Vec<ChannelPolicy>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelPolicy {
    pub channel: String,
    pub policy: String,
    #[serde(default)]
    pub fee_ppm: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct RebalancerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Rebalance check loop period in seconds
    #[serde(default = "default_rebalance_interval")]
    pub rebalance_interval: u64,
    /// Plugin that executes circular payments
    #[serde(default = "default_rebalancer_plugin")]
    pub rebalancer_plugin: String,
    /// Minimum expected profit (sats) to admit a rebalance
    #[serde(default = "default_min_profit")]
    pub rebalance_min_profit: i64,
    /// Rebalance fee spend cap per UTC day (sats)
    #[serde(default = "default_daily_budget")]
    pub daily_budget_sats: u64,
    /// Never push a source channel's outbound below this (sats)
    #[serde(default = "default_wallet_reserve")]
    pub min_wallet_reserve: u64,
    /// Expected routing slippage on top of the source inbound fee
    #[serde(default = "default_slippage")]
    pub slippage_ppm: u32,
    /// Fixed per-attempt overhead (sats)
    #[serde(default = "default_overhead")]
    pub fixed_overhead_sats: u64,
    /// Per (source, target) pair cooldown in seconds
    #[serde(default = "default_rebalance_cooldown")]
    pub cooldown_secs: u64,
    /// Scale admitted amounts by kelly_fraction
    #[serde(default)]
    pub enable_kelly: bool,
    #[serde(default = "default_kelly_fraction")]
    pub kelly_fraction: f64,
}

#[derive(Debug, Deserialize)]
pub struct ReputationConfig {
    #[serde(default = "default_true")]
    pub enable_reputation: bool,
    /// Multiplicative score decay applied once per flow cycle
    #[serde(default = "default_reputation_decay")]
    pub reputation_decay: f64,
}

#[derive(Debug, Deserialize)]
pub struct HiveConfig {
    /// Consult the fleet-intelligence service when it is available
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    /// The exporter runs as a separate collaborator; these knobs are
    /// validated here and passed through.
    #[serde(default)]
    pub enable_prometheus: bool,
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

// Default value functions
fn default_rpc_timeout() -> u64 {
    10
}
fn default_db_path() -> PathBuf {
    PathBuf::from("revenue-ops.db")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_flow_interval() -> u64 {
    3600
}
fn default_flow_window_days() -> u32 {
    7
}
fn default_target_flow() -> u64 {
    1_000_000
}
fn default_congestion_threshold() -> f64 {
    0.5
}
fn default_fee_interval() -> u64 {
    1800
}
fn default_min_fee_ppm() -> u32 {
    1
}
fn default_max_fee_ppm() -> u32 {
    5000
}
fn default_min_forwards() -> u32 {
    3
}
fn default_fee_cooldown() -> u64 {
    1800
}
fn default_congestion_step() -> u32 {
    25
}
fn default_scarcity_step() -> u32 {
    50
}
fn default_policy() -> String {
    "dynamic".to_string()
}
fn default_static_fee() -> u32 {
    100
}
fn default_pid_kp() -> f64 {
    0.5
}
fn default_pid_ki() -> f64 {
    0.1
}
fn default_rebalance_interval() -> u64 {
    900
}
fn default_rebalancer_plugin() -> String {
    "circular".to_string()
}
fn default_min_profit() -> i64 {
    10
}
fn default_daily_budget() -> u64 {
    1000
}
fn default_wallet_reserve() -> u64 {
    50_000
}
fn default_slippage() -> u32 {
    50
}
fn default_overhead() -> u64 {
    1
}
fn default_rebalance_cooldown() -> u64 {
    3600
}
fn default_kelly_fraction() -> f64 {
    0.5
}
fn default_reputation_decay() -> f64 {
    0.98
}
fn default_prometheus_port() -> u16 {
    9900
}

// Default implementations
impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_level: default_log_level(),
            enabled: true,
            dry_run: false,
        }
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            flow_interval: default_flow_interval(),
            flow_window_days: default_flow_window_days(),
            target_flow: default_target_flow(),
            htlc_congestion_threshold: default_congestion_threshold(),
        }
    }
}

impl Default for FeesConfig {
    fn default() -> Self {
        Self {
            fee_interval: default_fee_interval(),
            min_fee_ppm: default_min_fee_ppm(),
            max_fee_ppm: default_max_fee_ppm(),
            min_forwards_for_update: default_min_forwards(),
            fee_cooldown_secs: default_fee_cooldown(),
            congestion_step_ppm: default_congestion_step(),
            scarcity_step_ppm: default_scarcity_step(),
            policy: default_policy(),
            static_fee_ppm: default_static_fee(),
            clboss_enabled: true,
            pid_kp: default_pid_kp(),
            pid_ki: default_pid_ki(),
            pid_kd: 0.0,
            channel_policy: Vec::new(),
        }
    }
}

impl Default for RebalancerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rebalance_interval: default_rebalance_interval(),
            rebalancer_plugin: default_rebalancer_plugin(),
            rebalance_min_profit: default_min_profit(),
            daily_budget_sats: default_daily_budget(),
            min_wallet_reserve: default_wallet_reserve(),
            slippage_ppm: default_slippage(),
            fixed_overhead_sats: default_overhead(),
            cooldown_secs: default_rebalance_cooldown(),
            enable_kelly: false,
            kelly_fraction: default_kelly_fraction(),
        }
    }
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            enable_reputation: true,
            reputation_decay: default_reputation_decay(),
        }
    }
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enable_prometheus: false,
            prometheus_port: default_prometheus_port(),
        }
    }
}

const POLICIES: &[&str] = &["dynamic", "passive", "static", "hive"];

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        // Hard limits (non-configurable safety rails)
        const ABS_MAX_FEE_PPM: u32 = 50_000;
        const MIN_LOOP_SECS: u64 = 60;

        if self.fees.min_fee_ppm > self.fees.max_fee_ppm {
            anyhow::bail!(
                "min_fee_ppm ({}) > max_fee_ppm ({})",
                self.fees.min_fee_ppm,
                self.fees.max_fee_ppm
            );
        }
        if self.fees.max_fee_ppm > ABS_MAX_FEE_PPM {
            anyhow::bail!(
                "max_fee_ppm ({}) above absolute maximum ({})",
                self.fees.max_fee_ppm,
                ABS_MAX_FEE_PPM
            );
        }
        for (name, secs) in [
            ("flow_interval", self.flow.flow_interval),
            ("fee_interval", self.fees.fee_interval),
            ("rebalance_interval", self.rebalancer.rebalance_interval),
        ] {
            if secs < MIN_LOOP_SECS {
                anyhow::bail!("{} ({}) below minimum of {}s", name, secs, MIN_LOOP_SECS);
            }
        }
        if self.flow.flow_window_days == 0 {
            anyhow::bail!("flow_window_days must be at least 1");
        }
        if self.flow.htlc_congestion_threshold <= 0.0
            || self.flow.htlc_congestion_threshold > 1.0
        {
            anyhow::bail!("htlc_congestion_threshold must be in (0, 1]");
        }
        if !POLICIES.contains(&self.fees.policy.as_str()) {
            anyhow::bail!("unknown fee policy: {}", self.fees.policy);
        }
        for cp in &self.fees.channel_policy {
            if !POLICIES.contains(&cp.policy.as_str()) {
                anyhow::bail!("unknown fee policy for {}: {}", cp.channel, cp.policy);
            }
        }
        if self.rebalancer.kelly_fraction <= 0.0 || self.rebalancer.kelly_fraction > 1.0 {
            anyhow::bail!("kelly_fraction must be in (0, 1]");
        }
        if self.reputation.reputation_decay <= 0.0 || self.reputation.reputation_decay > 1.0 {
            anyhow::bail!("reputation_decay must be in (0, 1]");
        }
        if self.metrics.enable_prometheus && self.metrics.prometheus_port < 1024 {
            anyhow::bail!(
                "prometheus_port ({}) must be unprivileged",
                self.metrics.prometheus_port
            );
        }
        if self.node.rpc_timeout_secs == 0 {
            anyhow::bail!("rpc_timeout_secs must be at least 1");
        }
        Ok(())
    }

    /// Policy in effect for one channel.
    pub fn policy_for(&self, scid: &str) -> (&str, Option<u32>) {
        for cp in &self.fees.channel_policy {
            if cp.channel == scid {
                return (cp.policy.as_str(), cp.fee_ppm);
            }
        }
        (self.fees.policy.as_str(), None)
    }

    /// Create a config with all defaults for testing purposes.
    #[cfg(test)]
    pub fn test_default() -> Self {
        Self {
            node: NodeConfig {
                base_url: "http://localhost:3010".to_string(),
                api_token: String::new(),
                rpc_timeout_secs: default_rpc_timeout(),
            },
            general: GeneralConfig::default(),
            flow: FlowConfig::default(),
            fees: FeesConfig::default(),
            rebalancer: RebalancerConfig::default(),
            reputation: ReputationConfig::default(),
            hive: HiveConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}
