//! Configuration loading from TOML, environment and command line.
//!
//! Reads an optional `config.toml` and deserializes it into strongly-typed
//! structs; every key has a default so an empty or absent file is valid.
//! Secrets (the API token) are referenced by env-var name in the config and
//! resolved at runtime. Command-line flags override file values.

use anyhow::{Context, Result};
use clap::Parser;
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::types::{PositionType, ProbeError};

/// Default config file looked up when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

/// Env var that switches the provider to the simulated account when "true".
pub const USE_MOCK_ENV: &str = "MT5_USE_MOCK";

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub probe: ProbeConfig,
    pub credentials: CredentialsConfig,
    pub metaapi: MetaApiConfig,
    pub simulated: SimulatedConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProbeConfig {
    /// Deadline for `wait_synchronized`. `0` waits without bound.
    pub sync_timeout_secs: u64,
    /// Fetch deals over this many trailing days. `0` skips history.
    pub history_days: u32,
    /// Print extended account figures and one line per position.
    pub details: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            sync_timeout_secs: 300,
            history_days: 0,
            details: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Name of the env var holding the MetaApi token.
    pub token_env: String,
    /// Name of the env var holding the account id.
    pub account_id_env: String,
    /// Account id given directly; takes precedence over `account_id_env`.
    pub account_id: Option<String>,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            token_env: "METAAPI_TOKEN".to_string(),
            account_id_env: "METAAPI_ACCOUNT_ID".to_string(),
            account_id: None,
        }
    }
}

/// Which `TradingApi` implementation to run against.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    MetaApi,
    Simulated,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MetaApiConfig {
    pub provider: Provider,
    pub provisioning_url: String,
    /// Client API base URL; `{region}` is replaced by the account's region.
    pub client_url_template: String,
    /// Region used when the account record carries none.
    pub default_region: String,
    /// Per-request HTTP timeout; `0` disables it.
    pub request_timeout_secs: u64,
    /// Interval between deployment / connection status polls.
    pub poll_interval_ms: u64,
    /// Deploy an undeployed account before connecting.
    pub auto_deploy: bool,
    /// Deadline for a deployment to finish; `0` waits without bound.
    pub deploy_timeout_secs: u64,
}

impl MetaApiConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.request_timeout_secs)
    }

    pub fn deploy_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.deploy_timeout_secs)
    }
}

/// Seconds as a deadline, where `0` means no deadline.
fn non_zero_secs(secs: u64) -> Option<Duration> {
    match secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    }
}

impl Default for MetaApiConfig {
    fn default() -> Self {
        Self {
            provider: Provider::MetaApi,
            provisioning_url: "https://mt-provisioning-api-v1.agiliumtrade.agiliumtrade.ai"
                .to_string(),
            client_url_template: "https://mt-client-api-v1.{region}.agiliumtrade.ai".to_string(),
            default_region: "new-york".to_string(),
            request_timeout_secs: 60,
            poll_interval_ms: 1000,
            auto_deploy: true,
            deploy_timeout_secs: 300,
        }
    }
}

/// Fixture for the simulated provider.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimulatedConfig {
    /// Account ids the simulated directory knows. Empty accepts any id.
    pub account_ids: Vec<String>,
    pub balance: f64,
    pub credit: f64,
    pub leverage: u32,
    pub currency: String,
    /// Margin held per open lot.
    pub margin_per_lot: f64,
    /// Delay before the simulated connection reports synchronized.
    pub sync_delay_ms: u64,
    pub positions: Vec<SimulatedPosition>,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            account_ids: Vec::new(),
            balance: 10_000.0,
            credit: 0.0,
            leverage: 100,
            currency: "USD".to_string(),
            margin_per_lot: 1_000.0,
            sync_delay_ms: 0,
            positions: vec![
                SimulatedPosition {
                    symbol: "EURUSD".to_string(),
                    side: PositionType::Buy,
                    volume: 0.5,
                    open_price: 1.0850,
                    current_price: 1.0872,
                },
                SimulatedPosition {
                    symbol: "GBPUSD".to_string(),
                    side: PositionType::Sell,
                    volume: 0.2,
                    open_price: 1.2710,
                    current_price: 1.2695,
                },
            ],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SimulatedPosition {
    pub symbol: String,
    pub side: PositionType,
    pub volume: f64,
    pub open_price: f64,
    pub current_price: f64,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            Self::load(path)
        } else {
            info!(path, "No config file found, using defaults");
            Ok(Self::default())
        }
    }

    /// Apply environment switches that are not secrets.
    pub fn apply_env(&mut self) {
        let use_mock = std::env::var(USE_MOCK_ENV)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if use_mock {
            self.metaapi.provider = Provider::Simulated;
        }
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Read the API token from the env var named in `credentials.token_env`.
    pub fn resolve_token(&self) -> Result<SecretString, ProbeError> {
        let env_name = &self.credentials.token_env;
        let token = Self::resolve_env(env_name)
            .map_err(|e| ProbeError::Authentication(format!("{e:#}")))?;
        if token.trim().is_empty() {
            return Err(ProbeError::Authentication(format!(
                "Environment variable {env_name} is empty"
            )));
        }
        Ok(SecretString::new(token))
    }

    /// The account id from config, falling back to `credentials.account_id_env`.
    pub fn resolve_account_id(&self) -> Result<String, ProbeError> {
        let id = match &self.credentials.account_id {
            Some(id) => id.clone(),
            None => Self::resolve_env(&self.credentials.account_id_env)
                .map_err(|e| ProbeError::Config(format!("{e:#}")))?,
        };
        if id.trim().is_empty() {
            return Err(ProbeError::Config("Account id is empty".to_string()));
        }
        Ok(id.trim().to_string())
    }

    /// Deadline for the synchronization wait, `None` when unbounded.
    pub fn sync_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.probe.sync_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Command line
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[clap(name = "account-probe")]
#[clap(about = "Connect to a MetaTrader account via MetaApi and print its balance and open positions", long_about = None)]
pub struct CliArgs {
    /// Path to a TOML config file. Defaults to ./config.toml when present.
    #[clap(long)]
    pub config: Option<String>,

    /// Trading account id. Overrides the config file and environment.
    #[clap(long)]
    pub account_id: Option<String>,

    /// Seconds to wait for synchronization; 0 waits without bound.
    #[clap(long)]
    pub sync_timeout_secs: Option<u64>,

    /// Also fetch deals over this many trailing days.
    #[clap(long)]
    pub history_days: Option<u32>,

    /// Print extended account figures and one line per position.
    #[clap(long)]
    pub details: bool,

    /// Run against the simulated account instead of MetaApi.
    #[clap(long)]
    pub simulated: bool,
}

impl CliArgs {
    /// Load the config file named on the command line (which must exist)
    /// or the default one (which may be absent), then apply env switches and
    /// the flags given here.
    pub fn load_config(&self) -> Result<AppConfig> {
        let mut cfg = match &self.config {
            Some(path) => AppConfig::load(path)?,
            None => AppConfig::load_or_default(DEFAULT_CONFIG_FILE)?,
        };
        cfg.apply_env();
        self.apply_to(&mut cfg);
        Ok(cfg)
    }

    pub fn apply_to(&self, cfg: &mut AppConfig) {
        if let Some(id) = &self.account_id {
            cfg.credentials.account_id = Some(id.clone());
        }
        if let Some(secs) = self.sync_timeout_secs {
            cfg.probe.sync_timeout_secs = secs;
        }
        if let Some(days) = self.history_days {
            cfg.probe.history_days = days;
        }
        if self.details {
            cfg.probe.details = true;
        }
        if self.simulated {
            cfg.metaapi.provider = Provider::Simulated;
        }
    }
}
