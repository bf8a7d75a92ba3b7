use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::BotError;

const ENV_PREFIX: &str = "OKXBOT";

/// API credentials, read from the environment only
#[derive(Clone, Default)]
pub struct Credentials {
    pub api_key: String,
    pub secret_key: String,
    pub passphrase: String,
}

impl Credentials {
    /// Load `OKX_API_KEY`, `OKX_SECRET_KEY` and `OKX_PASSPHRASE`
    pub fn from_env() -> Result<Self, BotError> {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| BotError::Config(format!("{} not set", name)))
        };

        Ok(Self {
            api_key: read("OKX_API_KEY")?,
            secret_key: read("OKX_SECRET_KEY")?,
            passphrase: read("OKX_PASSPHRASE")?,
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &mask(&self.api_key))
            .field("secret_key", &"***")
            .field("passphrase", &"***")
            .finish()
    }
}

fn mask(key: &str) -> String {
    if key.chars().count() <= 4 {
        "***".to_string()
    } else {
        format!("{}***", key.chars().take(4).collect::<String>())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub inst_id: String,
    pub rest_url: String,
    pub ws_business_url: String,
    pub ws_private_url: String,
    /// Send `x-simulated-trading: 1` (demo trading)
    pub simulated: bool,
    pub leverage: u32,
    pub bar: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub requests_per_second: u32,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            inst_id: "ETH-USDT-SWAP".to_string(),
            rest_url: "https://www.okx.com".to_string(),
            ws_business_url: "wss://ws.okx.com:8443/ws/v5/business".to_string(),
            ws_private_url: "wss://ws.okx.com:8443/ws/v5/private".to_string(),
            simulated: false,
            leverage: 5,
            bar: "30m".to_string(),
            request_timeout_secs: 15,
            max_retries: 3,
            retry_base_delay_ms: 5000,
            requests_per_second: 10,
        }
    }
}

impl ExchangeSettings {
    /// Length of one bar, parsed from strings like `30m`, `1H`, `4H`, `1D`
    pub fn bar_duration(&self) -> Option<Duration> {
        let bar = self.bar.trim();
        let split = bar.find(|c: char| !c.is_ascii_digit())?;
        let (num, unit) = bar.split_at(split);
        let n: u64 = num.parse().ok()?;
        let secs = match unit {
            "m" => 60,
            "H" | "h" => 3600,
            "D" | "d" => 86_400,
            _ => return None,
        };
        Some(Duration::from_secs(n * secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategySettings {
    pub bb_period: usize,
    pub bb_multiplier: f64,
    pub trend_ema_period: usize,
    pub trend_lookback: usize,
    /// Closed bars required before any entry is planned
    pub min_candles: usize,
    pub max_candles: usize,
    pub initial_candles: usize,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            bb_period: 20,
            bb_multiplier: 2.5,
            trend_ema_period: 96,
            trend_lookback: 8,
            min_candles: 120,
            max_candles: 500,
            initial_candles: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskSettings {
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub max_hold_bars: u32,
    /// Fraction of account equity committed per entry
    pub position_ratio: f64,
    /// Largest loss (USDT) a single stop-out may cost
    pub max_single_loss: f64,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            stop_loss_pct: 0.02,
            take_profit_pct: 0.03,
            max_hold_bars: 120,
            position_ratio: 0.30,
            max_single_loss: 10.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeeSettings {
    pub taker: f64,
    pub maker: f64,
}

impl Default for FeeSettings {
    fn default() -> Self {
        Self {
            taker: 0.0005,
            maker: 0.0002,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    pub sl_verify_delay_ms: u64,
    pub close_check_delay_ms: u64,
    pub emergency_attempts: u32,
    pub emergency_backoff_ms: u64,
    pub trigger_fill_timeout_secs: u64,
    pub reconcile_interval_secs: u64,
    pub trigger_watch_interval_secs: u64,
    pub workers: usize,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            sl_verify_delay_ms: 1000,
            close_check_delay_ms: 2000,
            emergency_attempts: 3,
            emergency_backoff_ms: 2000,
            trigger_fill_timeout_secs: 60,
            reconcile_interval_secs: 300,
            trigger_watch_interval_secs: 10,
            workers: 4,
        }
    }
}

impl ExecutionSettings {
    pub fn sl_verify_delay(&self) -> Duration {
        Duration::from_millis(self.sl_verify_delay_ms)
    }

    pub fn close_check_delay(&self) -> Duration {
        Duration::from_millis(self.close_check_delay_ms)
    }

    pub fn emergency_backoff(&self) -> Duration {
        Duration::from_millis(self.emergency_backoff_ms)
    }

    pub fn trigger_fill_timeout(&self) -> Duration {
        Duration::from_secs(self.trigger_fill_timeout_secs)
    }

    /// Zero delays everywhere, for tests against an in-memory exchange
    pub fn immediate() -> Self {
        Self {
            sl_verify_delay_ms: 0,
            close_check_delay_ms: 0,
            emergency_backoff_ms: 0,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WsSettings {
    pub ping_interval_secs: u64,
    pub recv_timeout_secs: u64,
    pub reconnect_max_delay_secs: u64,
}

impl Default for WsSettings {
    fn default() -> Self {
        Self {
            ping_interval_secs: 25,
            recv_timeout_secs: 60,
            reconnect_max_delay_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifySettings {
    pub discord_webhook_url: Option<String>,
    pub dedup_window_secs: u64,
    /// Prepended to every alert
    pub prefix: String,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            discord_webhook_url: None,
            dedup_window_secs: 60,
            prefix: "[OKX] ".to_string(),
        }
    }
}

/// Immutable bot configuration, built once at startup
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub exchange: ExchangeSettings,
    pub strategy: StrategySettings,
    pub risk: RiskSettings,
    pub fees: FeeSettings,
    pub execution: ExecutionSettings,
    pub ws: WsSettings,
    pub notify: NotifySettings,
    pub state_dir: PathBuf,
    #[serde(skip)]
    pub credentials: Credentials,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            exchange: ExchangeSettings::default(),
            strategy: StrategySettings::default(),
            risk: RiskSettings::default(),
            fees: FeeSettings::default(),
            execution: ExecutionSettings::default(),
            ws: WsSettings::default(),
            notify: NotifySettings::default(),
            state_dir: PathBuf::from("state"),
            credentials: Credentials::default(),
        }
    }
}

impl BotConfig {
    /// Load settings from an optional TOML file plus `OKXBOT__*` overrides
    ///
    /// Credentials are not part of this; see [`Credentials::from_env`].
    pub fn load(path: &Path) -> Result<Self, BotError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: BotConfig = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load settings and credentials
    pub fn load_with_credentials(path: &Path) -> Result<Self, BotError> {
        let mut cfg = Self::load(path)?;
        cfg.credentials = Credentials::from_env()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), BotError> {
        if self.exchange.bar_duration().is_none() {
            return Err(BotError::Config(format!(
                "unsupported bar interval '{}'",
                self.exchange.bar
            )));
        }
        if !(0.0..1.0).contains(&self.risk.stop_loss_pct) || self.risk.stop_loss_pct == 0.0 {
            return Err(BotError::Config("risk.stop_loss_pct must be in (0, 1)".into()));
        }
        if !(0.0..1.0).contains(&self.risk.take_profit_pct) || self.risk.take_profit_pct == 0.0 {
            return Err(BotError::Config("risk.take_profit_pct must be in (0, 1)".into()));
        }
        if self.execution.emergency_attempts == 0 {
            return Err(BotError::Config("execution.emergency_attempts must be >= 1".into()));
        }
        if self.strategy.max_candles < self.strategy.min_candles {
            return Err(BotError::Config("strategy.max_candles < strategy.min_candles".into()));
        }
        Ok(())
    }

    /// Longest a position may stay open before a forced close
    pub fn max_hold(&self) -> Duration {
        let bar = self
            .exchange
            .bar_duration()
            .unwrap_or(Duration::from_secs(1800));
        bar * self.risk.max_hold_bars
    }

    pub fn state_path(&self, file: &str) -> PathBuf {
        self.state_dir.join(file)
    }
}
