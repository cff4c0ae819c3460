use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;

/// Upper bound accepted for the alert threshold (USD)
pub const MAX_THRESHOLD_USD: f64 = 100_000.0;
/// Accepted check interval range (seconds)
pub const MIN_INTERVAL_SECS: u64 = 10;
pub const MAX_INTERVAL_SECS: u64 = 86_400;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Usage cost watchdog")]
pub struct Config {
    /// Enable debug mode
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Alert threshold in USD for the current month
    #[arg(short = 't', long, global = true)]
    pub threshold: Option<f64>,

    /// Check interval in seconds
    #[arg(short = 'i', long, global = true)]
    pub interval: Option<u64>,

    /// Webhook URL receiving `{"text": ...}` alerts
    #[arg(long, global = true)]
    pub webhook_url: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run the monitor continuously (default)
    Run,
    /// Run a single check and exit
    Check,
    /// Show the persisted alert state and the running instance, if any
    Status,
}

impl Config {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Selected subcommand, defaulting to `run`
    pub fn command(&self) -> Command {
        self.command.unwrap_or(Command::Run)
    }
}

/// Application settings (from config file)
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Alert when the current month's cost is above this (USD)
    #[serde(default = "default_threshold")]
    pub threshold_usd: f64,

    /// Seconds between checks
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Webhook for alerts; without it breaches are only logged
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Program and arguments printing the monthly usage JSON
    #[serde(default = "default_usage_command")]
    pub usage_command: Vec<String>,

    /// How long a fetch waits for another in-flight fetch
    #[serde(default = "default_guard_timeout")]
    pub guard_timeout_secs: u64,

    /// Kill the usage command after this many seconds
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Maximum usage command output
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Webhook request timeout
    #[serde(default = "default_sink_timeout")]
    pub sink_timeout_secs: u64,

    /// Directory for the state record and the instance lock
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// Instance lock name
    #[serde(default = "default_lock_name")]
    pub lock_name: String,
}

fn default_threshold() -> f64 {
    33.0
}

fn default_interval() -> u64 {
    3600
}

fn default_usage_command() -> Vec<String> {
    ["npx", "ccusage@latest", "monthly", "--json"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_guard_timeout() -> u64 {
    30
}

fn default_fetch_timeout() -> u64 {
    120
}

fn default_max_output_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_sink_timeout() -> u64 {
    10
}

fn default_lock_name() -> String {
    "monitor".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            threshold_usd: default_threshold(),
            interval_secs: default_interval(),
            webhook_url: None,
            usage_command: default_usage_command(),
            guard_timeout_secs: default_guard_timeout(),
            fetch_timeout_secs: default_fetch_timeout(),
            max_output_bytes: default_max_output_bytes(),
            sink_timeout_secs: default_sink_timeout(),
            state_dir: None,
            lock_name: default_lock_name(),
        }
    }
}

impl Settings {
    /// Load settings from config file or use defaults
    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        // Try custom path first
        if let Some(p) = path {
            if p.exists() {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config file: {:?}", p))?;
                return toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file: {:?}", p));
            }
        }

        // Try default config locations
        let default_paths = [
            dirs::config_dir().map(|p| p.join("costwatch/config.toml")),
            dirs::home_dir().map(|p| p.join(".config/costwatch/config.toml")),
            dirs::home_dir().map(|p| p.join(".costwatch.toml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {:?}", path))?;
                return toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file: {:?}", path));
            }
        }

        // Return defaults if no config file found
        Ok(Self::default())
    }

    /// Merge CLI config into settings (CLI takes precedence)
    pub fn merge_cli(&mut self, cli: &Config) {
        if let Some(threshold) = cli.threshold {
            self.threshold_usd = threshold;
        }
        if let Some(interval) = cli.interval {
            self.interval_secs = interval;
        }
        if let Some(ref url) = cli.webhook_url {
            self.webhook_url = Some(url.clone());
        }
    }

    /// Reject values the monitor cannot run with
    pub fn validate(&self) -> Result<()> {
        if !self.threshold_usd.is_finite()
            || self.threshold_usd <= 0.0
            || self.threshold_usd > MAX_THRESHOLD_USD
        {
            bail!(
                "threshold must be greater than 0 and at most {}, got {}",
                MAX_THRESHOLD_USD,
                self.threshold_usd
            );
        }
        if !(MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&self.interval_secs) {
            bail!(
                "interval must be between {} and {} seconds, got {}",
                MIN_INTERVAL_SECS,
                MAX_INTERVAL_SECS,
                self.interval_secs
            );
        }
        if self.usage_command.first().is_none_or(|p| p.trim().is_empty()) {
            bail!("usage_command must name a program");
        }
        if self.guard_timeout_secs == 0 || self.fetch_timeout_secs == 0 || self.sink_timeout_secs == 0
        {
            bail!("timeouts must be at least one second");
        }
        if self.max_output_bytes == 0 {
            bail!("max_output_bytes must be positive");
        }
        if let Some(ref url) = self.webhook_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                bail!("webhook_url must be an http(s) URL, got '{}'", url);
            }
        }
        Ok(())
    }

    /// Directory holding the state record and lock files
    pub fn state_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.state_dir {
            return Ok(dir.clone());
        }
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .map(|p| p.join("costwatch"))
            .context("Could not determine a state directory; set state_dir in the config file")
    }

    /// Path of the persisted alert state
    pub fn state_file(&self) -> Result<PathBuf> {
        Ok(self.state_dir()?.join("state.json"))
    }
}
