use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use std::str::FromStr;

use anyhow::Context;
use cash_register::{CurrencyUnit, Metering, MintUrl, PayoutPolicy, PriceList};
use nostr_link::Keys;
use outbound::{ProxyEndpoints, Transport};
use serde::Deserialize;
use tracing::warn;
use ws_proxy::DEFAULT_MAX_BUFFERED_FRAMES;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub mint: MintConfig,
    #[serde(default)]
    pub operator: OperatorConfig,
    #[serde(default)]
    pub nostr: NostrConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub advertise: AdvertiseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct PricingConfig {
    #[serde(default)]
    pub price: Option<u64>,
    #[serde(default = "default_per")]
    pub per: String,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            price: None,
            per: default_per(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MintConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_unit")]
    pub unit: String,
}

impl Default for MintConfig {
    fn default() -> Self {
        Self {
            url: None,
            unit: default_unit(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct OperatorConfig {
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub profits_pubkey: Option<String>,
    #[serde(default)]
    pub payout_threshold: u64,
    #[serde(default = "default_payout_interval")]
    pub payout_interval_secs: u64,
    #[serde(default)]
    pub lock_payout: bool,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            private_key: None,
            profits_pubkey: None,
            payout_threshold: 0,
            payout_interval_secs: default_payout_interval(),
            lock_payout: false,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct NostrConfig {
    #[serde(default)]
    pub relays: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_listen")]
    pub listen_addr: String,
    /// Static upstream; clients are forwarded here without payment.
    #[serde(default)]
    pub upstream: Option<String>,
    #[serde(default)]
    pub tor_proxy: Option<String>,
    #[serde(default)]
    pub i2p_proxy: Option<String>,
    #[serde(default = "default_max_buffered")]
    pub max_buffered_frames: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen(),
            upstream: None,
            tor_proxy: None,
            i2p_proxy: None,
            max_buffered_frames: default_max_buffered(),
        }
    }
}

/// Inbound addresses published in discovery events.
#[derive(Debug, Default, Deserialize)]
pub struct AdvertiseConfig {
    #[serde(default)]
    pub clearnet_url: Option<String>,
    #[serde(default)]
    pub tor_url: Option<String>,
    #[serde(default)]
    pub i2p_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            ledger_path: default_ledger_path(),
        }
    }
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_per() -> String {
    "kib".to_string()
}

fn default_unit() -> String {
    "sat".to_string()
}

fn default_payout_interval() -> u64 {
    3600
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_buffered() -> usize {
    DEFAULT_MAX_BUFFERED_FRAMES
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("ledger.jsonl")
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load configuration from a YAML file.
///
/// If the file does not exist a default configuration is returned and a
/// warning is emitted, so the proxy can be configured from the environment
/// alone.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        warn!(
            path = %path.display(),
            "configuration file not found; using defaults"
        );
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

    let config: Config = serde_yml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;

    Ok(config)
}

/// Environment variables older deployments set that this proxy does not
/// honour, with the replacement to point operators at.
const UNSUPPORTED_VARIABLES: &[(&str, &str)] = &[(
    "PAC_PROXY",
    "custom PAC files are not supported; use TOR_PROXY and I2P_PROXY",
)];

/// Warn about every unsupported variable `is_set` reports. Returns the names
/// that were reported.
pub fn warn_unsupported(is_set: impl Fn(&str) -> bool) -> Vec<&'static str> {
    UNSUPPORTED_VARIABLES
        .iter()
        .filter(|(name, _)| is_set(name))
        .map(|(name, hint)| {
            warn!(variable = *name, "{hint}; ignoring");
            *name
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A configuration that passed [`Config::validate`].
#[derive(Debug)]
pub struct Settings {
    pub prices: PriceList,
    pub mint_url: MintUrl,
    pub unit: CurrencyUnit,
    pub keys: Keys,
    pub relays: Vec<String>,
    pub payout: PayoutPolicy,
    pub payout_interval: Duration,
    pub listen_addr: SocketAddr,
    pub static_upstream: Option<String>,
    pub proxies: ProxyEndpoints,
    pub advertised: Vec<(Transport, String)>,
    pub max_buffered_frames: usize,
    pub ledger_path: PathBuf,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl Config {
    /// Check every required value at once. The error lists all missing and
    /// invalid fields, not just the first.
    pub fn validate(self) -> anyhow::Result<Settings> {
        let mut missing = Vec::new();
        let mut invalid = Vec::new();

        let price = match self.pricing.price {
            None => {
                missing.push("PRICE");
                0
            }
            Some(0) => {
                invalid.push("PRICE must be greater than zero".to_string());
                0
            }
            Some(price) => price,
        };
        let metering = self.pricing.per.parse::<Metering>().unwrap_or_else(|e| {
            invalid.push(format!("PRICE_UNIT: {e}"));
            Metering::default()
        });

        let mint_url = match non_empty(&self.mint.url) {
            None => {
                missing.push("MINT_URL");
                None
            }
            Some(url) => match MintUrl::from_str(url) {
                Ok(url) => Some(url),
                Err(e) => {
                    invalid.push(format!("MINT_URL: {e}"));
                    None
                }
            },
        };
        let unit = CurrencyUnit::from_str(self.mint.unit.trim()).unwrap_or_else(|e| {
            invalid.push(format!("MINT_UNIT: {e}"));
            CurrencyUnit::Sat
        });

        let keys = match non_empty(&self.operator.private_key) {
            None => {
                missing.push("PRIVATE_KEY");
                None
            }
            Some(secret) => match Keys::parse(secret) {
                Ok(keys) => Some(keys),
                Err(e) => {
                    invalid.push(format!("PRIVATE_KEY: {e}"));
                    None
                }
            },
        };

        let relays: Vec<String> = self
            .nostr
            .relays
            .iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        if relays.is_empty() {
            missing.push("NOSTR_RELAYS");
        }

        let profits_pubkey = match non_empty(&self.operator.profits_pubkey) {
            None => None,
            Some(value) => match nostr_link::parse_public_key(value) {
                Ok(pubkey) => Some(pubkey),
                Err(e) => {
                    invalid.push(format!("PROFITS_PUBKEY: {e}"));
                    None
                }
            },
        };
        if profits_pubkey.is_some() && self.operator.payout_interval_secs == 0 {
            invalid.push("PROFIT_PAYOUT_INTERVAL_SECONDS must be greater than zero".to_string());
        }

        let listen_addr = self.network.listen_addr.parse::<SocketAddr>().ok();
        if listen_addr.is_none() {
            invalid.push(format!("LISTEN: invalid address {:?}", self.network.listen_addr));
        }

        let mut advertised = Vec::new();
        for (name, url) in [
            ("CLEARNET_URL", &self.advertise.clearnet_url),
            ("TOR_URL", &self.advertise.tor_url),
            ("I2P_URL", &self.advertise.i2p_url),
        ] {
            if let Some(url) = non_empty(url) {
                match Transport::of_url(url) {
                    Ok(transport) => advertised.push((transport, url.to_string())),
                    Err(e) => invalid.push(format!("{name}: {e}")),
                }
            }
        }

        if !missing.is_empty() || !invalid.is_empty() {
            let mut problems = Vec::new();
            if !missing.is_empty() {
                problems.push(format!("missing required configuration: {}", missing.join(", ")));
            }
            problems.extend(invalid);
            anyhow::bail!(problems.join("; "));
        }

        // Every `None` above was recorded as a problem.
        let mint_url = mint_url.context("MINT_URL")?;
        let keys = keys.context("PRIVATE_KEY")?;
        let listen_addr = listen_addr.context("LISTEN")?;

        Ok(Settings {
            prices: PriceList { price, metering },
            mint_url,
            unit,
            keys,
            relays,
            payout: PayoutPolicy {
                pubkey: profits_pubkey,
                threshold: self.operator.payout_threshold,
                lock_to_owner: self.operator.lock_payout,
            },
            payout_interval: Duration::from_secs(self.operator.payout_interval_secs),
            listen_addr,
            static_upstream: non_empty(&self.network.upstream).map(str::to_string),
            proxies: ProxyEndpoints {
                tor: non_empty(&self.network.tor_proxy).map(str::to_string),
                i2p: non_empty(&self.network.i2p_proxy).map(str::to_string),
            },
            advertised,
            max_buffered_frames: self.network.max_buffered_frames,
            ledger_path: self.logging.ledger_path,
        })
    }
}
