use clap::Parser;
use std::path::PathBuf;

use crate::config::Config;

/// Every setting can come from the config file, an environment variable or
/// a flag. Flags and environment variables win over the file.
#[derive(Parser, Debug, Default)]
#[command(name = "toll-proxy", version, about = "Pay-per-use WebSocket proxy for Nostr relays")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "TOLL_PROXY_CONFIG", default_value = "config.yaml")]
    pub config: PathBuf,

    /// Price per unit of metering, in mint units
    #[arg(long, env = "PRICE")]
    pub price: Option<u64>,

    /// What the price buys: `kib` or `min`
    #[arg(long, env = "PRICE_UNIT")]
    pub price_unit: Option<String>,

    /// Cashu mint that payments must come from
    #[arg(long, env = "MINT_URL")]
    pub mint_url: Option<String>,

    #[arg(long, env = "MINT_UNIT")]
    pub mint_unit: Option<String>,

    /// Operator secret key, hex or nsec
    #[arg(long, env = "PRIVATE_KEY", hide_env_values = true)]
    pub private_key: Option<String>,

    /// Comma-separated Nostr relays for discovery and payouts
    #[arg(long, env = "NOSTR_RELAYS", value_delimiter = ',')]
    pub relays: Vec<String>,

    /// Recipient of payouts, hex or npub
    #[arg(long, env = "PROFITS_PUBKEY")]
    pub profits_pubkey: Option<String>,

    #[arg(long, env = "PROFIT_PAYOUT_THRESHOLD")]
    pub payout_threshold: Option<u64>,

    #[arg(long, env = "PROFIT_PAYOUT_INTERVAL_SECONDS")]
    pub payout_interval_secs: Option<u64>,

    /// Lock payout proofs to the recipient's key
    #[arg(long, env = "LOCK_PAYOUT")]
    pub lock_payout: bool,

    /// Forward every client to this relay, without payment
    #[arg(long, env = "UPSTREAM")]
    pub upstream: Option<String>,

    /// Tor SOCKS5 proxy, host:port
    #[arg(long, env = "TOR_PROXY")]
    pub tor_proxy: Option<String>,

    /// I2P SOCKS5 proxy, host:port
    #[arg(long, env = "I2P_PROXY")]
    pub i2p_proxy: Option<String>,

    /// Public clearnet URL to advertise
    #[arg(long, env = "CLEARNET_URL")]
    pub clearnet_url: Option<String>,

    #[arg(long, env = "TOR_URL")]
    pub tor_url: Option<String>,

    #[arg(long, env = "I2P_URL")]
    pub i2p_url: Option<String>,

    /// Listen address (overrides config file setting)
    #[arg(long, env = "LISTEN")]
    pub listen: Option<String>,

    #[arg(long, env = "LEDGER_PATH")]
    pub ledger_path: Option<PathBuf>,

    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,
}

fn set<T: Clone>(slot: &mut T, value: &Option<T>) {
    if let Some(value) = value {
        *slot = value.clone();
    }
}

fn set_some<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
    if value.is_some() {
        *slot = value.clone();
    }
}

impl Cli {
    /// Merge overrides into a loaded configuration.
    pub fn apply(&self, cfg: &mut Config) {
        set_some(&mut cfg.pricing.price, &self.price);
        set(&mut cfg.pricing.per, &self.price_unit);
        set_some(&mut cfg.mint.url, &self.mint_url);
        set(&mut cfg.mint.unit, &self.mint_unit);

        set_some(&mut cfg.operator.private_key, &self.private_key);
        set_some(&mut cfg.operator.profits_pubkey, &self.profits_pubkey);
        set(&mut cfg.operator.payout_threshold, &self.payout_threshold);
        set(&mut cfg.operator.payout_interval_secs, &self.payout_interval_secs);
        if self.lock_payout {
            cfg.operator.lock_payout = true;
        }

        let relays: Vec<String> = self
            .relays
            .iter()
            .map(|r| r.trim())
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .collect();
        if !relays.is_empty() {
            cfg.nostr.relays = relays;
        }

        set(&mut cfg.network.listen_addr, &self.listen);
        set_some(&mut cfg.network.upstream, &self.upstream);
        set_some(&mut cfg.network.tor_proxy, &self.tor_proxy);
        set_some(&mut cfg.network.i2p_proxy, &self.i2p_proxy);

        set_some(&mut cfg.advertise.clearnet_url, &self.clearnet_url);
        set_some(&mut cfg.advertise.tor_url, &self.tor_url);
        set_some(&mut cfg.advertise.i2p_url, &self.i2p_url);

        set(&mut cfg.logging.ledger_path, &self.ledger_path);
        set(&mut cfg.logging.level, &self.log_level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_file_values() {
        let cli = Cli::try_parse_from([
            "toll-proxy",
            "--price",
            "3",
            "--price-unit",
            "min",
            "--relays",
            "wss://a.example, wss://b.example",
            "--listen",
            "0.0.0.0:9000",
            "--lock-payout",
        ])
        .unwrap();

        let mut cfg = Config::default();
        cfg.mint.url = Some("https://mint.example".into());
        cli.apply(&mut cfg);

        assert_eq!(cfg.pricing.price, Some(3));
        assert_eq!(cfg.pricing.per, "min");
        assert_eq!(cfg.nostr.relays, vec!["wss://a.example", "wss://b.example"]);
        assert_eq!(cfg.network.listen_addr, "0.0.0.0:9000");
        assert!(cfg.operator.lock_payout);
        // Untouched by flags.
        assert_eq!(cfg.mint.url.as_deref(), Some("https://mint.example"));
        assert_eq!(cfg.mint.unit, "sat");
    }

    #[test]
    fn empty_relay_list_keeps_file_relays() {
        let cli = Cli::default();
        let mut cfg = Config::default();
        cfg.nostr.relays = vec!["wss://file.example".into()];
        cli.apply(&mut cfg);
        assert_eq!(cfg.nostr.relays, vec!["wss://file.example"]);
    }
}
