use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::AddressError;

/// Networks a relay can be reached on. Declaration order is the default
/// preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Transport {
    Clearnet,
    Hyper,
    Tor,
    I2p,
}

/// Transport preference used when a pubkey advertises several addresses.
pub const PREFERENCE_ORDER: [Transport; 4] = [
    Transport::Clearnet,
    Transport::Hyper,
    Transport::Tor,
    Transport::I2p,
];

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Clearnet => "clearnet",
            Transport::Hyper => "hyper",
            Transport::Tor => "tor",
            Transport::I2p => "i2p",
        }
    }

    /// Transport implied by a host name.
    pub fn of_host(host: &str) -> Self {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        if host.ends_with(".onion") {
            Transport::Tor
        } else if host.ends_with(".i2p") {
            Transport::I2p
        } else {
            Transport::Clearnet
        }
    }

    /// Transport implied by a WebSocket URL.
    pub fn of_url(address: &str) -> Result<Self, AddressError> {
        let url = url::Url::parse(address).map_err(|_| AddressError::InvalidUrl(address.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| AddressError::MissingHost(address.to_string()))?;
        Ok(Self::of_host(host))
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "clearnet" | "clear" => Ok(Transport::Clearnet),
            "hyper" => Ok(Transport::Hyper),
            "tor" => Ok(Transport::Tor),
            "i2p" => Ok(Transport::I2p),
            other => Err(AddressError::UnknownNetwork(other.to_string())),
        }
    }
}

/// Which transports this process can dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub clearnet: bool,
    pub tor: bool,
    pub i2p: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            clearnet: true,
            tor: false,
            i2p: false,
        }
    }
}

impl Capabilities {
    /// Hyper addresses are advertised as plain WebSocket URLs and are dialed
    /// directly, so they need clearnet.
    pub fn supports(&self, transport: Transport) -> bool {
        match transport {
            Transport::Clearnet | Transport::Hyper => self.clearnet,
            Transport::Tor => self.tor,
            Transport::I2p => self.i2p,
        }
    }

    /// Drop URLs that are unparsable or need a transport we lack.
    pub fn filter_addresses<S: AsRef<str>>(&self, urls: &[S]) -> Vec<String> {
        urls.iter()
            .map(AsRef::as_ref)
            .filter(|url| Transport::of_url(url).is_ok_and(|t| self.supports(t)))
            .map(str::to_string)
            .collect()
    }

    /// First usable candidate following `order`. Each address must also be
    /// reachable by what its host implies, so a mislabelled `.onion` without
    /// Tor is skipped.
    pub fn first_preferred_address<'a>(
        &self,
        candidates: &'a BTreeMap<Transport, String>,
        order: &[Transport],
    ) -> Option<&'a str> {
        order
            .iter()
            .filter(|t| self.supports(**t))
            .filter_map(|t| candidates.get(t))
            .find(|address| Transport::of_url(address).is_ok_and(|t| self.supports(t)))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_host_suffix() {
        assert_eq!(Transport::of_url("wss://relay.example.com").unwrap(), Transport::Clearnet);
        assert_eq!(Transport::of_url("ws://abcdef.onion/").unwrap(), Transport::Tor);
        assert_eq!(Transport::of_url("ws://relay.I2P").unwrap(), Transport::I2p);
        assert!(Transport::of_url("not a url").is_err());
    }

    #[test]
    fn parses_network_tags() {
        assert_eq!("tor".parse::<Transport>().unwrap(), Transport::Tor);
        assert_eq!("Hyper".parse::<Transport>().unwrap(), Transport::Hyper);
        assert!("carrier-pigeon".parse::<Transport>().is_err());
    }

    #[test]
    fn filter_drops_unconfigured_networks() {
        let caps = Capabilities {
            clearnet: true,
            tor: true,
            i2p: false,
        };
        let urls = [
            "wss://relay.example.com",
            "ws://abc.onion",
            "ws://abc.i2p",
            "::garbage::",
        ];
        assert_eq!(
            caps.filter_addresses(&urls),
            vec!["wss://relay.example.com".to_string(), "ws://abc.onion".to_string()]
        );
    }

    #[test]
    fn preference_order_is_respected() {
        let caps = Capabilities {
            clearnet: true,
            tor: true,
            i2p: true,
        };
        let mut candidates = BTreeMap::new();
        candidates.insert(Transport::I2p, "ws://relay.i2p".to_string());
        candidates.insert(Transport::Tor, "ws://relay.onion".to_string());
        assert_eq!(
            caps.first_preferred_address(&candidates, &PREFERENCE_ORDER),
            Some("ws://relay.onion")
        );

        candidates.insert(Transport::Clearnet, "wss://relay.example.com".to_string());
        assert_eq!(
            caps.first_preferred_address(&candidates, &PREFERENCE_ORDER),
            Some("wss://relay.example.com")
        );
        assert_eq!(
            caps.first_preferred_address(&candidates, &[Transport::I2p, Transport::Tor]),
            Some("ws://relay.i2p")
        );
    }

    #[test]
    fn nothing_usable_without_proxies() {
        let caps = Capabilities::default();
        let mut candidates = BTreeMap::new();
        candidates.insert(Transport::Tor, "ws://relay.onion".to_string());
        // Labelled clearnet but actually an onion host.
        candidates.insert(Transport::Clearnet, "ws://sneaky.onion".to_string());
        assert_eq!(caps.first_preferred_address(&candidates, &PREFERENCE_ORDER), None);
    }
}
