use anyhow::{Context, Result};
use sqlx::types::ipnetwork::IpNetwork;
use std::net::IpAddr;

/// A set of networks, used for the limiter allow-list and for trusted proxies.
#[derive(Clone, Debug, Default)]
pub struct AllowList {
    networks: Vec<IpNetwork>,
}

impl AllowList {
    #[must_use]
    pub fn new(networks: Vec<IpNetwork>) -> Self {
        Self { networks }
    }

    /// Parse a comma separated list of CIDRs or bare addresses.
    ///
    /// # Errors
    /// Returns an error naming the first entry that is not a network.
    pub fn parse(list: &str) -> Result<Self> {
        let networks = list
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                entry
                    .parse::<IpNetwork>()
                    .with_context(|| format!("invalid network '{entry}'"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { networks })
    }

    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.networks.iter().any(|network| network.contains(ip))
    }

    /// Like [`AllowList::contains`] for an address still in text form.
    #[must_use]
    pub fn contains_str(&self, ip: &str) -> bool {
        ip.parse::<IpAddr>().is_ok_and(|ip| self.contains(ip))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}
