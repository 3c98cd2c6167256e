//! Configuration types for the object store.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Object store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObjStoreConfig {
    /// Address the store service listens on.
    pub listen_addr: SocketAddr,
    /// Address peers and the scheduler use to reach this store.
    ///
    /// Defaults to the listen address; set it when the store binds a
    /// wildcard address.
    pub advertise_addr: Option<String>,
    /// Address of the scheduler's wire service.
    pub scheduler_addr: String,
}

impl ObjStoreConfig {
    /// The address to register with the scheduler.
    #[must_use]
    pub fn advertised(&self) -> String {
        self.advertise_addr
            .clone()
            .unwrap_or_else(|| self.listen_addr.to_string())
    }
}

impl Default for ObjStoreConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 7411),
            advertise_addr: None,
            scheduler_addr: "127.0.0.1:7401".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ObjStoreConfig::default();
        assert_eq!(config.listen_addr.port(), 7411);
        assert_eq!(config.scheduler_addr, "127.0.0.1:7401");
        assert_eq!(config.advertised(), "0.0.0.0:7411");
    }

    #[test]
    fn advertise_overrides_listen() {
        let config = ObjStoreConfig {
            advertise_addr: Some("10.0.0.5:7411".to_owned()),
            ..Default::default()
        };
        assert_eq!(config.advertised(), "10.0.0.5:7411");
    }
}
