//! Configuration types for the scheduler.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Scheduler configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Wire protocol listener configuration.
    pub listen: ListenConfig,
    /// HTTP introspection API configuration.
    pub api: ApiConfig,
    /// Delivery retry configuration.
    pub delivery: DeliveryConfig,
}

/// Wire protocol listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Address the scheduler service listens on.
    pub addr: SocketAddr,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 7401),
        }
    }
}

/// HTTP introspection API configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address the HTTP API listens on.
    pub listen_addr: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 7402),
        }
    }
}

/// Delivery retry configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Attempts per object delivery before the dependent task fails,
    /// rotating to a different source store when one exists.
    pub max_attempts: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}
