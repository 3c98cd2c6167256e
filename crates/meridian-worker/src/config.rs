//! Configuration types for the worker.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Worker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Address the worker serves `ExecuteTask` on.
    pub listen_addr: SocketAddr,
    /// Address the scheduler uses to reach this worker.
    ///
    /// Defaults to the listen address; set it when the worker binds a
    /// wildcard address.
    pub advertise_addr: Option<String>,
    /// Address of the scheduler's wire service.
    pub scheduler_addr: String,
    /// Address of the co-located object store.
    pub objstore_addr: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 7421),
            advertise_addr: None,
            scheduler_addr: "127.0.0.1:7401".to_owned(),
            objstore_addr: "127.0.0.1:7411".to_owned(),
        }
    }
}
