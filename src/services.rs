//! Fixed set of remote services the runtime knows how to talk to (spec §3
//! "Service Descriptor"). Backs the connection-pool registry, the version
//! checker, and every service client's base URL resolution.

use std::time::Duration;

use crate::pool::PoolConfig;
use crate::version::ApiVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceName {
    Identity,
    Transfer,
    Groups,
    Search,
    Flows,
    Timers,
    Compute,
    Default,
}

impl ServiceName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceName::Identity => "identity",
            ServiceName::Transfer => "transfer",
            ServiceName::Groups => "groups",
            ServiceName::Search => "search",
            ServiceName::Flows => "flows",
            ServiceName::Timers => "timers",
            ServiceName::Compute => "compute",
            ServiceName::Default => "default",
        }
    }
}

impl std::fmt::Display for ServiceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: ServiceName,
    pub base_url: String,
    pub supported_api_version: ApiVersion,
    pub default_pool_config: PoolConfig,
}

/// The fixed set of services known at startup (spec §3), with sensible
/// per-service pool defaults (transfer moves far more bytes than identity
/// ever will, so it gets a larger idle-connection budget).
pub fn default_descriptors() -> Vec<ServiceDescriptor> {
    let transfer_pool = PoolConfig {
        max_idle_per_host: 32,
        max_idle_total: 64,
        idle_timeout: Duration::from_secs(90),
        connect_timeout: Duration::from_secs(10),
        response_timeout: Duration::from_secs(120),
    };
    let identity_pool = PoolConfig {
        max_idle_per_host: 4,
        max_idle_total: 8,
        idle_timeout: Duration::from_secs(30),
        connect_timeout: Duration::from_secs(10),
        response_timeout: Duration::from_secs(30),
    };

    vec![
        ServiceDescriptor {
            name: ServiceName::Identity,
            base_url: "https://auth.globus.org".to_string(),
            supported_api_version: ApiVersion::unversioned("identity"),
            default_pool_config: identity_pool.clone(),
        },
        ServiceDescriptor {
            name: ServiceName::Transfer,
            base_url: "https://transfer.api.globus.org".to_string(),
            supported_api_version: ApiVersion {
                service: "transfer".to_string(),
                major: 0,
                minor: 10,
                patch: None,
                beta: false,
            },
            default_pool_config: transfer_pool.clone(),
        },
        ServiceDescriptor {
            name: ServiceName::Groups,
            base_url: "https://groups.api.globus.org".to_string(),
            supported_api_version: ApiVersion::unversioned("groups"),
            default_pool_config: PoolConfig::default(),
        },
        ServiceDescriptor {
            name: ServiceName::Search,
            base_url: "https://search.api.globus.org".to_string(),
            supported_api_version: ApiVersion::unversioned("search"),
            default_pool_config: PoolConfig::default(),
        },
        ServiceDescriptor {
            name: ServiceName::Flows,
            base_url: "https://flows.automate.globus.org".to_string(),
            supported_api_version: ApiVersion::unversioned("flows"),
            default_pool_config: PoolConfig::default(),
        },
        ServiceDescriptor {
            name: ServiceName::Timers,
            base_url: "https://timer.automate.globus.org".to_string(),
            supported_api_version: ApiVersion::unversioned("timers"),
            default_pool_config: PoolConfig::default(),
        },
        ServiceDescriptor {
            name: ServiceName::Compute,
            base_url: "https://compute.api.globus.org".to_string(),
            supported_api_version: ApiVersion::unversioned("compute"),
            default_pool_config: PoolConfig::default(),
        },
        ServiceDescriptor {
            name: ServiceName::Default,
            base_url: String::new(),
            supported_api_version: ApiVersion::unversioned("default"),
            default_pool_config: PoolConfig::default(),
        },
    ]
}
