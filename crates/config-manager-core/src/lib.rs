//! Control plane of the API proxy sidecar.
//!
//! The crate discovers which service configuration a proxy should run,
//! follows managed rollouts by polling the service management API, turns
//! each config document into a versioned resource [`Snapshot`] and publishes
//! it to a [`SnapshotStore`] that proxies read from. Credentials come from
//! the metadata server or a service-account key and are cached in a
//! [`TokenCache`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod admin;
pub mod builder;
pub mod config;
pub mod credentials;
pub mod http;
pub mod management;
pub mod manager;
pub mod metadata;
pub mod resolver;
pub mod server;
pub mod snapshot;

pub use builder::{BuildError, DocumentResourceBuilder, ResourceBuilder};
pub use config::{ConfigError, ManagerConfig, RolloutStrategy};
pub use credentials::{AccessTokenProvider, Token, TokenCache, TokenError, TokenFetcher};
pub use management::{ManagementClient, ManagementError, ServiceConfigDocument};
pub use manager::{
    ConfigManager, ConfigManagerHandle, ConfigManagerTelemetry, ManagerComponents, ManagerError,
    ManagerStatus, PollOutcome,
};
pub use metadata::{GcpAttributes, MetadataClient, MetadataError, Platform};
pub use resolver::{resolve, Resolution, ResolveError, RolloutCandidate, RolloutState};
pub use snapshot::{FetchRequest, Resource, ResourceSet, Snapshot, SnapshotCache, SnapshotStore};

#[cfg(test)]
mod tests {
    use super::*;

    /// The resolver is usable straight from the crate root.
    #[test]
    fn resolver_is_reexported() {
        let resolution = resolve(
            &RolloutState::default(),
            &[RolloutCandidate {
                rollout_id: "r1".into(),
                traffic_percentages: [("c1".to_string(), 100.0)].into_iter().collect(),
            }],
        )
        .expect("resolution");
        assert_eq!(resolution.state, RolloutState::new("r1", "c1"));
        assert!(resolution.changed);
    }

    #[test]
    fn strategy_parses_via_reexport() {
        assert_eq!("managed".parse::<RolloutStrategy>(), Ok(RolloutStrategy::Managed));
    }
}
