//! TLS client construction shared by the config manager HTTP clients.
//!
//! Every outbound client (management API, metadata server, OAuth token
//! endpoint) is created through [`create_reqwest_client_builder`] so the FIPS
//! feature flag and the optional extra root bundle apply uniformly.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod reqwest_adapter;

pub use reqwest_adapter::{create_reqwest_client_builder, TlsSetupError};
