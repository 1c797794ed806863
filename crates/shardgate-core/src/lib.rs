//! shardgate-core: shared types for the shardgate backend connection layer.
//!
//! - **types**: `DataSourceDescriptor`, the immutable record of one downstream node
//! - **config**: `shardgate.toml` parsing into `ProxyConfig` and `BackendSettings`
//! - **source**: the `DescriptorSource` seam the pool manager pulls descriptors from

pub mod config;
pub mod source;
pub mod types;

pub use config::{BackendSettings, ConfigError, ProxyConfig, TransportPreference};
pub use source::{DescriptorSource, StaticDescriptorSource};
pub use types::DataSourceDescriptor;
