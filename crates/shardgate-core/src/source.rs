//! Descriptor sources: where the pool manager learns about data sources.

use crate::config::{ConfigError, ProxyConfig};
use crate::types::DataSourceDescriptor;

/// Supplies data-source descriptors at startup.
///
/// Implemented by the metadata layer in a full proxy. The pool manager calls
/// `descriptors()` at `start()`, and again when asked for a pool whose name
/// it has not seen.
pub trait DescriptorSource: Send + Sync {
    /// All known descriptors. An unreachable source returns
    /// [`ConfigError::Unreachable`].
    fn descriptors(&self) -> Result<Vec<DataSourceDescriptor>, ConfigError>;
}

impl DescriptorSource for ProxyConfig {
    fn descriptors(&self) -> Result<Vec<DataSourceDescriptor>, ConfigError> {
        Ok(ProxyConfig::descriptors(self))
    }
}

/// A fixed, in-memory list of descriptors.
#[derive(Debug, Clone, Default)]
pub struct StaticDescriptorSource {
    descriptors: Vec<DataSourceDescriptor>,
}

impl StaticDescriptorSource {
    pub fn new(descriptors: Vec<DataSourceDescriptor>) -> Self {
        Self { descriptors }
    }
}

impl DescriptorSource for StaticDescriptorSource {
    fn descriptors(&self) -> Result<Vec<DataSourceDescriptor>, ConfigError> {
        Ok(self.descriptors.clone())
    }
}
