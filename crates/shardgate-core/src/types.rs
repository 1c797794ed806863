//! Shared types used across shardgate crates.

use serde::{Deserialize, Serialize};

/// One logical downstream database endpoint.
///
/// Supplied once at startup by a [`crate::DescriptorSource`] and never
/// mutated afterwards. `name` is the unique key pools are registered under.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceDescriptor {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub schema: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl DataSourceDescriptor {
    pub fn new(
        name: &str,
        host: &str,
        port: u16,
        schema: &str,
        username: &str,
        password: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
            schema: schema.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    /// `host:port`, suitable for address resolution.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// Password stays out of logs.
impl std::fmt::Debug for DataSourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSourceDescriptor")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("schema", &self.schema)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}
