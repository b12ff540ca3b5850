//! Replica identity: a stable, process-lifetime identifier used to
//! suppress echoes from the pub/sub bus and to stamp outbound frames so
//! clients can see which replica served them.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Read `SERVER_ID` from the environment, defaulting to `"local"`.
    pub fn from_env() -> Self {
        Self(std::env::var("SERVER_ID").unwrap_or_else(|_| "local".to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
