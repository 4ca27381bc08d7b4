use std::{
    collections::BTreeMap,
    fmt,
    time::Duration,
};

use serde::{
    Deserialize,
    Serialize,
};

use crate::sha256::Sha256Digest;

/// Opaque id assigned to every external invocation. Globally unique for the
/// life of the process; echoed back to callers in the request-id header and
/// used to key the per-function in-flight tables.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self.0)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Fresh X-Ray-shaped trace id for an invocation, e.g.
/// `Root=1-5f84c7a1-bcf6f8b35fd08e7d52e41c6f;Sampled=0`.
pub fn new_trace_id() -> String {
    let epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    let unique: [u8; 12] = rand::random();
    format!("Root=1-{epoch:08x}-{};Sampled=0", hex::encode(unique))
}

/// The catalog entry for one installed function. Created by install,
/// destroyed by remove; the name is the external identity key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRecord {
    pub name: String,
    pub version: String,
    pub handler: String,
    pub memory_mb: u32,
    pub timeout_secs: u32,
    pub runtime: String,
    pub code_hash: Sha256Digest,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub layers: Vec<String>,
}

impl FunctionRecord {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout_secs))
    }
}
