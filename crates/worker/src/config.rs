use common::{
    sha256::Sha256Digest,
    types::FunctionRecord,
};
use serde::{
    Deserialize,
    Serialize,
};
use sha2::Digest as _;

/// One entry of a pushed configuration: run `desired_instances` copies of
/// the function, polling the given runtime address for work.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerFunctionConfig {
    pub record: FunctionRecord,
    pub runtime_addr: String,
    pub desired_instances: usize,
}

impl WorkerFunctionConfig {
    pub fn instance_key(&self) -> Sha256Digest {
        instance_key(&self.record, &self.runtime_addr)
    }
}

/// Stable digest of the fields that define a running configuration's
/// identity. Equal keys mean the same configuration: instances are reused
/// in place across pushes rather than restarted. The layer list is part of
/// the key, so installs differing only by layers never share instances.
pub fn instance_key(record: &FunctionRecord, runtime_addr: &str) -> Sha256Digest {
    let mut hasher = Sha256Digest::hasher();
    hasher.update(runtime_addr.as_bytes());
    hasher.update(record.name.as_bytes());
    hasher.update(record.version.as_bytes());
    hasher.update(record.handler.as_bytes());
    hasher.update(record.memory_mb.to_string().as_bytes());
    for layer in &record.layers {
        hasher.update(layer.as_bytes());
    }
    Sha256Digest::from_hasher(hasher)
}

/// The configure RPC payload. Each push fully replaces the worker's prior
/// desired state; nothing is buffered.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigureRequest {
    /// Base URL of the code endpoint archives are fetched from, e.g.
    /// `http://10.0.0.1:9000`.
    pub code_endpoint: String,
    pub functions: Vec<WorkerFunctionConfig>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConfigureResponse {}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> FunctionRecord {
        FunctionRecord {
            name: name.to_string(),
            version: "1".to_string(),
            handler: "lambda_function.lambda_handler".to_string(),
            memory_mb: 128,
            timeout_secs: 3,
            runtime: "python3.8".to_string(),
            code_hash: Sha256Digest::hash(b"zip"),
            environment: Default::default(),
            layers: vec![],
        }
    }

    #[test]
    fn test_key_is_stable() {
        let r = record("echo");
        assert_eq!(
            instance_key(&r, "127.0.0.1:9001"),
            instance_key(&r, "127.0.0.1:9001")
        );
    }

    #[test]
    fn test_key_varies_with_identity_fields() {
        let r = record("echo");
        let base = instance_key(&r, "127.0.0.1:9001");
        assert_ne!(base, instance_key(&r, "127.0.0.1:9002"));
        assert_ne!(base, instance_key(&record("hello"), "127.0.0.1:9001"));

        let mut bigger = record("echo");
        bigger.memory_mb = 256;
        assert_ne!(base, instance_key(&bigger, "127.0.0.1:9001"));

        let mut layered = record("echo");
        layered.layers = vec!["arn:aws:lambda:us-west-2:000000000000:layer:numpy:1".to_string()];
        assert_ne!(base, instance_key(&layered, "127.0.0.1:9001"));
    }

    #[test]
    fn test_key_ignores_code_hash() {
        // Code updates under the same identity reuse running instances.
        let a = record("echo");
        let mut b = record("echo");
        b.code_hash = Sha256Digest::hash(b"other zip");
        assert_eq!(
            instance_key(&a, "127.0.0.1:9001"),
            instance_key(&b, "127.0.0.1:9001")
        );
    }
}
