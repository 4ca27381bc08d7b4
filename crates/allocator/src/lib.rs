//! Deterministic, balanced placement of function instances across the
//! worker pool, plus the configuration pushes that make the plan real.
//!
//! Placement is stable under catalog growth: each instance key hashes to a
//! fixed starting worker, and its desired count is dealt round-robin from
//! there. Adding a function never moves another function's instances.

use std::collections::BTreeMap;

use anyhow::Context as _;
use common::sha256::Sha256Digest;
use errors::ErrorMetadata;
use worker::{
    ConfigureRequest,
    WorkerFunctionConfig,
};

/// Per-worker subsets of the catalog; index parallels the worker list.
pub type AllocationPlan = Vec<Vec<WorkerFunctionConfig>>;

/// Deal each key's desired instances round-robin across `num_workers`,
/// starting at `prefix_u64(key) % num_workers`. Per-worker counts for one
/// key differ by at most one.
pub fn compute_plan(
    catalog: &BTreeMap<Sha256Digest, WorkerFunctionConfig>,
    num_workers: usize,
) -> anyhow::Result<AllocationPlan> {
    if num_workers == 0 {
        anyhow::bail!(ErrorMetadata::internal(
            "NoWorkers",
            "Can't compute an allocation plan for zero workers",
        ));
    }
    let mut plan: AllocationPlan = vec![Vec::new(); num_workers];
    for (key, function) in catalog {
        let start = (key.prefix_u64() % num_workers as u64) as usize;
        let mut counts = vec![0usize; num_workers];
        for i in 0..function.desired_instances {
            counts[(start + i) % num_workers] += 1;
        }
        for (index, count) in counts.into_iter().enumerate() {
            if count > 0 {
                plan[index].push(WorkerFunctionConfig {
                    record: function.record.clone(),
                    runtime_addr: function.runtime_addr.clone(),
                    desired_instances: count,
                });
            }
        }
    }
    Ok(plan)
}

pub struct Allocator {
    workers: Vec<String>,
    client: reqwest::Client,
}

impl Allocator {
    /// `workers` are `host:port` configure-RPC addresses.
    pub fn new(workers: Vec<String>) -> Self {
        Self {
            workers,
            client: reqwest::Client::new(),
        }
    }

    pub fn workers(&self) -> &[String] {
        &self.workers
    }

    /// Recompute the plan from scratch and push every worker its subset.
    /// The first failed push surfaces to the caller; earlier pushes are
    /// not rolled back - the next push corrects state.
    pub async fn push(
        &self,
        code_endpoint: &str,
        catalog: &BTreeMap<Sha256Digest, WorkerFunctionConfig>,
    ) -> anyhow::Result<()> {
        tracing::info!("allocator push starting");
        let plan = compute_plan(catalog, self.workers.len())?;
        for (worker, functions) in self.workers.iter().zip(plan) {
            tracing::info!("configuring {} functions on {worker}", functions.len());
            let request = ConfigureRequest {
                code_endpoint: code_endpoint.to_string(),
                functions,
            };
            self.client
                .post(format!("http://{worker}/configure"))
                .json(&request)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .with_context(|| format!("failed to update worker {worker}"))?;
        }
        tracing::info!("allocator push finished");
        Ok(())
    }
}
