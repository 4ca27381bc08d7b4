//! The per-host worker manager: takes pushed configurations and reconciles
//! them into running container instances, fetching code archives on demand.

use std::{
    collections::{
        HashMap,
        HashSet,
    },
    path::PathBuf,
    sync::Arc,
};

use anyhow::Context as _;
use common::sha256::Sha256Digest;
use tokio::sync::Mutex;

mod code_cache;
pub mod config;
mod instance;
mod metrics;
pub mod server;

pub use code_cache::CodeCache;
pub use config::{
    instance_key,
    ConfigureRequest,
    ConfigureResponse,
    WorkerFunctionConfig,
};
pub use instance::{
    DockerLauncher,
    InstanceProc,
    InstanceRunner,
    InstanceSpec,
    InstanceState,
    Launcher,
};
pub use server::WorkerService;

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Scratch directory holding one extracted archive per code hash.
    pub scratch_dir: PathBuf,
    pub region: String,
    /// Overrides the `lambci/lambda:<runtime>` image derivation when set.
    pub image_override: Option<String>,
}

struct FunctionInstances {
    config: WorkerFunctionConfig,
    code_path: PathBuf,
    runners: Vec<InstanceRunner>,
}

#[derive(Default)]
struct WorkerState {
    functions: HashMap<Sha256Digest, FunctionInstances>,
}

pub struct WorkerManager {
    config: WorkerConfig,
    launcher: Arc<dyn Launcher>,
    code: CodeCache,
    state: Mutex<WorkerState>,
}

impl WorkerManager {
    pub fn new(config: WorkerConfig) -> Arc<Self> {
        Self::with_launcher(config, Arc::new(DockerLauncher))
    }

    pub fn with_launcher(config: WorkerConfig, launcher: Arc<dyn Launcher>) -> Arc<Self> {
        let code = CodeCache::new(config.scratch_dir.clone());
        Arc::new(Self {
            config,
            launcher,
            code,
            state: Mutex::new(WorkerState::default()),
        })
    }

    /// Reconcile local state to the pushed plan. The configuration lock is
    /// held for the entire update; pushes serialize.
    pub async fn configure(&self, request: ConfigureRequest) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.config.scratch_dir)
            .await
            .with_context(|| {
                format!(
                    "couldn't create scratch dir {}",
                    self.config.scratch_dir.display()
                )
            })?;
        let mut state = self.state.lock().await;
        let mut desired_keys = HashSet::new();
        for function in &request.functions {
            let key = function.instance_key();
            desired_keys.insert(key);
            self.reconcile_function(&mut state, &request.code_endpoint, key, function)
                .await?;
        }

        // Keys present locally but absent from the plan are torn down.
        let stale: Vec<Sha256Digest> = state
            .functions
            .keys()
            .filter(|key| !desired_keys.contains(*key))
            .copied()
            .collect();
        for key in stale {
            let function = state.functions.remove(&key).expect("key listed above");
            tracing::info!(
                "tearing down {} instances of {} (dropped from plan)",
                function.runners.len(),
                function.config.record.name
            );
            stop_all(function.runners).await;
        }
        Ok(())
    }

    async fn reconcile_function(
        &self,
        state: &mut WorkerState,
        code_endpoint: &str,
        key: Sha256Digest,
        function: &WorkerFunctionConfig,
    ) -> anyhow::Result<()> {
        if function.desired_instances == 0 {
            if let Some(existing) = state.functions.remove(&key) {
                stop_all(existing.runners).await;
            }
            return Ok(());
        }
        if !state.functions.contains_key(&key) {
            let code_path = self
                .code
                .ensure(code_endpoint, function.record.code_hash)
                .await?;
            state.functions.insert(
                key,
                FunctionInstances {
                    config: function.clone(),
                    code_path,
                    runners: Vec::new(),
                },
            );
        }
        let entry = state.functions.get_mut(&key).expect("inserted above");
        entry.config = function.clone();
        entry
            .runners
            .retain(|runner| runner.state() != InstanceState::Dead);

        while entry.runners.len() < function.desired_instances {
            let spec = InstanceSpec {
                record: function.record.clone(),
                runtime_addr: function.runtime_addr.clone(),
                code_path: entry.code_path.clone(),
                region: self.config.region.clone(),
                image: self.image_for(&function.record.runtime),
            };
            let runner = InstanceRunner::start(&self.launcher, spec).await?;
            metrics::log_instance_started();
            entry.runners.push(runner);
        }
        if entry.runners.len() > function.desired_instances {
            let surplus = entry.runners.split_off(function.desired_instances);
            tracing::info!(
                "stopping {} surplus instances of {}",
                surplus.len(),
                function.record.name
            );
            stop_all(surplus).await;
        }
        Ok(())
    }

    /// Stop every instance in parallel and wait for all containers to exit.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        let functions = std::mem::take(&mut state.functions);
        let runners: Vec<InstanceRunner> = functions
            .into_values()
            .flat_map(|function| function.runners)
            .collect();
        tracing::info!("stopping {} instances", runners.len());
        stop_all(runners).await;
    }

    pub async fn instance_count(&self, key: &Sha256Digest) -> usize {
        let state = self.state.lock().await;
        state
            .functions
            .get(key)
            .map(|function| function.runners.len())
            .unwrap_or(0)
    }

    pub async fn total_instances(&self) -> usize {
        let state = self.state.lock().await;
        state
            .functions
            .values()
            .map(|function| function.runners.len())
            .sum()
    }

    fn image_for(&self, runtime: &str) -> String {
        self.config
            .image_override
            .clone()
            .unwrap_or_else(|| format!("lambci/lambda:{runtime}"))
    }
}

async fn stop_all(runners: Vec<InstanceRunner>) {
    let count = runners.len();
    futures::future::join_all(runners.into_iter().map(InstanceRunner::stop)).await;
    metrics::log_instances_stopped(count);
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use std::io::Write as _;

    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use tokio::sync::Notify;

    use crate::instance::{
        InstanceProc,
        InstanceSpec,
        Launcher,
    };

    /// Records launch specs and hands out processes that live until
    /// killed, so reconcile logic is testable without docker.
    pub struct FakeLauncher {
        pub launched: Mutex<Vec<InstanceSpec>>,
    }

    impl FakeLauncher {
        pub fn new() -> Self {
            Self {
                launched: Mutex::new(Vec::new()),
            }
        }

        pub fn launch_count(&self) -> usize {
            self.launched.lock().len()
        }
    }

    #[async_trait]
    impl Launcher for FakeLauncher {
        async fn launch(&self, spec: &InstanceSpec) -> anyhow::Result<Box<dyn InstanceProc>> {
            self.launched.lock().push(spec.clone());
            Ok(Box::new(FakeProc {
                killed: Notify::new(),
            }))
        }
    }

    struct FakeProc {
        killed: Notify,
    }

    #[async_trait]
    impl InstanceProc for FakeProc {
        fn start_kill(&mut self) -> anyhow::Result<()> {
            // Stores a permit if the waiter was cancelled, so a later
            // wait() still observes the kill.
            self.killed.notify_one();
            Ok(())
        }

        async fn wait(&mut self) -> anyhow::Result<Option<i32>> {
            self.killed.notified().await;
            Ok(Some(0))
        }
    }

    /// Build an in-memory zip archive from (name, contents) pairs.
    pub fn zip_archive(files: &[(&str, &[u8])]) -> anyhow::Result<Bytes> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            for (name, contents) in files {
                writer.start_file(*name, zip::write::SimpleFileOptions::default())?;
                writer.write_all(contents)?;
            }
            writer.finish()?;
        }
        Ok(Bytes::from(cursor.into_inner()))
    }
}
