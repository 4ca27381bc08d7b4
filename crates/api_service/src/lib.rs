//! The externally-visible API service: owns the function catalog, the code
//! store, and one runtime broker per installed function, and drives
//! placement through the local worker manager or the allocator.

use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    net::{
        Ipv4Addr,
        SocketAddr,
    },
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use allocator::Allocator;
use anyhow::Context as _;
use code_store::CodeStore;
use common::{
    http::HttpServer,
    sha256::Sha256Digest,
    shutdown::ShutdownSignal,
    types::FunctionRecord,
};
use errors::ErrorMetadata;
use parking_lot::RwLock;
use runtime_broker::{
    RuntimeBroker,
    RuntimeEndpoint,
};
use worker::{
    instance_key,
    ConfigureRequest,
    DockerLauncher,
    Launcher,
    WorkerConfig,
    WorkerFunctionConfig,
    WorkerManager,
};

pub mod functions;
pub mod invoke;
mod metrics;
pub mod router;
#[cfg(test)]
mod tests;

pub use functions::{
    CreateFunctionRequest,
    FunctionView,
};

/// Runtime tags installs may use; anything else is a validation error.
pub const VALID_RUNTIMES: &[&str] = &["python3.8", "python3.7", "nodejs12.x", "go1.x", "provided"];

pub const DEFAULT_MEMORY_MB: u32 = 128;
pub const DEFAULT_TIMEOUT_SECS: u32 = 3;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    /// Main listen address for the function-control surface.
    pub listen_addr: SocketAddr,
    /// Configure-RPC addresses of remote workers. Empty means single-host
    /// mode with an in-process worker manager.
    pub worker_addrs: Vec<String>,
    /// Host workers use to reach this process (code endpoint).
    pub advertise_host: String,
    /// Host containers use to reach runtime endpoints.
    pub runtime_host: String,
    /// Interface runtime endpoints bind on.
    pub runtime_interface: Ipv4Addr,
    /// Scratch directory for the in-process worker manager.
    pub scratch_dir: PathBuf,
    pub region: String,
    pub image_override: Option<String>,
    /// Per-function work queue capacity.
    pub queue_capacity: usize,
    /// Instance copies per installed function.
    pub instances_per_function: usize,
    /// Queueing slack added to the function timeout for the caller-facing
    /// deadline.
    pub invoke_slack: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".parse().expect("static addr parses"),
            worker_addrs: Vec::new(),
            advertise_host: "127.0.0.1".to_string(),
            runtime_host: "host.docker.internal".to_string(),
            runtime_interface: Ipv4Addr::UNSPECIFIED,
            scratch_dir: PathBuf::from("/tmp/srk/api-worker"),
            region: "us-west-2".to_string(),
            image_override: None,
            queue_capacity: runtime_broker::DEFAULT_QUEUE_CAPACITY,
            instances_per_function: 1,
            invoke_slack: Duration::from_secs(1),
        }
    }
}

/// One installed function: its record, its broker, and the key its
/// instances run under.
pub struct FunctionEntry {
    pub record: FunctionRecord,
    pub broker: Arc<RuntimeBroker>,
    pub key: Sha256Digest,
    pub runtime_addr: String,
    endpoint: parking_lot::Mutex<Option<RuntimeEndpoint>>,
}

impl FunctionEntry {
    fn take_endpoint(&self) -> Option<RuntimeEndpoint> {
        self.endpoint.lock().take()
    }
}

enum Placement {
    Local(Arc<WorkerManager>),
    Remote(Allocator),
}

impl Placement {
    async fn push(
        &self,
        code_endpoint: &str,
        catalog: &BTreeMap<Sha256Digest, WorkerFunctionConfig>,
    ) -> anyhow::Result<()> {
        match self {
            Placement::Local(manager) => {
                manager
                    .configure(ConfigureRequest {
                        code_endpoint: code_endpoint.to_string(),
                        functions: catalog.values().cloned().collect(),
                    })
                    .await
            },
            Placement::Remote(allocator) => allocator.push(code_endpoint, catalog).await,
        }
    }
}

pub struct ApiService {
    config: ApiConfig,
    pub code_store: Arc<CodeStore>,
    functions: RwLock<HashMap<String, Arc<FunctionEntry>>>,
    catalog: tokio::sync::Mutex<BTreeMap<Sha256Digest, WorkerFunctionConfig>>,
    placement: Placement,
    local_addr: RwLock<Option<SocketAddr>>,
    shutdown: ShutdownSignal,
}

impl ApiService {
    fn new(config: ApiConfig, launcher: Arc<dyn Launcher>) -> Arc<Self> {
        let placement = if config.worker_addrs.is_empty() {
            Placement::Local(WorkerManager::with_launcher(
                WorkerConfig {
                    scratch_dir: config.scratch_dir.clone(),
                    region: config.region.clone(),
                    image_override: config.image_override.clone(),
                },
                launcher,
            ))
        } else {
            Placement::Remote(Allocator::new(config.worker_addrs.clone()))
        };
        Arc::new(Self {
            config,
            code_store: Arc::new(CodeStore::new()),
            functions: RwLock::new(HashMap::new()),
            catalog: tokio::sync::Mutex::new(BTreeMap::new()),
            placement,
            local_addr: RwLock::new(None),
            shutdown: ShutdownSignal::new(),
        })
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_signalled()
    }

    pub fn function_arn(&self, name: &str) -> String {
        format!(
            "arn:aws:lambda:{}:000000000000:function:{name}",
            self.config.region
        )
    }

    fn code_endpoint(&self) -> String {
        let addr = self.local_addr.read().expect("server started before use");
        format!("http://{}:{}", self.config.advertise_host, addr.port())
    }

    pub fn lookup(&self, name: &str) -> anyhow::Result<Arc<FunctionEntry>> {
        self.functions.read().get(name).cloned().ok_or_else(|| {
            ErrorMetadata::not_found(
                "FunctionNotFound",
                format!("Function not found: {name}"),
            )
            .into()
        })
    }

    pub fn list(&self) -> Vec<FunctionRecord> {
        let mut records: Vec<FunctionRecord> = self
            .functions
            .read()
            .values()
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// The address instances of `name` poll for work. Exposed for
    /// diagnostics.
    pub fn runtime_addr(&self, name: &str) -> Option<String> {
        self.functions
            .read()
            .get(name)
            .map(|entry| entry.runtime_addr.clone())
    }

    /// Install a function: store its archive, start its runtime broker,
    /// and push the updated catalog to the worker set.
    pub async fn install(&self, record: FunctionRecord, archive: bytes::Bytes) -> anyhow::Result<Arc<FunctionEntry>> {
        if self.is_shutting_down() {
            anyhow::bail!(ErrorMetadata::shutdown(
                "Shutdown",
                "The service is draining and not accepting installs",
            ));
        }
        let mut record = record;
        let (code_hash, newly_stored) = self.code_store.save(archive);
        record.code_hash = code_hash;
        tracing::info!(
            "storing code for {} under {code_hash} (new: {newly_stored})",
            record.name
        );

        if self.functions.read().contains_key(&record.name) {
            anyhow::bail!(already_installed(&record.name));
        }

        let broker = RuntimeBroker::new(record.name.clone(), self.config.queue_capacity);
        let endpoint = RuntimeEndpoint::start(
            broker.clone(),
            SocketAddr::from((self.config.runtime_interface, 0)),
        )
        .await?;
        let runtime_addr = format!(
            "{}:{}",
            self.config.runtime_host,
            endpoint.local_addr().port()
        );
        let key = instance_key(&record, &runtime_addr);
        let entry = Arc::new(FunctionEntry {
            record: record.clone(),
            broker,
            key,
            runtime_addr: runtime_addr.clone(),
            endpoint: parking_lot::Mutex::new(Some(endpoint)),
        });

        let lost_install_race = {
            let mut functions = self.functions.write();
            if functions.contains_key(&record.name) {
                // Lost a race with a concurrent install of the same name.
                true
            } else {
                functions.insert(record.name.clone(), entry.clone());
                false
            }
        };
        if lost_install_race {
            if let Some(endpoint) = entry.take_endpoint() {
                endpoint.shutdown(already_installed(&record.name)).await;
            }
            anyhow::bail!(already_installed(&record.name));
        }

        let mut catalog = self.catalog.lock().await;
        catalog.insert(
            key,
            WorkerFunctionConfig {
                record,
                runtime_addr,
                desired_instances: self.config.instances_per_function,
            },
        );
        self.placement
            .push(&self.code_endpoint(), &catalog)
            .await
            .context(ErrorMetadata::internal(
                "ConfigurePushFailed",
                "Couldn't push the updated configuration to the worker set",
            ))?;
        metrics::log_function_installed();
        Ok(entry)
    }

    /// Remove a function: drop its instances everywhere, then tear down
    /// its broker. Outstanding invocations complete with a
    /// function-removed error.
    pub async fn remove(&self, name: &str) -> anyhow::Result<()> {
        let Some(entry) = self.functions.write().remove(name) else {
            anyhow::bail!(ErrorMetadata::not_found(
                "FunctionNotFound",
                format!("Function not found: {name}"),
            ));
        };

        let push_result = {
            let mut catalog = self.catalog.lock().await;
            catalog.remove(&entry.key);
            self.placement.push(&self.code_endpoint(), &catalog).await
        };

        if let Some(endpoint) = entry.take_endpoint() {
            endpoint
                .shutdown(ErrorMetadata::not_found(
                    "FunctionRemoved",
                    format!("Function {name} was removed"),
                ))
                .await;
        }
        metrics::log_function_removed();
        push_result.context(ErrorMetadata::internal(
            "ConfigurePushFailed",
            "Couldn't push the updated configuration to the worker set",
        ))
    }

    /// Fail every outstanding context with a shutdown error and stop all
    /// runtime endpoints and local instances.
    async fn drain(&self) {
        self.shutdown.signal();
        let entries: Vec<Arc<FunctionEntry>> = {
            let mut functions = self.functions.write();
            functions.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            if let Some(endpoint) = entry.take_endpoint() {
                endpoint
                    .shutdown(ErrorMetadata::shutdown(
                        "Shutdown",
                        "The service is shutting down",
                    ))
                    .await;
            }
        }
        self.catalog.lock().await.clear();
        if let Placement::Local(manager) = &self.placement {
            manager.shutdown().await;
        }
    }
}

fn already_installed(name: &str) -> ErrorMetadata {
    ErrorMetadata::bad_request(
        "FunctionAlreadyExists",
        format!("Function {name} is already installed"),
    )
}

/// The running API process: the service plus its bound listener.
pub struct ApiServer {
    service: Arc<ApiService>,
    server: HttpServer,
}

impl ApiServer {
    pub async fn start(config: ApiConfig) -> anyhow::Result<Self> {
        Self::start_with_launcher(config, Arc::new(DockerLauncher)).await
    }

    pub async fn start_with_launcher(
        config: ApiConfig,
        launcher: Arc<dyn Launcher>,
    ) -> anyhow::Result<Self> {
        let listen_addr = config.listen_addr;
        let service = ApiService::new(config, launcher);
        let server = HttpServer::bind("api", router::router(service.clone()), listen_addr).await?;
        *service.local_addr.write() = Some(server.local_addr());
        Ok(Self { service, server })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn service(&self) -> &Arc<ApiService> {
        &self.service
    }

    pub async fn shutdown(self) {
        tracing::info!("api service draining");
        self.service.drain().await;
        self.server.shutdown().await;
    }
}
