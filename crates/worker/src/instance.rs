//! Container instance supervision. Each instance is one process (normally
//! `docker run`) polling its function's runtime address; a supervision task
//! owns the process handle and records its exit.

use std::{
    path::PathBuf,
    process::Stdio,
    sync::Arc,
};

use anyhow::Context as _;
use async_trait::async_trait;
use common::types::FunctionRecord;
use tokio::{
    io::AsyncWriteExt as _,
    process::{
        Child,
        Command,
    },
    sync::{
        oneshot,
        watch,
    },
    task::JoinHandle,
};

use crate::metrics;

/// Everything needed to launch one instance of a function.
#[derive(Clone, Debug)]
pub struct InstanceSpec {
    pub record: FunctionRecord,
    pub runtime_addr: String,
    pub code_path: PathBuf,
    pub region: String,
    pub image: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceState {
    Starting,
    Ready,
    Terminating,
    Dead,
}

/// A launched instance process. `start_kill` begins termination; `wait`
/// observes the exit and is safe to call again after a cancelled wait.
#[async_trait]
pub trait InstanceProc: Send {
    fn start_kill(&mut self) -> anyhow::Result<()>;
    async fn wait(&mut self) -> anyhow::Result<Option<i32>>;
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, spec: &InstanceSpec) -> anyhow::Result<Box<dyn InstanceProc>>;
}

/// Shell fragment fed to the container's entrypoint; finds the runtime
/// bootstrap in its well-known locations and execs it.
const BOOTSTRAP_LAUNCH_SCRIPT: &str = r#"#!/bin/bash

set -e

for loc in "/var/runtime/bootstrap" "/var/task/bootstrap" "/opt/bootstrap"; do
    if [ -f $loc ]; then
        BOOTSTRAP="$loc"
        break
    fi
done

if [ -z "$BOOTSTRAP" ]; then
    echo "bootstrap not found"
    exit 1
fi

$BOOTSTRAP"#;

/// Launches instances as docker containers with the extracted code mounted
/// at /var/task.
pub struct DockerLauncher;

#[async_trait]
impl Launcher for DockerLauncher {
    async fn launch(&self, spec: &InstanceSpec) -> anyhow::Result<Box<dyn InstanceProc>> {
        let record = &spec.record;
        let mut cmd = Command::new("docker");
        cmd.arg("run")
            .arg("-i")
            .arg("--rm")
            .arg("--entrypoint")
            .arg("/bin/bash")
            .arg("-v")
            .arg(format!("{}:/var/task", spec.code_path.display()));
        let mut env = vec![
            ("_HANDLER".to_string(), record.handler.clone()),
            ("AWS_LAMBDA_FUNCTION_NAME".to_string(), record.name.clone()),
            (
                "AWS_LAMBDA_FUNCTION_VERSION".to_string(),
                record.version.clone(),
            ),
            (
                "AWS_LAMBDA_FUNCTION_MEMORY_SIZE".to_string(),
                record.memory_mb.to_string(),
            ),
            (
                "AWS_LAMBDA_LOG_GROUP_NAME".to_string(),
                format!("/aws/lambda/{}", record.name),
            ),
            (
                "AWS_LAMBDA_LOG_STREAM_NAME".to_string(),
                log_stream_name(&record.version),
            ),
            ("AWS_REGION".to_string(), spec.region.clone()),
            ("AWS_DEFAULT_REGION".to_string(), spec.region.clone()),
            (
                "AWS_LAMBDA_RUNTIME_API".to_string(),
                spec.runtime_addr.clone(),
            ),
        ];
        for (k, v) in &record.environment {
            env.push((k.clone(), v.clone()));
        }
        for (k, v) in env {
            cmd.arg("--env").arg(format!("{k}={v}"));
        }
        cmd.arg(&spec.image)
            .stdin(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(
            "launching instance of {} from {}",
            record.name,
            spec.image
        );
        let mut child = cmd.spawn().context("couldn't spawn docker")?;
        let mut stdin = child.stdin.take().context("docker stdin not piped")?;
        stdin
            .write_all(BOOTSTRAP_LAUNCH_SCRIPT.as_bytes())
            .await
            .context("couldn't write bootstrap script")?;
        drop(stdin);
        Ok(Box::new(DockerProc { child }))
    }
}

struct DockerProc {
    child: Child,
}

#[async_trait]
impl InstanceProc for DockerProc {
    fn start_kill(&mut self) -> anyhow::Result<()> {
        self.child.start_kill().context("couldn't kill container")
    }

    async fn wait(&mut self) -> anyhow::Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }
}

/// `YYYY/MM/DD/[<version>]<random hex>`, matching the log-stream naming the
/// managed platform uses.
pub fn log_stream_name(version: &str) -> String {
    let unique: [u8; 16] = rand::random();
    format!(
        "{}/[{version}]{}",
        chrono::Utc::now().format("%Y/%m/%d"),
        hex::encode(unique)
    )
}

/// One running instance under supervision. Stop is two-phase: signal the
/// kill, then join the supervision task, which itself waits for the
/// process to exit.
pub struct InstanceRunner {
    state_rx: watch::Receiver<InstanceState>,
    kill_tx: Option<oneshot::Sender<()>>,
    supervise: JoinHandle<()>,
}

impl InstanceRunner {
    pub async fn start(launcher: &Arc<dyn Launcher>, spec: InstanceSpec) -> anyhow::Result<Self> {
        let (state_tx, state_rx) = watch::channel(InstanceState::Starting);
        let mut proc = launcher.launch(&spec).await.with_context(|| {
            format!("failed to launch an instance of {}", spec.record.name)
        })?;
        let _ = state_tx.send(InstanceState::Ready);
        let (kill_tx, kill_rx) = oneshot::channel();
        let name = spec.record.name.clone();
        let supervise = tokio::spawn(async move {
            tokio::select! {
                status = proc.wait() => {
                    // Unexpected exit. A restart policy would hook in here.
                    metrics::log_instance_exited();
                    match status {
                        Ok(code) => tracing::warn!(
                            "instance of {name} exited unexpectedly with code {code:?}"
                        ),
                        Err(e) => tracing::error!("waiting on an instance of {name}: {e:#}"),
                    }
                    let _ = state_tx.send(InstanceState::Dead);
                },
                _ = kill_rx => {
                    let _ = state_tx.send(InstanceState::Terminating);
                    if let Err(e) = proc.start_kill() {
                        tracing::error!("killing an instance of {name}: {e:#}");
                    }
                    match proc.wait().await {
                        Ok(code) => tracing::info!("instance of {name} stopped with code {code:?}"),
                        Err(e) => tracing::error!("waiting on an instance of {name}: {e:#}"),
                    }
                    let _ = state_tx.send(InstanceState::Dead);
                },
            }
        });
        Ok(Self {
            state_rx,
            kill_tx: Some(kill_tx),
            supervise,
        })
    }

    pub fn state(&self) -> InstanceState {
        *self.state_rx.borrow()
    }

    /// Kill the instance and block until its process has exited.
    pub async fn stop(mut self) {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        if let Err(e) = self.supervise.await {
            if !e.is_cancelled() {
                tracing::error!("instance supervision task panicked: {e}");
            }
        }
    }
}
