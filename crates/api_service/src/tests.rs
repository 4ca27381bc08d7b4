use std::{
    net::Ipv4Addr,
    sync::Arc,
    time::Duration,
};

use maplit::btreemap;
use serde_json::json;
use tokio::task::JoinHandle;
use worker::testing::{
    zip_archive,
    FakeLauncher,
};

use crate::{
    ApiConfig,
    ApiServer,
};

struct TestBackend {
    server: ApiServer,
    base: String,
    client: reqwest::Client,
    containers: Vec<JoinHandle<()>>,
    _scratch: tempfile::TempDir,
}

impl TestBackend {
    async fn setup() -> anyhow::Result<Self> {
        Self::setup_with(|_| {}).await
    }

    async fn setup_with(tweak: impl FnOnce(&mut ApiConfig)) -> anyhow::Result<Self> {
        cmd_util::env::config_test();
        let scratch = tempfile::tempdir()?;
        let mut config = ApiConfig {
            runtime_host: "127.0.0.1".to_string(),
            runtime_interface: Ipv4Addr::LOCALHOST,
            scratch_dir: scratch.path().to_path_buf(),
            invoke_slack: Duration::from_secs(1),
            ..ApiConfig::default()
        };
        tweak(&mut config);
        let server = ApiServer::start_with_launcher(config, Arc::new(FakeLauncher::new())).await?;
        let base = format!("http://{}", server.local_addr());
        Ok(Self {
            server,
            base,
            client: reqwest::Client::new(),
            containers: Vec::new(),
            _scratch: scratch,
        })
    }

    async fn install(&self, name: &str) -> anyhow::Result<reqwest::Response> {
        self.install_with_timeout(name, 3).await
    }

    async fn install_with_timeout(
        &self,
        name: &str,
        timeout: u32,
    ) -> anyhow::Result<reqwest::Response> {
        let archive = zip_archive(&[(
            "lambda_function.py",
            b"def lambda_handler(event, context): return event".as_slice(),
        )])?;
        let response = self
            .client
            .post(format!("{}/functions", self.base))
            .json(&json!({
                "FunctionName": name,
                "Handler": "lambda_function.lambda_handler",
                "Runtime": "python3.8",
                "Timeout": timeout,
                "Code": { "ZipFile": base64::encode(&archive) },
            }))
            .send()
            .await?;
        Ok(response)
    }

    async fn invoke(
        &self,
        name: &str,
        invocation_type: Option<&str>,
        body: Vec<u8>,
    ) -> anyhow::Result<reqwest::Response> {
        let mut request = self
            .client
            .post(format!("{}/functions/{name}/invocations", self.base))
            .body(body);
        if let Some(invocation_type) = invocation_type {
            request = request.header("X-Amz-Invocation-Type", invocation_type);
        }
        Ok(request.send().await?)
    }

    /// Run a loop that impersonates a container instance: poll the
    /// function's runtime endpoint and answer every event with
    /// `reply(event)`.
    fn spawn_container(&mut self, name: &str, reply: impl Fn(&[u8]) -> Vec<u8> + Send + 'static) {
        let runtime_addr = self
            .server
            .service()
            .runtime_addr(name)
            .expect("function installed");
        let handle = tokio::spawn(async move {
            let client = reqwest::Client::new();
            let base = format!("http://{runtime_addr}/2018-06-01");
            loop {
                let Ok(next) = client
                    .get(format!("{base}/runtime/invocation/next"))
                    .send()
                    .await
                else {
                    break;
                };
                if next.status().as_u16() != 200 {
                    break;
                }
                let request_id = next.headers()["Lambda-Runtime-Aws-Request-Id"]
                    .to_str()
                    .expect("ascii request id")
                    .to_string();
                let Ok(event) = next.bytes().await else { break };
                let _ = client
                    .post(format!("{base}/runtime/invocation/{request_id}/response"))
                    .body(reply(&event))
                    .send()
                    .await;
            }
        });
        self.containers.push(handle);
    }

    fn spawn_error_container(&mut self, name: &str) {
        let runtime_addr = self
            .server
            .service()
            .runtime_addr(name)
            .expect("function installed");
        let handle = tokio::spawn(async move {
            let client = reqwest::Client::new();
            let base = format!("http://{runtime_addr}/2018-06-01");
            loop {
                let Ok(next) = client
                    .get(format!("{base}/runtime/invocation/next"))
                    .send()
                    .await
                else {
                    break;
                };
                if next.status().as_u16() != 200 {
                    break;
                }
                let request_id = next.headers()["Lambda-Runtime-Aws-Request-Id"]
                    .to_str()
                    .expect("ascii request id")
                    .to_string();
                let _ = next.bytes().await;
                let _ = client
                    .post(format!("{base}/runtime/invocation/{request_id}/error"))
                    .json(&json!({
                        "errorType": "Exception",
                        "errorMessage": "something broke",
                        "stackTrace": ["line 1", "line 2"],
                    }))
                    .send()
                    .await;
            }
        });
        self.containers.push(handle);
    }

    async fn teardown(self) {
        for container in &self.containers {
            container.abort();
        }
        self.server.shutdown().await;
    }
}

#[tokio::test]
async fn test_dry_run_invocation() -> anyhow::Result<()> {
    let backend = TestBackend::setup().await?;
    assert_eq!(backend.install("echo").await?.status().as_u16(), 200);

    let response = backend.invoke("echo", Some("DryRun"), Vec::new()).await?;
    assert_eq!(response.status().as_u16(), 204);
    assert!(response.headers().contains_key("x-amzn-RequestId"));

    // Nothing was enqueued and nothing is in flight.
    let entry = backend.server.service().lookup("echo")?;
    assert_eq!(entry.broker.queued_len(), 0);
    assert_eq!(entry.broker.in_flight_len(), 0);

    backend.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_synchronous_echo() -> anyhow::Result<()> {
    let mut backend = TestBackend::setup().await?;
    let install = backend.install("echo").await?;
    assert_eq!(install.status().as_u16(), 200);
    let view: serde_json::Value = install.json().await?;
    assert_eq!(view["FunctionName"], "echo");
    assert_eq!(view["Version"], "1");

    backend.spawn_container("echo", |event| event.to_vec());

    let body = br#"{"message":"hello lambda!"}"#.to_vec();
    let response = backend.invoke("echo", None, body.clone()).await?;
    assert_eq!(response.status().as_u16(), 200);
    assert!(response.headers().contains_key("x-amzn-RequestId"));
    assert_eq!(
        response.headers()["X-Amz-Executed-Version"].to_str()?,
        "1"
    );
    assert_eq!(response.bytes().await?.as_ref(), body.as_slice());

    backend.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_two_function_isolation() -> anyhow::Result<()> {
    let mut backend = TestBackend::setup().await?;
    assert_eq!(backend.install("echo").await?.status().as_u16(), 200);
    assert_eq!(backend.install("hello").await?.status().as_u16(), 200);

    // Distinct brokers on distinct listeners.
    let service = backend.server.service();
    assert_ne!(
        service.runtime_addr("echo").unwrap(),
        service.runtime_addr("hello").unwrap()
    );

    backend.spawn_container("echo", |event| event.to_vec());
    backend.spawn_container("hello", |_| br#"{"message":"hello world!!!"}"#.to_vec());

    let response = backend.invoke("hello", None, b"{}".to_vec()).await?;
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response.bytes().await?.as_ref(),
        br#"{"message":"hello world!!!"}"#.as_slice()
    );

    let response = backend
        .invoke("echo", None, br#"{"message":"x"}"#.to_vec())
        .await?;
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.bytes().await?.as_ref(), br#"{"message":"x"}"#.as_slice());

    backend.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_event_invocation_completes_in_background() -> anyhow::Result<()> {
    let mut backend = TestBackend::setup().await?;
    assert_eq!(backend.install("echo").await?.status().as_u16(), 200);
    backend.spawn_container("echo", |event| event.to_vec());

    let response = backend
        .invoke("echo", Some("Event"), b"{\"n\":1}".to_vec())
        .await?;
    assert_eq!(response.status().as_u16(), 202);
    assert!(response.headers().contains_key("x-amzn-RequestId"));

    // The context still completes asynchronously.
    let entry = backend.server.service().lookup("echo")?;
    for _ in 0..200 {
        if entry.broker.queued_len() == 0 && entry.broker.in_flight_len() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(entry.broker.queued_len(), 0);
    assert_eq!(entry.broker.in_flight_len(), 0);

    backend.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_function_removal_drains_callers() -> anyhow::Result<()> {
    let backend = TestBackend::setup().await?;
    assert_eq!(backend.install("echo").await?.status().as_u16(), 200);
    let entry = backend.server.service().lookup("echo")?;

    // Three synchronous invokes queue up with no container to serve them.
    let mut invokes = Vec::new();
    for _ in 0..3 {
        let client = backend.client.clone();
        let url = format!("{}/functions/echo/invocations", backend.base);
        invokes.push(tokio::spawn(async move {
            client.post(url).body("{}").send().await
        }));
    }
    for _ in 0..200 {
        if entry.broker.queued_len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(entry.broker.queued_len(), 3);

    let response = backend
        .client
        .delete(format!("{}/functions/echo", backend.base))
        .send()
        .await?;
    assert_eq!(response.status().as_u16(), 204);

    for invoke in invokes {
        let response = invoke.await??;
        assert_eq!(response.status().as_u16(), 404);
        let body: serde_json::Value = response.json().await?;
        assert_eq!(body["code"], "FunctionRemoved");
    }
    assert_eq!(entry.broker.in_flight_len(), 0);
    assert_eq!(entry.broker.queued_len(), 0);

    backend.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_unknown_function_is_404() -> anyhow::Result<()> {
    let backend = TestBackend::setup().await?;
    let response = backend.invoke("missing", None, b"{}".to_vec()).await?;
    assert_eq!(response.status().as_u16(), 404);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["code"], "FunctionNotFound");
    backend.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_duplicate_install_keeps_one_of_everything() -> anyhow::Result<()> {
    let backend = TestBackend::setup().await?;
    assert_eq!(backend.install("echo").await?.status().as_u16(), 200);
    let response = backend.install("echo").await?;
    assert_eq!(response.status().as_u16(), 400);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["code"], "FunctionAlreadyExists");

    // One record, one blob, one broker.
    let service = backend.server.service();
    assert_eq!(service.list().len(), 1);
    assert_eq!(service.code_store.len(), 1);

    backend.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_invalid_runtime_rejected() -> anyhow::Result<()> {
    let backend = TestBackend::setup().await?;
    let response = backend
        .client
        .post(format!("{}/functions", backend.base))
        .json(&json!({
            "FunctionName": "echo",
            "Handler": "h",
            "Runtime": "fortran77",
            "Code": { "ZipFile": base64::encode(b"zip") },
        }))
        .send()
        .await?;
    assert_eq!(response.status().as_u16(), 400);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["code"], "InvalidRuntime");
    backend.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_memory_and_timeout_defaults() -> anyhow::Result<()> {
    let backend = TestBackend::setup().await?;
    let archive = zip_archive(&[("f.py", b"pass".as_slice())])?;
    let response = backend
        .client
        .post(format!("{}/functions", backend.base))
        .json(&json!({
            "FunctionName": "tiny",
            "Handler": "f.handler",
            "Runtime": "python3.8",
            "MemorySize": 64,
            "Code": { "ZipFile": base64::encode(&archive) },
        }))
        .send()
        .await?;
    assert_eq!(response.status().as_u16(), 200);
    let view: serde_json::Value = response.json().await?;
    assert_eq!(view["MemorySize"], 128);
    assert_eq!(view["Timeout"], 3);
    backend.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_sync_timeout_reports_unhandled() -> anyhow::Result<()> {
    let backend = TestBackend::setup().await?;
    assert_eq!(
        backend
            .install_with_timeout("sleepy", 1)
            .await?
            .status()
            .as_u16(),
        200
    );

    // No container ever polls; the caller-facing deadline fires.
    let response = backend
        .client
        .post(format!("{}/functions/sleepy/invocations", backend.base))
        .header("X-Amz-Log-Type", "Tail")
        .body("{}")
        .send()
        .await?;
    assert_eq!(response.status().as_u16(), 504);
    assert_eq!(
        response.headers()["X-Amz-Function-Error"].to_str()?,
        "Unhandled"
    );
    assert_eq!(
        response.headers()["X-Amz-Log-Result"].to_str()?,
        base64::encode("(timeout)")
    );
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["errorType"], "Function.Timeout");

    backend.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_function_error_marker() -> anyhow::Result<()> {
    let mut backend = TestBackend::setup().await?;
    assert_eq!(backend.install("broken").await?.status().as_u16(), 200);
    backend.spawn_error_container("broken");

    let response = backend.invoke("broken", None, b"{}".to_vec()).await?;
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response.headers()["X-Amz-Function-Error"].to_str()?,
        "Unhandled"
    );
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["errorMessage"], "something broke");
    assert_eq!(body["errorType"], "Exception");

    backend.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_queue_backpressure() -> anyhow::Result<()> {
    let backend = TestBackend::setup_with(|config| config.queue_capacity = 1).await?;
    assert_eq!(
        backend
            .install_with_timeout("echo", 1)
            .await?
            .status()
            .as_u16(),
        200
    );

    let client = backend.client.clone();
    let url = format!("{}/functions/echo/invocations", backend.base);
    let first = tokio::spawn(async move { client.post(url).body("{}").send().await });

    let entry = backend.server.service().lookup("echo")?;
    for _ in 0..200 {
        if entry.broker.queued_len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let response = backend.invoke("echo", None, b"{}".to_vec()).await?;
    assert_eq!(response.status().as_u16(), 429);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["code"], "TooBusy");

    // The queued caller eventually times out rather than hanging.
    let response = first.await??;
    assert_eq!(response.status().as_u16(), 504);

    backend.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_cors_preflight() -> anyhow::Result<()> {
    let backend = TestBackend::setup().await?;

    let response = backend
        .client
        .request(
            reqwest::Method::OPTIONS,
            format!("{}/functions/echo/invocations", backend.base),
        )
        .header("Origin", "http://example.com")
        .header("Access-Control-Request-Method", "POST")
        .send()
        .await?;
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response.headers()["access-control-allow-origin"].to_str()?,
        "*"
    );
    assert_eq!(
        response.headers()["access-control-allow-methods"].to_str()?,
        "POST"
    );
    assert_eq!(
        response.headers()["access-control-max-age"].to_str()?,
        "172800"
    );
    assert!(response.headers()["access-control-expose-headers"]
        .to_str()?
        .contains("x-amz-function-error"));

    // No Origin header: refused.
    let response = backend
        .client
        .request(
            reqwest::Method::OPTIONS,
            format!("{}/functions", backend.base),
        )
        .send()
        .await?;
    assert_eq!(response.status().as_u16(), 403);

    // Preflights work on arbitrary paths too.
    let response = backend
        .client
        .request(
            reqwest::Method::OPTIONS,
            format!("{}/anything/else", backend.base),
        )
        .header("Origin", "http://example.com")
        .send()
        .await?;
    assert_eq!(response.status().as_u16(), 200);

    backend.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_list_functions() -> anyhow::Result<()> {
    let backend = TestBackend::setup().await?;
    assert_eq!(backend.install("echo").await?.status().as_u16(), 200);
    assert_eq!(backend.install("hello").await?.status().as_u16(), 200);

    let response = backend
        .client
        .get(format!("{}/functions", backend.base))
        .send()
        .await?;
    assert_eq!(response.status().as_u16(), 200);
    let views: Vec<serde_json::Value> = response.json().await?;
    assert_eq!(views.len(), 2);
    assert_eq!(views[0]["FunctionName"], "echo");
    assert_eq!(views[1]["FunctionName"], "hello");

    backend.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_environment_flows_to_instances() -> anyhow::Result<()> {
    let backend = TestBackend::setup().await?;
    let archive = zip_archive(&[("f.py", b"pass".as_slice())])?;
    let response = backend
        .client
        .post(format!("{}/functions", backend.base))
        .json(&json!({
            "FunctionName": "configured",
            "Handler": "f.handler",
            "Runtime": "python3.8",
            "Code": { "ZipFile": base64::encode(&archive) },
            "Environment": { "Variables": { "GREETING": "hi" } },
        }))
        .send()
        .await?;
    assert_eq!(response.status().as_u16(), 200);

    let entry = backend.server.service().lookup("configured")?;
    assert_eq!(
        entry.record.environment,
        btreemap! { "GREETING".to_string() => "hi".to_string() }
    );

    backend.teardown().await;
    Ok(())
}
