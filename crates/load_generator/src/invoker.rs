use std::time::Duration;

use async_trait::async_trait;
use errors::ErrorMetadata;
use serde_json::{
    Map,
    Value,
};

/// Keys the driver injects into every invocation's argument object; the
/// user-supplied template may not define them.
const RESERVED_ARGS: &[&str] = &["uuid", "experiment", "tracking_url", "budget_ms"];

/// How the control loop launches one invocation. `budget` is the time the
/// owning span has left; the invoked function sees it as `budget_ms`.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, uuid: &str, budget: Duration) -> anyhow::Result<()>;
}

/// Posts Event-type invocations to the function service.
#[derive(Debug)]
pub struct HttpInvoker {
    client: reqwest::Client,
    invoke_url: String,
    scan_id: String,
    tracking_url: String,
    template: Map<String, Value>,
}

impl HttpInvoker {
    pub fn new(
        api_base: &str,
        function: &str,
        scan_id: String,
        tracking_url: String,
        template: Map<String, Value>,
    ) -> anyhow::Result<Self> {
        for key in RESERVED_ARGS {
            if template.contains_key(*key) {
                anyhow::bail!(ErrorMetadata::bad_request(
                    "ArgumentConflict",
                    format!("Argument template may not define the reserved key {key}"),
                ));
            }
        }
        Ok(Self {
            client: reqwest::Client::new(),
            invoke_url: format!("{api_base}/functions/{function}/invocations"),
            scan_id,
            tracking_url,
            template,
        })
    }
}

#[async_trait]
impl Invoker for HttpInvoker {
    async fn invoke(&self, uuid: &str, budget: Duration) -> anyhow::Result<()> {
        let mut args = self.template.clone();
        args.insert("uuid".to_string(), Value::from(uuid));
        args.insert("experiment".to_string(), Value::from(self.scan_id.as_str()));
        args.insert(
            "tracking_url".to_string(),
            Value::from(self.tracking_url.as_str()),
        );
        args.insert(
            "budget_ms".to_string(),
            Value::from(budget.as_millis() as u64),
        );
        let response = self
            .client
            .post(&self.invoke_url)
            .header("X-Amz-Invocation-Type", "Event")
            .json(&Value::Object(args))
            .send()
            .await?;
        let status = response.status();
        anyhow::ensure!(
            status.as_u16() == 202,
            "event invocation of {uuid} returned {status}"
        );
        Ok(())
    }
}
