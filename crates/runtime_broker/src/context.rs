use std::time::{
    Duration,
    SystemTime,
    UNIX_EPOCH,
};

use anyhow::Context as _;
use bytes::Bytes;
use common::RequestId;
use errors::ErrorMetadata;
use serde::{
    Deserialize,
    Serialize,
};
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum InvocationType {
    /// Caller blocks until the function responds.
    #[default]
    RequestResponse,
    /// Fire-and-forget; the caller gets the request id back immediately.
    Event,
    /// Validate the invoke path without enqueueing any work.
    DryRun,
}

impl InvocationType {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "RequestResponse" => Ok(Self::RequestResponse),
            "Event" => Ok(Self::Event),
            "DryRun" => Ok(Self::DryRun),
            _ => Err(ErrorMetadata::bad_request(
                "InvalidInvocationType",
                format!("{s} is not one of DryRun, Event, RequestResponse"),
            )
            .into()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestResponse => "RequestResponse",
            Self::Event => "Event",
            Self::DryRun => "DryRun",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LogType {
    #[default]
    None,
    Tail,
}

impl LogType {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "None" => Ok(Self::None),
            "Tail" => Ok(Self::Tail),
            _ => Err(ErrorMetadata::bad_request(
                "InvalidLogType",
                format!("{s} is not one of None, Tail"),
            )
            .into()),
        }
    }

    pub fn is_tail(&self) -> bool {
        *self == Self::Tail
    }
}

/// Per-invocation state carrier. Created on every external invoke and
/// referenced from exactly one broker (work queue or in-flight table) while
/// live.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub payload: Bytes,
    pub invocation_type: InvocationType,
    pub client_context: Option<String>,
    pub cognito_identity: Option<String>,
    pub log_type: LogType,
    pub invoked_arn: String,
    pub trace_id: String,
    started: Instant,
    started_wall: SystemTime,
    timeout: Duration,
}

impl RequestContext {
    pub fn new(
        payload: Bytes,
        invocation_type: InvocationType,
        client_context: Option<String>,
        log_type: LogType,
        invoked_arn: String,
        trace_id: String,
        timeout: Duration,
    ) -> Self {
        Self {
            request_id: RequestId::new(),
            payload,
            invocation_type,
            client_context,
            cognito_identity: None,
            log_type,
            invoked_arn,
            trace_id,
            started: Instant::now(),
            started_wall: SystemTime::now(),
            timeout,
        }
    }

    /// Absolute deadline on the monotonic clock; authoritative for timeout
    /// enforcement.
    pub fn deadline(&self) -> Instant {
        self.started + self.timeout
    }

    /// The deadline as milliseconds since the unix epoch, as published to
    /// containers in the `Lambda-Runtime-Deadline-Ms` header.
    pub fn deadline_unix_ms(&self) -> anyhow::Result<u64> {
        let deadline = self.started_wall + self.timeout;
        let since_epoch = deadline
            .duration_since(UNIX_EPOCH)
            .context("deadline predates the epoch")?;
        Ok(since_epoch.as_millis() as u64)
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline()
    }
}

/// Error envelope a container posts to the error endpoint, plus the
/// handled/unhandled marker carried in the `Lambda-Runtime-Function-Error-Type`
/// header.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    pub error_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<Vec<String>>,
    #[serde(skip)]
    pub kind: FunctionErrorKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FunctionErrorKind {
    #[default]
    Unhandled,
    Handled,
}

impl FunctionErrorKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "Handled" => Self::Handled,
            _ => Self::Unhandled,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unhandled => "Unhandled",
            Self::Handled => "Handled",
        }
    }
}

/// What a completed invocation left in its reply slot. Exactly one of
/// payload or error, with an optional base64 log tail captured from the
/// posting container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvokeReply {
    Payload {
        bytes: Bytes,
        log_tail: Option<String>,
    },
    FunctionError {
        error: FunctionError,
        log_tail: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_type_parsing() {
        assert_eq!(
            InvocationType::parse("RequestResponse").unwrap(),
            InvocationType::RequestResponse
        );
        assert_eq!(
            InvocationType::parse("Event").unwrap(),
            InvocationType::Event
        );
        assert_eq!(
            InvocationType::parse("DryRun").unwrap(),
            InvocationType::DryRun
        );
        assert!(InvocationType::parse("Sometimes").is_err());
    }

    #[test]
    fn test_error_envelope_wire_shape() -> anyhow::Result<()> {
        let error: FunctionError = serde_json::from_str(
            r#"{"errorType":"Error","errorMessage":"boom","stackTrace":["at main"]}"#,
        )?;
        assert_eq!(error.error_type.as_deref(), Some("Error"));
        assert_eq!(error.error_message, "boom");
        assert_eq!(error.kind, FunctionErrorKind::Unhandled);
        Ok(())
    }

    #[tokio::test]
    async fn test_deadline_ms_is_in_the_future() -> anyhow::Result<()> {
        let ctx = RequestContext::new(
            Bytes::new(),
            InvocationType::RequestResponse,
            None,
            LogType::None,
            "arn:aws:lambda:us-west-2:000000000000:function:echo".to_string(),
            common::types::new_trace_id(),
            Duration::from_secs(3),
        );
        let now_ms = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as u64;
        assert!(ctx.deadline_unix_ms()? >= now_ms);
        Ok(())
    }
}
