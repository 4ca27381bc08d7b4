use std::borrow::Cow;

use http::StatusCode;
use serde::Serialize;

/// ErrorMetadata can be attached to an anyhow error chain via
/// `.context(e /*ErrorMetadata*/)`. It is the single error-kind sum type
/// used at component boundaries to classify failures.
///
/// The msg is conveyed as a caller-facing error message if it makes it to
/// the edge of the process.
///
/// The short_msg is used as a tag - available for tests and for metrics
/// logging - that is resilient to changes in copy. HTTP responses send it
/// as a separate field of the error envelope.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    /// The error code associated with this ErrorMetadata
    pub code: ErrorCode,
    /// Short ScreamingCamelCase tag, e.g. InvalidRuntime. Usable in tests
    /// for string matching.
    pub short_msg: Cow<'static, str>,
    /// Human readable, developer facing. Should be longer and descriptive.
    pub msg: Cow<'static, str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed request bodies, unknown runtime tags, unknown function
    /// names. Maps to 400.
    BadRequest,
    /// A named resource (function, code blob, request id) does not exist.
    /// Maps to 404.
    NotFound,
    /// Queue full or too-many-requests from a downstream; retryable by the
    /// caller. Maps to 429.
    Overloaded,
    /// A deadline elapsed before the other side responded. Maps to 504.
    Deadline,
    /// The process is draining; new work is refused and outstanding work is
    /// failed. Maps to 503.
    Shutdown,
    /// Inconsistent internal state, failed launches, failed pushes. Maps to
    /// 500.
    Internal,
}

impl ErrorMetadata {
    /// Bad request. The short_msg should be a ScreamingCamelCase tag
    /// describing the error; the msg a descriptive message for the caller.
    pub fn bad_request(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::BadRequest,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Resource not found (e.g. FunctionNotFound, CodeNotFound).
    pub fn not_found(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::NotFound,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// A bounded resource is at capacity. Retryable.
    pub fn overloaded(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Overloaded,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// A deadline fired before the work completed.
    pub fn deadline(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Deadline,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// The owning process is shutting down.
    pub fn shutdown(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Shutdown,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Internal error that is not the caller's fault.
    pub fn internal(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Internal,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn is_bad_request(&self) -> bool {
        self.code == ErrorCode::BadRequest
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }

    pub fn is_overloaded(&self) -> bool {
        self.code == ErrorCode::Overloaded
    }

    pub fn is_deadline(&self) -> bool {
        self.code == ErrorCode::Deadline
    }

    pub fn is_shutdown(&self) -> bool {
        self.code == ErrorCode::Shutdown
    }

    pub fn http_status_code(&self) -> StatusCode {
        match self.code {
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Overloaded => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::Deadline => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// The JSON body sent for errors that reach an HTTP boundary.
#[derive(Serialize, Debug)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
}

impl ErrorEnvelope {
    pub fn from_metadata(em: &ErrorMetadata) -> Self {
        Self {
            code: em.short_msg.to_string(),
            message: em.msg.to_string(),
        }
    }
}

const INTERNAL_SHORT_MSG: &str = "InternalServerError";
const INTERNAL_MSG: &str = "Your request couldn't be completed. Try again later.";

/// Accessors for the ErrorMetadata attached to an anyhow chain, with
/// untagged errors classified as internal.
pub trait ErrorMetadataAnyhowExt {
    fn metadata(&self) -> Option<&ErrorMetadata>;
    fn is_bad_request(&self) -> bool;
    fn is_not_found(&self) -> bool;
    fn is_overloaded(&self) -> bool;
    fn is_deadline(&self) -> bool;
    fn is_shutdown(&self) -> bool;
    fn short_msg(&self) -> &str;
    fn user_facing_message(&self) -> String;
    fn http_status(&self) -> StatusCode;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn metadata(&self) -> Option<&ErrorMetadata> {
        self.downcast_ref::<ErrorMetadata>()
    }

    fn is_bad_request(&self) -> bool {
        self.metadata().is_some_and(ErrorMetadata::is_bad_request)
    }

    fn is_not_found(&self) -> bool {
        self.metadata().is_some_and(ErrorMetadata::is_not_found)
    }

    fn is_overloaded(&self) -> bool {
        self.metadata().is_some_and(ErrorMetadata::is_overloaded)
    }

    fn is_deadline(&self) -> bool {
        self.metadata().is_some_and(ErrorMetadata::is_deadline)
    }

    fn is_shutdown(&self) -> bool {
        self.metadata().is_some_and(ErrorMetadata::is_shutdown)
    }

    fn short_msg(&self) -> &str {
        self.metadata()
            .map(|e| e.short_msg.as_ref())
            .unwrap_or(INTERNAL_SHORT_MSG)
    }

    fn user_facing_message(&self) -> String {
        self.metadata()
            .map(|e| e.msg.to_string())
            .unwrap_or_else(|| INTERNAL_MSG.to_string())
    }

    fn http_status(&self) -> StatusCode {
        self.metadata()
            .map(ErrorMetadata::http_status_code)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

/// Log an error at the severity its classification deserves. Server-side
/// faults get the full chain; caller faults only show up at debug.
pub fn report_error(e: &anyhow::Error) {
    if e.http_status().is_server_error() {
        tracing::error!("{e:#}");
    } else {
        tracing::debug!("{e:#}");
    }
}
