//! Function-management handlers: create, list, remove.

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use axum::extract::State;
use common::{
    http::{
        extract::{
            Json,
            Path,
        },
        HttpResponseError,
    },
    types::FunctionRecord,
};
use errors::ErrorMetadata;
use http::StatusCode;
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    ApiService,
    DEFAULT_MEMORY_MB,
    DEFAULT_TIMEOUT_SECS,
    VALID_RUNTIMES,
};

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct CreateFunctionRequest {
    pub function_name: String,
    pub handler: String,
    pub runtime: String,
    pub memory_size: Option<u32>,
    pub timeout: Option<u32>,
    pub code: FunctionCode,
    pub environment: Option<Environment>,
    #[serde(default)]
    pub layers: Vec<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct FunctionCode {
    /// Base64 of the archive bytes.
    pub zip_file: String,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "PascalCase")]
pub struct Environment {
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct FunctionView {
    pub function_name: String,
    pub function_arn: String,
    pub version: String,
    pub handler: String,
    pub memory_size: u32,
    pub timeout: u32,
    pub runtime: String,
    pub code_sha256: String,
    pub last_modified: String,
}

impl FunctionView {
    fn new(record: &FunctionRecord, arn: String) -> Self {
        Self {
            function_name: record.name.clone(),
            function_arn: arn,
            version: record.version.clone(),
            handler: record.handler.clone(),
            memory_size: record.memory_mb,
            timeout: record.timeout_secs,
            runtime: record.runtime.clone(),
            code_sha256: record.code_hash.as_base64(),
            last_modified: chrono::Utc::now().to_rfc3339(),
        }
    }
}
pub async fn create_function(
    State(st): State<Arc<ApiService>>,
    Json(req): Json<CreateFunctionRequest>,
) -> Result<Json<FunctionView>, HttpResponseError> {
    if req.function_name.is_empty() {
        return Err(ErrorMetadata::bad_request(
            "InvalidFunctionName",
            "Function name must not be empty",
        )
        .into());
    }
    if !VALID_RUNTIMES.contains(&req.runtime.as_str()) {
        return Err(ErrorMetadata::bad_request(
            "InvalidRuntime",
            format!(
                "{} is not a supported runtime (expected one of {})",
                req.runtime,
                VALID_RUNTIMES.join(", ")
            ),
        )
        .into());
    }
    let archive = base64::decode(&req.code.zip_file).map_err(|e| {
        anyhow::anyhow!(ErrorMetadata::bad_request(
            "InvalidZipFile",
            format!("Couldn't decode the function archive: {e}"),
        ))
    })?;

    let memory_mb = match req.memory_size {
        Some(memory) if memory >= DEFAULT_MEMORY_MB => memory,
        _ => DEFAULT_MEMORY_MB,
    };
    let timeout_secs = match req.timeout {
        Some(timeout) if timeout > 0 => timeout,
        _ => DEFAULT_TIMEOUT_SECS,
    };
    let record = FunctionRecord {
        name: req.function_name,
        version: "1".to_string(),
        handler: req.handler,
        memory_mb,
        timeout_secs,
        runtime: req.runtime,
        // Overwritten by install once the archive is stored.
        code_hash: common::sha256::Sha256Digest::hash(&archive),
        environment: req.environment.unwrap_or_default().variables,
        layers: req.layers,
    };

    let entry = st.install(record, bytes::Bytes::from(archive)).await?;
    let view = FunctionView::new(&entry.record, st.function_arn(&entry.record.name));
    Ok(Json(view))
}

pub async fn list_functions(
    State(st): State<Arc<ApiService>>,
) -> Result<Json<Vec<FunctionView>>, HttpResponseError> {
    let views = st
        .list()
        .into_iter()
        .map(|record| {
            let arn = st.function_arn(&record.name);
            FunctionView::new(&record, arn)
        })
        .collect();
    Ok(Json(views))
}

pub async fn delete_function(
    State(st): State<Arc<ApiService>>,
    Path(name): Path<String>,
) -> Result<StatusCode, HttpResponseError> {
    st.remove(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}
