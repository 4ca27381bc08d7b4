use axum::{
    extract::{
        FromRequest,
        FromRequestParts,
        Request,
    },
    response::{
        IntoResponse,
        Response,
    },
};
use errors::ErrorMetadata;
use http::request::Parts;
use serde::{
    de::DeserializeOwned,
    Serialize,
};

use crate::http::HttpResponseError;

/// Wrapper around axum::extract::Path that rejects with the JSON error
/// envelope instead of axum's plain-text default.
pub struct Path<T>(pub T);

impl<S, T> FromRequestParts<S> for Path<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = HttpResponseError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let t = axum::extract::Path::<T>::from_request_parts(parts, state)
            .await
            .map_err(|e| {
                anyhow::anyhow!(ErrorMetadata::bad_request("BadPathArgs", e.to_string()))
            })?;
        Ok(Self(t.0))
    }
}

/// Wrapper around axum::extract::Query with the same rejection treatment.
pub struct Query<T>(pub T);

impl<S, T> FromRequestParts<S> for Query<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = HttpResponseError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let t = axum::extract::Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|e| {
                anyhow::anyhow!(ErrorMetadata::bad_request("BadQueryArgs", e.to_string()))
            })?;
        Ok(Self(t.0))
    }
}

/// Wrapper around axum::Json with the same rejection treatment.
pub struct Json<T>(pub T);

impl<S, T> FromRequest<S> for Json<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = HttpResponseError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let t = axum::Json::<T>::from_request(req, state).await.map_err(|e| {
            anyhow::anyhow!(ErrorMetadata::bad_request("BadJsonBody", e.body_text()))
        })?;
        Ok(Self(t.0))
    }
}

impl<T> IntoResponse for Json<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        axum::Json(self.0).into_response()
    }
}
