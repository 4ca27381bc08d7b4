//! Content-addressed in-memory storage for uploaded function archives.
//! Blobs are keyed by the SHA-256 of their bytes and served to workers over
//! the code endpoint.

use std::{
    collections::HashMap,
    sync::Arc,
    time::SystemTime,
};

use axum::{
    extract::State,
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::Bytes;
use common::{
    http::{
        extract::Path,
        HttpResponseError,
        APPLICATION_ZIP_CONTENT_TYPE,
    },
    sha256::Sha256Digest,
};
use errors::ErrorMetadata;
use http::header::CONTENT_TYPE;
use parking_lot::RwLock;

mod metrics;

#[derive(Clone)]
pub struct CodeBlob {
    pub bytes: Bytes,
    pub inserted_at: SystemTime,
}

/// Many-reader / single-writer blob map. The digest is computed and the
/// bytes frozen before the write lock is taken, so readers observe either
/// absence or the fully-published blob.
pub struct CodeStore {
    blobs: RwLock<HashMap<Sha256Digest, CodeBlob>>,
}

impl CodeStore {
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
        }
    }

    /// Insert the archive if absent and return its digest. Idempotent:
    /// re-saving identical bytes yields the same digest, keeps the original
    /// blob, and reports `false` for the inserted flag.
    pub fn save(&self, bytes: Bytes) -> (Sha256Digest, bool) {
        let digest = Sha256Digest::hash(&bytes);
        let blob = CodeBlob {
            bytes,
            inserted_at: SystemTime::now(),
        };
        let mut blobs = self.blobs.write();
        if blobs.contains_key(&digest) {
            return (digest, false);
        }
        tracing::debug!("storing {} byte archive under {digest}", blob.bytes.len());
        metrics::log_code_blob_saved(blob.bytes.len());
        blobs.insert(digest, blob);
        (digest, true)
    }

    /// Constant-time lookup. The returned `Bytes` is a cheap refcounted
    /// clone of the stored buffer.
    pub fn retrieve(&self, digest: &Sha256Digest) -> Option<Bytes> {
        self.blobs.read().get(digest).map(|blob| blob.bytes.clone())
    }

    pub fn contains(&self, digest: &Sha256Digest) -> bool {
        self.blobs.read().contains_key(digest)
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

/// Worker-facing router serving raw archive bytes: `GET /code/{hash}`.
pub fn code_router(store: Arc<CodeStore>) -> Router {
    Router::new()
        .route("/code/{hash}", get(get_code))
        .with_state(store)
}

async fn get_code(
    State(store): State<Arc<CodeStore>>,
    Path(hash): Path<String>,
) -> Result<impl IntoResponse, HttpResponseError> {
    let digest: Sha256Digest = hash.parse().map_err(|_| {
        anyhow::anyhow!(ErrorMetadata::bad_request(
            "InvalidCodeHash",
            format!("{hash} is not a valid SHA-256 hex digest"),
        ))
    })?;
    let Some(bytes) = store.retrieve(&digest) else {
        return Err(ErrorMetadata::not_found(
            "CodeNotFound",
            format!("No code archive stored under {digest}"),
        )
        .into());
    };
    metrics::log_code_blob_served();
    Ok(([(CONTENT_TYPE, APPLICATION_ZIP_CONTENT_TYPE)], bytes))
}

#[cfg(test)]
mod tests {
    use common::http::HttpServer;
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_save_is_idempotent() {
        let store = CodeStore::new();
        let bytes = Bytes::from_static(b"PK\x03\x04fake archive");
        let (digest, inserted) = store.save(bytes.clone());
        assert!(inserted);
        let (digest2, inserted2) = store.save(bytes.clone());
        assert_eq!(digest, digest2);
        assert!(!inserted2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.retrieve(&digest), Some(bytes));
    }

    #[test]
    fn test_retrieve_missing() {
        let store = CodeStore::new();
        let digest = Sha256Digest::hash(b"never stored");
        assert_eq!(store.retrieve(&digest), None);
        assert!(!store.contains(&digest));
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, failure_persistence: None, ..ProptestConfig::default() })]

        #[test]
        fn proptest_retrieve_returns_saved_bytes(payload in prop::collection::vec(any::<u8>(), 0..4096)) {
            let store = CodeStore::new();
            let bytes = Bytes::from(payload);
            let (digest, _) = store.save(bytes.clone());
            prop_assert_eq!(digest, Sha256Digest::hash(&bytes));
            prop_assert_eq!(store.retrieve(&digest), Some(bytes));
        }
    }

    #[tokio::test]
    async fn test_code_endpoint_round_trip() -> anyhow::Result<()> {
        let store = Arc::new(CodeStore::new());
        let (digest, _) = store.save(Bytes::from_static(b"archive bytes"));
        let server = HttpServer::bind("code", code_router(store), "127.0.0.1:0".parse()?).await?;
        let base = format!("http://{}", server.local_addr());

        let resp = reqwest::get(format!("{base}/code/{digest}")).await?;
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(
            resp.headers()[CONTENT_TYPE].to_str()?,
            "application/zip"
        );
        assert_eq!(resp.bytes().await?.as_ref(), b"archive bytes".as_slice());

        let missing = Sha256Digest::hash(b"missing");
        let resp = reqwest::get(format!("{base}/code/{missing}")).await?;
        assert_eq!(resp.status().as_u16(), 404);

        server.shutdown().await;
        Ok(())
    }
}
