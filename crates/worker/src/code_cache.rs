//! On-disk cache of extracted code archives, one subdirectory per code
//! hash under the worker's scratch directory. Archives are fetched from
//! the code endpoint on first use, digest-verified, and extracted on a
//! blocking thread; the directory is renamed into place only once fully
//! written.

use std::path::{
    Path,
    PathBuf,
};

use anyhow::Context as _;
use bytes::Bytes;
use common::sha256::Sha256Digest;
use errors::ErrorMetadata;
use http::StatusCode;

use crate::metrics;

pub struct CodeCache {
    scratch_dir: PathBuf,
    client: reqwest::Client,
}

impl CodeCache {
    pub fn new(scratch_dir: PathBuf) -> Self {
        Self {
            scratch_dir,
            client: reqwest::Client::new(),
        }
    }

    /// Path of the extracted archive for `digest`, fetching and extracting
    /// it first if this is the first function to need it.
    pub async fn ensure(
        &self,
        code_endpoint: &str,
        digest: Sha256Digest,
    ) -> anyhow::Result<PathBuf> {
        let path = self.scratch_dir.join(digest.as_hex());
        if tokio::fs::try_exists(&path).await? {
            return Ok(path);
        }
        let bytes = self.fetch(code_endpoint, digest).await?;
        metrics::log_code_fetched(bytes.len());

        let partial = self.scratch_dir.join(format!("{}.partial", digest.as_hex()));
        if tokio::fs::try_exists(&partial).await? {
            tokio::fs::remove_dir_all(&partial).await?;
        }
        extract_archive(bytes, partial.clone()).await?;
        tokio::fs::rename(&partial, &path).await?;
        tracing::info!("extracted code archive {digest} to {}", path.display());
        Ok(path)
    }

    async fn fetch(&self, code_endpoint: &str, digest: Sha256Digest) -> anyhow::Result<Bytes> {
        let url = format!("{code_endpoint}/code/{digest}");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("couldn't reach the code endpoint at {url}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            // A live configuration referencing a missing blob is an
            // inconsistency, not a caller mistake.
            anyhow::bail!(ErrorMetadata::internal(
                "CodeMissing",
                format!("The code endpoint has no archive for {digest}"),
            ));
        }
        let bytes = response
            .error_for_status()
            .with_context(|| format!("code endpoint rejected {url}"))?
            .bytes()
            .await?;
        let actual = Sha256Digest::hash(&bytes);
        if actual != digest {
            anyhow::bail!(ErrorMetadata::internal(
                "CodeDigestMismatch",
                format!("Archive fetched for {digest} hashed to {actual}"),
            ));
        }
        Ok(bytes)
    }
}

async fn extract_archive(bytes: Bytes, dest: PathBuf) -> anyhow::Result<()> {
    tokio::task::spawn_blocking(move || extract_archive_blocking(&bytes, &dest))
        .await
        .context("archive extraction task panicked")?
}

fn extract_archive_blocking(bytes: &[u8], dest: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dest)?;
    let mut archive =
        zip::ZipArchive::new(std::io::Cursor::new(bytes)).context("unreadable code archive")?;
    // extract() rejects entries that would escape the destination.
    archive
        .extract(dest)
        .with_context(|| format!("extracting code archive to {}", dest.display()))?;
    Ok(())
}
