use std::time::Duration;

use anyhow::{Context, Result};

use crate::capabilities::BlobStore;
use crate::document::Document;

/// `get` with exponential backoff: `base`, `2 * base`, `4 * base`, ...
pub async fn fetch_with_retry(store: &dyn BlobStore, url: &str, attempts: u32, base: Duration) -> Result<Vec<u8>> {
    let attempts = attempts.max(1);
    let mut last_error = None;

    for attempt in 0..attempts {
        match store.get(url).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) => {
                log::warn!("Blob fetch attempt {}/{} failed: {:#}", attempt + 1, attempts, e);
                last_error = Some(e);
                if attempt + 1 < attempts {
                    tokio::time::sleep(base.saturating_mul(1u32 << attempt.min(16))).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no fetch attempts made")))
        .with_context(|| format!("Blob {} unavailable after {} attempts", url, attempts))
}

/// Push a large upload through the blob store and process the fetched copy.
/// Any failure along the way falls back to the in-memory original.
pub async fn offload_round_trip(
    store: &dyn BlobStore,
    doc: Document,
    inline_limit: usize,
    attempts: u32,
    backoff_base: Duration,
) -> Document {
    if doc.len() <= inline_limit {
        return doc;
    }

    let url = match store.put(doc.bytes()).await {
        Ok(url) => url,
        Err(e) => {
            log::warn!("Blob upload failed, processing in memory: {:#}", e);
            return doc;
        }
    };
    log::info!("Offloaded {} bytes to blob storage", doc.len());

    let fetched = fetch_with_retry(store, &url, attempts, backoff_base).await;

    match store.delete(&url).await {
        Ok(true) => log::debug!("Deleted blob {}", url),
        Ok(false) => log::debug!("Blob {} was already gone", url),
        Err(e) => log::warn!("Failed to delete blob {}: {:#}", url, e),
    }

    match fetched {
        Ok(bytes) if bytes.len() == doc.len() => Document::new(bytes, doc.filename()),
        Ok(bytes) => {
            log::warn!("Blob size mismatch ({} vs {} bytes), using in-memory copy", bytes.len(), doc.len());
            doc
        }
        Err(e) => {
            log::warn!("{:#}; using in-memory copy", e);
            doc
        }
    }
}
