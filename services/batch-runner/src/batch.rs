//! Batch input, per-item processing, and output
//!
//! Input is JSONL, one `{"id", "prompt"}` object per line. Each item runs
//! through the retrying invoker against the shared credential pool; results
//! are collected by input index so the output keeps input order no matter
//! which item finishes first.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use common::Secret;
use completion::{ChatClient, CredentialRotator, RotationReason};
use dispatch::{RetryOutcome, RetryingInvoker};
use key_pool::CredentialPool;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{BatchError, CallError, Result};

/// One line of batch input.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BatchItem {
    pub id: String,
    pub prompt: String,
}

/// Final status of a batch item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Ok,
    /// Completion stayed blank through every retry
    Empty,
    Error,
    /// Not attempted because a stop was requested
    Skipped,
}

impl ItemStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ItemStatus::Ok => "ok",
            ItemStatus::Empty => "empty",
            ItemStatus::Error => "error",
            ItemStatus::Skipped => "skipped",
        }
    }
}

/// One line of batch output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemResult {
    pub id: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ItemResult {
    fn with_text(id: String, status: ItemStatus, text: String) -> Self {
        Self {
            id,
            status,
            text: Some(text),
            error: None,
        }
    }

    fn failed(id: String, error: String) -> Self {
        Self {
            id,
            status: ItemStatus::Error,
            text: None,
            error: Some(error),
        }
    }

    fn skipped(id: String) -> Self {
        Self {
            id,
            status: ItemStatus::Skipped,
            text: None,
            error: None,
        }
    }
}

/// Parse JSONL batch input. Blank lines are ignored; line numbers in errors
/// are 1-based.
pub fn parse_items(contents: &str) -> Result<Vec<BatchItem>> {
    let mut items = Vec::new();
    let mut ids = HashSet::new();

    for (index, raw) in contents.lines().enumerate() {
        let line = index + 1;
        if raw.trim().is_empty() {
            continue;
        }
        let item: BatchItem = serde_json::from_str(raw).map_err(|e| BatchError::InvalidItem {
            line,
            reason: e.to_string(),
        })?;
        if item.id.trim().is_empty() {
            return Err(BatchError::InvalidItem {
                line,
                reason: "id must not be empty".into(),
            });
        }
        if !ids.insert(item.id.clone()) {
            return Err(BatchError::DuplicateId { line, id: item.id });
        }
        items.push(item);
    }

    Ok(items)
}

/// Render results as JSONL, one object per line.
pub fn render_results(results: &[ItemResult]) -> serde_json::Result<String> {
    let mut out = String::new();
    for result in results {
        out.push_str(&serde_json::to_string(result)?);
        out.push('\n');
    }
    Ok(out)
}

/// Live per-status counters, shared with the status endpoint.
#[derive(Debug)]
pub struct RunProgress {
    pub total: u64,
    pub ok: AtomicU64,
    pub empty: AtomicU64,
    pub error: AtomicU64,
    pub skipped: AtomicU64,
    pub started_at: Instant,
}

impl RunProgress {
    pub fn new(total: usize) -> Self {
        Self {
            total: total as u64,
            ok: AtomicU64::new(0),
            empty: AtomicU64::new(0),
            error: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    fn record(&self, status: ItemStatus) {
        let counter = match status {
            ItemStatus::Ok => &self.ok,
            ItemStatus::Empty => &self.empty,
            ItemStatus::Error => &self.error,
            ItemStatus::Skipped => &self.skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finished(&self) -> u64 {
        self.ok.load(Ordering::Relaxed)
            + self.empty.load(Ordering::Relaxed)
            + self.error.load(Ordering::Relaxed)
            + self.skipped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let total = self.total;
        serde_json::json!({
            "total": total,
            "ok": self.ok.load(Ordering::Relaxed),
            "empty": self.empty.load(Ordering::Relaxed),
            "error": self.error.load(Ordering::Relaxed),
            "skipped": self.skipped.load(Ordering::Relaxed),
            "pending": total.saturating_sub(self.finished()),
            "elapsed_seconds": self.started_at.elapsed().as_secs(),
        })
    }
}

/// Rotator scoped to one batch item.
///
/// Remembers the credential this item last used, so a rate limit condemns
/// that credential even when another item has already moved the pool on.
struct ItemRotator {
    pool: Arc<CredentialPool>,
    last_key: Mutex<Option<Secret<String>>>,
}

impl ItemRotator {
    fn new(pool: Arc<CredentialPool>) -> Self {
        Self {
            pool,
            last_key: Mutex::new(None),
        }
    }

    async fn remember(&self, key: &Secret<String>) {
        *self.last_key.lock().await = Some(key.clone());
    }
}

impl CredentialRotator for ItemRotator {
    fn rotate(&self, reason: RotationReason) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            match reason {
                RotationReason::RateLimited => {
                    let used = self.last_key.lock().await.clone();
                    match used {
                        Some(key) => self.pool.mark_failed(key.expose()).await,
                        None => self.pool.mark_current_failed().await,
                    }
                }
                RotationReason::EmptyResult => self.pool.rotate_to_next().await,
            }
        })
    }
}

/// Everything one batch item needs, shared by all in-flight items.
pub struct BatchContext {
    pool: Arc<CredentialPool>,
    client: ChatClient,
    invoker: RetryingInvoker,
    stop: Arc<AtomicBool>,
    progress: Arc<RunProgress>,
    ids: Vec<String>,
    results: Mutex<Vec<Option<ItemResult>>>,
}

impl BatchContext {
    pub fn new(
        pool: Arc<CredentialPool>,
        client: ChatClient,
        invoker: RetryingInvoker,
        stop: Arc<AtomicBool>,
        progress: Arc<RunProgress>,
        items: &[BatchItem],
    ) -> Self {
        Self {
            pool,
            client,
            invoker,
            stop,
            progress,
            ids: items.iter().map(|item| item.id.clone()).collect(),
            results: Mutex::new(vec![None; items.len()]),
        }
    }

    /// Process the item at `index` and record its result.
    ///
    /// Returns the final error for failed items so the work pool counts them;
    /// the failure is already recorded in the results either way.
    pub async fn process(&self, index: usize, item: BatchItem) -> std::result::Result<(), CallError> {
        if self.stop.load(Ordering::Relaxed) {
            debug!(item = %item.id, "stop requested, skipping item");
            self.record(index, ItemResult::skipped(item.id)).await;
            return Ok(());
        }

        let rotator = Arc::new(ItemRotator::new(self.pool.clone()));
        let invoker = self.invoker.clone().with_rotator(rotator.clone());
        let outcome = invoker.invoke(|| self.call(&rotator, &item.prompt)).await;
        match outcome {
            RetryOutcome::Success(text) => {
                self.record(index, ItemResult::with_text(item.id, ItemStatus::Ok, text))
                    .await;
                Ok(())
            }
            RetryOutcome::ToleratedEmpty(text) => {
                warn!(item = %item.id, "completion stayed empty, recording as empty");
                self.record(index, ItemResult::with_text(item.id, ItemStatus::Empty, text))
                    .await;
                Ok(())
            }
            RetryOutcome::Failure(err) => {
                self.record(index, ItemResult::failed(item.id, err.to_string()))
                    .await;
                Err(err)
            }
        }
    }

    /// One attempt: take the pool's current credential and call the endpoint.
    async fn call(
        &self,
        rotator: &ItemRotator,
        prompt: &str,
    ) -> std::result::Result<String, CallError> {
        let credential = self.pool.get_current().await?;
        rotator.remember(&credential.key).await;
        Ok(self.client.complete(&credential.key, prompt).await?)
    }

    async fn record(&self, index: usize, result: ItemResult) {
        self.progress.record(result.status);
        crate::metrics::record_item(result.status.label());
        let mut results = self.results.lock().await;
        if let Some(slot) = results.get_mut(index) {
            *slot = Some(result);
        }
    }

    /// Results in input order. An item that never recorded a result (its
    /// processing panicked) is reported as an error.
    pub fn into_results(self) -> Vec<ItemResult> {
        let results = self.results.into_inner();
        results
            .into_iter()
            .zip(self.ids)
            .map(|(result, id)| {
                result.unwrap_or_else(|| {
                    ItemResult::failed(id, "item did not complete".into())
                })
            })
            .collect()
    }
}
